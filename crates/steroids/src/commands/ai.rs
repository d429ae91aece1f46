//! `steroids ai` - inspect provider adapters.

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde_json::json;
use steroids_core::provider::ProviderRegistry;
use steroids_core::types::Role;

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    // Provider inspection works without a project store.
    let registry = ProviderRegistry::with_builtins("claude");

    match matches.subcommand() {
        Some(("providers", _)) => {
            let names = registry.names();
            if json {
                output::emit(true, "", &json!(names));
            } else {
                for name in names {
                    println!("{name}");
                }
            }
            Ok(())
        }
        Some(("models", sub)) => {
            let name = sub
                .get_one::<String>("provider")
                .map_or("claude", String::as_str);
            let provider = registry.get(name)?;
            let models = provider.list_models().await?;
            if json {
                output::emit(true, "", &json!({ "provider": name, "models": models }));
            } else {
                println!("{name} (default coder model: {})", provider.default_model(Role::Coder));
                for model in models {
                    println!("  {model}");
                }
            }
            Ok(())
        }
        Some(("test", _)) => {
            let mut rows = Vec::new();
            for name in registry.names() {
                let provider = registry.get(&name)?;
                let available = provider.is_available().await;
                if !json {
                    println!(
                        "{name}: {}",
                        if available { "available" } else { "not installed" }
                    );
                }
                rows.push(json!({ "provider": name, "available": available }));
            }
            if json {
                output::emit(true, "", &json!(rows));
            }
            Ok(())
        }
        _ => Err(anyhow!("unknown ai subcommand")),
    }
}
