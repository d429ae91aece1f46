//! Provider adapters: a uniform invocation interface over heterogeneous
//! LLM back ends.

mod activity;
mod classify;
mod cli;
mod types;

pub use activity::{ActivityEvent, ActivityLog};
pub use classify::ErrorClassifier;
pub use cli::{builtin_specs, CliProvider, CliProviderSpec, ModelStyle, PromptStyle,
    STRIPPED_ENV_VARS};
pub use types::{
    ErrorKind, InvokeOptions, InvokeResult, PauseAlert, PauseResolution, ProviderError,
    TokenUsage, DEFAULT_TIMEOUT_SECS,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::Role;
use crate::{Error, Result};

/// Uniform interface over LLM back ends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Run one invocation.
    async fn invoke(&self, prompt: &str, options: &InvokeOptions) -> Result<InvokeResult>;

    /// Resume a provider session with a follow-up prompt.
    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<InvokeResult>;

    /// Models this provider can serve.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Default model for a role.
    fn default_model(&self, role: Role) -> &str;

    /// Classify a failure from exit code and stderr.
    fn classify_error(&self, exit_code: i32, stderr: &str) -> ProviderError;

    /// Classify a finished result; `None` when it succeeded.
    fn classify_result(&self, result: &InvokeResult) -> Option<ProviderError>;

    /// Whether the provider's CLI is installed and runnable.
    async fn is_available(&self) -> bool;
}

/// Explicit registry of providers, created once at startup and passed
/// through the call graph.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_name: String,
}

impl ProviderRegistry {
    /// Empty registry with a default provider name.
    #[must_use]
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_name: default_name.into(),
        }
    }

    /// Registry preloaded with every built-in CLI adapter.
    #[must_use]
    pub fn with_builtins(default_name: impl Into<String>) -> Self {
        let mut registry = Self::new(default_name);
        for spec in builtin_specs() {
            registry.register(Arc::new(CliProvider::new(spec, ErrorClassifier::new())));
        }
        registry
    }

    /// Register (or replace) a provider.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("unknown provider: {name}")))
    }

    /// The configured default provider.
    pub fn default_provider(&self) -> Result<Arc<dyn Provider>> {
        self.get(&self.default_name)
    }

    /// Every registered provider name, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() -> Result<()> {
        let registry = ProviderRegistry::with_builtins("claude");
        assert!(registry.names().contains(&"claude".to_string()));
        assert!(registry.names().contains(&"ollama".to_string()));
        let provider = registry.default_provider()?;
        assert_eq!(provider.name(), "claude");
        assert!(registry.get("nope").is_err());
        Ok(())
    }

    #[test]
    fn test_role_defaults_resolve() -> Result<()> {
        let registry = ProviderRegistry::with_builtins("claude");
        let provider = registry.get("claude")?;
        assert!(!provider.default_model(Role::Coder).is_empty());
        assert!(!provider.default_model(Role::Orchestrator).is_empty());
        Ok(())
    }
}
