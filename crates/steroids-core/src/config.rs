//! Engine configuration.
//!
//! Loaded in layers: built-in defaults, then `~/.steroids/config.toml`,
//! then `<project>/.steroids/config.toml`, then environment variables.
//! Later layers override earlier ones; merges return new instances.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::GlobalPaths;
use crate::{Error, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root directory for workspace clones. Empty means the default under
    /// the global state directory.
    pub workspace_root: String,
    /// Maximum concurrent workstream clones per session.
    pub max_clones: usize,
    /// Command run inside each fresh clone (dependency install).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydration_command: Option<String>,
    /// Directories mounted into every clone. Non-empty is a launch error:
    /// shared mutable dependency dirs break workstream isolation.
    pub shared_dependency_dirs: Vec<String>,
    /// Redirect detached runner output to per-workstream log files.
    pub daemon_logs: bool,
    /// Merge engine settings.
    pub merge: MergeConfig,
    /// Provider settings.
    pub provider: ProviderConfig,
}

/// Merge engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    /// Git remote for fetch and push.
    pub remote: String,
    /// Mainline branch.
    pub main_branch: String,
    /// Merge lock lifetime in minutes.
    pub lock_timeout_mins: u64,
    /// Merge lock heartbeat interval in seconds.
    pub heartbeat_secs: u64,
    /// Conflict resolution attempts per commit before blocking.
    pub conflict_attempt_limit: u32,
    /// Shell command run on the integration branch before push.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_command: Option<String>,
    /// Remove workstream workspaces after a successful merge.
    pub cleanup_on_success: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            remote: "origin".into(),
            main_branch: "main".into(),
            lock_timeout_mins: 120,
            heartbeat_secs: 30,
            conflict_attempt_limit: 3,
            validation_command: None,
            cleanup_on_success: false,
        }
    }
}

/// Provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider used when a role has no explicit assignment.
    pub default_provider: String,
    /// Model override for the coder role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coder_model: Option<String>,
    /// Model override for the reviewer role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_model: Option<String>,
    /// Model override for the coordinator role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_model: Option<String>,
    /// Invocation timeout in seconds.
    pub timeout_secs: u64,
    /// Give each invocation a sandbox home with symlinked auth files.
    pub sandbox_home: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: "claude".into(),
            coder_model: None,
            reviewer_model: None,
            orchestrator_model: None,
            timeout_secs: 900,
            sandbox_home: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: String::new(),
            max_clones: 3,
            hydration_command: None,
            shared_dependency_dirs: Vec::new(),
            daemon_logs: true,
            merge: MergeConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration for a project with the full layer stack.
    pub fn load(project_root: &Path, global: &GlobalPaths) -> Result<Self> {
        let config = Self::default();

        let global_path = global.state_dir().join("config.toml");
        let config = if global_path.exists() {
            config.merge(load_toml(&global_path)?)
        } else {
            config
        };

        let project_path = project_root.join(".steroids").join("config.toml");
        let config = if project_path.exists() {
            config.merge(load_toml(&project_path)?)
        } else {
            config
        };

        // STEROIDS_CONFIG names an explicit file layered over everything.
        let config = match std::env::var("STEROIDS_CONFIG") {
            Ok(path) if !path.is_empty() => {
                config.merge(load_toml(Path::new(&path))?)
            }
            _ => config,
        };

        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge another config into this one; `other` takes precedence for
    /// any field it sets away from the default.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: if other.workspace_root.is_empty() {
                self.workspace_root
            } else {
                other.workspace_root
            },
            max_clones: if other.max_clones == defaults.max_clones {
                self.max_clones
            } else {
                other.max_clones
            },
            hydration_command: other.hydration_command.or(self.hydration_command),
            shared_dependency_dirs: if other.shared_dependency_dirs.is_empty() {
                self.shared_dependency_dirs
            } else {
                other.shared_dependency_dirs
            },
            daemon_logs: if other.daemon_logs == defaults.daemon_logs {
                self.daemon_logs
            } else {
                other.daemon_logs
            },
            merge: self.merge.merge(other.merge),
            provider: self.provider.merge(other.provider),
        }
    }

    /// Apply environment overrides (`STEROIDS_TIMEOUT`).
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Some(secs) = std::env::var("STEROIDS_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.provider.timeout_secs = secs;
        }
        self
    }

    /// Reject configurations that violate the isolation contract.
    pub fn validate(&self) -> Result<()> {
        if !self.shared_dependency_dirs.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "shared_dependency_dirs breaks workstream isolation: {:?}",
                self.shared_dependency_dirs
            )));
        }
        if self.max_clones == 0 {
            return Err(Error::InvalidConfig("max_clones must be at least 1".into()));
        }
        if self.merge.heartbeat_secs == 0 {
            return Err(Error::InvalidConfig(
                "merge.heartbeat_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective workspace clone root.
    #[must_use]
    pub fn workspace_root_path(&self, global: &GlobalPaths) -> PathBuf {
        if self.workspace_root.is_empty() {
            global.workspace_root()
        } else {
            PathBuf::from(&self.workspace_root)
        }
    }
}

impl MergeConfig {
    fn merge(self, other: Self) -> Self {
        let defaults = Self::default();
        Self {
            remote: if other.remote == defaults.remote {
                self.remote
            } else {
                other.remote
            },
            main_branch: if other.main_branch == defaults.main_branch {
                self.main_branch
            } else {
                other.main_branch
            },
            lock_timeout_mins: if other.lock_timeout_mins == defaults.lock_timeout_mins {
                self.lock_timeout_mins
            } else {
                other.lock_timeout_mins
            },
            heartbeat_secs: if other.heartbeat_secs == defaults.heartbeat_secs {
                self.heartbeat_secs
            } else {
                other.heartbeat_secs
            },
            conflict_attempt_limit: if other.conflict_attempt_limit
                == defaults.conflict_attempt_limit
            {
                self.conflict_attempt_limit
            } else {
                other.conflict_attempt_limit
            },
            validation_command: other.validation_command.or(self.validation_command),
            cleanup_on_success: if other.cleanup_on_success == defaults.cleanup_on_success {
                self.cleanup_on_success
            } else {
                other.cleanup_on_success
            },
        }
    }
}

impl ProviderConfig {
    fn merge(self, other: Self) -> Self {
        let defaults = Self::default();
        Self {
            default_provider: if other.default_provider == defaults.default_provider {
                self.default_provider
            } else {
                other.default_provider
            },
            coder_model: other.coder_model.or(self.coder_model),
            reviewer_model: other.reviewer_model.or(self.reviewer_model),
            orchestrator_model: other.orchestrator_model.or(self.orchestrator_model),
            timeout_secs: if other.timeout_secs == defaults.timeout_secs {
                self.timeout_secs
            } else {
                other.timeout_secs
            },
            sandbox_home: if other.sandbox_home == defaults.sandbox_home {
                self.sandbox_home
            } else {
                other.sandbox_home
            },
        }
    }
}

fn load_toml(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_clones, 3);
        assert_eq!(config.merge.remote, "origin");
        assert_eq!(config.merge.main_branch, "main");
        assert_eq!(config.merge.lock_timeout_mins, 120);
        assert_eq!(config.merge.heartbeat_secs, 30);
        assert_eq!(config.provider.timeout_secs, 900);
    }

    #[test]
    fn test_merge_prefers_explicit_values() {
        let base = Config::default();
        let overlay = Config {
            max_clones: 5,
            merge: MergeConfig {
                main_branch: "trunk".into(),
                ..MergeConfig::default()
            },
            ..Config::default()
        };
        let merged = base.merge(overlay);
        assert_eq!(merged.max_clones, 5);
        assert_eq!(merged.merge.main_branch, "trunk");
        assert_eq!(merged.merge.remote, "origin");
    }

    #[test]
    fn test_shared_dependency_dirs_rejected() {
        let config = Config {
            shared_dependency_dirs: vec!["node_modules".into()],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let text = r#"
            max_clones = 2
            [merge]
            validation_command = "cargo test"
            [provider]
            default_provider = "codex"
        "#;
        let parsed: Config =
            toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        assert_eq!(parsed.max_clones, 2);
        assert_eq!(
            parsed.merge.validation_command.as_deref(),
            Some("cargo test")
        );
        assert_eq!(parsed.provider.default_provider, "codex");
        Ok(())
    }
}
