//! CLI-backed provider adapter.
//!
//! Wraps a provider's command-line tool (claude, codex, gemini, mistral,
//! ollama) behind the [`Provider`] trait. The child runs in a sanitized
//! environment: host API-key variables are stripped so the CLI uses its
//! own stored credentials, and optionally a sandbox home limits what the
//! child can see to symlinked auth files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::activity::ActivityLog;
use super::classify::ErrorClassifier;
use super::types::{InvokeOptions, InvokeResult, ProviderError, TokenUsage};
use super::Provider;
use crate::types::Role;
use crate::{Error, Result};

/// API-key variables stripped from every child environment.
pub const STRIPPED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_API_KEY",
    "GEMINI_API_KEY",
    "MISTRAL_API_KEY",
    "COHERE_API_KEY",
    "XAI_API_KEY",
    "OPENROUTER_API_KEY",
    "DEEPSEEK_API_KEY",
];

/// Home-relative auth material symlinked into sandbox homes.
const SANDBOX_LINKS: &[&str] = &[
    ".claude",
    ".claude.json",
    ".codex",
    ".gemini",
    ".config/gcloud",
    ".mistral",
    ".ollama",
    ".gitconfig",
    ".ssh",
];

/// How the CLI receives the prompt.
#[derive(Debug, Clone)]
pub enum PromptStyle {
    /// Prompt is the final positional argument.
    Positional,
    /// Prompt follows a flag, e.g. `-p <prompt>`.
    Flag(String),
}

/// How the CLI receives the model.
#[derive(Debug, Clone)]
pub enum ModelStyle {
    /// Model follows a flag, e.g. `--model <model>`.
    Flag(String),
    /// Model is a positional argument before the prompt (`ollama run`).
    Positional,
}

/// Static description of a provider CLI.
#[derive(Debug, Clone)]
pub struct CliProviderSpec {
    /// Provider name (`claude`, `codex`, ...).
    pub name: String,
    /// Binary to invoke.
    pub binary: String,
    /// Arguments inserted before everything else (subcommands).
    pub base_args: Vec<String>,
    /// Prompt passing style.
    pub prompt: PromptStyle,
    /// Model passing style.
    pub model: ModelStyle,
    /// Flag used to resume a provider session, if supported.
    pub resume_flag: Option<String>,
    /// Static model list.
    pub models: Vec<String>,
    /// Default model per role: (orchestrator, coder, reviewer).
    pub role_defaults: (String, String, String),
    /// Command that lists models live (`ollama list`); static list is the
    /// fallback.
    pub models_command: Option<Vec<String>>,
}

/// A provider backed by its CLI.
pub struct CliProvider {
    spec: CliProviderSpec,
    classifier: ErrorClassifier,
}

impl CliProvider {
    /// Build from a spec with an injected classifier.
    #[must_use]
    pub fn new(spec: CliProviderSpec, classifier: ErrorClassifier) -> Self {
        Self { spec, classifier }
    }

    /// The spec this adapter was built from.
    #[must_use]
    pub fn spec(&self) -> &CliProviderSpec {
        &self.spec
    }

    fn build_args(&self, prompt: &str, model: &str, resume: Option<&str>) -> Vec<String> {
        let mut args = self.spec.base_args.clone();
        if let (Some(flag), Some(session)) = (&self.spec.resume_flag, resume) {
            args.push(flag.clone());
            args.push(session.to_string());
        }
        match &self.spec.model {
            ModelStyle::Flag(flag) => {
                args.push(flag.clone());
                args.push(model.to_string());
            }
            ModelStyle::Positional => args.push(model.to_string()),
        }
        match &self.spec.prompt {
            PromptStyle::Positional => args.push(prompt.to_string()),
            PromptStyle::Flag(flag) => {
                args.push(flag.clone());
                args.push(prompt.to_string());
            }
        }
        args
    }

    async fn run(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        resume: Option<&str>,
    ) -> Result<InvokeResult> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model(options.role).to_string());
        let args = self.build_args(prompt, &model, resume);

        let log = options.activity_log.clone().map(ActivityLog::new);
        if let (Some(log), Some(invocation_id)) = (&log, &options.invocation_id) {
            log.start(invocation_id, &self.spec.name, Some(&model), options.role)
                .await?;
        }

        let mut cmd = Command::new(&self.spec.binary);
        cmd.args(&args)
            .current_dir(&options.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in stripped_env_keys() {
            cmd.env_remove(&key);
        }

        // Held for the lifetime of the child; dropping it removes the
        // sandbox directory.
        let sandbox = if options.sandbox_home {
            let sandbox = SandboxHome::create()?;
            cmd.env("HOME", sandbox.path());
            Some(sandbox)
        } else {
            None
        };

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            Error::Io(format!("failed to spawn {}: {e}", self.spec.binary))
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let outcome = tokio::time::timeout(options.timeout, async {
            let (stdout_text, stderr_text) = tokio::join!(
                drain_stream(stdout_pipe, "stdout", log.clone()),
                drain_stream(stderr_pipe, "stderr", log.clone()),
            );
            let status = child.wait().await;
            (stdout_text, stderr_text, status)
        })
        .await;

        let duration = started.elapsed();
        let result = match outcome {
            Ok((stdout_text, stderr_text, status)) => {
                let exit_code = status
                    .map_err(|e| Error::Io(format!("failed to wait for provider: {e}")))?
                    .code()
                    .unwrap_or(-1);
                let (session_id, token_usage) = parse_metadata(&stdout_text);
                InvokeResult {
                    success: exit_code == 0,
                    exit_code,
                    stdout: stdout_text,
                    stderr: stderr_text,
                    duration,
                    timed_out: false,
                    session_id,
                    token_usage,
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                InvokeResult {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!(
                        "provider timed out after {} seconds",
                        options.timeout.as_secs()
                    ),
                    duration,
                    timed_out: true,
                    session_id: None,
                    token_usage: None,
                }
            }
        };
        drop(sandbox);

        if let Some(log) = &log {
            let status = if result.timed_out {
                "timeout"
            } else if result.success {
                "completed"
            } else {
                "failed"
            };
            log.complete(
                status,
                result.exit_code,
                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                result.timed_out,
            )
            .await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn invoke(&self, prompt: &str, options: &InvokeOptions) -> Result<InvokeResult> {
        self.run(prompt, options, None).await
    }

    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<InvokeResult> {
        if self.spec.resume_flag.is_none() {
            return Err(Error::Validation(format!(
                "provider {} does not support session resume",
                self.spec.name
            )));
        }
        self.run(prompt, options, Some(session_id)).await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        if let Some(command) = &self.spec.models_command {
            if let Some(models) = self.try_live_models(command).await {
                return Ok(models);
            }
        }
        Ok(self.spec.models.clone())
    }

    fn default_model(&self, role: Role) -> &str {
        match role {
            Role::Orchestrator => &self.spec.role_defaults.0,
            Role::Coder => &self.spec.role_defaults.1,
            Role::Reviewer => &self.spec.role_defaults.2,
        }
    }

    fn classify_error(&self, exit_code: i32, stderr: &str) -> ProviderError {
        self.classifier.classify(exit_code, stderr, "")
    }

    fn classify_result(&self, result: &InvokeResult) -> Option<ProviderError> {
        if result.success {
            return None;
        }
        Some(
            self.classifier
                .classify(result.exit_code, &result.stderr, &result.stdout),
        )
    }

    async fn is_available(&self) -> bool {
        which::which(&self.spec.binary).is_ok()
    }
}

impl CliProvider {
    async fn try_live_models(&self, command: &[String]) -> Option<Vec<String>> {
        let output = Command::new(&self.spec.binary)
            .args(command)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let models: Vec<String> = text
            .lines()
            .skip(1) // header row
            .filter_map(|line| line.split_whitespace().next())
            .map(ToString::to_string)
            .collect();
        if models.is_empty() {
            None
        } else {
            Some(models)
        }
    }
}

/// Every env key stripped from provider children: the static list plus
/// any `STEROIDS_<PROVIDER>_API_KEY` override.
fn stripped_env_keys() -> Vec<String> {
    let mut keys: Vec<String> = STRIPPED_ENV_VARS.iter().map(ToString::to_string).collect();
    for (key, _) in std::env::vars() {
        if key.starts_with("STEROIDS_") && key.ends_with("_API_KEY") {
            keys.push(key);
        }
    }
    keys
}

async fn drain_stream(
    pipe: Option<impl tokio::io::AsyncRead + Unpin>,
    name: &str,
    log: Option<ActivityLog>,
) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut reader = BufReader::new(pipe).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = reader.next_line().await {
        if let Some(log) = &log {
            let _ = log.line(name, &line).await;
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

/// Best-effort extraction of a session id and token usage from provider
/// stdout. Providers that emit JSON result envelopes are recognized; the
/// rest simply yield `None`.
fn parse_metadata(stdout: &str) -> (Option<String>, Option<TokenUsage>) {
    let session_re = Regex::new(r#""session_id"\s*:\s*"([^"]+)""#).ok();
    let input_re = Regex::new(r#""input_tokens"\s*:\s*(\d+)"#).ok();
    let output_re = Regex::new(r#""output_tokens"\s*:\s*(\d+)"#).ok();

    let session_id = session_re
        .and_then(|re| re.captures(stdout))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let input = input_re
        .and_then(|re| re.captures(stdout))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok());
    let output = output_re
        .and_then(|re| re.captures(stdout))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok());

    let usage = match (input, output) {
        (Some(input_tokens), Some(output_tokens)) => Some(TokenUsage {
            input_tokens,
            output_tokens,
        }),
        _ => None,
    };
    (session_id, usage)
}

/// Temporary home directory holding symlinks to the real home's provider
/// auth files.
struct SandboxHome {
    dir: tempfile::TempDir,
}

impl SandboxHome {
    fn create() -> Result<Self> {
        let real_home = directories::BaseDirs::new()
            .ok_or_else(|| Error::InvalidConfig("cannot resolve home directory".into()))?
            .home_dir()
            .to_path_buf();
        let dir = tempfile::TempDir::new()
            .map_err(|e| Error::Io(format!("cannot create sandbox home: {e}")))?;

        for rel in SANDBOX_LINKS {
            let source = real_home.join(rel);
            if !source.exists() {
                continue;
            }
            let target = dir.path().join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Io(format!("cannot create {}: {e}", parent.display())))?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&source, &target)
                .map_err(|e| Error::Io(format!("cannot link {}: {e}", target.display())))?;
        }
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Built-in provider specs.
#[must_use]
pub fn builtin_specs() -> Vec<CliProviderSpec> {
    vec![
        CliProviderSpec {
            name: "claude".into(),
            binary: "claude".into(),
            base_args: vec![],
            prompt: PromptStyle::Flag("-p".into()),
            model: ModelStyle::Flag("--model".into()),
            resume_flag: Some("--resume".into()),
            models: vec![
                "claude-opus-4-5".into(),
                "claude-sonnet-4-5".into(),
                "claude-haiku-4-5".into(),
            ],
            role_defaults: (
                "claude-opus-4-5".into(),
                "claude-sonnet-4-5".into(),
                "claude-sonnet-4-5".into(),
            ),
            models_command: None,
        },
        CliProviderSpec {
            name: "codex".into(),
            binary: "codex".into(),
            base_args: vec!["exec".into()],
            prompt: PromptStyle::Positional,
            model: ModelStyle::Flag("--model".into()),
            resume_flag: None,
            models: vec!["gpt-5-codex".into(), "gpt-5".into()],
            role_defaults: ("gpt-5".into(), "gpt-5-codex".into(), "gpt-5".into()),
            models_command: None,
        },
        CliProviderSpec {
            name: "gemini".into(),
            binary: "gemini".into(),
            base_args: vec![],
            prompt: PromptStyle::Flag("-p".into()),
            model: ModelStyle::Flag("--model".into()),
            resume_flag: None,
            models: vec!["gemini-2.5-pro".into(), "gemini-2.5-flash".into()],
            role_defaults: (
                "gemini-2.5-pro".into(),
                "gemini-2.5-pro".into(),
                "gemini-2.5-flash".into(),
            ),
            models_command: None,
        },
        CliProviderSpec {
            name: "mistral".into(),
            binary: "mistral".into(),
            base_args: vec!["chat".into()],
            prompt: PromptStyle::Positional,
            model: ModelStyle::Flag("--model".into()),
            resume_flag: None,
            models: vec!["mistral-large-latest".into(), "codestral-latest".into()],
            role_defaults: (
                "mistral-large-latest".into(),
                "codestral-latest".into(),
                "mistral-large-latest".into(),
            ),
            models_command: None,
        },
        CliProviderSpec {
            name: "ollama".into(),
            binary: "ollama".into(),
            base_args: vec!["run".into()],
            prompt: PromptStyle::Positional,
            model: ModelStyle::Positional,
            resume_flag: None,
            models: vec!["qwen2.5-coder".into(), "llama3.3".into()],
            role_defaults: (
                "llama3.3".into(),
                "qwen2.5-coder".into(),
                "llama3.3".into(),
            ),
            models_command: Some(vec!["list".into()]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude_spec() -> CliProviderSpec {
        builtin_specs()
            .into_iter()
            .find(|s| s.name == "claude")
            .unwrap_or_else(|| panic!("claude spec missing"))
    }

    #[test]
    fn test_arg_shapes() {
        let provider = CliProvider::new(claude_spec(), ErrorClassifier::new());
        let args = provider.build_args("do the thing", "claude-sonnet-4-5", None);
        assert_eq!(
            args,
            vec!["--model", "claude-sonnet-4-5", "-p", "do the thing"]
        );

        let args = provider.build_args("continue", "claude-sonnet-4-5", Some("sess-1"));
        assert_eq!(args[0], "--resume");
        assert_eq!(args[1], "sess-1");

        let ollama = builtin_specs()
            .into_iter()
            .find(|s| s.name == "ollama")
            .unwrap_or_else(|| panic!("ollama spec missing"));
        let provider = CliProvider::new(ollama, ErrorClassifier::new());
        let args = provider.build_args("fix it", "qwen2.5-coder", None);
        assert_eq!(args, vec!["run", "qwen2.5-coder", "fix it"]);
    }

    #[test]
    fn test_metadata_extraction() {
        let stdout = r#"{"session_id":"abc-123","usage":{"input_tokens":100,"output_tokens":42}}"#;
        let (session, usage) = parse_metadata(stdout);
        assert_eq!(session.as_deref(), Some("abc-123"));
        let usage = usage.unwrap_or(TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
        });
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 42);

        let (session, usage) = parse_metadata("plain text output");
        assert!(session.is_none());
        assert!(usage.is_none());
    }

    #[tokio::test]
    async fn test_invoke_real_subprocess() -> Result<()> {
        // Use a shell as a stand-in provider binary.
        let spec = CliProviderSpec {
            name: "fake".into(),
            binary: "sh".into(),
            base_args: vec!["-c".into(), "echo done".into()],
            prompt: PromptStyle::Positional,
            model: ModelStyle::Positional,
            resume_flag: None,
            models: vec!["m1".into()],
            role_defaults: ("m1".into(), "m1".into(), "m1".into()),
            models_command: None,
        };
        let provider = CliProvider::new(spec, ErrorClassifier::new());
        let dir = tempfile::TempDir::new()?;
        let options = InvokeOptions::new(Role::Coder, dir.path().to_path_buf());
        let result = provider.invoke("ignored", &options).await?;
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "done");
        assert!(!result.timed_out);
        Ok(())
    }

    #[tokio::test]
    async fn test_invoke_timeout() -> Result<()> {
        let spec = CliProviderSpec {
            name: "sleepy".into(),
            binary: "sh".into(),
            base_args: vec!["-c".into(), "sleep 5".into()],
            prompt: PromptStyle::Positional,
            model: ModelStyle::Positional,
            resume_flag: None,
            models: vec!["m1".into()],
            role_defaults: ("m1".into(), "m1".into(), "m1".into()),
            models_command: None,
        };
        let provider = CliProvider::new(spec, ErrorClassifier::new());
        let dir = tempfile::TempDir::new()?;
        let mut options = InvokeOptions::new(Role::Coder, dir.path().to_path_buf());
        options.timeout = Duration::from_millis(100);
        let result = provider.invoke("", &options).await?;
        assert!(result.timed_out);
        assert!(!result.success);
        Ok(())
    }
}
