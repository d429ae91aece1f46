//! NDJSON activity log for provider invocations.
//!
//! Every invocation appends a start event, zero or more line events, and
//! one terminal complete event to
//! `.steroids/invocations/<invocation-id>.log`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::timefmt::now_str;
use crate::types::Role;
use crate::{Error, Result};

/// One event in the activity stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActivityEvent {
    /// Invocation started.
    Start {
        /// Invocation id.
        invocation_id: String,
        /// Provider name.
        provider: String,
        /// Model in use.
        model: Option<String>,
        /// Role of the invocation.
        role: Role,
        /// RFC3339 timestamp.
        ts: String,
    },
    /// One line of provider output.
    Line {
        /// `stdout` or `stderr`.
        stream: String,
        /// The line text.
        text: String,
        /// RFC3339 timestamp.
        ts: String,
    },
    /// Invocation finished.
    Complete {
        /// `completed`, `failed`, or `timeout`.
        status: String,
        /// Process exit code.
        exit_code: i32,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
        /// Whether the timeout fired.
        timed_out: bool,
        /// RFC3339 timestamp.
        ts: String,
    },
}

/// Append-only NDJSON writer.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    /// Log writing to `path`, creating parent directories on first write.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event.
    pub async fn append(&self, event: &ActivityEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(format!("cannot create {}: {e}", parent.display())))?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Io(format!("cannot open {}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("cannot write {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Append a start event stamped now.
    pub async fn start(
        &self,
        invocation_id: &str,
        provider: &str,
        model: Option<&str>,
        role: Role,
    ) -> Result<()> {
        self.append(&ActivityEvent::Start {
            invocation_id: invocation_id.to_string(),
            provider: provider.to_string(),
            model: model.map(ToString::to_string),
            role,
            ts: now_str(),
        })
        .await
    }

    /// Append an output line stamped now.
    pub async fn line(&self, stream: &str, text: &str) -> Result<()> {
        self.append(&ActivityEvent::Line {
            stream: stream.to_string(),
            text: text.to_string(),
            ts: now_str(),
        })
        .await
    }

    /// Append the terminal event stamped now.
    pub async fn complete(
        &self,
        status: &str,
        exit_code: i32,
        duration_ms: u64,
        timed_out: bool,
    ) -> Result<()> {
        self.append(&ActivityEvent::Complete {
            status: status.to_string(),
            exit_code,
            duration_ms,
            timed_out,
            ts: now_str(),
        })
        .await
    }
}
