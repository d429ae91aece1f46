//! Filesystem layout for project-local and global state.
//!
//! Per project: `<project>/.steroids/` holds the task store, invocation
//! logs, and daemon logs. Global state lives under the user's home in
//! `~/.steroids/`. Workspace clones are keyed by the sha256 of the
//! project's canonical path so unrelated checkouts never collide.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Name of the per-project state directory.
pub const PROJECT_DIR: &str = ".steroids";

/// Database file name, shared by project and global stores.
pub const DB_FILE: &str = "steroids.db";

/// Per-project layout under `<project>/.steroids/`.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    /// Resolve the layout for a project checkout.
    #[must_use]
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.join(PROJECT_DIR),
        }
    }

    /// `<project>/.steroids/`.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    /// `<project>/.steroids/steroids.db`.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    /// `<project>/.steroids/invocations/<invocation-id>.log`.
    #[must_use]
    pub fn invocation_log(&self, invocation_id: &str) -> PathBuf {
        self.root.join("invocations").join(format!("{invocation_id}.log"))
    }

    /// `<project>/.steroids/logs/` for daemonized runner output.
    #[must_use]
    pub fn daemon_log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Whether the project has been initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.db_path().exists()
    }
}

/// Global layout under `~/.steroids/`.
#[derive(Debug, Clone)]
pub struct GlobalPaths {
    root: PathBuf,
}

impl GlobalPaths {
    /// Resolve the global directory from the user's home.
    pub fn resolve() -> Result<Self> {
        let base = BaseDirs::new()
            .ok_or_else(|| Error::InvalidConfig("cannot resolve home directory".into()))?;
        Ok(Self {
            root: base.home_dir().join(PROJECT_DIR),
        })
    }

    /// Build from an explicit root (tests and `STEROIDS_CONFIG` overrides).
    #[must_use]
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// `~/.steroids/`.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    /// `~/.steroids/steroids.db`, the control plane.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    /// `~/.steroids/runners/logs/daemon-<pid>.log`.
    #[must_use]
    pub fn runner_log(&self, pid: u32) -> PathBuf {
        self.root
            .join("runners")
            .join("logs")
            .join(format!("daemon-{pid}.log"))
    }

    /// Default root for workspace clones.
    #[must_use]
    pub fn workspace_root(&self) -> PathBuf {
        self.root.join("workspaces")
    }
}

/// Hex sha256 of a project's canonical path, used to key workspace clones.
pub fn project_hash(project_root: &Path) -> Result<String> {
    let canonical = project_root
        .canonicalize()
        .map_err(|e| Error::Io(format!("cannot canonicalize {}: {e}", project_root.display())))?;
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    Ok(hex::encode(digest))
}

/// Directory holding every clone for one project:
/// `<workspace_root>/<sha256(project-realpath)>/`.
pub fn project_workspace_dir(workspace_root: &Path, project_root: &Path) -> Result<PathBuf> {
    Ok(workspace_root.join(project_hash(project_root)?))
}

/// Clone directory for a single workstream.
pub fn workstream_workspace_dir(
    workspace_root: &Path,
    project_root: &Path,
    workstream_id: &str,
) -> Result<PathBuf> {
    Ok(project_workspace_dir(workspace_root, project_root)?.join(workstream_id))
}

/// Whether `candidate` lies under the project's hashed workspace
/// directory. Cleanup must never delete a path that fails this check.
pub fn is_managed_workspace(
    workspace_root: &Path,
    project_root: &Path,
    candidate: &Path,
) -> Result<bool> {
    let managed = project_workspace_dir(workspace_root, project_root)?;
    Ok(candidate.starts_with(&managed) && candidate != managed)
}
