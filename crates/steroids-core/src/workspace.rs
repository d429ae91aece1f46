//! Workspace clone lifecycle.
//!
//! Each workstream runs in a self-contained git clone under
//! `<workspace_root>/<sha256(project)>/<workstream-id>/`. The merge engine
//! gets its own integration clone. Cleanup only ever deletes paths that
//! prove to be inside the project's hashed workspace directory.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::git::{Git, GitRunner};
use crate::paths;
use crate::{Error, Result};

/// Cap on captured validation output (20 MiB).
pub const VALIDATION_OUTPUT_CAP: usize = 20 * 1024 * 1024;

/// RAII guard for a freshly created clone.
///
/// Removes the directory on drop unless disarmed, so a failed launch never
/// leaks a half-initialized workspace.
pub struct CloneGuard {
    path: PathBuf,
    active: bool,
}

impl CloneGuard {
    /// Guard a clone directory.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path, active: true }
    }

    /// Keep the clone; creation succeeded.
    pub fn disarm(&mut self) {
        self.active = false;
    }
}

impl Drop for CloneGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if self.path.exists() {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove abandoned clone"
                );
            }
        }
    }
}

/// Output of a hydration or validation command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// Captured stdout, possibly truncated at the cap.
    pub stdout: String,
    /// Captured stderr, possibly truncated at the cap.
    pub stderr: String,
    /// Exit code; -1 when killed by signal.
    pub status: i32,
    /// Whether the combined output exceeded the buffer cap.
    pub truncated: bool,
}

impl ShellOutput {
    /// Whether the command exited zero and within the buffer cap.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0 && !self.truncated
    }
}

/// Create a workstream clone of `project_root` at `dest`, checked out on a
/// fresh `branch`.
pub async fn create_clone<R: GitRunner>(
    git: &Git<R>,
    project_root: &Path,
    dest: &Path,
    branch: &str,
) -> Result<()> {
    if dest.exists() {
        return Err(Error::Io(format!(
            "clone target already exists: {}",
            dest.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Io(format!("cannot create {}: {e}", parent.display())))?;
    }

    let src = project_root.to_string_lossy().to_string();
    let parent = dest
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let mut guard = CloneGuard::new(dest.to_path_buf());
    git.clone_repo(&parent, &src, dest).await?;
    git.checkout_new_branch(dest, branch).await?;
    guard.disarm();
    Ok(())
}

/// Run a shell command inside a clone, capturing output up to `cap` bytes.
pub async fn run_shell(cwd: &Path, command: &str, cap: usize) -> Result<ShellOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| Error::Io(format!("failed to spawn `{command}`: {e}")))?;

    let truncated = output.stdout.len() + output.stderr.len() > cap;
    let take = |bytes: &[u8]| -> String {
        let end = bytes.len().min(cap);
        String::from_utf8_lossy(&bytes[..end]).to_string()
    };

    Ok(ShellOutput {
        stdout: take(&output.stdout),
        stderr: take(&output.stderr),
        status: output.status.code().unwrap_or(-1),
        truncated,
    })
}

/// Run the configured hydration command inside a fresh clone.
pub async fn hydrate(cwd: &Path, command: &str) -> Result<()> {
    tracing::info!(command, cwd = %cwd.display(), "hydrating workspace");
    let out = run_shell(cwd, command, VALIDATION_OUTPUT_CAP).await?;
    if out.success() {
        Ok(())
    } else {
        Err(Error::Io(format!(
            "hydration command `{command}` failed ({}): {}",
            out.status, out.stderr
        )))
    }
}

/// Delete a workstream workspace, refusing anything outside the project's
/// hashed workspace directory. Returns whether a deletion happened.
pub async fn remove_workspace(
    workspace_root: &Path,
    project_root: &Path,
    candidate: &Path,
) -> Result<bool> {
    if !paths::is_managed_workspace(workspace_root, project_root, candidate)? {
        tracing::warn!(
            path = %candidate.display(),
            "refusing to delete path outside the managed workspace root"
        );
        return Ok(false);
    }
    if !candidate.exists() {
        return Ok(false);
    }
    tokio::fs::remove_dir_all(candidate)
        .await
        .map_err(|e| Error::Io(format!("cannot remove {}: {e}", candidate.display())))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_shell_captures_exit_code() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let out = run_shell(dir.path(), "exit 3", VALIDATION_OUTPUT_CAP).await?;
        assert_eq!(out.status, 3);
        assert!(!out.success());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_shell_cap_marks_truncation() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let out = run_shell(dir.path(), "printf 'abcdefgh'", 4).await?;
        assert!(out.truncated);
        assert_eq!(out.stdout, "abcd");
        assert!(!out.success());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_workspace_refuses_outside_paths() -> Result<()> {
        let project = tempfile::TempDir::new()?;
        let victim = tempfile::TempDir::new()?;
        let ws_root = tempfile::TempDir::new()?;

        let removed =
            remove_workspace(ws_root.path(), project.path(), victim.path()).await?;
        assert!(!removed);
        assert!(victim.path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_workspace_deletes_managed_paths() -> Result<()> {
        let project = tempfile::TempDir::new()?;
        let ws_root = tempfile::TempDir::new()?;
        let hash = paths::project_hash(project.path())?;
        let clone = ws_root.path().join(hash).join("ws-1");
        tokio::fs::create_dir_all(&clone).await?;

        let removed = remove_workspace(ws_root.path(), project.path(), &clone).await?;
        assert!(removed);
        assert!(!clone.exists());
        Ok(())
    }

    #[test]
    fn test_clone_guard_removes_on_drop() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let clone = dir.path().join("doomed");
        std::fs::create_dir_all(&clone)?;
        {
            let _guard = CloneGuard::new(clone.clone());
        }
        assert!(!clone.exists());
        Ok(())
    }

    #[test]
    fn test_clone_guard_disarm_keeps_directory() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let clone = dir.path().join("kept");
        std::fs::create_dir_all(&clone)?;
        {
            let mut guard = CloneGuard::new(clone.clone());
            guard.disarm();
        }
        assert!(clone.exists());
        Ok(())
    }
}
