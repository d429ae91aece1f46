//! Git subprocess seam.
//!
//! The engine shells out to the `git` binary rather than binding libgit2:
//! the CLI's working-tree protections (refusing to clobber uncommitted
//! changes on checkout/merge) are exactly the guarantees the merge engine
//! leans on. Everything goes through the [`GitRunner`] trait so tests can
//! substitute a scripted responder with an ordered plan of expected argv
//! vectors.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{Error, Result};

/// Captured output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    /// Trimmed-right stdout.
    pub stdout: String,
    /// Trimmed-right stderr.
    pub stderr: String,
    /// Process exit code; -1 when killed by signal.
    pub status: i32,
}

impl GitOutput {
    /// Whether the process exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout and stderr joined, for error surfaces.
    #[must_use]
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes git argv vectors in a working directory.
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` in `cwd` and capture output. Only a spawn failure
    /// is an `Err`; a non-zero exit is a normal [`GitOutput`].
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput>;
}

/// Production runner backed by the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct SystemGit;

#[async_trait]
impl GitRunner for SystemGit {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| Error::Git(format!("failed to spawn git {}: {e}", args.join(" "))))?;

        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

/// One expected call in a [`ScriptedGit`] plan.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    /// The argv the engine is expected to issue.
    pub expect: Vec<String>,
    /// Canned stdout.
    pub stdout: String,
    /// Canned stderr.
    pub stderr: String,
    /// Canned exit code.
    pub status: i32,
}

impl ScriptedCall {
    /// Expected call succeeding with the given stdout.
    #[must_use]
    pub fn ok(expect: &[&str], stdout: &str) -> Self {
        Self {
            expect: expect.iter().map(ToString::to_string).collect(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            status: 0,
        }
    }

    /// Expected call failing with the given exit code and stderr.
    #[must_use]
    pub fn fail(expect: &[&str], status: i32, stderr: &str) -> Self {
        Self {
            expect: expect.iter().map(ToString::to_string).collect(),
            stdout: String::new(),
            stderr: stderr.to_string(),
            status,
        }
    }

    /// Expected call with explicit stdout and exit code.
    #[must_use]
    pub fn with_status(expect: &[&str], stdout: &str, status: i32) -> Self {
        Self {
            expect: expect.iter().map(ToString::to_string).collect(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            status,
        }
    }
}

/// Test runner that replays an ordered plan and fails on any deviation.
#[derive(Debug, Default)]
pub struct ScriptedGit {
    plan: Mutex<Vec<ScriptedCall>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedGit {
    /// Build a scripted runner from an ordered plan.
    #[must_use]
    pub fn new(plan: Vec<ScriptedCall>) -> Self {
        let mut plan = plan;
        plan.reverse();
        Self {
            plan: Mutex::new(plan),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every argv the engine actually issued, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of planned calls not yet consumed.
    pub fn remaining(&self) -> usize {
        self.plan.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GitRunner for ScriptedGit {
    async fn run(&self, _cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        let argv: Vec<String> = args.iter().map(ToString::to_string).collect();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(argv.clone());
        }

        let next = self
            .plan
            .lock()
            .map_err(|_| Error::Git("scripted plan poisoned".into()))?
            .pop();

        match next {
            Some(call) => {
                if call.expect != argv {
                    return Err(Error::Git(format!(
                        "scripted plan mismatch: expected git {:?}, got git {argv:?}",
                        call.expect
                    )));
                }
                Ok(GitOutput {
                    stdout: call.stdout,
                    stderr: call.stderr,
                    status: call.status,
                })
            }
            None => Err(Error::Git(format!("unplanned git call: git {argv:?}"))),
        }
    }
}

/// Outcome of a cherry-pick attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickOutcome {
    /// Commit applied cleanly.
    Applied,
    /// Conflict left in the working tree for resolution.
    Conflict,
    /// The commit was empty against the current tree.
    Empty,
}

/// Typed git operations over a [`GitRunner`].
pub struct Git<R: GitRunner> {
    runner: std::sync::Arc<R>,
}

impl<R: GitRunner> Clone for Git<R> {
    fn clone(&self) -> Self {
        Self {
            runner: std::sync::Arc::clone(&self.runner),
        }
    }
}

impl<R: GitRunner> Git<R> {
    /// Wrap a runner.
    #[must_use]
    pub fn new(runner: std::sync::Arc<R>) -> Self {
        Self { runner }
    }

    /// The underlying runner.
    #[must_use]
    pub fn runner(&self) -> &std::sync::Arc<R> {
        &self.runner
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        self.runner.run(cwd, args).await
    }

    async fn run_ok(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        let out = self.run(cwd, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                out.combined()
            )))
        }
    }

    /// `git status --porcelain`, split into lines.
    pub async fn status_porcelain(&self, cwd: &Path) -> Result<Vec<String>> {
        let out = self.run_ok(cwd, &["status", "--porcelain"]).await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Whether the working tree has staged or unstaged changes.
    pub async fn is_dirty(&self, cwd: &Path) -> Result<bool> {
        Ok(!self.status_porcelain(cwd).await?.is_empty())
    }

    /// Whether a cherry-pick is in progress in this worktree.
    pub async fn cherry_pick_in_progress(&self, cwd: &Path) -> Result<bool> {
        let out = self
            .run(cwd, &["rev-parse", "--verify", "--quiet", "CHERRY_PICK_HEAD"])
            .await?;
        Ok(out.success())
    }

    /// `git fetch --prune <remote> [<branch>]`. A missing remote ref is
    /// tolerated: returns `Ok(false)` instead of failing.
    pub async fn fetch_prune(&self, cwd: &Path, remote: &str, branch: Option<&str>) -> Result<bool> {
        let mut args = vec!["fetch", "--prune", remote];
        if let Some(branch) = branch {
            args.push(branch);
        }
        let out = self.run(cwd, &args).await?;
        if out.success() {
            return Ok(true);
        }
        let combined = out.combined().to_lowercase();
        if combined.contains("couldn't find remote ref") || combined.contains("no such ref") {
            return Ok(false);
        }
        Err(Error::FetchFailed(out.combined()))
    }

    /// `git rev-parse <rev>`, trimmed.
    pub async fn rev_parse(&self, cwd: &Path, rev: &str) -> Result<String> {
        let out = self.run(cwd, &["rev-parse", rev]).await?;
        if out.success() && !out.stdout.trim().is_empty() {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(Error::RemoteBranchMissing(format!(
                "{rev}: {}",
                out.combined()
            )))
        }
    }

    /// Current HEAD commit id.
    pub async fn head_sha(&self, cwd: &Path) -> Result<String> {
        let out = self.run_ok(cwd, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// `git merge-base <a> <b>`.
    pub async fn merge_base(&self, cwd: &Path, a: &str, b: &str) -> Result<String> {
        let out = self.run(cwd, &["merge-base", a, b]).await?;
        if out.success() && !out.stdout.trim().is_empty() {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(Error::CommitListFailed(format!(
                "merge-base {a} {b}: {}",
                out.combined()
            )))
        }
    }

    /// `git log <base>..<head> --format=%H --reverse`: the sealed commit
    /// list, oldest first.
    pub async fn commit_list(&self, cwd: &Path, base: &str, head: &str) -> Result<Vec<String>> {
        let range = format!("{base}..{head}");
        let out = self
            .run(cwd, &["log", &range, "--format=%H", "--reverse"])
            .await?;
        if !out.success() {
            return Err(Error::CommitListFailed(out.combined()));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Last `n` commits as `(sha, subject)` pairs, newest first.
    pub async fn recent_commits(&self, cwd: &Path, n: usize) -> Result<Vec<(String, String)>> {
        let count = format!("-{n}");
        let out = self.run(cwd, &["log", &count, "--format=%H %s"]).await?;
        if !out.success() {
            // Empty repositories have no log yet.
            return Ok(Vec::new());
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, ' ');
                let sha = parts.next()?.to_string();
                let subject = parts.next().unwrap_or("").to_string();
                Some((sha, subject))
            })
            .collect())
    }

    /// `git pull --ff-only`, mapping divergence to `NON_FAST_FORWARD`.
    pub async fn pull_ff_only(&self, cwd: &Path) -> Result<()> {
        let out = self.run(cwd, &["pull", "--ff-only"]).await?;
        if out.success() {
            return Ok(());
        }
        let combined = out.combined();
        if combined.to_lowercase().contains("fast-forward")
            || combined.to_lowercase().contains("diverg")
        {
            Err(Error::NonFastForward(combined))
        } else {
            Err(Error::PullFailed(combined))
        }
    }

    /// `git clone <src> <dest>`.
    pub async fn clone_repo(&self, cwd: &Path, src: &str, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy().to_string();
        self.run_ok(cwd, &["clone", src, &dest_str]).await?;
        Ok(())
    }

    /// `git checkout -b <branch>`.
    pub async fn checkout_new_branch(&self, cwd: &Path, branch: &str) -> Result<()> {
        self.run_ok(cwd, &["checkout", "-b", branch]).await?;
        Ok(())
    }

    /// Attempt a cherry-pick, classifying conflicts.
    pub async fn cherry_pick(&self, cwd: &Path, sha: &str) -> Result<CherryPickOutcome> {
        let out = self.run(cwd, &["cherry-pick", sha]).await?;
        if out.success() {
            return Ok(CherryPickOutcome::Applied);
        }
        let combined = out.combined();
        let lowered = combined.to_lowercase();
        if lowered.contains("conflict") || lowered.contains("could not apply") {
            Ok(CherryPickOutcome::Conflict)
        } else if lowered.contains("empty") && lowered.contains("cherry-pick") {
            // Already-integrated change; let the caller skip it.
            let _ = self.run(cwd, &["cherry-pick", "--skip"]).await;
            Ok(CherryPickOutcome::Empty)
        } else {
            Err(Error::Git(format!("cherry-pick {sha}: {combined}")))
        }
    }

    /// `git -c core.editor=true cherry-pick --continue`, accepting the
    /// default commit message.
    pub async fn cherry_pick_continue(&self, cwd: &Path) -> Result<()> {
        self.run_ok(cwd, &["-c", "core.editor=true", "cherry-pick", "--continue"])
            .await?;
        Ok(())
    }

    /// Files still unmerged in the working tree.
    pub async fn conflicted_files(&self, cwd: &Path) -> Result<Vec<String>> {
        let out = self
            .run_ok(cwd, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// `git add -A`.
    pub async fn stage_all(&self, cwd: &Path) -> Result<()> {
        self.run_ok(cwd, &["add", "-A"]).await?;
        Ok(())
    }

    /// `git commit -m <message>`.
    pub async fn commit(&self, cwd: &Path, message: &str) -> Result<()> {
        self.run_ok(cwd, &["commit", "-m", message]).await?;
        Ok(())
    }

    /// Staged patch (`diff --cached`).
    pub async fn staged_diff(&self, cwd: &Path) -> Result<String> {
        let out = self.run_ok(cwd, &["diff", "--cached"]).await?;
        Ok(out.stdout)
    }

    /// Staged file list (`diff --cached --name-only`).
    pub async fn staged_files(&self, cwd: &Path) -> Result<Vec<String>> {
        let out = self.run_ok(cwd, &["diff", "--cached", "--name-only"]).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Unstaged diffstat summary.
    pub async fn unstaged_summary(&self, cwd: &Path) -> Result<String> {
        let out = self.run_ok(cwd, &["diff", "--stat"]).await?;
        Ok(out.stdout)
    }

    /// Staged diffstat summary.
    pub async fn staged_summary(&self, cwd: &Path) -> Result<String> {
        let out = self.run_ok(cwd, &["diff", "--cached", "--stat"]).await?;
        Ok(out.stdout)
    }

    /// Full patch of one commit (`git show <sha>`).
    pub async fn show_patch(&self, cwd: &Path, sha: &str) -> Result<String> {
        let out = self.run_ok(cwd, &["show", sha]).await?;
        Ok(out.stdout)
    }

    /// Subject + body of one commit.
    pub async fn commit_message(&self, cwd: &Path, sha: &str) -> Result<String> {
        let out = self
            .run_ok(cwd, &["show", "-s", "--format=%B", sha])
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// `git push <remote> <branch>`. Git reports some push failures on a
    /// zero exit, so the output is also scanned for error markers.
    pub async fn push(&self, cwd: &Path, remote: &str, branch: &str) -> Result<()> {
        let out = self.run(cwd, &["push", remote, branch]).await?;
        let combined = out.combined();
        if !out.success() || combined.contains("error:") || combined.contains("fatal:") {
            return Err(Error::PushFailed(combined));
        }
        Ok(())
    }

    /// Best-effort `git push <remote> --delete <branch>`.
    pub async fn push_delete(&self, cwd: &Path, remote: &str, branch: &str) -> Result<bool> {
        let out = self.run(cwd, &["push", remote, "--delete", branch]).await?;
        Ok(out.success())
    }

    /// Best-effort `git remote prune <remote>`.
    pub async fn remote_prune(&self, cwd: &Path, remote: &str) -> Result<()> {
        let _ = self.run(cwd, &["remote", "prune", remote]).await?;
        Ok(())
    }

    /// Whether `sha` is reachable from the current branch
    /// (`git branch --contains <sha>`).
    pub async fn is_integrated(&self, cwd: &Path, sha: &str) -> Result<bool> {
        let out = self.run(cwd, &["branch", "--contains", sha]).await?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }

    /// Abort an in-progress cherry-pick, best effort.
    pub async fn cherry_pick_abort(&self, cwd: &Path) -> Result<()> {
        let _ = self.run(cwd, &["cherry-pick", "--abort"]).await?;
        Ok(())
    }
}

/// Build a [`Git`] over the system runner.
#[must_use]
pub fn system() -> Git<SystemGit> {
    Git::new(std::sync::Arc::new(SystemGit))
}

#[async_trait]
impl<R: GitRunner + ?Sized> GitRunner for Box<R> {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        self.as_ref().run(cwd, args).await
    }
}

#[async_trait]
impl<R: GitRunner + ?Sized> GitRunner for std::sync::Arc<R> {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        self.as_ref().run(cwd, args).await
    }
}
