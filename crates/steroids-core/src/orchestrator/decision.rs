//! Structured decisions parsed from coder and reviewer output.
//!
//! Provider output is free text; these classifiers turn it into closed
//! decision types with explicit confidence. All confidence arithmetic is
//! clamped to [0, 1].

use crate::provider::{ErrorKind, InvokeResult, ProviderError};
use crate::types::TaskStatus;

/// What the coder phase concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoderAction {
    /// Work committed; hand to review.
    Submit,
    /// Work present but uncommitted; stage, commit, then hand to review.
    StageCommitSubmit,
    /// Transient failure; run the coder again.
    Retry,
    /// Hard failure; see the error kind.
    Error,
}

/// Failure detail for [`CoderAction::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoderErrorKind {
    /// Exit zero but nothing changed.
    NoChanges,
    /// The invocation timed out.
    Timeout,
    /// Non-zero exit with no transient cause.
    InvalidState,
}

/// Structured coder decision.
#[derive(Debug, Clone)]
pub struct CoderDecision {
    /// Action to take.
    pub action: CoderAction,
    /// Status the task should move to if the action lands.
    pub next_status: TaskStatus,
    /// Classifier confidence.
    pub confidence: f64,
    /// Why this classification.
    pub reasoning: String,
    /// Failure detail for errors.
    pub error_kind: Option<CoderErrorKind>,
}

/// Git facts gathered around the coder invocation.
#[derive(Debug, Clone, Copy)]
pub struct GitDelta {
    /// Commits created during the invocation.
    pub new_commits: usize,
    /// Whether the working tree has uncommitted changes.
    pub uncommitted_changes: bool,
}

/// Classify the coder invocation into a decision.
#[must_use]
pub fn classify_coder_outcome(
    result: &InvokeResult,
    delta: GitDelta,
    classified: Option<&ProviderError>,
) -> CoderDecision {
    if result.timed_out {
        return CoderDecision {
            action: CoderAction::Error,
            next_status: TaskStatus::InProgress,
            confidence: 0.98,
            reasoning: "invocation hit the timeout".into(),
            error_kind: Some(CoderErrorKind::Timeout),
        };
    }

    if result.success {
        if delta.new_commits >= 1 && !delta.uncommitted_changes {
            return CoderDecision {
                action: CoderAction::Submit,
                next_status: TaskStatus::Review,
                confidence: 0.90,
                reasoning: format!("{} new commit(s), clean tree", delta.new_commits),
                error_kind: None,
            };
        }
        if delta.new_commits >= 1 {
            return CoderDecision {
                action: CoderAction::StageCommitSubmit,
                next_status: TaskStatus::Review,
                confidence: 0.82,
                reasoning: "commits plus uncommitted leftovers; auto-commit before review".into(),
                error_kind: None,
            };
        }
        if delta.uncommitted_changes {
            return CoderDecision {
                action: CoderAction::StageCommitSubmit,
                next_status: TaskStatus::Review,
                confidence: 0.75,
                reasoning: "changes left uncommitted; auto-commit before review".into(),
                error_kind: None,
            };
        }
        if already_done(&result.stdout) {
            return CoderDecision {
                action: CoderAction::Submit,
                next_status: TaskStatus::Review,
                confidence: 0.85,
                reasoning: "coder reports the work already exists".into(),
                error_kind: None,
            };
        }
        return CoderDecision {
            action: CoderAction::Error,
            next_status: TaskStatus::Failed,
            confidence: 0.90,
            reasoning: "exit 0 but no commits and no file changes".into(),
            error_kind: Some(CoderErrorKind::NoChanges),
        };
    }

    if let Some(err) = classified {
        if err.retryable
            && matches!(err.kind, ErrorKind::NetworkError | ErrorKind::RateLimit)
        {
            return CoderDecision {
                action: CoderAction::Retry,
                next_status: TaskStatus::InProgress,
                confidence: 0.80,
                reasoning: format!("transient provider failure: {}", err.message),
                error_kind: None,
            };
        }
    }

    CoderDecision {
        action: CoderAction::Error,
        next_status: TaskStatus::Failed,
        confidence: 0.70,
        reasoning: format!("exit {} with no transient cause", result.exit_code),
        error_kind: Some(CoderErrorKind::InvalidState),
    }
}

fn already_done(stdout: &str) -> bool {
    let lowered = stdout.to_lowercase();
    lowered.contains("already exists")
        || lowered.contains("already implemented")
        || lowered.contains("already complete")
        || lowered.contains("nothing to do")
}

/// What the reviewer phase concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    /// Approve; task completes.
    Approve,
    /// Reject back to the coder.
    Reject,
    /// Skip the task.
    Skip,
    /// Open a dispute.
    Dispute,
    /// Could not tell; reviewer runs again.
    Ambiguous,
}

/// Structured reviewer decision.
#[derive(Debug, Clone)]
pub struct ReviewDecision {
    /// Action to take.
    pub action: ReviewAction,
    /// Classifier confidence after adjustments, clamped to [0, 1].
    pub confidence: f64,
    /// Extracted feedback items (unchecked checkboxes, rejection notes).
    pub feedback: Vec<String>,
    /// Why this classification.
    pub reasoning: String,
}

/// Rejection count at which an approval earns a confidence bonus.
const HIGH_REJECTION_COUNT: u32 = 3;

/// Classify reviewer output.
///
/// Signals in descending confidence: explicit `steroids tasks ...`
/// commands, approval/rejection tokens, unchecked checkbox items. Multiple
/// agreeing signals add confidence, conflicting ones subtract, and a
/// decision reached only through checkbox fallback subtracts more.
#[must_use]
pub fn classify_review_output(output: &str, rejection_count: u32) -> ReviewDecision {
    let lowered = output.to_lowercase();

    let command = command_signal(&lowered);
    let token = token_signal(&lowered);
    let checkboxes = unchecked_items(output);
    let checkbox_signal = if checkboxes.is_empty() {
        None
    } else {
        Some(ReviewAction::Reject)
    };

    let (action, mut confidence, used_fallback, reasoning): (ReviewAction, f64, bool, String) = if let Some(action) = command {
        (action, 0.95, false, "explicit task command".to_string())
    } else if let Some(action) = token {
        (action, 0.85, false, "approval/rejection token".to_string())
    } else if let Some(action) = checkbox_signal {
        (
            action,
            0.88,
            true,
            format!("{} unchecked checklist item(s)", checkboxes.len()),
        )
    } else {
        (
            ReviewAction::Ambiguous,
            0.45,
            false,
            "no recognizable verdict".to_string(),
        )
    };

    let signals: Vec<ReviewAction> = [command, token, checkbox_signal]
        .into_iter()
        .flatten()
        .collect();
    if signals.len() > 1 {
        if signals.iter().all(|s| *s == signals[0]) {
            confidence += 0.05;
        } else {
            confidence -= 0.10;
        }
    }
    if used_fallback {
        confidence -= 0.15;
    }
    if action == ReviewAction::Approve && rejection_count >= HIGH_REJECTION_COUNT {
        confidence += 0.05;
    }
    let confidence = confidence.clamp(0.0, 1.0);

    let feedback = if action == ReviewAction::Reject {
        if checkboxes.is_empty() {
            extract_rejection_notes(output)
        } else {
            checkboxes
        }
    } else {
        Vec::new()
    };

    ReviewDecision {
        action,
        confidence,
        feedback,
        reasoning,
    }
}

fn command_signal(lowered: &str) -> Option<ReviewAction> {
    if lowered.contains("steroids tasks approve") {
        Some(ReviewAction::Approve)
    } else if lowered.contains("steroids tasks reject") {
        Some(ReviewAction::Reject)
    } else if lowered.contains("steroids tasks skip") {
        Some(ReviewAction::Skip)
    } else if lowered.contains("steroids tasks dispute") {
        Some(ReviewAction::Dispute)
    } else {
        None
    }
}

fn token_signal(lowered: &str) -> Option<ReviewAction> {
    let approve =
        lowered.contains("approved") || lowered.contains("lgtm") || lowered.contains("looks good");
    let reject = lowered.contains("rejected")
        || lowered.contains("needs changes")
        || lowered.contains("must fix");
    match (approve, reject) {
        (true, false) => Some(ReviewAction::Approve),
        // A rejection token always wins a mixed verdict.
        (_, true) => Some(ReviewAction::Reject),
        _ => None,
    }
}

fn unchecked_items(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .strip_prefix("- [ ]")
                .map(|rest| rest.trim().to_string())
        })
        .filter(|item| !item.is_empty())
        .collect()
}

fn extract_rejection_notes(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(5)
        .map(ToString::to_string)
        .collect()
}

/// Verdict for the merge conflict sub-loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictVerdict {
    /// Whether the resolution was approved.
    pub approve: bool,
    /// Reviewer notes.
    pub notes: String,
}

/// Parse the conflict reviewer's verdict.
///
/// `APPROVE` with no `REJECT` approves; any `REJECT` rejects; anything
/// else (including empty output) rejects conservatively.
#[must_use]
pub fn parse_review_decision(output: &str) -> ConflictVerdict {
    let upper = output.to_uppercase();
    let has_approve = upper.contains("APPROVE");
    let has_reject = upper.contains("REJECT");

    if has_reject {
        return ConflictVerdict {
            approve: false,
            notes: first_nonempty_line(output)
                .unwrap_or_else(|| "resolution rejected".to_string()),
        };
    }
    if has_approve {
        return ConflictVerdict {
            approve: true,
            notes: first_nonempty_line(output).unwrap_or_else(|| "approved".to_string()),
        };
    }
    ConflictVerdict {
        approve: false,
        notes: "reviewer verdict was ambiguous; rejecting conservatively".to_string(),
    }
}

fn first_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(success: bool, exit_code: i32, stdout: &str, timed_out: bool) -> InvokeResult {
        InvokeResult {
            success,
            exit_code,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::from_secs(1),
            timed_out,
            session_id: None,
            token_usage: None,
        }
    }

    #[test]
    fn test_clean_commit_submits() {
        let decision = classify_coder_outcome(
            &result(true, 0, "done", false),
            GitDelta {
                new_commits: 2,
                uncommitted_changes: false,
            },
            None,
        );
        assert_eq!(decision.action, CoderAction::Submit);
        assert_eq!(decision.next_status, TaskStatus::Review);
        assert!((decision.confidence - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dirty_tree_auto_commits() {
        let decision = classify_coder_outcome(
            &result(true, 0, "done", false),
            GitDelta {
                new_commits: 1,
                uncommitted_changes: true,
            },
            None,
        );
        assert_eq!(decision.action, CoderAction::StageCommitSubmit);
        assert!((decision.confidence - 0.82).abs() < f64::EPSILON);
    }

    #[test]
    fn test_already_exists_submits() {
        let decision = classify_coder_outcome(
            &result(true, 0, "That endpoint already exists in src/api.rs", false),
            GitDelta {
                new_commits: 0,
                uncommitted_changes: false,
            },
            None,
        );
        assert_eq!(decision.action, CoderAction::Submit);
        assert!((decision.confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_changes_is_an_error() {
        let decision = classify_coder_outcome(
            &result(true, 0, "I analyzed the problem.", false),
            GitDelta {
                new_commits: 0,
                uncommitted_changes: false,
            },
            None,
        );
        assert_eq!(decision.action, CoderAction::Error);
        assert_eq!(decision.error_kind, Some(CoderErrorKind::NoChanges));
    }

    #[test]
    fn test_timeout_is_high_confidence() {
        let decision = classify_coder_outcome(
            &result(false, -1, "", true),
            GitDelta {
                new_commits: 0,
                uncommitted_changes: false,
            },
            None,
        );
        assert_eq!(decision.error_kind, Some(CoderErrorKind::Timeout));
        assert!((decision.confidence - 0.98).abs() < f64::EPSILON);
    }

    #[test]
    fn test_transient_failure_retries() {
        let err = ProviderError::new(ErrorKind::NetworkError, "ECONNREFUSED");
        let decision = classify_coder_outcome(
            &result(false, 1, "", false),
            GitDelta {
                new_commits: 0,
                uncommitted_changes: false,
            },
            Some(&err),
        );
        assert_eq!(decision.action, CoderAction::Retry);
    }

    #[test]
    fn test_hard_failure_is_invalid_state() {
        let err = ProviderError::new(ErrorKind::AuthError, "401");
        let decision = classify_coder_outcome(
            &result(false, 1, "", false),
            GitDelta {
                new_commits: 0,
                uncommitted_changes: false,
            },
            Some(&err),
        );
        assert_eq!(decision.action, CoderAction::Error);
        assert_eq!(decision.error_kind, Some(CoderErrorKind::InvalidState));
    }

    #[test]
    fn test_explicit_command_wins() {
        let decision = classify_review_output("run `steroids tasks approve t-1` please", 0);
        assert_eq!(decision.action, ReviewAction::Approve);
        assert!((decision.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_tokens_classify() {
        let decision = classify_review_output("LGTM, ship it", 0);
        assert_eq!(decision.action, ReviewAction::Approve);

        let decision = classify_review_output("This needs changes before merge", 0);
        assert_eq!(decision.action, ReviewAction::Reject);
    }

    #[test]
    fn test_checkboxes_reject_with_feedback() {
        let output = "Review notes:\n- [x] tests pass\n- [ ] handle the empty case\n- [ ] update docs";
        let decision = classify_review_output(output, 0);
        assert_eq!(decision.action, ReviewAction::Reject);
        assert_eq!(decision.feedback.len(), 2);
        assert_eq!(decision.feedback[0], "handle the empty case");
        // 0.88 base, -0.15 fallback penalty.
        assert!((decision.confidence - 0.73).abs() < 1e-9);
    }

    #[test]
    fn test_conflicting_signals_lose_confidence() {
        // Approve token plus unchecked boxes: conflicting directions.
        let output = "APPROVED overall\n- [ ] one nit left";
        let decision = classify_review_output(output, 0);
        assert!((decision.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_high_rejection_approval_bonus() {
        let low = classify_review_output("APPROVED", 0);
        let high = classify_review_output("APPROVED", 5);
        assert!((high.confidence - low.confidence - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_ambiguous_output() {
        let decision = classify_review_output("The weather is nice today.", 0);
        assert_eq!(decision.action, ReviewAction::Ambiguous);
        assert!((decision.confidence - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_conflict_verdict_matrix() {
        assert!(parse_review_decision("APPROVE - conflict resolved").approve);
        assert!(!parse_review_decision("REJECT: resolution drops the null check").approve);
        assert!(!parse_review_decision("APPROVE the intent but REJECT this hunk").approve);
        let empty = parse_review_decision("");
        assert!(!empty.approve);
        assert!(!empty.notes.is_empty());
    }
}
