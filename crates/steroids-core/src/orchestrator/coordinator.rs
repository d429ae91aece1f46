//! Coordinator escalation for repeatedly rejected tasks.
//!
//! At rejection counts {2, 5, 9} an out-of-band coordinator invocation
//! reviews the full rejection history and injects guidance into subsequent
//! coder and reviewer prompts. At 15 the task fails hard and a system
//! dispute records the termination.

/// Rejection counts that trigger a coordinator pass.
pub const COORDINATOR_CHECKPOINTS: [u32; 3] = [2, 5, 9];

/// Rejection count at which the task transitions to `failed`.
pub const REJECTION_LIMIT: u32 = 15;

/// What the coordinator decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Give the coder concrete direction.
    GuideCoder,
    /// The reviewer's bar is wrong; overrule it.
    OverrideReviewer,
    /// Shrink the task to something passable.
    NarrowScope,
}

impl CoordinatorAction {
    /// String form used in audit notes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuideCoder => "guide_coder",
            Self::OverrideReviewer => "override_reviewer",
            Self::NarrowScope => "narrow_scope",
        }
    }
}

/// Guidance produced by a coordinator pass, injected into both prompts.
#[derive(Debug, Clone)]
pub struct CoordinatorGuidance {
    /// The chosen action.
    pub action: CoordinatorAction,
    /// Free-text guidance.
    pub guidance: String,
}

/// Whether this rejection count triggers a coordinator pass.
#[must_use]
pub fn is_checkpoint(rejection_count: u32) -> bool {
    COORDINATOR_CHECKPOINTS.contains(&rejection_count)
}

/// Parse the coordinator's reply. The first recognized keyword wins;
/// unrecognized output falls back to coder guidance with the raw text.
#[must_use]
pub fn parse_coordinator_output(output: &str) -> CoordinatorGuidance {
    let lowered = output.to_lowercase();
    let action = if lowered.contains("override_reviewer") || lowered.contains("override reviewer") {
        CoordinatorAction::OverrideReviewer
    } else if lowered.contains("narrow_scope") || lowered.contains("narrow scope") {
        CoordinatorAction::NarrowScope
    } else {
        CoordinatorAction::GuideCoder
    };

    let guidance = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .skip_while(|l| {
            let lowered = l.to_lowercase();
            lowered.starts_with("guide_coder")
                || lowered.starts_with("override_reviewer")
                || lowered.starts_with("narrow_scope")
        })
        .collect::<Vec<_>>()
        .join("\n");

    CoordinatorGuidance {
        action,
        guidance: if guidance.is_empty() {
            output.trim().to_string()
        } else {
            guidance
        },
    }
}
