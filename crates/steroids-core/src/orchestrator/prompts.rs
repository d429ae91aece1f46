//! Prompt assembly for coder, reviewer, and coordinator invocations.

use std::fmt::Write as _;

use regex::Regex;

use crate::store::{RejectionEntry, Task};

/// AGENTS.md is truncated to this many characters.
pub const AGENTS_MD_LIMIT: usize = 5_000;

/// Linked specification files are truncated to this many characters.
pub const SPEC_LIMIT: usize = 10_000;

/// Repeated rejection titles at or above this count trigger the
/// pattern-detected section.
const PATTERN_THRESHOLD: usize = 3;

/// Truncate at a char boundary, marking the cut.
#[must_use]
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... truncated ...]", &text[..end])
}

/// Extract file-scope hints: path-shaped tokens in the title and spec.
#[must_use]
pub fn file_scope_hints(title: &str, spec: &str) -> Vec<String> {
    let Ok(re) = Regex::new(
        r"\b(?:src|lib|test|tests|spec|scripts|config|docs|crates|cmd|pkg|internal|app)/[\w\-./]+\.\w+",
    ) else {
        return Vec::new();
    };
    let mut hints: Vec<String> = Vec::new();
    for text in [title, spec] {
        for m in re.find_iter(text) {
            let hint = m.as_str().to_string();
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        }
    }
    hints
}

/// The first line of a rejection's notes, as its display title.
fn rejection_title(entry: &RejectionEntry) -> String {
    entry
        .notes
        .as_deref()
        .and_then(|n| n.lines().find(|l| !l.trim().is_empty()))
        .unwrap_or("(no notes)")
        .trim()
        .to_string()
}

/// Detect ≥3 rejections sharing a title: the coder is looping.
fn detect_pattern(rejections: &[RejectionEntry]) -> Option<String> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for entry in rejections {
        *counts.entry(rejection_title(entry)).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n >= PATTERN_THRESHOLD)
        .max_by_key(|(_, n)| *n)
        .map(|(title, n)| format!("'{title}' ({n} times)"))
}

/// Build the coder prompt.
#[must_use]
pub fn coder_prompt(
    task: &Task,
    rejections: &[RejectionEntry],
    guidance: Option<&str>,
    agents_md: Option<&str>,
    spec_text: Option<&str>,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Task: {}", task.title);
    let _ = writeln!(prompt, "Task id: {}", task.id);
    let _ = writeln!(prompt, "Previous status: {}", task.status.as_str());
    let _ = writeln!(prompt, "Rejection count: {}", task.rejection_count);

    if !rejections.is_empty() {
        let _ = writeln!(prompt, "\n## Rejection history");
        for entry in rejections {
            let _ = writeln!(prompt, "- #{}: {}", entry.ordinal, rejection_title(entry));
        }
        let _ = writeln!(prompt, "\n### Most recent rejections in full");
        for entry in rejections.iter().rev().take(3).rev() {
            let _ = writeln!(
                prompt,
                "#### Rejection {} by {} ({})",
                entry.ordinal,
                entry.actor,
                entry.created_at.to_rfc3339()
            );
            if let Some(commit) = &entry.commit_sha {
                let _ = writeln!(prompt, "Commit: {commit}");
            }
            let _ = writeln!(prompt, "{}", entry.notes.as_deref().unwrap_or("(no notes)"));
        }
        if let Some(pattern) = detect_pattern(rejections) {
            let _ = writeln!(
                prompt,
                "\n## Pattern detected\nThe same feedback has recurred: {pattern}. \
                 Resubmitting the same approach is unlikely to pass. If you believe \
                 the feedback is wrong, open a dispute instead of resubmitting."
            );
        }
    }

    if let Some(guidance) = guidance {
        let _ = writeln!(prompt, "\n## Coordinator guidance\n{guidance}");
    }
    if let Some(agents_md) = agents_md {
        let _ = writeln!(
            prompt,
            "\n## Project conventions (AGENTS.md)\n{}",
            truncate_chars(agents_md, AGENTS_MD_LIMIT)
        );
    }
    if let Some(spec) = spec_text {
        let _ = writeln!(
            prompt,
            "\n## Specification\n{}",
            truncate_chars(spec, SPEC_LIMIT)
        );
    }

    let hints = file_scope_hints(&task.title, spec_text.unwrap_or(""));
    if !hints.is_empty() {
        let _ = writeln!(prompt, "\n## Likely file scope");
        for hint in hints {
            let _ = writeln!(prompt, "- {hint}");
        }
    }

    let _ = writeln!(
        prompt,
        "\n## Instructions\nImplement the task in this repository. Commit your work \
         with a conventional-commits message (`<type>: <message>`) when done. \
         If the work already exists, say so explicitly."
    );
    prompt
}

/// Build the reviewer prompt.
#[must_use]
pub fn reviewer_prompt(
    task: &Task,
    spec_text: Option<&str>,
    guidance: Option<&str>,
    commit_sha: &str,
    diff: &str,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Review: {}", task.title);
    let _ = writeln!(prompt, "Task id: {}", task.id);
    let _ = writeln!(prompt, "Rejection count: {}", task.rejection_count);
    let _ = writeln!(prompt, "Commit under review: {commit_sha}");

    if let Some(guidance) = guidance {
        let _ = writeln!(prompt, "\n## Coordinator guidance\n{guidance}");
    }
    if let Some(spec) = spec_text {
        let _ = writeln!(
            prompt,
            "\n## Specification\n{}",
            truncate_chars(spec, SPEC_LIMIT)
        );
    }
    let _ = writeln!(prompt, "\n## Diff\n```diff\n{diff}\n```");
    let _ = writeln!(
        prompt,
        "\n## Instructions\nRespond APPROVED if the work satisfies the task, or \
         REJECTED with a checklist of required fixes (`- [ ] item`). You may also \
         run `steroids tasks approve|reject|skip|dispute <id>` explicitly."
    );
    prompt
}

/// Build the coordinator prompt for a rejection-escalated task.
#[must_use]
pub fn coordinator_prompt(task: &Task, rejections: &[RejectionEntry]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Coordination pass: {}", task.title);
    let _ = writeln!(
        prompt,
        "The task has been rejected {} times. Full history follows.",
        task.rejection_count
    );
    for entry in rejections {
        let _ = writeln!(
            prompt,
            "\n## Rejection {} by {}\n{}",
            entry.ordinal,
            entry.actor,
            entry.notes.as_deref().unwrap_or("(no notes)")
        );
    }
    let _ = writeln!(
        prompt,
        "\n## Instructions\nDecide one of: GUIDE_CODER (give the coder concrete \
         direction), OVERRIDE_REVIEWER (the reviewer is wrong; say why), or \
         NARROW_SCOPE (shrink the task to something passable). Start your reply \
         with the chosen word, then the guidance text."
    );
    prompt
}

/// Build the conflict-resolution coder prompt for the merge engine.
#[must_use]
pub fn conflict_coder_prompt(
    workstream_id: &str,
    branch: &str,
    sha: &str,
    commit_message: &str,
    conflicted_files: &[String],
    patch: &str,
) -> String {
    let short = &sha[..sha.len().min(12)];
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Resolve cherry-pick conflict");
    let _ = writeln!(prompt, "Workstream: {workstream_id} (branch {branch})");
    let _ = writeln!(prompt, "Commit: {short}\nMessage: {commit_message}");
    let _ = writeln!(prompt, "\n## Conflicted files");
    for file in conflicted_files {
        let _ = writeln!(prompt, "- {file}");
    }
    let _ = writeln!(prompt, "\n## Original patch\n```diff\n{patch}\n```");
    let _ = writeln!(
        prompt,
        "\n## Instructions\nEdit the conflicted files to resolve every marker, \
         preserving the intent of the original patch, then stage them with \
         `git add`. Do NOT commit; the merge engine continues the cherry-pick."
    );
    prompt
}

/// Build the conflict-resolution reviewer prompt.
#[must_use]
pub fn conflict_reviewer_prompt(staged_files: &[String], staged_diff: &str) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Review conflict resolution");
    let _ = writeln!(prompt, "## Staged files");
    for file in staged_files {
        let _ = writeln!(prompt, "- {file}");
    }
    let _ = writeln!(prompt, "\n## Staged diff\n```diff\n{staged_diff}\n```");
    let _ = writeln!(
        prompt,
        "\n## Instructions\nReply APPROVE if the resolution is correct and complete, \
         or REJECT with what is wrong."
    );
    prompt
}
