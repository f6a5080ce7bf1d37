//! Prompt composition for the Developer and Acceptor roles.
//!
//! Prompts are sectioned markdown built from the project documents and the
//! current loop position. The verdict contract (ACCEPTED / REJECTED: reason
//! / ALL_FEATURES_COMPLETE with a Commits list) lives in the role system
//! prompts so every round can rely on it.

use anima_types::AgentRole;

const DEVELOPER_SYSTEM_PROMPT: &str = "\
You are the Developer agent of Anima, an autonomous iteration engine.

Your role:
- You receive a milestone description and implement ONE feature at a time.
- Analyze the current codebase state and decide which feature to implement next.
- Implement the feature: write code, write tests, run the project's lint,
  type, and test checks.
- If the checks fail, fix the issues before reporting.
- Commit your work on the current branch with a conventional commit message
  (feat:, fix:, refactor:, test:, docs:, chore:).

Rules:
- Do NOT ask questions unless a critical ambiguity blocks all progress.
- Make autonomous decisions on implementation details.
- Each response implements exactly ONE feature, then reports what was done
  and which commit contains it.
- When EVERY feature in the milestone is implemented and verified, respond
  with a line containing exactly ALL_FEATURES_COMPLETE, a short summary, and
  a line starting with 'Commits:' followed by the commit hashes, one per
  line. Only emit this signal when you are confident the milestone is done.";

const ACCEPTOR_SYSTEM_PROMPT: &str = "\
You are the Acceptor agent of Anima, an autonomous iteration engine.

Your role:
- Review feature implementations against the milestone acceptance criteria.
- Inspect the actual change with version-control commands (git show,
  git diff, git log); do not take the Developer's report on faith.
- Check: does the implementation satisfy the stated criterion?
- Check: is the code well-structured, and are obvious edge cases handled?

Response format:
- Reply with exactly ACCEPTED on its own line, or REJECTED: <reason> where
  the reason names which criterion failed and why.
- Keep the reason specific and actionable for the Developer.";

/// The role's standing system prompt.
pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Developer => DEVELOPER_SYSTEM_PROMPT,
        AgentRole::Acceptor => ACCEPTOR_SYSTEM_PROMPT,
    }
}

/// Everything injected into a developer round.
#[derive(Debug, Default)]
pub struct DeveloperContext<'a> {
    pub vision: Option<&'a str>,
    pub soul: Option<&'a str>,
    pub milestone_doc: &'a str,
    pub memory: Option<&'a str>,
    pub branch: &'a str,
    pub round: u32,
    /// Features already reported complete (commit subjects on the branch).
    pub completed: &'a [String],
    /// Most recent acceptor rejection, when this is a repair round.
    pub rejection: Option<&'a str>,
    /// Human guidance delivered while the project was paused.
    pub guidance: Option<&'a str>,
    /// The working tree has uncommitted changes that must be reconciled
    /// before new work starts.
    pub dirty_worktree: bool,
    /// This session resumes an interrupted run.
    pub recovery: Option<RecoveryContext<'a>>,
}

/// Extra context for a resumed session.
#[derive(Debug)]
pub struct RecoveryContext<'a> {
    pub iteration_count: u32,
    pub commits: &'a [String],
}

/// Compose the developer prompt for one round.
pub fn developer_round_prompt(ctx: &DeveloperContext<'_>) -> String {
    let mut sections = Vec::new();

    if let Some(v) = ctx.vision.filter(|s| !s.is_empty()) {
        sections.push(format!("## Project Vision\n{v}"));
    }
    if let Some(s) = ctx.soul.filter(|s| !s.is_empty()) {
        sections.push(format!("## Project Soul\n{s}"));
    }
    sections.push(format!("## Milestone\n{}", ctx.milestone_doc));
    if let Some(m) = ctx.memory.filter(|s| !s.is_empty()) {
        sections.push(format!("## Project Memory\n{m}"));
    }

    sections.push(format!(
        "## Position\nBranch: {}\nRound: {}",
        ctx.branch, ctx.round
    ));

    if !ctx.completed.is_empty() {
        let list = ctx
            .completed
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Already Completed\n{list}"));
    }

    if let Some(recovery) = &ctx.recovery {
        let commits = if recovery.commits.is_empty() {
            "(none yet)".to_string()
        } else {
            recovery
                .commits
                .iter()
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        sections.push(format!(
            "## Resumption\nThis session RESUMES an interrupted run. {} rounds were \
             already accepted. Commits on this branch so far:\n{commits}\n\
             Re-read the milestone and continue from where the work stopped; \
             do not redo completed features.",
            recovery.iteration_count
        ));
    }

    if ctx.dirty_worktree {
        sections.push(
            "## Worktree Reconciliation\nThe working tree has uncommitted changes \
             from an interrupted session. First inspect them with git status and \
             git diff, then either commit them (if coherent) or discard them, \
             before starting any new work."
                .to_string(),
        );
    }

    if let Some(reason) = ctx.rejection.filter(|s| !s.is_empty()) {
        sections.push(format!(
            "## Review Feedback\nYour previous implementation was REJECTED:\n{reason}\n\
             Fix the issues above, run the checks again, and commit."
        ));
    }

    if let Some(text) = ctx.guidance.filter(|s| !s.is_empty()) {
        sections.push(format!("## Human Guidance\n{text}"));
    }

    sections.push(
        "## Task\nImplement the next not-yet-done feature from the milestone, run the \
         project's lint/type/test checks, commit on the current branch, and report. \
         If all features are complete, respond with ALL_FEATURES_COMPLETE and the \
         commit list."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Compose the acceptor prompt for a per-round review of one commit.
pub fn acceptor_review_prompt(soul: Option<&str>, milestone_doc: &str, commit: &str) -> String {
    let mut sections = Vec::new();
    if let Some(s) = soul.filter(|s| !s.is_empty()) {
        sections.push(format!("## Project Soul\n{s}"));
    }
    sections.push(format!("## Acceptance Criteria\n{milestone_doc}"));
    sections.push(format!(
        "## Review\nThe Developer reports the feature is implemented in commit \
         {commit}. Inspect the actual change (git show {commit}) against the \
         criteria above and reply with exactly ACCEPTED or REJECTED: <reason \
         referencing which criterion failed>."
    ));
    sections.join("\n\n")
}

/// Compose the acceptor prompt for the final whole-milestone review.
pub fn acceptor_final_prompt(soul: Option<&str>, milestone_doc: &str, commits: &[String]) -> String {
    let mut sections = Vec::new();
    if let Some(s) = soul.filter(|s| !s.is_empty()) {
        sections.push(format!("## Project Soul\n{s}"));
    }
    sections.push(format!("## Acceptance Criteria\n{milestone_doc}"));

    let list = if commits.is_empty() {
        "(no commits)".to_string()
    } else {
        commits
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    sections.push(format!(
        "## Final Review\nThe Developer reports the ENTIRE milestone complete. \
         Commits since the milestone branched:\n{list}\n\
         Verify every acceptance criterion is satisfied by these commits and \
         reply with exactly ACCEPTED or REJECTED: <the missing criteria and why>."
    ));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompts_carry_verdict_contract() {
        let dev = system_prompt(AgentRole::Developer);
        assert!(dev.contains("ALL_FEATURES_COMPLETE"));
        assert!(dev.contains("Commits:"));
        assert!(dev.contains("ONE feature"));

        let acc = system_prompt(AgentRole::Acceptor);
        assert!(acc.contains("ACCEPTED"));
        assert!(acc.contains("REJECTED:"));
    }

    #[test]
    fn developer_prompt_section_order() {
        let completed = vec!["feat: parser".to_string()];
        let ctx = DeveloperContext {
            vision: Some("Build a great tool"),
            soul: Some("Small and sharp"),
            milestone_doc: "## M1\n- feature A",
            memory: Some("prefers rustfmt defaults"),
            branch: "milestone/m1",
            round: 3,
            completed: &completed,
            rejection: Some("criterion 2 unmet"),
            ..Default::default()
        };
        let prompt = developer_round_prompt(&ctx);

        let vision_pos = prompt.find("Project Vision").unwrap();
        let soul_pos = prompt.find("Project Soul").unwrap();
        let milestone_pos = prompt.find("## Milestone").unwrap();
        let memory_pos = prompt.find("Project Memory").unwrap();
        let position_pos = prompt.find("## Position").unwrap();
        let completed_pos = prompt.find("Already Completed").unwrap();
        let feedback_pos = prompt.find("Review Feedback").unwrap();

        assert!(vision_pos < soul_pos);
        assert!(soul_pos < milestone_pos);
        assert!(milestone_pos < memory_pos);
        assert!(memory_pos < position_pos);
        assert!(position_pos < completed_pos);
        assert!(completed_pos < feedback_pos);
        assert!(prompt.contains("Branch: milestone/m1"));
        assert!(prompt.contains("Round: 3"));
    }

    #[test]
    fn developer_prompt_omits_empty_sections() {
        let ctx = DeveloperContext {
            milestone_doc: "do the thing",
            branch: "milestone/m1",
            round: 1,
            ..Default::default()
        };
        let prompt = developer_round_prompt(&ctx);
        assert!(!prompt.contains("Project Vision"));
        assert!(!prompt.contains("Review Feedback"));
        assert!(!prompt.contains("Resumption"));
        assert!(prompt.contains("## Task"));
    }

    #[test]
    fn recovery_section_present_on_resume() {
        let commits = vec!["abc123 feat: first".to_string()];
        let ctx = DeveloperContext {
            milestone_doc: "doc",
            branch: "milestone/m1",
            round: 2,
            recovery: Some(RecoveryContext {
                iteration_count: 1,
                commits: &commits,
            }),
            dirty_worktree: true,
            ..Default::default()
        };
        let prompt = developer_round_prompt(&ctx);
        assert!(prompt.contains("RESUMES"));
        assert!(prompt.contains("abc123"));
        assert!(prompt.contains("Worktree Reconciliation"));
    }

    #[test]
    fn acceptor_review_references_commit() {
        let prompt = acceptor_review_prompt(Some("soul"), "criteria text", "deadbeef");
        assert!(prompt.contains("git show deadbeef"));
        assert!(prompt.contains("criteria text"));
        assert!(prompt.contains("exactly ACCEPTED or REJECTED:"));
    }

    #[test]
    fn final_prompt_lists_commits() {
        let commits = vec!["c1 feat: a".to_string(), "c2 feat: b".to_string()];
        let prompt = acceptor_final_prompt(None, "criteria", &commits);
        assert!(prompt.contains("- c1 feat: a"));
        assert!(prompt.contains("- c2 feat: b"));
        assert!(prompt.contains("ENTIRE milestone"));
    }
}
