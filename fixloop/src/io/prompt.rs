//! Prompt builders for each agent role.

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{AgentRole, ReviewPayload};

const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const FIXER_TEMPLATE: &str = include_str!("prompts/fixer.md");
const SIMPLIFIER_TEMPLATE: &str = include_str!("prompts/simplifier.md");
const REMINDER_TEMPLATE: &str = include_str!("prompts/reminder.md");

/// Prompt text for every role the engine invokes.
pub trait Prompts {
    fn reviewer(&self, iteration: u32) -> Result<String>;
    fn fixer(&self, iteration: u32, review: &ReviewPayload) -> Result<String>;
    fn simplifier(&self) -> Result<String>;
    /// Appended to the original prompt when the agent's summary could not be parsed.
    fn retry_reminder(&self, role: AgentRole, reason: &str) -> Result<String>;
}

/// [`Prompts`] rendered from the embedded minijinja templates.
pub struct TemplatePrompts {
    env: Environment<'static>,
    project_path: String,
    branch: String,
}

impl TemplatePrompts {
    pub fn new(project_path: impl Into<String>, branch: impl Into<String>) -> Self {
        let mut env = Environment::new();
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        env.add_template("fixer", FIXER_TEMPLATE)
            .expect("fixer template should be valid");
        env.add_template("simplifier", SIMPLIFIER_TEMPLATE)
            .expect("simplifier template should be valid");
        env.add_template("reminder", REMINDER_TEMPLATE)
            .expect("reminder template should be valid");
        Self {
            env,
            project_path: project_path.into(),
            branch: branch.into(),
        }
    }
}

impl Prompts for TemplatePrompts {
    fn reviewer(&self, iteration: u32) -> Result<String> {
        let template = self.env.get_template("reviewer")?;
        let rendered = template.render(context! {
            project_path => &self.project_path,
            branch => &self.branch,
            iteration => iteration,
        })?;
        Ok(rendered)
    }

    fn fixer(&self, iteration: u32, review: &ReviewPayload) -> Result<String> {
        let (findings, raw_review) = match review {
            ReviewPayload::Structured(summary) => (summary.findings.clone(), None),
            ReviewPayload::Raw { text } => (Vec::new(), Some(text.trim())),
        };
        debug!(findings = findings.len(), raw = raw_review.is_some(), "rendering fixer prompt");
        let template = self.env.get_template("fixer")?;
        let rendered = template.render(context! {
            project_path => &self.project_path,
            branch => &self.branch,
            iteration => iteration,
            findings => findings,
            raw_review => raw_review.filter(|text| !text.is_empty()),
        })?;
        Ok(rendered)
    }

    fn simplifier(&self) -> Result<String> {
        let template = self.env.get_template("simplifier")?;
        let rendered = template.render(context! {
            project_path => &self.project_path,
            branch => &self.branch,
        })?;
        Ok(rendered)
    }

    fn retry_reminder(&self, role: AgentRole, reason: &str) -> Result<String> {
        let summary_name = match role {
            AgentRole::Reviewer => "review summary",
            AgentRole::Fixer => "fix summary",
            AgentRole::Simplifier => "summary",
        };
        let template = self.env.get_template("reminder")?;
        let rendered = template.render(context! {
            reason => reason.trim(),
            summary_name => summary_name,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Priority, ReviewFinding, ReviewSummary};

    fn prompts() -> TemplatePrompts {
        TemplatePrompts::new("/srv/app", "feature/login")
    }

    #[test]
    fn reviewer_prompt_names_project_and_branch() {
        let first = prompts().reviewer(1).expect("render");
        assert!(first.contains("`/srv/app`"));
        assert!(first.contains("`feature/login`"));
        assert!(!first.contains("review pass"));
        assert!(prompts().reviewer(3).expect("render").contains("review pass 3"));
    }

    #[test]
    fn fixer_prompt_numbers_structured_findings() {
        let review = ReviewPayload::Structured(ReviewSummary {
            findings: vec![ReviewFinding {
                title: "unchecked index".to_string(),
                body: "panics on empty input".to_string(),
                priority: Priority::P1,
                confidence_score: Some(0.9),
                file: Some("src/parse.rs".to_string()),
                line_start: Some(42),
                line_end: None,
            }],
            overall_correctness: None,
            explanation: None,
        });
        let prompt = prompts().fixer(2, &review).expect("render");
        assert!(prompt.contains("1. [P1] unchecked index (src/parse.rs:42)"), "{prompt}");
        assert!(prompt.contains("panics on empty input"));
        assert!(prompt.contains("\"stop_iteration\""));
    }

    #[test]
    fn fixer_prompt_embeds_raw_review() {
        let review = ReviewPayload::Raw {
            text: "  the loop never terminates  ".to_string(),
        };
        let prompt = prompts().fixer(1, &review).expect("render");
        assert!(prompt.contains("did not produce a structured summary"));
        assert!(prompt.contains("the loop never terminates"));
    }

    #[test]
    fn reminder_carries_reason() {
        let reminder = prompts()
            .retry_reminder(AgentRole::Fixer, "no JSON block or object found")
            .expect("render");
        assert!(reminder.contains("no JSON block or object found"));
        assert!(reminder.contains("fix summary"));
    }
}
