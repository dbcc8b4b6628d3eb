//! Prompt construction
//!
//! Turns (client context, quick action, message) into the single prompt sent
//! to the provider.

use crate::chat::models::ClientContext;
use crate::fallback::templates::TemplateCategory;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Predefined intent labels offered as one-click prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickAction {
    /// Summarize the discussion so far
    Summarize,
    /// Propose concrete next steps
    NextSteps,
    /// Rough cost estimate
    CostEstimate,
    /// Security posture review
    SecurityReview,
    /// Migration plan outline
    MigrationPlan,
    /// Architecture review
    ArchitectureReview,
    /// Performance tuning suggestions
    PerformanceTuning,
}

impl QuickAction {
    /// All quick actions, in display order
    pub const ALL: [QuickAction; 7] = [
        QuickAction::Summarize,
        QuickAction::NextSteps,
        QuickAction::CostEstimate,
        QuickAction::SecurityReview,
        QuickAction::MigrationPlan,
        QuickAction::ArchitectureReview,
        QuickAction::PerformanceTuning,
    ];

    /// Wire label
    pub fn as_str(&self) -> &'static str {
        match self {
            QuickAction::Summarize => "summarize",
            QuickAction::NextSteps => "next_steps",
            QuickAction::CostEstimate => "cost_estimate",
            QuickAction::SecurityReview => "security_review",
            QuickAction::MigrationPlan => "migration_plan",
            QuickAction::ArchitectureReview => "architecture_review",
            QuickAction::PerformanceTuning => "performance_tuning",
        }
    }

    /// Parse a wire label; unknown labels yield `None`
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(label))
    }

    /// Instruction added to the prompt
    pub fn instruction(&self) -> &'static str {
        match self {
            QuickAction::Summarize => {
                "Summarize the key points of the request in a short bulleted list."
            }
            QuickAction::NextSteps => {
                "Recommend three to five concrete next steps with owners and rough timelines."
            }
            QuickAction::CostEstimate => {
                "Give an indicative cost range, list the main cost drivers, and name savings levers."
            }
            QuickAction::SecurityReview => {
                "Review the security posture: identity, data protection, network exposure, and monitoring."
            }
            QuickAction::MigrationPlan => {
                "Outline a phased migration plan with risks and rollback points for each phase."
            }
            QuickAction::ArchitectureReview => {
                "Assess the architecture for reliability and scalability, and call out single points of failure."
            }
            QuickAction::PerformanceTuning => {
                "Identify likely bottlenecks and the measurements needed to confirm them."
            }
        }
    }

    /// Fallback category this action prefers
    pub fn preferred_category(&self) -> TemplateCategory {
        match self {
            QuickAction::Summarize | QuickAction::NextSteps => TemplateCategory::General,
            QuickAction::CostEstimate => TemplateCategory::Cost,
            QuickAction::SecurityReview => TemplateCategory::Security,
            QuickAction::MigrationPlan => TemplateCategory::Migration,
            QuickAction::ArchitectureReview => TemplateCategory::Architecture,
            QuickAction::PerformanceTuning => TemplateCategory::Performance,
        }
    }
}

/// Build the provider prompt
///
/// # Arguments
/// * `content` - The user's message
/// * `context` - Client context (name, meeting type, metadata)
/// * `quick_action` - Optional intent that shapes the answer
///
/// # Returns
/// The complete prompt text
pub fn build_prompt(
    content: &str,
    context: &ClientContext,
    quick_action: Option<QuickAction>,
) -> String {
    let mut prompt = String::with_capacity(content.len() + 512);

    let _ = writeln!(
        prompt,
        "You are a senior cloud consultant assisting during a {} with {}.",
        context.display_meeting_type(),
        context.display_name()
    );
    prompt.push_str(
        "Answer professionally and concisely. Address the client by name where natural \
         and do not invent facts about their environment.\n",
    );

    if !context.metadata.is_empty() {
        prompt.push_str("\nKnown client details:\n");
        for (key, value) in &context.metadata {
            match value {
                serde_json::Value::String(s) => {
                    let _ = writeln!(prompt, "- {}: {}", key, s);
                }
                other => {
                    let _ = writeln!(prompt, "- {}: {}", key, other);
                }
            }
        }
    }

    if let Some(action) = quick_action {
        let _ = writeln!(prompt, "\nTask: {}", action.instruction());
    }

    let _ = write!(prompt, "\nClient message:\n{}", content.trim());
    prompt
}
