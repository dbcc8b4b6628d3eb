//! Fallback templates
//!
//! Pre-authored answers served when the provider cannot produce one. Each
//! template belongs to a category, carries a priority, and lists the keywords
//! that make it relevant. Bodies reference context variables as
//! `{client_name}`, `{meeting_type}`, or `{<metadata key>}`.

use crate::chat::models::ClientContext;
use crate::fallback::prompt::QuickAction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Priority added to the category a quick action prefers
pub const QUICK_ACTION_BOOST: u32 = 50;

/// Template category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    /// Identity, data protection, threat exposure
    Security,
    /// Spend, pricing, optimization
    Cost,
    /// Moving workloads between platforms
    Migration,
    /// System design and reliability
    Architecture,
    /// Latency, throughput, scaling
    Performance,
    /// Regulatory and audit requirements
    Compliance,
    /// Catch-all
    General,
}

impl TemplateCategory {
    /// Label used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Security => "security",
            TemplateCategory::Cost => "cost",
            TemplateCategory::Migration => "migration",
            TemplateCategory::Architecture => "architecture",
            TemplateCategory::Performance => "performance",
            TemplateCategory::Compliance => "compliance",
            TemplateCategory::General => "general",
        }
    }
}

/// Errors raised while rendering a template
#[derive(Error, Debug, PartialEq)]
pub enum TemplateError {
    /// The rendered body was blank
    #[error("Template '{0}' rendered to an empty response")]
    EmptyRender(&'static str),
}

/// A parameterized fallback answer
#[derive(Debug, Clone)]
pub struct FallbackTemplate {
    /// Category the template answers
    pub category: TemplateCategory,
    /// Body with `{variable}` placeholders
    pub body: String,
    /// Higher wins when several templates match
    pub priority: u32,
    /// Lowercase keywords, punctuation folded to single spaces; multi-word
    /// keywords match as phrases
    pub keywords: Vec<String>,
}

/// Keyword words up to this many characters only match whole words
pub const PREFIX_MATCH_MIN_LEN: usize = 4;

fn split_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn word_matches(word: &str, keyword: &str) -> bool {
    if keyword.chars().count() <= PREFIX_MATCH_MIN_LEN {
        word == keyword
    } else {
        word.starts_with(keyword)
    }
}

impl FallbackTemplate {
    /// Create a template
    pub fn new(
        category: TemplateCategory,
        priority: u32,
        keywords: &[&str],
        body: impl Into<String>,
    ) -> Self {
        Self {
            category,
            body: body.into(),
            priority,
            keywords: keywords.iter().map(|k| split_words(k).join(" ")).collect(),
        }
    }

    /// Number of keywords present in `content`
    ///
    /// Keywords match word by word, phrases as consecutive words. A keyword
    /// word longer than [`PREFIX_MATCH_MIN_LEN`] also matches as a prefix
    /// ("migration" matches "migrations"); shorter ones must match the whole
    /// word ("soc" does not match "social").
    pub fn keyword_overlap(&self, content: &str) -> usize {
        let words = split_words(content);

        self.keywords
            .iter()
            .filter(|keyword| {
                let wanted: Vec<&str> = keyword.split(' ').collect();
                words.windows(wanted.len()).any(|window| {
                    window
                        .iter()
                        .zip(&wanted)
                        .all(|(word, want)| word_matches(word, want))
                })
            })
            .count()
    }

    /// Substitute context variables into the body
    ///
    /// Unknown placeholders are left as written.
    pub fn render(&self, context: &ClientContext) -> Result<String, TemplateError> {
        let mut rendered = self
            .body
            .replace("{client_name}", context.display_name())
            .replace("{meeting_type}", context.display_meeting_type());

        for (key, value) in &context.metadata {
            let placeholder = format!("{{{}}}", key);
            if rendered.contains(&placeholder) {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&placeholder, &text);
            }
        }

        let rendered = rendered.trim().to_string();
        if rendered.is_empty() {
            return Err(TemplateError::EmptyRender(self.category.as_str()));
        }
        Ok(rendered)
    }
}

/// The set of templates the orchestrator chooses from
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: Vec<FallbackTemplate>,
    general: FallbackTemplate,
}

impl TemplateCatalog {
    /// Build a catalog from category templates plus the general template
    pub fn new(templates: Vec<FallbackTemplate>, general: FallbackTemplate) -> Self {
        Self { templates, general }
    }

    /// The built-in consulting catalog
    pub fn standard() -> Self {
        let templates = vec![
            FallbackTemplate::new(
                TemplateCategory::Security,
                90,
                &[
                    "security", "secure", "iam", "identity", "encryption", "encrypt",
                    "breach", "vulnerability", "firewall", "access control", "zero trust",
                ],
                "Thank you for raising security, {client_name}. While we prepare a detailed \
                 answer, these are the areas we review first in every {meeting_type}:\n\n\
                 1. Identity and access: enforce least privilege, require MFA for all \
                 administrative accounts, and remove long-lived credentials.\n\
                 2. Data protection: encrypt data at rest and in transit, and confirm key \
                 ownership and rotation.\n\
                 3. Network exposure: inventory public endpoints and place workloads behind \
                 private networking where possible.\n\
                 4. Detection: centralize audit logs and alert on privilege changes.\n\n\
                 Your consultant will follow up with recommendations specific to your \
                 environment.",
            ),
            FallbackTemplate::new(
                TemplateCategory::Compliance,
                85,
                &[
                    "compliance", "compliant", "gdpr", "hipaa", "soc", "soc2", "pci", "audit",
                    "regulation", "regulatory", "data residency",
                ],
                "Compliance questions deserve a precise answer, {client_name}, so we will \
                 confirm the details with your consultant. In the meantime:\n\n\
                 1. List the frameworks in scope and the systems that hold regulated data.\n\
                 2. Map each control to an owner and the evidence that demonstrates it.\n\
                 3. Check data residency and retention requirements against current \
                 storage locations.\n\n\
                 We will review the gaps together in the next {meeting_type}.",
            ),
            FallbackTemplate::new(
                TemplateCategory::Cost,
                80,
                &[
                    "cost", "costs", "price", "pricing", "budget", "spend", "billing",
                    "savings", "expensive", "reserved instances",
                ],
                "Good question on cost, {client_name}. A reliable estimate depends on your \
                 usage profile, so here is how we approach it:\n\n\
                 1. Baseline current spend by service and environment.\n\
                 2. Right-size compute and storage against measured utilization.\n\
                 3. Commit steady workloads to reserved capacity or savings plans.\n\
                 4. Set budgets and anomaly alerts per team.\n\n\
                 Share recent billing data and we will turn this into concrete numbers.",
            ),
            FallbackTemplate::new(
                TemplateCategory::Migration,
                75,
                &[
                    "migration", "migrate", "move", "lift and shift", "replatform",
                    "rehost", "cutover", "legacy", "on-prem", "on premises",
                ],
                "Thanks for the migration question, {client_name}. Successful migrations \
                 follow a phased approach:\n\n\
                 1. Discover: inventory applications, dependencies, and data volumes.\n\
                 2. Plan: group workloads into waves and choose rehost, replatform, or \
                 refactor per application.\n\
                 3. Pilot: migrate a low-risk workload end to end and validate rollback.\n\
                 4. Execute: run the waves with defined cutover windows.\n\n\
                 We can outline your first wave during the next {meeting_type}.",
            ),
            FallbackTemplate::new(
                TemplateCategory::Architecture,
                70,
                &[
                    "architecture", "design", "microservices", "serverless", "lambda",
                    "kubernetes", "availability", "resilience", "disaster recovery",
                    "scalability",
                ],
                "Thanks, {client_name}. For architecture questions we look at a few \
                 fundamentals first:\n\n\
                 1. Failure domains: spread critical components across zones and remove \
                 single points of failure.\n\
                 2. Statelessness: keep compute stateless so it can scale and recover \
                 independently.\n\
                 3. Managed services: prefer them where they reduce operational load.\n\
                 4. Recovery objectives: agree RTO and RPO targets and test against them.\n\n\
                 Your consultant will review your design in detail.",
            ),
            FallbackTemplate::new(
                TemplateCategory::Performance,
                65,
                &[
                    "performance", "latency", "slow", "throughput", "bottleneck",
                    "scaling", "autoscaling", "caching", "load",
                ],
                "Performance tuning starts with measurement, {client_name}:\n\n\
                 1. Capture latency percentiles and error rates for the critical paths.\n\
                 2. Find the saturated resource (CPU, memory, I/O, or a downstream \
                 dependency).\n\
                 3. Add caching and autoscaling where the data supports it.\n\n\
                 Send us your current metrics and we will pinpoint the bottleneck.",
            ),
        ];

        let general = FallbackTemplate::new(
            TemplateCategory::General,
            0,
            &[],
            "Thank you for your question, {client_name}. Our assistant is briefly \
             unavailable, so your consultant will follow up with a complete answer. In the \
             meantime, it helps to note your goals, current constraints, and timeline so \
             we can make the most of the {meeting_type}.",
        );

        Self::new(templates, general)
    }

    /// Category templates in catalog order
    pub fn templates(&self) -> &[FallbackTemplate] {
        &self.templates
    }

    /// The template used when nothing matches
    pub fn general(&self) -> &FallbackTemplate {
        &self.general
    }

    /// Pick the template for a message
    ///
    /// Candidates are templates with at least one keyword present, plus the
    /// quick action's preferred category. The highest effective priority wins
    /// (the preferred category gets [`QUICK_ACTION_BOOST`]); ties go to the
    /// larger keyword overlap, then to catalog order. No candidate means the
    /// general template.
    pub fn select(&self, content: &str, quick_action: Option<QuickAction>) -> &FallbackTemplate {
        let preferred = quick_action.map(|a| a.preferred_category());

        let mut best: Option<(&FallbackTemplate, u32, usize)> = None;
        for template in &self.templates {
            let overlap = template.keyword_overlap(content);
            let is_preferred = preferred == Some(template.category);
            if overlap == 0 && !is_preferred {
                continue;
            }

            let effective = if is_preferred {
                template.priority + QUICK_ACTION_BOOST
            } else {
                template.priority
            };

            let better = match best {
                None => true,
                Some((_, best_priority, best_overlap)) => {
                    effective > best_priority
                        || (effective == best_priority && overlap > best_overlap)
                }
            };
            if better {
                best = Some((template, effective, overlap));
            }
        }

        best.map(|(template, _, _)| template)
            .unwrap_or(&self.general)
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
