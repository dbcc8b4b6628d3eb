//! Fallback orchestration
//!
//! - [`prompt`]: quick actions and prompt construction
//! - [`templates`]: categorized fallback templates and their selection
//! - [`orchestrator`]: the cache → provider → template pipeline

pub mod orchestrator;
pub mod prompt;
pub mod templates;

pub use orchestrator::{
    FallbackOrchestrator, OrchestratedResponse, OrchestratorSettings, MINIMAL_RESPONSE,
};
pub use prompt::{build_prompt, QuickAction};
pub use templates::{FallbackTemplate, TemplateCatalog, TemplateCategory};
