//! Text-generation provider
//!
//! The generative model is an opaque remote capability. Everything the chat
//! core needs from it is the [`TextGenerator`] contract; the Gemini HTTP
//! client is the production implementation and tests plug in doubles.

pub mod error;
pub mod gemini;
pub mod gemini_types;

pub use crate::chat::models::TokenUsage;
pub use error::{classify, ErrorClassification, ErrorKind, ProviderError};
pub use gemini::GeminiGenerator;

use async_trait::async_trait;

/// Sampling options passed with every prompt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    /// Maximum output length in tokens
    pub max_output_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: 1_024,
            temperature: 0.4,
        }
    }
}

/// A successful generation
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Generated text (may be empty; the caller decides what that means)
    pub content: String,
    /// Token accounting reported by the provider
    pub usage: TokenUsage,
}

/// Capability to turn a prompt into text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError>;
}
