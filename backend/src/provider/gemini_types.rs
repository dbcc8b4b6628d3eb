//! Gemini API wire types
//!
//! Structs that mirror the Gemini `generateContent` JSON format.

use serde::{Deserialize, Serialize};

/// Top-level Gemini API response
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiApiResponse {
    /// List of candidate responses from the model
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Optional feedback about the prompt (e.g., if it was blocked)
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    /// Token accounting
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

/// A single candidate response from the model
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// The content of this candidate
    #[serde(default)]
    pub content: Option<Content>,
    /// Why the model stopped generating (if applicable)
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Content structure containing parts of the response
#[derive(Deserialize, Debug)]
pub struct Content {
    /// List of content parts (typically one text part)
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A single part of content
#[derive(Deserialize, Debug)]
pub struct Part {
    /// The text content of this part
    #[serde(default)]
    pub text: String,
}

/// Feedback about the prompt (e.g., if it was blocked)
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    /// Reason the prompt was blocked (if applicable)
    #[serde(default)]
    pub block_reason: Option<String>,
}

/// Token accounting reported by the API
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    /// Tokens in the prompt
    #[serde(default)]
    pub prompt_token_count: u32,
    /// Tokens across all candidates
    #[serde(default)]
    pub candidates_token_count: u32,
    /// Total tokens
    #[serde(default)]
    pub total_token_count: u32,
}

/// Request structure for the Gemini API
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiApiRequest {
    /// List of content items to send
    pub contents: Vec<RequestContent>,
    /// Generation configuration
    pub generation_config: GenerationConfig,
}

/// Content structure for requests
#[derive(Serialize, Debug)]
pub struct RequestContent {
    /// Role of the author ("user")
    pub role: String,
    /// List of content parts
    pub parts: Vec<RequestPart>,
}

/// A single part for requests
#[derive(Serialize, Debug)]
pub struct RequestPart {
    /// The text content
    pub text: String,
}

/// Generation configuration for requests
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Maximum output length
    pub max_output_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

/// Error envelope returned with non-2xx statuses
#[derive(Deserialize, Debug)]
pub struct ApiErrorEnvelope {
    /// Error body
    pub error: ApiErrorBody,
}

/// Error body
#[derive(Deserialize, Debug)]
pub struct ApiErrorBody {
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Status label, e.g. "RESOURCE_EXHAUSTED"
    #[serde(default)]
    pub status: Option<String>,
}
