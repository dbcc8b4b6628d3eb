//! Gemini API client
//!
//! Direct HTTP client for the Gemini `generateContent` endpoint, mapped onto
//! the [`TextGenerator`] contract. HTTP statuses and transport failures are
//! translated into [`ProviderError`] variants here and nowhere else.

use crate::config::ProviderConfig;
use crate::provider::gemini_types::{
    ApiErrorEnvelope, GeminiApiRequest, GeminiApiResponse, GenerationConfig, RequestContent,
    RequestPart,
};
use crate::provider::{Generation, GenerationOptions, ProviderError, TextGenerator, TokenUsage};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use std::time::Duration;

const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini-backed text generator
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    request_timeout: Duration,
}

impl GeminiGenerator {
    /// Create a generator from provider configuration
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::with_base_url(
            &config.api_key,
            &config.model,
            &config.base_url,
            config.timeout(),
        )
    }

    /// Create a generator against the public Gemini endpoint
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_base_url(api_key, model, GEMINI_API_BASE_URL, Duration::from_secs(3))
    }

    /// Create a generator against a custom base URL (used in tests)
    pub fn with_base_url(
        api_key: &str,
        model: &str,
        base_url: &str,
        request_timeout: Duration,
    ) -> Self {
        // The orchestrator enforces its own deadline; this one only stops
        // abandoned connections from lingering.
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.request_timeout)
        } else if e.is_connect() {
            ProviderError::ServiceUnavailable(format!("Failed to reach Gemini API: {}", e))
        } else {
            ProviderError::Other(format!("Failed to send HTTP request to Gemini API: {}", e))
        }
    }
}

/// Map a non-success HTTP status onto the provider taxonomy
fn map_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|env| match env.error.status {
            Some(label) => format!("{} ({})", env.error.message, label),
            None => env.error.message,
        })
        .unwrap_or_else(|_| body.chars().take(200).collect());

    match status.as_u16() {
        401 | 403 => ProviderError::Auth(detail),
        408 | 504 => ProviderError::ServiceUnavailable(format!("gateway timeout: {}", detail)),
        429 => ProviderError::RateLimited {
            message: detail,
            retry_after,
        },
        500..=599 => ProviderError::ServiceUnavailable(format!("HTTP {}: {}", status, detail)),
        _ => ProviderError::Other(format!("HTTP {}: {}", status, detail)),
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Auth("API key is empty".to_string()));
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let request_body = GeminiApiRequest {
            contents: vec![RequestContent {
                role: "user".to_string(),
                parts: vec![RequestPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: options.max_output_tokens,
                temperature: options.temperature,
            },
        };

        tracing::debug!(
            model = %self.model,
            prompt_len = prompt.len(),
            "Calling Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());

            tracing::error!(
                status_code = status.as_u16(),
                error_body = %error_body,
                "Gemini API returned error status"
            );

            return Err(map_status(status, retry_after, &error_body));
        }

        let response_body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let parsed: GeminiApiResponse = serde_json::from_str(&response_body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse JSON response: {}", e))
        })?;

        if let Some(reason) = parsed
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_ref())
        {
            return Err(ProviderError::InvalidResponse(format!(
                "Gemini API blocked the prompt: {}",
                reason
            )));
        }

        let candidate = parsed.candidates.first().ok_or_else(|| {
            ProviderError::InvalidResponse("Gemini API response contains no candidates".into())
        })?;

        let content: String = candidate
            .content
            .as_ref()
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default();

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();

        tracing::debug!(
            response_len = content.len(),
            total_tokens = usage.total_tokens,
            finish_reason = ?candidate.finish_reason,
            "Received response from Gemini API"
        );

        Ok(Generation { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serial_test::serial;

    fn generator(base_url: &str) -> GeminiGenerator {
        GeminiGenerator::with_base_url(
            "test-key",
            "gemini-2.5-flash",
            base_url,
            Duration::from_secs(2),
        )
    }

    fn endpoint(server: &mut Server) -> mockito::Mock {
        server
            .mock("POST", "/models/gemini-2.5-flash:generateContent")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
    }

    #[tokio::test]
    async fn test_empty_api_key_is_auth_error() {
        let generator = GeminiGenerator::new("", "gemini-2.5-flash");
        let result = generator
            .generate("prompt", &GenerationOptions::default())
            .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_success_with_usage() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJsonString(
                r#"{"generationConfig": {"maxOutputTokens": 256}}"#.to_string(),
            ))
            .with_status(200)
            .with_body(
                r#"{
                    "candidates": [{
                        "content": {"parts": [{"text": "AWS Lambda best practices are..."}], "role": "model"},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 30, "totalTokenCount": 42}
                }"#,
            )
            .create_async()
            .await;

        let options = GenerationOptions {
            max_output_tokens: 256,
            temperature: 0.2,
        };
        let result = generator(&server.url()).generate("prompt", &options).await;

        mock.assert_async().await;
        let generation = result.unwrap();
        assert_eq!(generation.content, "AWS Lambda best practices are...");
        assert_eq!(generation.usage.total_tokens, 42);
        assert_eq!(generation.usage.prompt_tokens, 12);
    }

    #[tokio::test]
    #[serial]
    async fn test_candidate_without_parts_is_empty_success() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(200)
            .with_body(r#"{"candidates": [{"finishReason": "MAX_TOKENS"}]}"#)
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        assert_eq!(result.unwrap().content, "");
    }

    #[tokio::test]
    #[serial]
    async fn test_no_candidates_is_invalid_response() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(200)
            .with_body(r#"{"candidates": []}"#)
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_blocked_prompt_is_invalid_response() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(200)
            .with_body(r#"{"candidates": [], "promptFeedback": {"blockReason": "SAFETY"}}"#)
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        match result {
            Err(ProviderError::InvalidResponse(msg)) => assert!(msg.contains("blocked")),
            other => panic!("Expected InvalidResponse, got: {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_rate_limit_carries_retry_after() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(429)
            .with_header("retry-after", "2")
            .with_body(r#"{"error": {"message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#)
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        match result {
            Err(ProviderError::RateLimited {
                message,
                retry_after,
            }) => {
                assert!(message.contains("Quota exceeded"));
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("Expected RateLimited, got: {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_forbidden_is_auth() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(403)
            .with_body(r#"{"error": {"message": "Permission denied"}}"#)
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_server_error_is_service_unavailable() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ProviderError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_invalid_json_is_invalid_response() {
        let mut server = Server::new_async().await;
        let mock = endpoint(&mut server)
            .with_status(200)
            .with_body("This is not JSON")
            .create_async()
            .await;

        let result = generator(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await;

        mock.assert_async().await;
        match result {
            Err(ProviderError::InvalidResponse(msg)) => {
                assert!(msg.contains("Failed to parse JSON"))
            }
            other => panic!("Expected InvalidResponse, got: {:?}", other),
        }
    }

    #[test]
    fn test_map_status_table() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, None, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, None, "bad"),
            ProviderError::Other(_)
        ));
    }
}
