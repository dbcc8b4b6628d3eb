//! Fallback orchestrator
//!
//! Guarantees every inbound message gets a non-empty, professional answer:
//! cache first, then the provider (with at most one retry for transient
//! failures), then a fallback template, then a hard-coded minimal response.

use crate::cache::{CacheLookup, ResponseCache};
use crate::chat::models::{ClientContext, ResponseSource, TokenUsage};
use crate::config::ProviderConfig;
use crate::fallback::prompt::{build_prompt, QuickAction};
use crate::fallback::templates::TemplateCatalog;
use crate::monitor::PerformanceMonitor;
use crate::provider::{
    classify, ErrorKind, Generation, GenerationOptions, ProviderError, TextGenerator,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Provider attempts per message (the first call plus one retry)
const MAX_PROVIDER_ATTEMPTS: u32 = 2;

/// Served when even template rendering fails
pub const MINIMAL_RESPONSE: &str = "Thank you for your message. Our assistant is temporarily \
     unavailable, and your consultant will follow up with a complete answer shortly.";

/// Timing and sampling settings for provider calls
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Hard deadline for one provider call
    pub provider_timeout: Duration,
    /// Options passed with every prompt
    pub generation: GenerationOptions,
    /// Upper bound for the sleep before the retry
    pub max_retry_backoff: Duration,
}

impl From<&ProviderConfig> for OrchestratorSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            provider_timeout: config.timeout(),
            generation: GenerationOptions {
                max_output_tokens: config.max_output_tokens,
                temperature: config.temperature,
            },
            max_retry_backoff: Duration::from_millis(config.max_retry_backoff_ms),
        }
    }
}

/// The answer to one message
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratedResponse {
    /// Non-empty answer text
    pub content: String,
    /// Where the answer came from
    pub source: ResponseSource,
    /// Tokens used (zero for fallback answers)
    pub token_usage: TokenUsage,
    /// Kind of the last provider failure when the answer is a fallback
    pub failure: Option<ErrorKind>,
    /// Provider calls made for this message
    pub attempts: u32,
}

/// Cache → provider → template pipeline
pub struct FallbackOrchestrator {
    generator: Arc<dyn TextGenerator>,
    cache: Arc<ResponseCache>,
    catalog: TemplateCatalog,
    monitor: Arc<PerformanceMonitor>,
    settings: OrchestratorSettings,
}

impl FallbackOrchestrator {
    /// Create an orchestrator with the standard template catalog
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        cache: Arc<ResponseCache>,
        monitor: Arc<PerformanceMonitor>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            generator,
            cache,
            catalog: TemplateCatalog::standard(),
            monitor,
            settings,
        }
    }

    /// Replace the template catalog
    pub fn with_catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Answer one message
    ///
    /// # Arguments
    /// * `content` - The user's message
    /// * `context` - Client context used for the prompt, cache key, and templates
    /// * `quick_action` - Optional intent biasing prompt and template choice
    ///
    /// # Returns
    /// An answer whose content is never empty
    pub async fn respond(
        &self,
        content: &str,
        context: &ClientContext,
        quick_action: Option<QuickAction>,
    ) -> OrchestratedResponse {
        match self.cache.lookup(content, context).await {
            CacheLookup::Hit(entry) => {
                self.monitor.record_cache_hit();
                return OrchestratedResponse {
                    content: entry.response,
                    source: ResponseSource::Cache,
                    token_usage: entry.token_usage,
                    failure: None,
                    attempts: 0,
                };
            }
            CacheLookup::Miss => self.monitor.record_cache_miss(),
            CacheLookup::Bypassed => {}
        }

        let prompt = build_prompt(content, context, quick_action);
        let mut attempts = 0;

        let failure = loop {
            attempts += 1;
            self.monitor.record_provider_call();

            match self.call_provider(&prompt).await {
                Ok(generation) => {
                    self.cache
                        .store(content, context, &generation.content, generation.usage)
                        .await;
                    debug!(attempts, tokens = generation.usage.total_tokens, "Provider answered");
                    return OrchestratedResponse {
                        content: generation.content,
                        source: ResponseSource::Primary,
                        token_usage: generation.usage,
                        failure: None,
                        attempts,
                    };
                }
                Err(e) => {
                    self.monitor.record_provider_error();
                    let classification = classify(&e);
                    warn!(
                        kind = classification.kind.as_str(),
                        retryable = classification.retryable,
                        attempt = attempts,
                        error = %e,
                        "Provider call failed"
                    );

                    if classification.retryable && attempts < MAX_PROVIDER_ATTEMPTS {
                        let backoff = classification
                            .backoff_hint
                            .unwrap_or_default()
                            .min(self.settings.max_retry_backoff);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    break classification.kind;
                }
            }
        };

        self.monitor.record_fallback_served();
        OrchestratedResponse {
            content: self.fallback_answer(content, context, quick_action),
            source: ResponseSource::Fallback,
            token_usage: TokenUsage::default(),
            failure: Some(failure),
            attempts,
        }
    }

    /// One provider call under the deadline; empty output is a failure
    async fn call_provider(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let call = self.generator.generate(prompt, &self.settings.generation);
        let generation = tokio::time::timeout(self.settings.provider_timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(self.settings.provider_timeout))??;

        let trimmed = generation.content.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(Generation {
            content: trimmed.to_string(),
            usage: generation.usage,
        })
    }

    /// Render the best template; never empty, never panics
    pub fn fallback_answer(
        &self,
        content: &str,
        context: &ClientContext,
        quick_action: Option<QuickAction>,
    ) -> String {
        let rendered = catch_unwind(AssertUnwindSafe(|| {
            let template = self.catalog.select(content, quick_action);
            template
                .render(context)
                .map(|text| (template.category, text))
        }));

        match rendered {
            Ok(Ok((category, text))) if !text.trim().is_empty() => {
                info!(category = category.as_str(), "Serving fallback template");
                text
            }
            Ok(Ok(_)) => MINIMAL_RESPONSE.to_string(),
            Ok(Err(e)) => {
                warn!(error = %e, "Fallback template failed, serving minimal response");
                MINIMAL_RESPONSE.to_string()
            }
            Err(_) => {
                error!("Fallback rendering panicked, serving minimal response");
                MINIMAL_RESPONSE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::CacheConfig;
    use crate::fallback::templates::{FallbackTemplate, TemplateCategory};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes; repeats the last one when exhausted
    struct ScriptedGenerator {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        last: Mutex<Option<Result<String, ProviderError>>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn always(outcome: Result<String, ProviderError>) -> Self {
            Self::new(vec![outcome])
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::always(Ok("late answer".to_string()))
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<Generation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let outcome = match next {
                Some(outcome) => {
                    *self.last.lock().unwrap() = Some(outcome.clone());
                    outcome
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or(Err(ProviderError::Other("script empty".into()))),
            };
            outcome.map(|content| Generation {
                content,
                usage: TokenUsage {
                    prompt_tokens: 12,
                    completion_tokens: 30,
                    total_tokens: 42,
                },
            })
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            provider_timeout: Duration::from_millis(100),
            generation: GenerationOptions::default(),
            max_retry_backoff: Duration::from_millis(5),
        }
    }

    fn orchestrator(generator: Arc<ScriptedGenerator>) -> (FallbackOrchestrator, Arc<PerformanceMonitor>) {
        let monitor = Arc::new(PerformanceMonitor::default());
        let cache = Arc::new(ResponseCache::new(
            Arc::new(MemoryStore::new()),
            &CacheConfig::default(),
        ));
        (
            FallbackOrchestrator::new(generator, cache, monitor.clone(), settings()),
            monitor,
        )
    }

    fn acme() -> ClientContext {
        ClientContext::for_client("Acme Corp")
    }

    #[tokio::test]
    async fn test_primary_then_cache() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(
            "AWS Lambda best practices are to keep handlers small.".to_string(),
        )));
        let (orch, monitor) = orchestrator(generator.clone());

        let first = orch
            .respond("What are Lambda best practices?", &acme(), None)
            .await;
        assert_eq!(first.source, ResponseSource::Primary);
        assert_eq!(first.content, "AWS Lambda best practices are to keep handlers small.");
        assert_eq!(first.token_usage.total_tokens, 42);

        let second = orch
            .respond("What are Lambda best practices?", &acme(), None)
            .await;
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.content, first.content);
        assert_eq!(second.attempts, 0);
        assert_eq!(generator.calls(), 1);

        let metrics = monitor.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_auth_error_serves_security_fallback_without_retry() {
        let generator = Arc::new(ScriptedGenerator::always(Err(ProviderError::Auth(
            "API key not valid".into(),
        ))));
        let (orch, monitor) = orchestrator(generator.clone());

        let reply = orch
            .respond("Can you review our security posture?", &acme(), None)
            .await;
        assert_eq!(reply.source, ResponseSource::Fallback);
        assert_eq!(reply.failure, Some(ErrorKind::Auth));
        assert!(reply.content.contains("security"));
        assert!(reply.content.contains("Acme Corp"));
        assert_eq!(generator.calls(), 1);
        assert_eq!(monitor.metrics().fallbacks_served, 1);
    }

    #[tokio::test]
    async fn test_timeout_retries_once_then_falls_back() {
        let generator = Arc::new(ScriptedGenerator::slow(Duration::from_millis(500)));
        let (orch, monitor) = orchestrator(generator.clone());

        let reply = orch
            .respond("How should we plan our migration?", &acme(), None)
            .await;
        assert_eq!(reply.source, ResponseSource::Fallback);
        assert_eq!(reply.failure, Some(ErrorKind::Timeout));
        assert_eq!(reply.attempts, 2);
        assert_eq!(generator.calls(), 2);
        assert_eq!(monitor.metrics().provider_errors, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(ProviderError::RateLimited {
                message: "quota".into(),
                retry_after: Some(Duration::from_secs(30)),
            }),
            Ok("Recovered answer".to_string()),
        ]));
        let (orch, _) = orchestrator(generator.clone());

        let started = std::time::Instant::now();
        let reply = orch
            .respond("What does reserved capacity cost?", &acme(), None)
            .await;
        assert_eq!(reply.source, ResponseSource::Primary);
        assert_eq!(reply.content, "Recovered answer");
        assert_eq!(reply.attempts, 2);
        // Backoff hint is capped by max_retry_backoff
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_response_goes_straight_to_fallback() {
        let generator = Arc::new(ScriptedGenerator::always(Ok("   \n ".to_string())));
        let (orch, _) = orchestrator(generator.clone());

        let reply = orch
            .respond("What are Lambda best practices?", &acme(), None)
            .await;
        assert_eq!(reply.source, ResponseSource::Fallback);
        assert_eq!(reply.failure, Some(ErrorKind::InvalidResponse));
        assert_eq!(generator.calls(), 1);
        assert!(!reply.content.trim().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_answers_are_not_cached() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(ProviderError::ServiceUnavailable("down".into())),
            Ok("Real answer".to_string()),
        ]));
        let (orch, _) = orchestrator(generator.clone());

        let first = orch.respond("Tell me about Kubernetes", &acme(), None).await;
        assert_eq!(first.source, ResponseSource::Fallback);
        let second = orch.respond("Tell me about Kubernetes", &acme(), None).await;
        assert_eq!(second.source, ResponseSource::Primary);
        assert_eq!(second.content, "Real answer");
    }

    #[tokio::test]
    async fn test_always_failing_provider_never_yields_empty_content() {
        let errors = vec![
            ProviderError::Auth("bad key".into()),
            ProviderError::Timeout(Duration::from_millis(1)),
            ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after: None,
            },
            ProviderError::ServiceUnavailable("503".into()),
            ProviderError::InvalidResponse("garbage".into()),
            ProviderError::EmptyResponse,
            ProviderError::Other("boom".into()),
        ];
        let messages = [
            "hi",
            "",
            "security review please",
            "What will this cost?",
            "random words about nothing",
        ];
        let contexts = [
            ClientContext::default(),
            acme().with_meeting_type("workshop"),
        ];

        for error in errors {
            let generator = Arc::new(ScriptedGenerator::always(Err(error)));
            let (orch, _) = orchestrator(generator);
            for message in messages {
                for context in &contexts {
                    for action in [None, Some(QuickAction::CostEstimate)] {
                        let reply = orch.respond(message, context, action).await;
                        assert_eq!(reply.source, ResponseSource::Fallback);
                        assert!(!reply.content.trim().is_empty());
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_broken_template_serves_minimal_response() {
        let generator = Arc::new(ScriptedGenerator::always(Err(ProviderError::Auth(
            "bad key".into(),
        ))));
        let (orch, _) = orchestrator(generator);
        let orch = orch.with_catalog(TemplateCatalog::new(
            vec![],
            FallbackTemplate::new(TemplateCategory::General, 0, &[], "  "),
        ));

        let reply = orch.respond("Anything at all?", &acme(), None).await;
        assert_eq!(reply.source, ResponseSource::Fallback);
        assert_eq!(reply.content, MINIMAL_RESPONSE);
    }

    #[tokio::test]
    async fn test_quick_action_biases_fallback() {
        let generator = Arc::new(ScriptedGenerator::always(Err(ProviderError::Auth(
            "bad key".into(),
        ))));
        let (orch, _) = orchestrator(generator);
        let reply = orch
            .respond("Where do we start?", &acme(), Some(QuickAction::MigrationPlan))
            .await;
        assert!(reply.content.contains("migration"));
    }
}
