//! Fallback chain: Ordered walk over remote, local and queued tiers.
//!
//! The request is classified first. Complex work starts at the primary remote
//! tier; acknowledgements and status queries start at the local tier when
//! one is configured. On failure the error is classified:
//!
//! - advance: try the next tier
//! - skip-local: jump straight to the queue (nothing below can fix it)
//! - retry same tier: a bounded number of times, then advance
//! - terminal: stop the walk
//!
//! Tiers that are not configured are skipped without counting as failures.
//! Only the primary tier resumes the caller's session. When the primary tier
//! rejects that session, both [`ChainOutcome`] and [`ChainError`] say so, so
//! the caller can drop the token whichever tier ended the walk.

use crate::classifier::TaskClassifier;
use crate::invocation::{InvocationResult, RemoteBackend};
use crate::local::LocalBackend;
use crate::queue::{QueuedRequest, RequestQueue};
use crate::sanitize::Sanitizer;
use chrono::Utc;
use senseloop_core::error::{InvocationError, LocalModelError, QueueError};
use senseloop_core::event::{DomainEvent, EventBus};
use senseloop_core::tier::{ErrorClass, FallbackTier, TaskComplexity};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Why a single tier failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TierError {
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Local(#[from] LocalModelError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// An error only known by its message.
    #[error("{0}")]
    Other(String),
}

impl TierError {
    /// True when the failure means the resume token was rejected.
    pub fn session_rejected(&self) -> bool {
        matches!(self, Self::Invocation(e) if e.session_rejected())
    }
}

/// The walk ended without a delivered or queued response.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("All fallback tiers failed: {}", FailureList(.0))]
    Exhausted(Vec<(FallbackTier, TierError)>),

    #[error("Tier {tier} failed terminally: {error}")]
    Terminal {
        tier: FallbackTier,
        error: TierError,
        /// Failures of earlier tiers in this walk.
        attempts: Vec<(FallbackTier, TierError)>,
    },
}

struct FailureList<'a>(&'a [(FallbackTier, TierError)]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no tier configured");
        }
        for (i, (tier, error)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{tier}: {error}")?;
        }
        Ok(())
    }
}

impl ChainError {
    /// True when some tier rejected the caller's resume token.
    pub fn session_rejected(&self) -> bool {
        match self {
            Self::Exhausted(failures) => failures.iter().any(|(_, e)| e.session_rejected()),
            Self::Terminal {
                error, attempts, ..
            } => error.session_rejected() || attempts.iter().any(|(_, e)| e.session_rejected()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResponse {
    Delivered(InvocationResult),
    Queued { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    pub tier: FallbackTier,
    pub complexity: TaskComplexity,
    pub response: ChainResponse,
    /// An earlier tier rejected the caller's resume token.
    pub session_rejected: bool,
}

/// Map a tier failure to what the walk does next.
pub fn classify_error(error: &TierError) -> ErrorClass {
    match error {
        TierError::Invocation(e) => match e.root() {
            InvocationError::BackendNotFound { .. } | InvocationError::Timeout { .. } => {
                ErrorClass::AdvanceTier
            }
            InvocationError::LaunchFailed { kind, .. } => match kind {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                    ErrorClass::RetryableSameTier
                }
                _ => ErrorClass::AdvanceTier,
            },
            InvocationError::PromptTooLong => ErrorClass::SkipLocalTier,
            InvocationError::NonZeroExit { message, .. }
            | InvocationError::BackendReported { message, .. } => {
                classify_message(message).unwrap_or(ErrorClass::AdvanceTier)
            }
            InvocationError::InvalidUtf8
            | InvocationError::MalformedResponse { .. }
            | InvocationError::RetryCeilingExceeded { .. }
            | InvocationError::SessionRejected { .. } => ErrorClass::Terminal,
        },
        TierError::Local(_) | TierError::Queue(_) => ErrorClass::AdvanceTier,
        TierError::Other(message) => classify_message(message).unwrap_or(ErrorClass::AdvanceTier),
    }
}

/// Message-based classification for errors without a useful kind.
fn classify_message(message: &str) -> Option<ErrorClass> {
    const AUTH: [&str; 5] = ["401", "403", "unauthorized", "invalid api key", "authentication"];
    const OVERFLOW: [&str; 3] = ["prompt is too long", "prompt too long", "context length"];
    const TRANSIENT: [&str; 8] = [
        "rate limit",
        "429",
        "500",
        "502",
        "503",
        "overloaded",
        "timed out",
        "connection",
    ];

    let lower = message.to_lowercase();
    if AUTH.iter().chain(OVERFLOW.iter()).any(|m| contains_word(&lower, m)) {
        Some(ErrorClass::SkipLocalTier)
    } else if TRANSIENT.iter().any(|m| contains_word(&lower, m)) {
        Some(ErrorClass::AdvanceTier)
    } else {
        None
    }
}

/// `needle` occurs in `text` with no letter or digit directly on either side,
/// so `"500"` does not match `"1500 rows"`.
fn contains_word(text: &str, needle: &str) -> bool {
    text.match_indices(needle).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

pub struct FallbackChain {
    primary: Arc<dyn RemoteBackend>,
    secondary: Option<Arc<dyn RemoteBackend>>,
    local: Option<Arc<dyn LocalBackend>>,
    queue: Option<Arc<dyn RequestQueue>>,
    classifier: Arc<TaskClassifier>,
    sanitizer: Arc<Sanitizer>,
    same_tier_retries: u32,
    events: Option<Arc<EventBus>>,
}

impl FallbackChain {
    pub fn new(
        primary: Arc<dyn RemoteBackend>,
        classifier: Arc<TaskClassifier>,
        sanitizer: Arc<Sanitizer>,
    ) -> Self {
        Self {
            primary,
            secondary: None,
            local: None,
            queue: None,
            classifier,
            sanitizer,
            same_tier_retries: 1,
            events: None,
        }
    }

    pub fn with_secondary(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.secondary = Some(backend);
        self
    }

    pub fn with_local(mut self, backend: Arc<dyn LocalBackend>) -> Self {
        self.local = Some(backend);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn RequestQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_same_tier_retries(mut self, retries: u32) -> Self {
        self.same_tier_retries = retries;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn classify(&self, prompt: &str) -> TaskComplexity {
        self.classifier.classify(prompt)
    }

    fn has_tier(&self, tier: FallbackTier) -> bool {
        match tier {
            FallbackTier::PrimaryRemote => true,
            FallbackTier::SecondaryRemote => self.secondary.is_some(),
            FallbackTier::Local => self.local.is_some(),
            FallbackTier::Queued => self.queue.is_some(),
        }
    }

    /// First tier for this complexity. Without a local tier, cheap requests
    /// start at the primary tier instead of falling straight to the queue.
    fn starting_tier(&self, complexity: TaskComplexity) -> FallbackTier {
        match complexity.starting_tier() {
            FallbackTier::Local if self.local.is_none() => FallbackTier::PrimaryRemote,
            tier => tier,
        }
    }

    /// Walk the tiers for `prompt`. `context` is supplied to status queries
    /// answered by the local tier.
    pub async fn execute(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
        context: Option<&str>,
    ) -> Result<ChainOutcome, ChainError> {
        self.execute_for_thread(None, prompt, resume_token, context).await
    }

    /// Like [`execute`](Self::execute), recording the thread on queued requests.
    pub async fn execute_for_thread(
        &self,
        thread_id: Option<&str>,
        prompt: &str,
        resume_token: Option<&str>,
        context: Option<&str>,
    ) -> Result<ChainOutcome, ChainError> {
        let complexity = self.classifier.classify(prompt);
        self.execute_classified(thread_id, complexity, prompt, resume_token, context)
            .await
    }

    /// Walk the tiers with a complexity decided by the caller, e.g. from the
    /// raw message text rather than the fully rendered prompt.
    pub async fn execute_classified(
        &self,
        thread_id: Option<&str>,
        complexity: TaskComplexity,
        prompt: &str,
        resume_token: Option<&str>,
        context: Option<&str>,
    ) -> Result<ChainOutcome, ChainError> {
        let mut failures: Vec<(FallbackTier, TierError)> = Vec::new();
        let mut session_rejected = false;
        let mut next = Some(self.starting_tier(complexity));

        while let Some(tier) = next {
            if !self.has_tier(tier) {
                next = tier.next();
                continue;
            }

            info!(tier = %tier, complexity = %complexity, "Fallback: trying tier");

            let mut same_tier_attempts = 0;
            let attempt = loop {
                let request = TierRequest {
                    thread_id,
                    prompt,
                    resume_token,
                    context,
                    complexity,
                    failures: &failures,
                };
                match self.attempt(tier, request).await {
                    Ok(response) => break Ok(response),
                    Err(error) => {
                        let class = classify_error(&error);
                        if class == ErrorClass::RetryableSameTier
                            && same_tier_attempts < self.same_tier_retries
                        {
                            same_tier_attempts += 1;
                            warn!(tier = %tier, error = %error, attempt = same_tier_attempts, "Fallback: retrying tier");
                            continue;
                        }
                        break Err((error, class));
                    }
                }
            };

            let (error, class) = match attempt {
                Ok(response) => {
                    return Ok(ChainOutcome {
                        tier,
                        complexity,
                        response,
                        session_rejected,
                    });
                }
                Err(failure) => failure,
            };

            if error.session_rejected() {
                info!(tier = %tier, "Fallback: resume session rejected; continuing without it");
                session_rejected = true;
            }

            warn!(tier = %tier, error = %error, class = ?class, "Fallback: tier failed");
            if let Some(bus) = &self.events {
                bus.publish(DomainEvent::TierFailed {
                    tier,
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
            }

            match class {
                ErrorClass::Terminal => {
                    return Err(ChainError::Terminal {
                        tier,
                        error,
                        attempts: failures,
                    });
                }
                ErrorClass::SkipLocalTier => {
                    failures.push((tier, error));
                    next = (tier < FallbackTier::Queued).then_some(FallbackTier::Queued);
                }
                ErrorClass::AdvanceTier | ErrorClass::RetryableSameTier => {
                    failures.push((tier, error));
                    next = tier.next();
                }
            }
        }

        Err(ChainError::Exhausted(failures))
    }

    async fn attempt(
        &self,
        tier: FallbackTier,
        request: TierRequest<'_>,
    ) -> Result<ChainResponse, TierError> {
        match tier {
            FallbackTier::PrimaryRemote => {
                let result = self
                    .primary
                    .invoke(request.prompt, request.resume_token)
                    .await?;
                Ok(ChainResponse::Delivered(result))
            }
            FallbackTier::SecondaryRemote => {
                let backend = self.secondary.as_ref().ok_or_else(|| missing(tier))?;
                let result = backend.invoke(request.prompt, None).await?;
                Ok(ChainResponse::Delivered(result))
            }
            FallbackTier::Local => {
                let local = self.local.as_ref().ok_or_else(|| missing(tier))?;
                if !local.is_available().await {
                    return Err(LocalModelError::Unavailable.into());
                }
                let prompt = local_prompt(request.complexity, request.prompt, request.context);
                let text = local.chat(&prompt).await?;
                let sanitized = self.sanitizer.sanitize(&text);
                if sanitized.text.is_empty() {
                    return Err(LocalModelError::InvalidResponse(
                        "nothing left after sanitizing".into(),
                    )
                    .into());
                }
                Ok(ChainResponse::Delivered(InvocationResult {
                    text: sanitized.text,
                    session_token: None,
                }))
            }
            FallbackTier::Queued => {
                let queue = self.queue.as_ref().ok_or_else(|| missing(tier))?;
                let reason = request
                    .failures
                    .last()
                    .map(|(t, e)| format!("{t}: {e}"))
                    .unwrap_or_else(|| "no tier answered".into());
                let queued = QueuedRequest::new(
                    request.thread_id,
                    request.prompt,
                    request.complexity,
                    reason,
                );
                let id = queued.id.clone();
                queue.enqueue(queued).await?;
                info!(id = %id, "Fallback: request queued");
                Ok(ChainResponse::Queued { id })
            }
        }
    }
}

struct TierRequest<'a> {
    thread_id: Option<&'a str>,
    prompt: &'a str,
    resume_token: Option<&'a str>,
    context: Option<&'a str>,
    complexity: TaskComplexity,
    failures: &'a [(FallbackTier, TierError)],
}

fn missing(tier: FallbackTier) -> TierError {
    TierError::Other(format!("tier {tier} is not configured"))
}

/// Shape the prompt for the weaker local model.
fn local_prompt(complexity: TaskComplexity, prompt: &str, context: Option<&str>) -> String {
    match complexity {
        TaskComplexity::SimpleAck => format!(
            "Reply with one short, friendly acknowledgement to this message. \
             Do not ask questions.\n\nMessage: {prompt}"
        ),
        TaskComplexity::StatusQuery => match context {
            Some(context) if !context.trim().is_empty() => {
                format!("{prompt}\n\nCurrent context:\n{context}")
            }
            _ => prompt.to_string(),
        },
        TaskComplexity::Complex => {
            warn!("Fallback: complex request answered by local model (degraded)");
            prompt.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryRequestQueue;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// A remote backend returning scripted results.
    struct MockRemote {
        name: String,
        results: Mutex<Vec<Result<InvocationResult, InvocationError>>>,
        tokens_seen: Mutex<Vec<Option<String>>>,
    }

    impl MockRemote {
        fn new(name: &str, results: Vec<Result<InvocationResult, InvocationError>>) -> Self {
            Self {
                name: name.into(),
                results: Mutex::new(results),
                tokens_seen: Mutex::new(vec![]),
            }
        }

        fn ok(name: &str, text: &str) -> Self {
            Self::new(
                name,
                vec![Ok(InvocationResult {
                    text: text.into(),
                    session_token: Some(format!("{name}-session")),
                })],
            )
        }

        fn failing(name: &str, error: InvocationError) -> Self {
            Self::new(name, vec![Err(error)])
        }

        fn calls(&self) -> usize {
            self.tokens_seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteBackend for MockRemote {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            _prompt: &str,
            resume_token: Option<&str>,
        ) -> Result<InvocationResult, InvocationError> {
            self.tokens_seen
                .lock()
                .unwrap()
                .push(resume_token.map(String::from));
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    struct MockLocal {
        available: bool,
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLocal {
        fn new(available: bool) -> Self {
            Self::replying(available, "local answer")
        }

        fn replying(available: bool, reply: &str) -> Self {
            Self {
                available,
                reply: reply.into(),
                prompts: Mutex::new(vec![]),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LocalBackend for MockLocal {
        fn name(&self) -> &str {
            "mock-local"
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn chat(&self, prompt: &str) -> Result<String, LocalModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn chain(primary: Arc<MockRemote>) -> FallbackChain {
        FallbackChain::new(
            primary,
            Arc::new(TaskClassifier::new(40).unwrap()),
            Arc::new(Sanitizer::new().unwrap()),
        )
    }

    fn timeout() -> InvocationError {
        InvocationError::Timeout { timeout_secs: 300 }
    }

    #[tokio::test]
    async fn primary_success_keeps_session() {
        let primary = Arc::new(MockRemote::ok("primary", "done deal"));
        let outcome = chain(primary.clone())
            .execute("write the weekly report", Some("tok-1"), None)
            .await
            .unwrap();

        assert_eq!(outcome.tier, FallbackTier::PrimaryRemote);
        assert_eq!(outcome.complexity, TaskComplexity::Complex);
        assert_eq!(
            outcome.response,
            ChainResponse::Delivered(InvocationResult {
                text: "done deal".into(),
                session_token: Some("primary-session".into()),
            })
        );
        assert_eq!(*primary.tokens_seen.lock().unwrap(), vec![Some("tok-1".to_string())]);
    }

    #[tokio::test]
    async fn complex_never_starts_local_even_if_available() {
        let primary = Arc::new(MockRemote::ok("primary", "remote answer"));
        let local = Arc::new(MockLocal::new(true));
        let outcome = chain(primary.clone())
            .with_local(local.clone())
            .execute("research flights to Lisbon", None, None)
            .await
            .unwrap();
        assert_eq!(outcome.tier, FallbackTier::PrimaryRemote);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn secondary_runs_without_session_token() {
        let primary = Arc::new(MockRemote::failing("primary", timeout()));
        let secondary = Arc::new(MockRemote::ok("secondary", "backup answer"));
        let outcome = chain(primary.clone())
            .with_secondary(secondary.clone())
            .execute("debug my script", Some("tok-1"), None)
            .await
            .unwrap();

        assert_eq!(outcome.tier, FallbackTier::SecondaryRemote);
        assert_eq!(*secondary.tokens_seen.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn auth_failure_skips_local_and_goes_to_queue() {
        let primary = Arc::new(MockRemote::failing(
            "primary",
            InvocationError::BackendReported {
                message: "API Error: 401 unauthorized".into(),
                diagnostic: "exit=Some(1)".into(),
            },
        ));
        let secondary = Arc::new(MockRemote::ok("secondary", "never"));
        let local = Arc::new(MockLocal::new(true));
        let queue = Arc::new(InMemoryRequestQueue::new());

        let outcome = chain(primary)
            .with_secondary(secondary.clone())
            .with_local(local.clone())
            .with_queue(queue.clone())
            .execute("plan the offsite", None, None)
            .await
            .unwrap();

        assert_eq!(outcome.tier, FallbackTier::Queued);
        assert!(matches!(outcome.response, ChainResponse::Queued { .. }));
        assert_eq!(secondary.calls(), 0);
        assert_eq!(local.calls(), 0);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].reason.starts_with("primary_remote"));
    }

    #[tokio::test]
    async fn prompt_too_long_skips_local() {
        let primary = Arc::new(MockRemote::failing("primary", InvocationError::PromptTooLong));
        let local = Arc::new(MockLocal::new(true));
        let err = chain(primary)
            .with_local(local.clone())
            .execute("summarize this giant log and fix it", None, None)
            .await
            .unwrap_err();

        match err {
            ChainError::Exhausted(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, FallbackTier::PrimaryRemote);
            }
            other => panic!("Expected Exhausted, got: {other:?}"),
        }
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn exhaustion_lists_failures_in_tier_order() {
        let primary = Arc::new(MockRemote::failing("primary", timeout()));
        let secondary = Arc::new(MockRemote::failing(
            "secondary",
            InvocationError::BackendNotFound {
                command: "claude".into(),
            },
        ));
        let local = Arc::new(MockLocal::new(false));

        let err = chain(primary)
            .with_secondary(secondary)
            .with_local(local)
            .execute("build the thing", None, None)
            .await
            .unwrap_err();

        match err {
            ChainError::Exhausted(failures) => {
                let tiers: Vec<_> = failures.iter().map(|(t, _)| *t).collect();
                assert_eq!(
                    tiers,
                    vec![
                        FallbackTier::PrimaryRemote,
                        FallbackTier::SecondaryRemote,
                        FallbackTier::Local
                    ]
                );
                assert!(matches!(
                    failures[2].1,
                    TierError::Local(LocalModelError::Unavailable)
                ));
            }
            other => panic!("Expected Exhausted, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_response_is_terminal() {
        let primary = Arc::new(MockRemote::failing(
            "primary",
            InvocationError::MalformedResponse {
                exit_code: Some(0),
                diagnostic: "garbage".into(),
            },
        ));
        let secondary = Arc::new(MockRemote::ok("secondary", "never"));
        let err = chain(primary)
            .with_secondary(secondary.clone())
            .execute("create a budget", None, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChainError::Terminal {
                tier: FallbackTier::PrimaryRemote,
                ..
            }
        ));
        assert!(!err.to_string().contains("garbage"));
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn transient_launch_failure_retries_same_tier_once() {
        let primary = Arc::new(MockRemote::new(
            "primary",
            vec![
                Err(InvocationError::LaunchFailed {
                    reason: "interrupted".into(),
                    kind: std::io::ErrorKind::Interrupted,
                }),
                Ok(InvocationResult {
                    text: "second time lucky".into(),
                    session_token: None,
                }),
            ],
        ));
        let outcome = chain(primary.clone())
            .execute("draft an email", None, None)
            .await
            .unwrap();
        assert_eq!(outcome.tier, FallbackTier::PrimaryRemote);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn simple_ack_uses_local_with_ack_prompt() {
        let primary = Arc::new(MockRemote::ok("primary", "never"));
        let local = Arc::new(MockLocal::new(true));
        let outcome = chain(primary.clone())
            .with_local(local.clone())
            .execute("thanks!", Some("tok"), None)
            .await
            .unwrap();

        assert_eq!(outcome.tier, FallbackTier::Local);
        assert_eq!(outcome.complexity, TaskComplexity::SimpleAck);
        assert_eq!(primary.calls(), 0);
        let prompts = local.prompts.lock().unwrap();
        assert!(prompts[0].contains("acknowledgement"));
        assert!(prompts[0].contains("thanks!"));
    }

    #[tokio::test]
    async fn status_query_gets_context_on_local() {
        let local = Arc::new(MockLocal::new(true));
        chain(Arc::new(MockRemote::ok("primary", "never")))
            .with_local(local.clone())
            .execute("are you there?", None, Some("uptime: 3 days"))
            .await
            .unwrap();
        assert!(local.prompts.lock().unwrap()[0].contains("uptime: 3 days"));
    }

    #[tokio::test]
    async fn status_query_without_local_starts_at_primary() {
        let primary = Arc::new(MockRemote::ok("primary", "all good"));
        let outcome = chain(primary.clone())
            .execute("what's the status?", None, None)
            .await
            .unwrap();
        assert_eq!(outcome.tier, FallbackTier::PrimaryRemote);
    }

    #[test]
    fn error_classification_table() {
        let cases: Vec<(TierError, ErrorClass)> = vec![
            (timeout().into(), ErrorClass::AdvanceTier),
            (
                InvocationError::BackendNotFound { command: "x".into() }.into(),
                ErrorClass::AdvanceTier,
            ),
            (InvocationError::PromptTooLong.into(), ErrorClass::SkipLocalTier),
            (InvocationError::InvalidUtf8.into(), ErrorClass::Terminal),
            (
                InvocationError::RetryCeilingExceeded { retry_count: 2, ceiling: 2 }.into(),
                ErrorClass::Terminal,
            ),
            (
                InvocationError::NonZeroExit {
                    code: Some(1),
                    message: "HTTP 529 overloaded".into(),
                    diagnostic: String::new(),
                }
                .into(),
                ErrorClass::AdvanceTier,
            ),
            (
                InvocationError::SessionRejected {
                    cause: Box::new(InvocationError::PromptTooLong),
                }
                .into(),
                ErrorClass::SkipLocalTier,
            ),
            (LocalModelError::ModelNotInstalled("m".into()).into(), ErrorClass::AdvanceTier),
            (TierError::Other("Invalid API key".into()), ErrorClass::SkipLocalTier),
            (TierError::Other("rate limit exceeded".into()), ErrorClass::AdvanceTier),
            (TierError::Other("something odd".into()), ErrorClass::AdvanceTier),
        ];
        for (error, expected) in cases {
            assert_eq!(classify_error(&error), expected, "error: {error}");
        }
    }

    #[test]
    fn only_error_text_is_classified() {
        // Answer text in the diagnostic must not look like an auth failure.
        let err: TierError = InvocationError::NonZeroExit {
            code: Some(2),
            message: "tool crashed".into(),
            diagnostic: "stdout=\"403 forbidden in the logs\"".into(),
        }
        .into();
        assert_eq!(classify_error(&err), ErrorClass::AdvanceTier);

        assert_eq!(
            classify_message("imported 1500 rows"),
            None,
            "codes only match as whole words"
        );
        assert_eq!(classify_message("HTTP 500: internal"), Some(ErrorClass::AdvanceTier));
        assert_eq!(classify_message("status=401"), Some(ErrorClass::SkipLocalTier));
        assert_eq!(classify_message("disconnection"), None);
    }

    #[tokio::test]
    async fn rejected_session_is_reported_on_every_outcome() {
        let rejected = || InvocationError::SessionRejected {
            cause: Box::new(InvocationError::NonZeroExit {
                code: Some(1),
                message: "503 overloaded".into(),
                diagnostic: String::new(),
            }),
        };

        let outcome = chain(Arc::new(MockRemote::failing("primary", rejected())))
            .with_secondary(Arc::new(MockRemote::ok("secondary", "backup")))
            .execute("fix the deploy", Some("stale"), None)
            .await
            .unwrap();
        assert_eq!(outcome.tier, FallbackTier::SecondaryRemote);
        assert!(outcome.session_rejected);

        let err = chain(Arc::new(MockRemote::failing("primary", rejected())))
            .execute("fix the deploy", Some("stale"), None)
            .await
            .unwrap_err();
        assert!(err.session_rejected());

        let outcome = chain(Arc::new(MockRemote::ok("primary", "fine")))
            .execute("fix the deploy", Some("tok"), None)
            .await
            .unwrap();
        assert!(!outcome.session_rejected);
    }

    #[tokio::test]
    async fn empty_local_answer_advances() {
        let local = Arc::new(MockLocal::replying(true, "<thinking>nothing</thinking>"));
        let queue = Arc::new(InMemoryRequestQueue::new());
        let outcome = chain(Arc::new(MockRemote::ok("primary", "never")))
            .with_local(local.clone())
            .with_queue(queue.clone())
            .execute("thanks!", None, None)
            .await
            .unwrap();
        assert_eq!(local.calls(), 1);
        assert_eq!(outcome.tier, FallbackTier::Queued);
        assert!(queue.pending().await.unwrap()[0].reason.starts_with("local"));
    }
}
