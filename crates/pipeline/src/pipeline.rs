//! The pipeline proper.

use crate::error::PipelineError;
use crate::lock::InvocationLock;
use crate::prompt::{DefaultPromptBuilder, PromptBuilder, PromptInput};
use crate::respond::Responder;
use async_trait::async_trait;
use chrono::Utc;
use senseloop_core::backoff::{Backoff, BackoffConfig};
use senseloop_core::error::{HandlerError, RESPONSE_UNAVAILABLE};
use senseloop_core::event::{DomainEvent, EventBus, InboundEvent};
use senseloop_core::session::SessionStore;
use senseloop_core::tier::{FallbackTier, TaskComplexity};
use senseloop_providers::{ChainResponse, FallbackChain};
use senseloop_session::{ContextTracker, Handoff, HandoffReason, SessionLedger};
use senseloop_watcher::{EventHandler, SenseRecord};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest goal text copied into the ledger.
const GOAL_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Delivered { tier: FallbackTier, chars: usize },
    Queued { id: String },
    /// Every tier failed; the fixed placeholder was delivered instead.
    Unavailable,
    /// Nothing to answer.
    Skipped,
}

pub struct Pipeline {
    chain: Arc<FallbackChain>,
    sessions: Arc<SessionStore>,
    tracker: Arc<ContextTracker>,
    ledger: Arc<SessionLedger>,
    responder: Arc<dyn Responder>,
    prompts: Arc<dyn PromptBuilder>,
    lock: InvocationLock,
    delivery: Backoff,
    events: Option<Arc<EventBus>>,
}

impl Pipeline {
    pub fn new(
        chain: Arc<FallbackChain>,
        sessions: Arc<SessionStore>,
        tracker: Arc<ContextTracker>,
        ledger: Arc<SessionLedger>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            chain,
            sessions,
            tracker,
            ledger,
            responder,
            prompts: Arc::new(DefaultPromptBuilder),
            lock: InvocationLock::new(),
            delivery: Backoff::new(BackoffConfig::automation()),
            events: None,
        }
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Share an invocation lock with other pipelines using the same backend.
    pub fn with_lock(mut self, lock: InvocationLock) -> Self {
        self.lock = lock;
        self
    }

    /// Retry policy for handing responses to the responder.
    pub fn with_delivery_backoff(mut self, config: BackoffConfig) -> Self {
        self.delivery = Backoff::new(config);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    pub fn lock(&self) -> &InvocationLock {
        &self.lock
    }

    pub async fn process(&self, input: PromptInput) -> Result<PipelineOutcome, PipelineError> {
        if input.is_empty() {
            debug!("Skipping empty input");
            return Ok(PipelineOutcome::Skipped);
        }

        let thread_id = input.thread_id();
        let _slot = self.lock.acquire().await;

        let session = self.sessions.get_or_create(&thread_id);
        let mut token = session.backend_session_token.clone();

        // A thread without a token resumes from its latest handoff, if any.
        let previous = match token {
            Some(_) => None,
            None => self.ledger.most_recent_handoff(&thread_id).await,
        };
        let mut prompt = self.prompts.build(&input, previous.as_ref());

        let carried_over = self.tracker.level_for(session.context_percentage);
        let mut metrics = self.tracker.record(&thread_id, &prompt);
        if metrics.should_handoff || carried_over.should_handoff() {
            let handoff = self.hand_off(&thread_id, HandoffReason::ContextExhausted).await?;
            token = None;
            prompt = self.prompts.build(&input, Some(&handoff));
            metrics = self.tracker.record(&thread_id, &prompt);
        }
        if let Some(warning) = metrics.warning {
            info!(thread_id = %thread_id, level = %metrics.level, "{warning}");
        }

        let text = input.text();
        let complexity = self.chain.classify(&text);
        if complexity == TaskComplexity::Complex {
            let goal: String = text.chars().take(GOAL_PREVIEW_CHARS).collect();
            self.ledger.record_goal(&thread_id, goal).await?;
        }

        let context = format!(
            "Context used: {:.0}% ({})",
            metrics.percentage * 100.0,
            metrics.level
        );
        let result = self
            .chain
            .execute_classified(
                Some(&thread_id),
                complexity,
                &prompt,
                token.as_deref(),
                Some(&context),
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(thread_id = %thread_id, error = %e, "No tier produced a response");
                if e.session_rejected() {
                    self.drop_rejected_token(&thread_id);
                }
                self.deliver(&thread_id, RESPONSE_UNAVAILABLE).await?;
                self.persist();
                return Ok(PipelineOutcome::Unavailable);
            }
        };

        if outcome.session_rejected {
            self.drop_rejected_token(&thread_id);
        }

        let result = match outcome.response {
            ChainResponse::Queued { id } => {
                info!(thread_id = %thread_id, id = %id, "Request queued for later");
                self.publish(DomainEvent::RequestQueued {
                    thread_id: thread_id.clone(),
                    queue_id: id.clone(),
                    timestamp: Utc::now(),
                });
                self.persist();
                return Ok(PipelineOutcome::Queued { id });
            }
            ChainResponse::Delivered(result) => result,
        };

        // Other tiers never saw the thread's session, so only the primary
        // tier's answer replaces the stored token. A rejected token was
        // already dropped above.
        if outcome.tier == FallbackTier::PrimaryRemote {
            self.sessions
                .set_token(&thread_id, result.session_token.clone());
        }

        let after = self
            .tracker
            .record(&thread_id, &format!("{prompt}\n{}", result.text));
        self.sessions
            .set_context_percentage(&thread_id, after.percentage);

        self.deliver(&thread_id, &result.text).await?;
        let chars = result.text.chars().count();
        self.publish(DomainEvent::ResponseDelivered {
            thread_id: thread_id.clone(),
            tier: outcome.tier,
            chars,
            timestamp: Utc::now(),
        });
        self.persist();

        info!(thread_id = %thread_id, tier = %outcome.tier, chars, "Response delivered");
        Ok(PipelineOutcome::Delivered {
            tier: outcome.tier,
            chars,
        })
    }

    /// Replace the thread's session: snapshot the ledger, drop the token and
    /// the context trend.
    pub async fn hand_off(
        &self,
        thread_id: &str,
        reason: HandoffReason,
    ) -> Result<Handoff, PipelineError> {
        let handoff = self.ledger.create_handoff(thread_id, reason).await?;
        self.sessions.clear_token(thread_id);
        self.sessions.set_context_percentage(thread_id, 0.0);
        self.tracker.forget(thread_id);
        self.publish(DomainEvent::HandoffCreated {
            thread_id: thread_id.to_string(),
            reason: handoff.reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(handoff)
    }

    fn drop_rejected_token(&self, thread_id: &str) {
        warn!(thread_id = %thread_id, "Backend rejected the stored session; dropping its token");
        self.sessions.clear_token(thread_id);
    }

    async fn deliver(&self, thread_id: &str, text: &str) -> Result<(), PipelineError> {
        let responder = self.responder.name();
        self.delivery
            .execute_with(
                || self.responder.deliver(thread_id, text),
                |retry, err: &PipelineError, delay| {
                    warn!(responder, thread_id, retry, error = %err, delay_ms = delay.as_millis() as u64, "Retrying delivery");
                },
            )
            .await
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    fn persist(&self) {
        if let Err(e) = self.sessions.save() {
            warn!(error = %e, "Failed to persist sessions");
        }
    }
}

#[async_trait]
impl EventHandler<InboundEvent> for Pipeline {
    async fn handle(&self, event: InboundEvent) -> Result<(), HandlerError> {
        self.process(PromptInput::Message(event)).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<SenseRecord> for Pipeline {
    async fn handle(&self, record: SenseRecord) -> Result<(), HandlerError> {
        self.process(PromptInput::Sense(record.event)).await?;
        Ok(())
    }
}
