//! senseloop daemon.
//!
//! Loads `~/.senseloop/config.toml` (or `SENSELOOP_CONFIG`), builds the
//! fallback chain and the pipeline, and runs one watcher per configured
//! source until Ctrl-C.

use senseloop_config::{AppConfig, SourceConfig};
use senseloop_core::backoff::Backoff;
use senseloop_core::error::SourceError;
use senseloop_core::event::{DomainEvent, EventBus};
use senseloop_core::session::SessionStore;
use senseloop_pipeline::{Pipeline, TracingResponder};
use senseloop_providers::{
    FallbackChain, FileRequestQueue, InvocationConfig, InvocationEngine, LocalModelClient,
    RequestQueue, Sanitizer, TaskClassifier,
};
use senseloop_session::{ContextTracker, SessionLedger};
use senseloop_watcher::{EventHandler, EventSource, SenseDirectorySource, SenseRecord, Watcher};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WatcherTasks = JoinSet<Result<(), SourceError>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = if std::env::var_os("SENSELOOP_VERBOSE").is_some() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = AppConfig::load()?;
    info!(state_dir = %config.state_dir().display(), "Configuration loaded");

    let shutdown = CancellationToken::new();
    let bus = Arc::new(EventBus::default());
    let pipeline = Arc::new(build_pipeline(&config, &bus).await?);

    let events = tokio::spawn(log_domain_events(bus.clone(), shutdown.clone()));
    let mut tasks: WatcherTasks = JoinSet::new();

    if let Some(source_config) = &config.sources.sense_dir {
        let source = SenseDirectorySource::new(&source_config.path)
            .with_change_signal()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Sense directory change notifications unavailable; polling only");
                SenseDirectorySource::new(&source_config.path)
            });
        let handler: Arc<dyn EventHandler<SenseRecord>> = pipeline.clone();
        spawn_watcher(
            &mut tasks,
            &config,
            source_config,
            Arc::new(source),
            handler,
            &bus,
            &shutdown,
        );
    }

    #[cfg(feature = "sqlite")]
    if let Some(source_config) = &config.sources.messages_db {
        use senseloop_core::event::InboundEvent;
        use senseloop_watcher::MessageDatabaseSource;

        let source = MessageDatabaseSource::open(&source_config.path).await?;
        let source = source.with_change_signal().map_err(|e| {
            error!(error = %e, "Cannot watch the message database");
            e
        })?;
        let handler: Arc<dyn EventHandler<InboundEvent>> = pipeline.clone();
        spawn_watcher(
            &mut tasks,
            &config,
            source_config,
            Arc::new(source),
            handler,
            &bus,
            &shutdown,
        );
    }

    if tasks.is_empty() {
        warn!("No sources configured; add [sources.sense_dir] or [sources.messages_db] to the config");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Watcher stopped with an error"),
            Err(e) => error!(error = %e, "Watcher task panicked"),
        }
    }
    let _ = events.await;

    if let Err(e) = pipeline.sessions().save() {
        warn!(error = %e, "Failed to persist sessions on shutdown");
    }
    Ok(())
}

async fn build_pipeline(
    config: &AppConfig,
    bus: &Arc<EventBus>,
) -> Result<Pipeline, Box<dyn std::error::Error>> {
    let sanitizer = Arc::new(Sanitizer::new()?);
    let classifier = Arc::new(TaskClassifier::new(config.fallback.ack_max_chars)?);

    let primary = InvocationEngine::new(
        "primary",
        InvocationConfig::from(&config.primary),
        sanitizer.clone(),
    );
    let mut chain = FallbackChain::new(Arc::new(primary), classifier, sanitizer.clone())
        .with_same_tier_retries(config.fallback.same_tier_retries)
        .with_event_bus(bus.clone());

    if let Some(secondary) = &config.secondary {
        let engine = InvocationEngine::new(
            "secondary",
            InvocationConfig::from(secondary),
            sanitizer.clone(),
        );
        chain = chain.with_secondary(Arc::new(engine));
    }

    if config.local.enabled {
        let local = Arc::new(LocalModelClient::new(&config.local)?);
        let probe = local.clone();
        let backoff = Backoff::new(config.backoff.network.clone());
        tokio::spawn(async move {
            match backoff.execute(|| probe.list_models()).await {
                Ok(models) => info!(model = %probe.model(), installed = ?models, "Local model server reachable"),
                Err(e) => warn!(error = %e, "Local model server not reachable; local tier will be skipped until it is"),
            }
        });
        chain = chain.with_local(local);
    }

    if config.fallback.queue_enabled {
        let queue = Arc::new(FileRequestQueue::new(config.queue_path()));
        match queue.depth().await {
            Ok(0) => {}
            Ok(pending) => warn!(
                pending,
                path = %config.queue_path().display(),
                "Deferred requests are waiting in the queue"
            ),
            Err(e) => warn!(error = %e, "Cannot read the request queue"),
        }
        chain = chain.with_queue(queue);
    }

    let sessions = Arc::new(SessionStore::load(config.sessions_path()));
    let ledger = Arc::new(SessionLedger::open(config.ledger_dir()).await?);
    let tracker = Arc::new(ContextTracker::new(config.context.clone()));

    Ok(Pipeline::new(
        Arc::new(chain),
        sessions,
        tracker,
        ledger,
        Arc::new(TracingResponder),
    )
    .with_delivery_backoff(config.backoff.automation.clone())
    .with_event_bus(bus.clone()))
}

fn spawn_watcher<S>(
    tasks: &mut WatcherTasks,
    config: &AppConfig,
    source_config: &SourceConfig,
    source: Arc<S>,
    handler: Arc<dyn EventHandler<S::Record>>,
    bus: &Arc<EventBus>,
    shutdown: &CancellationToken,
) where
    S: EventSource,
{
    let name = source.name().to_string();
    let mut watcher = Watcher::new(source, handler, config.watcher.clone())
        .with_cursor_file(config.cursor_path(&name, source_config))
        .with_backoff(config.backoff.database.clone())
        .with_event_bus(bus.clone());
    if let Some(id) = source_config.start_after {
        watcher = watcher.with_start_after(id);
    }

    info!(source = %name, path = %source_config.path.display(), "Starting watcher");
    tasks.spawn(Arc::new(watcher).run(shutdown.clone()));
}

async fn log_domain_events(bus: Arc<EventBus>, shutdown: CancellationToken) {
    let mut events = bus.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => match event.as_ref() {
                    DomainEvent::WatcherAlert { source, consecutive_failures, .. } => {
                        warn!(source = %source, consecutive_failures, "Watcher alert");
                    }
                    DomainEvent::HandoffCreated { thread_id, reason, .. } => {
                        info!(thread_id = %thread_id, reason = %reason, "Session handed off");
                    }
                    other => debug!(event = ?other, "Domain event"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Domain event log lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
