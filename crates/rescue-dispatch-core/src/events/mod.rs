//! Durable event bus with in-process fan-out and crash recovery.
//!
//! ```text
//! emit() ──► agent_events (pending) ──► deliver() ──► process()
//!                    ▲                                   │
//!                    │            claim pending → processing (CAS)
//!      recovery scan ┘                                   │
//!   (stale claims → pending,             handlers run concurrently,
//!    pending → process())                each in its own task
//!                                                        │
//!                                 completed | failed + per-handler outcomes
//! ```
//!
//! # Delivery contract
//!
//! Delivery is **at-least-once**. The in-process path and the recovery scan
//! share one claim step, but a crash between claim and finish returns the
//! event to `pending` once the claim goes stale, so a handler may see the same
//! event twice. Every [`EventHandler`] must be idempotent per `event_id`.
//!
//! Terminal events (`completed`, `failed`) are never picked up again.

mod recovery;

pub use recovery::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EventBusConfig;
use crate::db::{Database, DbError, EventClaim};
use crate::models::{now, AgentEvent, EventStatus, HandlerOutcome};

/// Event bus errors.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Event not found: {0}")]
    NotFound(String),
}

impl<T> From<std::sync::PoisonError<T>> for EventError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        EventError::StoreUnavailable(err.to_string())
    }
}

pub type EventResult<T> = Result<T, EventError>;

/// Why a single handler invocation did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// A consumer of events of one or more types.
///
/// Handlers may be invoked more than once for the same event and must treat
/// `event.event_id` as an idempotency key. They run concurrently with other
/// handlers for the same event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name recorded in [`HandlerOutcome`].
    fn name(&self) -> &str;

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError>;
}

/// Summary of one recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale `processing` claims returned to `pending`
    pub released: usize,
    /// Pending events seen by the scan
    pub scanned: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claimed by another path before this scan reached them
    pub skipped: usize,
    /// Events the scan could not process; they stay for the next scan
    pub errors: usize,
}

impl RecoveryReport {
    pub fn did_work(&self) -> bool {
        self.released > 0 || self.scanned > 0
    }
}

/// Durable publish/subscribe.
///
/// Subscriptions are wired once at startup through `&mut self`; after that the
/// bus is shared as `Arc<EventBus>`.
pub struct EventBus {
    db: Arc<Mutex<Database>>,
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(db: Arc<Mutex<Database>>, config: EventBusConfig) -> Self {
        Self {
            db,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Register a handler for an event type. Several handlers per type all run.
    pub fn subscribe(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        debug!(
            event_type = %event_type,
            handler = handler.name(),
            "Subscribed handler"
        );
        self.handlers.entry(event_type).or_default().push(handler);
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Event types with at least one subscriber, sorted.
    pub fn subscribed_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Persist an event as `pending`, then hand it to in-process subscribers.
    pub fn emit(self: &Arc<Self>, event: AgentEvent) -> EventResult<String> {
        self.store()?.insert_event(&event)?;
        let event_id = event.event_id;
        self.deliver([event_id.clone()]);
        Ok(event_id)
    }

    /// Start in-process delivery of already persisted events, one task each.
    ///
    /// Outside a tokio runtime nothing is spawned and the events wait for the
    /// next recovery scan.
    pub fn deliver<I>(self: &Arc<Self>, event_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, leaving events to the recovery scan");
            return;
        };
        for event_id in event_ids {
            let bus = Arc::clone(self);
            runtime.spawn(async move {
                if let Err(e) = bus.process(&event_id).await {
                    warn!(event_id = %event_id, "In-process delivery failed: {}", e);
                }
            });
        }
    }

    /// Claim and process one event.
    ///
    /// Returns the terminal status, or `None` if the event was not pending
    /// (another path holds it, or it already finished).
    pub async fn process(&self, event_id: &str) -> EventResult<Option<EventStatus>> {
        let claimed_at = now();
        let claim = {
            let mut db = self.store()?;
            db.claim_event(event_id, claimed_at)?
        };
        let event = match claim {
            EventClaim::Claimed(event) => event,
            EventClaim::NotPending => {
                debug!(event_id = %event_id, "Event already claimed or finished");
                return Ok(None);
            }
            EventClaim::Unreadable(reason) => {
                warn!(event_id = %event_id, "Marked unreadable event failed: {}", reason);
                return Ok(Some(EventStatus::Failed));
            }
        };

        let handlers = self.handlers.get(&event.event_type).cloned().unwrap_or_default();
        if handlers.is_empty() {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "No subscribers for event, marking failed"
            );
            self.store()?.finish_event(
                &event.event_id,
                claimed_at,
                EventStatus::Failed,
                &[],
                Some("no subscribers"),
                now(),
            )?;
            return Ok(Some(EventStatus::Failed));
        }

        let outcomes = self.run_handlers(&event, handlers).await;
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.ok)
            .map(|o| o.handler.as_str())
            .collect();

        let (status, error) = if failed.is_empty() {
            (EventStatus::Completed, None)
        } else {
            (
                EventStatus::Failed,
                Some(format!("handler(s) failed: {}", failed.join(", "))),
            )
        };

        let finished = self.store()?.finish_event(
            &event.event_id,
            claimed_at,
            status,
            &outcomes,
            error.as_deref(),
            now(),
        )?;
        if !finished {
            // The claim went stale and was released while handlers ran
            warn!(event_id = %event.event_id, "Claim lost before finishing event");
            return Ok(None);
        }

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            status = %status,
            "Processed event"
        );
        Ok(Some(status))
    }

    /// Run every handler in its own task, bounded by the handler timeout.
    async fn run_handlers(
        &self,
        event: &AgentEvent,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Vec<HandlerOutcome> {
        let timeout = self.config.handler_timeout();
        let shared = Arc::new(event.clone());

        let tasks: Vec<_> = handlers
            .into_iter()
            .map(|handler| {
                let event = Arc::clone(&shared);
                let name = handler.name().to_string();
                let task = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, handler.handle(&event)).await {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::TimedOut(timeout)),
                    }
                });
                (name, task)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(join_error) => Err(HandlerError::Panicked(join_error.to_string())),
            };
            match result {
                Ok(()) => outcomes.push(HandlerOutcome {
                    handler: name,
                    ok: true,
                    error: None,
                }),
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        handler = %name,
                        "Handler failed: {}",
                        e
                    );
                    outcomes.push(HandlerOutcome {
                        handler: name,
                        ok: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes
    }

    /// Release stale claims, then process every pending event.
    pub async fn run_recovery_scan(&self) -> EventResult<RecoveryReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_claim_after())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));

        let (released, pending) = {
            let db = self.store()?;
            let released = db.release_stale_claims(Utc::now() - stale_after)?;
            let pending = db.list_event_ids_by_status(EventStatus::Pending)?;
            (released, pending)
        };

        let mut report = RecoveryReport {
            released,
            scanned: pending.len(),
            ..RecoveryReport::default()
        };

        for event_id in pending {
            match self.process(&event_id).await {
                Ok(Some(EventStatus::Completed)) => report.completed += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(event_id = %event_id, "Recovery could not process event: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report.did_work() {
            info!(
                released = report.released,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "Recovery scan finished"
            );
        } else {
            debug!("Recovery scan found nothing to do");
        }
        Ok(report)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn get_event(&self, event_id: &str) -> EventResult<AgentEvent> {
        self.store()?
            .get_event(event_id)?
            .ok_or_else(|| EventError::NotFound(event_id.to_string()))
    }

    /// Events in a status, oldest first.
    pub fn list_events(&self, status: EventStatus) -> EventResult<Vec<AgentEvent>> {
        Ok(self.store()?.list_events_by_status(status)?)
    }

    /// Failed events awaiting operator follow-up. They are never retried automatically.
    pub fn failed_events(&self) -> EventResult<Vec<AgentEvent>> {
        self.list_events(EventStatus::Failed)
    }

    pub fn events_for_case(&self, case_id: &str) -> EventResult<Vec<AgentEvent>> {
        Ok(self.store()?.list_events_for_case(case_id)?)
    }

    fn store(&self) -> EventResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{event_types, EventTrigger};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: &AgentEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::failed("boom"))
            } else {
                Ok(())
            }
        }
    }

    struct Sleepy;

    #[async_trait]
    impl EventHandler for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn handle(&self, _event: &AgentEvent) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn shared_db() -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    fn persist(db: &Arc<Mutex<Database>>, event_type: &str) -> String {
        let event = AgentEvent::new(event_type, json!({}), EventTrigger::for_case("test", "c-1"));
        db.lock().unwrap().insert_event(&event).unwrap();
        event.event_id
    }

    #[tokio::test]
    async fn test_all_handlers_succeed() {
        let db = shared_db();
        let first = Counting::new("first", false);
        let second = Counting::new("second", false);
        let mut bus = EventBus::new(db.clone(), EventBusConfig::default());
        bus.subscribe(event_types::CASE_CREATED, first.clone());
        bus.subscribe(event_types::CASE_CREATED, second.clone());

        let id = persist(&db, event_types::CASE_CREATED);
        let status = bus.process(&id).await.unwrap();
        assert_eq!(status, Some(EventStatus::Completed));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        let stored = bus.get_event(&id).unwrap();
        assert_eq!(stored.outcomes.len(), 2);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_one_failure_fails_event_but_others_run() {
        let db = shared_db();
        let good = Counting::new("good", false);
        let bad = Counting::new("bad", true);
        let mut bus = EventBus::new(db.clone(), EventBusConfig::default());
        bus.subscribe(event_types::CASE_ASSIGNED, good.clone());
        bus.subscribe(event_types::CASE_ASSIGNED, bad.clone());

        let id = persist(&db, event_types::CASE_ASSIGNED);
        assert_eq!(bus.process(&id).await.unwrap(), Some(EventStatus::Failed));
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);

        let stored = bus.get_event(&id).unwrap();
        let failed: Vec<_> = stored.failed_handlers().map(|o| o.handler.clone()).collect();
        assert_eq!(failed, vec!["bad".to_string()]);
        assert!(stored.error.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_no_subscribers_fails() {
        let db = shared_db();
        let bus = EventBus::new(db.clone(), EventBusConfig::default());
        let id = persist(&db, "Orphan");
        assert_eq!(bus.process(&id).await.unwrap(), Some(EventStatus::Failed));
        assert_eq!(bus.failed_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processed_once() {
        let db = shared_db();
        let handler = Counting::new("once", false);
        let mut bus = EventBus::new(db.clone(), EventBusConfig::default());
        bus.subscribe("X", handler.clone());

        let id = persist(&db, "X");
        bus.process(&id).await.unwrap();
        assert_eq!(bus.process(&id).await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let db = shared_db();
        let config = EventBusConfig {
            handler_timeout_secs: 1,
            ..EventBusConfig::default()
        };
        let mut bus = EventBus::new(db.clone(), config);
        bus.subscribe("Slow", Arc::new(Sleepy));

        let id = persist(&db, "Slow");
        assert_eq!(bus.process(&id).await.unwrap(), Some(EventStatus::Failed));
        let stored = bus.get_event(&id).unwrap();
        assert!(stored.outcomes[0].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_recovery_scan_releases_stale_claims() {
        let db = shared_db();
        let handler = Counting::new("h", false);
        let mut bus = EventBus::new(db.clone(), EventBusConfig::default());
        bus.subscribe("X", handler.clone());

        let id = persist(&db, "X");
        db.lock()
            .unwrap()
            .claim_event(&id, Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        let report = bus.run_recovery_scan().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_scan_survives_unreadable_event() {
        let db = shared_db();
        let handler = Counting::new("h", false);
        let mut bus = EventBus::new(db.clone(), EventBusConfig::default());
        bus.subscribe(event_types::CASE_CREATED, handler.clone());

        db.lock()
            .unwrap()
            .conn()
            .execute(
                "INSERT INTO agent_events (event_id, event_type, payload, source, status, outcomes, created_at)
                 VALUES ('corrupt', 'CaseCreated', '{not json', 'test', 'pending', '[]', '2020-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();
        let good = persist(&db, event_types::CASE_CREATED);

        let report = bus.run_recovery_scan().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        assert_eq!(bus.get_event(&good).unwrap().status, EventStatus::Completed);
        assert_eq!(bus.get_event("corrupt").unwrap().status, EventStatus::Failed);

        let again = bus.run_recovery_scan().await.unwrap();
        assert!(!again.did_work());
    }

    #[tokio::test]
    async fn test_emit_delivers_in_process() {
        let db = shared_db();
        let handler = Counting::new("h", false);
        let mut bus = EventBus::new(db.clone(), EventBusConfig::default());
        bus.subscribe("X", handler.clone());
        let bus = Arc::new(bus);

        let id = bus
            .emit(AgentEvent::new("X", json!({}), EventTrigger::default()))
            .unwrap();

        for _ in 0..100 {
            if bus.get_event(&id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.get_event(&id).unwrap().status, EventStatus::Completed);
    }

    #[test]
    fn test_emit_without_runtime_stays_pending() {
        let db = shared_db();
        let bus = Arc::new(EventBus::new(db, EventBusConfig::default()));
        let id = bus
            .emit(AgentEvent::new("X", json!({}), EventTrigger::default()))
            .unwrap();
        assert_eq!(bus.get_event(&id).unwrap().status, EventStatus::Pending);
    }
}
