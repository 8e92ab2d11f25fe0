//! Rescue Dispatch Core Library
//!
//! Emergency dispatch engine with a durable, at-least-once event bus.
//!
//! # Architecture
//!
//! ```text
//! report emergency
//!        │
//!        ▼
//!  DispatchEngine::create_case ──► case (new) + log entry
//!        │
//!        ├──► ResponderDirectory ── nearest field units ──┐
//!        │                      └─ nearest facilities ────┤
//!        │                                                ▼
//!        │                               Geo Estimator: distance, ETA
//!        │                                                │
//!        │◄──────────────── best candidate ───────────────┘
//!        │
//!  ┌─────▼──────────────── one transaction ─────────────────────┐
//!  │ case (assigned | new)  +  CaseCreated, CaseAssigned | ...  │
//!  └─────┬──────────────────────────────────────────────────────┘
//!        │ deliver
//!        ▼
//!    EventBus ──► AgentSubscriber ──► Agent (pattern, notify, ...)
//!        ▲
//!        └── recovery worker (periodic scan of pending events)
//! ```
//!
//! # Core Principle
//!
//! **A case is never half-written.** Status, log entry and the events a
//! mutation caused are committed together or not at all.
//!
//! # Modules
//!
//! - [`geo`]: Haversine distance, ETA, deterministic location estimates
//! - [`models`]: Domain types (EmergencyCase, FieldUnit, Facility, AgentEvent, etc.)
//! - [`db`]: SQLite store for cases, responders and events
//! - [`directory`]: k-nearest responder queries
//! - [`dispatch`]: Ranking, assignment and the status lifecycle
//! - [`events`]: Event bus and recovery worker
//! - [`agents`]: Agent contract and registry
//! - [`config`]: Layered configuration

pub mod agents;
pub mod config;
pub mod db;
pub mod directory;
pub mod dispatch;
pub mod events;
pub mod geo;
pub mod models;

// Re-export commonly used types
pub use agents::{Agent, AgentContext, AgentError, AgentOutput, AgentRegistry, RouteError};
pub use config::{AppConfig, ConfigError, ConfigLoader};
pub use db::{Database, DbError};
pub use directory::ResponderDirectory;
pub use dispatch::{CaseCreation, DispatchEngine, DispatchError, NewCase};
pub use events::{EventBus, EventError, EventHandler, HandlerError, RecoveryReport};
pub use geo::{Coordinate, GeoError};
pub use models::{
    Actor, ActorRole, AgentEvent, CaseStatus, EmergencyCase, EventStatus, Facility, FieldUnit,
    Priority, ResponderKind,
};

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

// =========================================================================
// Error Type
// =========================================================================

#[derive(Debug, thiserror::Error)]
pub enum RescueError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<GeoError> for RescueError {
    fn from(e: GeoError) -> Self {
        RescueError::InvalidInput(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for RescueError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        RescueError::StoreUnavailable(format!("Lock poisoned: {}", e))
    }
}

pub type RescueResult<T> = Result<T, RescueError>;

// =========================================================================
// Main API Object
// =========================================================================

/// The wired system: store, event bus, engine and agent registry.
///
/// Built once at process start. Subscriptions from the configuration are
/// applied here and fail the build if they name an unknown agent.
pub struct DispatchSystem {
    db: Arc<Mutex<Database>>,
    engine: DispatchEngine,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    config: AppConfig,
}

impl DispatchSystem {
    /// Open the configured database file and wire everything up.
    pub fn open(config: AppConfig, registry: AgentRegistry) -> RescueResult<Self> {
        let db = Database::open(&config.storage.path)?;
        Self::with_database(db, config, registry)
    }

    /// Same as [`DispatchSystem::open`] over an in-memory database.
    pub fn open_in_memory(config: AppConfig, registry: AgentRegistry) -> RescueResult<Self> {
        Self::with_database(Database::open_in_memory()?, config, registry)
    }

    fn with_database(
        db: Database,
        config: AppConfig,
        registry: AgentRegistry,
    ) -> RescueResult<Self> {
        config.validate()?;
        let db = Arc::new(Mutex::new(db));

        let mut bus = EventBus::new(db.clone(), config.events.clone());
        for subscription in &config.subscriptions {
            registry.subscribe(&mut bus, &subscription.event, &subscription.agent)?;
        }
        let bus = Arc::new(bus);

        let engine = DispatchEngine::new(
            db.clone(),
            bus.clone(),
            config.dispatch.clone(),
            config.estimation.clone(),
        );

        info!(
            agents = registry.len(),
            subscriptions = config.subscriptions.len(),
            "Dispatch system ready"
        );

        Ok(Self {
            db,
            engine,
            bus,
            registry: Arc::new(registry),
            config,
        })
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Route an interactive turn to a named agent.
    pub async fn route(
        &self,
        agent: &str,
        ctx: &AgentContext,
        input: Value,
    ) -> RescueResult<AgentOutput> {
        Ok(self.registry.route(agent, ctx, input).await?)
    }

    /// Start the periodic recovery worker. Send `true` on `shutdown` to stop it.
    pub fn spawn_recovery(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        events::spawn_recovery(
            self.bus.clone(),
            self.config.events.recovery_interval(),
            shutdown,
        )
    }

    // =========================================================================
    // Responder self-report
    // =========================================================================

    /// Register a field unit. Re-registering only updates the name.
    pub fn register_field_unit(&self, unit_id: &str, name: &str) -> RescueResult<FieldUnit> {
        require_id("unit id", unit_id)?;
        let db = self.store()?;
        db.upsert_field_unit(&FieldUnit::new(unit_id.to_string(), name.to_string()))?;
        db.get_field_unit(unit_id)?
            .ok_or_else(|| DbError::NotFound(format!("field unit {}", unit_id)).into())
    }

    /// Apply a unit's periodic position and availability report.
    pub fn report_field_unit(
        &self,
        unit_id: &str,
        location: Coordinate,
        is_available: bool,
    ) -> RescueResult<FieldUnit> {
        let location = location.validated()?;
        let db = self.store()?;
        db.report_field_unit(unit_id, location, is_available, models::now())?;
        db.get_field_unit(unit_id)?
            .ok_or_else(|| DbError::NotFound(format!("field unit {}", unit_id)).into())
    }

    /// Add or update a facility.
    pub fn register_facility(&self, facility: Facility) -> RescueResult<Facility> {
        require_id("facility id", &facility.facility_id)?;
        let geocode = facility.geocode.map(Coordinate::validated).transpose()?;
        let area = facility.area.map(Coordinate::validated).transpose()?;
        let facility = Facility {
            geocode,
            area,
            ..facility
        };
        self.store()?.upsert_facility(&facility)?;
        Ok(facility)
    }

    pub fn field_units(&self) -> RescueResult<Vec<FieldUnit>> {
        Ok(self.store()?.list_field_units()?)
    }

    pub fn facilities(&self) -> RescueResult<Vec<Facility>> {
        Ok(self.store()?.list_facilities()?)
    }

    fn store(&self) -> RescueResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }
}

fn require_id(what: &str, id: &str) -> RescueResult<()> {
    if id.trim().is_empty() {
        return Err(RescueError::InvalidInput(format!("{} is required", what)));
    }
    Ok(())
}
