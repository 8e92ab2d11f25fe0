//! Subcommands. Every command prints its result as pretty JSON on stdout.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use rescue_dispatch_agents::TRIAGE_AGENT;
use rescue_dispatch_core::{
    Actor, ActorRole, AgentContext, CaseStatus, Coordinate, DispatchSystem, EventStatus, Facility,
    NewCase, RecoveryReport,
};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Field unit self-registration and position reports
    #[command(subcommand)]
    Unit(UnitCommand),

    /// Facility registration
    #[command(subcommand)]
    Facility(FacilityCommand),

    /// Emergency cases
    #[command(subcommand)]
    Case(CaseCommand),

    /// Inspect and recover the event log
    #[command(subcommand)]
    Events(EventsCommand),

    /// Suggest a priority for a free-text report
    Triage {
        /// What the caller said
        message: String,
    },

    /// Run the recovery worker until interrupted
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum UnitCommand {
    /// Register a field unit (or rename an existing one)
    Register { unit_id: String, name: String },

    /// Report position and availability
    Report {
        unit_id: String,
        #[command(flatten)]
        at: Location,
        /// Mark the unit as busy
        #[arg(long)]
        unavailable: bool,
    },

    /// List field units
    List,
}

#[derive(Subcommand, Debug)]
pub enum FacilityCommand {
    /// Register or update a facility
    Register {
        facility_id: String,
        name: String,
        /// Geocoded latitude
        #[arg(long, requires = "lon", allow_negative_numbers = true)]
        lat: Option<f64>,
        /// Geocoded longitude
        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lon: Option<f64>,
        /// Service area centroid latitude, used when there is no geocode
        #[arg(long, requires = "area_lon", allow_negative_numbers = true)]
        area_lat: Option<f64>,
        #[arg(long, requires = "area_lat", allow_negative_numbers = true)]
        area_lon: Option<f64>,
        /// Service tags, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List facilities
    List,
}

#[derive(Subcommand, Debug)]
pub enum CaseCommand {
    /// Report an emergency and auto-assign the best responder
    Report {
        patient_id: String,
        #[command(flatten)]
        at: Location,
        /// 1 (lowest) to 5 (highest)
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        note: Option<String>,
    },

    /// Move a case to its next status
    Status {
        case_id: String,
        status: CaseStatus,
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        note: Option<String>,
    },

    /// Acknowledge a case
    Ack {
        case_id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Show one case with its log
    Show { case_id: String },

    /// List cases assigned to a responder, or in a given status
    List {
        #[arg(long, conflicts_with = "status")]
        responder: Option<String>,
        #[arg(long)]
        status: Option<CaseStatus>,
        /// Include completed cases when listing by responder
        #[arg(long, requires = "responder")]
        all: bool,
    },

    /// Cases still waiting for a responder
    Backlog,

    /// Retry automatic assignment for an unassigned case
    Retry { case_id: String },
}

#[derive(Subcommand, Debug)]
pub enum EventsCommand {
    /// List events in a status (default: pending)
    List {
        #[arg(long, default_value = "pending")]
        status: EventStatus,
    },

    /// Events whose handlers failed
    Failed,

    /// Show one event
    Show { event_id: String },

    /// Run one recovery scan now
    Scan,
}

#[derive(Args, Debug)]
pub struct Location {
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,
}

impl Location {
    fn coordinate(&self) -> Result<Coordinate> {
        Ok(Coordinate::new(self.lat, self.lon)?)
    }
}

#[derive(Args, Debug)]
pub struct ActorArgs {
    /// Id of whoever is acting
    #[arg(long = "as", value_name = "ID")]
    actor_id: String,
    #[arg(long, default_value = "field_unit")]
    role: ActorRole,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        Actor::new(self.actor_id.clone(), self.role)
    }
}

pub async fn run(system: &DispatchSystem, command: Command) -> Result<()> {
    match command {
        Command::Unit(cmd) => run_unit(system, cmd),
        Command::Facility(cmd) => run_facility(system, cmd),
        Command::Case(cmd) => run_case(system, cmd).await,
        Command::Events(cmd) => run_events(system, cmd).await,
        Command::Triage { message } => {
            let output = system
                .route(TRIAGE_AGENT, &AgentContext::session("cli"), json!(message))
                .await?;
            print_json(&output.into_value())
        }
        Command::Serve => serve(system).await,
    }
}

fn run_unit(system: &DispatchSystem, cmd: UnitCommand) -> Result<()> {
    match cmd {
        UnitCommand::Register { unit_id, name } => {
            print_json(&system.register_field_unit(&unit_id, &name)?)
        }
        UnitCommand::Report {
            unit_id,
            at,
            unavailable,
        } => print_json(&system.report_field_unit(&unit_id, at.coordinate()?, !unavailable)?),
        UnitCommand::List => print_json(&system.field_units()?),
    }
}

fn run_facility(system: &DispatchSystem, cmd: FacilityCommand) -> Result<()> {
    match cmd {
        FacilityCommand::Register {
            facility_id,
            name,
            lat,
            lon,
            area_lat,
            area_lon,
            tags,
        } => {
            let mut facility = Facility::new(facility_id, name);
            facility.geocode = optional_coordinate(lat, lon)?;
            facility.area = optional_coordinate(area_lat, area_lon)?;
            facility.tags = tags;
            print_json(&system.register_facility(facility)?)
        }
        FacilityCommand::List => print_json(&system.facilities()?),
    }
}

async fn run_case(system: &DispatchSystem, cmd: CaseCommand) -> Result<()> {
    let engine = system.engine();
    match cmd {
        CaseCommand::Report {
            patient_id,
            at,
            priority,
            note,
        } => {
            let mut request = NewCase::new(patient_id, at.coordinate()?);
            request.priority = priority;
            request.note = note;
            let created = engine.create_case(request)?;
            settle(system, &created.case.case_id).await;
            print_json(&created)
        }
        CaseCommand::Status {
            case_id,
            status,
            actor,
            note,
        } => {
            let case = engine.update_status(&case_id, status, actor.actor(), note)?;
            settle(system, &case_id).await;
            print_json(&case)
        }
        CaseCommand::Ack { case_id, actor } => {
            let case = engine.acknowledge(&case_id, actor.actor())?;
            settle(system, &case_id).await;
            print_json(&case)
        }
        CaseCommand::Show { case_id } => print_json(&engine.get_case(&case_id)?),
        CaseCommand::List {
            responder,
            status,
            all,
        } => match (responder, status) {
            (Some(responder), _) => print_json(&engine.cases_for_responder(&responder, !all)?),
            (None, Some(status)) => print_json(&engine.cases_by_status(status)?),
            (None, None) => bail!("Pass --responder or --status"),
        },
        CaseCommand::Backlog => print_json(&engine.unassigned_backlog()?),
        CaseCommand::Retry { case_id } => {
            let outcome = engine.retry_assignment(&case_id)?;
            settle(system, &case_id).await;
            print_json(&outcome)
        }
    }
}

async fn run_events(system: &DispatchSystem, cmd: EventsCommand) -> Result<()> {
    let bus = system.bus();
    match cmd {
        EventsCommand::List { status } => print_json(&bus.list_events(status)?),
        EventsCommand::Failed => print_json(&bus.failed_events()?),
        EventsCommand::Show { event_id } => print_json(&bus.get_event(&event_id)?),
        EventsCommand::Scan => {
            let report = bus.run_recovery_scan().await?;
            print_json(&report_json(&report))
        }
    }
}

/// Run the recovery worker until Ctrl-C.
async fn serve(system: &DispatchSystem) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = system.spawn_recovery(shutdown_rx);
    info!(
        interval_secs = system.config().events.recovery_interval_secs,
        "Recovery worker running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    // Receiver may already be gone if the worker exited
    let _ = shutdown_tx.send(true);
    worker.await.context("Recovery worker panicked")?;
    Ok(())
}

/// Give in-process delivery for a case a chance to finish before exiting.
///
/// Anything still pending afterwards is picked up by the next recovery scan.
async fn settle(system: &DispatchSystem, case_id: &str) {
    let deadline = Instant::now() + system.config().events.handler_timeout();
    loop {
        let done = match system.bus().events_for_case(case_id) {
            Ok(events) => events.iter().all(|e| e.status.is_terminal()),
            Err(e) => {
                warn!(case_id, error = %e, "Could not check event delivery");
                return;
            }
        };
        if done || Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn optional_coordinate(lat: Option<f64>, lon: Option<f64>) -> Result<Option<Coordinate>> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Ok(Some(Coordinate::new(lat, lon)?)),
        _ => Ok(None),
    }
}

fn report_json(report: &RecoveryReport) -> serde_json::Value {
    json!({
        "released": report.released,
        "scanned": report.scanned,
        "completed": report.completed,
        "failed": report.failed,
        "skipped": report.skipped,
        "errors": report.errors,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}
