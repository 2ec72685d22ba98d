//! # Drone Pipeline
//!
//! ```text
//! heartbeat_sender                    (no queues)
//! heartbeat_receiver ──► heartbeat_reports ──► orchestrator
//! telemetry ──► telemetry ──┐
//! orchestrator ──► command_requests ──┴──► command ──► command_reports ──► orchestrator
//! ```
//!
//! Shutdown drains `command_reports`, `command_requests`, `telemetry` and
//! finally `heartbeat_reports`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit::{ExitSignal, Orchestrator, QueueError, SharedQueue, WorkerPool, WorkerSpec};
use tracing::{info, warn};

use crate::command::{command_worker, CommandArgs, CommandInput, CommandRequest};
use crate::config::DroneConfig;
use crate::connection::Connection;
use crate::error::DroneError;
use crate::heartbeat::{
    heartbeat_receiver_worker, heartbeat_sender_worker, HeartbeatReceiverArgs, HeartbeatSenderArgs, HeartbeatState,
};
use crate::telemetry::{telemetry_worker, TelemetryArgs};

/// Reports collected from the pipeline's sink queues in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reports {
    pub heartbeats: Vec<HeartbeatState>,
    pub commands: Vec<String>,
}

impl Reports {
    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty() && self.commands.is_empty()
    }
}

/// The sink queues the orchestrator loop reads.
#[derive(Debug, Clone)]
pub struct ReportQueues {
    pub heartbeats: SharedQueue<HeartbeatState>,
    pub commands: SharedQueue<String>,
}

impl ReportQueues {
    /// Take everything currently waiting without blocking.
    pub fn collect(&self) -> Reports {
        Reports {
            heartbeats: std::iter::from_fn(|| self.heartbeats.try_get().ok()).collect(),
            commands: std::iter::from_fn(|| self.commands.try_get().ok()).collect(),
        }
    }
}

/// What one [`RequestSchedule::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTick {
    NotDue,
    Sent(u64),
    /// The queue refused the request; it is not retried.
    Dropped(u64),
}

/// Sends a numbered status request to the command role once per period.
#[derive(Debug)]
pub struct RequestSchedule {
    queue: SharedQueue<CommandInput>,
    period: Duration,
    next_due: Option<Instant>,
    sequence: u64,
}

impl RequestSchedule {
    pub fn new(queue: SharedQueue<CommandInput>, period: Duration) -> Self {
        Self {
            queue,
            period,
            next_due: None,
            sequence: 0,
        }
    }

    pub fn queue(&self) -> &SharedQueue<CommandInput> {
        &self.queue
    }

    /// Send the next request if one is due at `now`. The first call always
    /// sends. Never blocks: a full queue drops the request with a warning.
    pub fn tick(&mut self, now: Instant) -> RequestTick {
        if self.next_due.is_some_and(|due| now < due) {
            return RequestTick::NotDue;
        }
        self.next_due = Some(now + self.period);
        let sequence = self.sequence;
        self.sequence += 1;

        match self.queue.try_put(CommandRequest::Status { sequence }.into()) {
            Ok(()) => {
                info!(sequence, "Sent command request");
                RequestTick::Sent(sequence)
            }
            Err(QueueError::Full(_)) => {
                warn!(sequence, "Command request queue is full");
                RequestTick::Dropped(sequence)
            }
            Err(err) => {
                warn!(sequence, error = %err, "Command request not sent");
                RequestTick::Dropped(sequence)
            }
        }
    }
}

/// The assembled, unstarted pipeline.
#[derive(Debug)]
pub struct DronePipeline {
    pub orchestrator: Orchestrator,
    pub reports: ReportQueues,
    pub telemetry: SharedQueue<CommandInput>,
    pub requests: RequestSchedule,
}

impl DronePipeline {
    /// Build queues, specs and pools for every role and register the drain order.
    pub fn build(config: &DroneConfig, connection: Arc<dyn Connection>, exit: ExitSignal) -> Result<Self, DroneError> {
        let capacity = config.orchestrator.default_queue_capacity;
        let poll = config.orchestrator.poll_timeout;
        let mission = &config.mission;

        let heartbeat_reports = SharedQueue::new("heartbeat_reports", capacity);
        let telemetry = SharedQueue::new("telemetry", capacity);
        let command_requests = SharedQueue::new("command_requests", mission.command_request_capacity);
        let command_reports = SharedQueue::new("command_reports", capacity);

        let heartbeat_sender = WorkerSpec::builder(
            "heartbeat_sender",
            HeartbeatSenderArgs {
                connection: connection.clone(),
                period: mission.heartbeat_period,
            },
        )
        .count(config.workers.heartbeat_sender)
        .entry(heartbeat_sender_worker)
        .exit_signal(exit.clone())
        .poll_timeout(poll)
        .build()?;

        let heartbeat_receiver = WorkerSpec::builder(
            "heartbeat_receiver",
            HeartbeatReceiverArgs {
                connection: connection.clone(),
                period: mission.heartbeat_period,
                disconnect_threshold: mission.disconnect_threshold,
                recv_timeout: mission.heartbeat_timeout,
            },
        )
        .count(config.workers.heartbeat_receiver)
        .entry(heartbeat_receiver_worker)
        .output(heartbeat_reports.clone())
        .exit_signal(exit.clone())
        .poll_timeout(poll)
        .build()?;

        let telemetry_spec = WorkerSpec::builder(
            "telemetry",
            TelemetryArgs {
                connection: connection.clone(),
                sample_window: mission.telemetry_window,
                recv_timeout: mission.telemetry_recv_timeout,
            },
        )
        .count(config.workers.telemetry)
        .entry(telemetry_worker::<CommandInput>)
        .output(telemetry.clone())
        .exit_signal(exit.clone())
        .poll_timeout(poll)
        .build()?;

        let command = WorkerSpec::builder(
            "command",
            CommandArgs {
                connection,
                target: mission.target,
                settings: mission.command,
            },
        )
        .count(config.workers.command)
        .entry(command_worker)
        .input(telemetry.clone())
        .input(command_requests.clone())
        .output(command_reports.clone())
        .exit_signal(exit.clone())
        .poll_timeout(poll)
        .build()?;

        let mut orchestrator = Orchestrator::new(exit, config.orchestrator.clone());
        orchestrator
            .add_pool(WorkerPool::create(heartbeat_sender)?)?
            .add_pool(WorkerPool::create(heartbeat_receiver)?)?
            .add_pool(WorkerPool::create(telemetry_spec)?)?
            .add_pool(WorkerPool::create(command)?)?;
        orchestrator
            .drain_in_order(command_reports.clone())
            .drain_in_order(command_requests.clone())
            .drain_in_order(telemetry.clone())
            .drain_in_order(heartbeat_reports.clone());

        info!(pools = orchestrator.pools().len(), "Drone pipeline assembled");
        Ok(Self {
            orchestrator,
            reports: ReportQueues {
                heartbeats: heartbeat_reports,
                commands: command_reports,
            },
            telemetry,
            requests: RequestSchedule::new(command_requests, mission.command_request_period),
        })
    }
}

/// Block until the vehicle's first heartbeat arrives.
pub fn wait_for_heartbeat(connection: &dyn Connection, timeout: Duration) -> Result<(), DroneError> {
    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(100);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DroneError::NoHeartbeat(timeout));
        }
        if connection.recv_heartbeat(remaining.min(poll))? {
            info!("Vehicle heartbeat received");
            return Ok(());
        }
    }
}

/// Request exit on Ctrl+C.
///
/// Worker processes ignore SIGINT, so the interrupt ends the orchestrator loop
/// and shutdown drains and joins as usual. Only one handler can be installed
/// per process.
pub fn request_exit_on_interrupt(exit: ExitSignal) -> Result<(), DroneError> {
    ctrlc::set_handler(move || {
        info!("Keyboard interrupt received");
        exit.request();
    })?;
    Ok(())
}
