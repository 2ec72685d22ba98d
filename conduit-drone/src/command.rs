//! # Command Decisions
//!
//! Turns telemetry into vehicle commands steering toward a fixed target:
//!
//! - **Altitude**: when `|target.z - z|` exceeds the height tolerance, command
//!   a climb or descent to `target.z`.
//! - **Yaw**: the desired heading is `atan2(target.y - y, target.x - x)`. When
//!   the wrapped difference from the current yaw exceeds the angle tolerance
//!   (in degrees), command a relative turn by that difference.
//!
//! Each issued command yields a report string for the orchestrator to log.
//! A command the link refuses is logged and produces no report.
//!
//! The orchestrator can also send [`CommandRequest`]s on a second input:
//! a status query answered with the average velocity, or a new target.

use std::sync::Arc;

use conduit::{consume_loop, WorkerContext, WorkerError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::connection::{wrap_angle, Connection, VehicleCommand};
use crate::telemetry::TelemetryData;

/// A point in the local frame, in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Requests from the orchestrator to the command role.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CommandRequest {
    /// Report the average velocity seen so far.
    Status { sequence: u64 },
    /// Steer toward a new target from the next reading on.
    Retarget(Position),
}

/// Everything the command role reads: telemetry and requests share one item type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CommandInput {
    Telemetry(TelemetryData),
    Request(CommandRequest),
}

impl From<TelemetryData> for CommandInput {
    fn from(data: TelemetryData) -> Self {
        CommandInput::Telemetry(data)
    }
}

impl From<CommandRequest> for CommandInput {
    fn from(request: CommandRequest) -> Self {
        CommandInput::Request(request)
    }
}

/// Tolerances and rates for command decisions.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandSettings {
    /// Metres
    pub height_tolerance: f64,
    /// Degrees
    pub angle_tolerance: f64,
    /// Degrees per second
    pub turning_speed: f64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            height_tolerance: 0.5,
            angle_tolerance: 5.0,
            turning_speed: 5.0,
        }
    }
}

#[derive(Debug)]
pub struct Command {
    connection: Arc<dyn Connection>,
    target: Position,
    settings: CommandSettings,
    velocity_sum: [f64; 3],
    samples: u64,
}

impl Command {
    pub fn new(connection: Arc<dyn Connection>, target: Position, settings: CommandSettings) -> Self {
        Self {
            connection,
            target,
            settings,
            velocity_sum: [0.0; 3],
            samples: 0,
        }
    }

    /// Mean velocity over every reading seen so far.
    pub fn average_velocity(&self) -> Option<[f64; 3]> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(self.velocity_sum.map(|sum| sum / n))
    }

    pub fn target(&self) -> Position {
        self.target
    }

    /// Answer an orchestrator request. Returns the report lines.
    pub fn handle(&mut self, request: &CommandRequest) -> Vec<String> {
        let report = match *request {
            CommandRequest::Status { sequence } => match self.average_velocity() {
                Some([vx, vy, vz]) => format!("STATUS {sequence}: average velocity ({vx:.2}, {vy:.2}, {vz:.2})"),
                None => format!("STATUS {sequence}: no telemetry yet"),
            },
            CommandRequest::Retarget(target) => {
                self.target = target;
                format!("NEW TARGET: ({:.2}, {:.2}, {:.2})", target.x, target.y, target.z)
            }
        };
        info!("{report}");
        vec![report]
    }

    /// Decide on and send commands for one reading. Returns the report lines.
    pub fn run(&mut self, data: &TelemetryData) -> Result<Vec<String>, WorkerError> {
        let readings = [data.x, data.y, data.z, data.x_velocity, data.y_velocity, data.z_velocity, data.yaw];
        if readings.iter().any(|v| !v.is_finite()) {
            return Err(WorkerError::MalformedData(format!("non-finite telemetry: {data}")));
        }

        self.velocity_sum[0] += data.x_velocity;
        self.velocity_sum[1] += data.y_velocity;
        self.velocity_sum[2] += data.z_velocity;
        self.samples += 1;
        info!(average_velocity = ?self.average_velocity(), "Average velocity");

        let mut reports = Vec::new();

        let height_diff = self.target.z - data.z;
        if height_diff.abs() > self.settings.height_tolerance {
            let command = VehicleCommand::ChangeAltitude { altitude: self.target.z };
            match self.connection.send_command(command) {
                Ok(()) => {
                    let report = format!("CHANGE ALTITUDE: {height_diff}");
                    info!("{report}");
                    reports.push(report);
                }
                Err(err) => error!(error = %err, "Failed to send altitude command"),
            }
        }

        let yaw_diff_deg = heading_error(&self.target, data).to_degrees();
        if yaw_diff_deg.abs() > self.settings.angle_tolerance {
            let command = VehicleCommand::ChangeYaw {
                angle_deg: yaw_diff_deg,
                speed_deg_s: self.settings.turning_speed,
                direction: if yaw_diff_deg > 0.0 { -1 } else { 1 },
            };
            match self.connection.send_command(command) {
                Ok(()) => {
                    let report = format!("CHANGE YAW: {yaw_diff_deg}");
                    info!("{report}");
                    reports.push(report);
                }
                Err(err) => error!(error = %err, "Failed to send yaw command"),
            }
        }

        Ok(reports)
    }
}

/// Signed angle in radians from the current yaw to the bearing of `target`,
/// wrapped into `(-PI, PI]`.
pub fn heading_error(target: &Position, data: &TelemetryData) -> f64 {
    let desired = (target.y - data.y).atan2(target.x - data.x);
    wrap_angle(desired - wrap_angle(data.yaw))
}

#[derive(Debug, Clone)]
pub struct CommandArgs {
    pub connection: Arc<dyn Connection>,
    pub target: Position,
    pub settings: CommandSettings,
}

/// Consumer role: telemetry and requests in, command reports out.
pub fn command_worker(args: CommandArgs, ctx: WorkerContext<CommandInput, String>) {
    let mut command = Command::new(args.connection, args.target, args.settings);
    info!(goal = ?args.target, "Starting command loop");
    consume_loop(&ctx, |_, input| match input {
        CommandInput::Telemetry(data) => command.run(&data),
        CommandInput::Request(request) => Ok(command.handle(&request)),
    });
}
