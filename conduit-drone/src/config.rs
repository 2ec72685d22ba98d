use std::path::Path;
use std::time::Duration;

use conduit::config::duration_ms;
use conduit::{ConfigError, LogSettings, OrchestratorConfig, PipelineConfig};
use serde::Deserialize;

use crate::command::{CommandSettings, Position};
use crate::heartbeat::{DEFAULT_DISCONNECT_THRESHOLD, DEFAULT_HEARTBEAT_PERIOD};
use crate::telemetry::{DEFAULT_RECV_TIMEOUT, DEFAULT_SAMPLE_WINDOW};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SIMULATION_STEP: Duration = Duration::from_millis(50);
const DEFAULT_COMMAND_REQUEST_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_COMMAND_REQUEST_CAPACITY: usize = 4;

/// Where to fly and how to talk to the vehicle.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MissionSettings {
    pub target: Position,
    pub command: CommandSettings,

    #[serde(rename = "heartbeat_period_ms", deserialize_with = "duration_ms::deserialize")]
    pub heartbeat_period: Duration,

    /// Consecutive missed heartbeats before the link is reported disconnected.
    pub disconnect_threshold: u32,

    #[serde(rename = "heartbeat_timeout_ms", deserialize_with = "duration_ms::deserialize")]
    pub heartbeat_timeout: Duration,

    #[serde(rename = "telemetry_window_ms", deserialize_with = "duration_ms::deserialize")]
    pub telemetry_window: Duration,

    #[serde(rename = "telemetry_recv_timeout_ms", deserialize_with = "duration_ms::deserialize")]
    pub telemetry_recv_timeout: Duration,

    /// How long to wait for the first heartbeat before giving up.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "duration_ms::deserialize")]
    pub connect_timeout: Duration,

    /// How often the orchestrator sends the command role a status request.
    #[serde(rename = "command_request_period_ms", deserialize_with = "duration_ms::deserialize")]
    pub command_request_period: Duration,

    /// Capacity of the command request queue; 0 means unbounded.
    pub command_request_capacity: usize,
}

impl Default for MissionSettings {
    fn default() -> Self {
        Self {
            target: Position::new(10.0, 20.0, 30.0),
            command: CommandSettings::default(),
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            disconnect_threshold: DEFAULT_DISCONNECT_THRESHOLD,
            heartbeat_timeout: DEFAULT_HEARTBEAT_PERIOD,
            telemetry_window: DEFAULT_SAMPLE_WINDOW,
            telemetry_recv_timeout: DEFAULT_RECV_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_request_period: DEFAULT_COMMAND_REQUEST_PERIOD,
            command_request_capacity: DEFAULT_COMMAND_REQUEST_CAPACITY,
        }
    }
}

/// Instances per worker role.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerCounts {
    pub heartbeat_sender: usize,
    pub heartbeat_receiver: usize,
    pub telemetry: usize,
    pub command: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            heartbeat_sender: 1,
            heartbeat_receiver: 1,
            telemetry: 1,
            command: 1,
        }
    }
}

/// Initial state of the simulated vehicle.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSettings {
    pub start: Position,
    pub velocity: Position,
    /// Radians
    pub yaw: f64,
    #[serde(rename = "step_ms", deserialize_with = "duration_ms::deserialize")]
    pub step: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            start: Position::default(),
            velocity: Position::new(1.0, 0.5, 0.0),
            yaw: 0.0,
            step: DEFAULT_SIMULATION_STEP,
        }
    }
}

/// Top-level configuration for the `conduit-drone` binary.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DroneConfig {
    pub orchestrator: OrchestratorConfig,
    pub logging: LogSettings,
    pub mission: MissionSettings,
    pub workers: WorkerCounts,
    pub simulation: SimulationSettings,
}

impl DroneConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: DroneConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&source)
    }

    /// The orchestrator and logging sections on their own.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            orchestrator: self.orchestrator.clone(),
            logging: self.logging.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline().validate()?;

        let mission = &self.mission;
        if mission.disconnect_threshold == 0 {
            return Err(invalid("disconnect_threshold must be at least 1"));
        }
        if mission.heartbeat_period.is_zero() {
            return Err(invalid("heartbeat_period_ms must be greater than 0"));
        }
        if mission.telemetry_window.is_zero() || mission.telemetry_recv_timeout.is_zero() {
            return Err(invalid("telemetry timeouts must be greater than 0"));
        }
        if mission.command_request_period.is_zero() {
            return Err(invalid("command_request_period_ms must be greater than 0"));
        }

        let tolerances = [
            mission.command.height_tolerance,
            mission.command.angle_tolerance,
            mission.command.turning_speed,
        ];
        if tolerances.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(invalid("command tolerances must be finite and non-negative"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
