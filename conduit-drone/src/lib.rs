// Conduit Drone
//
// A ground-station pipeline on conduit worker pools: heartbeat exchange,
// telemetry sampling and command decisions against one vehicle, served to
// the worker processes over a local socket.

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod pipeline;
pub mod telemetry;
pub mod vehicle;

pub use command::{Command, CommandInput, CommandRequest, CommandSettings, Position};
pub use config::DroneConfig;
pub use connection::{Connection, SimulatedDrone, VehicleCommand};
pub use error::{DroneError, LinkError};
pub use heartbeat::HeartbeatState;
pub use pipeline::{DronePipeline, ReportQueues, Reports, RequestSchedule, RequestTick};
pub use telemetry::TelemetryData;
pub use vehicle::{VehicleClient, VehicleServer};
