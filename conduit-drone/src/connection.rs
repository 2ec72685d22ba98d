//! # Vehicle Link
//!
//! [`Connection`] is everything the workers need from the vehicle: heartbeats
//! in both directions, telemetry messages and commands. Every worker role
//! holds one behind an `Arc`.
//!
//! [`SimulatedDrone`] is an in-memory vehicle used by the binary's default
//! setup and by the tests. It emits telemetry in real time, one message per
//! step; its clock advances by that step on every message and its position
//! integrates the current velocity. Worker processes reach it through
//! [`vehicle`](crate::vehicle).

use std::f64::consts::PI;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::LinkError;

/// Vehicle position and velocity in the local north-east-down frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalPosition {
    pub time_boot_ms: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

/// Vehicle orientation in radians and angular rates in radians per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub time_boot_ms: u64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub roll_speed: f64,
    pub pitch_speed: f64,
    pub yaw_speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TelemetryMessage {
    Attitude(Attitude),
    LocalPosition(LocalPosition),
}

/// Commands the ground station can issue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VehicleCommand {
    /// Climb or descend to an absolute altitude in metres.
    ChangeAltitude { altitude: f64 },
    /// Turn by a relative angle. `direction` is -1 or 1.
    ChangeYaw {
        angle_deg: f64,
        speed_deg_s: f64,
        direction: i8,
    },
}

/// A link to one vehicle.
pub trait Connection: Send + Sync + fmt::Debug {
    fn send_heartbeat(&self) -> Result<(), LinkError>;

    /// Wait up to `timeout` for a heartbeat. `Ok(false)` means none arrived.
    fn recv_heartbeat(&self, timeout: Duration) -> Result<bool, LinkError>;

    /// Wait up to `timeout` for the next attitude or position message.
    fn recv_telemetry(&self, timeout: Duration) -> Result<Option<TelemetryMessage>, LinkError>;

    fn send_command(&self, command: VehicleCommand) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;
}

const DEFAULT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct SimState {
    connected: bool,
    heartbeats_enabled: bool,
    telemetry_enabled: bool,
    position: LocalPosition,
    attitude: Attitude,
    time_boot_ms: u64,
    attitude_next: bool,
    next_due: Instant,
    heartbeats_received: u64,
    commands: Vec<VehicleCommand>,
}

/// In-memory vehicle.
#[derive(Debug)]
pub struct SimulatedDrone {
    state: Mutex<SimState>,
    step: Duration,
}

impl Default for SimulatedDrone {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDrone {
    /// A hovering vehicle at the origin, facing north, sending heartbeats.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                connected: true,
                heartbeats_enabled: true,
                telemetry_enabled: true,
                position: LocalPosition::default(),
                attitude: Attitude::default(),
                time_boot_ms: 0,
                attitude_next: true,
                next_due: Instant::now(),
                heartbeats_received: 0,
                commands: Vec::new(),
            }),
            step: DEFAULT_STEP,
        }
    }

    pub fn with_position(self, x: f64, y: f64, z: f64) -> Self {
        {
            let mut state = self.lock();
            state.position.x = x;
            state.position.y = y;
            state.position.z = z;
        }
        self
    }

    pub fn with_velocity(self, vx: f64, vy: f64, vz: f64) -> Self {
        {
            let mut state = self.lock();
            state.position.vx = vx;
            state.position.vy = vy;
            state.position.vz = vz;
        }
        self
    }

    pub fn with_yaw(self, yaw: f64) -> Self {
        self.lock().attitude.yaw = wrap_angle(yaw);
        self
    }

    /// Time between telemetry messages, both simulated and on the wall clock.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn set_heartbeats(&self, enabled: bool) {
        self.lock().heartbeats_enabled = enabled;
    }

    pub fn set_telemetry(&self, enabled: bool) {
        self.lock().telemetry_enabled = enabled;
    }

    /// Close the link. Every later call fails with [`LinkError::Closed`].
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    pub fn heartbeats_received(&self) -> u64 {
        self.lock().heartbeats_received
    }

    pub fn commands(&self) -> Vec<VehicleCommand> {
        self.lock().commands.clone()
    }

    pub fn position(&self) -> LocalPosition {
        self.lock().position
    }

    pub fn yaw(&self) -> f64 {
        self.lock().attitude.yaw
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> Result<MutexGuard<'_, SimState>, LinkError> {
        let state = self.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(LinkError::Closed)
        }
    }
}

impl Connection for SimulatedDrone {
    fn send_heartbeat(&self) -> Result<(), LinkError> {
        let mut state = self.connected()?;
        state.heartbeats_received += 1;
        trace!(count = state.heartbeats_received, "Vehicle received heartbeat");
        Ok(())
    }

    fn recv_heartbeat(&self, timeout: Duration) -> Result<bool, LinkError> {
        if self.connected()?.heartbeats_enabled {
            return Ok(true);
        }
        thread::sleep(timeout);
        Ok(false)
    }

    fn recv_telemetry(&self, timeout: Duration) -> Result<Option<TelemetryMessage>, LinkError> {
        // Claim the next send slot so concurrent readers share one message rate.
        let slot = {
            let mut state = self.connected()?;
            let now = Instant::now();
            let due = state.next_due.max(now);
            if state.telemetry_enabled && due <= now + timeout {
                state.next_due = due + self.step;
                Some(due)
            } else {
                None
            }
        };
        let Some(due) = slot else {
            thread::sleep(timeout);
            return Ok(None);
        };
        thread::sleep(due.saturating_duration_since(Instant::now()));

        let mut state = self.connected()?;
        let dt = self.step.as_secs_f64();
        state.time_boot_ms += self.step.as_millis() as u64;
        let now = state.time_boot_ms;

        let position = &mut state.position;
        position.x += position.vx * dt;
        position.y += position.vy * dt;
        position.z += position.vz * dt;
        position.time_boot_ms = now;
        state.attitude.time_boot_ms = now;

        state.attitude_next = !state.attitude_next;
        let message = if state.attitude_next {
            TelemetryMessage::LocalPosition(state.position)
        } else {
            TelemetryMessage::Attitude(state.attitude)
        };
        Ok(Some(message))
    }

    fn send_command(&self, command: VehicleCommand) -> Result<(), LinkError> {
        let mut state = self.connected()?;
        match command {
            VehicleCommand::ChangeAltitude { altitude } => {
                if !altitude.is_finite() {
                    return Err(LinkError::Rejected(format!("altitude {altitude}")));
                }
                state.position.z = altitude;
            }
            // The simulator turns by the signed angle; direction is only recorded.
            VehicleCommand::ChangeYaw { angle_deg, .. } => {
                if !angle_deg.is_finite() {
                    return Err(LinkError::Rejected(format!("yaw angle {angle_deg}")));
                }
                state.attitude.yaw = wrap_angle(state.attitude.yaw + angle_deg.to_radians());
            }
        }
        debug!(?command, "Vehicle accepted command");
        state.commands.push(command);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// Wrap an angle in radians into `(-PI, PI]`.
pub fn wrap_angle(mut angle: f64) -> f64 {
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle <= -PI {
        angle += 2.0 * PI;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_alternates_and_advances_clock() {
        let drone = SimulatedDrone::new().with_velocity(1.0, 0.0, 0.0).with_step(Duration::from_millis(100));

        let first = drone.recv_telemetry(Duration::from_secs(1)).unwrap().unwrap();
        let second = drone.recv_telemetry(Duration::from_secs(1)).unwrap().unwrap();

        match (first, second) {
            (TelemetryMessage::Attitude(attitude), TelemetryMessage::LocalPosition(position)) => {
                assert_eq!(attitude.time_boot_ms, 100);
                assert_eq!(position.time_boot_ms, 200);
                assert!((position.x - 0.2).abs() < 1e-9);
            }
            other => panic!("unexpected message order: {other:?}"),
        }
    }

    #[test]
    fn test_telemetry_paced_one_message_per_step() {
        let step = Duration::from_millis(20);
        let drone = SimulatedDrone::new().with_step(step);

        let window = Duration::from_millis(300);
        let start = Instant::now();
        let mut received = 0;
        while start.elapsed() < window {
            if drone.recv_telemetry(Duration::from_millis(50)).unwrap().is_some() {
                received += 1;
            }
        }

        // One immediately, then one per step.
        let bound = (start.elapsed().as_millis() / step.as_millis()) as usize + 1;
        assert!(received <= bound, "{received} messages in {:?}", start.elapsed());
        assert!(received >= 5);
    }

    #[test]
    fn test_short_timeout_returns_none_before_next_slot() {
        let drone = SimulatedDrone::new().with_step(Duration::from_secs(10));
        assert!(drone.recv_telemetry(Duration::ZERO).unwrap().is_some());

        let start = Instant::now();
        assert_eq!(drone.recv_telemetry(Duration::from_millis(30)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_missing_heartbeat_waits_for_timeout() {
        let drone = SimulatedDrone::new();
        assert!(drone.recv_heartbeat(Duration::ZERO).unwrap());

        drone.set_heartbeats(false);
        let start = Instant::now();
        assert!(!drone.recv_heartbeat(Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_commands_move_vehicle() {
        let drone = SimulatedDrone::new().with_position(0.0, 0.0, 5.0);
        drone.send_command(VehicleCommand::ChangeAltitude { altitude: 30.0 }).unwrap();
        drone
            .send_command(VehicleCommand::ChangeYaw {
                angle_deg: 90.0,
                speed_deg_s: 5.0,
                direction: -1,
            })
            .unwrap();

        assert_eq!(drone.position().z, 30.0);
        assert!((drone.yaw() - PI / 2.0).abs() < 1e-9);
        assert_eq!(drone.commands().len(), 2);
    }

    #[test]
    fn test_non_finite_command_rejected() {
        let drone = SimulatedDrone::new();
        let err = drone
            .send_command(VehicleCommand::ChangeAltitude { altitude: f64::NAN })
            .unwrap_err();
        assert!(matches!(err, LinkError::Rejected(_)));
        assert!(drone.commands().is_empty());
    }

    #[test]
    fn test_disconnected_link_fails_every_call() {
        let drone = SimulatedDrone::new();
        drone.disconnect();
        assert!(!drone.is_connected());
        assert_eq!(drone.send_heartbeat(), Err(LinkError::Closed));
        assert_eq!(drone.recv_heartbeat(Duration::ZERO), Err(LinkError::Closed));
        assert!(drone.recv_telemetry(Duration::ZERO).is_err());
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-9);
        assert!((wrap_angle(-PI) - PI).abs() < 1e-9);
        assert!((wrap_angle(0.5) - 0.5).abs() < 1e-9);
    }
}
