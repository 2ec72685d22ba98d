//! Telemetry sampling: pair the latest attitude and position messages into
//! one [`TelemetryData`] reading.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit::{produce_loop, QueueItem, WorkerContext, WorkerError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::{Attitude, Connection, LocalPosition, TelemetryMessage};

/// Default time allowed to collect both halves of a reading.
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(1);
/// Default timeout for each individual telemetry receive.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// One combined position + attitude reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryData {
    pub time_since_boot_ms: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub x_velocity: f64,
    pub y_velocity: f64,
    pub z_velocity: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub roll_speed: f64,
    pub pitch_speed: f64,
    pub yaw_speed: f64,
}

impl TelemetryData {
    fn combine(position: &LocalPosition, attitude: &Attitude) -> Self {
        Self {
            time_since_boot_ms: position.time_boot_ms.max(attitude.time_boot_ms),
            x: position.x,
            y: position.y,
            z: position.z,
            x_velocity: position.vx,
            y_velocity: position.vy,
            z_velocity: position.vz,
            roll: attitude.roll,
            pitch: attitude.pitch,
            yaw: attitude.yaw,
            roll_speed: attitude.roll_speed,
            pitch_speed: attitude.pitch_speed,
            yaw_speed: attitude.yaw_speed,
        }
    }
}

impl fmt::Display for TelemetryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={}ms pos=({:.2}, {:.2}, {:.2}) vel=({:.2}, {:.2}, {:.2}) rpy=({:.3}, {:.3}, {:.3})",
            self.time_since_boot_ms,
            self.x,
            self.y,
            self.z,
            self.x_velocity,
            self.y_velocity,
            self.z_velocity,
            self.roll,
            self.pitch,
            self.yaw
        )
    }
}

/// Reads telemetry messages off a connection.
#[derive(Debug)]
pub struct Telemetry {
    connection: Arc<dyn Connection>,
    sample_window: Duration,
    recv_timeout: Duration,
}

impl Telemetry {
    pub fn new(connection: Arc<dyn Connection>, sample_window: Duration, recv_timeout: Duration) -> Self {
        Self {
            connection,
            sample_window,
            recv_timeout,
        }
    }

    /// Collect one attitude and one position message within the sample window.
    ///
    /// Returns [`WorkerError::Timeout`] if either half is missing when the
    /// window closes.
    pub fn run(&mut self) -> Result<TelemetryData, WorkerError> {
        let deadline = Instant::now() + self.sample_window;
        let mut attitude = None;
        let mut position = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WorkerError::Timeout(self.sample_window));
            }

            let message = self
                .connection
                .recv_telemetry(remaining.min(self.recv_timeout))
                .map_err(|e| WorkerError::Connection(e.to_string()))?;

            match message {
                Some(TelemetryMessage::Attitude(a)) => {
                    debug!(time_boot_ms = a.time_boot_ms, "Received attitude");
                    attitude = Some(a);
                }
                Some(TelemetryMessage::LocalPosition(p)) => {
                    debug!(time_boot_ms = p.time_boot_ms, "Received local position");
                    position = Some(p);
                }
                None => {}
            }

            if let (Some(p), Some(a)) = (&position, &attitude) {
                return Ok(TelemetryData::combine(p, a));
            }
        }
    }
}

/// Arguments for [`telemetry_worker`].
#[derive(Debug, Clone)]
pub struct TelemetryArgs {
    pub connection: Arc<dyn Connection>,
    pub sample_window: Duration,
    pub recv_timeout: Duration,
}

/// Source role: publish a [`TelemetryData`] reading as soon as one is complete.
///
/// The vehicle sends telemetry at its own rate and every receive waits for
/// the next message, so the loop needs no period of its own.
pub fn telemetry_worker<O>(args: TelemetryArgs, ctx: WorkerContext<(), O>)
where
    O: From<TelemetryData> + QueueItem + Clone,
{
    let mut telemetry = Telemetry::new(args.connection, args.sample_window, args.recv_timeout);
    info!("Starting telemetry loop");
    produce_loop(&ctx, Duration::ZERO, || match telemetry.run() {
        Ok(data) => {
            debug!(%data, "Telemetry reading");
            Ok(vec![O::from(data)])
        }
        Err(err @ WorkerError::Connection(_)) => {
            ctx.exit_signal().wait_timeout(args.sample_window);
            Err(err)
        }
        Err(err) => Err(err),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SimulatedDrone;
    use crate::vehicle::VehicleServer;
    use conduit::{ExitSignal, SharedQueue, WorkerPool, WorkerSpec};

    #[test]
    fn test_run_combines_position_and_attitude() {
        let drone = SimulatedDrone::new()
            .with_position(1.0, 2.0, 3.0)
            .with_velocity(0.0, 0.0, 1.0)
            .with_yaw(0.25)
            .with_step(Duration::from_millis(100));
        let mut telemetry = Telemetry::new(Arc::new(drone), DEFAULT_SAMPLE_WINDOW, DEFAULT_RECV_TIMEOUT);

        let data = telemetry.run().unwrap();
        assert_eq!(data.time_since_boot_ms, 200);
        assert_eq!(data.x, 1.0);
        assert!((data.z - 3.2).abs() < 1e-9);
        assert_eq!(data.z_velocity, 1.0);
        assert_eq!(data.yaw, 0.25);
    }

    #[test]
    fn test_run_times_out_without_messages() {
        let drone = SimulatedDrone::new();
        drone.set_telemetry(false);
        let window = Duration::from_millis(60);
        let mut telemetry = Telemetry::new(Arc::new(drone), window, Duration::from_millis(20));

        let start = Instant::now();
        assert_eq!(telemetry.run(), Err(WorkerError::Timeout(window)));
        assert!(start.elapsed() >= window);
    }

    #[test]
    fn test_run_reports_closed_link() {
        let drone = SimulatedDrone::new();
        drone.disconnect();
        let mut telemetry = Telemetry::new(Arc::new(drone), DEFAULT_SAMPLE_WINDOW, DEFAULT_RECV_TIMEOUT);

        assert!(matches!(telemetry.run(), Err(WorkerError::Connection(_))));
    }

    #[test]
    fn test_worker_output_bounded_by_vehicle_rate() {
        let step = Duration::from_millis(20);
        let drone = Arc::new(SimulatedDrone::new().with_step(step));
        let server = VehicleServer::start(drone).unwrap();
        let args = TelemetryArgs {
            connection: Arc::new(server.client()),
            sample_window: DEFAULT_SAMPLE_WINDOW,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        };

        let exit = ExitSignal::new().unwrap();
        let readings = SharedQueue::unbounded("telemetry");
        let spec = WorkerSpec::create(
            "telemetry",
            1,
            telemetry_worker::<TelemetryData>,
            args,
            vec![],
            vec![readings.clone()],
            exit.clone(),
        )
        .unwrap();
        let mut pool = WorkerPool::create(spec).unwrap();

        let start = Instant::now();
        pool.start().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        exit.request();
        assert!(pool.join().unwrap().is_clean());
        let elapsed = start.elapsed();

        // Two messages per reading, one message per step.
        let produced = readings.drain_and_discard();
        let bound = (elapsed.as_millis() / (2 * step.as_millis())) as usize + 1;
        assert!(produced >= 3, "only {produced} readings");
        assert!(produced <= bound, "{produced} readings in {elapsed:?}");
    }

    #[test]
    fn test_display_is_single_line() {
        let text = TelemetryData::default().to_string();
        assert!(text.starts_with("t=0ms"));
        assert!(!text.contains('\n'));
    }
}
