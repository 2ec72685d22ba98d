use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use conduit::{logging, ExitSignal};
use conduit_drone::connection::{Connection, SimulatedDrone};
use conduit_drone::pipeline::{request_exit_on_interrupt, wait_for_heartbeat, DronePipeline};
use conduit_drone::{DroneConfig, HeartbeatState, VehicleServer};
use tracing::{info, warn};

fn load_config() -> Result<DroneConfig> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => DroneConfig::load(&path).with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(DroneConfig::default()),
    }
}

fn init_logging(config: &DroneConfig) -> Result<()> {
    let log_config = config.logging.to_log_config()?;
    match &config.logging.file_path {
        Some(path) => logging::init_with_file(log_config, path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?,
        None => logging::init(log_config),
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config)?;

    let sim = &config.simulation;
    let drone = Arc::new(
        SimulatedDrone::new()
            .with_position(sim.start.x, sim.start.y, sim.start.z)
            .with_velocity(sim.velocity.x, sim.velocity.y, sim.velocity.z)
            .with_yaw(sim.yaw)
            .with_step(sim.step),
    );
    wait_for_heartbeat(&*drone, config.mission.connect_timeout)?;

    let server = VehicleServer::start(drone.clone()).context("Failed to start the vehicle server")?;
    info!(socket = %server.path().display(), "Serving vehicle to workers");

    let exit = ExitSignal::new().context("Failed to create the exit signal")?;
    let mut pipeline = DronePipeline::build(&config, Arc::new(server.client()), exit.clone())?;
    let reports = pipeline.reports.clone();

    request_exit_on_interrupt(exit)?;

    pipeline.orchestrator.start()?;
    info!("Started worker pools");

    let requests = &mut pipeline.requests;
    let outcome = pipeline.orchestrator.run(|_| {
        if !drone.is_connected() {
            warn!("Drone disconnected");
            return ControlFlow::Break(());
        }

        let batch = reports.collect();
        for state in &batch.heartbeats {
            info!(%state, "Received heartbeat report");
        }
        if batch.heartbeats.last() == Some(&HeartbeatState::Disconnected) {
            warn!("Vehicle heartbeat lost");
        }
        for line in &batch.commands {
            info!(report = %line, "Received command report");
        }

        requests.tick(Instant::now());
        ControlFlow::Continue(())
    })?;
    info!(iterations = outcome.iterations, reason = ?outcome.reason, "Main loop finished");

    let report = pipeline.orchestrator.shutdown()?;
    info!(
        discarded = report.discarded(),
        crashed = report.crashed(),
        commands_sent = drone.commands().len(),
        "Pipeline stopped"
    );

    pipeline.orchestrator.reset()?;
    Ok(())
}
