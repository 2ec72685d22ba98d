// End-to-end tests of the drone pipeline against the simulated vehicle

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use conduit::{logging, ExitSignal, StopReason};
    use conduit_drone::connection::{Connection, SimulatedDrone, VehicleCommand};
    use conduit_drone::{DroneConfig, DronePipeline, HeartbeatState, Position, RequestTick, VehicleServer};

    const SHUTDOWN_BOUND: Duration = Duration::from_secs(5);

    // Workers are separate processes and reach the vehicle through the server.
    fn assemble(config: &DroneConfig, drone: &Arc<SimulatedDrone>, exit: ExitSignal) -> (VehicleServer, DronePipeline) {
        let server = VehicleServer::start(drone.clone()).unwrap();
        let pipeline = DronePipeline::build(config, Arc::new(server.client()), exit).unwrap();
        (server, pipeline)
    }

    fn fast_config(run_for: Duration) -> DroneConfig {
        let mut config = DroneConfig::default();
        config.orchestrator.run_duration = run_for;
        config.orchestrator.loop_sleep = Duration::from_millis(20);
        config.orchestrator.poll_timeout = Duration::from_millis(50);
        config.mission.target = Position::new(10.0, 20.0, 30.0);
        config.mission.heartbeat_period = Duration::from_millis(30);
        config.mission.heartbeat_timeout = Duration::from_millis(10);
        config.mission.disconnect_threshold = 3;
        config.mission.telemetry_window = Duration::from_millis(200);
        config.mission.telemetry_recv_timeout = Duration::from_millis(20);
        config.mission.command_request_period = Duration::from_millis(100);
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_pipeline_steers_toward_target() {
        logging::init_test();
        let config = fast_config(Duration::from_millis(600));
        let drone = Arc::new(SimulatedDrone::new());
        let (_server, mut pipeline) = assemble(&config, &drone, ExitSignal::new().unwrap());
        let reports = pipeline.reports.clone();

        pipeline.orchestrator.start().unwrap();
        let mut heartbeats = Vec::new();
        let mut commands = Vec::new();
        let outcome = pipeline
            .orchestrator
            .run(|_| {
                let batch = reports.collect();
                heartbeats.extend(batch.heartbeats);
                commands.extend(batch.commands);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(outcome.reason, StopReason::DurationElapsed);

        let start = Instant::now();
        let report = pipeline.orchestrator.shutdown().unwrap();
        assert!(start.elapsed() < SHUTDOWN_BOUND);
        assert_eq!(report.joined.len(), 4);
        assert_eq!(report.crashed(), 0);
        pipeline.orchestrator.reset().unwrap();

        assert!(!heartbeats.is_empty());
        assert!(heartbeats.iter().all(|s| *s == HeartbeatState::Connected));
        assert!(drone.heartbeats_received() > 0);

        assert!(commands.iter().any(|c| c == "CHANGE ALTITUDE: 30"), "reports: {commands:?}");
        assert!(commands.iter().any(|c| c.starts_with("CHANGE YAW: ")), "reports: {commands:?}");
        assert_eq!(drone.position().z, 30.0);
        assert!(drone
            .commands()
            .iter()
            .any(|c| matches!(c, VehicleCommand::ChangeYaw { .. })));
    }

    #[test]
    fn test_missing_heartbeats_reported_as_disconnected() {
        logging::init_test();
        let config = fast_config(Duration::from_secs(5));
        let drone = Arc::new(SimulatedDrone::new());
        drone.set_heartbeats(false);

        let (_server, mut pipeline) = assemble(&config, &drone, ExitSignal::new().unwrap());
        let reports = pipeline.reports.clone();
        pipeline.orchestrator.start().unwrap();

        let mut states = Vec::new();
        let outcome = pipeline
            .orchestrator
            .run(|_| {
                states.extend(reports.collect().heartbeats);
                if states.last() == Some(&HeartbeatState::Disconnected) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Stopped);

        // Threshold 3: two Connected reports precede the first Disconnected.
        let first_disconnect = states.iter().position(|s| *s == HeartbeatState::Disconnected).unwrap();
        assert_eq!(first_disconnect, 2);
        assert!(states[..2].iter().all(|s| *s == HeartbeatState::Connected));

        let report = pipeline.orchestrator.shutdown().unwrap();
        assert_eq!(report.crashed(), 0);
    }

    #[test]
    fn test_closed_link_stops_main_loop_and_shuts_down() {
        logging::init_test();
        let config = fast_config(Duration::from_secs(5));
        let drone = Arc::new(SimulatedDrone::new());
        let (_server, mut pipeline) = assemble(&config, &drone, ExitSignal::new().unwrap());
        pipeline.orchestrator.start().unwrap();

        let mut ticks = 0;
        let outcome = pipeline
            .orchestrator
            .run(|_| {
                ticks += 1;
                if ticks == 5 {
                    drone.disconnect();
                }
                if drone.is_connected() {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Stopped);

        let start = Instant::now();
        let report = pipeline.orchestrator.shutdown().unwrap();
        assert!(start.elapsed() < SHUTDOWN_BOUND);
        assert_eq!(report.crashed(), 0);
        assert!(pipeline.telemetry.is_empty());
        assert!(pipeline.reports.commands.is_empty());
    }

    #[test]
    fn test_external_exit_request_stops_run() {
        logging::init_test();
        let config = fast_config(Duration::from_secs(5));
        let exit = ExitSignal::new().unwrap();
        let drone = Arc::new(SimulatedDrone::new());
        let (_server, mut pipeline) = assemble(&config, &drone, exit.clone());
        pipeline.orchestrator.start().unwrap();

        let requester = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            exit.request();
        });
        let outcome = pipeline.orchestrator.run(|_| ControlFlow::Continue(())).unwrap();
        requester.join().unwrap();

        assert_eq!(outcome.reason, StopReason::ExitRequested);
        assert!(outcome.elapsed < Duration::from_secs(5));
        let report = pipeline.orchestrator.shutdown().unwrap();
        assert_eq!(report.joined.len(), 4);
    }

    #[test]
    fn test_command_requests_answered_and_drained_in_order() {
        logging::init_test();
        let config = fast_config(Duration::from_secs(5));
        let drone = Arc::new(SimulatedDrone::new().with_velocity(2.0, 0.0, 0.0));
        let (_server, mut pipeline) = assemble(&config, &drone, ExitSignal::new().unwrap());
        let reports = pipeline.reports.clone();
        pipeline.orchestrator.start().unwrap();

        let requests = &mut pipeline.requests;
        let mut sent = Vec::new();
        let mut commands = Vec::new();
        let outcome = pipeline
            .orchestrator
            .run(|_| {
                if let RequestTick::Sent(sequence) = requests.tick(Instant::now()) {
                    sent.push(sequence);
                }
                commands.extend(reports.collect().commands);
                if commands.iter().any(|c| c.starts_with("STATUS 1: ")) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Stopped, "reports: {commands:?}");
        assert!(sent.starts_with(&[0, 1]));
        assert!(commands.iter().any(|c| c.starts_with("STATUS 0: ")));

        let report = pipeline.orchestrator.shutdown().unwrap();
        let drained: Vec<&str> = report.drained.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            drained,
            vec!["command_reports", "command_requests", "telemetry", "heartbeat_reports"]
        );
        assert_eq!(report.crashed(), 0);
        assert!(pipeline.requests.queue().is_empty());
    }
}
