//! # Orchestrator
//!
//! Sequences a pipeline's lifetime: start every pool, run the caller's loop
//! (the pipeline's final consumer and periodic producer), then shut down.
//! The orchestrator lives in the parent process; it owns the queues that the
//! instance processes reach through their links, so draining here empties
//! them for every instance.
//!
//! ## Shutdown order
//! 1. Request exit on the shared signal
//! 2. Drain queues in the order they were registered with
//!    [`Orchestrator::drain_in_order`], which must be sink first, source last.
//!    A late item from an upstream stage that has not yet seen the request
//!    then lands in a queue that is drained after, never in one already
//!    abandoned
//! 3. Join every pool
//!
//! After a shutdown, [`Orchestrator::reset`] clears the signal so it can be
//! reused for another run.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::pool::{JoinReport, PoolState, WorkerPool};
use crate::queue::Drain;
use crate::signal::ExitSignal;

/// Why [`Orchestrator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured run duration elapsed
    DurationElapsed,
    /// The tick callback returned `ControlFlow::Break`
    Stopped,
    /// Something else requested exit on the shared signal
    ExitRequested,
}

/// Summary of one [`Orchestrator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub iterations: u64,
    pub elapsed: Duration,
    pub reason: StopReason,
}

/// What [`Orchestrator::shutdown`] did, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queue name and items discarded, in drain order
    pub drained: Vec<(String, usize)>,
    /// Pool role and its join outcome, in registration order
    pub joined: Vec<(String, JoinReport)>,
}

impl ShutdownReport {
    pub fn discarded(&self) -> usize {
        self.drained.iter().map(|(_, n)| n).sum()
    }

    pub fn crashed(&self) -> usize {
        self.joined.iter().map(|(_, report)| report.crashed.len()).sum()
    }
}

/// Owns a pipeline's pools and its drain order.
pub struct Orchestrator {
    exit: ExitSignal,
    config: OrchestratorConfig,
    pools: Vec<WorkerPool>,
    drain_order: Vec<Box<dyn Drain>>,
    started: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("exit", &self.exit)
            .field("pools", &self.pools)
            .field("drain_order", &self.drain_order.iter().map(|q| q.name()).collect::<Vec<_>>())
            .field("started", &self.started)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(exit: ExitSignal, config: OrchestratorConfig) -> Self {
        Self {
            exit,
            config,
            pools: Vec::new(),
            drain_order: Vec::new(),
            started: false,
        }
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Register a pool. Pools start in registration order.
    pub fn add_pool(&mut self, pool: WorkerPool) -> Result<&mut Self, OrchestratorError> {
        if self.started {
            return Err(OrchestratorError::AlreadyStarted);
        }
        self.pools.push(pool);
        Ok(self)
    }

    /// Register the next queue to drain on shutdown. Call sink first.
    pub fn drain_in_order(&mut self, queue: impl Drain + 'static) -> &mut Self {
        self.drain_order.push(Box::new(queue));
        self
    }

    /// Start every registered pool.
    ///
    /// If a pool fails to start, the pipeline is shut down (exit requested,
    /// queues drained, running pools joined) and the start error returned.
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        if self.started {
            return Err(OrchestratorError::AlreadyStarted);
        }
        self.started = true;

        for index in 0..self.pools.len() {
            if let Err(err) = self.pools[index].start() {
                warn!(role = self.pools[index].role(), error = %err, "Pool failed to start, shutting down");
                self.shutdown()?;
                return Err(err.into());
            }
        }

        info!(pools = self.pools.len(), "Started worker pools");
        Ok(())
    }

    /// Run `tick` every `loop_sleep` until the run duration elapses, `tick`
    /// breaks, or exit is requested elsewhere.
    pub fn run<F>(&mut self, mut tick: F) -> Result<RunOutcome, OrchestratorError>
    where
        F: FnMut(&ExitSignal) -> ControlFlow<()>,
    {
        self.try_run(|exit| Ok::<_, anyhow::Error>(tick(exit)))
    }

    /// Like [`run`](Self::run), but a failing `tick` ends the loop and its
    /// error is returned as [`OrchestratorError::Other`]. Exit is not
    /// requested; call [`shutdown`](Self::shutdown) afterwards as usual.
    pub fn try_run<F, E>(&mut self, mut tick: F) -> Result<RunOutcome, OrchestratorError>
    where
        F: FnMut(&ExitSignal) -> Result<ControlFlow<()>, E>,
        E: Into<anyhow::Error>,
    {
        if !self.started {
            return Err(OrchestratorError::NotStarted);
        }

        let start = Instant::now();
        let mut iterations = 0;
        let reason = loop {
            if self.exit.is_requested() {
                break StopReason::ExitRequested;
            }
            if start.elapsed() >= self.config.run_duration {
                break StopReason::DurationElapsed;
            }

            iterations += 1;
            match tick(&self.exit) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break StopReason::Stopped,
                Err(err) => {
                    let err = err.into();
                    warn!(error = %err, iterations, "Orchestrator loop failed");
                    return Err(OrchestratorError::Other(err));
                }
            }

            // Early wake-up only happens on an external exit request, caught above.
            self.exit.wait_timeout(self.config.loop_sleep);
        };

        let outcome = RunOutcome {
            iterations,
            elapsed: start.elapsed(),
            reason,
        };
        info!(?outcome, "Orchestrator loop finished");
        Ok(outcome)
    }

    /// Request exit, drain queues in registered order, join every pool.
    pub fn shutdown(&mut self) -> Result<ShutdownReport, OrchestratorError> {
        if !self.started {
            return Err(OrchestratorError::NotStarted);
        }

        self.exit.request();
        info!("Requested exit");

        let mut report = ShutdownReport::default();
        for queue in &self.drain_order {
            let discarded = queue.drain_and_discard();
            debug!(queue = queue.name(), discarded, "Queue drained");
            report.drained.push((queue.name().to_string(), discarded));
        }
        info!(discarded = report.discarded(), "Queues cleared");

        for pool in &mut self.pools {
            if pool.state() != PoolState::Running {
                continue;
            }
            let joined = pool.join()?;
            report.joined.push((pool.role().to_string(), joined));
        }

        if report.crashed() > 0 {
            warn!(crashed = report.crashed(), "Some worker instances crashed");
        }
        info!("Stopped");
        Ok(report)
    }

    /// Clear the exit signal after a completed shutdown.
    pub fn reset(&mut self) -> Result<(), OrchestratorError> {
        if let Some(pool) = self.pools.iter().find(|p| p.state() == PoolState::Running) {
            return Err(OrchestratorError::StillRunning(pool.role().to_string()));
        }
        self.exit.clear();
        Ok(())
    }
}
