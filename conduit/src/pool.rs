//! # Worker Pool
//!
//! A [`WorkerPool`] owns the live instances spawned from one [`WorkerSpec`].
//! Each instance is a separate OS process forked from the caller, so a crash
//! in one instance (a panic, an abort, a fatal signal) cannot corrupt the
//! memory of its peers or of the orchestrator. Instances reach their queues
//! through a per-instance link served by a broker thread in this process.
//!
//! ## Lifecycle
//! `Unstarted --start--> Running --join--> Joined`
//!
//! - Pools never stop instances themselves; instances leave their loops when
//!   they observe the shared [`ExitSignal`](crate::ExitSignal)
//! - `join` blocks until every instance process has terminated. An instance
//!   that never polls the signal blocks `join` forever;
//!   [`WorkerPool::all_finished`] lets callers detect that without blocking
//! - An instance that exits with a non-zero status or is killed by a signal
//!   is reported and logged, never restarted
//! - Instances exit on their own if the process that started them dies

use std::fmt;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{InstanceCrash, PoolError, SpecError};
use crate::process::{InstanceProcess, Outcome};
use crate::queue::QueueItem;
use crate::spec::{Launch, WorkerSpec};

/// States a pool can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Pool has been created but no instance is running yet
    Unstarted,
    /// Instances have been spawned
    Running,
    /// Every instance has terminated and been joined
    Joined,
}

/// Outcome of [`WorkerPool::join`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinReport {
    /// Indices of instances that returned normally
    pub completed: Vec<usize>,
    /// Instances that panicked, exited non-zero, or were killed
    pub crashed: Vec<InstanceCrash>,
}

impl JoinReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.crashed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.crashed.is_empty()
    }
}

/// Live instances of one worker role.
pub struct WorkerPool {
    id: Uuid,
    spec: Box<dyn Launch>,
    state: PoolState,
    instances: Vec<InstanceProcess>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("role", &self.spec.role())
            .field("count", &self.spec.count())
            .field("state", &self.state)
            .field("pids", &self.pids())
            .finish()
    }
}

impl WorkerPool {
    /// Create an unstarted pool from a validated spec.
    pub fn create<A, I, O>(spec: WorkerSpec<A, I, O>) -> Result<Self, PoolError>
    where
        A: Clone + Send + Sync + 'static,
        I: QueueItem,
        O: QueueItem,
    {
        if spec.count() == 0 {
            return Err(PoolError::InvalidSpec(SpecError::ZeroCount(spec.count())));
        }

        let cpus = num_cpus::get();
        if spec.count() > cpus {
            warn!(
                role = spec.role(),
                count = spec.count(),
                cpus = cpus,
                "Instance count exceeds available CPUs"
            );
        }

        let pool = Self {
            id: Uuid::new_v4(),
            spec: Box::new(spec),
            state: PoolState::Unstarted,
            instances: Vec::new(),
        };
        debug!(pool_id = %pool.id, role = pool.role(), "Pool created");
        Ok(pool)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> &str {
        self.spec.role()
    }

    /// Number of instances this pool spawns on `start`.
    pub fn instance_count(&self) -> usize {
        self.spec.count()
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Process ids of the live (not yet joined) instances.
    pub fn pids(&self) -> Vec<i32> {
        self.instances.iter().map(InstanceProcess::pid).collect()
    }

    /// Fork every instance, then start one link broker per instance. Valid
    /// only from `Unstarted`.
    ///
    /// If spawning instance `k` fails, instances `0..k` keep running, the pool
    /// moves to `Running` so they can still be joined, and the error is returned.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.state != PoolState::Unstarted {
            return Err(self.invalid_state("start"));
        }
        self.state = PoolState::Running;

        let span = crate::pool_span!(self.role(), self.instance_count(), pool_id = %self.id);
        let _guard = span.enter();

        // Brokers start after the last fork so no child inherits a broker
        // thread's half-held lock.
        let mut failure = None;
        for index in 0..self.spec.count() {
            match InstanceProcess::fork(self.spec.as_ref(), index, self.id) {
                Ok(instance) => self.instances.push(instance),
                Err(source) => {
                    failure = Some(self.spawn_error(index, source));
                    break;
                }
            }
        }

        for instance in &mut self.instances {
            if let Err(source) = instance.attach(self.spec.role(), self.spec.bridge()) {
                warn!(instance = instance.index(), error = %source, "Instance link unavailable");
                if failure.is_none() {
                    failure = Some(PoolError::Spawn {
                        name: self.spec.role().to_string(),
                        index: instance.index(),
                        source,
                    });
                }
            }
        }

        info!(count = self.instances.len(), pids = ?self.pids(), "Started worker instances");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until every instance process has terminated. Valid only from
    /// `Running`.
    pub fn join(&mut self) -> Result<JoinReport, PoolError> {
        if self.state != PoolState::Running {
            return Err(self.invalid_state("join"));
        }

        let mut report = JoinReport::default();
        for instance in self.instances.drain(..) {
            let index = instance.index();
            let pid = instance.pid();
            match instance.wait() {
                Outcome::Completed => report.completed.push(index),
                Outcome::Crashed(message) => {
                    let crash = InstanceCrash {
                        role: self.spec.role().to_string(),
                        index,
                        pid,
                        message,
                    };
                    crate::log_error!(crash, pool_id = %self.id);
                    report.crashed.push(crash);
                }
            }
        }
        self.state = PoolState::Joined;

        info!(
            pool_id = %self.id,
            role = self.role(),
            completed = report.completed.len(),
            crashed = report.crashed.len(),
            "Joined worker instances"
        );
        Ok(report)
    }

    /// Whether every spawned instance has terminated, without blocking.
    ///
    /// Terminated instances are reaped here; `join` still reports them.
    /// Always false before `start`, always true after `join`.
    pub fn all_finished(&mut self) -> bool {
        match self.state {
            PoolState::Unstarted => false,
            PoolState::Running => self.instances.iter_mut().all(InstanceProcess::has_exited),
            PoolState::Joined => true,
        }
    }

    fn spawn_error(&self, index: usize, source: std::io::Error) -> PoolError {
        PoolError::Spawn {
            name: self.spec.role().to_string(),
            index,
            source,
        }
    }

    fn invalid_state(&self, operation: &'static str) -> PoolError {
        PoolError::InvalidState {
            name: self.role().to_string(),
            operation,
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ExitSignal;
    use crate::spec::WorkerContext;
    use std::time::Duration;

    fn idle_until_exit(_: (), ctx: WorkerContext<(), ()>) {
        while !ctx.exit_signal().wait_timeout(Duration::from_millis(10)) {}
    }

    fn idle_pool(count: usize, exit: &ExitSignal) -> WorkerPool {
        let spec = WorkerSpec::create("idle", count, idle_until_exit, (), vec![], vec![], exit.clone()).unwrap();
        WorkerPool::create(spec).unwrap()
    }

    #[test]
    fn test_lifecycle_states() {
        let exit = ExitSignal::new().unwrap();
        let mut pool = idle_pool(2, &exit);
        assert_eq!(pool.state(), PoolState::Unstarted);
        assert!(!pool.all_finished());

        pool.start().unwrap();
        assert_eq!(pool.state(), PoolState::Running);

        exit.request();
        let report = pool.join().unwrap();
        assert_eq!(pool.state(), PoolState::Joined);
        assert_eq!(report.total(), 2);
        assert!(report.is_clean());
        assert!(pool.all_finished());
    }

    #[test]
    fn test_start_twice_is_error() {
        let exit = ExitSignal::new().unwrap();
        let mut pool = idle_pool(1, &exit);
        pool.start().unwrap();

        let err = pool.start().unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { operation: "start", state: PoolState::Running, .. }));

        exit.request();
        pool.join().unwrap();
        let err = pool.start().unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { state: PoolState::Joined, .. }));
    }

    #[test]
    fn test_join_before_start_is_error() {
        let exit = ExitSignal::new().unwrap();
        let mut pool = idle_pool(1, &exit);
        let err = pool.join().unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { operation: "join", state: PoolState::Unstarted, .. }));
    }

    #[test]
    fn test_instances_are_child_processes() {
        let exit = ExitSignal::new().unwrap();
        let mut pool = idle_pool(3, &exit);
        pool.start().unwrap();

        let pids = pool.pids();
        assert_eq!(pids.len(), 3);
        let own = std::process::id() as i32;
        assert!(pids.iter().all(|&pid| pid != own));
        assert_eq!(pids.iter().collect::<std::collections::HashSet<_>>().len(), 3);

        exit.request();
        pool.join().unwrap();
        assert!(pool.pids().is_empty());
    }

    #[test]
    fn test_exit_status_reported_as_crash() {
        let exit = ExitSignal::new().unwrap();
        let spec = WorkerSpec::create(
            "quitter",
            1,
            |_: (), _: WorkerContext<(), ()>| std::process::exit(3),
            (),
            vec![],
            vec![],
            exit.clone(),
        )
        .unwrap();
        let mut pool = WorkerPool::create(spec).unwrap();
        pool.start().unwrap();

        let report = pool.join().unwrap();
        assert!(report.completed.is_empty());
        assert_eq!(report.crashed[0].message, "exited with status 3");
    }
}
