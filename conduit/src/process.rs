//! Forked worker instance processes.
//!
//! Every instance is a child of the orchestrating process, created with
//! `fork` so that it inherits the entry computation, its arguments and
//! the shared exit signal mapping. The child reaches its queues over an
//! instance link (see [`link`](crate::link)) and leaves through
//! `process::exit`, never by returning into the parent's call stack.
//!
//! Exit codes:
//! - `0`: the entry computation returned
//! - `101`: it panicked; the message is sent over the link first
//! - `70`: the link could not be set up
//! - `75`: the parent process disappeared
//!
//! Anything else, including death by a signal, comes from the entry itself.

use std::io;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error};
use uuid::Uuid;

use crate::link::{Bridge, Broker, Link};
use crate::spec::Launch;

const PANIC_EXIT: i32 = 101;
const LINK_FAILED_EXIT: i32 = 70;
const ORPHANED_EXIT: i32 = 75;

/// How often a child checks that the orchestrating process is still there.
const PARENT_CHECK: Duration = Duration::from_millis(500);

/// How a reaped instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Crashed(String),
}

/// Parent-side handle on one instance process.
#[derive(Debug)]
pub(crate) struct InstanceProcess {
    index: usize,
    pid: Pid,
    stream: Option<UnixStream>,
    broker: Option<Broker>,
    status: Option<WaitStatus>,
}

impl InstanceProcess {
    /// Fork instance `index` of `spec`.
    ///
    /// The child blocks on its first queue operation until [`attach`](Self::attach)
    /// starts the broker.
    pub(crate) fn fork(spec: &dyn Launch, index: usize, pool_id: Uuid) -> io::Result<Self> {
        let (parent_end, child_end) = UnixStream::pair()?;
        let parent = std::process::id();

        // SAFETY: the child only uses memory it inherited or allocates itself,
        // and leaves through `process::exit` without unwinding into the caller.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                drop(child_end);
                debug!(pid = child.as_raw(), instance = index, "Forked instance");
                Ok(Self {
                    index,
                    pid: child,
                    stream: Some(parent_end),
                    broker: None,
                    status: None,
                })
            }
            ForkResult::Child => {
                drop(parent_end);
                let code = run_child(spec, index, pool_id, parent, child_end);
                std::process::exit(code)
            }
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Start serving the instance's queue operations against `bridge`.
    ///
    /// On failure the parent's end of the link is closed, so the child sees
    /// its queues as disconnected.
    pub(crate) fn attach(&mut self, role: &str, bridge: Bridge) -> io::Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "instance already attached"))?;
        let broker = Broker::spawn(format!("{role}-{}-link", self.index), stream, bridge)?;
        self.broker = Some(broker);
        Ok(())
    }

    /// Whether the process has terminated. Reaps it if so; never blocks.
    pub(crate) fn has_exited(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) if is_terminal(status) => {
                self.status = Some(status);
                true
            }
            Ok(_) => false,
            Err(err) => {
                debug!(pid = self.pid(), error = %err, "Could not poll instance");
                err == Errno::ECHILD
            }
        }
    }

    /// Block until the process terminates, then stop its broker.
    pub(crate) fn wait(mut self) -> Outcome {
        let status = match self.status.take() {
            Some(status) => Ok(status),
            None => wait_terminal(self.pid),
        };
        let panic_message = self.broker.take().and_then(Broker::finish);

        match status {
            Ok(WaitStatus::Exited(_, 0)) => Outcome::Completed,
            Ok(WaitStatus::Exited(_, code)) => match panic_message {
                Some(message) => Outcome::Crashed(format!("panicked: {message}")),
                None => Outcome::Crashed(format!("exited with status {code}")),
            },
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                Outcome::Crashed(format!("killed by signal {}", signal.as_str()))
            }
            Ok(other) => Outcome::Crashed(format!("unexpected wait status {other:?}")),
            Err(err) => Outcome::Crashed(format!("could not be reaped: {err}")),
        }
    }
}

fn is_terminal(status: WaitStatus) -> bool {
    matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..))
}

fn wait_terminal(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status) if is_terminal(status) => return Ok(status),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

fn run_child(spec: &dyn Launch, index: usize, pool_id: Uuid, parent: u32, stream: UnixStream) -> i32 {
    // Ctrl+C reaches the whole process group; shutdown is the orchestrator's call.
    // SAFETY: installing SIG_IGN runs no handler code.
    if let Err(err) = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) } {
        debug!(error = %err, "Could not ignore SIGINT");
    }
    watch_parent(parent);

    let role = spec.role();
    let span = crate::instance_span!(role, index, pool_id = %pool_id, pid = std::process::id());
    let _guard = span.enter();

    let link = match Link::new(stream) {
        Ok(link) => Arc::new(link),
        Err(err) => {
            crate::log_error!(err, role = role, instance = index);
            return LINK_FAILED_EXIT;
        }
    };

    crate::log_lifecycle!(role, index, "started");
    match panic::catch_unwind(AssertUnwindSafe(|| spec.run_linked(index, Arc::clone(&link)))) {
        Ok(()) => {
            crate::log_lifecycle!(role, index, "stopped");
            0
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(role = role, instance = index, message = %message, "Instance panicked");
            link.report_panic(&message);
            PANIC_EXIT
        }
    }
}

/// Exit once the orchestrating process is gone, so no instance outlives it.
fn watch_parent(parent: u32) {
    let spawned = thread::Builder::new()
        .name("parent-watch".to_string())
        .spawn(move || loop {
            if std::os::unix::process::parent_id() != parent {
                std::process::exit(ORPHANED_EXIT);
            }
            thread::sleep(PARENT_CHECK);
        });
    if let Err(err) = spawned {
        debug!(error = %err, "Could not start parent watch");
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
