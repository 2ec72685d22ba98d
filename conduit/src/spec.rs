//! # Worker Specifications
//!
//! A [`WorkerSpec`] is the immutable description of one worker role: how many
//! instances to run, the entry computation, its fixed arguments, and the
//! queues it reads from and writes to.
//!
//! Business arguments travel in the typed `args` value; framework arguments
//! (queues, exit signal, instance index) travel in the [`WorkerContext`] each
//! instance receives. Each instance runs in its own process, so the args are
//! a per-process copy: share state through queues, not through the args. An
//! entry computation therefore looks like:
//!
//! ```rust
//! use std::time::Duration;
//! use conduit::{ExitSignal, QueueError, SharedQueue, WorkerContext, WorkerSpec};
//!
//! #[derive(Clone)]
//! struct DoublerArgs {
//!     factor: u32,
//! }
//!
//! fn doubler(args: DoublerArgs, ctx: WorkerContext<u32, u32>) {
//!     while !ctx.is_exit_requested() {
//!         let Ok(n) = ctx.inputs()[0].get(Duration::from_millis(100)) else {
//!             continue;
//!         };
//!         match ctx.outputs()[0].put_timeout(n * args.factor, ctx.poll_timeout()) {
//!             Ok(()) => {}
//!             Err(QueueError::Full(dropped)) => eprintln!("output full, dropped {dropped}"),
//!             Err(err) => {
//!                 eprintln!("leaving: {err}");
//!                 break;
//!             }
//!         }
//!     }
//! }
//!
//! # fn main() -> std::io::Result<()> {
//! let input = SharedQueue::unbounded("numbers");
//! let output = SharedQueue::unbounded("doubled");
//! let spec = WorkerSpec::create(
//!     "doubler",
//!     2,
//!     doubler,
//!     DoublerArgs { factor: 2 },
//!     vec![input],
//!     vec![output],
//!     ExitSignal::new()?,
//! );
//! assert!(spec.is_ok());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DEFAULT_POLL_TIMEOUT;
use crate::error::SpecError;
use crate::link::{Bridge, Link, Side};
use crate::queue::{QueueItem, SharedQueue};
use crate::signal::ExitSignal;

/// Entry computation shared by every instance of a role.
pub type Entry<A, I, O> = Arc<dyn Fn(A, WorkerContext<I, O>) + Send + Sync + 'static>;

/// Framework-side arguments handed to each worker instance.
pub struct WorkerContext<I, O> {
    role: Arc<str>,
    index: usize,
    inputs: Vec<SharedQueue<I>>,
    outputs: Vec<SharedQueue<O>>,
    exit: ExitSignal,
    poll_timeout: Duration,
}

impl<I, O> Clone for WorkerContext<I, O> {
    fn clone(&self) -> Self {
        Self {
            role: Arc::clone(&self.role),
            index: self.index,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            exit: self.exit.clone(),
            poll_timeout: self.poll_timeout,
        }
    }
}

impl<I, O> fmt::Debug for WorkerContext<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("role", &self.role)
            .field("index", &self.index)
            .field("inputs", &self.inputs.iter().map(SharedQueue::name).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(SharedQueue::name).collect::<Vec<_>>())
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

impl<I, O> WorkerContext<I, O> {
    /// Build a context directly, for driving an entry computation without a pool.
    pub fn new(
        role: impl Into<String>,
        index: usize,
        inputs: Vec<SharedQueue<I>>,
        outputs: Vec<SharedQueue<O>>,
        exit: ExitSignal,
    ) -> Self {
        let role: String = role.into();
        Self {
            role: Arc::from(role),
            index,
            inputs,
            outputs,
            exit,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Zero-based index of this instance within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn inputs(&self) -> &[SharedQueue<I>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SharedQueue<O>] {
        &self.outputs
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    /// Upper bound on any single blocking queue call made by this instance.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    #[inline]
    pub fn is_exit_requested(&self) -> bool {
        self.exit.is_requested()
    }
}

/// Immutable description of a worker role.
///
/// Only obtainable through [`WorkerSpec::create`] or [`WorkerSpec::builder`],
/// both of which validate the description.
pub struct WorkerSpec<A, I = (), O = ()> {
    role: Arc<str>,
    count: usize,
    entry: Entry<A, I, O>,
    args: A,
    inputs: Vec<SharedQueue<I>>,
    outputs: Vec<SharedQueue<O>>,
    exit: ExitSignal,
    poll_timeout: Duration,
}

impl<A, I, O> fmt::Debug for WorkerSpec<A, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("role", &self.role)
            .field("count", &self.count)
            .field("inputs", &self.inputs.iter().map(SharedQueue::name).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(SharedQueue::name).collect::<Vec<_>>())
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl<A, I, O> WorkerSpec<A, I, O> {
    /// Validate and build a spec in one call.
    pub fn create<F>(
        role: impl Into<String>,
        count: usize,
        entry: F,
        args: A,
        inputs: Vec<SharedQueue<I>>,
        outputs: Vec<SharedQueue<O>>,
        exit: ExitSignal,
    ) -> Result<Self, SpecError>
    where
        F: Fn(A, WorkerContext<I, O>) + Send + Sync + 'static,
    {
        Self::builder(role, args)
            .count(count)
            .entry(entry)
            .inputs(inputs)
            .outputs(outputs)
            .exit_signal(exit)
            .build()
    }

    /// Start building a spec for `role` with fixed arguments `args`.
    pub fn builder(role: impl Into<String>, args: A) -> WorkerSpecBuilder<A, I, O> {
        WorkerSpecBuilder {
            role: role.into(),
            count: 1,
            entry: None,
            args,
            inputs: Vec::new(),
            outputs: Vec::new(),
            exit: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn args(&self) -> &A {
        &self.args
    }

    pub fn inputs(&self) -> &[SharedQueue<I>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SharedQueue<O>] {
        &self.outputs
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }
}

/// Builder for [`WorkerSpec`]. Instance count defaults to 1, poll timeout
/// to one second.
pub struct WorkerSpecBuilder<A, I = (), O = ()> {
    role: String,
    count: usize,
    entry: Option<Entry<A, I, O>>,
    args: A,
    inputs: Vec<SharedQueue<I>>,
    outputs: Vec<SharedQueue<O>>,
    exit: Option<ExitSignal>,
    poll_timeout: Duration,
}

impl<A, I, O> WorkerSpecBuilder<A, I, O> {
    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn entry<F>(mut self, entry: F) -> Self
    where
        F: Fn(A, WorkerContext<I, O>) + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(entry));
        self
    }

    pub fn input(mut self, queue: SharedQueue<I>) -> Self {
        self.inputs.push(queue);
        self
    }

    pub fn inputs(mut self, queues: Vec<SharedQueue<I>>) -> Self {
        self.inputs = queues;
        self
    }

    pub fn output(mut self, queue: SharedQueue<O>) -> Self {
        self.outputs.push(queue);
        self
    }

    pub fn outputs(mut self, queues: Vec<SharedQueue<O>>) -> Self {
        self.outputs = queues;
        self
    }

    pub fn exit_signal(mut self, exit: ExitSignal) -> Self {
        self.exit = Some(exit);
        self
    }

    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn build(self) -> Result<WorkerSpec<A, I, O>, SpecError> {
        if self.role.trim().is_empty() {
            return Err(SpecError::EmptyName);
        }
        if self.count == 0 {
            return Err(SpecError::ZeroCount(self.count));
        }
        let entry = self.entry.ok_or_else(|| SpecError::MissingEntry(self.role.clone()))?;
        let exit = self.exit.ok_or_else(|| SpecError::MissingExitSignal(self.role.clone()))?;
        if self.poll_timeout.is_zero() {
            return Err(SpecError::ZeroPollTimeout(self.role));
        }

        Ok(WorkerSpec {
            role: Arc::from(self.role),
            count: self.count,
            entry,
            args: self.args,
            inputs: self.inputs,
            outputs: self.outputs,
            exit,
            poll_timeout: self.poll_timeout,
        })
    }
}

/// Type-erased instance launcher used by [`WorkerPool`](crate::pool::WorkerPool).
pub(crate) trait Launch: Send + Sync {
    fn role(&self) -> &str;

    fn count(&self) -> usize;

    /// The real queues an instance's broker serves, in the parent.
    fn bridge(&self) -> Bridge;

    /// Run instance `index` to completion in the calling process, reaching
    /// its queues through `link`.
    fn run_linked(&self, index: usize, link: Arc<Link>);
}

impl<A, I, O> Launch for WorkerSpec<A, I, O>
where
    A: Clone + Send + Sync + 'static,
    I: QueueItem,
    O: QueueItem,
{
    fn role(&self) -> &str {
        &self.role
    }

    fn count(&self) -> usize {
        self.count
    }

    fn bridge(&self) -> Bridge {
        Bridge {
            inputs: Box::new(self.inputs.clone()),
            outputs: Box::new(self.outputs.clone()),
        }
    }

    fn run_linked(&self, index: usize, link: Arc<Link>) {
        let ctx = WorkerContext {
            role: Arc::clone(&self.role),
            index,
            inputs: remote_queues(&self.inputs, &link, Side::Input),
            outputs: remote_queues(&self.outputs, &link, Side::Output),
            exit: self.exit.clone(),
            poll_timeout: self.poll_timeout,
        };
        (self.entry)(self.args.clone(), ctx);
    }
}

fn remote_queues<T>(queues: &[SharedQueue<T>], link: &Arc<Link>, side: Side) -> Vec<SharedQueue<T>> {
    queues
        .iter()
        .enumerate()
        .map(|(position, queue)| queue.remote(Arc::clone(link), side, position))
        .collect()
}
