//! # Instance Link
//!
//! Worker instances run in forked child processes, so they cannot touch the
//! orchestrating process's queues directly. Each instance gets one end of a
//! Unix socket pair. The parent serves the other end from a [`Broker`]
//! thread that performs the queue operations on the real queues.
//!
//! ## Protocol
//! One JSON [`Request`] per line from the instance, answered by exactly one
//! [`Response`] line, except [`Request::Panicked`] which has no answer.
//! Items travel as JSON values.
//!
//! Blocking operations are served in short slices so a broker notices when
//! its instance has been reaped, even if the socket never reports EOF
//! (siblings forked at the same time may hold a copy of the descriptor).

use std::fmt;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::QueueError;
use crate::queue::{QueueItem, SharedQueue};
use crate::wire::{is_timeout, write_message, LineReader};

/// Extra time an instance waits for an answer beyond the requested wait.
const LINK_GRACE: Duration = Duration::from_secs(5);

/// Longest a broker blocks before re-checking whether it should stop.
const BROKER_SLICE: Duration = Duration::from_millis(100);

/// Which of an instance's queue lists a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Side {
    Input,
    Output,
}

/// How long a queue operation may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Wait {
    No,
    For { micros: u64 },
    Forever,
}

impl Wait {
    pub(crate) fn up_to(timeout: Duration) -> Self {
        Wait::For {
            micros: u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX),
        }
    }

    /// `None` means no limit.
    fn limit(self) -> Option<Duration> {
        match self {
            Wait::No => Some(Duration::ZERO),
            Wait::For { micros } => Some(Duration::from_micros(micros)),
            Wait::Forever => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Request {
    /// Take one item from whichever of `indices` has one first.
    Get { side: Side, indices: Vec<usize>, wait: Wait },
    Put { side: Side, index: usize, item: Value, wait: Wait },
    Len { side: Side, index: usize },
    /// The instance is about to exit after a panic.
    Panicked { message: String },
}

impl Request {
    fn wait(&self) -> Wait {
        match self {
            Request::Get { wait, .. } | Request::Put { wait, .. } => *wait,
            Request::Len { .. } | Request::Panicked { .. } => Wait::No,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum Response {
    Item { index: usize, item: Value },
    Done,
    Len { len: usize },
    Empty,
    Full,
    Disconnected,
    Invalid { message: String },
}

struct LinkStream {
    reader: LineReader<UnixStream>,
    writer: UnixStream,
    broken: bool,
}

impl LinkStream {
    fn exchange(&mut self, request: &Request) -> io::Result<Response> {
        write_message(&mut self.writer, request)?;
        self.reader
            .get_ref()
            .set_read_timeout(request.wait().limit().map(|limit| limit + LINK_GRACE))?;
        self.reader
            .read_message()?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "broker closed the link"))
    }
}

/// Instance side of the link. Shared by every remote queue handle of one
/// instance; requests are serialized by the lock.
pub(crate) struct Link {
    stream: Mutex<LinkStream>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    pub(crate) fn new(stream: UnixStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            stream: Mutex::new(LinkStream {
                reader: LineReader::new(stream),
                writer,
                broken: false,
            }),
        })
    }

    /// Send one request and wait for its answer.
    ///
    /// After any transport failure the link is unusable: a late answer would
    /// be read as the reply to the next request.
    pub(crate) fn call(&self, request: &Request) -> io::Result<Response> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if stream.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link is broken"));
        }
        let result = stream.exchange(request);
        if result.is_err() {
            stream.broken = true;
        }
        result
    }

    /// Tell the broker why this instance is about to exit.
    pub(crate) fn report_panic(&self, message: &str) {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let request = Request::Panicked {
            message: message.to_string(),
        };
        if let Err(err) = write_message(&mut stream.writer, &request) {
            debug!(error = %err, "Could not report panic over link");
        }
    }
}

/// Parent-side operations on one list of same-typed queues.
pub(crate) trait QueueGroup: Send {
    fn serve_get(&self, indices: &[usize], wait: Wait, stop: &AtomicBool) -> Response;

    fn serve_put(&self, index: usize, item: Value, wait: Wait, stop: &AtomicBool) -> Response;

    fn serve_len(&self, index: usize) -> Response;
}

impl<T: QueueItem> QueueGroup for Vec<SharedQueue<T>> {
    fn serve_get(&self, indices: &[usize], wait: Wait, stop: &AtomicBool) -> Response {
        let mut queues = Vec::with_capacity(indices.len());
        for &index in indices {
            match self.as_slice().get(index) {
                Some(queue) => queues.push(queue.clone()),
                None => return no_such_queue(index),
            }
        }

        let deadline = wait.limit().map(|limit| Instant::now() + limit);
        loop {
            match SharedQueue::get_any(&queues, next_slice(deadline)) {
                Ok((position, item)) => {
                    return match serde_json::to_value(&item) {
                        Ok(item) => Response::Item {
                            index: indices[position],
                            item,
                        },
                        Err(err) => Response::Invalid {
                            message: format!("cannot encode item: {err}"),
                        },
                    };
                }
                Err(QueueError::Empty) => {}
                Err(_) => return Response::Disconnected,
            }
            if expired(deadline) || stop.load(Ordering::SeqCst) {
                return Response::Empty;
            }
        }
    }

    fn serve_put(&self, index: usize, item: Value, wait: Wait, stop: &AtomicBool) -> Response {
        let Some(queue) = self.as_slice().get(index) else {
            return no_such_queue(index);
        };
        let mut pending: T = match serde_json::from_value(item) {
            Ok(item) => item,
            Err(err) => {
                return Response::Invalid {
                    message: format!("cannot decode item for '{}': {err}", queue.name()),
                }
            }
        };

        let deadline = wait.limit().map(|limit| Instant::now() + limit);
        loop {
            match queue.put_timeout(pending, next_slice(deadline)) {
                Ok(()) => return Response::Done,
                Err(QueueError::Full(rejected)) => pending = rejected,
                Err(_) => return Response::Disconnected,
            }
            if expired(deadline) {
                return Response::Full;
            }
            if stop.load(Ordering::SeqCst) {
                return Response::Disconnected;
            }
        }
    }

    fn serve_len(&self, index: usize) -> Response {
        match self.as_slice().get(index) {
            Some(queue) => Response::Len { len: queue.len() },
            None => no_such_queue(index),
        }
    }
}

fn no_such_queue(index: usize) -> Response {
    Response::Invalid {
        message: format!("no queue at index {index}"),
    }
}

fn next_slice(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(BROKER_SLICE),
        None => BROKER_SLICE,
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// The real queues behind one instance's link.
pub(crate) struct Bridge {
    pub(crate) inputs: Box<dyn QueueGroup>,
    pub(crate) outputs: Box<dyn QueueGroup>,
}

impl Bridge {
    fn side(&self, side: Side) -> &dyn QueueGroup {
        match side {
            Side::Input => self.inputs.as_ref(),
            Side::Output => self.outputs.as_ref(),
        }
    }

    fn serve(&self, request: Request, stop: &AtomicBool) -> Response {
        match request {
            Request::Get { side, indices, wait } => self.side(side).serve_get(&indices, wait, stop),
            Request::Put {
                side,
                index,
                item,
                wait,
            } => self.side(side).serve_put(index, item, wait, stop),
            Request::Len { side, index } => self.side(side).serve_len(index),
            Request::Panicked { .. } => Response::Invalid {
                message: "panic reports take no answer".to_string(),
            },
        }
    }
}

/// Parent side of one instance's link.
pub(crate) struct Broker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    panic_message: Arc<Mutex<Option<String>>>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("stopped", &self.stop.load(Ordering::SeqCst))
            .finish()
    }
}

impl Broker {
    pub(crate) fn spawn(name: String, stream: UnixStream, bridge: Bridge) -> io::Result<Self> {
        stream.set_read_timeout(Some(BROKER_SLICE))?;
        let writer = stream.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let panic_message = Arc::new(Mutex::new(None));

        let handle = {
            let stop = Arc::clone(&stop);
            let panic_message = Arc::clone(&panic_message);
            thread::Builder::new()
                .name(name)
                .spawn(move || serve(LineReader::new(stream), writer, bridge, &stop, &panic_message))?
        };

        Ok(Self {
            handle: Some(handle),
            stop,
            panic_message,
        })
    }

    /// Stop serving and return the panic message the instance reported, if any.
    ///
    /// Call only after the instance process has been reaped.
    pub(crate) fn finish(mut self) -> Option<String> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Broker thread panicked");
            }
        }
        self.panic_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn serve(
    mut reader: LineReader<UnixStream>,
    mut writer: UnixStream,
    bridge: Bridge,
    stop: &AtomicBool,
    panic_message: &Mutex<Option<String>>,
) {
    while !stop.load(Ordering::SeqCst) {
        let request: Request = match reader.read_message() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                debug!(error = %err, "Broker read failed");
                break;
            }
        };
        trace!(?request, "Broker request");

        if let Request::Panicked { message } = request {
            *panic_message.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
            continue;
        }

        let response = bridge.serve(request, stop);
        if let Err(err) = write_message(&mut writer, &response) {
            debug!(error = %err, "Broker write failed");
            break;
        }
    }
}
