//! # Vehicle Server
//!
//! Worker instances run in their own processes, so the vehicle stays in the
//! orchestrating process behind a Unix socket. [`VehicleServer`] serves any
//! [`Connection`] there, one session thread per client stream, and
//! [`VehicleClient`] is the [`Connection`] handed to workers.
//!
//! A client opens its stream on first use and again in every process it is
//! used from, so a forked worker never shares a stream with its parent.
//! Requests and replies are JSON lines (see [`conduit::wire`]).

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use conduit::wire::{self, LineReader};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, trace};

use crate::connection::{Connection, TelemetryMessage, VehicleCommand};
use crate::error::LinkError;

const SOCKET_NAME: &str = "vehicle.sock";
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Allowed on top of the vehicle-side wait before a reply counts as lost.
const REPLY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum VehicleRequest {
    SendHeartbeat,
    RecvHeartbeat { timeout_us: u64 },
    RecvTelemetry { timeout_us: u64 },
    SendCommand { command: VehicleCommand },
    IsConnected,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum VehicleResponse {
    Done,
    Heartbeat { received: bool },
    Telemetry { message: Option<TelemetryMessage> },
    Connected { connected: bool },
    Failed { error: LinkError },
}

/// Serves a vehicle to worker processes. Stops accepting when dropped.
#[derive(Debug)]
pub struct VehicleServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl VehicleServer {
    /// Bind a socket in a fresh temporary directory and start accepting.
    pub fn start(vehicle: Arc<dyn Connection>) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("conduit-drone").tempdir()?;
        let path = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let accept = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("vehicle-accept".to_string())
                .spawn(move || accept_loop(listener, vehicle, &stop))?
        };
        debug!(path = %path.display(), "Vehicle server listening");

        Ok(Self {
            path,
            stop,
            accept: Some(accept),
            _dir: dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn client(&self) -> VehicleClient {
        VehicleClient::new(&self.path)
    }
}

impl Drop for VehicleServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept.take() {
            if handle.join().is_err() {
                debug!("Vehicle accept thread panicked");
            }
        }
    }
}

fn accept_loop(listener: UnixListener, vehicle: Arc<dyn Connection>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let vehicle = Arc::clone(&vehicle);
                let spawned = thread::Builder::new()
                    .name("vehicle-session".to_string())
                    .spawn(move || serve_session(stream, vehicle.as_ref()));
                if let Err(err) = spawned {
                    debug!(error = %err, "Could not start vehicle session");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                debug!(error = %err, "Vehicle accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Answer requests on one client stream until the client goes away.
fn serve_session(stream: UnixStream, vehicle: &dyn Connection) {
    let writer = stream.set_nonblocking(false).and_then(|()| stream.try_clone());
    let mut writer = match writer {
        Ok(writer) => writer,
        Err(err) => {
            debug!(error = %err, "Could not set up vehicle session");
            return;
        }
    };
    let mut reader = LineReader::new(stream);

    loop {
        let request = match reader.read_message::<VehicleRequest>() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "Vehicle session ended");
                break;
            }
        };
        trace!(?request, "Vehicle request");

        let response = dispatch(vehicle, request);
        if let Err(err) = wire::write_message(&mut writer, &response) {
            debug!(error = %err, "Could not reply to vehicle client");
            break;
        }
    }
}

fn dispatch(vehicle: &dyn Connection, request: VehicleRequest) -> VehicleResponse {
    let result = match request {
        VehicleRequest::SendHeartbeat => vehicle.send_heartbeat().map(|()| VehicleResponse::Done),
        VehicleRequest::RecvHeartbeat { timeout_us } => vehicle
            .recv_heartbeat(Duration::from_micros(timeout_us))
            .map(|received| VehicleResponse::Heartbeat { received }),
        VehicleRequest::RecvTelemetry { timeout_us } => vehicle
            .recv_telemetry(Duration::from_micros(timeout_us))
            .map(|message| VehicleResponse::Telemetry { message }),
        VehicleRequest::SendCommand { command } => vehicle.send_command(command).map(|()| VehicleResponse::Done),
        VehicleRequest::IsConnected => Ok(VehicleResponse::Connected {
            connected: vehicle.is_connected(),
        }),
    };
    result.unwrap_or_else(|error| VehicleResponse::Failed { error })
}

#[derive(Debug)]
struct Session {
    pid: u32,
    writer: UnixStream,
    reader: LineReader<UnixStream>,
}

impl Session {
    fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(Self {
            pid: std::process::id(),
            writer: stream.try_clone()?,
            reader: LineReader::new(stream),
        })
    }

    fn exchange(&mut self, request: &VehicleRequest, limit: Duration) -> io::Result<VehicleResponse> {
        wire::write_message(&mut self.writer, request)?;
        self.reader.get_ref().set_read_timeout(Some(limit))?;
        self.reader
            .read_message()?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "vehicle server closed the link"))
    }
}

/// Worker-side handle on a [`VehicleServer`].
#[derive(Debug)]
pub struct VehicleClient {
    path: PathBuf,
    session: Mutex<Option<Session>>,
}

impl Clone for VehicleClient {
    fn clone(&self) -> Self {
        Self::new(&self.path)
    }
}

impl VehicleClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session: Mutex::new(None),
        }
    }

    fn call(&self, request: VehicleRequest, wait: Duration) -> Result<VehicleResponse, LinkError> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        // A stream opened before a fork belongs to the parent.
        let pid = std::process::id();
        if session.as_ref().map_or(true, |s| s.pid != pid) {
            *session = Some(Session::connect(&self.path).map_err(io_error)?);
        }
        let Some(active) = session.as_mut() else {
            return Err(LinkError::Closed);
        };

        match active.exchange(&request, wait + REPLY_GRACE) {
            Ok(VehicleResponse::Failed { error }) => Err(error),
            Ok(response) => Ok(response),
            Err(err) => {
                *session = None;
                Err(io_error(err))
            }
        }
    }
}

fn io_error(err: io::Error) -> LinkError {
    LinkError::Io(err.to_string())
}

fn unexpected(response: VehicleResponse) -> LinkError {
    LinkError::Io(format!("unexpected reply {response:?}"))
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl Connection for VehicleClient {
    fn send_heartbeat(&self) -> Result<(), LinkError> {
        match self.call(VehicleRequest::SendHeartbeat, Duration::ZERO)? {
            VehicleResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn recv_heartbeat(&self, timeout: Duration) -> Result<bool, LinkError> {
        let request = VehicleRequest::RecvHeartbeat {
            timeout_us: micros(timeout),
        };
        match self.call(request, timeout)? {
            VehicleResponse::Heartbeat { received } => Ok(received),
            other => Err(unexpected(other)),
        }
    }

    fn recv_telemetry(&self, timeout: Duration) -> Result<Option<TelemetryMessage>, LinkError> {
        let request = VehicleRequest::RecvTelemetry {
            timeout_us: micros(timeout),
        };
        match self.call(request, timeout)? {
            VehicleResponse::Telemetry { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    fn send_command(&self, command: VehicleCommand) -> Result<(), LinkError> {
        match self.call(VehicleRequest::SendCommand { command }, Duration::ZERO)? {
            VehicleResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.call(VehicleRequest::IsConnected, Duration::ZERO),
            Ok(VehicleResponse::Connected { connected: true })
        )
    }
}
