//! Heartbeat exchange with the vehicle.
//!
//! The sender keeps the vehicle aware of the ground station. The receiver
//! counts consecutive missed heartbeats and reports the link as
//! [`HeartbeatState::Disconnected`] once the count reaches the threshold.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use conduit::{produce_loop, WorkerContext, WorkerError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_DISCONNECT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatState {
    Connected,
    Disconnected,
}

impl fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeartbeatState::Connected => f.write_str("Connected"),
            HeartbeatState::Disconnected => f.write_str("Disconnected"),
        }
    }
}

#[derive(Debug)]
pub struct HeartbeatSender {
    connection: Arc<dyn Connection>,
}

impl HeartbeatSender {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    pub fn run(&self) -> Result<(), WorkerError> {
        self.connection
            .send_heartbeat()
            .map_err(|e| WorkerError::Connection(e.to_string()))?;
        debug!("Heartbeat sent");
        Ok(())
    }
}

#[derive(Debug)]
pub struct HeartbeatReceiver {
    connection: Arc<dyn Connection>,
    disconnect_threshold: u32,
    recv_timeout: Duration,
    consecutive_misses: u32,
}

impl HeartbeatReceiver {
    pub fn new(connection: Arc<dyn Connection>, disconnect_threshold: u32, recv_timeout: Duration) -> Self {
        Self {
            connection,
            disconnect_threshold,
            recv_timeout,
            consecutive_misses: 0,
        }
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// Try to receive one heartbeat and report the resulting link state.
    ///
    /// A link error counts as a miss.
    pub fn run(&mut self) -> HeartbeatState {
        match self.connection.recv_heartbeat(self.recv_timeout) {
            Ok(true) => {
                self.consecutive_misses = 0;
                debug!("Heartbeat received");
            }
            Ok(false) => {
                self.consecutive_misses += 1;
                warn!(misses = self.consecutive_misses, "No heartbeat received");
            }
            Err(err) => {
                self.consecutive_misses += 1;
                warn!(misses = self.consecutive_misses, error = %err, "Heartbeat receive failed");
            }
        }

        if self.consecutive_misses < self.disconnect_threshold {
            HeartbeatState::Connected
        } else {
            error!(misses = self.consecutive_misses, "Connection considered disconnected");
            HeartbeatState::Disconnected
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatSenderArgs {
    pub connection: Arc<dyn Connection>,
    pub period: Duration,
}

/// Source role: send a heartbeat every period.
pub fn heartbeat_sender_worker(args: HeartbeatSenderArgs, ctx: WorkerContext<(), ()>) {
    let sender = HeartbeatSender::new(args.connection);
    info!(period = ?args.period, "Starting heartbeat sending loop");
    produce_loop(&ctx, args.period, || sender.run().map(|()| Vec::new()));
}

#[derive(Debug, Clone)]
pub struct HeartbeatReceiverArgs {
    pub connection: Arc<dyn Connection>,
    pub period: Duration,
    pub disconnect_threshold: u32,
    pub recv_timeout: Duration,
}

/// Source role: report the link state every period.
pub fn heartbeat_receiver_worker(args: HeartbeatReceiverArgs, ctx: WorkerContext<(), HeartbeatState>) {
    let mut receiver = HeartbeatReceiver::new(args.connection, args.disconnect_threshold, args.recv_timeout);
    info!(period = ?args.period, threshold = args.disconnect_threshold, "Starting heartbeat receiving loop");
    produce_loop(&ctx, args.period, || Ok(vec![receiver.run()]));
}
