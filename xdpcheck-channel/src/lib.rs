#![doc(issue_tracker_base_url = "https://github.com/chainbound/xdpcheck/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! The control channel: a framed request/response protocol over TCP between the process driving
//! the tests ([`ControlChannel`]) and a [`CaptureAgent`] running next to a remote observation
//! point.

use std::{io, net::SocketAddr, time::Duration};

use xdpcheck_wire::control::{EncodeError, ErrorCode};

mod agent;
mod backoff;
mod client;
mod stats;

pub use agent::{AgentError, CaptureAgent};
pub use backoff::ExponentialBackoff;
pub use client::{CaptureHandle, Collected, ControlChannel};
pub use stats::ChannelStats;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The agent could not be reached before the connect deadline.
    #[error("channel to {addr} unavailable: {reason}")]
    Unavailable { addr: SocketAddr, reason: String },
    /// The connection broke, or the agent stopped making sense, in the middle of an exchange.
    /// A lost channel is never reused.
    #[error("channel to {addr} lost: {reason}")]
    Lost { addr: SocketAddr, reason: String },
    /// The agent served the request and reported an error.
    #[error("agent error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },
    /// The request could not be encoded. Nothing was sent.
    #[error("invalid request: {0}")]
    Encode(#[from] EncodeError),
}

impl ChannelError {
    pub fn is_already_armed(&self) -> bool {
        matches!(self, Self::Remote { code: ErrorCode::AlreadyArmed, .. })
    }

    pub(crate) fn lost(addr: SocketAddr, reason: impl ToString) -> Self {
        Self::Lost { addr, reason: reason.to_string() }
    }

    pub(crate) fn unavailable(addr: SocketAddr, reason: impl ToString) -> Self {
        Self::Unavailable { addr, reason: reason.to_string() }
    }
}

/// Options of a [`ControlChannel`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Deadline for establishing the connection, retries included.
    pub connect_timeout: Duration,
    /// Initial delay between two connection attempts. Doubles after every attempt.
    pub backoff_duration: Duration,
    /// Upper bound of the delay between two connection attempts.
    pub max_backoff: Duration,
    /// Deadline of a single exchange. Collect requests add their own timeout to it.
    pub request_timeout: Duration,
    pub set_nodelay: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff_duration: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            set_nodelay: true,
        }
    }
}

impl ChannelOptions {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn backoff_duration(mut self, duration: Duration) -> Self {
        self.backoff_duration = duration;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Options of a [`CaptureAgent`].
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Delay between two injected frames.
    pub inject_gap: Duration,
    /// Collect requests never wait longer than this.
    pub max_collect_timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self { inject_gap: Duration::from_millis(1), max_collect_timeout: Duration::from_secs(60) }
    }
}

impl AgentOptions {
    pub fn inject_gap(mut self, gap: Duration) -> Self {
        self.inject_gap = gap;
        self
    }
}

pub(crate) fn is_refused(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
}
