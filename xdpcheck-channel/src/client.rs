use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};
use xdpcheck_common::Deadline;
use xdpcheck_wire::{
    control::{CaptureFilter, CapturedFrame, Request, Response},
    frame::{Codec, Message},
};

use crate::{backoff::ExponentialBackoff, is_refused, ChannelError, ChannelOptions, ChannelStats};

/// A capture armed through a [`ControlChannel`]. Collecting it consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct CaptureHandle {
    pub id: u32,
    pub iface: String,
}

/// The outcome of a collect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    /// Whether the expected frame count given at arm time was reached.
    pub complete: bool,
    pub frames: Vec<CapturedFrame>,
}

/// Client side of the control channel. Exchanges are strictly sequential, one in flight at a
/// time, which `&mut self` receivers enforce.
#[derive(Debug)]
pub struct ControlChannel {
    addr: SocketAddr,
    framed: Framed<TcpStream, Codec>,
    options: ChannelOptions,
    next_id: u32,
    lost: bool,
    stats: ChannelStats,
}

impl ControlChannel {
    /// Connects to the agent at `addr`, retrying with exponential backoff while the connection is
    /// refused, then checks that the agent answers.
    pub async fn connect(
        addr: impl Into<SocketAddr>,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let addr = addr.into();
        let deadline = Deadline::after(options.connect_timeout);
        let mut backoff = ExponentialBackoff::from(&options);

        let stream = loop {
            let attempt = TcpStream::connect(addr);

            match tokio::time::timeout(deadline.remaining(), attempt).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) if is_refused(&e) => {
                    debug!(%addr, retries = backoff.retry_count(), "connection refused, retrying");

                    if let Ok(Some(_)) =
                        tokio::time::timeout(deadline.remaining(), backoff.next()).await
                    {
                        continue;
                    }
                    return Err(ChannelError::unavailable(addr, format!("{e} until deadline")));
                }
                Ok(Err(e)) => return Err(ChannelError::unavailable(addr, e)),
                Err(_) => return Err(ChannelError::unavailable(addr, "connect timed out")),
            }
        };

        if options.set_nodelay {
            stream.set_nodelay(true).map_err(|e| ChannelError::unavailable(addr, e))?;
        }

        let mut channel = Self {
            addr,
            framed: Framed::new(stream, Codec::new()),
            options,
            next_id: 0,
            lost: false,
            stats: ChannelStats::default(),
        };

        match channel.ping().await {
            Ok(rtt) => debug!(%addr, ?rtt, "control channel established"),
            Err(ChannelError::Lost { reason, .. }) => {
                return Err(ChannelError::unavailable(addr, reason))
            }
            Err(e) => return Err(e),
        }

        Ok(channel)
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Whether an earlier exchange failed. A lost channel rejects every request.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Round trip to the agent.
    pub async fn ping(&mut self) -> Result<Duration, ChannelError> {
        let start = Instant::now();
        match self.request(Request::Ping, self.options.request_timeout).await? {
            Response::Pong => Ok(start.elapsed()),
            other => Err(self.unexpected(other)),
        }
    }

    /// Arms a capture on the agent's interface `iface`. The agent answers once the capture is
    /// live. `expect` is the frame count after which the capture counts as complete.
    pub async fn arm_capture(
        &mut self,
        iface: &str,
        filter: CaptureFilter,
        expect: Option<u32>,
    ) -> Result<CaptureHandle, ChannelError> {
        let request = Request::Arm { iface: iface.to_owned(), filter, expect };

        match self.request(request, self.options.request_timeout).await? {
            Response::Armed { handle } => Ok(CaptureHandle { id: handle, iface: iface.to_owned() }),
            other => Err(self.unexpected(other)),
        }
    }

    /// Waits for the capture to complete or `timeout` to elapse and returns every frame it
    /// recorded. The capture is released either way.
    pub async fn collect_capture(
        &mut self,
        handle: CaptureHandle,
        timeout: Duration,
    ) -> Result<Collected, ChannelError> {
        let request = Request::Collect { handle: handle.id, timeout };

        match self.request(request, timeout + self.options.request_timeout).await? {
            Response::Captured { complete, frames } => {
                debug!(iface = handle.iface, complete, frames = frames.len(), "capture collected");
                Ok(Collected { complete, frames })
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Has the agent write `frames` to its interface `iface`, in order.
    pub async fn inject(&mut self, iface: &str, frames: Vec<Bytes>) -> Result<u32, ChannelError> {
        let request = Request::Inject { iface: iface.to_owned(), frames };

        match self.request(request, self.options.request_timeout).await? {
            Response::Injected { count } => Ok(count),
            other => Err(self.unexpected(other)),
        }
    }

    /// One request/response exchange. Any failure on the connection marks the channel lost.
    async fn request(
        &mut self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ChannelError> {
        if self.lost {
            return Err(ChannelError::lost(self.addr, "channel was lost earlier"));
        }
        let payload = request.encode()?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let message = Message::new(id, payload);
        let size = message.size();
        let start = Instant::now();
        trace!(id, size, "sending request");

        let framed = &mut self.framed;
        let exchange = async {
            if let Err(e) = framed.send(message).await {
                return Err(e.to_string());
            }

            match framed.next().await {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(e)) => Err(e.to_string()),
                None => Err("connection closed by agent".to_owned()),
            }
        };

        let reply = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(reason)) => return Err(self.mark_lost(reason)),
            Err(_) => return Err(self.mark_lost(format!("no response within {timeout:?}"))),
        };

        if reply.id() != id {
            return Err(self.mark_lost(format!("response id {} for request {id}", reply.id())));
        }

        self.stats.record(start.elapsed());

        match Response::decode(reply.into_payload()) {
            Ok(Response::Error { code, message }) => Err(ChannelError::Remote { code, message }),
            Ok(response) => Ok(response),
            Err(e) => Err(self.mark_lost(format!("undecodable response: {e}"))),
        }
    }

    fn mark_lost(&mut self, reason: String) -> ChannelError {
        self.lost = true;
        tracing::warn!(addr = %self.addr, reason, "control channel lost");
        ChannelError::lost(self.addr, reason)
    }

    fn unexpected(&mut self, response: Response) -> ChannelError {
        self.mark_lost(format!("unexpected response {response:?}"))
    }
}
