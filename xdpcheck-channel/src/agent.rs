use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn, Instrument};
use xdpcheck_packet::{Capture, Link};
use xdpcheck_wire::{
    control::{CaptureFilter, EncodeError, ErrorCode, Request, Response},
    frame::{self, Codec, Message},
};

use crate::AgentOptions;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] frame::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

struct Session {
    /// The connection that armed the capture.
    owner: u64,
    iface: String,
    expect: Option<u32>,
    capture: Capture,
}

/// Armed captures, by handle. An interface has at most one capture armed at any time; it is
/// reserved in `armed` before the link arms it.
#[derive(Default)]
struct Sessions {
    next_handle: u32,
    by_handle: FxHashMap<u32, Session>,
    armed: FxHashMap<String, u32>,
}

impl Sessions {
    /// Removes every capture armed by connection `owner`, releasing its interface.
    fn release(&mut self, owner: u64) -> Vec<Capture> {
        let handles: Vec<u32> = self
            .by_handle
            .iter()
            .filter(|(_, session)| session.owner == owner)
            .map(|(handle, _)| *handle)
            .collect();

        let mut released = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(session) = self.by_handle.remove(&handle) {
                self.armed.remove(&session.iface);
                released.push(session.capture);
            }
        }

        released
    }
}

struct AgentState<L> {
    link: L,
    options: AgentOptions,
    sessions: Mutex<Sessions>,
    next_conn: AtomicU64,
}

/// Serves capture requests for the interfaces of a [`Link`].
///
/// Every accepted connection is served by its own task. Captures are shared between
/// connections, so a capture can be armed on one connection and collected on another, but
/// captures still armed when their connection closes are dropped and their interfaces released.
pub struct CaptureAgent<L> {
    listener: TcpListener,
    state: Arc<AgentState<L>>,
}

impl<L: Link> CaptureAgent<L> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        link: L,
        options: AgentOptions,
    ) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(addr).await?;
        let sessions = Mutex::new(Sessions::default());
        let next_conn = AtomicU64::new(0);
        let state = Arc::new(AgentState { link, options, sessions, next_conn });

        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AgentError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections forever.
    pub async fn run(self) -> Result<(), AgentError> {
        self.run_until(futures::future::pending()).await
    }

    /// Serves connections until `shutdown` completes.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), AgentError> {
        let local_addr = self.listener.local_addr()?;
        info!(%local_addr, "capture agent listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(%local_addr, "capture agent shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(?e, %peer, "failed to set nodelay");
                    }

                    let state = Arc::clone(&self.state);
                    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
                    let span = tracing::info_span!("agent_conn", %peer, conn);
                    tokio::spawn(
                        async move {
                            debug!("accepted connection");
                            match serve(stream, &state, conn).await {
                                Ok(()) => debug!("connection closed"),
                                Err(e) => warn!(?e, "connection failed"),
                            }
                            release(&state, conn).await;
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}

async fn serve<L: Link>(
    stream: TcpStream,
    state: &Arc<AgentState<L>>,
    conn: u64,
) -> Result<(), AgentError> {
    let mut framed = Framed::new(stream, Codec::new());

    while let Some(message) = framed.next().await {
        let message = message?;
        let id = message.id();

        let response = match Request::decode(message.into_payload()) {
            Ok(request) => handle(state, conn, request).await,
            Err(e) => Response::error(ErrorCode::Malformed, e.to_string()),
        };

        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(?e, id, "response not encodable");
                Response::error(ErrorCode::Internal, e.to_string()).encode()?
            }
        };
        framed.send(Message::new(id, payload)).await?;
    }

    Ok(())
}

/// Drops the captures connection `conn` left armed.
async fn release<L: Link>(state: &Arc<AgentState<L>>, conn: u64) {
    let released = state.sessions.lock().release(conn);
    if released.is_empty() {
        return;
    }

    let ifaces: Vec<String> = released.iter().map(|c| c.iface().to_owned()).collect();
    if let Err(e) = tokio::task::spawn_blocking(move || drop(released)).await {
        warn!(?e, "failed to stop released captures");
    }
    debug!(?ifaces, "released captures of closed connection");
}

async fn handle<L: Link>(state: &Arc<AgentState<L>>, conn: u64, request: Request) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::Arm { iface, filter, expect } => arm(state, conn, iface, filter, expect).await,
        Request::Collect { handle, timeout } => {
            let session = state.sessions.lock().by_handle.remove(&handle);
            let Some(session) = session else {
                let msg = format!("no capture with handle {handle}");
                return Response::error(ErrorCode::UnknownHandle, msg);
            };

            let timeout = timeout.min(state.options.max_collect_timeout);
            let complete = session.capture.wait(session.expect.map(|n| n as usize), timeout).await;

            let Session { iface, capture, .. } = session;
            let frames = match tokio::task::spawn_blocking(move || capture.finish()).await {
                Ok(frames) => frames,
                Err(e) => return Response::error(ErrorCode::Internal, e.to_string()),
            };
            state.sessions.lock().armed.remove(&iface);

            debug!(iface, handle, complete, frames = frames.len(), "capture collected");
            Response::Captured { complete, frames }
        }
        Request::Inject { iface, frames } => {
            let state = Arc::clone(state);
            let gap = state.options.inject_gap;
            let task = move || state.link.transmit(&iface, &frames, gap);

            match tokio::task::spawn_blocking(task).await {
                Ok(Ok(count)) => Response::Injected { count: count as u32 },
                Ok(Err(e)) => Response::error(ErrorCode::Interface, e.to_string()),
                Err(e) => Response::error(ErrorCode::Internal, e.to_string()),
            }
        }
    }
}

async fn arm<L: Link>(
    state: &Arc<AgentState<L>>,
    conn: u64,
    iface: String,
    filter: CaptureFilter,
    expect: Option<u32>,
) -> Response {
    let handle = {
        let mut sessions = state.sessions.lock();
        if let Some(handle) = sessions.armed.get(&iface) {
            let msg = format!("{iface} already armed as {handle}");
            return Response::error(ErrorCode::AlreadyArmed, msg);
        }

        let handle = sessions.next_handle;
        sessions.next_handle = sessions.next_handle.wrapping_add(1);
        sessions.armed.insert(iface.clone(), handle);
        handle
    };

    let task = {
        let state = Arc::clone(state);
        let iface = iface.clone();
        move || state.link.arm(&iface, filter)
    };
    let armed = match tokio::task::spawn_blocking(task).await {
        Ok(Ok(capture)) => Ok(capture),
        Ok(Err(e)) => Err(Response::error(ErrorCode::Interface, e.to_string())),
        Err(e) => Err(Response::error(ErrorCode::Internal, e.to_string())),
    };

    let mut sessions = state.sessions.lock();
    let capture = match armed {
        Ok(capture) => capture,
        Err(response) => {
            sessions.armed.remove(&iface);
            return response;
        }
    };

    let session = Session { owner: conn, iface: iface.clone(), expect, capture };
    sessions.by_handle.insert(handle, session);
    drop(sessions);

    debug!(iface, handle, ?filter, ?expect, "capture armed");
    Response::Armed { handle }
}

impl<L> std::fmt::Debug for CaptureAgent<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureAgent").field("listener", &self.listener).finish_non_exhaustive()
    }
}
