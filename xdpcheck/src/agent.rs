//! Capture agents serving the peer side of virtual topologies.

use std::thread::JoinHandle;

use tokio::sync::oneshot;
use xdpcheck_channel::{AgentError, AgentOptions, CaptureAgent};
use xdpcheck_packet::RawLink;
use xdpcheck_topo::{namespace::TaskError, Topology};

use crate::{HarnessError, Result};

type AgentThread = JoinHandle<std::result::Result<(), TaskError<AgentError>>>;

/// A [`CaptureAgent`] running inside the namespace of a virtual topology, on its own thread and
/// runtime. Dropping the guard stops the agent and waits for its thread.
#[derive(Debug)]
pub struct NamespaceAgent {
    namespace: String,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<AgentThread>,
}

impl NamespaceAgent {
    /// Starts an agent listening on the channel of `topology`, from within its namespace.
    pub fn spawn(topology: &Topology, options: AgentOptions) -> Result<Self> {
        let namespace = topology.namespace().ok_or_else(|| {
            HarnessError::InvalidState(format!("{} has no namespace", topology.name()))
        })?;
        let addr = topology.channel()?.socket_addr();
        let (tx, rx) = oneshot::channel::<()>();

        let thread = namespace.run(async move {
            let agent = CaptureAgent::bind(addr, RawLink::default(), options).await?;
            agent
                .run_until(async move {
                    let _ = rx.await;
                })
                .await
        })?;

        tracing::info!(namespace = namespace.name(), %addr, "spawned namespace agent");

        Ok(Self {
            namespace: namespace.name().to_owned(),
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stops the agent. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        let Some(thread) = self.thread.take() else { return };
        match thread.join() {
            Ok(Ok(())) => tracing::debug!(namespace = self.namespace, "namespace agent stopped"),
            Ok(Err(e)) => tracing::error!(?e, namespace = self.namespace, "namespace agent failed"),
            Err(_) => tracing::error!(namespace = self.namespace, "namespace agent panicked"),
        }
    }
}

impl Drop for NamespaceAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
