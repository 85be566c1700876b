use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use xdpcheck_wire::control::CaptureFilter;

use super::{Capture, Link, Recorder};
use crate::{Error, Result};

/// Decides whether a frame arriving on an interface is accepted.
pub type IngressFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    peers: FxHashMap<String, String>,
    recorders: FxHashMap<String, Vec<Recorder>>,
    ingress: FxHashMap<String, IngressFilter>,
    transmitted: usize,
}

/// Point-to-point links simulated in memory.
///
/// A frame transmitted on one end of a connected pair is received on the other end, after its
/// ingress filter (if any). Frames are never seen on the interface that transmitted them.
#[derive(Clone, Default)]
pub struct MemoryLink {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `a` and `b` back to back.
    pub fn connect(&self, a: impl Into<String>, b: impl Into<String>) -> &Self {
        let (a, b) = (a.into(), b.into());
        let mut inner = self.inner.lock();
        inner.peers.insert(a.clone(), b.clone());
        inner.peers.insert(b, a);
        drop(inner);
        self
    }

    /// Installs a filter on frames received by `iface`, replacing any previous one.
    pub fn set_ingress_filter(&self, iface: impl Into<String>, filter: IngressFilter) {
        self.inner.lock().ingress.insert(iface.into(), filter);
    }

    pub fn clear_ingress_filter(&self, iface: &str) {
        self.inner.lock().ingress.remove(iface);
    }

    /// Total number of frames transmitted so far.
    pub fn transmitted(&self) -> usize {
        self.inner.lock().transmitted
    }

    fn deliver(&self, iface: &str, frame: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.transmitted += 1;

        let peer =
            inner.peers.get(iface).cloned().ok_or_else(|| Error::Interface(iface.to_owned()))?;
        if inner.ingress.get(&peer).is_some_and(|accept| !accept(frame)) {
            tracing::trace!(iface = peer, "frame dropped on ingress");
            return Ok(());
        }

        if let Some(recorders) = inner.recorders.get_mut(&peer) {
            recorders.retain(|recorder| !recorder.is_stopped());
            for recorder in recorders.iter() {
                recorder.record(frame);
            }
        }

        Ok(())
    }
}

impl Link for MemoryLink {
    fn arm(&self, iface: &str, filter: CaptureFilter) -> Result<Capture> {
        let mut inner = self.inner.lock();
        if !inner.peers.contains_key(iface) {
            return Err(Error::Interface(iface.to_owned()));
        }

        let (capture, recorder) = Capture::new(iface, filter);
        inner.recorders.entry(iface.to_owned()).or_default().push(recorder);
        Ok(capture)
    }

    fn transmit(&self, iface: &str, frames: &[Bytes], gap: Duration) -> Result<usize> {
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                std::thread::sleep(gap);
            }
            self.deliver(iface, frame)?;
        }

        Ok(frames.len())
    }
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryLink")
            .field("peers", &inner.peers)
            .field("transmitted", &inner.transmitted)
            .finish_non_exhaustive()
    }
}
