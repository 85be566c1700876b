//! Capture points.
//!
//! A [`Link`] gives access to network interfaces: it can arm a [`Capture`] on an interface, and
//! transmit frames onto it. [`RawLink`] talks to the kernel, [`MemoryLink`] wires interfaces
//! together in memory.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use xdpcheck_common::unix_micros;
use xdpcheck_wire::control::{CaptureFilter, CapturedFrame};

use crate::{Fingerprint, Result};

mod memory;
pub use memory::{IngressFilter, MemoryLink};

mod raw;
pub use raw::{RawLink, RawLinkOptions};

/// Access to a set of network interfaces.
pub trait Link: Send + Sync + 'static {
    /// Starts recording frames received on `iface` that match `filter`. The capture is live when
    /// this returns.
    fn arm(&self, iface: &str, filter: CaptureFilter) -> Result<Capture>;

    /// Writes `frames` to `iface` in order, sleeping `gap` between two frames. Returns the number
    /// of frames written. Blocking.
    fn transmit(&self, iface: &str, frames: &[Bytes], gap: Duration) -> Result<usize>;
}

impl<L: Link + ?Sized> Link for Arc<L> {
    fn arm(&self, iface: &str, filter: CaptureFilter) -> Result<Capture> {
        (**self).arm(iface, filter)
    }

    fn transmit(&self, iface: &str, frames: &[Bytes], gap: Duration) -> Result<usize> {
        (**self).transmit(iface, frames, gap)
    }
}

#[derive(Debug, Default)]
struct Shared {
    frames: Mutex<Vec<CapturedFrame>>,
    notify: Notify,
    stopped: AtomicBool,
}

/// The producer side of a [`Capture`].
#[derive(Debug, Clone)]
pub struct Recorder {
    filter: CaptureFilter,
    shared: Arc<Shared>,
}

impl Recorder {
    /// Records `frame` if it matches the capture filter. Returns whether it was recorded.
    pub fn record(&self, frame: &[u8]) -> bool {
        if self.is_stopped() {
            return false;
        }

        let data = Bytes::copy_from_slice(frame);
        if self.filter != CaptureFilter::any() {
            let Ok(fingerprint) = Fingerprint::parse(&data) else {
                return false;
            };
            if !self.filter.matches(fingerprint.protocol(), fingerprint.ports) {
                return false;
            }
        }

        self.shared.frames.lock().push(CapturedFrame { timestamp_micros: unix_micros(), data });
        self.shared.notify.notify_waiters();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

/// A live capture on one interface. Frames are recorded until [`Capture::finish`] is called or
/// the capture is dropped.
pub struct Capture {
    iface: String,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    /// Creates a capture on `iface`, with the [`Recorder`] that feeds it.
    pub fn new(iface: impl Into<String>, filter: CaptureFilter) -> (Self, Recorder) {
        let shared = Arc::new(Shared::default());
        let capture = Self { iface: iface.into(), shared: Arc::clone(&shared), reader: None };
        (capture, Recorder { filter, shared })
    }

    /// Attaches the thread that reads frames into this capture. It is joined on finish.
    pub(crate) fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    #[inline]
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Number of frames recorded so far.
    pub fn len(&self) -> usize {
        self.shared.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until `expect` frames were recorded or `timeout` elapses. Without an expected count
    /// the full timeout is awaited. Returns whether the expected count was reached.
    pub async fn wait(&self, expect: Option<usize>, timeout: Duration) -> bool {
        let Some(expect) = expect else {
            tokio::time::sleep(timeout).await;
            return false;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            if self.len() >= expect {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= expect;
            }
        }
    }

    /// Stops recording and returns every frame recorded since the capture was armed.
    pub fn finish(mut self) -> Vec<CapturedFrame> {
        self.stop();
        std::mem::take(&mut *self.shared.frames.lock())
    }

    fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::error!(iface = self.iface, "capture reader panicked");
            }
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture").field("iface", &self.iface).field("frames", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pnet::util::MacAddr;
    use xdpcheck_wire::control::TransportProtocol;

    use super::*;
    use crate::fixture::{build_packet, Headers};

    fn frame(protocol: TransportProtocol, src_port: u16, dst_port: u16) -> Bytes {
        let headers = Headers {
            src_ether: MacAddr::new(2, 0, 0, 0, 0, 2),
            dst_ether: MacAddr::new(2, 0, 0, 0, 0, 1),
            src_ip: Ipv4Addr::new(192, 168, 0, 2).into(),
            dst_ip: Ipv4Addr::new(192, 168, 0, 1).into(),
            protocol,
            src_port,
            dst_port,
        };
        build_packet(&headers, 0, b"payload").unwrap().data().clone()
    }

    #[test]
    fn recorder_applies_directional_filter() {
        let filter =
            CaptureFilter::any().protocol(TransportProtocol::Udp).src_port(50000).dst_port(60000);
        let (capture, recorder) = Capture::new("a_to_b", filter);

        assert!(recorder.record(&frame(TransportProtocol::Udp, 50000, 60000)));
        assert!(!recorder.record(&frame(TransportProtocol::Udp, 60000, 50000)));
        assert!(!recorder.record(&frame(TransportProtocol::Tcp, 50000, 60000)));
        assert!(!recorder.record(&[0u8; 4]));

        assert_eq!(capture.finish().len(), 1);
        assert!(!recorder.record(&frame(TransportProtocol::Udp, 50000, 60000)));
    }

    #[tokio::test]
    async fn wait_returns_once_count_is_reached() {
        let (capture, recorder) = Capture::new("a_to_b", CaptureFilter::any());

        let producer = std::thread::spawn(move || {
            for _ in 0..3 {
                std::thread::sleep(Duration::from_millis(10));
                recorder.record(&frame(TransportProtocol::Udp, 1, 2));
            }
        });

        assert!(capture.wait(Some(3), Duration::from_secs(5)).await);
        producer.join().unwrap();
        assert_eq!(capture.finish().len(), 3);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let (capture, _recorder) = Capture::new("a_to_b", CaptureFilter::any());

        assert!(!capture.wait(Some(1), Duration::from_millis(20)).await);
        assert!(!capture.wait(None, Duration::from_millis(5)).await);
        assert!(capture.is_empty());
    }
}
