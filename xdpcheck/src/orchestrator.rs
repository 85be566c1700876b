use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xdpcheck_channel::{CaptureHandle, ChannelError, ChannelOptions, ControlChannel};
use xdpcheck_common::JoinMap;
use xdpcheck_packet::{matching, Capture, Link, Packet, RawLink};
use xdpcheck_topo::{ChannelDescriptor, RemotePoint, Topology};
use xdpcheck_wire::control::{CaptureFilter, CapturedFrame, TransportProtocol};

use crate::{HarnessError, Result};

/// Options of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// How long every observation point gets to acknowledge its capture.
    pub arm_timeout: Duration,
    /// Wait between the last transmitted packet and the first collect.
    pub settle: Duration,
    /// How long a collect waits for the fixture to show up at a point.
    pub collect_timeout: Duration,
    /// Largest fixture accepted by [`Orchestrator::send_packets`].
    pub max_fixture_len: usize,
    pub channel: ChannelOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            arm_timeout: Duration::from_secs(5),
            settle: Duration::from_secs(1),
            collect_timeout: Duration::from_millis(500),
            max_fixture_len: 512,
            channel: ChannelOptions::default(),
        }
    }
}

impl OrchestratorOptions {
    pub fn arm_timeout(mut self, timeout: Duration) -> Self {
        self.arm_timeout = timeout;
        self
    }

    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = timeout;
        self
    }

    pub fn max_fixture_len(mut self, len: usize) -> Self {
        self.max_fixture_len = len;
        self
    }

    pub fn channel(mut self, options: ChannelOptions) -> Self {
        self.channel = options;
        self
    }
}

/// What every observation point saw during one [`Orchestrator::send_packets`] call.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// The fixture that was sent.
    pub expected: Vec<Packet>,
    /// Packets received on the local interface.
    pub local: Vec<Packet>,
    /// Packets received on every remote point, in the order of `points`.
    pub remote: Vec<Vec<Packet>>,
    pub points: Vec<RemotePoint>,
}

impl CaptureResult {
    pub fn remote_is_empty(&self) -> bool {
        self.remote.iter().all(Vec::is_empty)
    }

    /// Captured packets that match no packet of the fixture, on any point.
    pub fn anomalies(&self) -> Vec<&Packet> {
        let mut anomalies = matching::anomalies(&self.expected, &self.local);
        for packets in &self.remote {
            anomalies.extend(matching::anomalies(&self.expected, packets));
        }
        anomalies
    }
}

/// An observation point. Points order in declaration order, local first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Point {
    Local,
    Remote(usize),
}

enum Armed {
    Local(Capture),
    Remote(CaptureHandle),
}

/// Names of the observation points of one call, for diagnostics.
struct PointNames<'a> {
    local: &'a str,
    remote: &'a [RemotePoint],
}

impl PointNames<'_> {
    fn name(&self, point: Point) -> String {
        match point {
            Point::Local => format!("local {}", self.local),
            Point::Remote(index) => {
                let point = &self.remote[index];
                format!("{}@{}", point.iface, point.channel)
            }
        }
    }
}

/// Sends fixtures across a [`Topology`] and records where they arrive.
///
/// The local interface is captured in-process through `L`; every remote point is captured by
/// the agent behind its channel. Channels are connected on first use and kept for later calls.
pub struct Orchestrator<L = RawLink> {
    local_link: Arc<L>,
    options: OrchestratorOptions,
    channels: FxHashMap<ChannelDescriptor, Arc<Mutex<ControlChannel>>>,
}

impl Orchestrator<RawLink> {
    /// An orchestrator capturing on the interfaces of this host.
    pub fn raw(options: OrchestratorOptions) -> Self {
        Self::new(RawLink::default(), options)
    }
}

impl<L: Link> Orchestrator<L> {
    pub fn new(local_link: L, options: OrchestratorOptions) -> Self {
        Self { local_link: Arc::new(local_link), options, channels: FxHashMap::default() }
    }

    #[inline]
    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Arms every observation point of `topology`, has the remote side transmit `packets` towards
    /// the local interface, waits for them to settle and collects what every point captured.
    pub async fn send_packets(
        &mut self,
        topology: &Topology,
        packets: &[Packet],
    ) -> Result<CaptureResult> {
        if packets.len() > self.options.max_fixture_len {
            return Err(HarnessError::InvalidState(format!(
                "fixture of {} packets exceeds the limit of {}",
                packets.len(),
                self.options.max_fixture_len
            )));
        }

        let local_iface = topology.local()?.iface().to_owned();
        let remote_iface = topology.remote()?.iface().to_owned();
        let points = topology.remote_points()?;
        let names = PointNames { local: &local_iface, remote: &points };

        self.evict_lost().await;
        let injector = self.channel(topology.channel()?).await?;
        let mut channels = Vec::with_capacity(points.len());
        for point in &points {
            channels.push(self.channel(point.channel).await?);
        }

        let filter = coarse_filter(packets);
        let expect = packets.len();
        debug!(topology = topology.name(), packets = expect, ?filter, "sending fixture");

        let armed = match self.arm(&local_iface, &points, &channels, filter, expect).await {
            Ok(armed) => armed,
            Err((point, reason)) => {
                return Err(HarnessError::CaptureArmFailed { point: names.name(point), reason });
            }
        };

        let frames = packets.iter().map(|p| p.data().clone()).collect::<Vec<Bytes>>();
        let injected = injector.lock().await.inject(&remote_iface, frames).await;
        let failure = match injected {
            Ok(count) if count as usize == expect => None,
            Ok(count) => Some(HarnessError::InjectFailed {
                iface: remote_iface.clone(),
                reason: format!("{count} of {expect} frames written"),
            }),
            Err(ChannelError::Remote { message, .. }) => {
                Some(HarnessError::InjectFailed { iface: remote_iface.clone(), reason: message })
            }
            Err(e) => Some(e.into()),
        };
        if let Some(e) = failure {
            release(armed, &channels).await;
            return Err(e);
        }

        tokio::time::sleep(self.options.settle).await;

        let (local, remote) = self.collect(armed, &channels, &names, expect).await?;
        let result = CaptureResult { expected: packets.to_vec(), local, remote, points };

        for anomaly in result.anomalies() {
            warn!(topology = topology.name(), %anomaly, "captured packet not in fixture");
        }
        debug!(
            topology = topology.name(),
            local = result.local.len(),
            remote = result.remote.iter().map(Vec::len).sum::<usize>(),
            "fixture captured"
        );

        Ok(result)
    }

    /// The channel to `descriptor`, connected if needed.
    async fn channel(
        &mut self,
        descriptor: ChannelDescriptor,
    ) -> Result<Arc<Mutex<ControlChannel>>> {
        if let Some(channel) = self.channels.get(&descriptor) {
            return Ok(Arc::clone(channel));
        }

        let channel =
            ControlChannel::connect(descriptor.socket_addr(), self.options.channel.clone()).await?;
        info!(%descriptor, "connected to capture agent");

        let channel = Arc::new(Mutex::new(channel));
        self.channels.insert(descriptor, Arc::clone(&channel));
        Ok(channel)
    }

    /// Forgets channels that failed in an earlier call. They are never used again.
    async fn evict_lost(&mut self) {
        let mut lost = Vec::new();
        for (descriptor, channel) in &self.channels {
            if channel.lock().await.is_lost() {
                lost.push(*descriptor);
            }
        }

        for descriptor in lost {
            debug!(%descriptor, "dropping lost channel");
            self.channels.remove(&descriptor);
        }
    }

    /// Arms every point concurrently. On failure, whatever was armed is released and the first
    /// failing point is returned.
    async fn arm(
        &mut self,
        local_iface: &str,
        points: &[RemotePoint],
        channels: &[Arc<Mutex<ControlChannel>>],
        filter: CaptureFilter,
        expect: usize,
    ) -> std::result::Result<FxHashMap<Point, Armed>, (Point, String)> {
        let mut arming = JoinMap::new();

        let link = Arc::clone(&self.local_link);
        let iface = local_iface.to_owned();
        arming.spawn(Point::Local, async move {
            let armed = match tokio::task::spawn_blocking(move || link.arm(&iface, filter)).await {
                Ok(Ok(capture)) => Ok(Armed::Local(capture)),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            (Point::Local, armed)
        });

        for (index, (point, channel)) in points.iter().zip(channels).enumerate() {
            let channel = Arc::clone(channel);
            let iface = point.iface.clone();
            let key = Point::Remote(index);

            arming.spawn(key, async move {
                let armed =
                    channel.lock().await.arm_capture(&iface, filter, Some(expect as u32)).await;
                (key, armed.map(Armed::Remote).map_err(|e| e.to_string()))
            });
        }

        let mut armed = FxHashMap::default();
        let mut failure = None;
        let joined = tokio::time::timeout(self.options.arm_timeout, async {
            while let Some(res) = arming.join_next().await {
                match res {
                    Ok((point, Ok(capture))) => {
                        armed.insert(point, capture);
                    }
                    Ok((point, Err(reason))) => {
                        failure.get_or_insert((point, reason));
                    }
                    Err(e) => {
                        let point = stalled(&arming);
                        failure.get_or_insert((point, format!("arm task failed: {e}")));
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            let point = stalled(&arming);
            arming.abort_all();
            // An aborted exchange leaves its channel out of sync.
            self.channels.clear();
            failure.get_or_insert((
                point,
                format!("no acknowledgement within {:?}", self.options.arm_timeout),
            ));
        }

        match failure {
            None => Ok(armed),
            Some(failure) => {
                release(armed, channels).await;
                Err(failure)
            }
        }
    }

    /// Collects every armed point concurrently, returning the local set and the remote sets in
    /// point order.
    async fn collect(
        &self,
        armed: FxHashMap<Point, Armed>,
        channels: &[Arc<Mutex<ControlChannel>>],
        names: &PointNames<'_>,
        expect: usize,
    ) -> Result<(Vec<Packet>, Vec<Vec<Packet>>)> {
        let timeout = self.options.collect_timeout;
        let mut collecting = JoinMap::new();

        for (point, armed) in armed {
            match armed {
                Armed::Local(capture) => collecting.spawn(point, async move {
                    capture.wait(Some(expect), timeout).await;
                    let frames = tokio::task::spawn_blocking(move || capture.finish())
                        .await
                        .map_err(|e| {
                            HarnessError::InvalidState(format!("local collect failed: {e}"))
                        });
                    (point, frames)
                }),
                Armed::Remote(handle) => {
                    let Point::Remote(index) = point else { continue };
                    let channel = Arc::clone(&channels[index]);
                    collecting.spawn(point, async move {
                        let collected = channel.lock().await.collect_capture(handle, timeout).await;
                        (point, collected.map(|c| c.frames).map_err(HarnessError::from))
                    })
                }
            };
        }

        let mut local = Vec::new();
        let mut remote = vec![Vec::new(); channels.len()];
        while let Some(res) = collecting.join_next().await {
            let (point, frames) =
                res.map_err(|e| HarnessError::InvalidState(format!("collect task failed: {e}")))?;
            let packets = parse_frames(&names.name(point), frames?);

            match point {
                Point::Local => local = packets,
                Point::Remote(index) => remote[index] = packets,
            }
        }

        Ok((local, remote))
    }
}

impl<L> fmt::Debug for Orchestrator<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("options", &self.options)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// The first point whose arm has not completed.
fn stalled<V>(arming: &JoinMap<Point, V>) -> Point {
    arming.keys().copied().min().unwrap_or(Point::Local)
}

/// Releases armed captures, ignoring failures.
async fn release(armed: FxHashMap<Point, Armed>, channels: &[Arc<Mutex<ControlChannel>>]) {
    for (point, armed) in armed {
        match (point, armed) {
            (_, Armed::Local(capture)) => {
                let _ = tokio::task::spawn_blocking(move || drop(capture)).await;
            }
            (Point::Remote(index), Armed::Remote(handle)) => {
                let released =
                    channels[index].lock().await.collect_capture(handle, Duration::ZERO).await;
                if let Err(e) = released {
                    debug!(?e, "failed to release remote capture");
                }
            }
            (Point::Local, Armed::Remote(_)) => {}
        }
    }
}

fn parse_frames(point: &str, frames: Vec<CapturedFrame>) -> Vec<Packet> {
    frames
        .into_iter()
        .filter_map(|frame| match Packet::from_bytes(frame.data) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!(point, ?e, "discarding unparseable frame");
                None
            }
        })
        .collect()
}

/// The narrowest capture filter matching every packet of the fixture: a field is set only if all
/// packets agree on it.
fn coarse_filter(packets: &[Packet]) -> CaptureFilter {
    let Some((first, rest)) = packets.split_first() else {
        return CaptureFilter::any();
    };

    let fp = first.fingerprint();
    let mut filter = CaptureFilter {
        protocol: fp.protocol().and_then(TransportProtocol::from_number),
        src_port: fp.ports.map(|(src, _)| src),
        dst_port: fp.ports.map(|(_, dst)| dst),
    };

    for packet in rest {
        let fp = packet.fingerprint();
        if filter.protocol.map(TransportProtocol::number) != fp.protocol() {
            filter.protocol = None;
        }
        if filter.src_port != fp.ports.map(|(src, _)| src) {
            filter.src_port = None;
        }
        if filter.dst_port != fp.ports.map(|(_, dst)| dst) {
            filter.dst_port = None;
        }
    }

    // Ports without a transport protocol would match the other protocol too.
    if filter.protocol.is_none() {
        filter = CaptureFilter::any();
    }

    filter
}
