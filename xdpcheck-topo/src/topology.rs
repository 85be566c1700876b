use std::net::IpAddr;

use crate::{
    endpoint::{read_link_address, ChannelDescriptor, Endpoint, EndpointSpec},
    link,
    namespace::NetworkNamespace,
    validate_iface_name, Error, Result,
};

/// A capture point reached through a capture agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePoint {
    pub channel: ChannelDescriptor,
    pub iface: String,
}

impl RemotePoint {
    pub fn new(channel: ChannelDescriptor, iface: impl Into<String>) -> Self {
        Self { channel, iface: iface.into() }
    }
}

/// Interfaces and namespace created for a virtual topology.
///
/// Two veth pairs connect the host namespace with the peer namespace: the *test* link carrying
/// the traffic under test, and the *control* link carrying the capture agent's channel.
#[derive(Debug)]
struct VirtualLink {
    namespace: NetworkNamespace,
    /// Host ends of the veth pairs created so far, in creation order.
    created: Vec<String>,
}

impl VirtualLink {
    fn new(namespace: NetworkNamespace) -> Self {
        Self { namespace, created: Vec::new() }
    }

    fn control_names(pair_name: &str) -> (String, String) {
        (format!("{pair_name}-cl"), format!("{pair_name}-cr"))
    }

    /// Creates the veth pair `host <-> peer`, with `peer` in the namespace, and records it for
    /// teardown.
    fn create_pair(&mut self, host: &str, peer: &str) -> Result<()> {
        link::create_veth_pair(host, peer, &self.namespace)?;
        self.created.push(host.to_owned());
        Ok(())
    }

    /// Removes the veth pairs this link created and the namespace. Every step runs even if a
    /// previous one failed, the first error is returned.
    fn teardown(&self) -> Result<()> {
        let results = self
            .created
            .iter()
            .rev()
            .map(String::as_str)
            .map(link::delete_link)
            .chain(std::iter::once_with(|| self.namespace.delete()))
            .collect::<Vec<_>>();

        let mut first = Ok(());
        for result in results {
            if let Err(e) = result {
                let namespace = self.namespace.name();
                tracing::error!(?e, namespace, "failed to tear down virtual link");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }

        first
    }
}

#[derive(Debug)]
enum Kind {
    /// The remote side is a separate host, only known through its agent.
    Remote,
    /// The remote side was created by the harness and is owned by the topology.
    Virtual(VirtualLink),
}

/// A local/remote endpoint pair plus the channel to coordinate them.
#[derive(Debug)]
pub struct Topology {
    name: String,
    local: Endpoint,
    remote: Endpoint,
    channel: ChannelDescriptor,
    observers: Vec<RemotePoint>,
    kind: Kind,
    torn_down: bool,
}

impl Topology {
    /// A topology whose remote side is a pre-existing interface on another host.
    pub fn new_remote(
        local: Endpoint,
        remote: Endpoint,
        channel: ChannelDescriptor,
    ) -> Result<Self> {
        ensure_distinct(&local, &remote)?;

        Ok(Self {
            name: format!("{}<->{}@{}", local.iface(), remote.iface(), channel),
            local,
            remote,
            channel,
            observers: Vec::new(),
            kind: Kind::Remote,
            torn_down: false,
        })
    }

    /// Creates a self-contained topology: the network namespace `pair_name`, a test veth pair
    /// `local <-> remote` and a control veth pair carrying `local_channel <-> remote_channel`.
    ///
    /// The remote end of both pairs lives in the namespace, where a capture agent is expected to
    /// listen on `remote_channel`. Anything created before a failure is removed again.
    pub fn new_virtual(
        local: EndpointSpec,
        local_channel: IpAddr,
        pair_name: &str,
        remote: EndpointSpec,
        remote_channel: ChannelDescriptor,
    ) -> Result<Self> {
        if local.iface == remote.iface {
            return Err(shared_iface(&local.iface));
        }

        let (control_local, control_remote) = VirtualLink::control_names(pair_name);
        for name in [local.iface.as_str(), remote.iface.as_str(), &control_local, &control_remote] {
            validate_iface_name(name)?;
        }

        let mut virtual_link = VirtualLink::new(NetworkNamespace::create(pair_name)?);
        let created =
            setup_virtual(&mut virtual_link, &local, local_channel, &remote, remote_channel);
        let (local_ether, remote_ether) = match created {
            Ok(ethers) => ethers,
            Err(e) => {
                let _ = virtual_link.teardown();
                return Err(Error::unavailable(format!("virtual pair {pair_name}"), e));
            }
        };

        tracing::info!(
            pair = pair_name,
            local = local.iface,
            remote = remote.iface,
            "created virtual topology"
        );

        Ok(Self {
            name: pair_name.to_owned(),
            local: local.with_ether(local_ether)?,
            remote: remote.with_ether(remote_ether)?,
            channel: remote_channel,
            observers: Vec::new(),
            kind: Kind::Virtual(virtual_link),
            torn_down: false,
        })
    }

    /// Adds an extra observation point, after the remote endpoint in capture order.
    pub fn with_observer(mut self, point: RemotePoint) -> Self {
        self.observers.push(point);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> Result<&Endpoint> {
        self.ensure_live()?;
        Ok(&self.local)
    }

    pub fn remote(&self) -> Result<&Endpoint> {
        self.ensure_live()?;
        Ok(&self.remote)
    }

    /// The channel of the agent serving the remote endpoint.
    pub fn channel(&self) -> Result<ChannelDescriptor> {
        self.ensure_live()?;
        Ok(self.channel)
    }

    /// Every remote observation point, in declaration order: the remote endpoint first, then
    /// the extra observers.
    pub fn remote_points(&self) -> Result<Vec<RemotePoint>> {
        self.ensure_live()?;

        let mut points = Vec::with_capacity(1 + self.observers.len());
        points.push(RemotePoint::new(self.channel, self.remote.iface()));
        points.extend(self.observers.iter().cloned());
        Ok(points)
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, Kind::Virtual(_))
    }

    /// The namespace holding the remote side of a virtual topology.
    pub fn namespace(&self) -> Option<&NetworkNamespace> {
        match &self.kind {
            Kind::Virtual(link) if !self.torn_down => Some(&link.namespace),
            _ => None,
        }
    }

    #[inline]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Releases what the topology owns. Idempotent: only the first call does any work.
    pub fn teardown(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.torn_down, true) {
            return Ok(());
        }

        match &self.kind {
            Kind::Virtual(link) => {
                tracing::info!(topology = self.name, "tearing down virtual topology");
                link.teardown()
            }
            Kind::Remote => Ok(()),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(Error::InvalidState(format!("topology {} was torn down", self.name)));
        }
        Ok(())
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::error!(?e, topology = self.name, "failed to tear down topology on drop");
        }
    }
}

fn ensure_distinct(local: &Endpoint, remote: &Endpoint) -> Result<()> {
    if local.iface() == remote.iface() {
        return Err(shared_iface(local.iface()));
    }
    Ok(())
}

fn shared_iface(iface: &str) -> Error {
    Error::InvalidState(format!("local and remote share interface {iface}"))
}

fn addresses(spec: &EndpointSpec) -> Vec<IpAddr> {
    spec.inet.map(IpAddr::V4).into_iter().chain(spec.inet6.map(IpAddr::V6)).collect()
}

fn setup_virtual(
    link: &mut VirtualLink,
    local: &EndpointSpec,
    local_channel: IpAddr,
    remote: &EndpointSpec,
    remote_channel: ChannelDescriptor,
) -> Result<(pnet::util::MacAddr, pnet::util::MacAddr)> {
    let (control_local, control_remote) = VirtualLink::control_names(link.namespace.name());
    link.create_pair(&local.iface, &remote.iface)?;
    link.create_pair(&control_local, &control_remote)?;

    let ns = &link.namespace;
    let mut lo = ns.ip();
    lo.args(["link", "set", "dev", "lo", "up"]);
    crate::command::Runner::run(&mut lo)?;

    link::configure(None, &local.iface, &addresses(local))?;
    link::configure(Some(ns), &remote.iface, &addresses(remote))?;
    link::configure(None, &control_local, &[local_channel])?;
    link::configure(Some(ns), &control_remote, &[remote_channel.addr])?;

    let local_ether = match local.ether {
        Some(ether) => ether,
        None => read_link_address(None, &local.iface)?,
    };
    let remote_ether = match remote.ether {
        Some(ether) => ether,
        None => read_link_address(Some(ns.name()), &remote.iface)?,
    };

    Ok((local_ether, remote_ether))
}

/// An ordered set of topologies, iterated in insertion order.
#[derive(Debug, Default)]
pub struct TopologySet {
    topologies: Vec<Topology>,
}

impl TopologySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, topology: Topology) {
        self.topologies.push(topology);
    }

    pub fn len(&self) -> usize {
        self.topologies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topologies.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Topology> {
        self.topologies.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Topology> {
        self.topologies.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Topology> {
        self.topologies.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Topology> {
        self.topologies.iter_mut()
    }

    /// Tears down every topology, returning the first error.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first = Ok(());
        for topology in &mut self.topologies {
            if let Err(e) = topology.teardown() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

impl FromIterator<Topology> for TopologySet {
    fn from_iter<I: IntoIterator<Item = Topology>>(iter: I) -> Self {
        Self { topologies: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a TopologySet {
    type Item = &'a Topology;
    type IntoIter = std::slice::Iter<'a, Topology>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a> IntoIterator for &'a mut TopologySet {
    type Item = &'a mut Topology;
    type IntoIter = std::slice::IterMut<'a, Topology>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}
