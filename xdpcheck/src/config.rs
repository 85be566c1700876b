//! Declarative description of the topologies a run needs.

use std::net::{IpAddr, Ipv4Addr};

use xdpcheck_channel::AgentOptions;
use xdpcheck_topo::{ChannelDescriptor, EndpointSpec, Topology, TopologySet, XdpMode};

use crate::{agent::NamespaceAgent, Result};

/// One topology, before it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyConfig {
    /// The remote side is an interface of another host running `xdpcheck agent`.
    Remote { local: EndpointSpec, remote: EndpointSpec, channel: ChannelDescriptor },
    /// The remote side is created on this host, in the namespace `pair_name`.
    Virtual {
        local: EndpointSpec,
        local_channel: IpAddr,
        pair_name: String,
        remote: EndpointSpec,
        remote_channel: ChannelDescriptor,
    },
}

impl TopologyConfig {
    /// Creates the topology. The link address of a remote host's interface cannot be read from
    /// here and must be configured.
    pub fn build(&self) -> Result<Topology> {
        let topology = match self.clone() {
            Self::Remote { local, remote, channel } => {
                Topology::new_remote(local.resolve()?, remote.build()?, channel)?
            }
            Self::Virtual { local, local_channel, pair_name, remote, remote_channel } => {
                Topology::new_virtual(local, local_channel, &pair_name, remote, remote_channel)?
            }
        };

        Ok(topology)
    }

    pub const fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }
}

/// Where `xdpcheck agent` listens when this host serves as the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub iface: String,
    pub listen: ChannelDescriptor,
}

/// The server side of this host and the topologies to run the suite on, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    pub clients: Vec<TopologyConfig>,
}

/// Created topologies and the agents serving their virtual peers.
#[derive(Debug)]
pub struct Deployment {
    pub topologies: TopologySet,
    /// Must be stopped before the topologies are torn down.
    pub agents: Vec<NamespaceAgent>,
}

impl HarnessConfig {
    /// Two virtual pairs in native mode, with the remote ends in `test_b` and `test_c`.
    pub fn default_virtual() -> Self {
        let pair = |local: &str, local_inet, remote: &str, remote_inet| {
            (
                EndpointSpec::new(local).inet(local_inet).xdp_mode(XdpMode::Native),
                EndpointSpec::new(remote).inet(remote_inet).xdp_mode(XdpMode::Native),
            )
        };

        let (local_b, remote_b) =
            pair("a_to_b", Ipv4Addr::new(192, 168, 3, 1), "b_to_a", Ipv4Addr::new(192, 168, 3, 2));
        let (local_c, remote_c) =
            pair("a_to_c", Ipv4Addr::new(192, 168, 2, 3), "c_to_a", Ipv4Addr::new(192, 168, 2, 4));

        Self {
            server: ServerConfig {
                iface: "enp0s31f6".to_owned(),
                listen: ChannelDescriptor::with_default_port(Ipv4Addr::new(192, 168, 0, 106)),
            },
            clients: vec![
                TopologyConfig::Virtual {
                    local: local_b,
                    local_channel: Ipv4Addr::new(192, 168, 1, 1).into(),
                    pair_name: "test_b".to_owned(),
                    remote: remote_b,
                    remote_channel: ChannelDescriptor::new(Ipv4Addr::new(192, 168, 1, 2), 6000),
                },
                TopologyConfig::Virtual {
                    local: local_c,
                    local_channel: Ipv4Addr::new(192, 168, 4, 1).into(),
                    pair_name: "test_c".to_owned(),
                    remote: remote_c,
                    remote_channel: ChannelDescriptor::new(Ipv4Addr::new(192, 168, 4, 2), 6001),
                },
            ],
        }
    }

    /// Creates every client topology in order and starts an agent for each virtual one. On
    /// failure, whatever was created is torn down again.
    pub fn build(&self, agent_options: &AgentOptions) -> Result<Deployment> {
        let mut topologies = TopologySet::new();
        let mut agents = Vec::new();

        for client in &self.clients {
            let topology = client.build()?;
            if client.is_virtual() {
                agents.push(NamespaceAgent::spawn(&topology, agent_options.clone())?);
            }
            topologies.push(topology);
        }

        Ok(Deployment { topologies, agents })
    }
}
