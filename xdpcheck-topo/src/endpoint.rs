use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    process::Command,
    str::FromStr,
};

use pnet::util::MacAddr;

use crate::{command::Runner, validate_iface_name, Error, Result};

/// Default port of a capture agent.
pub const DEFAULT_AGENT_PORT: u16 = 6555;

/// How the filter program is attached to an interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum XdpMode {
    /// Generic XDP, run from the networking stack (`skb`).
    #[default]
    Skb,
    /// Native XDP, run by the driver.
    Native,
    /// Offloaded to the NIC.
    Hw,
}

impl XdpMode {
    /// The value passed to the filter tool's `--mode` flag.
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Skb => "skb",
            Self::Native => "native",
            Self::Hw => "hw",
        }
    }
}

impl fmt::Display for XdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for XdpMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skb" | "generic" => Ok(Self::Skb),
            "native" | "drv" => Ok(Self::Native),
            "hw" | "offload" => Ok(Self::Hw),
            other => Err(format!("unknown xdp mode: {other}")),
        }
    }
}

/// One side of a link under test. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    iface: String,
    ether: MacAddr,
    inet: Option<Ipv4Addr>,
    inet6: Option<Ipv6Addr>,
    xdp_mode: XdpMode,
}

impl Endpoint {
    #[inline]
    pub fn iface(&self) -> &str {
        &self.iface
    }

    #[inline]
    pub fn ether(&self) -> MacAddr {
        self.ether
    }

    #[inline]
    pub fn inet(&self) -> Option<Ipv4Addr> {
        self.inet
    }

    #[inline]
    pub fn inet6(&self) -> Option<Ipv6Addr> {
        self.inet6
    }

    #[inline]
    pub fn xdp_mode(&self) -> XdpMode {
        self.xdp_mode
    }
}

/// Description of an endpoint before its link address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub iface: String,
    pub ether: Option<MacAddr>,
    pub inet: Option<Ipv4Addr>,
    pub inet6: Option<Ipv6Addr>,
    pub xdp_mode: XdpMode,
}

impl EndpointSpec {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            ether: None,
            inet: None,
            inet6: None,
            xdp_mode: XdpMode::default(),
        }
    }

    pub fn ether(mut self, ether: MacAddr) -> Self {
        self.ether = Some(ether);
        self
    }

    pub fn inet(mut self, inet: Ipv4Addr) -> Self {
        self.inet = Some(inet);
        self
    }

    pub fn inet6(mut self, inet6: Ipv6Addr) -> Self {
        self.inet6 = Some(inet6);
        self
    }

    pub fn xdp_mode(mut self, mode: XdpMode) -> Self {
        self.xdp_mode = mode;
        self
    }

    /// Builds the endpoint with an explicit link address, which takes precedence over
    /// [`EndpointSpec::ether`].
    pub fn with_ether(self, ether: MacAddr) -> Result<Endpoint> {
        validate_iface_name(&self.iface)?;

        Ok(Endpoint {
            iface: self.iface,
            ether,
            inet: self.inet,
            inet6: self.inet6,
            xdp_mode: self.xdp_mode,
        })
    }

    /// Builds the endpoint from the link address set with [`EndpointSpec::ether`].
    pub fn build(self) -> Result<Endpoint> {
        let ether = self
            .ether
            .ok_or_else(|| Error::InvalidState(format!("no link address for {}", self.iface)))?;
        self.with_ether(ether)
    }

    /// Builds the endpoint of an interface of this host, reading its link address from the
    /// kernel unless one was set.
    pub fn resolve(self) -> Result<Endpoint> {
        if self.ether.is_some() {
            return self.build();
        }

        validate_iface_name(&self.iface)?;
        let ether = read_link_address(None, &self.iface)?;
        self.with_ether(ether)
    }
}

/// Reads the link address of `iface`, inside `namespace` if given.
pub(crate) fn read_link_address(namespace: Option<&str>, iface: &str) -> Result<MacAddr> {
    let mut cmd = Command::new("ip");
    if let Some(ns) = namespace {
        cmd.args(["-n", ns]);
    }
    cmd.args(["-o", "link", "show", "dev", iface]);

    let output = Runner::run(&mut cmd)
        .map_err(|e| Error::unavailable(format!("link address of {iface}"), e))?;

    parse_link_ether(&output.stdout)
        .ok_or_else(|| Error::InvalidState(format!("{iface} has no ethernet address")))
}

/// Extracts the address following `link/ether` in `ip -o link show` output.
pub(crate) fn parse_link_ether(output: &str) -> Option<MacAddr> {
    let mut words = output.split_whitespace();
    words.find(|w| *w == "link/ether")?;
    words.next()?.parse().ok()
}

/// Where a capture agent can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelDescriptor {
    pub addr: IpAddr,
    pub port: u16,
}

impl ChannelDescriptor {
    pub fn new(addr: impl Into<IpAddr>, port: u16) -> Self {
        Self { addr: addr.into(), port }
    }

    /// A descriptor on the default agent port.
    pub fn with_default_port(addr: impl Into<IpAddr>) -> Self {
        Self::new(addr, DEFAULT_AGENT_PORT)
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

impl From<SocketAddr> for ChannelDescriptor {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_link_output() {
        let output = "4: a_to_b@if3: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue \
                      state UP mode DEFAULT group default qlen 1000\\    \
                      link/ether 6a:2f:91:0c:13:ee brd ff:ff:ff:ff:ff:ff link-netns test_b";

        let ether = MacAddr::new(0x6a, 0x2f, 0x91, 0x0c, 0x13, 0xee);
        assert_eq!(parse_link_ether(output), Some(ether));
        assert_eq!(parse_link_ether("1: lo: <LOOPBACK> link/loopback 00:00:00:00:00:00"), None);
    }

    #[test]
    fn spec_builds_endpoint() {
        let ether = MacAddr::new(2, 0, 0, 0, 0, 1);
        let endpoint = EndpointSpec::new("a_to_b")
            .inet(Ipv4Addr::new(192, 168, 3, 1))
            .xdp_mode(XdpMode::Native)
            .with_ether(ether)
            .unwrap();

        assert_eq!(endpoint.iface(), "a_to_b");
        assert_eq!(endpoint.ether(), ether);
        assert_eq!(endpoint.inet(), Some(Ipv4Addr::new(192, 168, 3, 1)));
        assert_eq!(endpoint.inet6(), None);
        assert_eq!(endpoint.xdp_mode(), XdpMode::Native);

        assert!(matches!(EndpointSpec::new("a_to_b").build(), Err(Error::InvalidState(_))));
        assert!(EndpointSpec::new("way-too-long-interface").with_ether(ether).is_err());
    }

    #[test]
    fn xdp_mode_args() {
        assert_eq!("drv".parse::<XdpMode>().unwrap(), XdpMode::Native);
        assert_eq!(XdpMode::Skb.to_string(), "skb");
        assert!("turbo".parse::<XdpMode>().is_err());
    }

    #[test]
    fn descriptor_display() {
        let desc = ChannelDescriptor::new(Ipv4Addr::new(192, 168, 1, 2), 6000);
        assert_eq!(desc.to_string(), "192.168.1.2:6000");
        let desc = ChannelDescriptor::with_default_port(Ipv4Addr::LOCALHOST);
        assert_eq!(desc.port, DEFAULT_AGENT_PORT);
    }
}
