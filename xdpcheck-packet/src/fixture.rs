//! Deterministic packet fixtures.
//!
//! By default every fixture packet travels from the remote endpoint of a topology to its local
//! endpoint, the interface the filter is attached to.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::{
    packet::{
        ethernet::{EtherTypes, MutableEthernetPacket},
        ip::IpNextHeaderProtocol,
        ipv4::{self, MutableIpv4Packet},
        ipv6::MutableIpv6Packet,
        tcp::{self, MutableTcpPacket, TcpFlags},
        udp::{self, MutableUdpPacket},
    },
    util::MacAddr,
};
use xdpcheck_topo::Topology;
use xdpcheck_wire::control::TransportProtocol;

use crate::{AddressFamily, Error, Packet, Result};

pub const DEFAULT_AMOUNT: usize = 5;
pub const DEFAULT_SRC_PORT: u16 = 50000;
pub const DEFAULT_DST_PORT: u16 = 60000;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const TCP_HEADER_LEN: usize = 20;
const DEFAULT_TTL: u8 = 64;
const DEFAULT_TCP_WINDOW: u16 = 8192;

/// Payload of the `n`-th fixture packet.
pub fn default_payload(n: usize) -> String {
    format!("xdpcheck packet #{n}")
}

/// Field overrides for [`generate_default_packets`]. Unset fields fall back to the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureOverrides {
    pub src_ether: Option<MacAddr>,
    pub dst_ether: Option<MacAddr>,
    pub src_inet: Option<Ipv4Addr>,
    pub dst_inet: Option<Ipv4Addr>,
    pub src_inet6: Option<Ipv6Addr>,
    pub dst_inet6: Option<Ipv6Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Option<TransportProtocol>,
    pub amount: Option<usize>,
    /// Build IPv6 packets instead of IPv4 ones.
    pub use_inet6: bool,
}

impl FixtureOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_ether(mut self, ether: MacAddr) -> Self {
        self.src_ether = Some(ether);
        self
    }

    pub fn dst_ether(mut self, ether: MacAddr) -> Self {
        self.dst_ether = Some(ether);
        self
    }

    pub fn src_inet(mut self, inet: Ipv4Addr) -> Self {
        self.src_inet = Some(inet);
        self
    }

    pub fn dst_inet(mut self, inet: Ipv4Addr) -> Self {
        self.dst_inet = Some(inet);
        self
    }

    pub fn src_inet6(mut self, inet6: Ipv6Addr) -> Self {
        self.src_inet6 = Some(inet6);
        self
    }

    pub fn dst_inet6(mut self, inet6: Ipv6Addr) -> Self {
        self.dst_inet6 = Some(inet6);
        self
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = Some(port);
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    pub fn protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn amount(mut self, amount: usize) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn use_inet6(mut self) -> Self {
        self.use_inet6 = true;
        self
    }

    /// Sets the destination field of `family` to `address`, given in the family's notation.
    pub fn dst_address(self, family: AddressFamily, address: &str) -> Result<Self> {
        let malformed = || Error::Malformed(format!("{family} address {address:?}"));

        Ok(match family {
            AddressFamily::Ipv4 => self.dst_inet(address.parse().map_err(|_| malformed())?),
            AddressFamily::Port => self.dst_port(address.parse().map_err(|_| malformed())?),
            AddressFamily::Ether => self.dst_ether(address.parse().map_err(|_| malformed())?),
        })
    }
}

/// Header fields of a single fixture packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    pub src_ether: MacAddr,
    pub dst_ether: MacAddr,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Headers {
    /// Resolves the headers for `topology` with `overrides` applied.
    pub fn resolve(topology: &Topology, overrides: &FixtureOverrides) -> Result<Self> {
        let local = topology.local()?;
        let remote = topology.remote()?;

        let (src_ip, dst_ip) = if overrides.use_inet6 {
            let src = overrides.src_inet6.or(remote.inet6());
            let dst = overrides.dst_inet6.or(local.inet6());
            let src = src.ok_or(Error::MissingAddress("source IPv6"))?;
            let dst = dst.ok_or(Error::MissingAddress("destination IPv6"))?;
            (IpAddr::V6(src), IpAddr::V6(dst))
        } else {
            let src = overrides.src_inet.or(remote.inet());
            let dst = overrides.dst_inet.or(local.inet());
            let src = src.ok_or(Error::MissingAddress("source IPv4"))?;
            let dst = dst.ok_or(Error::MissingAddress("destination IPv4"))?;
            (IpAddr::V4(src), IpAddr::V4(dst))
        };

        Ok(Self {
            src_ether: overrides.src_ether.unwrap_or_else(|| remote.ether()),
            dst_ether: overrides.dst_ether.unwrap_or_else(|| local.ether()),
            src_ip,
            dst_ip,
            protocol: overrides.protocol.unwrap_or(TransportProtocol::Udp),
            src_port: overrides.src_port.unwrap_or(DEFAULT_SRC_PORT),
            dst_port: overrides.dst_port.unwrap_or(DEFAULT_DST_PORT),
        })
    }
}

/// Builds the default fixture for `topology`: [`DEFAULT_AMOUNT`] packets from the remote to the
/// local endpoint, carrying [`default_payload`]. The same inputs always give the same bytes.
pub fn generate_default_packets(
    topology: &Topology,
    overrides: &FixtureOverrides,
) -> Result<Vec<Packet>> {
    let headers = Headers::resolve(topology, overrides)?;
    let amount = overrides.amount.unwrap_or(DEFAULT_AMOUNT);

    (0..amount).map(|n| build_packet(&headers, n as u32, default_payload(n).as_bytes())).collect()
}

/// Builds one Ethernet frame with valid checksums. `seq` is used as the TCP sequence number.
pub fn build_packet(headers: &Headers, seq: u32, payload: &[u8]) -> Result<Packet> {
    let transport_len = match headers.protocol {
        TransportProtocol::Udp => UDP_HEADER_LEN,
        TransportProtocol::Tcp => TCP_HEADER_LEN,
    } + payload.len();

    let (ip_header_len, ethertype) = match headers.src_ip {
        IpAddr::V4(_) => (IPV4_HEADER_LEN, EtherTypes::Ipv4),
        IpAddr::V6(_) => (IPV6_HEADER_LEN, EtherTypes::Ipv6),
    };

    let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + ip_header_len + transport_len];

    let mut ethernet = MutableEthernetPacket::new(&mut buffer).ok_or(Error::Build("ethernet"))?;
    ethernet.set_source(headers.src_ether);
    ethernet.set_destination(headers.dst_ether);
    ethernet.set_ethertype(ethertype);

    let next = IpNextHeaderProtocol(headers.protocol.number());
    let l3 = &mut buffer[ETHERNET_HEADER_LEN..];

    match (headers.src_ip, headers.dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut ip = MutableIpv4Packet::new(l3).ok_or(Error::Build("ipv4"))?;
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((IPV4_HEADER_LEN + transport_len) as u16);
            ip.set_identification(1);
            ip.set_ttl(DEFAULT_TTL);
            ip.set_next_level_protocol(next);
            ip.set_source(src);
            ip.set_destination(dst);
            let checksum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);

            let l4 = &mut l3[IPV4_HEADER_LEN..];
            match headers.protocol {
                TransportProtocol::Udp => {
                    let mut udp = fill_udp(l4, headers, payload)?;
                    let checksum = udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
                    udp.set_checksum(checksum);
                }
                TransportProtocol::Tcp => {
                    let mut tcp = fill_tcp(l4, headers, seq, payload)?;
                    let checksum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
                    tcp.set_checksum(checksum);
                }
            }
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut ip = MutableIpv6Packet::new(l3).ok_or(Error::Build("ipv6"))?;
            ip.set_version(6);
            ip.set_payload_length(transport_len as u16);
            ip.set_next_header(next);
            ip.set_hop_limit(DEFAULT_TTL);
            ip.set_source(src);
            ip.set_destination(dst);

            let l4 = &mut l3[IPV6_HEADER_LEN..];
            match headers.protocol {
                TransportProtocol::Udp => {
                    let mut udp = fill_udp(l4, headers, payload)?;
                    let checksum = udp::ipv6_checksum(&udp.to_immutable(), &src, &dst);
                    udp.set_checksum(checksum);
                }
                TransportProtocol::Tcp => {
                    let mut tcp = fill_tcp(l4, headers, seq, payload)?;
                    let checksum = tcp::ipv6_checksum(&tcp.to_immutable(), &src, &dst);
                    tcp.set_checksum(checksum);
                }
            }
        }
        _ => return Err(Error::Build("mixed address families")),
    }

    Packet::from_bytes(buffer)
}

fn fill_udp<'a>(
    buf: &'a mut [u8],
    headers: &Headers,
    payload: &[u8],
) -> Result<MutableUdpPacket<'a>> {
    let mut udp = MutableUdpPacket::new(buf).ok_or(Error::Build("udp"))?;
    udp.set_source(headers.src_port);
    udp.set_destination(headers.dst_port);
    udp.set_length((UDP_HEADER_LEN + payload.len()) as u16);
    udp.set_payload(payload);
    Ok(udp)
}

fn fill_tcp<'a>(
    buf: &'a mut [u8],
    headers: &Headers,
    seq: u32,
    payload: &[u8],
) -> Result<MutableTcpPacket<'a>> {
    let mut tcp = MutableTcpPacket::new(buf).ok_or(Error::Build("tcp"))?;
    tcp.set_source(headers.src_port);
    tcp.set_destination(headers.dst_port);
    tcp.set_sequence(seq);
    tcp.set_data_offset(5);
    tcp.set_flags(TcpFlags::SYN);
    tcp.set_window(DEFAULT_TCP_WINDOW);
    tcp.set_payload(payload);
    Ok(tcp)
}

#[cfg(test)]
mod tests {
    use xdpcheck_topo::{ChannelDescriptor, EndpointSpec};

    use super::*;

    fn topology() -> Topology {
        let local = EndpointSpec::new("a_to_b")
            .inet(Ipv4Addr::new(192, 168, 1, 1))
            .inet6("fc00:dead:cafe:1::1".parse().unwrap())
            .with_ether(MacAddr::new(2, 0, 0, 0, 1, 1))
            .unwrap();
        let remote = EndpointSpec::new("b_to_a")
            .inet(Ipv4Addr::new(192, 168, 1, 2))
            .with_ether(MacAddr::new(2, 0, 0, 0, 1, 2))
            .unwrap();

        let channel = ChannelDescriptor::with_default_port(Ipv4Addr::LOCALHOST);
        Topology::new_remote(local, remote, channel).unwrap()
    }

    #[test]
    fn sampled_addresses_override_the_destination() {
        let overrides = FixtureOverrides::default();
        for family in [AddressFamily::Ipv4, AddressFamily::Port, AddressFamily::Ether] {
            let address = &family.sample(3)[2];
            let targeted = overrides.clone().dst_address(family, address).unwrap();
            let packets = generate_default_packets(&topology(), &targeted).unwrap();
            let fp = packets[0].fingerprint();

            let observed = match family {
                AddressFamily::Ipv4 => fp.dst_ip().unwrap().to_string(),
                AddressFamily::Port => fp.ports.unwrap().1.to_string(),
                AddressFamily::Ether => fp.ether_dst.to_string(),
            };
            assert_eq!(&observed, address, "{family}");
        }

        assert!(overrides.dst_address(AddressFamily::Port, "65536").is_err());
    }

    #[test]
    fn defaults_flow_from_remote_to_local() {
        let packets = generate_default_packets(&topology(), &FixtureOverrides::default()).unwrap();
        assert_eq!(packets.len(), DEFAULT_AMOUNT);

        let fp = packets[0].fingerprint();
        assert_eq!(fp.ether_src, MacAddr::new(2, 0, 0, 0, 1, 2));
        assert_eq!(fp.ether_dst, MacAddr::new(2, 0, 0, 0, 1, 1));
        assert_eq!(fp.src_ip(), Some(Ipv4Addr::new(192, 168, 1, 2).into()));
        assert_eq!(fp.dst_ip(), Some(Ipv4Addr::new(192, 168, 1, 1).into()));
        assert_eq!(fp.ports, Some((DEFAULT_SRC_PORT, DEFAULT_DST_PORT)));
        assert_eq!(fp.protocol(), Some(17));
        assert_eq!(fp.payload.as_ref(), b"xdpcheck packet #0");

        // Payloads differ, so no two fixture packets are equal.
        assert_ne!(packets[0], packets[1]);
    }

    #[test]
    fn fixtures_are_byte_identical() {
        let overrides =
            FixtureOverrides::new().protocol(TransportProtocol::Tcp).dst_port(60002).amount(3);
        let a = generate_default_packets(&topology(), &overrides).unwrap();
        let b = generate_default_packets(&topology(), &overrides).unwrap();

        let a = a.iter().map(|p| p.data().clone()).collect::<Vec<_>>();
        let b = b.iter().map(|p| p.data().clone()).collect::<Vec<_>>();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn overrides_apply() {
        let overrides = FixtureOverrides::new()
            .src_inet(Ipv4Addr::new(10, 0, 0, 7))
            .dst_ether(MacAddr::new(0xaa, 0, 0, 0, 0, 1))
            .src_port(1234)
            .protocol(TransportProtocol::Tcp);
        let packets = generate_default_packets(&topology(), &overrides).unwrap();

        let fp = packets[4].fingerprint();
        assert_eq!(fp.src_ip(), Some(Ipv4Addr::new(10, 0, 0, 7).into()));
        assert_eq!(fp.ether_dst, MacAddr::new(0xaa, 0, 0, 0, 0, 1));
        assert_eq!(fp.ports, Some((1234, DEFAULT_DST_PORT)));
        assert_eq!(fp.protocol(), Some(6));
        assert_eq!(fp.payload.as_ref(), b"xdpcheck packet #4");
    }

    #[test]
    fn ipv6_needs_addresses() {
        let res = generate_default_packets(&topology(), &FixtureOverrides::new().use_inet6());
        assert!(matches!(res, Err(Error::MissingAddress("source IPv6"))));

        let overrides =
            FixtureOverrides::new().use_inet6().src_inet6("fc00:dead:cafe:1::2".parse().unwrap());
        let packets = generate_default_packets(&topology(), &overrides).unwrap();
        let fp = packets[0].fingerprint();
        assert_eq!(fp.ethertype, 0x86dd);
        assert_eq!(fp.dst_ip(), Some("fc00:dead:cafe:1::1".parse::<Ipv6Addr>().unwrap().into()));
    }

    #[test]
    fn udp_checksum_is_valid() {
        let packets =
            generate_default_packets(&topology(), &FixtureOverrides::new().amount(1)).unwrap();
        let data = packets[0].data();

        let ip = pnet::packet::ipv4::Ipv4Packet::new(&data[ETHERNET_HEADER_LEN..]).unwrap();
        assert_eq!(ipv4::checksum(&ip), ip.get_checksum());

        let udp = udp::UdpPacket::new(&data[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]).unwrap();
        let (src, dst) = (Ipv4Addr::new(192, 168, 1, 2), Ipv4Addr::new(192, 168, 1, 1));
        let expected = udp::ipv4_checksum(&udp, &src, &dst);
        assert_eq!(expected, udp.get_checksum());
    }
}
