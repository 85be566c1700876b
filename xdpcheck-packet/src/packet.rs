use std::{
    fmt,
    hash::{Hash, Hasher},
    net::IpAddr,
};

use bytes::Bytes;
use pnet::{
    packet::{
        ethernet::{EtherTypes, EthernetPacket},
        ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
        ipv4::Ipv4Packet,
        ipv6::Ipv6Packet,
        tcp::TcpPacket,
        udp::UdpPacket,
    },
    util::MacAddr,
};

use crate::{Error, Result};

const ETHERNET_HEADER_LEN: usize = 14;

/// Network layer fields that take part in packet equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkFields {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IP protocol number, or IPv6 next header.
    pub protocol: u8,
}

/// The parts of a frame that identify it across hops.
///
/// Fields legitimately rewritten in transit (checksums, TTL/hop limit, IP identification) and
/// trailing link-layer padding are not part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub ether_src: MacAddr,
    pub ether_dst: MacAddr,
    pub ethertype: u16,
    pub network: Option<NetworkFields>,
    /// Source and destination port, for TCP and UDP.
    pub ports: Option<(u16, u16)>,
    /// The transport payload, or whatever follows the last parsed header.
    pub payload: Bytes,
}

impl Fingerprint {
    /// Parses the fingerprint of a raw Ethernet frame.
    pub fn parse(frame: &Bytes) -> Result<Self> {
        let ethernet = EthernetPacket::new(frame)
            .ok_or_else(|| Error::Malformed(format!("frame of {} bytes", frame.len())))?;

        let mut fingerprint = Self {
            ether_src: ethernet.get_source(),
            ether_dst: ethernet.get_destination(),
            ethertype: ethernet.get_ethertype().0,
            network: None,
            ports: None,
            payload: frame.slice(ETHERNET_HEADER_LEN..),
        };

        let l3 = frame.slice(ETHERNET_HEADER_LEN..);
        let (network, l4) = match ethernet.get_ethertype() {
            EtherTypes::Ipv4 => match parse_ipv4(&l3) {
                Some(parsed) => parsed,
                None => return Ok(fingerprint),
            },
            EtherTypes::Ipv6 => match parse_ipv6(&l3) {
                Some(parsed) => parsed,
                None => return Ok(fingerprint),
            },
            _ => return Ok(fingerprint),
        };

        fingerprint.network = Some(network);
        fingerprint.payload = l4.clone();

        let offset = match IpNextHeaderProtocol(network.protocol) {
            IpNextHeaderProtocols::Udp => UdpPacket::new(&l4).map(|udp| {
                fingerprint.ports = Some((udp.get_source(), udp.get_destination()));
                UdpPacket::minimum_packet_size()
            }),
            IpNextHeaderProtocols::Tcp => TcpPacket::new(&l4).map(|tcp| {
                fingerprint.ports = Some((tcp.get_source(), tcp.get_destination()));
                (tcp.get_data_offset() as usize * 4).min(l4.len())
            }),
            _ => None,
        };

        if let Some(offset) = offset {
            fingerprint.payload = l4.slice(offset..);
        }

        Ok(fingerprint)
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.network.map(|n| n.src)
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.network.map(|n| n.dst)
    }

    pub fn protocol(&self) -> Option<u8> {
        self.network.map(|n| n.protocol)
    }
}

/// Returns the network fields and the transport bytes, bounded by the IP length field so that
/// link-layer padding is cut off.
fn parse_ipv4(l3: &Bytes) -> Option<(NetworkFields, Bytes)> {
    let ip = Ipv4Packet::new(l3)?;
    let header_len = ip.get_header_length() as usize * 4;
    let end = (ip.get_total_length() as usize).min(l3.len());
    if header_len > end {
        return None;
    }

    let fields = NetworkFields {
        src: ip.get_source().into(),
        dst: ip.get_destination().into(),
        protocol: ip.get_next_level_protocol().0,
    };
    Some((fields, l3.slice(header_len..end)))
}

fn parse_ipv6(l3: &Bytes) -> Option<(NetworkFields, Bytes)> {
    let ip = Ipv6Packet::new(l3)?;
    let header_len = Ipv6Packet::minimum_packet_size();
    let end = (header_len + ip.get_payload_length() as usize).min(l3.len());

    let fields = NetworkFields {
        src: ip.get_source().into(),
        dst: ip.get_destination().into(),
        protocol: ip.get_next_header().0,
    };
    Some((fields, l3.slice(header_len..end)))
}

/// An immutable link-layer frame.
///
/// Two packets are equal when their [`Fingerprint`]s are, i.e. when they are the same packet
/// observed at different points of the path.
#[derive(Clone)]
pub struct Packet {
    data: Bytes,
    fingerprint: Fingerprint,
}

impl Packet {
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let fingerprint = Fingerprint::parse(&data)?;
        Ok(Self { data, fingerprint })
    }

    /// The raw frame, as sent or captured.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A one-line human readable description, used in assertion messages.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for Packet {}

impl Hash for Packet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("summary", &self.to_string())
            .field("len", &self.len())
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fp = &self.fingerprint;
        write!(f, "{} > {}", fp.ether_src, fp.ether_dst)?;

        let Some(network) = fp.network else {
            return write!(f, " ethertype {:#06x} len {}", fp.ethertype, fp.payload.len());
        };

        let proto = match IpNextHeaderProtocol(network.protocol) {
            IpNextHeaderProtocols::Udp => "UDP".to_owned(),
            IpNextHeaderProtocols::Tcp => "TCP".to_owned(),
            IpNextHeaderProtocols::Icmp => "ICMP".to_owned(),
            IpNextHeaderProtocols::Icmpv6 => "ICMPv6".to_owned(),
            other => format!("proto {}", other.0),
        };

        match fp.ports {
            Some((sport, dport)) => write!(
                f,
                ", {proto} {} > {}",
                std::net::SocketAddr::new(network.src, sport),
                std::net::SocketAddr::new(network.dst, dport)
            )?,
            None => write!(f, ", {proto} {} > {}", network.src, network.dst)?,
        }

        write!(f, " payload {:?}", String::from_utf8_lossy(&fp.payload))
    }
}
