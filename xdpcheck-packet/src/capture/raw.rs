//! Linux capture and injection over `AF_PACKET` sockets.

use std::{
    io,
    os::fd::{AsRawFd, OwnedFd},
    time::Duration,
};

use bytes::Bytes;
use nix::{
    errno::Errno,
    libc,
    net::if_::if_nametoindex,
    sys::{
        socket::{
            recvfrom, setsockopt, socket, sockopt, AddressFamily, LinkAddr, SockFlag,
            SockProtocol, SockType,
        },
        time::{TimeVal, TimeValLike},
    },
};
use pnet::datalink::{self, Channel};
use xdpcheck_common::constants::KiB;
use xdpcheck_wire::control::CaptureFilter;

use super::{Capture, Link};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RawLinkOptions {
    /// How long a blocked read waits before checking whether the capture was stopped.
    pub read_timeout: Duration,
    /// Size of the receive buffer, bigger than any frame on the link.
    pub frame_buffer_size: usize,
}

impl Default for RawLinkOptions {
    fn default() -> Self {
        Self { read_timeout: Duration::from_millis(50), frame_buffer_size: 64 * KiB as usize }
    }
}

impl RawLinkOptions {
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// The interfaces of this host, in the network namespace of the calling thread.
#[derive(Debug, Clone, Default)]
pub struct RawLink {
    options: RawLinkOptions,
}

impl RawLink {
    pub fn new(options: RawLinkOptions) -> Self {
        Self { options }
    }
}

impl Link for RawLink {
    fn arm(&self, iface: &str, filter: CaptureFilter) -> Result<Capture> {
        let socket = PacketSocket::open(iface, self.options.read_timeout)?;
        let (capture, recorder) = Capture::new(iface, filter);
        let mut buf = vec![0u8; self.options.frame_buffer_size];
        let name = iface.to_owned();

        let reader = std::thread::Builder::new().name(format!("capture-{iface}")).spawn(move || {
            while !recorder.is_stopped() {
                match socket.recv(&mut buf) {
                    Ok(Some(len)) => {
                        recorder.record(&buf[..len]);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(?e, iface = name, "capture socket failed");
                        break;
                    }
                }
            }
        })?;

        tracing::debug!(iface, ?filter, "capture armed");
        Ok(capture.with_reader(reader))
    }

    fn transmit(&self, iface: &str, frames: &[Bytes], gap: Duration) -> Result<usize> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == iface)
            .ok_or_else(|| Error::Interface(iface.to_owned()))?;

        let mut tx = match datalink::channel(&interface, datalink::Config::default())? {
            Channel::Ethernet(tx, _rx) => tx,
            _ => return Err(Error::Interface(format!("{iface}: unsupported channel type"))),
        };

        let mut sent = 0;
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                std::thread::sleep(gap);
            }

            match tx.send_to(frame, None) {
                Some(Ok(())) => sent += 1,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::Interface(format!("{iface}: send buffer unavailable"))),
            }
        }

        tracing::debug!(iface, sent, "frames transmitted");
        Ok(sent)
    }
}

/// An `AF_PACKET` socket receiving every protocol. Frames of other interfaces are skipped by
/// [`PacketSocket::recv`].
#[derive(Debug)]
struct PacketSocket {
    fd: OwnedFd,
    ifindex: usize,
}

impl PacketSocket {
    fn open(iface: &str, read_timeout: Duration) -> Result<Self> {
        let ifindex = if_nametoindex(iface).map_err(|_| Error::Interface(iface.to_owned()))?;

        let protocol = SockProtocol::EthAll;
        let fd = socket(AddressFamily::Packet, SockType::Raw, SockFlag::empty(), protocol)
            .map_err(io::Error::from)?;

        let timeout = TimeVal::microseconds(read_timeout.as_micros().max(1) as i64);
        setsockopt(&fd, sockopt::ReceiveTimeout, &timeout).map_err(io::Error::from)?;

        Ok(Self { fd, ifindex: ifindex as usize })
    }

    /// Reads one received frame into `buf`. Returns `None` on timeout, for frames of other
    /// interfaces, and for frames this host transmitted itself.
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let (len, addr) = match recvfrom::<LinkAddr>(self.fd.as_raw_fd(), buf) {
            Ok(received) => received,
            Err(Errno::EAGAIN | Errno::EINTR) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(addr) = addr else {
            return Ok(None);
        };
        if addr.ifindex() != self.ifindex || addr.pkttype() == libc::PACKET_OUTGOING {
            return Ok(None);
        }

        Ok(Some(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_cannot_be_armed() {
        // Resolved before any socket is opened, so no privileges are needed.
        let res = RawLink::default().arm("xdpcheck-none0", CaptureFilter::any());
        assert!(matches!(res, Err(Error::Interface(_))), "{res:?}");
    }

    #[test]
    #[ignore = "requires CAP_NET_RAW"]
    fn loopback_can_be_armed() {
        let capture = RawLink::default().arm("lo", CaptureFilter::any()).unwrap();
        assert_eq!(capture.iface(), "lo");
        capture.finish();
    }
}
