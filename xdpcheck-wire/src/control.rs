//! Requests and responses of the capture agent protocol.

use std::{fmt, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown tag: {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown error code: {0}")]
    UnknownCode(u8),
    #[error("invalid utf-8 string")]
    Utf8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("string of {0} bytes exceeds the limit of 65535")]
    StrTooLong(usize),
}

/// Transport protocols a capture can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    /// The IANA protocol number, as found in the IPv4 protocol / IPv6 next header field.
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coarse capture filter: every set field must match, unset fields match anything.
///
/// Ports are directional, so replies generated by the receiving host (e.g. a TCP reset with
/// swapped ports) are not recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureFilter {
    pub protocol: Option<TransportProtocol>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl CaptureFilter {
    /// A filter that records every frame.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = Some(protocol);
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

    /// Checks the transport-level fields of a frame against the filter. `ports` is `None` for
    /// frames without a TCP/UDP header.
    pub fn matches(&self, protocol: Option<u8>, ports: Option<(u16, u16)>) -> bool {
        if let Some(expected) = self.protocol {
            if protocol != Some(expected.number()) {
                return false;
            }
        }

        if self.src_port.is_none() && self.dst_port.is_none() {
            return true;
        }

        let Some((src, dst)) = ports else {
            return false;
        };

        self.src_port.map_or(true, |p| p == src) && self.dst_port.map_or(true, |p| p == dst)
    }
}

/// A frame recorded by a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Reception time, UNIX microseconds.
    pub timestamp_micros: u64,
    /// The raw link-layer frame.
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Liveness check, sent right after connecting.
    Ping,
    /// Start recording frames on `iface`. The agent only acknowledges once the capture is live.
    Arm {
        iface: String,
        filter: CaptureFilter,
        /// Number of frames after which the capture is complete, if known.
        expect: Option<u32>,
    },
    /// Wait for the capture to complete or `timeout` to elapse, then return and release it.
    Collect { handle: u32, timeout: Duration },
    /// Write `frames` to `iface`, in order.
    Inject { iface: String, frames: Vec<Bytes> },
}

/// Error classes reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AlreadyArmed,
    UnknownHandle,
    Interface,
    Malformed,
    Internal,
}

impl ErrorCode {
    const fn to_u8(self) -> u8 {
        match self {
            Self::AlreadyArmed => 1,
            Self::UnknownHandle => 2,
            Self::Interface => 3,
            Self::Malformed => 4,
            Self::Internal => 5,
        }
    }

    fn from_u8(code: u8) -> Result<Self, DecodeError> {
        Ok(match code {
            1 => Self::AlreadyArmed,
            2 => Self::UnknownHandle,
            3 => Self::Interface,
            4 => Self::Malformed,
            5 => Self::Internal,
            other => return Err(DecodeError::UnknownCode(other)),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyArmed => "already armed",
            Self::UnknownHandle => "unknown handle",
            Self::Interface => "interface error",
            Self::Malformed => "malformed request",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong,
    Armed { handle: u32 },
    Captured {
        /// `true` if the expected number of frames was reached before the timeout.
        complete: bool,
        frames: Vec<CapturedFrame>,
    },
    Injected { count: u32 },
    Error { code: ErrorCode, message: String },
}

mod tag {
    pub(super) const PING: u8 = 0x01;
    pub(super) const ARM: u8 = 0x02;
    pub(super) const COLLECT: u8 = 0x03;
    pub(super) const INJECT: u8 = 0x04;

    pub(super) const PONG: u8 = 0x81;
    pub(super) const ARMED: u8 = 0x82;
    pub(super) const CAPTURED: u8 = 0x83;
    pub(super) const INJECTED: u8 = 0x84;
    pub(super) const ERROR: u8 = 0xff;
}

// Option<T> is a presence byte followed by the value.
const NONE: u8 = 0;
const SOME: u8 = 1;

impl Request {
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();

        match self {
            Self::Ping => buf.put_u8(tag::PING),
            Self::Arm { iface, filter, expect } => {
                buf.put_u8(tag::ARM);
                put_str(&mut buf, iface)?;
                put_filter(&mut buf, filter);
                match expect {
                    Some(n) => {
                        buf.put_u8(SOME);
                        buf.put_u32(*n);
                    }
                    None => buf.put_u8(NONE),
                }
            }
            Self::Collect { handle, timeout } => {
                buf.put_u8(tag::COLLECT);
                buf.put_u32(*handle);
                buf.put_u64(timeout.as_millis() as u64);
            }
            Self::Inject { iface, frames } => {
                buf.put_u8(tag::INJECT);
                put_str(&mut buf, iface)?;
                buf.put_u32(frames.len() as u32);
                for frame in frames {
                    put_blob(&mut buf, frame);
                }
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(mut src: Bytes) -> Result<Self, DecodeError> {
        let request = match get_u8(&mut src)? {
            tag::PING => Self::Ping,
            tag::ARM => {
                let iface = get_str(&mut src)?;
                let filter = get_filter(&mut src)?;
                let expect = match get_u8(&mut src)? {
                    NONE => None,
                    _ => Some(get_u32(&mut src)?),
                };
                Self::Arm { iface, filter, expect }
            }
            tag::COLLECT => {
                let handle = get_u32(&mut src)?;
                let timeout = Duration::from_millis(get_u64(&mut src)?);
                Self::Collect { handle, timeout }
            }
            tag::INJECT => {
                let iface = get_str(&mut src)?;
                let count = get_u32(&mut src)?;
                let mut frames = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    frames.push(get_blob(&mut src)?);
                }
                Self::Inject { iface, frames }
            }
            other => return Err(DecodeError::UnknownTag(other)),
        };

        Ok(request)
    }
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error { code, message: message.into() }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();

        match self {
            Self::Pong => buf.put_u8(tag::PONG),
            Self::Armed { handle } => {
                buf.put_u8(tag::ARMED);
                buf.put_u32(*handle);
            }
            Self::Captured { complete, frames } => {
                buf.put_u8(tag::CAPTURED);
                buf.put_u8(u8::from(*complete));
                buf.put_u32(frames.len() as u32);
                for frame in frames {
                    buf.put_u64(frame.timestamp_micros);
                    put_blob(&mut buf, &frame.data);
                }
            }
            Self::Injected { count } => {
                buf.put_u8(tag::INJECTED);
                buf.put_u32(*count);
            }
            Self::Error { code, message } => {
                buf.put_u8(tag::ERROR);
                buf.put_u8(code.to_u8());
                put_str(&mut buf, message)?;
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(mut src: Bytes) -> Result<Self, DecodeError> {
        let response = match get_u8(&mut src)? {
            tag::PONG => Self::Pong,
            tag::ARMED => Self::Armed { handle: get_u32(&mut src)? },
            tag::CAPTURED => {
                let complete = get_u8(&mut src)? != 0;
                let count = get_u32(&mut src)?;
                let mut frames = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    let timestamp_micros = get_u64(&mut src)?;
                    let data = get_blob(&mut src)?;
                    frames.push(CapturedFrame { timestamp_micros, data });
                }
                Self::Captured { complete, frames }
            }
            tag::INJECTED => Self::Injected { count: get_u32(&mut src)? },
            tag::ERROR => {
                let code = ErrorCode::from_u8(get_u8(&mut src)?)?;
                let message = get_str(&mut src)?;
                Self::Error { code, message }
            }
            other => return Err(DecodeError::UnknownTag(other)),
        };

        Ok(response)
    }
}

/// Strings are length-prefixed with a u16 and never truncated.
fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| EncodeError::StrTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, blob: &[u8]) {
    buf.put_u32(blob.len() as u32);
    buf.put_slice(blob);
}

fn put_filter(buf: &mut BytesMut, filter: &CaptureFilter) {
    buf.put_u8(filter.protocol.map_or(0, TransportProtocol::number));
    for port in [filter.src_port, filter.dst_port] {
        match port {
            Some(port) => {
                buf.put_u8(SOME);
                buf.put_u16(port);
            }
            None => buf.put_u8(NONE),
        }
    }
}

fn get_u8(src: &mut Bytes) -> Result<u8, DecodeError> {
    if src.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16, DecodeError> {
    if src.remaining() < 2 {
        return Err(DecodeError::Truncated);
    }
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes) -> Result<u32, DecodeError> {
    if src.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> Result<u64, DecodeError> {
    if src.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    Ok(src.get_u64())
}

fn get_str(src: &mut Bytes) -> Result<String, DecodeError> {
    let len = get_u16(src)? as usize;
    if src.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8)
}

fn get_blob(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    Ok(src.split_to(len))
}

fn get_filter(src: &mut Bytes) -> Result<CaptureFilter, DecodeError> {
    let protocol = TransportProtocol::from_number(get_u8(src)?);
    let mut ports = [None; 2];
    for port in &mut ports {
        if get_u8(src)? != NONE {
            *port = Some(get_u16(src)?);
        }
    }

    Ok(CaptureFilter { protocol, src_port: ports[0], dst_port: ports[1] })
}
