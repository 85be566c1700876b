use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// The ID of the control codec on the wire.
const WIRE_ID: u8 = 0x58;

/// Largest payload accepted by the decoder. A capture of a few hundred frames fits comfortably.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid wire ID: {0}")]
    WireId(u8),
    #[error("Payload too large: {0} bytes")]
    TooLarge(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    /// The message payload.
    payload: Bytes,
}

impl Message {
    pub fn new(id: u32, payload: Bytes) -> Self {
        Self { header: Header { id, size: payload.len() as u32 }, payload }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.header.id
    }

    #[inline]
    pub fn payload_size(&self) -> u32 {
        self.header.size
    }

    /// Total size of the message on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        1 + Header::len() + self.payload_size() as usize
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The message ID. Responses carry the ID of the request.
    pub(crate) id: u32,
    /// The size of the payload.
    pub(crate) size: u32,
}

impl Header {
    /// Returns the length of the header in bytes, wire ID excluded.
    #[inline]
    pub const fn len() -> usize {
        8
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload(Header),
}

#[derive(Debug, Default)]
pub struct Codec {
    /// The current state of the decoder.
    state: State,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    if src.is_empty() {
                        return Ok(None);
                    }

                    // Wire ID check (without advancing the cursor)
                    let wire_id = src[0];
                    if wire_id != WIRE_ID {
                        return Err(Error::WireId(wire_id));
                    }

                    if src.len() < 1 + Header::len() {
                        return Ok(None);
                    }

                    src.advance(1);
                    let header = Header { id: src.get_u32(), size: src.get_u32() };
                    if header.size > MAX_PAYLOAD_SIZE {
                        return Err(Error::TooLarge(header.size));
                    }

                    src.reserve(header.size as usize);
                    self.state = State::Payload(header);
                }
                State::Payload(header) => {
                    if src.len() < header.size as usize {
                        return Ok(None);
                    }

                    let payload = src.split_to(header.size as usize);
                    let message = Message { header, payload: payload.freeze() };

                    self.state = State::Header;
                    return Ok(Some(message));
                }
            }
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.size());

        dst.put_u8(WIRE_ID);
        dst.put_u32(item.header.id);
        dst.put_u32(item.header.size);
        dst.put(item.payload);

        Ok(())
    }
}
