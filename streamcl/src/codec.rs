use super::*;
use perigee_bpv6::Eid;
use thiserror::Error;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad contact header magic {0:#010X}")]
    BadMagic(u32),

    #[error("Invalid message type {0:#04X}")]
    InvalidMessageType(u8),

    #[error("Invalid shutdown reason {0}")]
    InvalidShutdownReason(u8),

    #[error("Invalid SDNV in message")]
    InvalidSdnv,

    #[error("Invalid endpoint ID: {0}")]
    InvalidEid(#[from] perigee_bpv6::eid::EidError),

    #[error("Endpoint ID is not UTF-8")]
    InvalidEidUtf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// ASCII `dtn!`.
pub const MAGIC: u32 = 0x6474_6E21;

/// Contact-header option flags.
pub mod contact_flags {
    pub const SEGMENT_ACK_ENABLED: u8 = 0x02;
    pub const REACTIVE_FRAG_ENABLED: u8 = 0x04;
    pub const NEGATIVE_ACK_ENABLED: u8 = 0x08;
}

/// Message type codes, carried in the high nibble of the first octet.
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    DATA_SEGMENT = 0x1,
    ACK_SEGMENT = 0x2,
    REFUSE_BUNDLE = 0x3,
    KEEPALIVE = 0x4,
    SHUTDOWN = 0x5,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Self::DATA_SEGMENT),
            0x2 => Ok(Self::ACK_SEGMENT),
            0x3 => Ok(Self::REFUSE_BUNDLE),
            0x4 => Ok(Self::KEEPALIVE),
            0x5 => Ok(Self::SHUTDOWN),
            n => Err(Error::InvalidMessageType(n)),
        }
    }
}

/// Data-segment flag bits (low nibble).
pub mod segment_flags {
    pub const BUNDLE_START: u8 = 0x02;
    pub const BUNDLE_END: u8 = 0x01;
}

/// Shutdown flag bits (low nibble).
mod shutdown_flags {
    pub const HAS_REASON: u8 = 0x02;
    pub const HAS_DELAY: u8 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownReason {
    #[default]
    NoReason,
    IdleTimeout,
    VersionMismatch,
    Busy,
}

impl From<ShutdownReason> for u8 {
    fn from(value: ShutdownReason) -> Self {
        match value {
            ShutdownReason::NoReason => 0,
            ShutdownReason::IdleTimeout => 1,
            ShutdownReason::VersionMismatch => 2,
            ShutdownReason::Busy => 3,
        }
    }
}

impl TryFrom<u8> for ShutdownReason {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoReason),
            1 => Ok(Self::IdleTimeout),
            2 => Ok(Self::VersionMismatch),
            3 => Ok(Self::Busy),
            n => Err(Error::InvalidShutdownReason(n)),
        }
    }
}

/*
+----------------------------+
|     Magic 'dtn!' (U32)     |
+----------------------------+
|        Version (U8)        |
+----------------------------+
|         Flags (U8)         |
+----------------------------+
|  Keepalive Interval (U16)  |
+----------------------------+
|     EID Length (SDNV)      |
+----------------------------+
|     EID Data (variable)    |
+----------------------------+ */

/// The header each side sends immediately on accept/connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHeader {
    pub version: u8,
    pub segment_ack_enabled: bool,
    pub reactive_frag_enabled: bool,
    pub negative_ack_enabled: bool,
    pub keepalive_interval: u16,
    pub eid: Eid,
}

impl ContactHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(MAGIC);
        dst.put_u8(self.version);
        let mut flags = 0;
        if self.segment_ack_enabled {
            flags |= contact_flags::SEGMENT_ACK_ENABLED;
        }
        if self.reactive_frag_enabled {
            flags |= contact_flags::REACTIVE_FRAG_ENABLED;
        }
        if self.negative_ack_enabled {
            flags |= contact_flags::NEGATIVE_ACK_ENABLED;
        }
        dst.put_u8(flags);
        dst.put_u16(self.keepalive_interval);
        let eid = self.eid.to_string();
        let mut len = Vec::new();
        perigee_sdnv::encode_into(eid.len() as u64, &mut len);
        dst.put(len.as_slice());
        dst.put(eid.as_bytes());
    }

    pub fn decode(src: &mut BytesMut) -> Result<Option<ContactHeader>, Error> {
        if src.len() < 8 {
            return Ok(None);
        }
        let mut peek = src.clone();
        let magic = peek.get_u32();
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let version = peek.get_u8();
        let flags = peek.get_u8();
        let keepalive_interval = peek.get_u16();

        let Some((eid_len, sdnv_len)) =
            perigee_sdnv::decode(&peek).map_err(|_| Error::InvalidSdnv)?
        else {
            return Ok(None);
        };
        peek.advance(sdnv_len);
        let eid_len = eid_len as usize;
        if peek.len() < eid_len {
            return Ok(None);
        }
        let eid: Eid = String::from_utf8(peek.split_to(eid_len).to_vec())?.parse()?;

        src.advance(8 + sdnv_len + eid_len);
        Ok(Some(ContactHeader {
            version,
            segment_ack_enabled: flags & contact_flags::SEGMENT_ACK_ENABLED != 0,
            reactive_frag_enabled: flags & contact_flags::REACTIVE_FRAG_ENABLED != 0,
            negative_ack_enabled: flags & contact_flags::NEGATIVE_ACK_ENABLED != 0,
            keepalive_interval,
            eid,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    DataSegment {
        start: bool,
        end: bool,
        data: Bytes,
    },
    AckSegment {
        /// Cumulative acknowledged byte count for the current bundle.
        acked: u64,
    },
    RefuseBundle,
    Keepalive,
    Shutdown {
        reason: Option<ShutdownReason>,
        /// Seconds the peer asks us to wait before reconnecting.
        delay: Option<u16>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::DataSegment { .. } => MessageType::DATA_SEGMENT,
            Message::AckSegment { .. } => MessageType::ACK_SEGMENT,
            Message::RefuseBundle => MessageType::REFUSE_BUNDLE,
            Message::Keepalive => MessageType::KEEPALIVE,
            Message::Shutdown { .. } => MessageType::SHUTDOWN,
        }
    }
}

/// Frames either side of the contact-header exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ContactHeader(ContactHeader),
    Message(Message),
}

/// The wire codec. Until the peer's contact header has been decoded the
/// decoder expects it; afterwards it produces messages.
#[derive(Default)]
pub struct Codec {
    header_received: bool,
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if !self.header_received {
            return match ContactHeader::decode(src)? {
                Some(header) => {
                    self.header_received = true;
                    Ok(Some(Frame::ContactHeader(header)))
                }
                None => Ok(None),
            };
        }

        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let flags = first & 0x0F;
        match MessageType::try_from(first >> 4)? {
            MessageType::KEEPALIVE => {
                src.advance(1);
                Ok(Some(Frame::Message(Message::Keepalive)))
            }
            MessageType::REFUSE_BUNDLE => {
                src.advance(1);
                Ok(Some(Frame::Message(Message::RefuseBundle)))
            }
            MessageType::ACK_SEGMENT => {
                let Some((acked, n)) =
                    perigee_sdnv::decode(&src[1..]).map_err(|_| Error::InvalidSdnv)?
                else {
                    return Ok(None);
                };
                src.advance(1 + n);
                Ok(Some(Frame::Message(Message::AckSegment { acked })))
            }
            MessageType::DATA_SEGMENT => {
                let Some((len, n)) =
                    perigee_sdnv::decode(&src[1..]).map_err(|_| Error::InvalidSdnv)?
                else {
                    return Ok(None);
                };
                let len = len as usize;
                if src.len() < 1 + n + len {
                    src.reserve(1 + n + len - src.len());
                    return Ok(None);
                }
                src.advance(1 + n);
                Ok(Some(Frame::Message(Message::DataSegment {
                    start: flags & segment_flags::BUNDLE_START != 0,
                    end: flags & segment_flags::BUNDLE_END != 0,
                    data: src.split_to(len).freeze(),
                })))
            }
            MessageType::SHUTDOWN => {
                let mut need = 1;
                if flags & shutdown_flags::HAS_REASON != 0 {
                    need += 1;
                }
                if flags & shutdown_flags::HAS_DELAY != 0 {
                    need += 2;
                }
                if src.len() < need {
                    return Ok(None);
                }
                src.advance(1);
                let reason = if flags & shutdown_flags::HAS_REASON != 0 {
                    Some(ShutdownReason::try_from(src.get_u8())?)
                } else {
                    None
                };
                let delay = if flags & shutdown_flags::HAS_DELAY != 0 {
                    Some(src.get_u16())
                } else {
                    None
                };
                Ok(Some(Frame::Message(Message::Shutdown { reason, delay })))
            }
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        match frame {
            Frame::ContactHeader(header) => header.encode(dst),
            Frame::Message(Message::Keepalive) => {
                dst.put_u8((MessageType::KEEPALIVE as u8) << 4);
            }
            Frame::Message(Message::RefuseBundle) => {
                dst.put_u8((MessageType::REFUSE_BUNDLE as u8) << 4);
            }
            Frame::Message(Message::AckSegment { acked }) => {
                dst.put_u8((MessageType::ACK_SEGMENT as u8) << 4);
                let mut sdnv = Vec::new();
                perigee_sdnv::encode_into(acked, &mut sdnv);
                dst.put(sdnv.as_slice());
            }
            Frame::Message(Message::DataSegment { start, end, data }) => {
                let mut flags = 0;
                if start {
                    flags |= segment_flags::BUNDLE_START;
                }
                if end {
                    flags |= segment_flags::BUNDLE_END;
                }
                dst.put_u8(((MessageType::DATA_SEGMENT as u8) << 4) | flags);
                let mut sdnv = Vec::new();
                perigee_sdnv::encode_into(data.len() as u64, &mut sdnv);
                dst.put(sdnv.as_slice());
                dst.put(data);
            }
            Frame::Message(Message::Shutdown { reason, delay }) => {
                let mut flags = 0;
                if reason.is_some() {
                    flags |= shutdown_flags::HAS_REASON;
                }
                if delay.is_some() {
                    flags |= shutdown_flags::HAS_DELAY;
                }
                dst.put_u8(((MessageType::SHUTDOWN as u8) << 4) | flags);
                if let Some(reason) = reason {
                    dst.put_u8(reason.into());
                }
                if let Some(delay) = delay {
                    dst.put_u16(delay);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn header() -> ContactHeader {
        ContactHeader {
            version: 3,
            segment_ack_enabled: true,
            reactive_frag_enabled: false,
            negative_ack_enabled: false,
            keepalive_interval: 10,
            eid: "dtn://node-a/".parse().unwrap(),
        }
    }

    #[test]
    fn contact_header_round_trip() {
        let mut buf = BytesMut::new();
        header().encode(&mut buf);
        assert_eq!(&buf[..4], &hex!("64746E21"));

        // Byte-at-a-time arrival decodes exactly once
        let wire = buf.clone();
        let mut partial = BytesMut::new();
        let mut decoded = None;
        for (i, b) in wire.iter().enumerate() {
            partial.put_u8(*b);
            match ContactHeader::decode(&mut partial).unwrap() {
                Some(h) => {
                    assert_eq!(i, wire.len() - 1);
                    decoded = Some(h);
                }
                None => assert!(i < wire.len() - 1),
            }
        }
        assert_eq!(decoded.unwrap(), header());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = BytesMut::from(&hex!("64746E220300000A00")[..]);
        assert!(matches!(
            ContactHeader::decode(&mut buf),
            Err(Error::BadMagic(0x64746E22))
        ));
    }

    #[test]
    fn message_round_trips() {
        let messages = vec![
            Message::Keepalive,
            Message::RefuseBundle,
            Message::AckSegment { acked: 12345 },
            Message::DataSegment {
                start: true,
                end: false,
                data: Bytes::from_static(b"ABCD"),
            },
            Message::DataSegment {
                start: false,
                end: true,
                data: Bytes::from_static(b"EFG"),
            },
            Message::Shutdown {
                reason: Some(ShutdownReason::IdleTimeout),
                delay: Some(30),
            },
            Message::Shutdown {
                reason: None,
                delay: None,
            },
        ];

        let mut codec = Codec {
            header_received: true,
        };
        let mut buf = BytesMut::new();
        for msg in &messages {
            codec.encode(Frame::Message(msg.clone()), &mut buf).unwrap();
        }
        for msg in &messages {
            let got = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(got, Frame::Message(msg.clone()));
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn segment_wire_format() {
        let mut codec = Codec {
            header_received: true,
        };
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Message(Message::DataSegment {
                    start: true,
                    end: true,
                    data: Bytes::from_static(b"AB"),
                }),
                &mut buf,
            )
            .unwrap();
        // type|flags, SDNV length, payload
        assert_eq!(&buf[..], &hex!("13024142"));
    }

    #[test]
    fn partial_segment_defers() {
        let mut codec = Codec {
            header_received: true,
        };
        let mut buf = BytesMut::from(&hex!("1304414243")[..]); // 4-byte segment, 3 present
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_u8(0x44);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(Message::DataSegment {
                start: true,
                end: true,
                data: Bytes::from_static(b"ABCD"),
            }))
        );
    }

    #[test]
    fn unknown_message_type_is_fatal() {
        let mut codec = Codec {
            header_received: true,
        };
        let mut buf = BytesMut::from(&hex!("F0")[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidMessageType(0x0F))
        ));
    }
}
