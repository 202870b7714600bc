//! Codec and protocol error types

use std::fmt;

/// Reasons a byte sequence is not a valid MQTT 3.1.1 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends inside a packet; read more and retry
    InsufficientData,
    InvalidPacketType(u8),
    /// Remaining length longer than four bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    /// Known protocol name with a level other than 3 or 4
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved fixed-header bits set wrongly
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Larger than the configured maximum packet size
    PacketTooLarge,
    InvalidReturnCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("incomplete packet"),
            Self::InvalidPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::InvalidRemainingLength => f.write_str("remaining length exceeds four bytes"),
            Self::InvalidProtocolName => f.write_str("unknown protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::InvalidFlags => f.write_str("reserved header flags violated"),
            Self::MalformedPacket(what) => write!(f, "malformed packet ({})", what),
            Self::PacketTooLarge => f.write_str("packet exceeds maximum size"),
            Self::InvalidReturnCode(r) => write!(f, "unknown return code 0x{:02x}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reasons a [`super::Packet`] cannot be serialised
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length above 268,435,455 bytes
    PacketTooLarge,
    /// String or binary field longer than 65,535 bytes
    StringTooLong,
    InvalidTopicName,
    MissingPacketId,
    EmptyTopicList,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet exceeds the remaining length limit"),
            Self::StringTooLong => f.write_str("field longer than 65535 bytes"),
            Self::InvalidTopicName => f.write_str("topic name not allowed in PUBLISH"),
            Self::MissingPacketId => f.write_str("QoS 1/2 PUBLISH needs a packet id"),
            Self::EmptyTopicList => f.write_str("SUBSCRIBE/UNSUBSCRIBE needs at least one topic"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Codec failure or a packet that is well formed but not allowed here
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "cannot decode: {}", e),
            Self::Encode(e) => write!(f, "cannot encode: {}", e),
            Self::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}
