use std::net::SocketAddr;
use thiserror::Error;
use crate::frames::FrameType;

/// A frame that can not be parsed. Receiving one counts as a protocol violation for the
///  connection, but does not affect other frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("{frame:?} frame requires {needed} bytes, got {actual}")]
    TooShort { frame: FrameType, needed: usize, actual: usize },
    #[error("datagram too short for a frame type")]
    MissingFrameType,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u16),
    #[error("expected a {expected:?} frame, got {actual:?}")]
    UnexpectedFrameType { expected: FrameType, actual: FrameType },
    #[error("invalid transmission mode {0}")]
    InvalidTransmissionMode(u16),
    #[error("invalid stream control {0:#x}")]
    InvalidStreamControl(u16),
    #[error("invalid ack range {start}..{end}")]
    InvalidAckRange { start: u32, end: u32 },
    #[error("malformed varint")]
    MalformedVarint,
    #[error("gene serial {serial} is outside the transmission's range of {limit}")]
    InvalidDataPosition { serial: u32, limit: u32 },
    #[error("first gene contradicts the transmission's metadata")]
    InconsistentMetadata,
}

/// The outcome of a transmission as observed by the application
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmissionError {
    #[error("transmission timed out")]
    TimedOut,
    #[error("transmission was canceled")]
    Canceled,
    #[error("connection was closed")]
    ConnectionClosed,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("payload could not be deserialized: {0}")]
    DeserializationFailed(String),
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("stream write exceeds the stream's maximum length of {max_length} bytes")]
    StreamLengthExceeded { max_length: u32 },
    #[error("stream was already completed")]
    AlreadyCompleted,
    #[error("no free transmission id for this connection")]
    WindowExhausted,
}

/// Failure of a relay operation (creation or forwarding). A refused forward is reported to the
///  caller and logged, the datagram is not silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay certificate could not be verified")]
    NotAuthenticated,
    #[error("relay capacity exceeded")]
    CapacityExceeded,
    #[error("circuit can not have more than {0} serial relays")]
    SerialLimitExceeded(usize),
    #[error("unknown relay id {0}")]
    UnknownRelay(u16),
    #[error("relay {0} expired")]
    Expired(u16),
    #[error("relay {0} has no points left")]
    PointsExhausted(u16),
    #[error("relay {relay_id} is not mapped for sender {from:?}")]
    EndpointMismatch { relay_id: u16, from: SocketAddr },
    #[error("node could not be resolved: {0}")]
    ResolutionFailed(String),
}
