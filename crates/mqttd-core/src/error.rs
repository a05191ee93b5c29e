//! Error types for the mqttd protocol layer.

use thiserror::Error;

/// MQTT protocol errors.
///
/// Variants are fine-grained enough for the connection layer to map a parse
/// failure during the CONNECT gate to the proper CONNACK return code.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid fixed header flags for {packet}: {flags:#04x}")]
    InvalidFixedHeaderFlags { packet: &'static str, flags: u8 },

    #[error("Invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol level: {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid will QoS: {0}")]
    InvalidWillQos(u8),

    #[error("Password flag set without username flag")]
    PasswordWithoutUsername,

    #[error("Malformed username field")]
    MalformedUsername,

    #[error("Malformed password field")]
    MalformedPassword,

    #[error("Client ID is empty and clean session is not set")]
    EmptyClientIdWithoutCleanSession,

    #[error("Client ID exceeds 23 bytes: {0}")]
    ClientIdTooLong(usize),

    #[error("Client ID contains invalid characters")]
    ClientIdInvalidChars,

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("DUP flag set on a QoS 0 publish")]
    DupWithoutQos,

    #[error("Packet identifier must be non-zero")]
    ZeroPacketId,

    #[error("Invalid CONNACK return code: {0}")]
    InvalidConnackCode(u8),

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,
}

/// Topic name / topic filter validation errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic is empty")]
    Empty,

    #[error("Topic contains an empty level")]
    EmptyLevel,

    #[error("Topic contains a control character")]
    ControlCharacter,

    #[error("Topic name contains a wildcard")]
    WildcardInName,

    #[error("'#' must be the whole last level of a filter")]
    MultiLevelWildcardPosition,

    #[error("'+' must occupy a whole level of a filter")]
    SingleLevelWildcardPosition,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
