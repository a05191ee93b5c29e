//! mqttd-core - Core MQTT 3.1.1 types and packet codec.
//!
//! This crate holds the protocol layer with no I/O: control packet
//! encoding/decoding, topic name and filter rules, and the protocol error
//! taxonomy. The broker crate builds on top of it.

pub mod error;
pub mod packet;
pub mod topic;

pub use error::{ProtocolError, Result, TopicError};
pub use packet::*;
