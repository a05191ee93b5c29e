//! Per-packet-type handling, invoked by the connection dispatcher.

pub mod connect;
pub mod disconnect;
pub mod publish;
pub mod qos;
pub mod subscribe;
