//! OCPP 1.6-J: the wire codec, message catalogue, request correlator, the
//! WebSocket peer transport, and the inbound handler registry.

pub mod codec;
pub mod correlator;
pub mod handlers;
pub mod messages;
pub mod peer;

pub use codec::{ErrorCode, OcppFrame};
