//! Core data types: decoded frames, layer views, flow identity, DNS helpers.

pub mod dns;
pub mod flow;
pub mod frame;
pub mod parser;

pub use flow::NetFlow;
pub use frame::{Frame, ReassembledPayload, PROTO_PACKET, PROTO_TCP, PROTO_UDP};
