pub mod handshake_messages;
pub mod health_check_messages;
pub mod message_factory;
pub mod wire_message;

pub use wire_message::{read_frame, ProtocolType, WireProtocolHeader, WireProtocolMessage};
