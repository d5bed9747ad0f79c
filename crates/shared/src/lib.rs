//! storesync Protocol - Shared types for the engine and the remote commerce service
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde, serde_json, chrono and thiserror
//! 2. **No business logic** - Pure data types and serialization
//! 3. **Text frames** - Every message is a single JSON object

pub mod messages;

pub use messages::{ClientMessage, CommandIssued, ServerMessage, PROTOCOL_VERSION};

/// Frame could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}
