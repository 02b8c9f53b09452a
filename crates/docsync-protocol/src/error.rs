//! Protocol-level errors.
//!
//! Everything here is reported to the remote peer as an `ERROR` reply and is
//! never fatal to the server.

use thiserror::Error;

use crate::version::ProtocolVersion;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Session ID must not be empty")]
    EmptySessionId,

    #[error("No such session {0}")]
    NoSuchSession(String),

    #[error("{msgtype} not expected on server")]
    UnexpectedMessage { msgtype: String },

    #[error("Message is missing a msgid")]
    MissingMessageId,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid {msgtype} content: {reason}")]
    InvalidContent { msgtype: String, reason: String },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Unknown application path: {0}")]
    UnknownApplication(String),

    #[error("Protocol version {client} is not supported (server speaks {server})")]
    IncompatibleVersion {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },
}
