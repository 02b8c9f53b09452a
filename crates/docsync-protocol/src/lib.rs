//! docsync Protocol - Wire protocol for session synchronization
//!
//! This crate provides the message types exchanged between clients and the
//! daemon, the typed message contents, protocol versioning and the
//! newline-delimited JSON codec.

pub mod codec;
pub mod error;
pub mod message;
pub mod version;

pub use codec::{decode_message, decode_open_request, encode_message, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use message::{
    AckContent, ErrorContent, Header, Message, MessageId, MessageKind, OpenRequest, PatchDoc,
    PullDocReply, PushDoc, ServerInfoReply, VersionInfo, DEFAULT_APP_PATH,
};
pub use version::{ProtocolVersion, VersionError};
