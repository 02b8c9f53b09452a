//! Protocol message types.
//!
//! Every message has a header (`msgid`, `msgtype`, optional `reqid`),
//! free-form metadata and a JSON content object. Replies carry the
//! originating message's id in `reqid`.
//!
//! ```text
//! {"header":{"msgid":"7","msgtype":"PATCH-DOC"},"metadata":{},"content":{"events":[...]}}
//! ```

use std::collections::HashMap;
use std::fmt;

use docsync_core::{DocumentJson, PatchEvent, UiEvent};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::version::ProtocolVersion;

/// Application path used when an open request does not name one.
pub const DEFAULT_APP_PATH: &str = "/";

// ============================================================================
// Message Taxonomy
// ============================================================================

/// All message types known to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ack,
    Ok,
    Error,
    PullDocReq,
    PullDocReply,
    PushDoc,
    PatchDoc,
    Event,
    ServerInfoReq,
    ServerInfoReply,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        Self::Ack,
        Self::Ok,
        Self::Error,
        Self::PullDocReq,
        Self::PullDocReply,
        Self::PushDoc,
        Self::PatchDoc,
        Self::Event,
        Self::ServerInfoReq,
        Self::ServerInfoReply,
    ];

    /// Wire name (case preserved).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::PullDocReq => "PULL-DOC-REQ",
            Self::PullDocReply => "PULL-DOC-REPLY",
            Self::PushDoc => "PUSH-DOC",
            Self::PatchDoc => "PATCH-DOC",
            Self::Event => "EVENT",
            Self::ServerInfoReq => "SERVER-INFO-REQ",
            Self::ServerInfoReply => "SERVER-INFO-REPLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Header
// ============================================================================

/// Message identifier, unique per sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msgid: MessageId,
    /// Kept as a string so unknown types still decode and can be rejected by dispatch
    pub msgtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
}

impl Message {
    /// Creates a message of a known kind.
    pub fn new(kind: MessageKind, msgid: MessageId, content: Value) -> Self {
        Self {
            header: Header {
                msgid,
                msgtype: kind.as_str().to_string(),
                reqid: None,
                revision: None,
            },
            metadata: Map::new(),
            content,
        }
    }

    /// Marks this message as the reply to `reqid`.
    #[must_use]
    pub fn in_reply_to(mut self, reqid: &MessageId) -> Self {
        self.header.reqid = Some(reqid.clone());
        self
    }

    pub fn msgid(&self) -> &MessageId {
        &self.header.msgid
    }

    pub fn msgtype(&self) -> &str {
        &self.header.msgtype
    }

    pub fn reqid(&self) -> Option<&MessageId> {
        self.header.reqid.as_ref()
    }

    /// Returns the kind, or `None` for message types this protocol doesn't know.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.header.msgtype)
    }

    /// Decodes the content into a typed structure.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.content.clone()).map_err(|e| ProtocolError::InvalidContent {
            msgtype: self.header.msgtype.clone(),
            reason: e.to_string(),
        })
    }

    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    pub fn ack(msgid: MessageId, session_id: &str) -> Self {
        Self::new(
            MessageKind::Ack,
            msgid,
            to_content(&AckContent {
                session_id: session_id.to_string(),
                protocol_version: ProtocolVersion::CURRENT,
            }),
        )
    }

    pub fn ok(msgid: MessageId, reqid: &MessageId) -> Self {
        Self::new(MessageKind::Ok, msgid, Value::Object(Map::new())).in_reply_to(reqid)
    }

    /// Creates an ERROR reply. `reqid` is None when the offending message had no usable id.
    pub fn error(
        msgid: MessageId,
        reqid: Option<&MessageId>,
        text: impl Into<String>,
        traceback: Option<String>,
    ) -> Self {
        let mut msg = Self::new(
            MessageKind::Error,
            msgid,
            to_content(&ErrorContent {
                text: text.into(),
                traceback,
            }),
        );
        msg.header.reqid = reqid.cloned();
        msg
    }

    pub fn pull_doc_req(msgid: MessageId) -> Self {
        Self::new(MessageKind::PullDocReq, msgid, Value::Object(Map::new()))
    }

    pub fn pull_doc_reply(msgid: MessageId, reqid: &MessageId, doc: DocumentJson) -> Self {
        Self::new(MessageKind::PullDocReply, msgid, to_content(&PullDocReply { doc }))
            .in_reply_to(reqid)
    }

    pub fn push_doc(msgid: MessageId, doc: DocumentJson) -> Self {
        Self::new(MessageKind::PushDoc, msgid, to_content(&PushDoc { doc }))
    }

    pub fn patch_doc(msgid: MessageId, events: Vec<PatchEvent>) -> Self {
        Self::new(MessageKind::PatchDoc, msgid, to_content(&PatchDoc { events }))
    }

    pub fn event(msgid: MessageId, event: UiEvent) -> Self {
        Self::new(MessageKind::Event, msgid, to_content(&event))
    }

    pub fn server_info_req(msgid: MessageId) -> Self {
        Self::new(MessageKind::ServerInfoReq, msgid, Value::Object(Map::new()))
    }

    pub fn server_info_reply(msgid: MessageId, reqid: &MessageId, server_version: &str) -> Self {
        Self::new(
            MessageKind::ServerInfoReply,
            msgid,
            to_content(&ServerInfoReply {
                version_info: VersionInfo {
                    server: server_version.to_string(),
                    protocol: ProtocolVersion::CURRENT.to_string(),
                },
            }),
        )
        .in_reply_to(reqid)
    }
}

/// Content types serialize to plain JSON objects; a failure here would be a bug
/// in the type definitions, so it degrades to null instead of panicking.
fn to_content<T: Serialize>(content: &T) -> Value {
    serde_json::to_value(content).unwrap_or(Value::Null)
}

// ============================================================================
// Typed Contents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckContent {
    pub session_id: String,
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullDocReply {
    pub doc: DocumentJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushDoc {
    pub doc: DocumentJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDoc {
    pub events: Vec<PatchEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfoReply {
    pub version_info: VersionInfo,
}

// ============================================================================
// Open Request
// ============================================================================

/// First line a client sends on a new transport, naming the session it wants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Application path (defaults to "/")
    #[serde(default = "default_app_path")]
    pub app: String,
    /// Session to join or create; generated by the server when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub arguments: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    /// Protocol the client speaks; assumed current when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<ProtocolVersion>,
}

fn default_app_path() -> String {
    DEFAULT_APP_PATH.to_string()
}

impl OpenRequest {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            app: default_app_path(),
            session_id,
            ..Self::default()
        }
    }

    /// Fails if this server cannot talk the client's protocol version.
    pub fn check_protocol_version(&self) -> Result<(), ProtocolError> {
        let client = self.protocol_version.unwrap_or(ProtocolVersion::CURRENT);
        if ProtocolVersion::CURRENT.accepts(&client) {
            Ok(())
        } else {
            Err(ProtocolError::IncompatibleVersion {
                client,
                server: ProtocolVersion::CURRENT,
            })
        }
    }
}
