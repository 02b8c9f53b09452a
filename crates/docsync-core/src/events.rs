//! Document change events and serialized document forms.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::document::SessionCallback;
use crate::{CallbackId, CallbackKind, ConnectionId, ModelId};

// ============================================================================
// Serialized Document
// ============================================================================

/// Serialized form of a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelJson {
    pub id: ModelId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ModelJson {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: ModelId::new(id),
            type_name: type_name.into(),
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// Full-document snapshot, as carried by PULL-DOC-REPLY and PUSH-DOC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentJson {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub roots: Vec<ModelId>,
    #[serde(default)]
    pub models: Vec<ModelJson>,
}

// ============================================================================
// Patch Events
// ============================================================================

/// One incremental document mutation.
///
/// Patches travel in both directions: clients send them in PATCH-DOC, and
/// the server broadcasts the ones produced by document changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PatchEvent {
    ModelChanged {
        model: ModelId,
        attr: String,
        new: Value,
    },
    ModelAdded {
        model: ModelJson,
    },
    ModelRemoved {
        model: ModelId,
    },
    RootAdded {
        model: ModelJson,
    },
    RootRemoved {
        model: ModelId,
    },
    TitleChanged {
        title: String,
    },
}

/// A patch produced by a document change, with the connection that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatchedEvent {
    pub patch: PatchEvent,
    /// Connection whose request produced the change (None for server-side changes)
    pub setter: Option<ConnectionId>,
}

// ============================================================================
// UI Events
// ============================================================================

/// A UI event notification sent by a client (EVENT message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiEvent {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelId>,
    #[serde(default)]
    pub values: Value,
}

impl UiEvent {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            model: None,
            values: Value::Null,
        }
    }
}

// ============================================================================
// Session Callback Scheduling
// ============================================================================

/// When a session callback should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSchedule {
    NextTick,
    Timeout(Duration),
    Periodic(Duration),
}

impl CallbackSchedule {
    pub fn kind(self) -> CallbackKind {
        match self {
            Self::NextTick => CallbackKind::NextTick,
            Self::Timeout(_) => CallbackKind::Timeout,
            Self::Periodic(_) => CallbackKind::Periodic,
        }
    }
}

// ============================================================================
// Document Events
// ============================================================================

/// Everything a document reports to its change listener.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    /// Model state changed
    Patched(DocumentPatchedEvent),
    /// A session callback was registered on the document
    SessionCallbackAdded(SessionCallback),
    /// A session callback was removed from the document
    SessionCallbackRemoved { id: CallbackId, kind: CallbackKind },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_event_serialization() {
        let event = PatchEvent::ModelChanged {
            model: ModelId::new("m1"),
            attr: "value".to_string(),
            new: json!(3),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"ModelChanged\""));
        assert!(json.contains("\"attr\":\"value\""));
    }

    #[test]
    fn test_model_removed_carries_only_the_id() {
        let event = PatchEvent::ModelRemoved {
            model: ModelId::new("range"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({"kind": "ModelRemoved", "model": "range"}));
    }

    #[test]
    fn test_model_json_type_field() {
        let model = ModelJson::new("p1", "Plot").with_attribute("width", json!(400));
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["type"], "Plot");
        assert_eq!(json["attributes"]["width"], 400);
    }

    #[test]
    fn test_document_json_defaults() {
        let doc: DocumentJson = serde_json::from_str("{}").unwrap();
        assert!(doc.title.is_empty());
        assert!(doc.roots.is_empty());
        assert!(doc.models.is_empty());
    }

    #[test]
    fn test_schedule_kind() {
        assert_eq!(CallbackSchedule::NextTick.kind(), CallbackKind::NextTick);
        assert_eq!(
            CallbackSchedule::Periodic(Duration::from_millis(10)).kind(),
            CallbackKind::Periodic
        );
    }
}
