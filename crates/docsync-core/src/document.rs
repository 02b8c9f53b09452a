//! The synchronized document.
//!
//! A [`Document`] is a mutable graph of model objects plus a set of roots.
//! The model system itself is intentionally small: each model is a type name
//! and a JSON attribute map. What matters to the session layer is that
//! every mutation is reported, as a [`DocumentEvent`], to the listener
//! registered with [`Document::on_change_dispatch_to`].
//!
//! Documents also carry the session callbacks registered by application code
//! (next-tick, timeout, periodic). The document only keeps the bookkeeping;
//! the owning session does the scheduling when it sees
//! [`DocumentEvent::SessionCallbackAdded`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{
    CallbackSchedule, DocumentEvent, DocumentJson, DocumentPatchedEvent, ModelJson, PatchEvent,
    UiEvent,
};
use crate::{CallbackId, CallbackKind, ConnectionId, DomainError, DomainResult, ModelId, SessionId};

/// Callback run against the document (always with the session lock held).
pub type DocumentCallback = Arc<dyn Fn(&mut Document) -> DomainResult<()> + Send + Sync>;

/// Handler for a named UI event.
pub type EventHandler = Arc<dyn Fn(&mut Document, &UiEvent) -> DomainResult<()> + Send + Sync>;

/// Callback run once after the owning session is destroyed.
pub type SessionDestroyedCallback = Box<dyn FnOnce(&SessionId) + Send>;

/// A callback registered on the document, waiting to be scheduled by the session.
#[derive(Clone)]
pub struct SessionCallback {
    pub id: CallbackId,
    pub schedule: CallbackSchedule,
    pub callback: DocumentCallback,
}

impl SessionCallback {
    pub fn kind(&self) -> CallbackKind {
        self.schedule.kind()
    }
}

impl fmt::Debug for SessionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallback")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Model {
    type_name: String,
    attributes: Map<String, Value>,
}

impl Model {
    fn to_json(&self, id: &ModelId) -> ModelJson {
        ModelJson {
            id: id.clone(),
            type_name: self.type_name.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// A mutable scene graph owned by exactly one session.
pub struct Document {
    title: String,
    models: BTreeMap<ModelId, Model>,
    roots: Vec<ModelId>,
    session_callbacks: Vec<SessionCallback>,
    event_handlers: HashMap<String, Vec<EventHandler>>,
    destroyed_callbacks: Vec<SessionDestroyedCallback>,
    modules: HashMap<String, Box<dyn Any + Send>>,
    listener: Option<mpsc::UnboundedSender<DocumentEvent>>,
    destroyed: bool,
}

impl Document {
    pub fn new() -> Self {
        Self {
            title: String::new(),
            models: BTreeMap::new(),
            roots: Vec::new(),
            session_callbacks: Vec::new(),
            event_handlers: HashMap::new(),
            destroyed_callbacks: Vec::new(),
            modules: HashMap::new(),
            listener: None,
            destroyed: false,
        }
    }

    // ========================================================================
    // Change Dispatch
    // ========================================================================

    /// Routes every subsequent change event to `listener`.
    ///
    /// Events emitted while no listener is attached are dropped.
    pub fn on_change_dispatch_to(&mut self, listener: mpsc::UnboundedSender<DocumentEvent>) {
        self.listener = Some(listener);
    }

    /// Detaches the change listener.
    pub fn remove_on_change(&mut self) {
        self.listener = None;
    }

    fn emit(&self, event: DocumentEvent) {
        if let Some(listener) = &self.listener {
            if listener.send(event).is_err() {
                debug!("Document change listener is gone, dropping event");
            }
        }
    }

    fn emit_patch(&self, patch: PatchEvent, setter: Option<ConnectionId>) {
        self.emit(DocumentEvent::Patched(DocumentPatchedEvent { patch, setter }));
    }

    // ========================================================================
    // Content
    // ========================================================================

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.set_title_from(title.into(), None);
    }

    fn set_title_from(&mut self, title: String, setter: Option<ConnectionId>) {
        if self.title == title {
            return;
        }
        self.title = title.clone();
        self.emit_patch(PatchEvent::TitleChanged { title }, setter);
    }

    pub fn roots(&self) -> &[ModelId] {
        &self.roots
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn contains_model(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    pub fn get_model(&self, id: &ModelId) -> Option<ModelJson> {
        self.models.get(id).map(|m| m.to_json(id))
    }

    pub fn attribute(&self, id: &ModelId, attr: &str) -> Option<&Value> {
        self.models.get(id).and_then(|m| m.attributes.get(attr))
    }

    /// Adds a top-level model.
    pub fn add_root(&mut self, model: ModelJson) -> DomainResult<()> {
        self.add_root_from(model, None)
    }

    fn add_root_from(
        &mut self,
        model: ModelJson,
        setter: Option<ConnectionId>,
    ) -> DomainResult<()> {
        if self.models.contains_key(&model.id) {
            return Err(DomainError::ModelAlreadyExists { model: model.id });
        }
        self.insert_model(&model);
        self.roots.push(model.id.clone());
        self.emit_patch(PatchEvent::RootAdded { model }, setter);
        Ok(())
    }

    /// Adds a model referenced by roots but not displayed on its own.
    pub fn add_model(&mut self, model: ModelJson) -> DomainResult<()> {
        self.add_model_from(model, None)
    }

    fn add_model_from(
        &mut self,
        model: ModelJson,
        setter: Option<ConnectionId>,
    ) -> DomainResult<()> {
        if self.models.contains_key(&model.id) {
            return Err(DomainError::ModelAlreadyExists { model: model.id });
        }
        self.insert_model(&model);
        self.emit_patch(PatchEvent::ModelAdded { model }, setter);
        Ok(())
    }

    fn insert_model(&mut self, model: &ModelJson) {
        self.models.insert(
            model.id.clone(),
            Model {
                type_name: model.type_name.clone(),
                attributes: model.attributes.clone(),
            },
        );
    }

    pub fn remove_root(&mut self, id: &ModelId) -> DomainResult<()> {
        self.remove_root_from(id, None)
    }

    fn remove_root_from(&mut self, id: &ModelId, setter: Option<ConnectionId>) -> DomainResult<()> {
        let position = self
            .roots
            .iter()
            .position(|root| root == id)
            .ok_or_else(|| DomainError::NotARoot { model: id.clone() })?;
        self.roots.remove(position);
        self.models.remove(id);
        self.emit_patch(PatchEvent::RootRemoved { model: id.clone() }, setter);
        Ok(())
    }

    /// Removes a model that is not a root.
    pub fn remove_model(&mut self, id: &ModelId) -> DomainResult<()> {
        self.remove_model_from(id, None)
    }

    fn remove_model_from(
        &mut self,
        id: &ModelId,
        setter: Option<ConnectionId>,
    ) -> DomainResult<()> {
        if self.roots.contains(id) {
            return Err(DomainError::IsARoot { model: id.clone() });
        }
        if self.models.remove(id).is_none() {
            return Err(DomainError::UnknownModel { model: id.clone() });
        }
        self.emit_patch(PatchEvent::ModelRemoved { model: id.clone() }, setter);
        Ok(())
    }

    /// Sets one attribute of a model.
    ///
    /// Returns `Ok(false)` without emitting a change when the value is unchanged.
    pub fn set_attribute(
        &mut self,
        id: &ModelId,
        attr: impl Into<String>,
        value: Value,
    ) -> DomainResult<bool> {
        self.set_attribute_from(id, attr.into(), value, None)
    }

    fn set_attribute_from(
        &mut self,
        id: &ModelId,
        attr: String,
        value: Value,
        setter: Option<ConnectionId>,
    ) -> DomainResult<bool> {
        let model = self
            .models
            .get_mut(id)
            .ok_or_else(|| DomainError::UnknownModel { model: id.clone() })?;
        if model.attributes.get(&attr) == Some(&value) {
            return Ok(false);
        }
        model.attributes.insert(attr.clone(), value.clone());
        self.emit_patch(
            PatchEvent::ModelChanged {
                model: id.clone(),
                attr,
                new: value,
            },
            setter,
        );
        Ok(true)
    }

    /// Removes every root and model.
    ///
    /// Emits one removal per model, roots first, so a listener replaying the
    /// patches ends up with an empty document as well.
    pub fn clear(&mut self) {
        self.clear_from(None);
    }

    fn clear_from(&mut self, setter: Option<ConnectionId>) {
        let roots = std::mem::take(&mut self.roots);
        for root in roots {
            self.models.remove(&root);
            self.emit_patch(PatchEvent::RootRemoved { model: root }, setter);
        }
        let models = std::mem::take(&mut self.models);
        for id in models.into_keys() {
            self.emit_patch(PatchEvent::ModelRemoved { model: id }, setter);
        }
    }

    // ========================================================================
    // Snapshots and Patches
    // ========================================================================

    /// Serializes the complete document.
    pub fn to_json(&self) -> DocumentJson {
        DocumentJson {
            title: self.title.clone(),
            roots: self.roots.clone(),
            models: self
                .models
                .iter()
                .map(|(id, model)| model.to_json(id))
                .collect(),
        }
    }

    /// Replaces all content with a snapshot.
    ///
    /// The snapshot is validated before anything is touched: every root must
    /// be one of the snapshot's models.
    pub fn replace_with_json(
        &mut self,
        json: DocumentJson,
        setter: Option<ConnectionId>,
    ) -> DomainResult<()> {
        let mut incoming: BTreeMap<ModelId, ModelJson> = BTreeMap::new();
        for model in json.models {
            if incoming.contains_key(&model.id) {
                return Err(DomainError::ModelAlreadyExists { model: model.id });
            }
            incoming.insert(model.id.clone(), model);
        }
        if let Some(missing) = json.roots.iter().find(|root| !incoming.contains_key(*root)) {
            return Err(DomainError::UnknownModel {
                model: missing.clone(),
            });
        }

        self.clear_from(setter);

        for root in &json.roots {
            if let Some(model) = incoming.remove(root) {
                self.add_root_from(model, setter)?;
            }
        }
        for (_, model) in incoming {
            self.add_model_from(model, setter)?;
        }
        self.set_title_from(json.title, setter);
        Ok(())
    }

    /// Applies a sequence of patch events in order.
    ///
    /// Stops at the first event that cannot be applied.
    pub fn apply_patch(
        &mut self,
        events: &[PatchEvent],
        setter: Option<ConnectionId>,
    ) -> DomainResult<()> {
        for event in events {
            match event.clone() {
                PatchEvent::ModelChanged { model, attr, new } => {
                    self.set_attribute_from(&model, attr, new, setter)?;
                }
                PatchEvent::ModelAdded { model } => self.add_model_from(model, setter)?,
                PatchEvent::ModelRemoved { model } => self.remove_model_from(&model, setter)?,
                PatchEvent::RootAdded { model } => self.add_root_from(model, setter)?,
                PatchEvent::RootRemoved { model } => self.remove_root_from(&model, setter)?,
                PatchEvent::TitleChanged { title } => self.set_title_from(title, setter),
            }
        }
        Ok(())
    }

    // ========================================================================
    // UI Events
    // ========================================================================

    /// Registers a handler for a named UI event.
    pub fn on_event<F>(&mut self, event_name: impl Into<String>, handler: F)
    where
        F: Fn(&mut Document, &UiEvent) -> DomainResult<()> + Send + Sync + 'static,
    {
        self.event_handlers
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Dispatches a UI event to its registered handlers.
    pub fn apply_event(&mut self, event: &UiEvent) -> DomainResult<()> {
        if let Some(model) = &event.model {
            if !self.models.contains_key(model) {
                return Err(DomainError::UnknownModel {
                    model: model.clone(),
                });
            }
        }

        let handlers = self
            .event_handlers
            .get(&event.event_name)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(event_name = %event.event_name, "No handlers registered for event");
            return Ok(());
        }

        for handler in handlers {
            handler(self, event)?;
        }
        Ok(())
    }

    // ========================================================================
    // Session Callbacks
    // ========================================================================

    pub fn add_next_tick_callback<F>(&mut self, callback: F) -> CallbackId
    where
        F: Fn(&mut Document) -> DomainResult<()> + Send + Sync + 'static,
    {
        self.add_session_callback(CallbackSchedule::NextTick, Arc::new(callback))
    }

    pub fn add_timeout_callback<F>(&mut self, callback: F, delay: Duration) -> CallbackId
    where
        F: Fn(&mut Document) -> DomainResult<()> + Send + Sync + 'static,
    {
        self.add_session_callback(CallbackSchedule::Timeout(delay), Arc::new(callback))
    }

    pub fn add_periodic_callback<F>(&mut self, callback: F, period: Duration) -> CallbackId
    where
        F: Fn(&mut Document) -> DomainResult<()> + Send + Sync + 'static,
    {
        self.add_session_callback(CallbackSchedule::Periodic(period), Arc::new(callback))
    }

    fn add_session_callback(
        &mut self,
        schedule: CallbackSchedule,
        callback: DocumentCallback,
    ) -> CallbackId {
        let entry = SessionCallback {
            id: CallbackId::next(),
            schedule,
            callback,
        };
        let id = entry.id;
        self.session_callbacks.push(entry.clone());
        self.emit(DocumentEvent::SessionCallbackAdded(entry));
        id
    }

    pub fn remove_next_tick_callback(&mut self, id: CallbackId) -> DomainResult<()> {
        self.remove_session_callback(id, CallbackKind::NextTick)
    }

    pub fn remove_timeout_callback(&mut self, id: CallbackId) -> DomainResult<()> {
        self.remove_session_callback(id, CallbackKind::Timeout)
    }

    pub fn remove_periodic_callback(&mut self, id: CallbackId) -> DomainResult<()> {
        self.remove_session_callback(id, CallbackKind::Periodic)
    }

    fn remove_session_callback(&mut self, id: CallbackId, kind: CallbackKind) -> DomainResult<()> {
        let position = self
            .session_callbacks
            .iter()
            .position(|cb| cb.id == id && cb.kind() == kind)
            .ok_or(DomainError::CallbackAlreadyRemoved { id, kind })?;
        self.session_callbacks.remove(position);
        self.emit(DocumentEvent::SessionCallbackRemoved { id, kind });
        Ok(())
    }

    /// Drops the bookkeeping for a one-shot callback that already fired.
    ///
    /// Emits nothing. Returns false if the id was not registered.
    pub fn forget_session_callback(&mut self, id: CallbackId) -> bool {
        let before = self.session_callbacks.len();
        self.session_callbacks.retain(|cb| cb.id != id);
        self.session_callbacks.len() != before
    }

    pub fn session_callbacks(&self) -> &[SessionCallback] {
        &self.session_callbacks
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Registers a callback to run once the owning session is destroyed.
    pub fn on_session_destroyed<F>(&mut self, callback: F)
    where
        F: FnOnce(&SessionId) + Send + 'static,
    {
        self.destroyed_callbacks.push(Box::new(callback));
    }

    /// Attaches application state to the document.
    pub fn insert_module<T: Any + Send>(&mut self, name: impl Into<String>, value: T) {
        self.modules.insert(name.into(), Box::new(value));
    }

    pub fn module<T: Any + Send>(&self, name: &str) -> Option<&T> {
        self.modules.get(name).and_then(|m| m.downcast_ref::<T>())
    }

    /// Drops all application state attached with [`Document::insert_module`].
    pub fn delete_modules(&mut self) {
        if !self.modules.is_empty() {
            debug!(count = self.modules.len(), "Deleting document modules");
        }
        self.modules.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Tears the document down on behalf of its owning session.
    ///
    /// Returns the `session_destroyed` callbacks so the caller can run them
    /// after releasing the session lock. A second call returns nothing.
    pub fn destroy(&mut self, owner: &SessionId) -> Vec<SessionDestroyedCallback> {
        if self.destroyed {
            return Vec::new();
        }
        debug!(session_id = %owner, models = self.models.len(), "Destroying document");

        self.remove_on_change();
        self.roots.clear();
        self.models.clear();
        self.session_callbacks.clear();
        self.event_handlers.clear();
        self.delete_modules();
        self.destroyed = true;

        std::mem::take(&mut self.destroyed_callbacks)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("title", &self.title)
            .field("roots", &self.roots)
            .field("models", &self.models.len())
            .field("session_callbacks", &self.session_callbacks.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn listening_document() -> (Document, mpsc::UnboundedReceiver<DocumentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut doc = Document::new();
        doc.on_change_dispatch_to(tx);
        (doc, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DocumentEvent>) -> Vec<DocumentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn slider() -> ModelJson {
        ModelJson::new("slider", "Slider").with_attribute("value", json!(1))
    }

    #[test]
    fn test_set_attribute_emits_change() {
        let (mut doc, mut rx) = listening_document();
        doc.add_root(slider()).unwrap();
        drain(&mut rx);

        let changed = doc
            .set_attribute(&ModelId::new("slider"), "value", json!(5))
            .unwrap();
        assert!(changed);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DocumentEvent::Patched(ev) => {
                assert!(ev.setter.is_none());
                assert!(matches!(ev.patch, PatchEvent::ModelChanged { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_set_same_value_is_silent() {
        let (mut doc, mut rx) = listening_document();
        doc.add_root(slider()).unwrap();
        drain(&mut rx);

        let changed = doc
            .set_attribute(&ModelId::new("slider"), "value", json!(1))
            .unwrap();
        assert!(!changed);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_set_attribute_unknown_model() {
        let mut doc = Document::new();
        let err = doc
            .set_attribute(&ModelId::new("missing"), "value", json!(1))
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownModel { .. }));
    }

    #[test]
    fn test_apply_patch_records_setter() {
        let (mut doc, mut rx) = listening_document();
        doc.add_root(slider()).unwrap();
        drain(&mut rx);

        let patch = vec![
            PatchEvent::ModelChanged {
                model: ModelId::new("slider"),
                attr: "value".to_string(),
                new: json!(9),
            },
            PatchEvent::TitleChanged {
                title: "Dashboard".to_string(),
            },
        ];
        doc.apply_patch(&patch, Some(ConnectionId::new(3))).unwrap();

        assert_eq!(doc.title(), "Dashboard");
        assert_eq!(doc.attribute(&ModelId::new("slider"), "value"), Some(&json!(9)));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        for event in events {
            match event {
                DocumentEvent::Patched(ev) => assert_eq!(ev.setter, Some(ConnectionId::new(3))),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_replace_with_json_validates_roots() {
        let mut doc = Document::new();
        doc.add_root(slider()).unwrap();

        let bad = DocumentJson {
            title: "x".to_string(),
            roots: vec![ModelId::new("nope")],
            models: vec![],
        };
        assert!(doc.replace_with_json(bad, None).is_err());
        // Original content untouched
        assert_eq!(doc.roots(), &[ModelId::new("slider")]);
    }

    #[test]
    fn test_replace_with_json_roundtrips_snapshot() {
        let mut source = Document::new();
        source.set_title("Source");
        source.add_root(slider()).unwrap();
        source.add_model(ModelJson::new("range", "Range1d")).unwrap();

        let (mut target, mut rx) = listening_document();
        target.add_root(ModelJson::new("old", "Div")).unwrap();
        drain(&mut rx);

        target.replace_with_json(source.to_json(), None).unwrap();
        assert_eq!(target.to_json(), source.to_json());

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                DocumentEvent::Patched(ev) => Some(ev.patch),
                _ => None,
            })
            .collect();
        assert!(matches!(kinds.first(), Some(PatchEvent::RootRemoved { .. })));
        assert!(kinds
            .iter()
            .any(|p| matches!(p, PatchEvent::TitleChanged { title } if title == "Source")));
    }

    fn patches(rx: &mut mpsc::UnboundedReceiver<DocumentEvent>) -> Vec<PatchEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|event| match event {
                DocumentEvent::Patched(ev) => Some(ev.patch),
                _ => None,
            })
            .collect()
    }

    /// A document and a mirror that was synced from a snapshot of it.
    fn mirrored(doc: &Document) -> Document {
        let mut mirror = Document::new();
        mirror.replace_with_json(doc.to_json(), None).unwrap();
        mirror
    }

    #[test]
    fn test_replace_patches_replay_onto_mirror_with_shared_model() {
        let (mut doc, mut rx) = listening_document();
        doc.add_root(ModelJson::new("a", "Plot")).unwrap();
        doc.add_model(ModelJson::new("r", "Range1d")).unwrap();
        let mut mirror = mirrored(&doc);
        drain(&mut rx);

        let replacement = DocumentJson {
            title: "next".to_string(),
            roots: vec![ModelId::new("b")],
            models: vec![ModelJson::new("b", "Plot"), ModelJson::new("r", "Range1d")],
        };
        doc.replace_with_json(replacement, None).unwrap();

        let replay = patches(&mut rx);
        assert!(replay.contains(&PatchEvent::ModelRemoved {
            model: ModelId::new("r"),
        }));
        mirror.apply_patch(&replay, None).unwrap();
        assert_eq!(mirror.to_json(), doc.to_json());
    }

    #[test]
    fn test_replace_patches_replay_drops_missing_model() {
        let (mut doc, mut rx) = listening_document();
        doc.add_root(ModelJson::new("a", "Plot")).unwrap();
        doc.add_model(ModelJson::new("r", "Range1d")).unwrap();
        let mut mirror = mirrored(&doc);
        drain(&mut rx);

        let replacement = DocumentJson {
            title: String::new(),
            roots: vec![ModelId::new("a")],
            models: vec![ModelJson::new("a", "Plot")],
        };
        doc.replace_with_json(replacement, None).unwrap();

        mirror.apply_patch(&patches(&mut rx), None).unwrap();
        assert!(!mirror.contains_model(&ModelId::new("r")));
        assert_eq!(mirror.to_json(), doc.to_json());
    }

    #[test]
    fn test_remove_model_refuses_roots() {
        let (mut doc, mut rx) = listening_document();
        doc.add_root(slider()).unwrap();
        doc.add_model(ModelJson::new("range", "Range1d")).unwrap();
        drain(&mut rx);

        assert_eq!(
            doc.remove_model(&ModelId::new("slider")),
            Err(DomainError::IsARoot {
                model: ModelId::new("slider"),
            })
        );
        assert_eq!(
            doc.remove_model(&ModelId::new("nope")),
            Err(DomainError::UnknownModel {
                model: ModelId::new("nope"),
            })
        );
        doc.remove_model(&ModelId::new("range")).unwrap();
        assert_eq!(
            patches(&mut rx),
            vec![PatchEvent::ModelRemoved {
                model: ModelId::new("range"),
            }]
        );
    }

    #[test]
    fn test_apply_event_dispatches_to_handlers() {
        let mut doc = Document::new();
        doc.add_root(slider()).unwrap();
        doc.on_event("button_click", |doc, event| {
            let clicks = event.values.get("clicks").cloned().unwrap_or(json!(0));
            doc.set_attribute(&ModelId::new("slider"), "value", clicks)?;
            Ok(())
        });

        let mut event = UiEvent::new("button_click");
        event.values = json!({ "clicks": 4 });
        doc.apply_event(&event).unwrap();
        assert_eq!(doc.attribute(&ModelId::new("slider"), "value"), Some(&json!(4)));

        // Unknown event names are ignored
        doc.apply_event(&UiEvent::new("mouse_move")).unwrap();
    }

    #[test]
    fn test_apply_event_unknown_model() {
        let mut doc = Document::new();
        let mut event = UiEvent::new("tap");
        event.model = Some(ModelId::new("ghost"));
        assert!(matches!(
            doc.apply_event(&event),
            Err(DomainError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_session_callback_double_remove() {
        let (mut doc, mut rx) = listening_document();
        let id = doc.add_periodic_callback(|_| Ok(()), Duration::from_millis(10));
        assert_eq!(doc.session_callbacks().len(), 1);

        doc.remove_periodic_callback(id).unwrap();
        let err = doc.remove_periodic_callback(id).unwrap_err();
        assert!(matches!(err, DomainError::CallbackAlreadyRemoved { .. }));

        let events = drain(&mut rx);
        assert!(matches!(events[0], DocumentEvent::SessionCallbackAdded(_)));
        assert!(matches!(
            events[1],
            DocumentEvent::SessionCallbackRemoved { kind: CallbackKind::Periodic, .. }
        ));
    }

    #[test]
    fn test_remove_with_wrong_kind_fails() {
        let mut doc = Document::new();
        let id = doc.add_next_tick_callback(|_| Ok(()));
        assert!(doc.remove_timeout_callback(id).is_err());
        assert!(doc.remove_next_tick_callback(id).is_ok());
    }

    #[test]
    fn test_forget_session_callback() {
        let mut doc = Document::new();
        let id = doc.add_timeout_callback(|_| Ok(()), Duration::from_millis(5));
        assert!(doc.forget_session_callback(id));
        assert!(!doc.forget_session_callback(id));
        assert!(doc.remove_timeout_callback(id).is_err());
    }

    #[test]
    fn test_destroy_returns_destroyed_callbacks_once() {
        let mut doc = Document::new();
        doc.add_root(slider()).unwrap();
        doc.add_next_tick_callback(|_| Ok(()));
        doc.insert_module("state", 42u32);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        doc.on_session_destroyed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let owner = SessionId::new("s1");
        let callbacks = doc.destroy(&owner);
        assert_eq!(callbacks.len(), 1);
        for cb in callbacks {
            cb(&owner);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(doc.is_destroyed());
        assert!(doc.roots().is_empty());
        assert!(doc.session_callbacks().is_empty());
        assert!(doc.module::<u32>("state").is_none());
        assert!(doc.destroy(&owner).is_empty());
    }

    #[test]
    fn test_modules() {
        let mut doc = Document::new();
        doc.insert_module("counter", 7u64);
        assert_eq!(doc.module::<u64>("counter"), Some(&7));
        assert!(doc.module::<String>("counter").is_none());
        doc.delete_modules();
        assert!(doc.module::<u64>("counter").is_none());
    }
}
