//! One client link subscribed to a session.
//!
//! [`ConnectionHandle`] is the cheap, cloneable send side a session keeps
//! for broadcasting. [`ServerConnection`] is owned by the transport task and
//! holds a non-owning reference to its session; dropping it unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use docsync_core::{ConnectionId, PatchEvent};
use docsync_protocol::{Message, MessageId, ProtocolError};

use crate::session::{ServerSession, SessionError};

/// Errors from the transport side of a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Send side of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
    next_msgid: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            outbound,
            next_msgid: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Issues a fresh id for a server-originated message.
    pub fn next_message_id(&self) -> MessageId {
        let n = self.next_msgid.fetch_add(1, Ordering::Relaxed);
        MessageId::new(format!("{}-{n}", self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queues a message for the writer task.
    ///
    /// Waits while the queue is full.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ConnectionError::Closed(self.id))
    }

    pub async fn send_patch_document(
        &self,
        events: Vec<PatchEvent>,
    ) -> Result<(), ConnectionError> {
        let message = Message::patch_doc(self.next_message_id(), events);
        self.send(message).await
    }
}

/// A connection attached to one session.
pub struct ServerConnection {
    handle: ConnectionHandle,
    session: Option<Weak<ServerSession>>,
}

impl ServerConnection {
    /// Attaches the connection and subscribes it to the session's broadcasts.
    ///
    /// Fails with [`SessionError::Destroyed`] if the session was destroyed
    /// before the connection could subscribe.
    pub fn new(
        session: &Arc<ServerSession>,
        handle: ConnectionHandle,
    ) -> Result<Self, SessionError> {
        session.subscribe(handle.clone())?;
        Ok(Self {
            handle,
            session: Some(Arc::downgrade(session)),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// The session this connection is attached to.
    pub fn session(&self) -> Result<Arc<ServerSession>, SessionError> {
        self.session
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(SessionError::Detached)
    }

    /// Unsubscribes from the session. Later calls do nothing.
    pub fn detach_session(&mut self) {
        if let Some(session) = self.session.take().and_then(|weak| weak.upgrade()) {
            debug!(connection = %self.id(), session_id = %session.id(), "Detaching connection");
            session.unsubscribe(self.id());
        }
    }

    pub fn is_detached(&self) -> bool {
        self.session.is_none()
    }

    /// OK reply to `message`.
    pub fn ok(&self, message: &Message) -> Message {
        Message::ok(self.handle.next_message_id(), message.msgid())
    }

    /// ERROR reply to `message`.
    pub fn error(&self, message: &Message, text: impl Into<String>) -> Message {
        Message::error(
            self.handle.next_message_id(),
            Some(message.msgid()),
            text,
            None,
        )
    }

    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.handle.send(message).await
    }

    pub async fn send_patch_document(
        &self,
        events: Vec<PatchEvent>,
    ) -> Result<(), ConnectionError> {
        self.handle.send_patch_document(events).await
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.detach_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{Document, SessionId};
    use tokio::runtime::Handle;

    use crate::session::SessionSettings;

    fn test_session(id: &str) -> Arc<ServerSession> {
        ServerSession::new(
            SessionId::new(id),
            Document::new(),
            Handle::current(),
            SessionSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_message_ids_are_fresh() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(ConnectionId::new(7), tx);

        let a = handle.next_message_id();
        let b = handle.clone().next_message_id();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn-7-"));
    }

    #[tokio::test]
    async fn test_send_on_closed_queue_fails() {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(ConnectionId::new(1), tx);
        drop(rx);

        assert!(handle.is_closed());
        let err = handle.send_patch_document(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed(_)));
    }

    #[tokio::test]
    async fn test_connection_subscribes_and_drop_unsubscribes() {
        let session = test_session("s1");
        let (tx, _rx) = mpsc::channel(4);

        let connection =
            ServerConnection::new(&session, ConnectionHandle::new(ConnectionId::new(1), tx))
            .unwrap();
        assert_eq!(session.connection_count(), 1);
        assert!(connection.session().is_ok());

        drop(connection);
        assert_eq!(session.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_detached_connection_has_no_session() {
        let session = test_session("s1");
        let (tx, _rx) = mpsc::channel(4);
        let mut connection =
            ServerConnection::new(&session, ConnectionHandle::new(ConnectionId::new(2), tx))
            .unwrap();

        connection.detach_session();
        connection.detach_session();
        assert!(connection.is_detached());
        assert!(matches!(connection.session(), Err(SessionError::Detached)));
        assert_eq!(session.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_carry_reqid() {
        let session = test_session("s1");
        let (tx, _rx) = mpsc::channel(4);
        let connection =
            ServerConnection::new(&session, ConnectionHandle::new(ConnectionId::new(3), tx))
            .unwrap();
        let request = Message::pull_doc_req(MessageId::new("42"));

        let ok = connection.ok(&request);
        assert_eq!(ok.reqid(), Some(&MessageId::new("42")));

        let err = connection.error(&request, "nope");
        assert_eq!(err.msgtype(), "ERROR");
        assert_eq!(err.reqid(), Some(&MessageId::new("42")));
    }
}
