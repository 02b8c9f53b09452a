//! Dispatch of client messages to session operations.
//!
//! The table maps `(message kind, revision)` to a handler. A lookup tries the
//! exact revision first and falls back to the kind-only entry. Failures stay
//! local to the message: the client gets an ERROR reply addressed to the
//! offending message and the connection keeps running.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error, warn};

use docsync_protocol::{Message, MessageKind, ProtocolError};

use crate::connection::ServerConnection;
use crate::session::SessionError;

pub type HandlerResult = Result<Option<Message>, SessionError>;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// A message handler. Returns the reply to send, if any.
pub type HandlerFn =
    for<'a> fn(&'a ProtocolHandler, &'a Message, &'a ServerConnection) -> HandlerFuture<'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandlerKey {
    kind: MessageKind,
    revision: Option<u32>,
}

/// Stateless dispatch table for client messages.
pub struct ProtocolHandler {
    handlers: HashMap<HandlerKey, HandlerFn>,
    server_version: String,
}

impl ProtocolHandler {
    pub fn new(server_version: impl Into<String>) -> Self {
        let mut handler = Self {
            handlers: HashMap::new(),
            server_version: server_version.into(),
        };
        handler.register(MessageKind::PullDocReq, None, pull_doc);
        handler.register(MessageKind::PushDoc, None, push_doc);
        handler.register(MessageKind::PatchDoc, None, patch_doc);
        handler.register(MessageKind::Event, None, event);
        handler.register(MessageKind::ServerInfoReq, None, server_info);
        handler
    }

    /// Registers `handler` for `kind`, optionally for one revision only.
    pub fn register(&mut self, kind: MessageKind, revision: Option<u32>, handler: HandlerFn) {
        self.handlers.insert(HandlerKey { kind, revision }, handler);
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn lookup(&self, message: &Message) -> Option<HandlerFn> {
        let kind = message.kind()?;
        let revision = message.header.revision;
        if revision.is_some() {
            if let Some(handler) = self.handlers.get(&HandlerKey { kind, revision }) {
                return Some(*handler);
            }
        }
        self.handlers
            .get(&HandlerKey {
                kind,
                revision: None,
            })
            .copied()
    }

    /// Handles one message and returns the reply to send, if any.
    pub async fn handle(
        &self,
        message: &Message,
        connection: &ServerConnection,
    ) -> Option<Message> {
        let Some(handler) = self.lookup(message) else {
            let e = ProtocolError::UnexpectedMessage {
                msgtype: message.msgtype().to_string(),
            };
            warn!(connection = %connection.id(), error = %e, "Rejecting message");
            return Some(connection.error(message, e.to_string()));
        };

        match handler(self, message, connection).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    connection = %connection.id(),
                    msgtype = message.msgtype(),
                    error = %e,
                    "Error handling message"
                );
                debug!(
                    header = ?message.header,
                    content = %message.content,
                    "Message that caused the error"
                );
                Some(Message::error(
                    connection.handle().next_message_id(),
                    Some(message.msgid()),
                    e.to_string(),
                    Some(format!("{e:?}")),
                ))
            }
        }
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("handlers", &self.handlers.len())
            .field("server_version", &self.server_version)
            .finish()
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn pull_doc<'a>(
    _: &'a ProtocolHandler,
    message: &'a Message,
    connection: &'a ServerConnection,
) -> HandlerFuture<'a> {
    Box::pin(async move { connection.session()?.pull(message, connection).await })
}

fn push_doc<'a>(
    _: &'a ProtocolHandler,
    message: &'a Message,
    connection: &'a ServerConnection,
) -> HandlerFuture<'a> {
    Box::pin(async move { connection.session()?.push(message, connection).await })
}

fn patch_doc<'a>(
    _: &'a ProtocolHandler,
    message: &'a Message,
    connection: &'a ServerConnection,
) -> HandlerFuture<'a> {
    Box::pin(async move { connection.session()?.patch(message, connection).await })
}

fn event<'a>(
    _: &'a ProtocolHandler,
    message: &'a Message,
    connection: &'a ServerConnection,
) -> HandlerFuture<'a> {
    Box::pin(async move { connection.session()?.event(message, connection).await })
}

fn server_info<'a>(
    handler: &'a ProtocolHandler,
    message: &'a Message,
    connection: &'a ServerConnection,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(Some(Message::server_info_reply(
            connection.handle().next_message_id(),
            message.msgid(),
            &handler.server_version,
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docsync_core::{ConnectionId, Document, ModelId, ModelJson, PatchEvent, SessionId, UiEvent};
    use docsync_protocol::{ErrorContent, MessageId, ServerInfoReply};
    use serde_json::json;
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;

    use crate::connection::ConnectionHandle;
    use crate::session::{ServerSession, SessionSettings};

    fn setup() -> (Arc<ServerSession>, ServerConnection, mpsc::Receiver<Message>) {
        let mut document = Document::new();
        document.add_root(ModelJson::new("button", "Button")).unwrap();
        let session = ServerSession::new(
            SessionId::new("s1"),
            document,
            Handle::current(),
            SessionSettings::default(),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel(16);
        let connection =
            ServerConnection::new(&session, ConnectionHandle::new(ConnectionId::new(1), tx))
            .unwrap();
        (session, connection, rx)
    }

    fn forced_ok<'a>(
        _: &'a ProtocolHandler,
        message: &'a Message,
        connection: &'a ServerConnection,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { Ok(Some(connection.ok(message))) })
    }

    #[tokio::test]
    async fn test_unknown_type_gets_error_reply() {
        let (_session, connection, _rx) = setup();
        let handler = ProtocolHandler::new("0.1.0");

        let mut message = Message::pull_doc_req(MessageId::new("9"));
        message.header.msgtype = "PULL-DOC-REPLY".to_string();

        let reply = handler.handle(&message, &connection).await.unwrap();
        assert_eq!(reply.msgtype(), "ERROR");
        assert_eq!(reply.reqid(), Some(&MessageId::new("9")));
        let content: ErrorContent = reply.content_as().unwrap();
        assert_eq!(content.text, "PULL-DOC-REPLY not expected on server");
    }

    #[tokio::test]
    async fn test_server_info_handled_locally() {
        let (_session, connection, _rx) = setup();
        let handler = ProtocolHandler::new("0.1.0");

        let reply = handler
            .handle(&Message::server_info_req(MessageId::new("1")), &connection)
            .await
            .unwrap();
        assert_eq!(reply.msgtype(), "SERVER-INFO-REPLY");
        let content: ServerInfoReply = reply.content_as().unwrap();
        assert_eq!(content.version_info.server, "0.1.0");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let (_session, connection, _rx) = setup();
        let handler = ProtocolHandler::new("0.1.0");

        let bad = Message::patch_doc(
            MessageId::new("2"),
            vec![PatchEvent::ModelChanged {
                model: ModelId::new("missing"),
                attr: "label".to_string(),
                new: json!("x"),
            }],
        );
        let reply = handler.handle(&bad, &connection).await.unwrap();
        assert_eq!(reply.msgtype(), "ERROR");
        assert_eq!(reply.reqid(), Some(&MessageId::new("2")));

        // The connection still works
        let pull = handler
            .handle(&Message::pull_doc_req(MessageId::new("3")), &connection)
            .await
            .unwrap();
        assert_eq!(pull.msgtype(), "PULL-DOC-REPLY");
    }

    #[tokio::test]
    async fn test_event_dispatched_to_document() {
        let (session, connection, _rx) = setup();
        let handler = ProtocolHandler::new("0.1.0");
        session
            .with_document_locked(|d| {
                d.on_event("button_click", |doc, _| {
                    doc.set_title("clicked");
                    Ok(())
                })
            })
            .await
            .unwrap();

        let mut click = UiEvent::new("button_click");
        click.model = Some(ModelId::new("button"));
        let reply = handler
            .handle(&Message::event(MessageId::new("4"), click), &connection)
            .await
            .unwrap();
        assert_eq!(reply.msgtype(), "OK");

        let title = session.with_document_locked(|d| d.title().to_string()).await;
        assert_eq!(title.as_deref(), Some("clicked"));
    }

    #[tokio::test]
    async fn test_revisioned_lookup_falls_back_to_kind() {
        let (_session, connection, _rx) = setup();
        let mut handler = ProtocolHandler::new("0.1.0");
        handler.register(MessageKind::PullDocReq, Some(2), forced_ok);

        let mut v2 = Message::pull_doc_req(MessageId::new("5"));
        v2.header.revision = Some(2);
        assert_eq!(handler.handle(&v2, &connection).await.unwrap().msgtype(), "OK");

        let mut v3 = Message::pull_doc_req(MessageId::new("6"));
        v3.header.revision = Some(3);
        assert_eq!(
            handler.handle(&v3, &connection).await.unwrap().msgtype(),
            "PULL-DOC-REPLY"
        );
    }

    #[tokio::test]
    async fn test_detached_connection_gets_error() {
        let (session, mut connection, _rx) = setup();
        let handler = ProtocolHandler::new("0.1.0");
        connection.detach_session();
        drop(session);

        let reply = handler
            .handle(&Message::pull_doc_req(MessageId::new("7")), &connection)
            .await
            .unwrap();
        assert_eq!(reply.msgtype(), "ERROR");
    }
}
