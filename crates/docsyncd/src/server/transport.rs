//! Per-connection transport task.
//!
//! Each client connection gets its own [`ConnectionTask`] that:
//! - Reads the OPEN request and resolves (or creates) the session
//! - Subscribes the connection to the session, then sends ACK
//! - Decodes messages and hands them to the [`ProtocolHandler`]
//! - Writes replies and broadcasts through a dedicated writer task
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docsync_core::{ConnectionId, SessionId};
use docsync_protocol::{
    decode_message, decode_open_request, encode_message, Message, ProtocolError, MAX_MESSAGE_SIZE,
};

use super::ApplicationMap;
use crate::connection::{ConnectionError, ConnectionHandle, ServerConnection};
use crate::contexts::SessionRequest;
use crate::protocol_handler::ProtocolHandler;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One client connection, from OPEN to disconnect.
pub struct ConnectionTask {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    id: ConnectionId,
    apps: Arc<ApplicationMap>,
    protocol: Arc<ProtocolHandler>,
    outbound_buffer: usize,
    cancel_token: CancellationToken,
}

impl ConnectionTask {
    pub fn new(
        stream: UnixStream,
        id: ConnectionId,
        apps: Arc<ApplicationMap>,
        protocol: Arc<ProtocolHandler>,
        outbound_buffer: usize,
        cancel_token: CancellationToken,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            id,
            apps,
            protocol,
            outbound_buffer,
            cancel_token,
        }
    }

    /// Runs the connection until the client disconnects or the server
    /// shuts down.
    pub async fn run(self) {
        let Self {
            mut reader,
            writer,
            id,
            apps,
            protocol,
            outbound_buffer,
            cancel_token,
        } = self;
        debug!(connection = %id, "New client connected");

        let (tx, rx) = mpsc::channel(outbound_buffer);
        let writer_task = spawn_writer(id, writer, rx);
        let handle = ConnectionHandle::new(id, tx);

        match open_session(&mut reader, &handle, &apps).await {
            Ok((connection, session_id)) => {
                let result = serve(&mut reader, &connection, &protocol, &cancel_token).await;
                if let Err(e) = result {
                    debug!(connection = %id, error = %e, "Connection closed");
                }
                info!(connection = %id, %session_id, "Client disconnected");
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "Failed to open session");
                let reply = Message::error(handle.next_message_id(), None, e.to_string(), None);
                let _ = handle.send(reply).await;
            }
        }

        // The writer drains once every handle is gone
        drop(handle);
        if let Err(e) = writer_task.await {
            debug!(connection = %id, error = %e, "Writer task ended abnormally");
        }
    }
}

/// Reads the OPEN request, attaches to the session it names and sends ACK.
///
/// The connection is subscribed before ACK is queued, so a client that has
/// seen ACK receives every later broadcast.
async fn open_session(
    reader: &mut BufReader<OwnedReadHalf>,
    handle: &ConnectionHandle,
    apps: &ApplicationMap,
) -> Result<(ServerConnection, SessionId), ConnectionError> {
    let line = read_line(reader)
        .await?
        .ok_or(ConnectionError::Closed(handle.id()))?;
    let request = decode_open_request(&line)?;

    let app = apps
        .get(&request.app)
        .ok_or_else(|| ProtocolError::UnknownApplication(request.app.clone()))?;

    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let session_id = SessionId::new(session_id);
    let connection = app
        .attach_connection(
            session_id.clone(),
            SessionRequest::from_open_request(&request),
            handle.clone(),
        )
        .await?;
    connection
        .send(Message::ack(handle.next_message_id(), session_id.as_str()))
        .await?;

    info!(
        connection = %handle.id(),
        app = %request.app,
        %session_id,
        "Client attached to session"
    );
    Ok((connection, session_id))
}

/// Message loop. Returns on EOF, shutdown or an unrecoverable error.
async fn serve(
    reader: &mut BufReader<OwnedReadHalf>,
    connection: &ServerConnection,
    protocol: &ProtocolHandler,
    cancel_token: &CancellationToken,
) -> Result<(), ConnectionError> {
    let handle = connection.handle();
    loop {
        let line = tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            line = read_line(reader) => line?,
        };
        let Some(line) = line else {
            debug!(connection = %connection.id(), "Client sent EOF");
            return Ok(());
        };

        let message = match decode_message(&line) {
            Ok(message) => message,
            Err(e @ ProtocolError::MessageTooLarge { .. }) => return Err(e.into()),
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "Rejecting undecodable message");
                let reply = Message::error(handle.next_message_id(), None, e.to_string(), None);
                connection.send(reply).await?;
                continue;
            }
        };

        debug!(
            connection = %connection.id(),
            msgtype = message.msgtype(),
            msgid = %message.msgid().as_str(),
            "Received message"
        );
        if let Some(reply) = protocol.handle(&message, &connection).await {
            connection.send(reply).await?;
        }
    }
}

/// Reads one line. Returns None on EOF.
async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<Option<String>, ConnectionError> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }
    Ok(Some(line))
}

/// Spawns the task that writes queued messages to the socket.
fn spawn_writer(
    id: ConnectionId,
    writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(message) = outbound.recv().await {
            let line = match encode_message(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Failed to encode message");
                    continue;
                }
            };

            let write = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            };
            match timeout(WRITE_TIMEOUT, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection = %id, error = %e, "Write failed, closing writer");
                    break;
                }
                Err(_) => {
                    warn!(connection = %id, "Write timed out, closing writer");
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    })
}
