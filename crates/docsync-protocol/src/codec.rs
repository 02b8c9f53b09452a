//! Newline-delimited JSON framing.
//!
//! One message per line. Decoding validates size and the header before a
//! message reaches dispatch; unknown message types decode successfully so
//! the dispatcher can reject them with a proper reply.

use crate::error::ProtocolError;
use crate::message::{Message, OpenRequest};

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

fn check_size(line: &str) -> Result<&str, ProtocolError> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(line.trim_end_matches(['\r', '\n']))
}

/// Decodes one line into a [`Message`].
pub fn decode_message(line: &str) -> Result<Message, ProtocolError> {
    let line = check_size(line)?;
    let msg: Message =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if msg.header.msgid.as_str().is_empty() {
        return Err(ProtocolError::MissingMessageId);
    }
    if msg.header.msgtype.is_empty() {
        return Err(ProtocolError::Malformed("empty msgtype".to_string()));
    }

    Ok(msg)
}

/// Decodes the open request a client sends first and checks that its
/// protocol version can be served.
pub fn decode_open_request(line: &str) -> Result<OpenRequest, ProtocolError> {
    let line = check_size(line)?;
    let request: OpenRequest =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    request.check_protocol_version()?;
    Ok(request)
}

/// Encodes a message as a single line (without the trailing newline).
pub fn encode_message(msg: &Message) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, MessageKind};

    #[test]
    fn test_decode_valid_message() {
        let line = r#"{"header":{"msgid":"1","msgtype":"PULL-DOC-REQ"},"metadata":{},"content":{}}"#;
        let msg = decode_message(line).unwrap();
        assert_eq!(msg.kind(), Some(MessageKind::PullDocReq));
        assert_eq!(msg.msgid().as_str(), "1");
    }

    #[test]
    fn test_decode_tolerates_trailing_newline_and_missing_sections() {
        let line = "{\"header\":{\"msgid\":\"9\",\"msgtype\":\"SERVER-INFO-REQ\"}}\n";
        let msg = decode_message(line).unwrap();
        assert_eq!(msg.kind(), Some(MessageKind::ServerInfoReq));
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_decode_unknown_type_is_not_a_codec_error() {
        let line = r#"{"header":{"msgid":"1","msgtype":"FROB"},"content":{}}"#;
        let msg = decode_message(line).unwrap();
        assert_eq!(msg.kind(), None);
        assert_eq!(msg.msgtype(), "FROB");
    }

    #[test]
    fn test_decode_rejects_empty_msgid() {
        let line = r#"{"header":{"msgid":"","msgtype":"OK"}}"#;
        assert_eq!(decode_message(line), Err(ProtocolError::MissingMessageId));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_message("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_message(r#"{"content":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let line = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            decode_message(&line),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_is_single_line() {
        let msg = Message::server_info_req(MessageId::new("3"));
        let line = encode_message(&msg).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode_message(&line).unwrap(), msg);
    }

    #[test]
    fn test_decode_open_request() {
        let req = decode_open_request(r#"{"app":"/sliders","session_id":"abc"}"#).unwrap();
        assert_eq!(req.app, "/sliders");
        assert_eq!(req.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_decode_open_request_rejects_newer_protocol() {
        let err = decode_open_request(r#"{"session_id":"abc","protocol_version":"1.9"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::IncompatibleVersion { .. }));

        let err = decode_open_request(r#"{"protocol_version":"v1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
