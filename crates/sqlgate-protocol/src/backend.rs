use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Server-side messages the proxy synthesizes itself. The real backend's
/// responses are relayed as opaque bytes and never pass through here.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationMd5Password { salt: [u8; 4] },
    ParameterStatus { key: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery,
    ErrorResponse { severity: String, code: String, message: String },
}

impl BackendMessage {
    pub fn auth_failure(username: &str) -> BackendMessage {
        BackendMessage::ErrorResponse {
            severity: "FATAL".into(),
            code: "28P01".into(),
            message: format!("password authentication failed for user \"{username}\""),
        }
    }

    pub fn unknown_statement(name: &str) -> BackendMessage {
        BackendMessage::ErrorResponse {
            severity: "ERROR".into(),
            code: "26000".into(),
            message: format!("prepared statement \"{name}\" does not exist"),
        }
    }

    pub fn protocol_violation(detail: &str) -> BackendMessage {
        BackendMessage::ErrorResponse {
            severity: "FATAL".into(),
            code: "08P01".into(),
            message: format!("protocol violation: {detail}"),
        }
    }
}

pub fn encode(msg: &BackendMessage, buf: &mut BytesMut) {
    match msg {
        BackendMessage::AuthenticationOk => {
            buf.put_u8(b'R');
            buf.put_i32(8);
            buf.put_i32(0);
        }
        BackendMessage::AuthenticationMd5Password { salt } => {
            buf.put_u8(b'R');
            buf.put_i32(12);
            buf.put_i32(5);
            buf.put_slice(salt);
        }
        BackendMessage::ParameterStatus { key, value } => {
            let mut payload = BytesMut::new();
            put_cstring(&mut payload, key);
            put_cstring(&mut payload, value);
            buf.put_u8(b'S');
            buf.put_i32((payload.len() + 4) as i32);
            buf.extend_from_slice(&payload);
        }
        BackendMessage::BackendKeyData { pid, secret } => {
            buf.put_u8(b'K');
            buf.put_i32(12);
            buf.put_i32(*pid);
            buf.put_i32(*secret);
        }
        BackendMessage::ReadyForQuery => {
            buf.put_u8(b'Z');
            buf.put_i32(5);
            buf.put_u8(b'I');
        }
        BackendMessage::ErrorResponse {
            severity,
            code,
            message,
        } => {
            let mut payload = BytesMut::new();
            payload.put_u8(b'S');
            put_cstring(&mut payload, severity);
            payload.put_u8(b'C');
            put_cstring(&mut payload, code);
            payload.put_u8(b'M');
            put_cstring(&mut payload, message);
            payload.put_u8(0);
            buf.put_u8(b'E');
            buf.put_i32((payload.len() + 4) as i32);
            buf.extend_from_slice(&payload);
        }
    }
}

pub async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: BackendMessage,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    encode(&msg, &mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.put_u8(0);
}
