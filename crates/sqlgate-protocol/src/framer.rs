use std::collections::HashMap;

use bytes::BytesMut;

use crate::error::ProtocolError;
use crate::messages::{extract_scram_attribute, utf8, Message, MessageBody};

pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Ceiling on the declared length of a tagged frame. The protocol caps
/// messages at 1 GiB; anything larger is a corrupt or hostile length field
/// and must not make the receive buffer grow toward it.
pub const MAX_FRAME_LENGTH: i32 = 1 << 30;

/// Ceiling on an untagged pre-handshake packet. Startup parameter lists are
/// small; this matches the limit commonly enforced by real servers.
pub const MAX_STARTUP_LENGTH: i32 = 10240;

/// How to decode a `p` frame. The tag is shared between the MD5 password
/// response and both SASL client messages; only the negotiation phase
/// disambiguates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStyle {
    Md5,
    SaslInitial,
    SaslProof,
}

/// Cuts a byte stream into protocol frames and decodes the ones the proxy
/// interprets. Frames with unrecognized tags come back as `MessageBody::Other`
/// and are forwarded untouched.
#[derive(Debug)]
pub struct Framer {
    pub password_style: PasswordStyle,
    pub max_frame_length: i32,
}

impl Framer {
    pub fn new() -> Self {
        Framer {
            password_style: PasswordStyle::Md5,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    /// Pop the next complete tagged frame off the receive buffer.
    /// Returns `Ok(None)` when the buffer holds only a partial frame.
    pub fn next_message(&self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let header = buf[0];
        let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if length < 4 {
            return Err(ProtocolError::InvalidLength(length));
        }
        if length > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                length,
                limit: self.max_frame_length,
            });
        }
        let total = 1 + length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let frame = buf.split_to(total);
        let payload = frame[5..].to_vec();
        Ok(Some(self.decode_frame(header, length, payload)?))
    }

    /// Parse a closed buffer that must contain whole frames only. A trailing
    /// partial frame is a framing error here, unlike `next_message` where it
    /// just means more bytes are on the way.
    pub fn parse_all(&self, data: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        let mut buf = BytesMut::from(data);
        let mut messages = Vec::new();
        while !buf.is_empty() {
            match self.next_message(&mut buf)? {
                Some(msg) => messages.push(msg),
                None => {
                    let declared = if buf.len() >= 5 {
                        1 + i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]).max(0) as usize
                    } else {
                        5
                    };
                    return Err(ProtocolError::IncompleteFrame {
                        declared,
                        available: buf.len(),
                    });
                }
            }
        }
        Ok(messages)
    }

    fn decode_frame(
        &self,
        header: u8,
        length: i32,
        payload: Vec<u8>,
    ) -> Result<Message, ProtocolError> {
        let body = match header {
            b'X' => MessageBody::Terminate,
            b'S' => MessageBody::Sync,
            b'Q' => {
                let mut reader = Reader::new(&payload);
                MessageBody::Query {
                    sql: reader.get_cstring()?,
                }
            }
            b'p' => self.decode_password(&payload)?,
            b'P' => {
                let mut reader = Reader::new(&payload);
                let statement_name = reader.get_cstring()?;
                let sql = reader.get_cstring()?;
                let count = reader.get_i16()?;
                let mut param_type_oids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    param_type_oids.push(reader.get_i32()?);
                }
                MessageBody::Parse {
                    statement_name,
                    sql,
                    param_type_oids,
                }
            }
            b'B' => {
                let mut reader = Reader::new(&payload);
                let statement_name = reader.get_cstring()?;
                let portal_name = reader.get_cstring()?;
                let format_count = reader.get_i16()?;
                let mut param_format_codes = Vec::with_capacity(format_count.max(0) as usize);
                for _ in 0..format_count {
                    param_format_codes.push(reader.get_i16()?);
                }
                let value_count = reader.get_i16()?;
                let mut param_values = Vec::with_capacity(value_count.max(0) as usize);
                for _ in 0..value_count {
                    let value_len = reader.get_i32()?;
                    if value_len < 0 {
                        param_values.push(None);
                    } else {
                        param_values.push(Some(reader.get_bytes(value_len as usize)?.to_vec()));
                    }
                }
                let result_count = reader.get_i16()?;
                let mut result_format_codes = Vec::with_capacity(result_count.max(0) as usize);
                for _ in 0..result_count {
                    result_format_codes.push(reader.get_i16()?);
                }
                MessageBody::Bind {
                    statement_name,
                    portal_name,
                    param_format_codes,
                    param_values,
                    result_format_codes,
                }
            }
            b'E' => {
                let mut reader = Reader::new(&payload);
                let statement_name = reader.get_cstring()?;
                let max_rows = reader.get_i32()?;
                MessageBody::Execute {
                    statement_name,
                    max_rows,
                }
            }
            _ => MessageBody::Other,
        };
        Ok(Message {
            header,
            length,
            original: payload,
            body,
        })
    }

    fn decode_password(&self, payload: &[u8]) -> Result<MessageBody, ProtocolError> {
        match self.password_style {
            PasswordStyle::Md5 => {
                let hashed = match payload.split_last() {
                    Some((&0, rest)) => rest.to_vec(),
                    _ => payload.to_vec(),
                };
                Ok(MessageBody::Password { hashed })
            }
            PasswordStyle::SaslInitial => {
                let mut reader = Reader::new(payload);
                let mechanism = reader.get_cstring()?;
                let response_len = reader.get_i32()?;
                if response_len < 0 {
                    return Err(ProtocolError::TruncatedPayload);
                }
                let client_first = utf8(reader.get_bytes(response_len as usize)?.to_vec())?;
                let client_nonce =
                    extract_scram_attribute(&client_first, "r=").unwrap_or_default();
                Ok(MessageBody::SaslInitialResponse {
                    mechanism,
                    client_nonce,
                })
            }
            PasswordStyle::SaslProof => {
                let client_final = utf8(payload.to_vec())?;
                let proof = extract_scram_attribute(&client_final, "p=").unwrap_or_default();
                Ok(MessageBody::SaslResponse { proof })
            }
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new()
    }
}

/// Decode one of the untagged pre-handshake packets from its declared
/// length and the bytes that follow the length field.
pub fn decode_initial(length: i32, payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut reader = Reader::new(payload);
    let code = reader.get_i32()?;
    let body = if length == 8 && code == SSL_REQUEST_CODE {
        MessageBody::SslRequest
    } else if length == 16 && code == CANCEL_REQUEST_CODE {
        MessageBody::CancelRequest {
            pid: reader.get_i32()?,
            secret: reader.get_i32()?,
        }
    } else if code == PROTOCOL_VERSION {
        MessageBody::Startup {
            params: parse_startup_params(&payload[4..])?,
        }
    } else {
        return Err(ProtocolError::UnsupportedProtocolVersion(code));
    };
    Ok(Message {
        header: 0,
        length,
        original: payload.to_vec(),
        body,
    })
}

/// Pop a complete untagged packet (startup / SSL request / cancel request)
/// off the receive buffer.
pub fn next_initial(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length < 8 {
        return Err(ProtocolError::InvalidLength(length));
    }
    if length > MAX_STARTUP_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            length,
            limit: MAX_STARTUP_LENGTH,
        });
    }
    if buf.len() < length as usize {
        return Ok(None);
    }
    let packet = buf.split_to(length as usize);
    decode_initial(length, &packet[4..]).map(Some)
}

fn parse_startup_params(data: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    let mut reader = Reader::new(data);
    let mut params = HashMap::new();
    loop {
        let key = reader.get_cstring()?;
        if key.is_empty() {
            break;
        }
        let value = reader.get_cstring()?;
        params.insert(key, value);
    }
    Ok(params)
}

/// Bounds-checked cursor over a message payload. Every read that would run
/// past the end yields a `ProtocolError` instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::TruncatedPayload);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_i16(&mut self) -> Result<i16, ProtocolError> {
        let bytes = self.get_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        let bytes = self.get_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn get_cstring(&mut self) -> Result<String, ProtocolError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString)?;
        let value = utf8(rest[..end].to_vec())?;
        self.pos += end + 1;
        Ok(value)
    }
}
