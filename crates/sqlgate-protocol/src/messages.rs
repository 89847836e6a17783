use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::framer::PROTOCOL_VERSION;

/// A client-side protocol frame. `original` keeps the raw payload bytes
/// (everything after the tag and length fields) so that unmodified frames
/// can be forwarded byte-for-byte without re-encoding.
///
/// The pre-handshake packets (startup, SSL request, cancel request) carry
/// no tag byte on the wire; they use `header == 0` and `original` holds the
/// bytes after the 4-byte length field.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: u8,
    pub length: i32,
    pub original: Vec<u8>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    SslRequest,
    CancelRequest {
        pid: i32,
        secret: i32,
    },
    Startup {
        params: HashMap<String, String>,
    },
    Terminate,
    Query {
        sql: String,
    },
    /// Extended query: Parse (P)
    Parse {
        statement_name: String,
        sql: String,
        param_type_oids: Vec<i32>,
    },
    /// Extended query: Bind (B)
    Bind {
        statement_name: String,
        portal_name: String,
        param_format_codes: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_format_codes: Vec<i16>,
    },
    /// Extended query: Execute (E)
    Execute {
        statement_name: String,
        max_rows: i32,
    },
    /// Extended query: Sync (S)
    Sync,
    Password {
        hashed: Vec<u8>,
    },
    SaslInitialResponse {
        mechanism: String,
        client_nonce: String,
    },
    SaslResponse {
        proof: String,
    },
    /// Any tag the proxy does not interpret; relayed verbatim.
    Other,
}

impl Message {
    pub(crate) fn tagged(header: u8, payload: Vec<u8>, body: MessageBody) -> Message {
        Message {
            header,
            length: payload.len() as i32 + 4,
            original: payload,
            body,
        }
    }

    fn untagged(payload: Vec<u8>, body: MessageBody) -> Message {
        Message {
            header: 0,
            length: payload.len() as i32 + 4,
            original: payload,
            body,
        }
    }

    /// Re-serialize the exact wire bytes of this frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.original.len());
        if self.header != 0 {
            out.push(self.header);
        }
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.original);
        out
    }

    pub fn is_termination(&self) -> bool {
        matches!(self.body, MessageBody::Terminate)
    }

    pub fn ssl_request() -> Message {
        Message::untagged(vec![0x04, 0xd2, 0x16, 0x2f], MessageBody::SslRequest)
    }

    pub fn startup(params: &HashMap<String, String>) -> Message {
        let mut payload = Vec::new();
        payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        for (key, value) in params {
            put_cstring(&mut payload, key);
            put_cstring(&mut payload, value);
        }
        payload.push(0);
        Message::untagged(
            payload,
            MessageBody::Startup {
                params: params.clone(),
            },
        )
    }

    pub fn terminate() -> Message {
        Message::tagged(b'X', Vec::new(), MessageBody::Terminate)
    }

    pub fn sync() -> Message {
        Message::tagged(b'S', Vec::new(), MessageBody::Sync)
    }

    pub fn query(sql: &str) -> Message {
        let mut payload = Vec::new();
        put_cstring(&mut payload, sql);
        Message::tagged(
            b'Q',
            payload,
            MessageBody::Query {
                sql: sql.to_string(),
            },
        )
    }

    /// The trailing zero byte is not documented for password messages but
    /// every driver sends one, so we do too.
    pub fn password(hashed: &[u8]) -> Message {
        let mut payload = Vec::with_capacity(hashed.len() + 1);
        payload.extend_from_slice(hashed);
        payload.push(0);
        Message::tagged(
            b'p',
            payload,
            MessageBody::Password {
                hashed: hashed.to_vec(),
            },
        )
    }

    pub fn parse_statement(statement_name: &str, sql: &str, param_type_oids: &[i32]) -> Message {
        let mut payload = Vec::new();
        put_cstring(&mut payload, statement_name);
        put_cstring(&mut payload, sql);
        payload.extend_from_slice(&(param_type_oids.len() as i16).to_be_bytes());
        for oid in param_type_oids {
            payload.extend_from_slice(&oid.to_be_bytes());
        }
        Message::tagged(
            b'P',
            payload,
            MessageBody::Parse {
                statement_name: statement_name.to_string(),
                sql: sql.to_string(),
                param_type_oids: param_type_oids.to_vec(),
            },
        )
    }

    pub fn bind(
        statement_name: &str,
        portal_name: &str,
        param_format_codes: &[i16],
        param_values: &[Option<Vec<u8>>],
        result_format_codes: &[i16],
    ) -> Message {
        let mut payload = Vec::new();
        put_cstring(&mut payload, statement_name);
        put_cstring(&mut payload, portal_name);
        payload.extend_from_slice(&(param_format_codes.len() as i16).to_be_bytes());
        for code in param_format_codes {
            payload.extend_from_slice(&code.to_be_bytes());
        }
        payload.extend_from_slice(&(param_values.len() as i16).to_be_bytes());
        for value in param_values {
            match value {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        payload.extend_from_slice(&(result_format_codes.len() as i16).to_be_bytes());
        for code in result_format_codes {
            payload.extend_from_slice(&code.to_be_bytes());
        }
        Message::tagged(
            b'B',
            payload,
            MessageBody::Bind {
                statement_name: statement_name.to_string(),
                portal_name: portal_name.to_string(),
                param_format_codes: param_format_codes.to_vec(),
                param_values: param_values.to_vec(),
                result_format_codes: result_format_codes.to_vec(),
            },
        )
    }

    pub fn execute(statement_name: &str, max_rows: i32) -> Message {
        let mut payload = Vec::new();
        put_cstring(&mut payload, statement_name);
        payload.extend_from_slice(&max_rows.to_be_bytes());
        Message::tagged(
            b'E',
            payload,
            MessageBody::Execute {
                statement_name: statement_name.to_string(),
                max_rows,
            },
        )
    }

    pub fn sasl_initial_response(mechanism: &str, client_first: &str) -> Message {
        let mut payload = Vec::new();
        put_cstring(&mut payload, mechanism);
        payload.extend_from_slice(&(client_first.len() as i32).to_be_bytes());
        payload.extend_from_slice(client_first.as_bytes());
        let client_nonce = extract_scram_attribute(client_first, "r=").unwrap_or_default();
        Message::tagged(
            b'p',
            payload,
            MessageBody::SaslInitialResponse {
                mechanism: mechanism.to_string(),
                client_nonce,
            },
        )
    }
}

pub(crate) fn put_cstring(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

/// Pull a single `key=value` attribute out of a comma-separated SCRAM
/// message, e.g. `r=` for the nonce or `p=` for the proof.
pub(crate) fn extract_scram_attribute(message: &str, key: &str) -> Option<String> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(key).map(|v| v.to_string()))
}

pub(crate) fn utf8(bytes: Vec<u8>) -> Result<String, ProtocolError> {
    Ok(String::from_utf8(bytes)?)
}
