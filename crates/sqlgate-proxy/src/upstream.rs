use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use sqlgate_protocol::auth::password_content;
use sqlgate_protocol::messages::Message;

use crate::config::BackendConfig;

/// An authenticated connection to the real backend. The handshake below is
/// never exposed to the client; the session only sees the stream once it is
/// ready for queries.
#[derive(Debug)]
pub struct Upstream<B> {
    pub stream: B,
    /// ParameterStatus set reported by the backend during its startup.
    pub parameters: Vec<(String, String)>,
    pub key_data: (i32, i32),
}

pub async fn connect(config: &BackendConfig, database: &str) -> Result<Upstream<TcpStream>> {
    let addr = format!("{}:{}", config.host, config.port);
    let stream = timeout(
        Duration::from_secs(config.connect_timeout_secs),
        TcpStream::connect(&addr),
    )
    .await
    .map_err(|_| anyhow!("timed out connecting to backend {addr}"))?
    .with_context(|| format!("connecting to backend {addr}"))?;
    authenticate(stream, config, database).await
}

/// Drive the backend-side startup flow with the configured backend
/// credentials: send the startup message, answer the authentication
/// request (cleartext or MD5), then collect ParameterStatus and
/// BackendKeyData until ReadyForQuery.
pub async fn authenticate<B: AsyncRead + AsyncWrite + Unpin>(
    mut stream: B,
    config: &BackendConfig,
    database: &str,
) -> Result<Upstream<B>> {
    let mut params = HashMap::new();
    params.insert("user".to_string(), config.username.clone());
    params.insert("database".to_string(), database.to_string());
    stream
        .write_all(&Message::startup(&params).to_bytes())
        .await?;
    stream.flush().await?;

    let mut parameters = Vec::new();
    let mut key_data = (0, 0);
    loop {
        let tag = stream.read_u8().await?;
        let length = stream.read_i32().await?;
        if length < 4 {
            bail!("invalid frame length from backend: {length}");
        }
        let mut payload = vec![0u8; length as usize - 4];
        stream.read_exact(&mut payload).await?;
        match tag {
            b'R' => {
                let subcode = read_i32(&payload, 0)?;
                match subcode {
                    0 => {}
                    3 => {
                        let reply = Message::password(config.password.as_bytes());
                        stream.write_all(&reply.to_bytes()).await?;
                        stream.flush().await?;
                    }
                    5 => {
                        let salt: [u8; 4] = payload
                            .get(4..8)
                            .and_then(|s| s.try_into().ok())
                            .ok_or_else(|| anyhow!("malformed md5 challenge from backend"))?;
                        let content =
                            password_content(&config.username, &config.password, &salt);
                        let reply = Message::password(content.as_bytes());
                        stream.write_all(&reply.to_bytes()).await?;
                        stream.flush().await?;
                    }
                    other => bail!("backend requested unsupported auth method {other}"),
                }
            }
            b'S' => {
                if let Some((key, value)) = split_cstring_pair(&payload) {
                    parameters.push((key, value));
                }
            }
            b'K' => {
                key_data = (read_i32(&payload, 0)?, read_i32(&payload, 4)?);
            }
            b'Z' => {
                return Ok(Upstream {
                    stream,
                    parameters,
                    key_data,
                });
            }
            b'E' => {
                bail!("backend refused connection: {}", error_field(&payload));
            }
            other => {
                debug!(tag = other, "ignoring backend startup message");
            }
        }
    }
}

fn read_i32(payload: &[u8], offset: usize) -> Result<i32> {
    payload
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .map(i32::from_be_bytes)
        .ok_or_else(|| anyhow!("truncated backend message"))
}

fn split_cstring_pair(payload: &[u8]) -> Option<(String, String)> {
    let mut parts = payload.split(|&b| b == 0);
    let key = String::from_utf8_lossy(parts.next()?).to_string();
    let value = String::from_utf8_lossy(parts.next()?).to_string();
    Some((key, value))
}

/// Pull the human-readable message field out of an ErrorResponse payload.
fn error_field(payload: &[u8]) -> String {
    let mut rest = payload;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        if field == b'M' {
            return String::from_utf8_lossy(&tail[..end]).to_string();
        }
        if end >= tail.len() {
            break;
        }
        rest = &tail[end + 1..];
    }
    "unknown error".to_string()
}
