use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::BytesMut;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use sqlgate_protocol::auth::verify_password;
use sqlgate_protocol::backend::{write_message, BackendMessage};
use sqlgate_protocol::framer::{decode_initial, next_initial, Framer, MAX_STARTUP_LENGTH};
use sqlgate_protocol::messages::{Message, MessageBody};
use sqlgate_protocol::statement::StatementTracker;
use sqlgate_protocol::ProtocolError;

use crate::audit::{AuditSink, SessionContext};
use crate::config::Config;
use crate::upstream::Upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStartup,
    Authenticating,
    Relaying,
    Terminated,
}

/// One client connection. Owns the statement table, the auth salt and the
/// framer; nothing here is shared with any other session, so everything is
/// reclaimed when the session is dropped, on every exit path.
pub struct Session {
    ctx: SessionContext,
    proxy_username: String,
    proxy_password: String,
    overlay_params: Vec<(String, String)>,
    idle_timeout: Duration,
    sink: Arc<dyn AuditSink>,
    tracker: StatementTracker,
    framer: Framer,
    salt: [u8; 4],
    state: SessionState,
}

impl Session {
    pub fn new(config: &Config, ctx: SessionContext, sink: Arc<dyn AuditSink>) -> Session {
        let mut overlay_params: Vec<(String, String)> = config
            .session_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        overlay_params.sort();
        Session {
            ctx,
            proxy_username: config.proxy_auth.username.clone(),
            proxy_password: config.proxy_auth.password.clone(),
            overlay_params,
            idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
            sink,
            tracker: StatementTracker::new(),
            framer: Framer::new(),
            salt: rand::random(),
            state: SessionState::AwaitingStartup,
        }
    }

    /// Drive the session from startup to termination. `startup` carries the
    /// parameters when the listener already consumed the startup packet
    /// while deciding on TLS.
    pub async fn run<C, B>(
        mut self,
        mut client: C,
        upstream: Upstream<B>,
        startup: Option<HashMap<String, String>>,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream_stream = upstream.stream;
        let mut client_buf = BytesMut::with_capacity(8192);

        // The idle timeout also bounds the handshake: a client that connects
        // and goes silent must not hold a permit and a backend connection.
        let startup_params = match startup {
            Some(params) => params,
            None => {
                let awaited = timeout(
                    self.idle_timeout,
                    self.await_startup(&mut client, &mut client_buf),
                )
                .await;
                match awaited {
                    Ok(result) => match result? {
                        Some(params) => params,
                        None => return Ok(()),
                    },
                    Err(_) => bail!("timed out waiting for client startup"),
                }
            }
        };
        if let Some(user) = startup_params.get("user") {
            debug!(session = %self.ctx.session_id, user, "startup received");
        }

        self.state = SessionState::Authenticating;
        match timeout(
            self.idle_timeout,
            self.authenticate(&mut client, &mut client_buf),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => bail!("timed out waiting for client authentication"),
        }
        debug!(
            session = %self.ctx.session_id,
            backend_pid = upstream.key_data.0,
            "client authenticated"
        );
        self.complete_startup(&mut client, &upstream.parameters)
            .await?;

        self.state = SessionState::Relaying;
        let result = self
            .relay(&mut client, &mut upstream_stream, &mut client_buf)
            .await;
        self.state = SessionState::Terminated;
        info!(session = %self.ctx.session_id, "session closed");
        result
    }

    async fn await_startup<C>(
        &mut self,
        client: &mut C,
        buf: &mut BytesMut,
    ) -> Result<Option<HashMap<String, String>>>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match next_initial(buf)? {
                Some(msg) => match msg.body {
                    MessageBody::Startup { params } => return Ok(Some(params)),
                    MessageBody::SslRequest => {
                        // The TLS decision was made by the listener; a repeat
                        // request gets the plaintext refusal byte.
                        client.write_all(b"N").await?;
                        client.flush().await?;
                    }
                    MessageBody::CancelRequest { pid, .. } => {
                        warn!(pid, "cancel request received; not supported");
                        return Ok(None);
                    }
                    _ => bail!("unexpected message before startup"),
                },
                None => {
                    if client.read_buf(buf).await? == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn authenticate<C>(&mut self, client: &mut C, buf: &mut BytesMut) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        write_message(
            client,
            BackendMessage::AuthenticationMd5Password { salt: self.salt },
        )
        .await?;
        loop {
            match self.framer.next_message(buf)? {
                Some(msg) => match msg.body {
                    MessageBody::Password { hashed } => {
                        return match verify_password(
                            &hashed,
                            &self.proxy_username,
                            &self.proxy_password,
                            &self.salt,
                        ) {
                            Ok(()) => Ok(()),
                            Err(err) => {
                                counter!("sqlgate_auth_failures_total").increment(1);
                                write_message(
                                    client,
                                    BackendMessage::auth_failure(&self.proxy_username),
                                )
                                .await?;
                                Err(err.into())
                            }
                        };
                    }
                    MessageBody::Terminate => bail!("client terminated during authentication"),
                    _ => bail!("unexpected message during authentication"),
                },
                None => {
                    if client.read_buf(buf).await? == 0 {
                        bail!("client disconnected during authentication");
                    }
                }
            }
        }
    }

    /// Synthesized post-auth sequence: AuthenticationOk, the merged
    /// ParameterStatus set, proxy-owned BackendKeyData, ReadyForQuery.
    async fn complete_startup<C>(
        &mut self,
        client: &mut C,
        upstream_params: &[(String, String)],
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        write_message(client, BackendMessage::AuthenticationOk).await?;
        for (key, value) in self.merged_parameters(upstream_params) {
            write_message(client, BackendMessage::ParameterStatus { key, value }).await?;
        }
        // Deliberately not the real backend's key data; cancel requests are
        // not relayed anyway.
        write_message(
            client,
            BackendMessage::BackendKeyData {
                pid: rand::random(),
                secret: rand::random(),
            },
        )
        .await?;
        write_message(client, BackendMessage::ReadyForQuery).await?;
        Ok(())
    }

    /// Backend-reported parameters overlaid with the configured ones;
    /// configured values win on key collisions.
    fn merged_parameters(&self, upstream_params: &[(String, String)]) -> Vec<(String, String)> {
        let mut merged = upstream_params.to_vec();
        for (key, value) in &self.overlay_params {
            match merged.iter_mut().find(|(existing, _)| existing == key) {
                Some(entry) => entry.1 = value.clone(),
                None => merged.push((key.clone(), value.clone())),
            }
        }
        merged
    }

    async fn relay<C, B>(
        &mut self,
        client: &mut C,
        upstream: &mut B,
        client_buf: &mut BytesMut,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream_buf = [0u8; 8192];
        let mut terminated = false;
        while !terminated {
            loop {
                let msg = match self.framer.next_message(client_buf) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(err) => {
                        write_message(
                            client,
                            BackendMessage::protocol_violation(&err.to_string()),
                        )
                        .await
                        .ok();
                        return Err(err.into());
                    }
                };
                terminated = msg.is_termination();
                self.dispatch(msg, client, upstream).await?;
                if terminated {
                    break;
                }
            }
            if terminated {
                break;
            }

            enum Event {
                Client(usize),
                Upstream(usize),
                Idle,
            }
            let event = tokio::select! {
                read = client.read_buf(client_buf) => Event::Client(read?),
                read = upstream.read(&mut upstream_buf) => Event::Upstream(read?),
                _ = sleep(self.idle_timeout) => Event::Idle,
            };
            match event {
                Event::Client(0) => {
                    debug!(session = %self.ctx.session_id, "client closed connection");
                    break;
                }
                Event::Client(_) => {}
                Event::Upstream(0) => {
                    debug!(session = %self.ctx.session_id, "backend closed connection");
                    break;
                }
                Event::Upstream(n) => {
                    counter!("sqlgate_relayed_bytes_total").increment(n as u64);
                    client.write_all(&upstream_buf[..n]).await?;
                    client.flush().await?;
                }
                Event::Idle => {
                    warn!(session = %self.ctx.session_id, "idle timeout reached");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn dispatch<C, B>(&mut self, msg: Message, client: &mut C, upstream: &mut B) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        match &msg.body {
            MessageBody::Parse {
                statement_name,
                sql,
                param_type_oids,
            } => {
                self.tracker.on_parse(statement_name, sql, param_type_oids);
            }
            MessageBody::Bind {
                statement_name,
                param_format_codes,
                param_values,
                ..
            } => {
                if let Err(err) =
                    self.tracker
                        .on_bind(statement_name, param_format_codes, param_values)
                {
                    return self.reject_statement(client, statement_name, err).await;
                }
            }
            MessageBody::Execute { statement_name, .. } => {
                match self.tracker.on_execute(statement_name) {
                    Ok(statement) => {
                        let interpolated = statement.interpolate();
                        self.sink
                            .record_executed_statement(&self.ctx, &interpolated);
                        counter!("sqlgate_statements_audited_total").increment(1);
                    }
                    Err(err) => {
                        return self.reject_statement(client, statement_name, err).await;
                    }
                }
            }
            MessageBody::Query { sql } => {
                debug!(session = %self.ctx.session_id, sql, "relaying simple query");
            }
            _ => {}
        }
        upstream.write_all(&msg.to_bytes()).await?;
        upstream.flush().await?;
        Ok(())
    }

    async fn reject_statement<C>(
        &self,
        client: &mut C,
        statement_name: &str,
        err: ProtocolError,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        counter!("sqlgate_unknown_statements_total").increment(1);
        write_message(client, BackendMessage::unknown_statement(statement_name))
            .await
            .ok();
        Err(err.into())
    }
}

/// Read exactly one untagged pre-handshake packet. Reads no further than
/// the declared length so a TLS handshake can start cleanly right after an
/// SSL request.
pub async fn read_initial_packet<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Message> {
    let length = stream.read_i32().await?;
    if !(8..=MAX_STARTUP_LENGTH).contains(&length) {
        return Err(ProtocolError::InvalidLength(length).into());
    }
    let mut payload = vec![0u8; length as usize - 4];
    stream.read_exact(&mut payload).await?;
    Ok(decode_initial(length, &payload)?)
}
