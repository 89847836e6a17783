use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use sqlgate_protocol::messages::MessageBody;

use crate::audit::{AuditSink, NullAuditSink, SessionContext, TracingAuditSink};
use crate::config::Config;
use crate::session::{read_initial_packet, Session};
use crate::upstream;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    let metrics_addr = config.metrics.listen_addr.clone();
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route(
                "/metrics",
                axum::routing::get(move || {
                    let handle = metrics_handle.clone();
                    async move { handle.render() }
                }),
            )
            .route("/health", axum::routing::get(|| async { "ok" }))
            .route("/ready", axum::routing::get(|| async { "ok" }));
        match TcpListener::bind(&metrics_addr).await {
            Ok(listener) => {
                let _ = axum::serve(listener, app).await;
            }
            Err(err) => error!("metrics listener error: {err}"),
        }
    });

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!("sqlgate listening on {}", config.server.listen_addr);

    let tls_acceptor = if config.tls.enabled {
        Some(build_tls_acceptor(&config)?)
    } else {
        None
    };
    let config = Arc::new(config);
    let limiter = Arc::new(Semaphore::new(config.server.max_connections));
    loop {
        let (socket, peer) = listener.accept().await?;
        let permit = limiter.clone().acquire_owned().await?;
        let config = config.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            counter!("sqlgate_sessions_total").increment(1);
            if let Err(err) = handle_connection(socket, peer, config, tls_acceptor).await {
                counter!("sqlgate_session_errors_total").increment(1);
                error!(%peer, "session error: {err:#}");
            }
            drop(permit);
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    tls_acceptor: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
    // The backend connection comes first: if the real server is unreachable
    // the client sees a plain connection failure, never a half-finished
    // authentication.
    let upstream = upstream::connect(&config.backend, config.backend_database()).await?;

    let sink: Arc<dyn AuditSink> = if config.audit.enabled {
        Arc::new(TracingAuditSink)
    } else {
        Arc::new(NullAuditSink)
    };
    let ctx = SessionContext::new(&config.proxy_auth.username, &peer.to_string());
    info!(session = %ctx.session_id, %peer, "client connected");

    // The idle timeout bounds the pre-session phases too; a silent client
    // must not pin a semaphore permit and a backend connection.
    let handshake_timeout = Duration::from_secs(config.server.idle_timeout_secs);
    let initial = match timeout(handshake_timeout, read_initial_packet(&mut socket)).await {
        Ok(packet) => packet?,
        Err(_) => bail!("client sent no startup packet before timeout"),
    };
    match initial.body {
        MessageBody::SslRequest => {
            socket
                .write_all(&[ssl_response(tls_acceptor.is_some())])
                .await?;
            socket.flush().await?;
            match tls_acceptor {
                Some(acceptor) => {
                    let tls_stream = match timeout(handshake_timeout, acceptor.accept(socket)).await
                    {
                        Ok(stream) => stream?,
                        Err(_) => bail!("tls handshake timed out"),
                    };
                    Session::new(&config, ctx, sink)
                        .run(tls_stream, upstream, None)
                        .await
                }
                None => Session::new(&config, ctx, sink).run(socket, upstream, None).await,
            }
        }
        MessageBody::Startup { params } => {
            Session::new(&config, ctx, sink)
                .run(socket, upstream, Some(params))
                .await
        }
        MessageBody::CancelRequest { pid, .. } => {
            warn!(pid, "cancel request not supported; dropping connection");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The SSL request answer is a single byte, never a framed message.
fn ssl_response(tls_configured: bool) -> u8 {
    if tls_configured {
        b'S'
    } else {
        b'N'
    }
}

fn build_tls_acceptor(config: &Config) -> anyhow::Result<TlsAcceptor> {
    let cert_path = config
        .tls
        .cert_path
        .clone()
        .context("missing tls cert_path")?;
    let key_path = config.tls.key_path.clone().context("missing tls key_path")?;
    let cert_file = &mut BufReader::new(File::open(&cert_path)?);
    let key_file = &mut BufReader::new(File::open(&key_path)?);
    let cert_chain = rustls_pemfile::certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(key_file)?
        .with_context(|| format!("no private key found in {key_path}"))?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
