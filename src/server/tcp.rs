//! TCP ingestion server
//!
//! One accept loop per configured protocol endpoint: RESP framing on the
//! primary endpoint and OpenTSDB telnet on the secondary one. Every
//! accepted connection gets its own engine session and a parser chosen by
//! the endpoint it came in on.
//!
//! Error containment follows the protocol shape: a RESP stream carries
//! parser state across lines, so any error closes the connection; telnet
//! lines are independent, so a bad line is logged and the connection
//! lives on.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::protocol::{IngestError, RespParser, TelnetParser};
use crate::query::QueryProcessor;
use crate::signal::SignalHandler;
use crate::storage::Connection;
use crate::types::{ProtocolEndpoint, ServerSettings};

use super::{IngestionMetrics, Server};

const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolKind {
    Resp,
    OpenTsdb,
}

/// Registry factory for `"TCP"` settings.
pub(super) fn build(
    con: Arc<Connection>,
    _qproc: Arc<QueryProcessor>,
    settings: &ServerSettings,
) -> Result<Arc<dyn Server>> {
    if settings.protocols.is_empty() {
        bail!("invalid TCP server settings: no protocol endpoints");
    }
    for protocol in &settings.protocols {
        if protocol_kind(&protocol.name).is_none() {
            bail!(
                "invalid TCP server settings: unknown protocol `{}`",
                protocol.name
            );
        }
    }
    Ok(Arc::new(TcpServer::new(con, settings.protocols.clone())))
}

fn protocol_kind(name: &str) -> Option<ProtocolKind> {
    match name {
        "RESP" => Some(ProtocolKind::Resp),
        "OpenTSDB" => Some(ProtocolKind::OpenTsdb),
        _ => None,
    }
}

pub struct TcpServer {
    inner: Arc<Inner>,
}

struct Inner {
    con: Arc<Connection>,
    protocols: Vec<ProtocolEndpoint>,
    shutdown: broadcast::Sender<()>,
    local_addrs: Mutex<Vec<(String, SocketAddr)>>,
    metrics: IngestionMetrics,
}

impl TcpServer {
    pub fn new(con: Arc<Connection>, protocols: Vec<ProtocolEndpoint>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                con,
                protocols,
                shutdown,
                local_addrs: Mutex::new(Vec::new()),
                metrics: IngestionMetrics::default(),
            }),
        }
    }

    /// Bound endpoints by protocol name (available after `start`).
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.inner.local_addrs.lock().clone()
    }
}

#[async_trait]
impl Server for TcpServer {
    async fn start(&self, sig: &mut SignalHandler, id: u32) -> Result<()> {
        let stopper = self.inner.clone();
        sig.add_action(id, move || stopper.stop());

        for protocol in &self.inner.protocols {
            let Some(kind) = protocol_kind(&protocol.name) else {
                bail!("unknown TCP protocol `{}`", protocol.name);
            };
            let listener = TcpListener::bind(protocol.addr)
                .await
                .with_context(|| format!("can't bind TCP socket {}", protocol.addr))?;
            let local = listener.local_addr()?;
            self.inner
                .local_addrs
                .lock()
                .push((protocol.name.clone(), local));
            info!("TCP listener started, protocol: {}, endpoint: {}", protocol.name, local);

            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.accept_loop(listener, kind).await;
            });
        }
        Ok(())
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

impl Inner {
    fn stop(&self) {
        // No receivers just means everything has already wound down
        let _ = self.shutdown.send(());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, kind: ProtocolKind) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted {:?} connection from {}", kind, peer);
                        let inner = self.clone();
                        tokio::spawn(async move {
                            inner.handle_connection(stream, kind).await;
                        });
                    }
                    Err(err) => error!("accept error: {}", err),
                },
                _ = shutdown.recv() => {
                    info!("TCP listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, kind: ProtocolKind) {
        let session = self.con.create_session();
        match kind {
            ProtocolKind::Resp => self.resp_connection(stream, &session).await,
            ProtocolKind::OpenTsdb => self.telnet_connection(stream, &session).await,
        }
    }

    async fn resp_connection(&self, mut stream: TcpStream, session: &crate::storage::Session) {
        let mut shutdown = self.shutdown.subscribe();
        let mut parser = RespParser::new(session);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = tokio::select! {
                read = stream.read(&mut buf) => read,
                _ = shutdown.recv() => break,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    self.metrics.record(1, n as u64);
                    if let Err(err) = parser.parse_next(&buf[..n]) {
                        let message = match &err {
                            IngestError::Parse(err) => err.to_string(),
                            IngestError::Database(err) => err.to_string(),
                        };
                        error!("closing RESP connection: {}", message);
                        let _ = stream
                            .write_all(format!("-ERR {}\r\n", message).as_bytes())
                            .await;
                        break;
                    }
                }
                Err(err) => {
                    error!("RESP connection read error: {}", err);
                    break;
                }
            }
        }
    }

    async fn telnet_connection(&self, mut stream: TcpStream, session: &crate::storage::Session) {
        let mut shutdown = self.shutdown.subscribe();
        let mut parser = TelnetParser::new(session);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = tokio::select! {
                read = stream.read(&mut buf) => read,
                _ = shutdown.recv() => break,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    self.metrics.record(1, n as u64);
                    // Telnet lines are independent; keep the connection
                    if let Err(err) = parser.parse_next(&buf[..n]) {
                        match err {
                            IngestError::Parse(err) => error!("dropping line: {}", err),
                            IngestError::Database(err) => error!("dropping line: {}", err),
                        }
                    }
                }
                Err(err) => {
                    error!("OpenTSDB connection read error: {}", err);
                    break;
                }
            }
        }
    }
}
