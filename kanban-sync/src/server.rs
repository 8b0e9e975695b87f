//! WebSocket server feeding the dispatcher.
//!
//! Architecture:
//! ```text
//! Client A ──┐  text frames   ┌────────────┐   atomic unit   ┌───────────┐
//!            ├──────────────► │ Dispatcher │ ──────────────► │ Store     │
//! Client B ──┘                └─────┬──────┘                 └───────────┘
//!      ▲                            │ events
//!      │                            ▼
//!      │      outbox (mpsc)   ┌────────────┐
//!      └───────────────────── │ Fanout     │ ── Registry (ConnectionId → Outbox)
//!                             └────────────┘
//! ```
//!
//! Each connection task registers an outbox, then selects over inbound
//! socket frames (dispatched one at a time, in arrival order) and outbound
//! frames from its outbox. The outbox is unregistered on every exit path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::COOKIE, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnectionId, ConnectionRegistry, Fanout, Outbox};
use crate::dispatcher::Dispatcher;
use crate::error::SyncError;
use crate::protocol::Event;
use crate::storage::{BoardStore, Store, StoreConfig, StoreError};
use crate::trust::TrustStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before deliveries to it are dropped
    pub outbox_capacity: usize,
    /// Board store directory used by [`KanbanServer::open`]
    pub storage_path: PathBuf,
    /// Reject upgrades without a trusted `trust` cookie
    pub require_trust: bool,
    /// Answer not-found failures with an `Error` event instead of only logging them
    pub report_not_found: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            storage_path: PathBuf::from("kanban_data"),
            require_trust: false,
            report_not_found: false,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Everything a connection task needs, cloned per connection.
#[derive(Clone)]
struct Session {
    config: ServerConfig,
    dispatcher: Dispatcher,
    trust: Arc<TrustStore>,
    stats: Arc<AtomicServerStats>,
}

/// The kanban sync server.
pub struct KanbanServer {
    session: Session,
}

impl KanbanServer {
    /// Create a server over an already opened store.
    pub fn new(config: ServerConfig, store: Arc<dyn Store>, trust: Arc<TrustStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(store, Fanout::new(registry));
        Self {
            session: Session {
                config,
                dispatcher,
                trust,
                stats: Arc::new(AtomicServerStats::default()),
            },
        }
    }

    /// Open the RocksDB store at `config.storage_path` and create the server.
    pub fn open(config: ServerConfig, trust: Arc<TrustStore>) -> Result<Self, ServerError> {
        let store = BoardStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?;
        Ok(Self::new(config, Arc::new(store), trust))
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.session.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Kanban server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, session).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        session: Session,
    ) -> Result<(), ServerError> {
        let mut admitted = true;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            if !session.config.require_trust || is_trusted(&session.trust, request) {
                return Ok(response);
            }
            admitted = false;
            Err(unauthorized())
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws_stream) => ws_stream,
            Err(_) if !admitted => {
                session.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected untrusted connection from {addr}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let registry = session.dispatcher.fanout().registry().clone();
        let (outbox, mut outbox_rx) = Outbox::channel(session.config.outbox_capacity);
        let connection = registry.register(outbox);

        session.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        session.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {connection} established from {addr}");

        let outcome = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                session.record_message(text.len());
                                let result = session.dispatcher.dispatch(connection, text.as_str());
                                session.settle(connection, result)?;
                            }

                            Some(Ok(Message::Binary(data))) => {
                                session.record_message(data.len());
                                let result = session.dispatcher.dispatch_bytes(connection, &data);
                                session.settle(connection, result)?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection} closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = outbox_rx.recv() => {
                        match frame {
                            Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                            None => {
                                // Evicted by the fanout after a missed frame.
                                log::warn!("Connection {connection} fell behind, closing");
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        registry.unregister(connection);
        session.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("Connection {connection} unregistered ({} live)", registry.len());

        outcome
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let stats = &self.session.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.session.config.bind_addr
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.session.dispatcher
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.session.trust
    }
}

impl Session {
    fn record_message(&self, bytes: usize) {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Decide what a failed command means for the connection.
    ///
    /// Protocol errors are reported to the sender, not-found errors are
    /// logged (and optionally reported), anything else ends the connection.
    fn settle(&self, connection: ConnectionId, result: Result<(), SyncError>) -> Result<(), SyncError> {
        let fanout = self.dispatcher.fanout();
        match result {
            Ok(()) => Ok(()),
            Err(SyncError::Protocol(e)) => {
                log::warn!("Bad frame from {connection}: {e}");
                fanout.send_to(connection, &Event::error(e.to_string()))?;
                Ok(())
            }
            Err(e @ SyncError::NotFound { .. }) => {
                log::warn!("Command from {connection} failed: {e}");
                if self.config.report_not_found {
                    fanout.send_to(connection, &Event::error(e.to_string()))?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether any `Cookie` header on the upgrade request carries a trusted token.
fn is_trusted(trust: &TrustStore, request: &Request) -> bool {
    request
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|header| trust.admits(Some(header)))
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("untrusted connection".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
