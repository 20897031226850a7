//! WebSocket Sync Server
//!
//! Async WebSocket server that keeps every connected client's view of the
//! canvas in step. Handles login, placements, chat, presence and the
//! background loops (regeneration, heartbeat, persistence).
//!
//! ## Lock order
//!
//! `canvas` → `chat` → `limiter` → registry; any subset, always in that
//! order. Points updates are enqueued under the limiter mutex so they leave
//! in the order balances changed. Fan-out only enqueues (`try_send`), so no
//! guard is ever held across socket I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::canvas::chat::ChatLog;
use crate::canvas::limiter::{ConsumeOutcome, RateLimiter};
use crate::canvas::store::{CanvasStore, Cell};
use crate::config::ServerConfig;
use crate::core::hash::short_hex;
use crate::core::identity::Identity;
use crate::network::accounts::{refresh_from_file, AccountError, AccountStore};
use crate::network::protocol::{
    wait_secs, ClientMessage, ErrorCode, InitInfo, PixelChunk, PixelUpdate, PlaceFailure,
    PlaceRequest, ServerError, ServerMessage,
};
use crate::network::registry::{BroadcastReport, ConnectionId, ConnectionRegistry, Outbound};
use crate::persist::{CanvasSnapshot, PersistError, PlacementJournal, PlacementRecord, SnapshotStore};

/// How long a closing connection's writer gets to drain its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sync server errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Snapshot or journal failure at startup.
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Admission counter for live sockets, taken before the handshake.
#[derive(Debug)]
struct ConnectionSlots {
    used: AtomicUsize,
    max: usize,
}

/// One reserved slot; released on drop.
#[derive(Debug)]
struct SlotGuard(Arc<ConnectionSlots>);

impl ConnectionSlots {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicUsize::new(0),
            max,
        })
    }

    fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| (used < self.max).then_some(used + 1))
            .ok()
            .map(|_| SlotGuard(self.clone()))
    }

    fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.used.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The sync server.
///
/// Every field is a shared handle, so clones drive the same state.
#[derive(Clone)]
pub struct SyncServer {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// Authoritative canvas.
    canvas: Arc<RwLock<CanvasStore>>,
    /// Point balances.
    limiter: Arc<Mutex<RateLimiter>>,
    /// Chat history.
    chat: Arc<RwLock<ChatLog>>,
    /// Live connections.
    registry: Arc<ConnectionRegistry>,
    /// Socket admission, capped at `max_connections`.
    slots: Arc<ConnectionSlots>,
    /// Known identities.
    accounts: Arc<dyn AccountStore>,
    /// Snapshot file, when persistence is enabled.
    snapshots: Option<SnapshotStore>,
    /// Placement history, when persistence is enabled.
    journal: Option<PlacementJournal>,
    /// Canvas revision and chat counter at the last saved snapshot.
    saved_marker: Arc<Mutex<Option<(u64, u64)>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create an in-memory server.
    pub fn new(config: ServerConfig, accounts: Arc<dyn AccountStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            canvas: Arc::new(RwLock::new(CanvasStore::new(config.canvas))),
            limiter: Arc::new(Mutex::new(RateLimiter::new(config.limits))),
            chat: Arc::new(RwLock::new(ChatLog::new(config.chat))),
            registry: Arc::new(ConnectionRegistry::new(config.outbound_queue)),
            slots: ConnectionSlots::new(config.max_connections),
            accounts,
            snapshots: None,
            journal: None,
            saved_marker: Arc::new(Mutex::new(None)),
            shutdown_tx,
            config: Arc::new(config),
        }
    }

    /// Create a server, restoring the last snapshot and opening the journal
    /// when a data directory is configured.
    ///
    /// A corrupt snapshot is moved aside and the server starts empty.
    pub async fn open(config: ServerConfig, accounts: Arc<dyn AccountStore>) -> Result<Self, SyncServerError> {
        let snapshot_path = config.persistence.snapshot_path();
        let journal_path = config.persistence.journal_path();
        let mut server = Self::new(config, accounts);

        if let Some(path) = snapshot_path {
            let store = SnapshotStore::new(path);
            match store.load() {
                Ok(Some(snapshot)) => {
                    let mut canvas = server.canvas.write().await;
                    let mut chat = server.chat.write().await;
                    let skipped = snapshot.restore_into(&mut canvas, &mut chat);
                    if skipped > 0 {
                        warn!("Dropped {} snapshot cells outside the current canvas", skipped);
                    }
                    info!(
                        "Restored {} cells and {} chat messages (digest {})",
                        canvas.len(),
                        chat.len(),
                        short_hex(&canvas.digest())
                    );
                }
                Ok(None) => info!("No snapshot at {}, starting empty", store.path().display()),
                Err(PersistError::Corrupted { .. }) => warn!("Starting with an empty canvas"),
                Err(e) => return Err(e.into()),
            }
            server.snapshots = Some(store);
        }

        if let Some(path) = journal_path {
            // The writer stops by itself once every journal handle is gone.
            let (journal, _writer) = PlacementJournal::open(path).await?;
            server.journal = Some(journal);
        }

        let marker = server.change_marker().await;
        *server.saved_marker.lock().await = Some(marker);

        Ok(server)
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Register a connection and queue its `init`.
    ///
    /// `resume` is the identity from the connection URL; it is bound only
    /// if the account exists. The canvas and chat read guards are held
    /// while registering so no broadcast can land ahead of `init` or be
    /// missing from it.
    pub async fn connect(
        &self,
        addr: Option<SocketAddr>,
        resume: Option<&str>,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let resumed = resume
            .and_then(|name| Identity::new(name).ok())
            .filter(|identity| self.accounts.contains(identity));
        let canvas = self.canvas.read().await;
        let chat = self.chat.read().await;
        let mut limiter = self.limiter.lock().await;
        let points = resumed
            .as_ref()
            .map(|identity| limiter.points(identity, Instant::now()));

        let (id, rx) = self.registry.register(addr).await;
        let mut online_changed = false;
        if let Some(identity) = &resumed {
            if let Ok(outcome) = self.registry.bind(id, identity.clone()).await {
                online_changed = outcome.online_changed;
            }
        }

        let config = canvas.config();
        let init = InitInfo {
            width: config.width,
            height: config.height,
            chunk_size: config.chunk_size,
            pixels: canvas.chunks().map(PixelChunk::from).collect(),
            chat: chat.recent(chat.retention()),
            identity: resumed.as_ref().map(|i| i.as_str().to_string()),
            points,
            online: self.registry.active_identity_count().await,
        };
        self.registry.send_to(id, &ServerMessage::Init(init)).await;

        drop(limiter);
        drop(chat);
        drop(canvas);

        match &resumed {
            Some(identity) => info!("Connection {} resumed as {}", id, identity),
            None => debug!("Connection {} joined", id),
        }
        if online_changed {
            self.broadcast_presence().await;
        }

        (id, rx)
    }

    /// Remove a connection. Idempotent; evicted connections are already gone.
    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some(gone) = self.registry.unregister(id).await {
            debug!(
                "Connection {} ({}, {}) left after {:?}",
                id,
                gone.identity.as_ref().map(Identity::as_str).unwrap_or("anonymous"),
                gone.addr.map(|addr| addr.to_string()).unwrap_or_else(|| "local".to_string()),
                gone.lifetime
            );
            if gone.online_changed {
                self.broadcast_presence().await;
            }
        }
    }

    // =========================================================================
    // MESSAGE HANDLING
    // =========================================================================

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle_message(id, msg).await,
            Err(e) => {
                debug!("Invalid message from {}: {}", id, e);
                self.send_error(id, ErrorCode::InvalidMessage, "Invalid message format").await;
            }
        }
    }

    /// Handle a client message.
    pub async fn handle_message(&self, id: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Login { identity } => self.handle_login(id, &identity).await,
            ClientMessage::Whoami => self.handle_whoami(id).await,
            ClientMessage::Place(req) => self.handle_place(id, req).await,
            ClientMessage::Chat { text } => self.handle_chat(id, &text).await,
            ClientMessage::Ping { timestamp } => {
                self.registry
                    .send_to(id, &ServerMessage::Pong {
                        timestamp,
                        server_time: now_millis(),
                    })
                    .await;
            }
        }
    }

    /// Handle login.
    async fn handle_login(&self, id: ConnectionId, name: &str) {
        let identity = match Identity::new(name) {
            Ok(identity) => identity,
            Err(e) => {
                self.send_login_failed(id, e.to_string()).await;
                return;
            }
        };

        if !self.accounts.contains(&identity) {
            debug!("Login from {} refused: unknown identity {}", id, identity);
            self.send_login_failed(id, "unknown identity".to_string()).await;
            return;
        }

        let outcome = match self.registry.bind(id, identity.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Login on closed connection: {}", e);
                return;
            }
        };

        {
            let mut limiter = self.limiter.lock().await;
            let points = limiter.points(&identity, Instant::now());
            self.registry
                .send_to(id, &ServerMessage::LoginSuccess {
                    identity: identity.as_str().to_string(),
                    points,
                })
                .await;
        }

        match &outcome.previous {
            Some(previous) => info!("Connection {} switched from {} to {}", id, previous, identity),
            None => info!("Connection {} logged in as {}", id, identity),
        }
        if outcome.online_changed {
            self.broadcast_presence().await;
        }
    }

    /// Handle whoami.
    async fn handle_whoami(&self, id: ConnectionId) {
        let identity = self.registry.identity_of(id).await;
        let mut limiter = self.limiter.lock().await;
        let points = identity
            .as_ref()
            .map(|identity| limiter.points(identity, Instant::now()));
        let online = self.registry.active_identity_count().await;

        self.registry
            .send_to(id, &ServerMessage::Whoami {
                identity: identity.map(|i| i.as_str().to_string()),
                points,
                online,
            })
            .await;
    }

    /// Handle a placement.
    async fn handle_place(&self, id: ConnectionId, req: PlaceRequest) {
        let Some(identity) = self.registry.identity_of(id).await else {
            self.send_place_failed(id, PlaceFailure::not_logged_in()).await;
            return;
        };

        // Consume, apply and enqueue under the canvas write guard so pixel
        // and points fan-out both follow apply order.
        let mut canvas = self.canvas.write().await;
        let (coord, color) = match canvas.validate(req.x, req.y, &req.color) {
            Ok(valid) => valid,
            Err(e) => {
                drop(canvas);
                self.send_place_failed(id, PlaceFailure::invalid(e.to_string())).await;
                return;
            }
        };

        let mut limiter = self.limiter.lock().await;
        let (points, cooldown) = match limiter.try_consume(&identity, Instant::now()) {
            ConsumeOutcome::Accepted { points, cooldown } => (points, cooldown),
            ConsumeOutcome::Rejected { wait } => {
                drop(limiter);
                drop(canvas);
                debug!("{} is cooling down for {:?}", identity, wait);
                self.send_place_failed(id, PlaceFailure::cooldown(wait)).await;
                return;
            }
        };

        canvas.apply(coord, color);
        let pixel = PixelUpdate::from(Cell {
            x: coord.x,
            y: coord.y,
            color,
        });
        let report = self.registry.broadcast(&ServerMessage::Pixel(pixel), None).await;

        self.registry
            .send_to_identity(&identity, &ServerMessage::PointsUpdate { points })
            .await;
        if let Some(cooldown) = cooldown {
            self.registry
                .send_to_identity(&identity, &ServerMessage::CooldownStarted {
                    wait: wait_secs(cooldown),
                })
                .await;
        }
        drop(limiter);
        drop(canvas);

        if let Some(journal) = &self.journal {
            journal.record(PlacementRecord {
                x: coord.x,
                y: coord.y,
                color,
                identity: identity.clone(),
                timestamp: Utc::now(),
            });
        }

        self.after_broadcast(report).await;
    }

    /// Handle chat.
    async fn handle_chat(&self, id: ConnectionId, text: &str) {
        let author = self.registry.identity_of(id).await;
        if author.is_none() && !self.config.allow_anonymous_chat {
            self.send_error(id, ErrorCode::NotLoggedIn, "Log in to chat").await;
            return;
        }

        let report = {
            let mut chat = self.chat.write().await;
            match chat.append(author, text, Utc::now()) {
                Ok(message) => self.registry.broadcast(&ServerMessage::Chat(message), None).await,
                Err(e) => {
                    drop(chat);
                    self.send_error(id, ErrorCode::InvalidChat, &e.to_string()).await;
                    return;
                }
            }
        };

        self.after_broadcast(report).await;
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    async fn broadcast_presence(&self) {
        let online = self.registry.active_identity_count().await;
        let report = self.registry.broadcast(&ServerMessage::Presence { online }, None).await;
        if report.online_changed {
            // Evictions during a presence broadcast are reported on the next change.
            debug!("{} connections evicted during presence broadcast", report.evicted.len());
        }
    }

    async fn after_broadcast(&self, report: BroadcastReport) {
        if !report.evicted.is_empty() {
            warn!("Evicted {} slow connections", report.evicted.len());
        }
        if report.online_changed {
            self.broadcast_presence().await;
        }
    }

    async fn send_error(&self, id: ConnectionId, code: ErrorCode, message: &str) {
        self.registry
            .send_to(id, &ServerMessage::Error(ServerError {
                code,
                message: message.to_string(),
            }))
            .await;
    }

    async fn send_place_failed(&self, id: ConnectionId, failure: PlaceFailure) {
        self.registry.send_to(id, &ServerMessage::PlaceFailed(failure)).await;
    }

    async fn send_login_failed(&self, id: ConnectionId, reason: String) {
        self.registry.send_to(id, &ServerMessage::LoginFailed { reason }).await;
    }

    // =========================================================================
    // PERIODIC WORK
    // =========================================================================

    /// Regenerate due balances and notify the affected identities.
    ///
    /// Returns how many identities changed.
    pub async fn regenerate(&self, now: Instant) -> usize {
        let mut limiter = self.limiter.lock().await;
        let changed = limiter.regenerate(now);
        for (identity, points) in &changed {
            debug!("{} regenerated to {} points", identity, points);
            self.registry
                .send_to_identity(identity, &ServerMessage::PointsUpdate { points: *points })
                .await;
        }
        changed.len()
    }

    /// Drop connections idle past the timeout, then ping the rest.
    pub async fn heartbeat(&self) {
        let mut online_changed = false;
        for id in self.registry.idle_connections(self.config.idle_timeout).await {
            if let Some(gone) = self.registry.evict(id).await {
                info!("Dropped idle connection {}", id);
                online_changed |= gone.online_changed;
            }
        }

        let report = self.registry.ping_all().await;
        if online_changed || report.online_changed {
            self.broadcast_presence().await;
        }
    }

    /// Register identities added to the accounts file since the last read.
    ///
    /// Returns how many were added; zero when no accounts file is configured.
    pub async fn reload_accounts(&self) -> Result<usize, AccountError> {
        match self.config.accounts_file.as_deref() {
            Some(path) => refresh_from_file(&*self.accounts, path).await,
            None => Ok(0),
        }
    }

    /// Save a snapshot if the canvas or chat changed since the last one.
    ///
    /// Returns whether a snapshot was written.
    pub async fn flush(&self) -> Result<bool, PersistError> {
        let Some(store) = self.snapshots.clone() else {
            return Ok(false);
        };

        let mut saved = self.saved_marker.lock().await;
        let (snapshot, marker) = {
            let canvas = self.canvas.read().await;
            let chat = self.chat.read().await;
            let marker = (canvas.revision(), chat.appended());
            if *saved == Some(marker) {
                return Ok(false);
            }
            (CanvasSnapshot::capture(&canvas, &chat), marker)
        };

        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| PersistError::Io(std::io::Error::other(e)))??;
        *saved = Some(marker);
        Ok(true)
    }

    async fn change_marker(&self) -> (u64, u64) {
        let revision = self.canvas.read().await.revision();
        let appended = self.chat.read().await.appended();
        (revision, appended)
    }

    // =========================================================================
    // TRANSPORT
    // =========================================================================

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, SyncServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Canvas server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), SyncServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until [`SyncServer::shutdown`].
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncServerError> {
        let background = vec![
            tokio::spawn(self.clone().run_regeneration_loop()),
            tokio::spawn(self.clone().run_heartbeat_loop()),
            tokio::spawn(self.clone().run_flush_loop()),
            tokio::spawn(self.clone().run_accounts_loop()),
        ];

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        for task in background {
            task.abort();
        }

        self.finish().await;
        Ok(())
    }

    /// Final flush of snapshot and journal.
    async fn finish(&self) {
        match self.flush().await {
            Ok(true) => info!("Final snapshot saved"),
            Ok(false) => {}
            Err(e) => error!("Final snapshot failed: {}", e),
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.flush().await {
                warn!("Journal flush on shutdown failed: {}", e);
            }
        }
        info!("Canvas digest at shutdown: {}", short_hex(&self.canvas.read().await.digest()));
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // Reserved before the handshake so concurrent accepts cannot overshoot.
        let slot = self.slots.try_acquire();

        tokio::spawn(async move {
            let mut resume: Option<String> = None;
            let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                resume = req.uri().query().and_then(|q| query_param(q, "identity"));
                Ok(resp)
            };

            let ws_stream = match accept_hdr_async(stream, capture).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            let Some(_slot) = slot else {
                warn!("Connection limit reached, rejecting {}", addr);
                let refusal = ServerMessage::Error(ServerError {
                    code: ErrorCode::ServerOverloaded,
                    message: "Server is full".to_string(),
                });
                if let Ok(text) = refusal.to_json() {
                    let _ = ws_sender.send(Message::Text(text)).await;
                }
                let _ = ws_sender.close().await;
                return;
            };

            let (id, outbound) = server.connect(Some(addr), resume.as_deref()).await;
            info!("Connection {} from {} ({} open)", id, addr, server.slots.in_use());

            let mut writer = tokio::spawn(Self::run_writer(ws_sender, outbound));
            let mut writer_done = false;

            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                #[cfg(feature = "debug-tracing")]
                                debug!("<- {}: {}", id, text);
                                server.registry.touch(id).await;
                                server.handle_text(id, &text).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                server.registry.touch(id).await;
                                debug!("Ignoring binary frame from {}", id);
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                server.registry.touch(id).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", id);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", id, e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = &mut writer => {
                        // Queue closed by eviction or the socket stopped accepting writes.
                        writer_done = true;
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        server.registry.send_to(id, &ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            server.disconnect(id).await;
            if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }

            info!("Connection {} from {} cleaned up", id, addr);
        });
    }

    /// Drain a connection's queue into its socket.
    async fn run_writer(
        mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        while let Some(item) = outbound.recv().await {
            let frame = match item {
                Outbound::Text(text) => Message::Text(text.to_string()),
                Outbound::Ping => Message::Ping(Vec::new()),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    }

    /// Regeneration tick loop.
    async fn run_regeneration_loop(self) {
        let mut ticker = interval(crate::REGEN_TICK);
        loop {
            ticker.tick().await;
            self.regenerate(Instant::now()).await;
        }
    }

    /// Heartbeat and idle reaping loop.
    async fn run_heartbeat_loop(self) {
        let mut ticker = interval(self.config.heartbeat_interval);
        // The first tick fires immediately; nothing can be idle yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.heartbeat().await;
        }
    }

    /// Accounts file refresh loop.
    async fn run_accounts_loop(self) {
        if self.config.accounts_file.is_none() {
            return;
        }
        let mut ticker = interval(self.config.accounts_reload);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.reload_accounts().await {
                warn!("Accounts refresh failed, keeping current accounts: {}", e);
            }
        }
    }

    /// Periodic snapshot loop.
    async fn run_flush_loop(self) {
        if self.snapshots.is_none() {
            return;
        }
        let mut ticker = interval(self.config.persistence.flush_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush().await {
                warn!("Snapshot flush failed, continuing from memory: {}", e);
            }
        }
    }

    // =========================================================================
    // CONTROL & INTROSPECTION
    // =========================================================================

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Shared canvas handle.
    pub fn canvas(&self) -> Arc<RwLock<CanvasStore>> {
        self.canvas.clone()
    }

    /// Shared chat handle.
    pub fn chat(&self) -> Arc<RwLock<ChatLog>> {
        self.chat.clone()
    }

    /// Distinct identities online.
    pub async fn online_count(&self) -> usize {
        self.registry.active_identity_count().await
    }

    /// Get connection count.
    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    /// Current balance of an identity.
    pub async fn points(&self, identity: &Identity) -> u32 {
        self.limiter.lock().await.points(identity, Instant::now())
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Extract and percent-decode one query parameter.
fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, value)| percent_decode(value))
        .filter(|value| !value.is_empty())
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::accounts::MemoryAccounts;

    fn accounts(names: &[&str]) -> Arc<dyn AccountStore> {
        Arc::new(MemoryAccounts::with_identities(
            names.iter().map(|n| Identity::new(n).unwrap()),
        ))
    }

    fn small_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.canvas.width = 100;
        config.canvas.height = 100;
        config.canvas.chunk_size = 10;
        config
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Some(msg) = item.decode() {
                out.push(msg);
            }
        }
        out
    }

    fn place(x: i64, y: i64, color: &str) -> ClientMessage {
        ClientMessage::Place(PlaceRequest {
            x,
            y,
            color: color.to_string(),
        })
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("identity=alice", "identity"), Some("alice".into()));
        assert_eq!(query_param("a=1&identity=b%20ob", "identity"), Some("b ob".into()));
        assert_eq!(query_param("identity=", "identity"), None);
        assert_eq!(query_param("other=x", "identity"), None);
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[tokio::test]
    async fn test_connect_sends_init_first() {
        let server = SyncServer::new(small_config(), accounts(&["alice"]));
        server.canvas.write().await.set(15, 3, "#abc").unwrap();

        let (_, mut rx) = server.connect(None, Some("alice")).await;
        let messages = drain(&mut rx);

        match &messages[0] {
            ServerMessage::Init(init) => {
                assert_eq!((init.width, init.height, init.chunk_size), (100, 100, 10));
                assert_eq!(init.pixels.len(), 1);
                assert_eq!((init.pixels[0].cx, init.pixels[0].cy), (1, 0));
                assert_eq!(init.pixels[0].cells[0].color, "#aabbcc");
                assert_eq!(init.identity.as_deref(), Some("alice"));
                assert_eq!(init.points, Some(6));
                assert_eq!(init.online, 1);
            }
            other => panic!("expected init, got {:?}", other),
        }
        assert_eq!(messages[1], ServerMessage::Presence { online: 1 });
    }

    #[tokio::test]
    async fn test_unknown_resume_identity_ignored() {
        let server = SyncServer::new(small_config(), accounts(&["alice"]));
        let (id, mut rx) = server.connect(None, Some("mallory")).await;

        match &drain(&mut rx)[0] {
            ServerMessage::Init(init) => {
                assert!(init.identity.is_none());
                assert!(init.points.is_none());
            }
            other => panic!("expected init, got {:?}", other),
        }
        assert!(server.registry.identity_of(id).await.is_none());
    }

    #[tokio::test]
    async fn test_place_requires_login() {
        let server = SyncServer::new(small_config(), accounts(&["alice"]));
        let (id, mut rx) = server.connect(None, None).await;
        drain(&mut rx);

        server.handle_message(id, place(1, 1, "#fff")).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::PlaceFailed(PlaceFailure::not_logged_in())]
        );
        assert!(server.canvas.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_placement_spends_nothing() {
        let server = SyncServer::new(small_config(), accounts(&["alice"]));
        let (id, mut rx) = server.connect(None, Some("alice")).await;
        drain(&mut rx);

        server.handle_message(id, place(100, 0, "#fff")).await;
        server.handle_message(id, place(0, 0, "notacolor")).await;
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        for message in messages {
            match message {
                ServerMessage::PlaceFailed(failure) => {
                    assert_eq!(failure.reason, crate::network::protocol::PlaceFailReason::Invalid);
                    assert!(failure.detail.is_some());
                }
                other => panic!("expected place_failed, got {:?}", other),
            }
        }
        assert_eq!(server.points(&Identity::new("alice").unwrap()).await, 6);
    }

    #[tokio::test]
    async fn test_login_flow() {
        let server = SyncServer::new(small_config(), accounts(&["alice"]));
        let (watcher, mut watcher_rx) = server.connect(None, None).await;
        let (id, mut rx) = server.connect(None, None).await;
        drain(&mut watcher_rx);
        drain(&mut rx);

        server.handle_message(id, ClientMessage::Login { identity: "nobody".into() }).await;
        assert!(matches!(drain(&mut rx)[..], [ServerMessage::LoginFailed { .. }]));

        server.handle_message(id, ClientMessage::Login { identity: "alice".into() }).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::LoginSuccess {
                    identity: "alice".into(),
                    points: 6
                },
                ServerMessage::Presence { online: 1 },
            ]
        );
        assert_eq!(drain(&mut watcher_rx), vec![ServerMessage::Presence { online: 1 }]);

        server.handle_message(id, ClientMessage::Whoami).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Whoami {
                identity: Some("alice".into()),
                points: Some(6),
                online: 1,
            }]
        );

        server.disconnect(id).await;
        assert_eq!(drain(&mut watcher_rx), vec![ServerMessage::Presence { online: 0 }]);
        server.disconnect(watcher).await;
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_connection() {
        let server = SyncServer::new(small_config(), accounts(&[]));
        let (id, mut rx) = server.connect(None, None).await;
        drain(&mut rx);

        server.handle_text(id, "{not json").await;
        match &drain(&mut rx)[..] {
            [ServerMessage::Error(err)] => assert_eq!(err.code, ErrorCode::InvalidMessage),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(server.registry.contains(id).await);

        server.handle_text(id, r#"{"type":"ping","timestamp":42}"#).await;
        assert!(matches!(drain(&mut rx)[..], [ServerMessage::Pong { timestamp: 42, .. }]));
    }

    #[tokio::test]
    async fn test_chat_anonymous_policy() {
        let mut config = small_config();
        config.allow_anonymous_chat = false;
        let server = SyncServer::new(config, accounts(&["carol"]));
        let (id, mut rx) = server.connect(None, None).await;
        drain(&mut rx);

        server.handle_message(id, ClientMessage::Chat { text: "hi".into() }).await;
        match &drain(&mut rx)[..] {
            [ServerMessage::Error(err)] => assert_eq!(err.code, ErrorCode::NotLoggedIn),
            other => panic!("expected error, got {:?}", other),
        }

        server.handle_message(id, ClientMessage::Login { identity: "carol".into() }).await;
        drain(&mut rx);
        server.handle_message(id, ClientMessage::Chat { text: "   ".into() }).await;
        match &drain(&mut rx)[..] {
            [ServerMessage::Error(err)] => assert_eq!(err.code, ErrorCode::InvalidChat),
            other => panic!("expected error, got {:?}", other),
        }

        server.handle_message(id, ClientMessage::Chat { text: " hello ".into() }).await;
        match &drain(&mut rx)[..] {
            [ServerMessage::Chat(message)] => {
                assert_eq!(message.text, "hello");
                assert_eq!(message.author, Some(Identity::new("carol").unwrap()));
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_regenerate_notifies_identity() {
        let mut config = small_config();
        config.limits.max_points = 1;
        let server = SyncServer::new(config, accounts(&["alice"]));
        let (id, mut rx) = server.connect(None, Some("alice")).await;
        drain(&mut rx);

        server.handle_message(id, place(0, 0, "#000")).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::Pixel(PixelUpdate {
                    x: 0,
                    y: 0,
                    color: "#000000".into()
                }),
                ServerMessage::PointsUpdate { points: 0 },
                ServerMessage::CooldownStarted { wait: 20 },
            ]
        );

        assert_eq!(server.regenerate(Instant::now()).await, 0);
        assert_eq!(server.regenerate(Instant::now() + Duration::from_secs(21)).await, 1);
        assert_eq!(drain(&mut rx), vec![ServerMessage::PointsUpdate { points: 1 }]);
    }

    #[tokio::test]
    async fn test_heartbeat_reaps_idle() {
        let mut config = small_config();
        config.idle_timeout = Duration::ZERO;
        let server = SyncServer::new(config, accounts(&["alice"]));
        let (id, _rx) = server.connect(None, Some("alice")).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        server.heartbeat().await;
        assert!(!server.registry.contains(id).await);
        assert_eq!(server.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_flush_without_persistence() {
        let server = SyncServer::new(small_config(), accounts(&[]));
        assert!(!server.flush().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_points_updates_follow_consume_order() {
        let server = SyncServer::new(small_config(), accounts(&["bob"]));
        let (a, mut rx_a) = server.connect(None, Some("bob")).await;
        let (b, mut rx_b) = server.connect(None, Some("bob")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let tasks: Vec<_> = (0..6i64)
            .map(|i| {
                let server = server.clone();
                let id = if i % 2 == 0 { a } else { b };
                tokio::spawn(async move { server.handle_message(id, place(i, i, "#123")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let expected: Vec<u32> = (0..6).rev().collect();
        for rx in [&mut rx_a, &mut rx_b] {
            let points: Vec<u32> = drain(rx)
                .into_iter()
                .filter_map(|message| match message {
                    ServerMessage::PointsUpdate { points } => Some(points),
                    _ => None,
                })
                .collect();
            assert_eq!(points, expected);
        }
        assert_eq!(server.points(&Identity::new("bob").unwrap()).await, 0);
    }

    #[tokio::test]
    async fn test_reload_accounts_enables_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.txt");
        std::fs::write(&path, "alice\n").unwrap();

        let mut config = small_config();
        config.accounts_file = Some(path.clone());
        let server = SyncServer::new(config, Arc::new(MemoryAccounts::load(&path).unwrap()));
        let (id, mut rx) = server.connect(None, None).await;
        drain(&mut rx);

        server.handle_message(id, ClientMessage::Login { identity: "dave".into() }).await;
        assert!(matches!(drain(&mut rx)[..], [ServerMessage::LoginFailed { .. }]));

        std::fs::write(&path, "alice\ndave\n").unwrap();
        assert_eq!(server.reload_accounts().await.unwrap(), 1);

        server.handle_message(id, ClientMessage::Login { identity: "dave".into() }).await;
        assert!(matches!(drain(&mut rx)[0], ServerMessage::LoginSuccess { points: 6, .. }));
    }

    #[tokio::test]
    async fn test_reload_without_accounts_file() {
        let server = SyncServer::new(small_config(), accounts(&["alice"]));
        assert_eq!(server.reload_accounts().await.unwrap(), 0);
    }

    #[test]
    fn test_connection_slots_cap() {
        let slots = ConnectionSlots::new(2);
        let first = slots.try_acquire().unwrap();
        let _second = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());

        drop(first);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn test_connection_slots_concurrent_acquire() {
        let slots = ConnectionSlots::new(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let slots = slots.clone();
                std::thread::spawn(move || slots.try_acquire())
            })
            .collect();
        let held: Vec<SlotGuard> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();

        assert_eq!(held.len(), 4);
        assert_eq!(slots.in_use(), 4);
        drop(held);
        assert_eq!(slots.in_use(), 0);
    }
}
