//! Registry, admission control, and deadline scheduling.
//!
//! [`SocketServer`] is the connection-lifecycle manager this crate is built
//! around. It owns the peer registry, gates how many connections may be open
//! at once by enabling/disabling its listeners, tracks the busy/idle state
//! of every connection, and expires connections that overstay an idle or
//! in-flight-request deadline.
//!
//! Protocol servers are built by subscribing to its lifecycle pipelines and
//! declaring busy/idle around their request handling:
//!
//! ```rust,ignore
//! use capstan_core::SocketServer;
//!
//! let server = SocketServer::new();
//! server.listen("127.0.0.1:8967").await?;
//! server.set_max_connections(1024);
//! server.set_idle_timeout(30.0);
//!
//! server.when_accepted().subscribe(move |conn| async move {
//!     // read a request via conn.transport(), then:
//!     // server.reserve(&conn); ... handle ...; server.release(&conn);
//!     Ok(())
//! });
//!
//! // An external timer drives expiry:
//! // every 50ms: server.inspect().await
//! ```
//!
//! Admission control is a counter check at two points (after an accept,
//! after a removal or ceiling change), O(1) per event with no polling. The
//! expiry sweep pops due deadline slots soonest-first and touches only the
//! connections that are due.

use crate::wheel::TimeoutWheel;
use crate::{
    Connect, ConnectFactory, DefaultConnectFactory, Error, Listener, Pipeline, ServerConfig,
    TcpAcceptor, TimeoutHandler, Transport,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Snapshot produced by every inspection sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InspectStats {
    /// Distinct expiry instants currently armed.
    pub slots: usize,
    /// Registered connections.
    pub peers: usize,
}

/// Connection registry with admission control and deadline scheduling.
pub struct SocketServer {
    peers: RwLock<HashMap<String, Arc<Connect>>>,
    listeners: RwLock<HashMap<String, Arc<dyn Listener>>>,
    factory: RwLock<Arc<dyn ConnectFactory>>,
    wheel: Mutex<TimeoutWheel>,
    max_connections: AtomicUsize,
    idle_timeout: Mutex<f64>,
    request_timeout: Mutex<f64>,
    disabled: AtomicBool,
    accepted: Pipeline<Arc<Connect>>,
    disconnected: Pipeline<Arc<Connect>>,
    idle_expired: Pipeline<Arc<Connect>>,
    request_expired: Pipeline<Arc<Connect>>,
    close: Pipeline<Arc<Connect>>,
    stats: Mutex<InspectStats>,
}

impl SocketServer {
    /// Create a server with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server from a configuration.
    pub fn with_config(config: ServerConfig) -> Arc<Self> {
        let max_connections = if config.max_connections < 0 {
            usize::MAX
        } else {
            config.max_connections as usize
        };
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            factory: RwLock::new(Arc::new(DefaultConnectFactory)),
            wheel: Mutex::new(TimeoutWheel::new()),
            max_connections: AtomicUsize::new(max_connections),
            idle_timeout: Mutex::new(config.idle_timeout),
            request_timeout: Mutex::new(config.request_timeout),
            disabled: AtomicBool::new(false),
            accepted: Pipeline::new(),
            disconnected: Pipeline::new(),
            idle_expired: Pipeline::new(),
            request_expired: Pipeline::new(),
            close: Pipeline::new(),
            stats: Mutex::new(InspectStats::default()),
        })
    }

    // ========================================================================
    // Lifecycle pipelines
    // ========================================================================

    /// Fired once per accepted connection, after it is registered and its
    /// idle timeout is armed.
    pub fn when_accepted(&self) -> &Pipeline<Arc<Connect>> {
        &self.accepted
    }

    /// Fired once per connection after it leaves the registry.
    pub fn when_disconnected(&self) -> &Pipeline<Arc<Connect>> {
        &self.disconnected
    }

    /// Fired when an idle connection overstays the idle timeout.
    pub fn when_idle_timeout(&self) -> &Pipeline<Arc<Connect>> {
        &self.idle_expired
    }

    /// Fired when a busy connection overstays the request timeout.
    pub fn when_request_timeout(&self) -> &Pipeline<Arc<Connect>> {
        &self.request_expired
    }

    /// Fired once per still-open connection when the server shuts down.
    pub fn when_close(&self) -> &Pipeline<Arc<Connect>> {
        &self.close
    }

    // ========================================================================
    // Listeners & admission
    // ========================================================================

    /// Bind a TCP listener on `addr` and feed its accepted connections into
    /// this server. Multiple listeners may feed one server.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<Arc<TcpAcceptor>, Error> {
        let acceptor = TcpAcceptor::bind(addr).await?;
        self.attach_listener(addr, acceptor.clone());
        Ok(acceptor)
    }

    /// Wire an already-built listener into this server.
    pub fn attach_listener(self: &Arc<Self>, name: &str, listener: Arc<dyn Listener>) {
        let weak = Arc::downgrade(self);
        listener.when_accepted().subscribe(move |transport| {
            let weak = weak.clone();
            async move {
                if let Some(server) = weak.upgrade() {
                    server.accept(transport).await;
                }
                Ok(())
            }
        });
        if self.disabled.load(Ordering::Acquire) {
            listener.disable();
        }
        self.listeners.write().insert(name.to_string(), listener);
    }

    /// Look up a listener by the name it was attached under.
    pub fn listener(&self, name: &str) -> Option<Arc<dyn Listener>> {
        self.listeners.read().get(name).cloned()
    }

    /// Resume accepting on every listener.
    pub fn enable(&self) {
        for listener in self.listeners.read().values() {
            listener.enable();
        }
        self.disabled.store(false, Ordering::Release);
    }

    /// Stop accepting on every listener. Existing connections are unaffected.
    pub fn disable(&self) {
        for listener in self.listeners.read().values() {
            listener.disable();
        }
        self.disabled.store(true, Ordering::Release);
    }

    /// False while the ceiling keeps the listeners disabled.
    pub fn is_listening(&self) -> bool {
        !self.disabled.load(Ordering::Acquire)
    }

    /// Replace the factory used to wrap accepted transports.
    pub fn set_connect_factory(&self, factory: Arc<dyn ConnectFactory>) {
        *self.factory.write() = factory;
    }

    /// Register an accepted transport.
    ///
    /// The connection is inserted into the registry and has its idle timeout
    /// armed before any protocol logic observes it; `when_accepted` fires
    /// last. Crossing the ceiling disables every listener.
    pub async fn accept(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Arc<Connect> {
        let conn = self.factory.read().clone().build(transport);
        let peer = conn.peer_name().to_string();

        let count = {
            let mut peers = self.peers.write();
            peers.insert(peer.clone(), conn.clone());
            peers.len()
        };
        debug!(%peer, count, "connection accepted");
        if count >= self.max_connections.load(Ordering::Relaxed) {
            info!(count, "connection ceiling reached, disabling listeners");
            self.disable();
        }

        // Peer close (or a later local shutdown) drives disconnection.
        {
            let weak = Arc::downgrade(self);
            let closing = conn.clone();
            conn.transport().on_closed(Box::new(move || {
                if let Some(server) = weak.upgrade() {
                    tokio::spawn(async move {
                        server.disconnect(&closing).await;
                    });
                }
            }));
        }

        // Initial release arms the idle timeout (or shuts the connection
        // down right away when keep-alive is disabled).
        self.release(&conn);

        if let Err(error) = self.accepted.fire(conn.clone()).await {
            debug!(%peer, %error, "accepted pipeline stage failed");
        }
        conn
    }

    /// Remove a connection from the registry. Idempotent; unknown peers are
    /// ignored. Dropping below the ceiling re-enables the listeners.
    pub async fn disconnect(&self, conn: &Arc<Connect>) {
        let removed = self.peers.write().remove(conn.peer_name());
        if removed.is_none() {
            trace!(peer = %conn.peer_name(), "disconnect for unknown peer");
            return;
        }
        conn.mark_closed();
        self.unset_timeout(conn);

        let count = self.peers.read().len();
        debug!(peer = %conn.peer_name(), count, "disconnected");
        if count < self.max_connections.load(Ordering::Relaxed) && !self.is_listening() {
            info!(count, "below connection ceiling, enabling listeners");
            self.enable();
        }

        if let Err(error) = self.disconnected.fire(conn.clone()).await {
            debug!(peer = %conn.peer_name(), %error, "disconnected pipeline stage failed");
        }
    }

    // ========================================================================
    // Busy / idle
    // ========================================================================

    /// Mark a connection busy: inbound delivery is suspended (the protocol
    /// layer controls pacing) and the request timeout replaces any armed
    /// deadline. When the request timeout is disabled, processing is
    /// unbounded and the deadline is cleared.
    pub fn reserve(&self, conn: &Arc<Connect>) {
        if conn.is_closed() || !self.has_connection(conn.peer_name()) {
            trace!(peer = %conn.peer_name(), "reserve on a closed connection");
            return;
        }
        conn.set_busy(true);
        conn.transport().suspend();
        let request_timeout = *self.request_timeout.lock();
        if request_timeout > 0.0 {
            self.set_timeout(conn, request_timeout);
        } else {
            self.unset_timeout(conn);
        }
    }

    /// Mark a connection idle again: inbound delivery resumes and the idle
    /// timeout is re-armed from this instant. An idle timeout of zero means
    /// no keep-alive: the connection is shut down immediately. A negative
    /// idle timeout lets the connection idle forever.
    pub fn release(&self, conn: &Arc<Connect>) {
        if conn.is_closed() || !self.has_connection(conn.peer_name()) {
            trace!(peer = %conn.peer_name(), "release on a closed connection");
            return;
        }
        conn.set_busy(false);
        conn.transport().resume();
        let idle_timeout = *self.idle_timeout.lock();
        if idle_timeout > 0.0 {
            self.set_timeout(conn, idle_timeout);
        } else if idle_timeout == 0.0 {
            self.unset_timeout(conn);
            debug!(peer = %conn.peer_name(), "no keep-alive, shutting down on release");
            conn.transport().shutdown();
        } else {
            self.unset_timeout(conn);
        }
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    /// Arm (or re-arm) the connection's deadline `seconds` from now. A
    /// non-positive duration only disarms.
    pub fn set_timeout(&self, conn: &Arc<Connect>, seconds: f64) {
        self.arm(conn, seconds, None);
    }

    /// Arm a deadline with a per-connection handler that overrides the
    /// default timeout dispatch for this connection only.
    pub fn set_timeout_with<F, Fut>(&self, conn: &Arc<Connect>, seconds: f64, handler: F)
    where
        F: Fn(Arc<Connect>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let handler: TimeoutHandler = Arc::new(move |conn| Box::pin(handler(conn)));
        self.arm(conn, seconds, Some(handler));
    }

    fn arm(&self, conn: &Arc<Connect>, seconds: f64, handler: Option<TimeoutHandler>) {
        self.unset_timeout(conn);
        if seconds <= 0.0 {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs_f64(seconds);
        self.wheel.lock().insert(conn.peer_name(), deadline);
        conn.set_deadline(deadline);
        if let Some(handler) = handler {
            conn.set_timeout_handler(handler);
        }
        trace!(peer = %conn.peer_name(), seconds, "deadline armed");
    }

    /// Disarm the connection's deadline, if any. The cancellation primitive:
    /// every busy/idle transition and every disconnect goes through here, so
    /// a connection is never in two wheel slots at once.
    pub fn unset_timeout(&self, conn: &Arc<Connect>) {
        if let Some(deadline) = conn.take_deadline() {
            self.wheel.lock().remove(conn.peer_name(), deadline);
        }
        conn.clear_timeout_handler();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Expire everything that is due now. Invoke periodically from an
    /// external timer; safe to call with nothing due and safe with an
    /// arbitrarily large backlog.
    pub async fn inspect(&self) -> Result<InspectStats, Error> {
        self.inspect_at(Instant::now()).await
    }

    /// Expire everything due at `now`.
    ///
    /// Slots are processed soonest-first; within a slot, connections are
    /// processed in arming order. Each due connection is disarmed and then
    /// dispatched: its own timeout handler when one is set, otherwise the
    /// request- or idle-timeout pipeline according to the busy flag. A
    /// dispatch failure shuts that connection down and the sweep continues;
    /// the last failure is surfaced once after all due work is done.
    pub async fn inspect_at(&self, now: Instant) -> Result<InspectStats, Error> {
        let mut last_error: Option<Error> = None;
        loop {
            let Some(slot) = self.wheel.lock().pop_due(now) else {
                break;
            };
            for peer in slot.peers() {
                let Some(conn) = self.connection(peer) else {
                    // Disconnected while the slot was queued.
                    continue;
                };
                if conn.deadline() != Some(slot.deadline()) {
                    // Re-armed by an earlier dispatch of this sweep; the
                    // connection now lives in another slot.
                    continue;
                }
                conn.take_deadline();
                let handler = conn.take_timeout_handler();
                let result = match handler {
                    Some(handler) => handler(conn.clone()).await,
                    None if conn.is_busy() => self.request_expired.fire(conn.clone()).await,
                    None => self.idle_expired.fire(conn.clone()).await,
                };
                if let Err(error) = result {
                    warn!(%peer, %error, "timeout dispatch failed, shutting connection down");
                    conn.transport().shutdown();
                    last_error = Some(error);
                }
            }
        }

        let stats = InspectStats {
            slots: self.wheel.lock().slot_count(),
            peers: self.peers.read().len(),
        };
        *self.stats.lock() = stats;

        match last_error {
            Some(error) => Err(Error::Inspection {
                source: Box::new(error),
            }),
            None => Ok(stats),
        }
    }

    /// Statistics from the most recent inspection sweep.
    pub fn stats(&self) -> InspectStats {
        *self.stats.lock()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn has_connection(&self, peer: &str) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn connection(&self, peer: &str) -> Option<Arc<Connect>> {
        self.peers.read().get(peer).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connect>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn connections_count(&self) -> usize {
        self.peers.read().len()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Set the connection ceiling; negative means unbounded. Lowering the
    /// ceiling below the current count disables accepts without evicting
    /// anyone; when the ceiling is no longer exceeded, accepts resume.
    pub fn set_max_connections(&self, max: i64) {
        let max = if max < 0 { usize::MAX } else { max as usize };
        self.max_connections.store(max, Ordering::Relaxed);
        let count = self.peers.read().len();
        if count >= max {
            self.disable();
        } else if !self.is_listening() {
            self.enable();
        }
    }

    /// The connection ceiling (`usize::MAX` when unbounded).
    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    /// Idle timeout in seconds applied on every release.
    pub fn set_idle_timeout(&self, seconds: f64) {
        *self.idle_timeout.lock() = seconds;
    }

    pub fn idle_timeout(&self) -> f64 {
        *self.idle_timeout.lock()
    }

    /// Request timeout in seconds applied on every reserve.
    pub fn set_request_timeout(&self, seconds: f64) {
        *self.request_timeout.lock() = seconds;
    }

    pub fn request_timeout(&self) -> f64 {
        *self.request_timeout.lock()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Shut the server down: stop and drop every listener, fire `when_close`
    /// for each still-open connection, and force their transports closed.
    pub async fn shutdown(&self) {
        info!("socket server shutting down");
        let listeners: Vec<Arc<dyn Listener>> =
            self.listeners.write().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.shutdown();
        }

        let peers = self.connections();
        for conn in peers {
            if let Err(error) = self.close.fire(conn.clone()).await {
                debug!(peer = %conn.peer_name(), %error, "close pipeline stage failed");
            }
            conn.transport().shutdown();
        }
    }
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("peers", &self.peers.read().len())
            .field("listeners", &self.listeners.read().len())
            .field("max_connections", &self.max_connections())
            .field("listening", &self.is_listening())
            .finish()
    }
}
