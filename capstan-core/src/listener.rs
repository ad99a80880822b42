//! Accept boundary.
//!
//! A [`Listener`] produces accepted transports through its own accepted
//! pipeline and exposes enable/disable as the admission-control lever:
//! while disabled it does not accept at all, so pending connections queue in
//! the kernel backlog instead of reaching the registry.
//!
//! [`TcpAcceptor`] is the production implementation over a tokio
//! `TcpListener`.

use crate::{Error, Pipeline, TcpTransport, Transport};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of accepted raw transports.
pub trait Listener: Send + Sync {
    /// Pipeline fired once per accepted transport, in accept order.
    fn when_accepted(&self) -> &Pipeline<Arc<dyn Transport>>;

    /// Resume accepting.
    fn enable(&self);

    /// Stop accepting. Connections already past accept are unaffected.
    fn disable(&self);

    fn is_enabled(&self) -> bool;

    /// Stop the listener for good and release its socket.
    fn shutdown(&self);

    /// Bound address, when the listener has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// TCP accept loop gated by an enabled flag.
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    enabled: watch::Sender<bool>,
    accepted: Pipeline<Arc<dyn Transport>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpAcceptor {
    /// Pause before retrying after a failed `accept` call.
    const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

    /// Bind `addr` and start accepting.
    pub async fn bind(addr: &str) -> Result<Arc<Self>, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (enabled, enabled_rx) = watch::channel(true);

        let acceptor = Arc::new(Self {
            local_addr,
            enabled,
            accepted: Pipeline::new(),
            task: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::accept_loop(
            Arc::downgrade(&acceptor),
            listener,
            enabled_rx,
        ));
        *acceptor.task.lock() = Some(handle);
        info!(%local_addr, "listening");
        Ok(acceptor)
    }

    async fn accept_loop(
        weak: Weak<Self>,
        listener: TcpListener,
        mut enabled: watch::Receiver<bool>,
    ) {
        loop {
            if !*enabled.borrow() {
                // Disabled: do not touch the socket, let the backlog queue.
                if enabled.changed().await.is_err() {
                    return;
                }
                continue;
            }
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let Some(acceptor) = weak.upgrade() else { return };
                        match TcpTransport::spawn(stream) {
                            Ok(transport) => {
                                debug!(%peer, "accepted");
                                let transport: Arc<dyn Transport> = transport;
                                if let Err(error) = acceptor.accepted.fire(transport).await {
                                    debug!(%peer, %error, "accepted stage failed");
                                }
                            }
                            Err(error) => {
                                warn!(%peer, %error, "failed to set up transport");
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(Self::ACCEPT_RETRY_DELAY).await;
                    }
                },
                changed = enabled.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Listener for TcpAcceptor {
    fn when_accepted(&self) -> &Pipeline<Arc<dyn Transport>> {
        &self.accepted
    }

    fn enable(&self) {
        self.enabled.send_replace(true);
    }

    fn disable(&self) {
        self.enabled.send_replace(false);
    }

    fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    fn shutdown(&self) {
        debug!(local_addr = %self.local_addr, "listener shutting down");
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("local_addr", &self.local_addr)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
