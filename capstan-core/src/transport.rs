//! Stream I/O boundary.
//!
//! The core never reads protocol bytes itself; it consumes a small set of
//! transport primitives per connection: stable peer identity, suspend/resume
//! of inbound delivery, best-effort idempotent shutdown, and a closed hook
//! that fires exactly once and drives disconnection. Inbound data and writes
//! are exposed for the protocol layers built on top.
//!
//! [`TcpTransport`] is the production implementation over a tokio
//! `TcpStream`: a read pump task delivers chunks to the `incoming` pipeline,
//! gated by the suspend flag so paused connections exert real backpressure
//! (bytes stay in the kernel buffer). [`NullTransport`] is an inert
//! implementation for tests and embedding.

use crate::{Error, Pipeline};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Hook invoked exactly once when the connection is gone.
pub type ClosedHook = Box<dyn FnOnce() + Send>;

/// Stream I/O primitives the lifecycle core consumes per connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable peer identity (`address:port`), used as the registry key.
    fn peer_name(&self) -> String;

    /// Inbound data, delivered in arrival order.
    fn incoming(&self) -> &Pipeline<Bytes>;

    /// Write bytes to the peer.
    async fn write(&self, data: Bytes) -> Result<(), Error>;

    /// Stop delivering inbound data.
    fn suspend(&self);

    /// Restart inbound delivery.
    fn resume(&self);

    fn is_suspended(&self) -> bool;

    /// Force-close the connection. Idempotent and best-effort: I/O failures
    /// during teardown are swallowed.
    fn shutdown(&self);

    /// Register the hook fired exactly once when the connection is gone
    /// (peer close or local shutdown). Registering after the fact fires the
    /// hook immediately.
    fn on_closed(&self, hook: ClosedHook);
}

// ============================================================================
// TCP transport
// ============================================================================

/// Transport over a tokio `TcpStream`.
pub struct TcpTransport {
    peer_name: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    suspended: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
    closed_hook: Mutex<Option<ClosedHook>>,
    incoming: Pipeline<Bytes>,
}

impl TcpTransport {
    /// Read buffer size for the pump task.
    const READ_CHUNK: usize = 8 * 1024;

    /// Wrap an accepted stream and start its read pump.
    pub fn spawn(stream: TcpStream) -> Result<Arc<Self>, Error> {
        let peer_name = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        let (suspended, suspended_rx) = watch::channel(false);
        let (stop, stop_rx) = watch::channel(false);

        let transport = Arc::new(Self {
            peer_name,
            writer: Mutex::new(Some(writer)),
            suspended,
            stop,
            closed: AtomicBool::new(false),
            closed_hook: Mutex::new(None),
            incoming: Pipeline::new(),
        });

        tokio::spawn(Self::pump(
            Arc::downgrade(&transport),
            reader,
            suspended_rx,
            stop_rx,
        ));
        Ok(transport)
    }

    /// Read loop: deliver inbound chunks until EOF, error, or shutdown.
    /// Suspension pauses reading entirely, leaving bytes in the kernel
    /// buffer so the peer sees backpressure.
    async fn pump(
        weak: Weak<Self>,
        mut reader: OwnedReadHalf,
        mut suspended: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; Self::READ_CHUNK];
        loop {
            if *stop.borrow() {
                break;
            }
            if *suspended.borrow() {
                tokio::select! {
                    changed = suspended.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => {
                        let Some(transport) = weak.upgrade() else { break };
                        trace!(peer = %transport.peer_name, bytes = n, "inbound data");
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if let Err(error) = transport.incoming.fire(chunk).await {
                            debug!(peer = %transport.peer_name, %error, "incoming stage failed");
                        }
                    }
                    Err(error) => {
                        if let Some(transport) = weak.upgrade() {
                            debug!(peer = %transport.peer_name, %error, "read failed");
                        }
                        break;
                    }
                },
                changed = suspended.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if let Some(transport) = weak.upgrade() {
            transport.notify_closed();
        }
    }

    fn notify_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.peer_name, "transport closed");
            if let Some(hook) = self.closed_hook.lock().take() {
                hook();
            }
        }
    }

    /// True once the connection is gone in either direction.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn peer_name(&self) -> String {
        self.peer_name.clone()
    }

    fn incoming(&self) -> &Pipeline<Bytes> {
        &self.incoming
    }

    async fn write(&self, data: Bytes) -> Result<(), Error> {
        // The half is taken out of the lock so it is never held across await.
        let Some(mut writer) = self.writer.lock().take() else {
            return Err(Error::ConnectionClosed(self.peer_name.clone()));
        };
        let result = writer.write_all(&data).await;
        *self.writer.lock() = Some(writer);
        result?;
        Ok(())
    }

    fn suspend(&self) {
        self.suspended.send_replace(true);
    }

    fn resume(&self) {
        self.suspended.send_replace(false);
    }

    fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    fn shutdown(&self) {
        // Dropping the write half closes the write direction; the pump
        // notices the stop signal and fires the closed hook.
        self.writer.lock().take();
        self.stop.send_replace(true);
    }

    fn on_closed(&self, hook: ClosedHook) {
        if self.closed.load(Ordering::Acquire) {
            hook();
            return;
        }
        *self.closed_hook.lock() = Some(hook);
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer_name)
            .field("suspended", &self.is_suspended())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Null transport
// ============================================================================

/// Inert transport for tests and embedding: writes are recorded, inbound
/// data is pushed by the caller, and the peer close is triggered manually.
pub struct NullTransport {
    peer_name: String,
    suspended: AtomicBool,
    closed: AtomicBool,
    closed_hook: Mutex<Option<ClosedHook>>,
    incoming: Pipeline<Bytes>,
    written: Mutex<Vec<Bytes>>,
}

impl NullTransport {
    pub fn new(peer_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            peer_name: peer_name.into(),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_hook: Mutex::new(None),
            incoming: Pipeline::new(),
            written: Mutex::new(Vec::new()),
        })
    }

    /// Deliver inbound data as if the peer had sent it.
    pub async fn push(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.incoming.fire(data.into()).await
    }

    /// Everything written to this transport so far.
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// Simulate the peer closing the connection.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel)
            && let Some(hook) = self.closed_hook.lock().take()
        {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn peer_name(&self) -> String {
        self.peer_name.clone()
    }

    fn incoming(&self) -> &Pipeline<Bytes> {
        &self.incoming
    }

    async fn write(&self, data: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.peer_name.clone()));
        }
        self.written.lock().push(data);
        Ok(())
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.close();
    }

    fn on_closed(&self, hook: ClosedHook) {
        if self.is_closed() {
            hook();
            return;
        }
        *self.closed_hook.lock() = Some(hook);
    }
}

impl std::fmt::Debug for NullTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullTransport")
            .field("peer", &self.peer_name)
            .field("suspended", &self.is_suspended())
            .field("closed", &self.is_closed())
            .finish()
    }
}
