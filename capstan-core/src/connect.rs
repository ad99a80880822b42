//! Per-connection state record.
//!
//! A [`Connect`] is the registry-owned record for one accepted socket: peer
//! identity, the busy/idle flag driving timeout selection, the free-form
//! protocol state tag, the armed deadline (doubling as the back-reference
//! into the timeout wheel), an optional per-connection timeout handler, and
//! a type-erased extension slot for protocol layers.
//!
//! The busy/idle flag is orthogonal to the protocol `state` tag: admission
//! control and deadlines read only the flag, while HTTP or WebSocket layers
//! may move the tag through "headers", "body", "shutdown" and so on without
//! the core noticing.

use crate::{Error, Transport};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Per-connection timeout handler overriding the default timeout dispatch.
pub type TimeoutHandler =
    Arc<dyn Fn(Arc<Connect>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Registry-owned state record for one accepted connection.
pub struct Connect {
    peer_name: String,
    transport: Arc<dyn Transport>,
    busy: AtomicBool,
    closed: AtomicBool,
    state: Mutex<String>,
    deadline: Mutex<Option<Instant>>,
    timeout_handler: Mutex<Option<TimeoutHandler>>,
    connected_at: Instant,
    extension: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Connect {
    /// Wrap an accepted transport. Connections start idle.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            peer_name: transport.peer_name(),
            transport,
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Mutex::new(String::new()),
            deadline: Mutex::new(None),
            timeout_handler: Mutex::new(None),
            connected_at: Instant::now(),
            extension: Mutex::new(None),
        })
    }

    /// Stable peer identity (`address:port`), the registry key.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// The underlying stream I/O handle.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// True while a request is reserved on this connection.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// True once the connection left the registry (terminal state).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the terminal state; returns true on the first call only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Free-form protocol state tag. Opaque to the core.
    pub fn state(&self) -> String {
        self.state.lock().clone()
    }

    /// Replace the protocol state tag.
    pub fn set_state(&self, state: impl Into<String>) {
        *self.state.lock() = state.into();
    }

    /// The armed expiry instant, if any. Doubles as the back-reference to
    /// the wheel slot holding this connection.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    pub(crate) fn take_deadline(&self) -> Option<Instant> {
        self.deadline.lock().take()
    }

    pub(crate) fn set_timeout_handler(&self, handler: TimeoutHandler) {
        *self.timeout_handler.lock() = Some(handler);
    }

    pub(crate) fn take_timeout_handler(&self) -> Option<TimeoutHandler> {
        self.timeout_handler.lock().take()
    }

    pub(crate) fn clear_timeout_handler(&self) {
        *self.timeout_handler.lock() = None;
    }

    /// Instant this connection was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Time since accept.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Attach protocol-layer data to this connection, replacing any
    /// previously attached value.
    pub fn set_extension<T: Send + Sync + 'static>(&self, value: T) {
        *self.extension.lock() = Some(Box::new(value));
    }

    /// Typed access to the attached extension.
    ///
    /// Fails with [`Error::InvalidConnectionType`] when the slot is empty or
    /// holds a different type. This is the runtime half of the connection-class
    /// capability check.
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Result<T, Error> {
        self.extension
            .lock()
            .as_ref()
            .and_then(|ext| ext.downcast_ref::<T>())
            .cloned()
            .ok_or(Error::InvalidConnectionType)
    }

    /// Remove and return the attached extension.
    pub fn take_extension<T: Send + Sync + 'static>(&self) -> Result<T, Error> {
        let mut slot = self.extension.lock();
        match slot.take() {
            Some(ext) => match ext.downcast::<T>() {
                Ok(ext) => Ok(*ext),
                Err(ext) => {
                    // Wrong type requested; put the value back.
                    *slot = Some(ext);
                    Err(Error::InvalidConnectionType)
                }
            },
            None => Err(Error::InvalidConnectionType),
        }
    }

    /// Force-close the underlying transport (idempotent, best-effort).
    pub fn shutdown(&self) {
        self.transport.shutdown();
    }
}

impl std::fmt::Debug for Connect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connect")
            .field("peer", &self.peer_name)
            .field("busy", &self.is_busy())
            .field("closed", &self.is_closed())
            .field("state", &*self.state.lock())
            .field("deadline", &*self.deadline.lock())
            .finish()
    }
}

/// Builds the connection record for each accepted transport.
///
/// The trait bound is the connection capability set: any factory produces
/// records the registry can manage, so an invalid connection class cannot be
/// configured. Protocol layers customize connections by attaching extensions
/// in their factory (or in a `when_accepted` stage).
pub trait ConnectFactory: Send + Sync {
    fn build(&self, transport: Arc<dyn Transport>) -> Arc<Connect>;
}

/// Factory producing plain [`Connect`] records.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnectFactory;

impl ConnectFactory for DefaultConnectFactory {
    fn build(&self, transport: Arc<dyn Transport>) -> Arc<Connect> {
        Connect::new(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;

    fn connect() -> Arc<Connect> {
        Connect::new(NullTransport::new("127.0.0.1:9000"))
    }

    #[test]
    fn test_new_connection_is_idle() {
        let conn = connect();
        assert_eq!(conn.peer_name(), "127.0.0.1:9000");
        assert!(!conn.is_busy());
        assert!(!conn.is_closed());
        assert_eq!(conn.state(), "");
        assert!(conn.deadline().is_none());
    }

    #[test]
    fn test_state_tag_is_free_form() {
        let conn = connect();
        conn.set_state("headers");
        assert_eq!(conn.state(), "headers");
        conn.set_state("body");
        assert_eq!(conn.state(), "body");
        // The tag never touches the busy flag.
        assert!(!conn.is_busy());
    }

    #[test]
    fn test_mark_closed_fires_once() {
        let conn = connect();
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_deadline_take_clears() {
        let conn = connect();
        let deadline = Instant::now() + Duration::from_secs(1);
        conn.set_deadline(deadline);
        assert_eq!(conn.deadline(), Some(deadline));
        assert_eq!(conn.take_deadline(), Some(deadline));
        assert!(conn.deadline().is_none());
        assert!(conn.take_deadline().is_none());
    }

    #[test]
    fn test_extension_typed_access() {
        #[derive(Debug, Clone, PartialEq)]
        struct Session {
            user: String,
        }

        let conn = connect();
        assert!(matches!(
            conn.extension::<Session>(),
            Err(Error::InvalidConnectionType)
        ));

        conn.set_extension(Session {
            user: "alice".to_string(),
        });
        assert_eq!(conn.extension::<Session>().unwrap().user, "alice");

        // Asking for the wrong type is rejected and leaves the value alone.
        assert!(matches!(
            conn.extension::<u32>(),
            Err(Error::InvalidConnectionType)
        ));
        assert!(matches!(
            conn.take_extension::<u32>(),
            Err(Error::InvalidConnectionType)
        ));
        let session = conn.take_extension::<Session>().unwrap();
        assert_eq!(session.user, "alice");
        assert!(conn.take_extension::<Session>().is_err());
    }

    #[test]
    fn test_default_factory_builds_plain_records() {
        let factory = DefaultConnectFactory;
        let conn = factory.build(NullTransport::new("10.0.0.1:1234"));
        assert_eq!(conn.peer_name(), "10.0.0.1:1234");
        assert!(!conn.is_busy());
    }
}
