//! Shared state of one live client connection.
//!
//! A `Connection` is the handle every producer holds: the registry for
//! broadcast, the router for direct greetings, the broker relay through
//! the registry. The matching `mpsc::Receiver` is owned by the
//! connection's writer task alone.
//!
//! Lifecycle:
//! ```text
//! Connecting ──► Registered ──► Active ──► Closing ──► Closed
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Registered = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Registered,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue at capacity, message dropped.
    Full,
    /// Queue closed, message dropped.
    Closed,
}

impl Enqueue {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// One client's duplex session against one document.
#[derive(Debug)]
pub struct Connection {
    document_id: String,
    client_id: String,
    /// Outbound queue of pre-serialized events
    tx: mpsc::Sender<Arc<str>>,
    /// Cancelled when the outbound queue is closed
    closed: CancellationToken,
    state: AtomicU8,
    queued: AtomicU64,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection handle and the receiving half of its queue.
    ///
    /// `capacity` is the number of serialized events that may wait for
    /// the writer before further events are dropped.
    pub fn new(
        document_id: impl Into<String>,
        client_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            document_id: document_id.into(),
            client_id: client_id.into(),
            tx,
            closed: CancellationToken::new(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        });
        (connection, rx)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Enqueue a serialized event without waiting.
    pub fn try_send(&self, payload: Arc<str>) -> Enqueue {
        if self.closed.is_cancelled() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Enqueue::Closed;
        }
        match self.tx.try_send(payload) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                Enqueue::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Enqueue::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Enqueue::Closed
            }
        }
    }

    /// Close the outbound queue. Idempotent.
    pub fn close_queue(&self) {
        self.closed.cancel();
    }

    pub fn is_queue_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the outbound queue has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_registered(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Registered)
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.transition(ConnectionState::Registered, ConnectionState::Active)
    }

    /// Enter `Closing` and close the queue.
    ///
    /// Returns `true` only for the caller that performed the transition,
    /// so teardown runs once no matter which pump fails first.
    pub(crate) fn begin_close(&self) -> bool {
        let first = self.transition(ConnectionState::Active, ConnectionState::Closing);
        self.close_queue();
        first
    }

    pub(crate) fn mark_closed(&self) -> bool {
        self.transition(ConnectionState::Closing, ConnectionState::Closed)
    }

    /// Events accepted into the queue so far.
    pub fn queued_count(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Events dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
