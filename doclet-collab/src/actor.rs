//! Per-connection reader and writer pumps.
//!
//! ```text
//!              ┌───────────── ConnectionActor ─────────────┐
//!  socket ───► │ reader: deadline ─► decode ─► router      │
//!              │                                           │
//!  socket ◄─── │ writer: outbound queue │ ping │ close     │ ◄── registry / relay
//!              └───────────────────────────────────────────┘
//! ```
//!
//! The two halves only talk through the outbound queue and the
//! connection's close signal. Whichever side stops first triggers the
//! same teardown: close the queue, unregister, wait for the writer to
//! emit its close frame.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::router::MessageRouter;

/// Keepalive ping payload.
pub const PING_PAYLOAD: &[u8] = b"ping";

/// Timing and size limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ActorConfig {
    /// Maximum silence from the client before the connection is dropped
    pub read_timeout: Duration,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Largest accepted inbound frame
    pub max_frame_bytes: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ActorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            keepalive_interval: config.keepalive_interval,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Client sent a close frame
    ClientClosed,
    /// Inbound stream ended without a close frame
    StreamEnded,
    /// Nothing received within the read timeout
    ReadTimeout,
    /// Inbound frame above the size limit
    FrameTooLarge(usize),
    /// Transport reported an error
    Transport(String),
    /// Outbound side closed (writer failure or registry close)
    ConnectionClosed,
    /// Server shutting down
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::StreamEnded => f.write_str("stream ended"),
            Self::ReadTimeout => f.write_str("read timeout"),
            Self::FrameTooLarge(size) => write!(f, "frame of {size} bytes too large"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::Shutdown => f.write_str("server shutdown"),
        }
    }
}

enum ReadStep<E> {
    Frame(Option<Result<Message, E>>),
    TimedOut,
    Stop(ExitReason),
}

pub struct ConnectionActor {
    conn: Arc<Connection>,
    router: Arc<MessageRouter>,
    config: ActorConfig,
    shutdown: CancellationToken,
}

impl ConnectionActor {
    pub fn new(
        conn: Arc<Connection>,
        router: Arc<MessageRouter>,
        config: ActorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            conn,
            router,
            config,
            shutdown,
        }
    }

    /// Join the document, pump frames until either side stops, tear down.
    pub async fn run<W, R, E>(
        self,
        sink: W,
        mut stream: R,
        outbound: mpsc::Receiver<Arc<str>>,
    ) -> ExitReason
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        self.router.join(self.conn.clone()).await;
        self.conn.mark_active();

        let writer = tokio::spawn(write_loop(
            self.conn.clone(),
            sink,
            outbound,
            self.config.keepalive_interval,
        ));

        let reason = self.read_loop(&mut stream).await;

        self.conn.begin_close();
        self.router.registry().unregister(&self.conn).await;
        if let Err(e) = writer.await {
            log::error!("writer task for client {} failed: {e}", self.conn.client_id());
        }
        self.conn.mark_closed();

        log::info!(
            "client {} left document {} after {:.1?} ({reason})",
            self.conn.client_id(),
            self.conn.document_id(),
            self.conn.age()
        );
        reason
    }

    async fn read_loop<R, E>(&self, stream: &mut R) -> ExitReason
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => ReadStep::Stop(ExitReason::Shutdown),
                _ = self.conn.closed() => ReadStep::Stop(ExitReason::ConnectionClosed),
                next = tokio::time::timeout(self.config.read_timeout, stream.next()) => match next {
                    Ok(frame) => ReadStep::Frame(frame),
                    Err(_) => ReadStep::TimedOut,
                },
            };

            let message = match step {
                ReadStep::Stop(reason) => return reason,
                ReadStep::TimedOut => return ExitReason::ReadTimeout,
                ReadStep::Frame(None) => return ExitReason::StreamEnded,
                ReadStep::Frame(Some(Err(e))) => return ExitReason::Transport(e.to_string()),
                ReadStep::Frame(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    if let Some(reason) = self.accept_frame(text.as_str().as_bytes()).await {
                        return reason;
                    }
                }
                Message::Binary(data) => {
                    if let Some(reason) = self.accept_frame(&data).await {
                        return reason;
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {
                    log::trace!("keepalive from client {}", self.conn.client_id());
                }
                Message::Close(_) => return ExitReason::ClientClosed,
            }
        }
    }

    async fn accept_frame(&self, frame: &[u8]) -> Option<ExitReason> {
        if frame.len() > self.config.max_frame_bytes {
            log::warn!(
                "client {} sent {} byte frame, limit is {}",
                self.conn.client_id(),
                frame.len(),
                self.config.max_frame_bytes
            );
            return Some(ExitReason::FrameTooLarge(frame.len()));
        }
        self.router.handle_frame(&self.conn, frame).await;
        None
    }
}

async fn write_loop<W>(
    conn: Arc<Connection>,
    mut sink: W,
    mut outbound: mpsc::Receiver<Arc<str>>,
    keepalive: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display + Send,
{
    let mut ping = tokio::time::interval(keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = conn.closed() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
            item = outbound.recv() => {
                let Some(text) = item else { break };
                if let Err(e) = sink.send(Message::Text(Utf8Bytes::from(&*text))).await {
                    log::debug!("write to client {} failed: {e}", conn.client_id());
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::from_static(PING_PAYLOAD))).await {
                    log::debug!("ping to client {} failed: {e}", conn.client_id());
                    break;
                }
            }
        }
    }

    // Let the reader know the outbound side is gone.
    conn.close_queue();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::protocol::{Event, MessageType};
    use crate::registry::ConnectionRegistry;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_util::sync::PollSender;

    type Inbound = mpsc::Sender<Result<Message, std::io::Error>>;

    struct Harness {
        conn: Arc<Connection>,
        inbound: Inbound,
        outbound: mpsc::Receiver<Message>,
        task: JoinHandle<ExitReason>,
    }

    fn test_config() -> ActorConfig {
        ActorConfig {
            read_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(2),
            max_frame_bytes: 1024,
        }
    }

    fn spawn_actor(
        router: &Arc<MessageRouter>,
        doc: &str,
        client: &str,
        config: ActorConfig,
        shutdown: CancellationToken,
    ) -> Harness {
        let (conn, queue) = Connection::new(doc, client, 16);
        let (inbound, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound) = mpsc::channel(64);

        let actor = ConnectionActor::new(conn.clone(), router.clone(), config, shutdown);
        let task = tokio::spawn(actor.run(
            PollSender::new(outbound_tx),
            ReceiverStream::new(inbound_rx),
            queue,
        ));
        Harness {
            conn,
            inbound,
            outbound,
            task,
        }
    }

    async fn next_message(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("sink closed")
    }

    async fn next_event(rx: &mut mpsc::Receiver<Message>) -> Event {
        loop {
            match next_message(rx).await {
                Message::Text(text) => return Event::decode(text.as_str().as_bytes()).unwrap(),
                Message::Ping(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    fn router() -> Arc<MessageRouter> {
        Arc::new(MessageRouter::local(Arc::new(ConnectionRegistry::new())))
    }

    #[tokio::test]
    async fn test_greets_then_relays() {
        let router = router();
        let shutdown = CancellationToken::new();
        let mut a = spawn_actor(&router, "doc-1", "A", test_config(), shutdown.clone());
        assert_eq!(next_event(&mut a.outbound).await.kind, MessageType::NameAnnouncement);

        let mut b = spawn_actor(&router, "doc-1", "B", test_config(), shutdown.clone());
        assert_eq!(next_event(&mut b.outbound).await, Event::user_name("doc-1", "B"));
        assert_eq!(next_event(&mut b.outbound).await, Event::user_name("doc-1", "A"));
        assert_eq!(next_event(&mut a.outbound).await, Event::user_name("doc-1", "B"));

        a.inbound
            .send(Ok(Message::Text(r#"{"type":"yjs_update","payload":"p1"}"#.into())))
            .await
            .unwrap();
        assert_eq!(next_event(&mut b.outbound).await, Event::edit_update("doc-1", "A", "p1"));
        assert_eq!(a.conn.state(), ConnectionState::Active);

        shutdown.cancel();
        assert_eq!(a.task.await.unwrap(), ExitReason::Shutdown);
        assert_eq!(b.task.await.unwrap(), ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_once() {
        let router = router();
        let mut a = spawn_actor(&router, "doc-1", "A", test_config(), CancellationToken::new());
        next_event(&mut a.outbound).await;

        a.inbound.send(Ok(Message::Close(None))).await.unwrap();
        assert_eq!(a.task.await.unwrap(), ExitReason::ClientClosed);

        assert!(matches!(next_message(&mut a.outbound).await, Message::Close(None)));
        assert!(a.outbound.recv().await.is_none(), "exactly one close frame");
        assert_eq!(a.conn.state(), ConnectionState::Closed);
        assert_eq!(router.registry().connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let router = router();
        let shutdown = CancellationToken::new();
        let mut a = spawn_actor(&router, "doc-1", "A", test_config(), shutdown.clone());
        let mut b = spawn_actor(&router, "doc-1", "B", test_config(), shutdown.clone());
        next_event(&mut a.outbound).await;
        next_event(&mut a.outbound).await;
        next_event(&mut b.outbound).await;
        next_event(&mut b.outbound).await;

        a.inbound.send(Ok(Message::Text("{not json".into()))).await.unwrap();
        a.inbound
            .send(Ok(Message::Binary(Bytes::from_static(br#"{"type":"presence","payload":"c"}"#))))
            .await
            .unwrap();

        assert_eq!(next_event(&mut b.outbound).await, Event::presence("doc-1", "A", "c"));
        assert_eq!(router.decode_failures(), 1);
        shutdown.cancel();
        assert_eq!(a.task.await.unwrap(), ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_oversize_frame_is_fatal() {
        let router = router();
        let mut a = spawn_actor(&router, "doc-1", "A", test_config(), CancellationToken::new());
        next_event(&mut a.outbound).await;

        let big = format!(r#"{{"type":"yjs_update","payload":"{}"}}"#, "x".repeat(2048));
        a.inbound.send(Ok(Message::Text(big.into()))).await.unwrap();

        assert!(matches!(a.task.await.unwrap(), ExitReason::FrameTooLarge(_)));
        assert_eq!(router.registry().connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_timeout_with_pings() {
        let router = router();
        let config = ActorConfig {
            read_timeout: Duration::from_millis(300),
            keepalive_interval: Duration::from_millis(50),
            max_frame_bytes: 1024,
        };
        let mut a = spawn_actor(&router, "doc-1", "A", config, CancellationToken::new());
        next_event(&mut a.outbound).await;

        match next_message(&mut a.outbound).await {
            Message::Ping(payload) => assert_eq!(&payload[..], PING_PAYLOAD),
            other => panic!("expected ping, got {other:?}"),
        }
        assert_eq!(a.task.await.unwrap(), ExitReason::ReadTimeout);
    }

    #[tokio::test]
    async fn test_pong_refreshes_deadline() {
        let router = router();
        let config = ActorConfig {
            read_timeout: Duration::from_millis(300),
            keepalive_interval: Duration::from_millis(100),
            max_frame_bytes: 1024,
        };
        let a = spawn_actor(&router, "doc-1", "A", config, CancellationToken::new());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            a.inbound
                .send(Ok(Message::Pong(Bytes::from_static(PING_PAYLOAD))))
                .await
                .unwrap();
        }
        assert!(!a.task.is_finished());

        drop(a.inbound);
        assert_eq!(a.task.await.unwrap(), ExitReason::StreamEnded);
    }

    #[tokio::test]
    async fn test_transport_error_ends_connection() {
        let router = router();
        let a = spawn_actor(&router, "doc-1", "A", test_config(), CancellationToken::new());
        a.inbound
            .send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")))
            .await
            .unwrap();
        assert!(matches!(a.task.await.unwrap(), ExitReason::Transport(_)));
    }

    #[tokio::test]
    async fn test_writer_failure_stops_reader() {
        let router = router();
        let mut a = spawn_actor(&router, "doc-1", "A", test_config(), CancellationToken::new());
        next_event(&mut a.outbound).await;
        drop(a.outbound);

        // The next queued frame fails to write.
        router
            .registry()
            .broadcast("doc-1", Arc::from("x"), None)
            .await;
        assert_eq!(a.task.await.unwrap(), ExitReason::ConnectionClosed);
        assert_eq!(a.conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_registry_close_all_disconnects() {
        let router = router();
        let mut a = spawn_actor(&router, "doc-1", "A", test_config(), CancellationToken::new());
        next_event(&mut a.outbound).await;

        router.registry().close_all().await;
        assert_eq!(a.task.await.unwrap(), ExitReason::ConnectionClosed);
        assert!(matches!(next_message(&mut a.outbound).await, Message::Close(None)));
    }
}
