//! Connection Manager Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, LinkConfig};
use crate::sink::{to_hex, DownstreamSink};
use crate::Result;

/// Failure categories reported by [`ConnectionManager::send`]
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("timed out waiting for server connection")]
    WaitTimeout,
    #[error("client is shut down")]
    Stopped,
    #[error("connection dropped before the payload could be written")]
    NotConnected,
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The live connection's write half plus its peer address.
///
/// The read half is loaned to the lifecycle loop for the duration of one
/// session; establishment populates this slot and hands out the reader in
/// the same locked step, so the slot is either fully live or empty.
struct ConnectionHandle {
    writer: tokio::net::tcp::OwnedWriteHalf,
    peer_addr: SocketAddr,
}

/// Outcome of waiting for a live connection in the send path
enum WaitOutcome {
    Connected,
    TimedOut,
    Stopped,
}

/// Maintains one persistent TCP connection to the configured server.
///
/// A background task runs the lifecycle loop (establish, receive, close,
/// retry); any task may call [`send`](Self::send) concurrently. The live
/// connection handle is the only shared mutable state and every access to
/// it goes through a single mutex.
pub struct ConnectionManager {
    host: String,
    port: u16,
    link: LinkConfig,
    sink: Arc<dyn DownstreamSink>,
    handle: Mutex<Option<ConnectionHandle>>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager for the configured server
    pub fn new(config: &Config, sink: Arc<dyn DownstreamSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            link: config.link.clone(),
            sink,
            handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Spawn the background lifecycle loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run the lifecycle loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Each iteration establishes a connection, pumps inbound data to the
    /// sink, and on any failure closes the connection and retries after
    /// the configured delay.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.is_stopped() {
            match self.establish().await {
                Ok(reader) => {
                    if let Err(e) = self.receive_loop(reader).await {
                        warn!("Connection error: {:#}", e);
                    }
                }
                Err(e) => {
                    warn!("Connection error: {:#}", e);
                }
            }

            self.close_connection().await;

            if self.is_stopped() {
                break;
            }

            // Fixed-interval retry; a capped exponential backoff could slot
            // in here without changing the loop structure.
            tokio::select! {
                _ = sleep(self.link.retry_delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.close_connection().await;
        debug!("Lifecycle loop exited");
    }

    /// Open a fresh connection to the server.
    ///
    /// Holds the handle lock for the whole attempt so senders never observe
    /// a half-constructed handle. Any stale handle is closed first.
    async fn establish(&self) -> Result<OwnedReadHalf> {
        if self.is_stopped() {
            bail!("client is shut down");
        }

        let mut handle = self.handle.lock().await;
        if handle.take().is_some() {
            debug!("Discarded stale connection before reconnect");
        }

        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.link.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("Connect to {} timed out", addr))?
            .with_context(|| format!("Connect to {} failed", addr))?;

        let peer_addr = stream.peer_addr().context("Failed to get peer address")?;
        let (reader, writer) = stream.into_split();
        *handle = Some(ConnectionHandle { writer, peer_addr });

        info!("Connected to server {}", peer_addr);
        Ok(reader)
    }

    /// Pump inbound data to the downstream sink until the session ends.
    ///
    /// Returns `Ok(())` on end-of-stream or shutdown, `Err` on an I/O
    /// failure or a sink rejection. A read timeout is a liveness tick, not
    /// an error: the loop re-checks connection and stop state and reads
    /// again.
    async fn receive_loop(&self, mut reader: OwnedReadHalf) -> Result<()> {
        let mut buf = vec![0u8; self.link.read_buffer_size];
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while self.is_connected().await && !self.is_stopped() {
            let read = tokio::select! {
                r = timeout(self.link.read_timeout, reader.read(&mut buf)) => r,
                _ = shutdown_rx.recv() => break,
            };

            let n = match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    info!("Server closed connection");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e).context("Read from server failed"),
            };

            // Forward exactly the bytes read, not the whole buffer
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            debug!("Server: {}", to_hex(&chunk));
            self.sink
                .send_data(chunk)
                .context("Downstream sink rejected inbound data")?;
        }

        Ok(())
    }

    /// Transmit one payload to the server.
    ///
    /// Blocks until a live connection exists (bounded by the configured
    /// send wait timeout), then writes and flushes the full payload. A
    /// single attempt: any failure tears the connection down and is
    /// reported to the caller; the background loop handles reconnection.
    pub async fn send(&self, payload: &[u8]) -> std::result::Result<(), SendError> {
        if payload.is_empty() {
            return Err(SendError::EmptyPayload);
        }

        match self.wait_for_connection(self.link.send_wait_timeout).await {
            WaitOutcome::Connected => {}
            WaitOutcome::TimedOut => {
                warn!("Timeout waiting for server connection");
                return Err(SendError::WaitTimeout);
            }
            WaitOutcome::Stopped => return Err(SendError::Stopped),
        }

        let mut handle = self.handle.lock().await;

        // Mandatory re-check: the connection may have dropped between the
        // wait and the lock acquisition.
        let result = {
            let conn = match handle.as_mut() {
                Some(conn) => conn,
                None => return Err(SendError::NotConnected),
            };

            timeout(self.link.write_timeout, async {
                conn.writer.write_all(payload).await?;
                conn.writer.flush().await
            })
            .await
        };

        match result {
            Ok(Ok(())) => {
                info!("Sent {} bytes to server", payload.len());
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Write failed: {}", e);
                *handle = None;
                Err(SendError::Io(e))
            }
            Err(_) => {
                warn!("Write failed: timed out after {:?}", self.link.write_timeout);
                *handle = None;
                Err(SendError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                )))
            }
        }
    }

    /// Poll until a live connection exists, the wait bound elapses, or the
    /// client is stopped. The waiting diagnostic is emitted once, on the
    /// first tick.
    async fn wait_for_connection(&self, wait_timeout: Duration) -> WaitOutcome {
        let start = Instant::now();
        let mut announced = false;

        loop {
            if self.is_stopped() {
                return WaitOutcome::Stopped;
            }

            if self.is_connected().await {
                return WaitOutcome::Connected;
            }

            if start.elapsed() >= wait_timeout {
                return WaitOutcome::TimedOut;
            }

            if !announced {
                info!("Waiting for server connection...");
                announced = true;
            }

            sleep(self.link.poll_interval).await;
        }
    }

    /// Liveness query: true iff a fully-established connection handle exists
    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Whether shutdown has been initiated
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop permanently. Idempotent and callable from any task.
    ///
    /// Sets the stop flag (never reset), wakes any in-flight read or retry
    /// delay, then forces the connection closed so the lifecycle loop and
    /// waiting senders observe the terminal state promptly.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.close_connection().await;
        info!("Connection manager shut down");
    }

    /// Close the current connection, if any
    async fn close_connection(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(conn) = handle.take() {
            // Dropping the write half shuts the socket down
            debug!("Closed connection to {}", conn.peer_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    /// Sink that records every chunk and can be switched to reject mode
    struct RecordingSink {
        chunks: StdMutex<Vec<Bytes>>,
        accept: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                chunks: StdMutex::new(Vec::new()),
                accept: AtomicBool::new(true),
            })
        }

        fn rejecting() -> Arc<Self> {
            let sink = Self::new();
            sink.accept.store(false, Ordering::SeqCst);
            sink
        }

        fn chunks(&self) -> Vec<Bytes> {
            self.chunks.lock().unwrap().clone()
        }
    }

    impl DownstreamSink for RecordingSink {
        fn send_data(&self, chunk: Bytes) -> Result<()> {
            self.chunks.lock().unwrap().push(chunk);
            if self.accept.load(Ordering::SeqCst) {
                Ok(())
            } else {
                bail!("sink rejected chunk")
            }
        }
    }

    fn test_config(port: u16) -> Config {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;
        config.link.connect_timeout = Duration::from_secs(1);
        config.link.read_timeout = Duration::from_millis(50);
        config.link.write_timeout = Duration::from_millis(200);
        config.link.retry_delay = Duration::from_millis(20);
        config.link.send_wait_timeout = Duration::from_secs(2);
        config.link.poll_interval = Duration::from_millis(10);
        config
    }

    async fn bind_test_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn wait_until_connected(manager: &ConnectionManager) {
        timeout(Duration::from_secs(2), async {
            while !manager.is_connected().await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("manager never connected");
    }

    #[tokio::test]
    async fn test_send_rejects_empty_payload() {
        let manager = ConnectionManager::new(&test_config(1), RecordingSink::new());

        let err = manager.send(&[]).await.unwrap_err();
        assert!(matches!(err, SendError::EmptyPayload));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_then_times_out() {
        // Default config carries the 10s send wait bound; no lifecycle loop
        // is running, so no connection ever becomes available.
        let mut config = Config::default();
        config.server.port = 1;
        let manager = ConnectionManager::new(&config, RecordingSink::new());

        let start = Instant::now();
        let err = manager.send(b"request").await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SendError::WaitTimeout));
        assert!(elapsed >= Duration::from_secs(10), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(11), "returned too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_forwards_exact_chunk_to_sink() {
        let (listener, port) = bind_test_server().await;
        let sink = RecordingSink::new();
        let manager = Arc::new(ConnectionManager::new(&test_config(port), sink.clone()));
        let task = Arc::clone(&manager).start();

        let (mut server_conn, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        server_conn.write_all(&[0x01, 0x02, 0x03]).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while sink.chunks().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("chunk never reached the sink");

        let chunks = sink.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref(), &[0x01, 0x02, 0x03]);

        manager.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_stream_triggers_reconnect() {
        let (listener, port) = bind_test_server().await;
        let manager = Arc::new(ConnectionManager::new(&test_config(port), RecordingSink::new()));
        let task = Arc::clone(&manager).start();

        // Close the first session immediately: the manager must come back
        // for a fresh connect after the retry delay.
        let (first, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        drop(first);

        let (_second, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no reconnect after end-of-stream")
            .unwrap();

        wait_until_connected(&manager).await;

        manager.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sink_rejection_closes_and_reconnects() {
        let (listener, port) = bind_test_server().await;
        let sink = RecordingSink::rejecting();
        let manager = Arc::new(ConnectionManager::new(&test_config(port), sink.clone()));
        let task = Arc::clone(&manager).start();

        let (mut first, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        first.write_all(&[0xaa]).await.unwrap();

        // The rejected forward must close this connection before the next
        // connect attempt: we observe EOF here first, then a new accept.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .expect("connection was not closed after sink rejection")
            .unwrap();
        assert_eq!(n, 0);

        let (_second, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no reconnect after sink rejection")
            .unwrap();

        assert_eq!(sink.chunks().len(), 1);

        manager.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_delivers_payload() {
        let (listener, port) = bind_test_server().await;
        let manager = Arc::new(ConnectionManager::new(&test_config(port), RecordingSink::new()));
        let task = Arc::clone(&manager).start();

        let (mut server_conn, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();

        manager.send(b"hello").await.unwrap();

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), server_conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        manager.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_and_recovers() {
        let (listener, port) = bind_test_server().await;
        let manager = Arc::new(ConnectionManager::new(&test_config(port), RecordingSink::new()));
        let task = Arc::clone(&manager).start();

        // Accept but never read: a payload far beyond the socket buffers
        // cannot complete, so the bounded write fails inside the locked
        // section and tears the connection down.
        let (server_conn, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        wait_until_connected(&manager).await;

        let big = vec![0x42u8; 16 * 1024 * 1024];
        let err = manager.send(&big).await.unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
        assert!(!manager.is_connected().await);
        drop(server_conn);

        // The background loop reconnects and sends succeed again.
        let (mut second, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no reconnect after write failure")
            .unwrap();
        manager.send(b"after").await.unwrap();

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"after");

        manager.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (listener, port) = bind_test_server().await;
        let manager = Arc::new(ConnectionManager::new(&test_config(port), RecordingSink::new()));
        let task = Arc::clone(&manager).start();

        let _server_conn = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        wait_until_connected(&manager).await;

        tokio::join!(manager.shutdown(), manager.shutdown());

        assert!(manager.is_stopped());
        assert!(!manager.is_connected().await);

        // The lifecycle loop exits instead of retrying.
        timeout(Duration::from_secs(2), task)
            .await
            .expect("lifecycle loop did not exit after shutdown")
            .unwrap();

        let err = manager.send(b"late").await.unwrap_err();
        assert!(matches!(err, SendError::Stopped));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_retry_loop() {
        // Grab a port with no listener so every connect attempt fails.
        let (listener, port) = bind_test_server().await;
        drop(listener);

        let manager = Arc::new(ConnectionManager::new(&test_config(port), RecordingSink::new()));
        let task = Arc::clone(&manager).start();

        sleep(Duration::from_millis(50)).await;
        manager.shutdown().await;

        timeout(Duration::from_secs(2), task)
            .await
            .expect("lifecycle loop stuck after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_liveness_follows_connection_state() {
        let (listener, port) = bind_test_server().await;
        let manager = Arc::new(ConnectionManager::new(&test_config(port), RecordingSink::new()));
        assert!(!manager.is_connected().await);

        let task = Arc::clone(&manager).start();
        let _server_conn = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        wait_until_connected(&manager).await;

        manager.shutdown().await;
        assert!(!manager.is_connected().await);
        task.await.unwrap();
    }
}
