use crate::error::{write_error, Error, WriteErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Logical identity of a client (user, session, ...). One client may hold
/// several connections at once, e.g. one per browser tab.
pub type ClientId = String;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of this server process, generated once at startup. Tags every
/// backplane message so a process can recognise its own traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId(String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write capability bound to one underlying transport stream.
///
/// Implementations must serialize writes so that two frames never interleave
/// on the wire, and must fail every write after `dispose` with a terminal
/// `WriteErrorKind::Disposed`.
#[async_trait]
pub trait ConnectionWriter: Send + Sync {
    async fn write(&self, frame: &str) -> Result<(), Error>;

    fn dispose(&self);
}

/// One live event stream held open by a client.
pub struct ClientConnection {
    connection_id: ConnectionId,
    client_id: ClientId,
    /// Value of the `Last-Event-ID` request header; recorded, never replayed.
    last_event_id: Option<String>,
    connected_at: DateTime<Utc>,
    live: AtomicBool,
    writer: Arc<dyn ConnectionWriter>,
}

impl ClientConnection {
    pub fn new(
        client_id: ClientId,
        last_event_id: Option<String>,
        writer: Arc<dyn ConnectionWriter>,
    ) -> Self {
        Self::with_id(ConnectionId::new(), client_id, last_event_id, writer)
    }

    pub fn with_id(
        connection_id: ConnectionId,
        client_id: ClientId,
        last_event_id: Option<String>,
        writer: Arc<dyn ConnectionWriter>,
    ) -> Self {
        Self {
            connection_id,
            client_id,
            last_event_id,
            connected_at: Utc::now(),
            live: AtomicBool::new(true),
            writer,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Live → dead only; a dead connection never comes back.
    pub fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Write one frame. A failed write closes the connection, releasing the
    /// transport; a cancelled one does not, since the transport is still fine.
    pub async fn send(&self, frame: &str, cancel: &CancellationToken) -> Result<(), Error> {
        if !self.is_live() {
            return Err(write_error(
                WriteErrorKind::Disposed,
                "connection is no longer live",
            ));
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled()),
            result = self.writer.write(frame) => result,
        };

        if let Err(e) = &result {
            if !e.is_cancelled() {
                debug!(
                    "Write to connection {} failed, closing it: {e}",
                    self.connection_id
                );
                self.close();
            }
        }
        result
    }

    /// Mark dead and release the transport. Further writes fail immediately.
    pub fn close(&self) {
        self.mark_dead();
        self.writer.dispose();
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("connection_id", &self.connection_id)
            .field("client_id", &self.client_id)
            .field("last_event_id", &self.last_event_id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Channel-backed writer. The receiving half is drained by the HTTP response
/// body; dropping the receiver (client went away) makes writes fail with
/// `WriteErrorKind::Closed`.
pub struct StreamWriter {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    disposed: AtomicBool,
    /// Cancelled on dispose; the transport stops draining when it fires.
    terminated: CancellationToken,
    write_timeout: Duration,
}

impl StreamWriter {
    /// Create a writer plus the receiver the transport should drain.
    /// `buffer` is the number of frames that may be queued before a write
    /// waits, at most `write_timeout`, for the transport to catch up.
    pub fn channel(buffer: usize, write_timeout: Duration) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let writer = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            disposed: AtomicBool::new(false),
            terminated: CancellationToken::new(),
            write_timeout,
        });
        (writer, rx)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fires once the writer is disposed. The transport draining the
    /// receiver must end the stream when it does, even while a sender is
    /// still held by an in-flight write.
    pub fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }
}

#[async_trait]
impl ConnectionWriter for StreamWriter {
    async fn write(&self, frame: &str) -> Result<(), Error> {
        if self.is_disposed() {
            return Err(write_error(WriteErrorKind::Disposed, "writer disposed"));
        }

        // Held across the send so frames queued by concurrent callers
        // (heartbeat, publish) land whole and in lock order.
        let guard = self.sender.lock().await;
        let Some(sender) = guard.as_ref() else {
            return Err(write_error(WriteErrorKind::Disposed, "writer disposed"));
        };

        match tokio::time::timeout(self.write_timeout, sender.send(frame.to_owned())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(write_error(WriteErrorKind::Closed, "stream receiver dropped")),
            Err(_) => Err(write_error(WriteErrorKind::Timeout, "stream write timed out")),
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.terminated.cancel();
        // A writer holding the lock finishes its frame; the flag stops the rest.
        if let Ok(mut sender) = self.sender.try_lock() {
            sender.take();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory writers shared by the crate's tests.

    use super::*;

    /// Records every frame; fails every write when `failing` is set.
    #[derive(Default)]
    pub(crate) struct RecordingWriter {
        pub frames: std::sync::Mutex<Vec<String>>,
        pub failing: AtomicBool,
    }

    impl RecordingWriter {
        pub fn failing() -> Arc<Self> {
            let writer = Self::default();
            writer.failing.store(true, Ordering::SeqCst);
            Arc::new(writer)
        }

        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionWriter for RecordingWriter {
        async fn write(&self, frame: &str) -> Result<(), Error> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(write_error(WriteErrorKind::Closed, "socket closed"));
            }
            self.frames.lock().unwrap().push(frame.to_string());
            Ok(())
        }

        fn dispose(&self) {
            self.failing.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn connection(
        id: &str,
        client_id: &str,
        writer: Arc<RecordingWriter>,
    ) -> Arc<ClientConnection> {
        Arc::new(ClientConnection::with_id(
            ConnectionId::from(id),
            client_id.to_string(),
            None,
            writer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert_ne!(ServerId::new(), ServerId::new());
    }

    #[tokio::test]
    async fn test_failed_send_closes_connection() {
        let conn = connection("c1", "u1", RecordingWriter::failing());
        let cancel = CancellationToken::new();

        let err = conn.send("x", &cancel).await.unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Write(WriteErrorKind::Closed)
        );
        assert!(!conn.is_live());

        // Dead stays dead
        let err = conn.send("x", &cancel).await.unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Write(WriteErrorKind::Disposed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_send_disposes_stream_writer() {
        let (writer, _rx) = StreamWriter::channel(1, Duration::from_millis(50));
        let terminated = writer.terminated();
        let conn = Arc::new(ClientConnection::with_id(
            ConnectionId::from("c1"),
            "u1".to_string(),
            None,
            writer.clone(),
        ));
        let cancel = CancellationToken::new();

        conn.send("fills the buffer", &cancel).await.unwrap();
        let err = conn.send("blocked", &cancel).await.unwrap_err();

        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Write(WriteErrorKind::Timeout)
        );
        assert!(!conn.is_live());
        assert!(writer.is_disposed());
        assert!(terminated.is_cancelled());
    }

    #[tokio::test]
    async fn test_dispose_terminates_even_while_a_write_holds_the_sender() {
        let (writer, _rx) = StreamWriter::channel(1, Duration::from_secs(60));
        writer.write("fills the buffer").await.unwrap();

        let blocked = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write("blocked").await }
        });
        // Let the spawned write take the lock and park on the full channel
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        writer.dispose();
        assert!(writer.terminated().is_cancelled());
        blocked.abort();
    }

    #[tokio::test]
    async fn test_cancelled_send_keeps_connection_live() {
        let conn = connection("c1", "u1", Arc::new(RecordingWriter::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(conn.send("x", &cancel).await.unwrap_err().is_cancelled());
        assert!(conn.is_live());
    }

    #[tokio::test]
    async fn test_stream_writer_delivers_frames_in_order() {
        let (writer, mut rx) = StreamWriter::channel(8, Duration::from_secs(1));
        writer.write("a").await.unwrap();
        writer.write("b").await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_stream_writer_fails_terminally_after_dispose() {
        let (writer, _rx) = StreamWriter::channel(8, Duration::from_secs(1));
        writer.dispose();

        let err = writer.write("a").await.unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Write(WriteErrorKind::Disposed)
        );
        assert!(writer.is_disposed());
    }

    #[tokio::test]
    async fn test_stream_writer_reports_closed_transport() {
        let (writer, rx) = StreamWriter::channel(8, Duration::from_secs(1));
        drop(rx);

        let err = writer.write("a").await.unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Write(WriteErrorKind::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_writer_times_out_when_transport_stalls() {
        let (writer, _rx) = StreamWriter::channel(1, Duration::from_millis(50));
        writer.write("fills the buffer").await.unwrap();

        let err = writer.write("blocked").await.unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Write(WriteErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_split_frames() {
        let (writer, mut rx) = StreamWriter::channel(64, Duration::from_secs(1));
        let mut handles = Vec::new();
        for i in 0..16 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer.write(&format!("event: {i}\ndata: {i}\n\n")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        drop(writer);

        let mut seen = 0;
        while let Some(frame) = rx.recv().await {
            assert!(frame.ends_with("\n\n"));
            assert_eq!(frame.matches("event: ").count(), 1);
            seen += 1;
        }
        assert_eq!(seen, 16);
    }
}
