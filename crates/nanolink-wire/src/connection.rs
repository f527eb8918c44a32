//! SecureConnection: one socket turned into a pair of message channels.
//!
//! Starting a connection spawns a receive loop and a send loop. Both watch the
//! same shutdown signal; [`SecureConnection::close`] raises it and then joins
//! both tasks, so neither loop outlives the socket. Either loop may also end
//! on its own (peer hangup, broken stream), in which case it raises the signal
//! for its sibling and the connection reports itself closed.

use crate::codec::{self, FrameCodec};
use crate::keys::SessionKeys;
use nanolink_types::{TransportConfig, WireError, WireResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Validated parameters of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub codec: FrameCodec,
    pub keys: Option<SessionKeys>,
    /// Outbound channel depth. Zero means the smallest bounded channel.
    pub send_buffer: usize,
    /// Inbound channel depth. Zero means the smallest bounded channel.
    pub receive_buffer: usize,
    pub read_poll: Duration,
    pub frame_timeout: Duration,
    /// `Some` when the write deadline is enabled.
    pub write_deadline: Option<Duration>,
}

impl ConnectionSettings {
    /// Plaintext, unbuffered settings from a transport config.
    pub fn from_transport(transport: &TransportConfig) -> WireResult<Self> {
        transport.validate()?;
        Ok(Self {
            codec: FrameCodec::from_config(transport)?,
            keys: None,
            send_buffer: 0,
            receive_buffer: 0,
            read_poll: transport.read_poll(),
            frame_timeout: transport.frame_timeout(),
            write_deadline: None,
        })
    }
}

/// A live duplex message channel bound to exactly one TCP socket.
pub struct SecureConnection<M> {
    service_name: String,
    outbound: Option<mpsc::Sender<M>>,
    inbound: Option<mpsc::Receiver<M>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    loops: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl<M> SecureConnection<M> {
    /// An inert handle that is already closed: sends fail, receives yield `None`.
    pub fn closed(service_name: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(true);
        Self {
            service_name: service_name.into(),
            outbound: None,
            inbound: None,
            closed: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(shutdown),
            loops: None,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// True once `close` was called or either loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Dequeue the next inbound message.
    ///
    /// Waits until a message arrives. Returns `None` once the connection is
    /// closed and every buffered message has been taken.
    pub async fn receive(&mut self) -> Option<M> {
        match self.inbound.as_mut() {
            Some(inbound) => inbound.recv().await,
            None => None,
        }
    }

    /// Stop both loops, wait for them to finish and release the socket.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn close(&mut self) {
        let Some((receiver, sender)) = self.loops.take() else {
            return;
        };
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        debug!(service = %self.service_name, "Shutdown signal sent to connection loops");

        if let Err(e) = receiver.await {
            warn!(service = %self.service_name, error = %e, "Receive loop ended abnormally");
        }
        if let Err(e) = sender.await {
            warn!(service = %self.service_name, error = %e, "Send loop ended abnormally");
        }
        self.outbound = None;
        info!(service = %self.service_name, "Connection closed");
    }
}

impl<M> SecureConnection<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Take ownership of `stream` and spawn the two loops.
    pub fn start(service_name: impl Into<String>, stream: TcpStream, settings: ConnectionSettings) -> Self {
        let service_name = service_name.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.send_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.receive_buffer.max(1));
        // Both receivers exist before either task runs, so a close issued
        // right after start is never missed.
        let (shutdown, receive_shutdown) = watch::channel(false);
        let send_shutdown = shutdown.subscribe();
        let shutdown = Arc::new(shutdown);
        let closed = Arc::new(AtomicBool::new(false));
        let sealed = settings.keys.is_some();
        let keys = settings.keys.map(Arc::new);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();

        let span = info_span!("connection", service = %service_name, %peer);
        let receiver = tokio::spawn(
            receive_loop(
                reader,
                inbound_tx,
                ReceiveParams {
                    codec: settings.codec,
                    keys: keys.clone(),
                    read_poll: settings.read_poll,
                    frame_timeout: settings.frame_timeout,
                },
                ShutdownHandle {
                    signal: Arc::clone(&shutdown),
                    observed: receive_shutdown,
                },
                Arc::clone(&closed),
            )
            .instrument(span.clone()),
        );
        let sender = tokio::spawn(
            send_loop(
                writer,
                outbound_rx,
                settings.codec,
                keys,
                settings.write_deadline,
                ShutdownHandle {
                    signal: Arc::clone(&shutdown),
                    observed: send_shutdown,
                },
                Arc::clone(&closed),
            )
            .instrument(span),
        );

        info!(
            service = %service_name,
            %peer,
            sealed,
            "Connection started"
        );

        Self {
            service_name,
            outbound: Some(outbound_tx),
            inbound: Some(inbound_rx),
            closed,
            shutdown,
            loops: Some((receiver, sender)),
        }
    }

    /// Enqueue a message for the send loop.
    ///
    /// Waits while the outbound buffer is full, so a slow peer throttles the
    /// caller instead of losing messages.
    pub async fn send(&self, msg: M) -> WireResult<()> {
        match &self.outbound {
            Some(outbound) if !self.is_closed() => outbound
                .send(msg)
                .await
                .map_err(|_| WireError::ConnectionClosed),
            _ => Err(WireError::ConnectionClosed),
        }
    }

    /// A clonable handle onto the outbound channel, `None` once closed.
    pub fn sender(&self) -> Option<mpsc::Sender<M>> {
        if self.is_closed() {
            return None;
        }
        self.outbound.clone()
    }
}

impl<M> Drop for SecureConnection<M> {
    fn drop(&mut self) {
        if self.loops.is_some() {
            self.closed.store(true, Ordering::SeqCst);
            self.shutdown.send_replace(true);
        }
    }
}

impl<M> std::fmt::Debug for SecureConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnection")
            .field("service_name", &self.service_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A loop's view of the shared shutdown signal: it can raise it and observe it.
struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
    observed: watch::Receiver<bool>,
}

impl ShutdownHandle {
    fn raise(&self) {
        self.signal.send_replace(true);
    }
}

struct ReceiveParams {
    codec: FrameCodec,
    keys: Option<Arc<SessionKeys>>,
    read_poll: Duration,
    frame_timeout: Duration,
}

/// Read frames until shutdown, peer hangup or a fatal stream error.
async fn receive_loop<M>(
    reader: OwnedReadHalf,
    inbound: mpsc::Sender<M>,
    params: ReceiveParams,
    mut shutdown: ShutdownHandle,
    closed: Arc<AtomicBool>,
) where
    M: DeserializeOwned + Send,
{
    let mut reader = BufReader::new(reader);
    let shutdown_rx = &mut shutdown.observed;
    let keys = params.keys.as_deref();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Wait for the first byte of the next frame without consuming it, so
        // an idle deadline never splits a frame.
        let ready = tokio::select! {
            _ = shutdown_rx.changed() => break,
            ready = tokio::time::timeout(params.read_poll, reader.fill_buf()) => ready,
        };
        match ready {
            Err(_) => {
                trace!("Receive loop idle");
                continue;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Socket read failed");
                break;
            }
            Ok(Ok(buf)) if buf.is_empty() => {
                debug!("Peer closed the connection");
                break;
            }
            Ok(Ok(_)) => {}
        }

        let frame = tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = tokio::time::timeout(
                params.frame_timeout,
                params.codec.read_frame::<_, M>(&mut reader, keys),
            ) => frame,
        };
        let msg = match frame {
            Err(_) => {
                warn!(timeout = ?params.frame_timeout, "Frame stalled mid-read");
                break;
            }
            Ok(Ok(msg)) => msg,
            Ok(Err(WireError::ConnectionClosed)) => {
                debug!("Peer closed the connection");
                break;
            }
            Ok(Err(e)) if e.is_fatal() => {
                warn!(error = %e, "Stream unusable, stopping receive loop");
                break;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Dropped undecodable frame");
                continue;
            }
        };

        trace!("Frame received");
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            delivered = inbound.send(msg) => {
                if delivered.is_err() {
                    debug!("Inbound channel dropped");
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    shutdown.raise();
    debug!("Receive loop stopped");
}

/// Write queued messages until shutdown or a failed write.
///
/// A message that cannot be encoded (serialization failure, frame too large)
/// is dropped before any byte is written, so the stream stays usable.
async fn send_loop<M>(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<M>,
    codec: FrameCodec,
    keys: Option<Arc<SessionKeys>>,
    write_deadline: Option<Duration>,
    mut shutdown: ShutdownHandle,
    closed: Arc<AtomicBool>,
) where
    M: Serialize + Send,
{
    let keys = keys.as_deref();

    loop {
        if *shutdown.observed.borrow() {
            break;
        }

        let msg = tokio::select! {
            _ = shutdown.observed.changed() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let frame = match codec.encode(&msg, keys) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropped unsendable message");
                continue;
            }
        };
        drop(msg);

        let write = codec::write_encoded(&mut writer, &frame);
        let result = match write_deadline {
            Some(deadline) => tokio::time::timeout(deadline, write)
                .await
                .unwrap_or(Err(WireError::Timeout(deadline))),
            None => write.await,
        };
        match result {
            Ok(()) => trace!(bytes = frame.len(), "Frame sent"),
            Err(e) => {
                warn!(error = %e, "Write failed, stopping send loop");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    closed.store(true, Ordering::SeqCst);
    shutdown.raise();
    debug!("Send loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ChatLine {
        id: u64,
        text: String,
    }

    fn line(id: u64, text: &str) -> ChatLine {
        ChatLine {
            id,
            text: text.to_string(),
        }
    }

    fn fast_settings(keys: Option<SessionKeys>) -> ConnectionSettings {
        let transport = TransportConfig {
            read_poll_ms: 50,
            ..TransportConfig::default()
        };
        let mut settings = ConnectionSettings::from_transport(&transport).unwrap();
        settings.keys = keys;
        settings
    }

    /// Accepts connections and echoes every byte back.
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn connect(addr: SocketAddr, keys: Option<SessionKeys>) -> SecureConnection<ChatLine> {
        let stream = TcpStream::connect(addr).await.unwrap();
        SecureConnection::start("echo", stream, fast_settings(keys))
    }

    #[tokio::test]
    async fn test_plain_echo() {
        let addr = echo_server().await;
        let mut conn = connect(addr, None).await;

        conn.send(line(1, "hello")).await.unwrap();
        assert_eq!(conn.receive().await.unwrap(), line(1, "hello"));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_sealed_echo() {
        let addr = echo_server().await;
        let mut conn = connect(addr, Some(SessionKeys::generate())).await;

        conn.send(line(2, "secret")).await.unwrap();
        assert_eq!(conn.receive().await.unwrap(), line(2, "secret"));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_unbuffered_delivers_everything_in_order() {
        let addr = echo_server().await;
        let mut conn = connect(addr, Some(SessionKeys::generate())).await;

        let sender = conn.sender().unwrap();
        tokio::spawn(async move {
            for i in 0..50 {
                sender.send(line(i, "burst")).await.unwrap();
            }
        });

        for i in 0..50 {
            let msg = conn.receive().await.unwrap();
            assert_eq!(msg.id, i);
        }
        conn.close().await;
    }

    #[tokio::test]
    async fn test_send_blocks_when_peer_stops_reading() {
        // The peer accepts but never reads, so socket buffers fill up and the
        // unbuffered outbound channel eventually refuses more messages.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let mut conn = connect(addr, None).await;
        let big = "x".repeat(1 << 20);
        let mut blocked = false;
        for i in 0..128 {
            let send = conn.send(line(i, &big));
            if tokio::time::timeout(Duration::from_millis(200), send).await.is_err() {
                blocked = true;
                break;
            }
        }
        assert!(blocked, "send never applied backpressure");

        // Release the peer so the in-flight write fails and close can join.
        hold.abort();
        let _ = hold.await;
        conn.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let addr = echo_server().await;
        let mut conn = connect(addr, None).await;
        assert!(!conn.is_closed());

        conn.close().await;
        assert!(conn.is_closed());
        conn.close().await;
        assert!(conn.is_closed());

        assert!(matches!(
            conn.send(line(1, "late")).await,
            Err(WireError::ConnectionClosed)
        ));
        assert!(conn.sender().is_none());
        assert!(conn.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap()
        });

        let mut conn = connect(addr, None).await;
        conn.close().await;

        let read = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("peer never saw EOF")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_channels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = connect(addr, None).await;
        let next = tokio::time::timeout(Duration::from_secs(5), conn.receive())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(conn.is_closed());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_forged_frame_is_dropped_and_loop_continues() {
        let keys = SessionKeys::generate();
        let forger = SessionKeys::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_keys = keys.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let codec = FrameCodec::default();
            codec
                .write_frame(&mut stream, &line(1, "forged"), Some(&forger))
                .await
                .unwrap();
            codec
                .write_frame(&mut stream, &line(2, "genuine"), Some(&server_keys))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut conn = connect(addr, Some(keys)).await;
        let msg = tokio::time::timeout(Duration::from_secs(5), conn.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, line(2, "genuine"));
        assert!(!conn.is_closed());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_bad_preamble_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"GARBAGE-GARBAGE-GARBAGE").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut conn = connect(addr, None).await;
        let next = tokio::time::timeout(Duration::from_secs(5), conn.receive())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(conn.is_closed());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_idle_polls_do_not_lose_late_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
            FrameCodec::default()
                .write_frame(&mut stream, &line(9, "late"), None)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut conn = connect(addr, None).await;
        let msg = tokio::time::timeout(Duration::from_secs(5), conn.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, line(9, "late"));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_closed_handle_is_inert() {
        let mut conn: SecureConnection<ChatLine> = SecureConnection::closed("nowhere");
        assert!(conn.is_closed());
        assert_eq!(conn.service_name(), "nowhere");
        assert!(conn.send(line(1, "x")).await.is_err());
        assert!(conn.receive().await.is_none());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_close_right_after_start_returns() {
        let addr = echo_server().await;
        for _ in 0..20 {
            let mut conn = connect(addr, None).await;
            tokio::time::timeout(Duration::from_secs(3), conn.close())
                .await
                .expect("close hung before the loops saw the shutdown signal");
            assert!(conn.is_closed());
        }
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped_and_connection_survives() {
        let transport = TransportConfig {
            read_poll_ms: 50,
            max_frame_size: 1024,
            ..TransportConfig::default()
        };
        let settings = ConnectionSettings::from_transport(&transport).unwrap();
        let addr = echo_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn: SecureConnection<ChatLine> = SecureConnection::start("echo", stream, settings);

        conn.send(line(1, &"x".repeat(4096))).await.unwrap();
        conn.send(line(2, "small")).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), conn.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, line(2, "small"));
        assert!(!conn.is_closed());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_stalled_peer_resumes_and_receives_everything_in_order() {
        const COUNT: u64 = 32;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = release_rx.await;
            let mut reader = BufReader::new(stream);
            let codec = FrameCodec::default();
            let mut ids = Vec::new();
            for _ in 0..COUNT {
                let msg: ChatLine = codec.read_frame(&mut reader, None).await.unwrap();
                ids.push(msg.id);
            }
            ids
        });

        let mut conn = connect(addr, None).await;
        let sender = conn.sender().unwrap();
        let big = "x".repeat(1 << 20);
        let mut producer = tokio::spawn(async move {
            for i in 0..COUNT {
                sender.send(line(i, &big)).await.unwrap();
            }
        });

        assert!(
            tokio::time::timeout(Duration::from_millis(300), &mut producer)
                .await
                .is_err(),
            "producer finished while the peer was not reading"
        );

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(20), producer)
            .await
            .expect("producer stayed blocked after the peer resumed")
            .unwrap();
        let ids = tokio::time::timeout(Duration::from_secs(20), server)
            .await
            .expect("peer never received every frame")
            .unwrap();
        assert_eq!(ids, (0..COUNT).collect::<Vec<_>>());
        conn.close().await;
    }
}
