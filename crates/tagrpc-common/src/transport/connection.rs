use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::codec::wire::{Decoder, Encoder};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::value::Value;

use super::frame::{self, LENGTH_PREFIX, MIN_FRAME_SIZE};
use super::registry;

/// Header entries exchanged when a connection opens.
pub type Header = Vec<(String, Value)>;

static CLOCK_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Milliseconds on the monotonic clock the watchdog uses. Never zero.
pub fn clock_ms() -> u64 {
    CLOCK_EPOCH.elapsed().as_millis() as u64 + 1
}

/// Tunables for a single connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest frame accepted in either direction.
    pub max_message_size: usize,
    /// A read or write blocked longer than this closes the connection.
    pub stall_timeout_ms: u64,
    /// Interval between warnings about a blocked read or write.
    pub warning_period_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: frame::DEFAULT_MAX_MESSAGE_SIZE,
            stall_timeout_ms: frame::DEFAULT_STALL_TIMEOUT_MS,
            warning_period_ms: frame::DEFAULT_WARNING_PERIOD_MS,
        }
    }
}

/// Receives the outcome of an asynchronous call.
pub trait Callback: Send + Sync {
    fn on_callback(&self, value: Value);

    fn on_exception(&self, error: RpcError);
}

/// Handles incoming frames on a connection's background reader.
#[async_trait]
pub trait FrameReader: Send + Sync + 'static {
    /// Reads and handles one frame. Returns once the frame is consumed.
    async fn on_frame(&self, connection: &Arc<Connection>) -> Result<()>;

    /// Called with errors from [`FrameReader::on_frame`] while the connection
    /// is still open. Fatal errors close the connection afterwards.
    fn on_exception(&self, connection: &Connection, error: &RpcError) {
        tracing::warn!(connection = %connection.name(), error = %error, "frame reader failed");
    }
}

/// When the watchdog starts timing a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// A reply is expected now, so waiting for it counts as a stall.
    Reply,
    /// The peer may stay quiet indefinitely. Timing starts once the first
    /// bytes of a frame arrive.
    Idle,
}

struct ReadState {
    stream: Option<OwnedReadHalf>,
    decoder: Decoder,
    buf: Vec<u8>,
}

struct WriteState {
    stream: Option<OwnedWriteHalf>,
    encoder: Encoder,
    buf: BytesMut,
}

struct PendingCallback {
    method: String,
    registered_ms: u64,
    callback: Arc<dyn Callback>,
}

#[derive(Default)]
struct Stall {
    since: u64,
    next_warning_ms: u64,
}

#[derive(Default)]
struct Stalls {
    read: Stall,
    write: Stall,
}

fn map_io_error(err: std::io::Error) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => RpcError::EndOfStream,
        _ => RpcError::Io(err),
    }
}

/// A framed, handshaken TCP connection.
///
/// The read and write halves are locked independently: one task may write a
/// frame while another is blocked reading. Each half owns its side of the
/// interning tables, so frames must be consumed in the order they were sent.
///
/// Connections register with the process-wide watchdog, which closes them
/// when a read or write stalls past [`ConnectionConfig::stall_timeout_ms`].
/// Closing fails every pending callback.
pub struct Connection {
    id: u64,
    name: String,
    peer: Option<SocketAddr>,
    config: ConnectionConfig,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<WriteState>,
    callbacks: Mutex<HashMap<u64, PendingCallback>>,
    sequence: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reader_attached: AtomicBool,
    peer_header: OnceLock<Header>,
    reading_since: AtomicU64,
    writing_since: AtomicU64,
    stalls: Mutex<Stalls>,
}

impl Connection {
    /// Wraps a connected stream and exchanges headers with the peer.
    ///
    /// Both sides write their header first and then read the peer's, so the
    /// handshake is symmetric.
    ///
    /// # Arguments
    ///
    /// * `stream` - A connected TCP stream
    /// * `name` - Name used in logs and errors
    /// * `header` - Entries sent to the peer
    /// * `config` - Frame size and watchdog limits
    ///
    /// # Errors
    ///
    /// Any handshake failure closes the connection and is returned.
    pub async fn open(
        stream: TcpStream,
        name: impl Into<String>,
        header: &[(String, Value)],
        config: ConnectionConfig,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);

        let conn = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            peer,
            config,
            reader: tokio::sync::Mutex::new(ReadState {
                stream: Some(read),
                decoder: Decoder::new(),
                buf: Vec::with_capacity(MIN_FRAME_SIZE),
            }),
            writer: tokio::sync::Mutex::new(WriteState {
                stream: Some(write),
                encoder: Encoder::new(),
                buf: BytesMut::with_capacity(MIN_FRAME_SIZE),
            }),
            callbacks: Mutex::new(HashMap::new()),
            // zero is reserved for synchronous calls
            sequence: AtomicU64::new(seed.max(1)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reader_attached: AtomicBool::new(false),
            peer_header: OnceLock::new(),
            reading_since: AtomicU64::new(0),
            writing_since: AtomicU64::new(0),
            stalls: Mutex::new(Stalls::default()),
        });
        registry::register(&conn);

        match conn.handshake(header).await {
            Ok(peer_header) => {
                let _ = conn.peer_header.set(peer_header);
                tracing::debug!(connection = %conn.name, peer = ?conn.peer, "connection open");
                Ok(conn)
            }
            Err(e) => {
                tracing::debug!(connection = %conn.name, error = %e, "handshake failed");
                conn.close();
                Err(e)
            }
        }
    }

    /// Dials `addr` and opens a connection over the new stream.
    ///
    /// # Errors
    ///
    /// Returns `Connect` when the address cannot be reached, otherwise any
    /// error from [`Connection::open`].
    pub async fn connect(
        addr: &str,
        name: impl Into<String>,
        header: &[(String, Value)],
        config: ConnectionConfig,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::Connect(format!("Failed to connect to {addr}: {e}")))?;
        Self::open(stream, name, header, config).await
    }

    async fn handshake(&self, header: &[(String, Value)]) -> Result<Header> {
        let local = Value::Map(
            header
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect(),
        );
        self.write_frame(|enc, buf| enc.write_value(buf, &local)).await?;
        let remote = self
            .read_frame(ReadMode::Reply, |dec, buf| dec.read_value(buf))
            .await?;
        match remote {
            Value::Null => Ok(Vec::new()),
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    Value::String(k) => Ok((k, v)),
                    other => Err(RpcError::StreamCorrupted(format!(
                        "header key must be a String, got {}",
                        other.type_label()
                    ))),
                })
                .collect(),
            other => Err(RpcError::StreamCorrupted(format!(
                "expected a header map, got {}",
                other.type_label()
            ))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Header the peer sent during the handshake.
    pub fn peer_header(&self) -> &[(String, Value)] {
        self.peer_header.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn peer_header_value(&self, key: &str) -> Option<&Value> {
        self.peer_header()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> RpcError {
        RpcError::ConnectionClosed(self.name.clone())
    }

    /// Next sequence number for an asynchronous call.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Encodes and sends one frame.
    ///
    /// `encode` appends the frame body to the buffer. If it fails, or the
    /// frame turns out larger than the configured maximum, nothing is sent,
    /// names interned for the abandoned frame are forgotten and the
    /// connection stays open.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the connection is closed
    /// - `NotSerializable` / `MessageTooLarge` from encoding
    /// - `EndOfStream` / `Io` when the socket fails, which also closes the
    ///   connection
    pub async fn write_frame<F>(&self, encode: F) -> Result<()>
    where
        F: FnOnce(&mut Encoder, &mut BytesMut) -> Result<()>,
    {
        let mut guard = self.writer.lock().await;
        let WriteState {
            stream,
            encoder,
            buf,
        } = &mut *guard;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Some(io) = stream.as_mut() else {
            return Err(self.closed_error());
        };

        let mark = encoder.checkpoint();
        frame::begin_frame(buf);
        let encoded = encode(encoder, buf)
            .and_then(|()| frame::finish_frame(buf, self.config.max_message_size));
        if let Err(e) = encoded {
            encoder.rollback(mark);
            return Err(e);
        }

        self.writing_since.store(clock_ms(), Ordering::Relaxed);
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(self.closed_error()),
            r = async {
                io.write_all(&buf[..]).await?;
                io.flush().await
            } => r.map_err(map_io_error),
        };
        self.writing_since.store(0, Ordering::Relaxed);

        if result.is_err() {
            *stream = None;
            drop(guard);
            self.close();
        }
        result
    }

    /// Receives one frame and decodes its body.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the connection is, or becomes, closed
    /// - `EndOfStream` when the peer hangs up
    /// - `StreamCorrupted` for bad lengths or undecodable bodies
    ///
    /// Socket errors and fatal decode errors close the connection.
    pub async fn read_frame<T, F>(&self, mode: ReadMode, decode: F) -> Result<T>
    where
        F: FnOnce(&mut Decoder, &mut &[u8]) -> Result<T>,
    {
        let mut guard = self.reader.lock().await;
        let ReadState {
            stream,
            decoder,
            buf,
        } = &mut *guard;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Some(io) = stream.as_mut() else {
            return Err(self.closed_error());
        };

        if mode == ReadMode::Reply {
            self.reading_since.store(clock_ms(), Ordering::Relaxed);
        }
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(self.closed_error()),
            r = read_raw(io, buf, mode, &self.reading_since, self.config.max_message_size) => r,
        };
        self.reading_since.store(0, Ordering::Relaxed);

        let decoded = result.and_then(|len| {
            let mut body = &buf[LENGTH_PREFIX..len];
            decode(decoder, &mut body)
        });
        if let Err(e) = &decoded {
            if e.is_fatal_to_connection() {
                *stream = None;
                drop(guard);
                self.close();
            }
        }
        decoded
    }

    /// Registers the callback for an asynchronous call.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection closed before the
    /// callback could be recorded.
    pub fn add_callback(
        &self,
        sequence: u64,
        method: &str,
        callback: Arc<dyn Callback>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                sequence,
                PendingCallback {
                    method: method.to_string(),
                    registered_ms: clock_ms(),
                    callback,
                },
            );
        // a close that raced the insert did not see this entry
        if self.is_closed() && self.remove_callback(sequence).is_some() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    pub fn remove_callback(&self, sequence: u64) -> Option<Arc<dyn Callback>> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sequence)
            .map(|pending| pending.callback)
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Attaches a background task that feeds every incoming frame to
    /// `reader` until the connection closes. Only the first reader attached
    /// takes effect.
    pub fn set_reader(self: &Arc<Self>, reader: Arc<dyn FrameReader>) {
        if self.reader_attached.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            while !conn.is_closed() {
                if let Err(e) = reader.on_frame(&conn).await {
                    if conn.is_closed() {
                        break;
                    }
                    reader.on_exception(&conn, &e);
                    if e.is_fatal_to_connection() {
                        conn.close();
                    }
                }
            }
            tracing::debug!(connection = %conn.name, "reader stopped");
        });
    }

    pub fn has_reader(&self) -> bool {
        self.reader_attached.load(Ordering::SeqCst)
    }

    /// Watchdog pass, run periodically by the registry.
    ///
    /// Warns about reads or writes blocked longer than the warning period,
    /// and closes the connection when one has been blocked past the stall
    /// timeout or an asynchronous reply is overdue by as much.
    pub fn timed_check(&self, now_ms: u64) {
        if self.is_closed() {
            return;
        }
        let stalled = {
            let mut stalls = self.stalls.lock().unwrap_or_else(PoisonError::into_inner);
            let read = self.check_stall(
                "read",
                self.reading_since.load(Ordering::Relaxed),
                &mut stalls.read,
                now_ms,
            );
            let write = self.check_stall(
                "write",
                self.writing_since.load(Ordering::Relaxed),
                &mut stalls.write,
                now_ms,
            );
            read || write
        };
        if stalled {
            self.close();
            return;
        }

        let overdue = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| (p.registered_ms, p.method.clone()))
            .min_by_key(|(registered, _)| *registered);
        if let Some((registered, method)) = overdue {
            let waited = now_ms.saturating_sub(registered);
            if waited > self.config.stall_timeout_ms {
                tracing::warn!(
                    connection = %self.name,
                    method = %method,
                    waited_ms = waited,
                    "closing connection with overdue reply"
                );
                self.close();
            }
        }
    }

    fn check_stall(&self, op: &str, since: u64, stall: &mut Stall, now_ms: u64) -> bool {
        if since == 0 {
            return false;
        }
        if stall.since != since {
            stall.since = since;
            stall.next_warning_ms = since + self.config.warning_period_ms;
        }
        let blocked = now_ms.saturating_sub(since);
        if blocked > self.config.stall_timeout_ms {
            tracing::warn!(connection = %self.name, op, blocked_ms = blocked, "closing stalled connection");
            return true;
        }
        if now_ms >= stall.next_warning_ms {
            tracing::warn!(connection = %self.name, op, blocked_ms = blocked, "waiting on slow {op}");
            stall.next_warning_ms = now_ms + self.config.warning_period_ms;
        }
        false
    }

    /// Closes the connection. Idempotent.
    ///
    /// In-flight reads and writes are woken and fail with
    /// `ConnectionClosed`. Every pending callback is failed the same way.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        // halves busy with I/O drop their stream when the cancellation wakes them
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.stream = None;
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.stream = None;
        }
        registry::unregister(self.id);

        let pending: Vec<PendingCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for p in pending {
            p.callback.on_exception(self.closed_error());
        }
        tracing::debug!(connection = %self.name, "connection closed");
    }
}

async fn read_raw(
    io: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
    mode: ReadMode,
    reading_since: &AtomicU64,
    max: usize,
) -> Result<usize> {
    buf.clear();
    buf.resize(MIN_FRAME_SIZE, 0);
    let mut filled = 0;
    if mode == ReadMode::Idle {
        filled = io.read(&mut buf[..]).await.map_err(map_io_error)?;
        if filled == 0 {
            return Err(RpcError::EndOfStream);
        }
        reading_since.store(clock_ms(), Ordering::Relaxed);
    }
    io.read_exact(&mut buf[filled..MIN_FRAME_SIZE])
        .await
        .map_err(map_io_error)?;
    let len = frame::frame_length([buf[0], buf[1], buf[2], buf[3]], max)?;
    if len > MIN_FRAME_SIZE {
        buf.resize(len, 0);
        io.read_exact(&mut buf[MIN_FRAME_SIZE..len])
            .await
            .map_err(map_io_error)?;
    }
    Ok(len)
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
