//! Channel-multiplexed WebSocket connections
//!
//! A [`ChannelConn`] turns one upgraded WebSocket into a fixed set of numbered
//! byte streams. Each [`ChannelStream`] is an ordinary `AsyncRead + AsyncWrite`
//! pipe; the connection moves frames between the socket and the pipes:
//!
//! ```text
//!            ┌─ inbound queue ─► pipe ─► ChannelStream (read)
//! socket ──► reader ─┤
//!            └─ inbound queue ─► pipe ─► ChannelStream (read)
//!
//! ChannelStream (write) ─► pipe ─► pump ─┐
//!                                        ├─► writer ─► socket
//! ChannelStream (write) ─► pipe ─► pump ─┘
//! ```
//!
//! Every readable channel has its own queue, so a consumer that stops reading
//! one channel does not stall delivery to the others. A queue holds at most
//! [`MAX_INBOUND_BUFFER`] bytes; past that the channel fails: its stream reads
//! return an error and further frames for it are dropped. Frames addressed to an
//! unknown channel are ignored and frames for a channel the peer may not write
//! are dropped. Any traffic resets the idle timer; when it expires the whole
//! connection is torn down.

pub mod protocol;

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use protocol::{ChannelProtocol, ChannelType, Codec};

use protocol::{decode_frame, encode_frame, EncodedFrame};

/// Bytes a readable channel may hold before its reader takes them
pub const MAX_INBOUND_BUFFER: usize = 1024 * 1024;

/// In-memory pipe capacity per channel
const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest payload carried in one outgoing frame
const MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// Outgoing frames buffered ahead of the socket writer
const OUTBOUND_QUEUE: usize = 64;

/// How long `close` waits for buffered output to reach the socket
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type Frame = (u8, Vec<u8>);

/// Last time any frame crossed the socket
#[derive(Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

/// Inbound bytes queued for one channel but not yet in its pipe
struct InboundBuffer {
    buffered: AtomicUsize,
    overflow: CancellationToken,
}

impl InboundBuffer {
    fn new() -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            overflow: CancellationToken::new(),
        }
    }

    /// Account for `len` more bytes; false when that exceeds the limit
    fn reserve(&self, len: usize) -> bool {
        let previous = self.buffered.fetch_add(len, Ordering::AcqRel);
        if previous + len > MAX_INBOUND_BUFFER {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn release(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
    }
}

struct InboundQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    buffer: Arc<InboundBuffer>,
}

/// A multiplexed WebSocket connection
///
/// Dropping the connection without calling [`ChannelConn::close`] cancels all
/// of its tasks immediately.
pub struct ChannelConn {
    cancel: CancellationToken,
    outbound: Option<mpsc::Sender<Frame>>,
    writer: Option<JoinHandle<()>>,
    channels: Vec<ChannelType>,
}

impl ChannelConn {
    /// Start serving `channels` over `socket`
    ///
    /// Returns the connection and one stream per channel, in channel order.
    /// The connection's cancellation token is a child of `cancel`.
    pub fn open(
        socket: WebSocket,
        codec: Codec,
        channels: &[ChannelType],
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Self, Vec<ChannelStream>) {
        debug_assert!(channels.len() <= codec.max_channels());
        let cancel = cancel.child_token();
        let activity = Activity::new();
        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let mut streams = Vec::with_capacity(channels.len());
        let mut inbound = Vec::with_capacity(channels.len());

        for (index, kind) in channels.iter().copied().enumerate() {
            let index = index as u8;
            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
            let (remote_read, remote_write) = tokio::io::split(remote);

            if kind.readable() {
                let (tx, rx) = mpsc::unbounded_channel();
                let buffer = Arc::new(InboundBuffer::new());
                streams.push(ChannelStream::new(index, local, buffer.overflow.clone()));
                tokio::spawn(deliver_inbound(index, rx, remote_write, buffer.clone(), cancel.clone()));
                inbound.push(Some(InboundQueue { tx, buffer }));
            } else {
                streams.push(ChannelStream::new(index, local, CancellationToken::new()));
                inbound.push(None);
                tokio::spawn(close_pipe(remote_write));
            }

            // Only writable channels hold a sender, so the writer finishes as
            // soon as every writable stream is shut down.
            let tx = kind.writable().then(|| outbound_tx.clone());
            tokio::spawn(pump_outbound(index, remote_read, tx, cancel.clone()));
        }

        tokio::spawn(read_socket(stream, codec, inbound, activity.clone(), cancel.clone()));
        tokio::spawn(watch_idle(idle_timeout, activity.clone(), cancel.clone()));
        let writer = tokio::spawn(write_socket(sink, codec, outbound_rx, activity, cancel.clone()));

        let conn = Self {
            cancel,
            outbound: Some(outbound_tx),
            writer: Some(writer),
            channels: channels.to_vec(),
        };
        (conn, streams)
    }

    /// Token cancelled when the connection shuts down for any reason
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send a zero-length frame on a writable channel
    ///
    /// Clients use the first frame as a readiness signal.
    pub async fn send_empty(&self, index: u8) -> io::Result<()> {
        let writable = self
            .channels
            .get(index as usize)
            .is_some_and(|kind| kind.writable());
        if !writable {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel {index} is not writable"),
            ));
        }
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        tx.send((index, Vec::new()))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Flush pending output, send a close frame and stop all tasks
    ///
    /// Output is flushed once every [`ChannelStream`] has been shut down or
    /// dropped. Streams still held open after a grace period are abandoned.
    pub async fn close(mut self) {
        self.outbound.take();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                debug!("Timed out flushing channel output");
            }
        }
        self.cancel.cancel();
    }
}

impl Drop for ChannelConn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One numbered byte stream of a [`ChannelConn`]
///
/// Reads return end-of-file once the peer can no longer send on the channel,
/// and an error once the channel overflowed its inbound buffer. Writes to a
/// channel the server may not write are discarded. Shutting the stream down
/// ends the channel's output.
#[derive(Debug)]
pub struct ChannelStream {
    index: u8,
    inner: DuplexStream,
    overflow: CancellationToken,
}

impl ChannelStream {
    fn new(index: u8, inner: DuplexStream, overflow: CancellationToken) -> Self {
        Self {
            index,
            inner,
            overflow,
        }
    }

    /// Channel number
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Token cancelled when the peer sent more than [`MAX_INBOUND_BUFFER`]
    /// bytes the reader had not taken yet
    pub fn overflow_token(&self) -> CancellationToken {
        self.overflow.clone()
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.overflow.is_cancelled() {
            return Poll::Ready(Err(io::Error::other(format!(
                "channel {} exceeded its {MAX_INBOUND_BUFFER} byte inbound buffer",
                self.index
            ))));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn read_socket(
    mut stream: SplitStream<WebSocket>,
    codec: Codec,
    mut inbound: Vec<Option<InboundQueue>>,
    activity: Activity,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };

        let data = match msg {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                activity.touch();
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("Peer closed channel connection");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "Error on socket receive");
                break;
            }
        };
        activity.touch();

        if data.is_empty() {
            continue;
        }
        let (channel, payload) = match decode_frame(codec, &data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                continue;
            }
        };

        let Some(slot) = inbound.get_mut(channel as usize) else {
            trace!(channel, "Frame targets an unknown channel, ignoring");
            continue;
        };
        let Some(queue) = slot.as_mut() else {
            trace!(channel, "Frame targets a channel that is not readable, dropping");
            continue;
        };
        if payload.is_empty() {
            continue;
        }

        let len = payload.len();
        if !queue.buffer.reserve(len) {
            warn!(
                channel,
                limit = MAX_INBOUND_BUFFER,
                "Channel reader is not keeping up, failing channel"
            );
            queue.buffer.overflow.cancel();
            *slot = None;
            continue;
        }
        if queue.tx.send(payload).is_err() {
            queue.buffer.release(len);
            trace!(channel, "Channel reader gone, dropping frame");
        }
    }

    // Peer is gone; tear everything down
    cancel.cancel();
}

async fn deliver_inbound(
    index: u8,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut pipe: WriteHalf<DuplexStream>,
    buffer: Arc<InboundBuffer>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = buffer.overflow.cancelled() => break,
            payload = rx.recv() => payload,
        };
        let Some(payload) = payload else { break };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = buffer.overflow.cancelled() => break,
            written = pipe.write_all(&payload) => written,
        };
        buffer.release(payload.len());
        if let Err(e) = written {
            trace!(channel = index, error = %e, "Channel reader closed");
            break;
        }
    }
    let _ = pipe.shutdown().await;
}

async fn close_pipe(mut pipe: WriteHalf<DuplexStream>) {
    let _ = pipe.shutdown().await;
}

/// Move bytes written to a channel stream into frames; without a sender the
/// bytes are discarded
async fn pump_outbound(
    index: u8,
    mut pipe: ReadHalf<DuplexStream>,
    tx: Option<mpsc::Sender<Frame>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            n = pipe.read(&mut buf) => n,
        };
        let n = match n {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Some(tx) = &tx {
            if tx.send((index, buf[..n].to_vec())).await.is_err() {
                break;
            }
        }
    }
}

async fn write_socket(
    mut sink: SplitSink<WebSocket, Message>,
    codec: Codec,
    mut rx: mpsc::Receiver<Frame>,
    activity: Activity,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some((channel, data)) = frame else { break };

        let msg = match encode_frame(codec, channel, &data) {
            Ok(EncodedFrame::Binary(frame)) => Message::Binary(frame.into()),
            Ok(EncodedFrame::Text(frame)) => Message::Text(frame.into()),
            Err(e) => {
                warn!(channel, error = %e, "Dropping outgoing frame");
                continue;
            }
        };
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "Error on socket send");
            cancel.cancel();
            return;
        }
        activity.touch();
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn watch_idle(timeout: Duration, activity: Activity, cancel: CancellationToken) {
    loop {
        let deadline = activity.last() + timeout;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if activity.last() + timeout <= Instant::now() {
            info!(timeout_secs = timeout.as_secs(), "Channel connection idle, closing");
            cancel.cancel();
            return;
        }
    }
}
