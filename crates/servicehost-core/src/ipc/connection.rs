//! One framed duplex connection with a private receive task.
//!
//! # Lifecycle
//!
//! A `Connection` starts out connected but silent: incoming bytes queue in
//! the socket until [`Connection::set_listener`] spawns the receive task.
//! Outgoing frames go through an unbounded queue drained by a writer task,
//! so [`Connection::send_message`] never blocks and preserves order.
//!
//! The receive task waits on two things at once: the next frame, and a
//! private stop signal. The stop signal always means "stop". When the task
//! exits it reports exactly one [`TerminationReason`] to the listener.

use super::frame::{validate_outgoing, write_frame, FrameReader};
use super::transport::{self, IpcStream};
use crate::{HostError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a connection's receive task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// A framing violation (zero-length or oversized frame).
    ProtocolError,
    /// `disconnect()` was called or the connection was dropped.
    DisconnectCalled,
    /// The peer closed its end.
    PeerClosed,
    /// An unexpected I/O failure.
    InternalError,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::ProtocolError => "protocol error",
            TerminationReason::DisconnectCalled => "disconnect called",
            TerminationReason::PeerClosed => "peer closed",
            TerminationReason::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// Receives raw frames and the terminal notification.
///
/// Both methods run on the connection's receive task and must not block.
pub trait ConnectionListener: Send + Sync + 'static {
    fn got_message(&self, bytes: &[u8]);
    fn connection_ended(&self, reason: TerminationReason, error: Option<String>);
}

/// Cloneable sending side of a [`Connection`].
///
/// Holding a `FrameSender` does not keep the connection open: once the
/// connection is disconnected or dropped, the queue closes and sends fail.
#[derive(Debug, Clone)]
pub struct FrameSender {
    connection_id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSender {
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        if let Err(e) = validate_outgoing(&bytes) {
            warn!("connection {}: refusing to send: {}", self.connection_id, e);
            return false;
        }
        self.tx.send(bytes).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A live framed byte stream to a local peer.
pub struct Connection {
    id: u64,
    reader: Option<ReadHalf<IpcStream>>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stop_tx: Option<oneshot::Sender<()>>,
    writer_close_tx: Option<oneshot::Sender<()>>,
    receive_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connect to a listening endpoint.
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = transport::connect(address).await?;
        debug!("connected to {}", address);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream. The receive task is not started.
    pub fn from_stream(stream: IpcStream) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(stream);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (writer_close_tx, writer_close_rx) = oneshot::channel();
        let writer_task = tokio::spawn(Self::write_loop(id, writer, outgoing_rx, writer_close_rx));

        Self {
            id,
            reader: Some(reader),
            outgoing: Some(outgoing_tx),
            stop_tx: None,
            writer_close_tx: Some(writer_close_tx),
            receive_task: None,
            writer_task: Some(writer_task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection can still carry outgoing frames.
    pub fn is_connected(&self) -> bool {
        self.outgoing.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Install the listener and start the receive task.
    ///
    /// Only the first call has an effect; a connection has one receive task.
    pub fn set_listener(&mut self, listener: Arc<dyn ConnectionListener>) -> Result<()> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| HostError::InvalidState("listener already set or disconnected".into()))?;
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        self.receive_task = Some(tokio::spawn(Self::receive_loop(
            self.id, reader, listener, stop_rx,
        )));
        Ok(())
    }

    /// Queue one frame for sending. Returns false if the frame is invalid or
    /// the connection can no longer send.
    pub fn send_message(&self, bytes: Vec<u8>) -> bool {
        match self.sender() {
            Some(sender) => sender.send(bytes),
            None => false,
        }
    }

    /// A cloneable handle onto the outgoing queue.
    pub fn sender(&self) -> Option<FrameSender> {
        self.outgoing.as_ref().map(|tx| FrameSender {
            connection_id: self.id,
            tx: tx.clone(),
        })
    }

    /// Stop the receive task, wait for it, and close both halves.
    ///
    /// Idempotent. Queued outgoing frames are flushed before the write half
    /// closes.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.receive_task.take() {
            let _ = task.await;
        }
        self.reader = None;
        self.outgoing = None;
        if let Some(tx) = self.writer_close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
    }

    async fn receive_loop(
        id: u64,
        mut reader: ReadHalf<IpcStream>,
        listener: Arc<dyn ConnectionListener>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut frames = FrameReader::new();

        let (reason, error) = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break (TerminationReason::DisconnectCalled, None),
                frame = frames.next_frame(&mut reader) => match frame {
                    Ok(Some(bytes)) => listener.got_message(bytes),
                    Ok(None) => break (TerminationReason::PeerClosed, None),
                    Err(e) => break classify_read_error(e),
                },
            }
        };

        debug!("connection {} receive task ended: {}", id, reason);
        listener.connection_ended(reason, error);
    }

    async fn write_loop(
        id: u64,
        mut writer: WriteHalf<IpcStream>,
        mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                frame = outgoing.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!("connection {} write failed: {}", id, e);
                        outgoing.close();
                        break;
                    }
                }
                _ = &mut close_rx => {
                    // Refuse new frames, flush what is already queued.
                    outgoing.close();
                    while let Ok(frame) = outgoing.try_recv() {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
    }
}

fn classify_read_error(err: HostError) -> (TerminationReason, Option<String>) {
    match &err {
        HostError::FrameSize { .. } => (TerminationReason::ProtocolError, Some(err.to_string())),
        HostError::Io {
            source: Some(io), ..
        } if matches!(
            io.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ) =>
        {
            (TerminationReason::PeerClosed, Some(err.to_string()))
        }
        _ => (TerminationReason::InternalError, Some(err.to_string())),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The receive task reports DisconnectCalled; the writer flushes and
        // closes the queue.
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.writer_close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("running", &self.receive_task.is_some())
            .finish()
    }
}
