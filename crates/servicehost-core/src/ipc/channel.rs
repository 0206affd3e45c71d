//! Typed message channel over a [`Connection`].
//!
//! # Delivery
//!
//! The connection's receive task decodes each frame and posts a
//! [`ChannelEvent`] onto an unbounded FIFO queue (the "hop"). The task that
//! owns the `Channel` drains that queue with [`Channel::next_event`], so
//! listener code never runs concurrently with its owner. Frames that fail to
//! decode are logged and dropped.
//!
//! Queries may be answered immediately through [`Channel::dispatch`] or later
//! with [`Channel::send_response`] using the query's id.

use super::connection::{Connection, ConnectionListener, FrameSender, TerminationReason};
use super::message::{decode, Incoming, Message, Query, Response};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An event delivered on the owner's task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Message),
    Query(Query),
    Response(Response),
    Ended {
        reason: TerminationReason,
        error: Option<String>,
    },
}

/// Callback-style consumer of channel events, driven by [`Channel::dispatch`].
pub trait ChannelListener {
    fn on_message(&mut self, sender: &ChannelSender, message: Message);

    /// Return `true` to send `response` right away. Returning `false` means
    /// the listener will answer later with `send_response`.
    fn on_query(&mut self, sender: &ChannelSender, query: Query, response: &mut Response) -> bool;

    fn on_response(&mut self, sender: &ChannelSender, response: Response);

    fn channel_ended(&mut self, reason: TerminationReason, error: Option<String>);
}

/// Posts decoded frames from the receive task onto the owner's queue.
struct Hop {
    connection_id: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ConnectionListener for Hop {
    fn got_message(&self, bytes: &[u8]) {
        let event = match decode(bytes) {
            Ok(Incoming::Message(m)) => ChannelEvent::Message(m),
            Ok(Incoming::Query(q)) => ChannelEvent::Query(q),
            Ok(Incoming::Response(r)) => ChannelEvent::Response(r),
            Err(e) => {
                warn!("connection {}: dropping undecodable message: {}", self.connection_id, e);
                return;
            }
        };
        // A closed queue means the owner is gone; nothing left to deliver to.
        let _ = self.tx.send(event);
    }

    fn connection_ended(&self, reason: TerminationReason, error: Option<String>) {
        let _ = self.tx.send(ChannelEvent::Ended { reason, error });
    }
}

/// Cloneable sending half of a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelSender {
    frames: FrameSender,
}

impl ChannelSender {
    pub fn send_message(&self, message: &Message) -> bool {
        Self::send_encoded(&self.frames, message.encode())
    }

    pub fn send_query(&self, query: &Query) -> bool {
        Self::send_encoded(&self.frames, query.encode())
    }

    pub fn send_response(&self, response: &Response) -> bool {
        Self::send_encoded(&self.frames, response.encode())
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    fn send_encoded(frames: &FrameSender, encoded: Result<Vec<u8>>) -> bool {
        match encoded {
            Ok(bytes) => frames.send(bytes),
            Err(e) => {
                warn!("failed to encode outgoing message: {}", e);
                false
            }
        }
    }
}

/// A connection plus message decoding and owner-task delivery.
pub struct Channel {
    connection: Connection,
    sender: Option<ChannelSender>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Connect to `address` and start receiving.
    pub async fn connect(address: &str) -> Result<Self> {
        let connection = Connection::connect(address).await?;
        Self::from_connection(connection)
    }

    /// Wrap a connection whose receive task has not started yet.
    pub fn from_connection(mut connection: Connection) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let sender = connection.sender().map(|frames| ChannelSender { frames });
        connection.set_listener(Arc::new(Hop {
            connection_id: connection.id(),
            tx,
        }))?;
        debug!("channel up on connection {}", connection.id());
        Ok(Self {
            connection,
            sender,
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    /// A sending handle that can outlive borrows of the channel.
    pub fn sender(&self) -> Option<ChannelSender> {
        self.sender.clone()
    }

    pub fn send_message(&self, message: &Message) -> bool {
        self.sender.as_ref().is_some_and(|s| s.send_message(message))
    }

    pub fn send_query(&self, query: &Query) -> bool {
        self.sender.as_ref().is_some_and(|s| s.send_query(query))
    }

    pub fn send_response(&self, response: &Response) -> bool {
        self.sender.as_ref().is_some_and(|s| s.send_response(response))
    }

    /// Next event in arrival order. `None` once the channel has ended and
    /// every queued event was consumed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Feed one event to a listener, sending an immediate response when the
    /// listener asks for one.
    pub fn dispatch(&self, event: ChannelEvent, listener: &mut dyn ChannelListener) {
        let Some(sender) = self.sender.as_ref() else {
            if let ChannelEvent::Ended { reason, error } = event {
                listener.channel_ended(reason, error);
            }
            return;
        };
        match event {
            ChannelEvent::Message(m) => listener.on_message(sender, m),
            ChannelEvent::Query(q) => {
                let mut response = q.response();
                if listener.on_query(sender, q, &mut response) && !sender.send_response(&response)
                {
                    warn!("channel {}: failed to send immediate response", self.id());
                }
            }
            ChannelEvent::Response(r) => listener.on_response(sender, r),
            ChannelEvent::Ended { reason, error } => listener.channel_ended(reason, error),
        }
    }

    /// Drain events into `listener` until the channel ends.
    pub async fn run(&mut self, listener: &mut dyn ChannelListener) {
        while let Some(event) = self.next_event().await {
            let ended = matches!(event, ChannelEvent::Ended { .. });
            self.dispatch(event, listener);
            if ended {
                break;
            }
        }
    }

    /// Stop receiving and close the connection. Idempotent.
    pub async fn disconnect(&mut self) {
        self.sender = None;
        self.connection.disconnect().await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("connection", &self.connection)
            .finish()
    }
}
