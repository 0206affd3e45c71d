//! Local IPC: framed transport, typed messages, and channels.
//!
//! # Layers
//!
//! - [`transport`]: Unix domain sockets (named pipes on Windows)
//! - [`frame`]: `u32` native-endian length prefix + payload, 4 MiB max
//! - [`connection`] / [`server`]: one receive task per connection, one
//!   accept task per server
//! - [`message`] / [`value`]: JSON envelopes carrying a typed payload tree
//! - [`channel`] / [`channel_server`]: decoded events delivered to the
//!   owning task in FIFO order

pub mod channel;
pub mod channel_server;
pub mod connection;
pub mod frame;
pub mod message;
pub mod server;
pub mod transport;
pub mod value;

pub use channel::{Channel, ChannelEvent, ChannelListener, ChannelSender};
pub use channel_server::ChannelServer;
pub use connection::{Connection, ConnectionListener, FrameSender, TerminationReason};
pub use message::{next_transaction_id, Incoming, Message, Query, Response};
pub use server::{Server, ServerListener};
pub use transport::{ephemeral_address, named_address};
pub use value::{Value, ValueKind};
