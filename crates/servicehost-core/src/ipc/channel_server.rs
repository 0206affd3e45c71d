//! Server side of [`Channel`]: accepted connections arrive as channels on
//! the owner's task.

use super::channel::Channel;
use super::connection::Connection;
use super::server::{Server, ServerListener};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Hop {
    tx: mpsc::UnboundedSender<Channel>,
}

impl ServerListener for Hop {
    fn got_connection(&self, connection: Connection) {
        let id = connection.id();
        match Channel::from_connection(connection) {
            Ok(channel) => {
                if self.tx.send(channel).is_err() {
                    debug!("channel server closed, dropping connection {}", id);
                }
            }
            Err(e) => warn!("failed to wrap connection {}: {}", id, e),
        }
    }
}

/// Listens on one address and yields a [`Channel`] per accepted peer.
pub struct ChannelServer {
    server: Server,
    channels: mpsc::UnboundedReceiver<Channel>,
}

impl ChannelServer {
    pub fn start(address: &str) -> Result<Self> {
        let (tx, channels) = mpsc::unbounded_channel();
        let server = Server::start(address, Arc::new(Hop { tx }))?;
        Ok(Self { server, channels })
    }

    pub fn address(&self) -> &str {
        self.server.address()
    }

    /// Next accepted channel, or `None` after `stop`.
    pub async fn next_channel(&mut self) -> Option<Channel> {
        self.channels.recv().await
    }

    /// Stop accepting. Channels already queued but not yet taken are
    /// dropped before the accept loop is stopped.
    pub async fn stop(&mut self) {
        self.channels.close();
        while let Ok(channel) = self.channels.try_recv() {
            debug!("discarding queued channel {}", channel.id());
        }
        self.server.stop().await;
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.channels.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::ChannelEvent;
    use crate::ipc::message::Message;
    use crate::ipc::transport::ephemeral_address;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accepts_channels() {
        let address = ephemeral_address();
        let mut server = ChannelServer::start(&address).unwrap();

        let client = Channel::connect(&address).await.unwrap();
        assert!(client.send_message(&Message::new("loaded")));

        let mut accepted = tokio::time::timeout(Duration::from_secs(5), server.next_channel())
            .await
            .unwrap()
            .unwrap();
        match accepted.next_event().await {
            Some(ChannelEvent::Message(m)) => assert_eq!(m.command, "loaded"),
            other => panic!("unexpected {:?}", other),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drops_queued_channels() {
        let address = ephemeral_address();
        let mut server = ChannelServer::start(&address).unwrap();

        let mut client = Channel::connect(&address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop().await;
        assert!(server.next_channel().await.is_none());

        // The peer sees the discarded channel go away.
        let event = tokio::time::timeout(Duration::from_secs(5), client.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(ChannelEvent::Ended { .. })));
    }
}
