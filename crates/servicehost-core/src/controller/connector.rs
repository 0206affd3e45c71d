//! One-shot rendezvous listener for a freshly spawned service.
//!
//! The child connects back to the connector's ephemeral address and sends
//! `loaded {service, version, apiVersion}`. The connector accepts exactly one
//! channel, validates the handshake and hands the channel to its controller.
//! It holds the controller weakly: if the controller is gone by then, the
//! channel is closed.

use super::controller::Controller;
use crate::ipc::{ephemeral_address, Channel, ChannelEvent, ChannelServer, Message, ValueKind};
use crate::Result;
use std::sync::Weak;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) struct Connector {
    address: String,
    task: JoinHandle<()>,
}

/// A validated `loaded` handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub service: String,
    pub version: String,
    pub api_version: i64,
}

impl Handshake {
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.command != "loaded" {
            return None;
        }
        let payload = message.payload.as_ref()?;
        if !payload.has("service", ValueKind::String)
            || !payload.has("version", ValueKind::String)
            || !payload.has("apiVersion", ValueKind::Integer)
        {
            return None;
        }
        Some(Self {
            service: payload.get_str("service")?.to_string(),
            version: payload.get_str("version")?.to_string(),
            api_version: payload.get_i64("apiVersion")?,
        })
    }
}

impl Connector {
    /// Bind a fresh ephemeral address and wait for one service connection.
    pub fn start(controller: Weak<Controller>) -> Result<Self> {
        let address = ephemeral_address();
        let server = ChannelServer::start(&address)?;
        info!("service connector listening on {}", address);
        let task = tokio::spawn(Self::rendezvous(server, controller));
        Ok(Self { address, task })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn rendezvous(mut server: ChannelServer, controller: Weak<Controller>) {
        let Some(mut channel) = server.next_channel().await else {
            return;
        };
        debug!("received service connection, waiting for 'loaded' message");
        server.stop().await;

        let handshake = loop {
            match channel.next_event().await {
                Some(ChannelEvent::Message(m)) => match Handshake::from_message(&m) {
                    Some(h) => break Some(h),
                    None => {
                        error!("received unexpected or malformed message from service: {}", m.command);
                        break None;
                    }
                },
                Some(ChannelEvent::Query(q)) => {
                    error!("got unexpected (early) query from service: {}", q.command);
                }
                Some(ChannelEvent::Response(r)) => {
                    error!("got unexpected (early) response from service: {}", r.command);
                }
                Some(ChannelEvent::Ended { reason, .. }) => {
                    error!("service IPC channel ended before handshake: {}", reason);
                    break None;
                }
                None => break None,
            }
        };

        let Some(controller) = controller.upgrade() else {
            if let Some(h) = handshake {
                warn!(
                    "{} v{} connected, but its controller is gone; closing",
                    h.service, h.version
                );
            }
            Self::discard(channel).await;
            return;
        };

        match handshake {
            Some(h) => controller.on_connected(channel, h),
            None => {
                Self::discard(channel).await;
                controller.connect_failed();
            }
        }
    }

    async fn discard(mut channel: Channel) {
        debug!("cleaning up unwanted service IPC connection {}", channel.id());
        channel.disconnect().await;
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.task.abort();
    }
}
