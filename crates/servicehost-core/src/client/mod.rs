//! Client library for talking to the daemon.
//!
//! A [`Client`] owns one session channel. Requests return a transaction id
//! right away. Their outcomes, invoke callbacks and user prompts arrive as
//! [`ClientEvent`]s from [`Client::next_event`], which also drives the
//! channel, so the owner calls it in a loop.

pub mod session;
pub mod transaction;

pub use session::{
    installed_versions, killswitch_exit_code, DaemonLauncher, DaemonProcess, InstallLayout,
    ProcessLauncher, SessionCreator, SessionOptions,
};
pub use transaction::{ClientEvent, Outcome, TransactionKind, TransactionManager};

use crate::ipc::{Channel, ChannelEvent, Message, Query, Response, Value, ValueKind};
use crate::{HostError, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub struct Client {
    channel: Channel,
    transactions: TransactionManager,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    ended: bool,
}

impl Client {
    /// Open a session, launching the daemon if needed.
    pub async fn connect(options: SessionOptions, launcher: Arc<dyn DaemonLauncher>) -> Result<Self> {
        let channel = SessionCreator::new(options, launcher).create_session().await?;
        Ok(Self::from_channel(channel))
    }

    /// Wrap a channel on which a session is already open.
    pub fn from_channel(channel: Channel) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            channel,
            transactions: TransactionManager::new(tx),
            events,
            ended: false,
        }
    }

    /// Next event, driving the channel while none is ready. `None` once the
    /// channel has ended and every event was consumed.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Ok(event) = self.events.try_recv() {
                return Some(event);
            }
            if self.ended {
                return None;
            }
            match self.channel.next_event().await {
                Some(event) => {
                    self.ended = matches!(event, ChannelEvent::Ended { .. });
                    self.channel.dispatch(event, &mut self.transactions);
                }
                None => self.ended = true,
            }
        }
    }

    /// Requests not yet answered.
    pub fn outstanding(&self) -> usize {
        self.transactions.outstanding()
    }

    fn check_live(&self) -> Result<()> {
        if self.transactions.peer_ended() {
            Err(HostError::PeerEndedConnection)
        } else {
            Ok(())
        }
    }

    fn send(&mut self, query: Query, kind: TransactionKind) -> Result<u32> {
        self.check_live()?;
        let tid = query.id;
        self.transactions.add_transaction(tid, kind);
        if !self.channel.send_query(&query) {
            self.transactions.cancel_transaction(tid);
            return Err(HostError::InvalidState(format!("failed to send {}", query.command)));
        }
        debug!("sent {} as transaction {}", query.command, tid);
        Ok(tid)
    }

    /// Invoke `function` on the newest installed `service` matching `version`.
    pub fn execute(
        &mut self,
        service: &str,
        version: &str,
        function: &str,
        arguments: Option<Value>,
    ) -> Result<u32> {
        if service.is_empty() || function.is_empty() {
            return Err(HostError::InvalidParameter(
                "service and function names are required".into(),
            ));
        }
        let mut payload = Value::map()
            .with("service", service)
            .with("version", version)
            .with("function", function);
        if let Some(arguments) = arguments {
            payload.insert("arguments", arguments);
        }
        self.send(Query::new("Invoke").with_payload(payload), TransactionKind::Invoke)
    }

    /// Ask the daemon to make `services` available.
    ///
    /// `arguments` is `{services: [...], progressCallback?: <callback>}`.
    pub fn require(&mut self, arguments: Value) -> Result<u32> {
        let Some(map) = arguments.as_map() else {
            return Err(HostError::InvalidParameter("require arguments must be a map".into()));
        };
        if !arguments.has("services", ValueKind::List) {
            return Err(HostError::InvalidParameter("require needs a 'services' list".into()));
        }
        for (key, value) in map {
            match key.as_str() {
                "services" => {}
                "progressCallback" if value.kind() == ValueKind::Callback => {}
                other => {
                    return Err(HostError::InvalidParameter(format!(
                        "unexpected require argument '{}'",
                        other
                    )))
                }
            }
        }
        self.send(Query::new("Require").with_payload(arguments), TransactionKind::Require)
    }

    pub fn describe(&mut self, name: &str, version: Option<&str>, min_version: Option<&str>) -> Result<u32> {
        if name.is_empty() {
            return Err(HostError::InvalidParameter("service name is required".into()));
        }
        let mut payload = Value::map().with("name", name);
        if let Some(v) = version {
            payload.insert("version", v);
        }
        if let Some(v) = min_version {
            payload.insert("minversion", v);
        }
        self.send(Query::new("Describe").with_payload(payload), TransactionKind::Describe)
    }

    /// List the services the daemon can run, installed and built in.
    pub fn enumerate(&mut self) -> Result<u32> {
        self.send(Query::new("ActiveServices"), TransactionKind::Enumerate)
    }

    pub fn get_state(&mut self, key: &str) -> Result<u32> {
        if key.is_empty() {
            return Err(HostError::InvalidParameter("state key is required".into()));
        }
        self.send(
            Query::new("GetState").with_payload(Value::map().with("key", key)),
            TransactionKind::GetState,
        )
    }

    pub fn set_state(&mut self, key: &str, value: Value) -> Result<()> {
        self.check_live()?;
        if key.is_empty() {
            return Err(HostError::InvalidParameter("state key is required".into()));
        }
        let message = Message::new("SetState").with_payload(Value::map().with("key", key).with("value", value));
        if !self.channel.send_message(&message) {
            return Err(HostError::InvalidState("failed to send SetState".into()));
        }
        Ok(())
    }

    /// Answer a [`ClientEvent::PromptUser`].
    pub fn deliver_user_response(&mut self, prompt_id: u32, response: Value) -> Result<()> {
        self.check_live()?;
        let reply = Response::new(prompt_id, "PromptUser").with_payload(response);
        if !self.channel.send_response(&reply) {
            return Err(HostError::InvalidState("failed to send user response".into()));
        }
        Ok(())
    }

    pub fn cancel(&mut self, _tid: u32) -> Result<()> {
        Err(HostError::NotImplemented("cancel"))
    }

    pub async fn disconnect(&mut self) {
        self.channel.disconnect().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("channel", &self.channel)
            .field("outstanding", &self.transactions.outstanding())
            .field("ended", &self.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::ipc::ChannelServer;
    use std::time::Duration;

    async fn pair() -> (Client, Channel) {
        let address = crate::ipc::ephemeral_address();
        let mut server = ChannelServer::start(&address).unwrap();
        let channel = Channel::connect(&address).await.unwrap();
        let daemon = server.next_channel().await.unwrap();
        (Client::from_channel(channel), daemon)
    }

    async fn next_query(daemon: &mut Channel) -> Query {
        match tokio::time::timeout(Duration::from_secs(5), daemon.next_event()).await {
            Ok(Some(ChannelEvent::Query(q))) => q,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parameter_validation() {
        let (mut client, _daemon) = pair().await;
        assert!(matches!(client.execute("", "", "echo", None), Err(HostError::InvalidParameter(_))));
        assert!(matches!(client.describe("", None, None), Err(HostError::InvalidParameter(_))));
        assert!(matches!(client.require(Value::from("x")), Err(HostError::InvalidParameter(_))));
        assert!(matches!(client.require(Value::map()), Err(HostError::InvalidParameter(_))));

        let extra = Value::map()
            .with("services", Value::List(vec![]))
            .with("extra", true);
        assert!(matches!(client.require(extra), Err(HostError::InvalidParameter(_))));

        let bad_callback = Value::map()
            .with("services", Value::List(vec![]))
            .with("progressCallback", 3i64);
        assert!(matches!(client.require(bad_callback), Err(HostError::InvalidParameter(_))));

        let ok = Value::map()
            .with("services", Value::List(vec![]))
            .with("progressCallback", Value::Callback(3));
        assert!(client.require(ok).is_ok());
        assert!(matches!(client.cancel(1), Err(HostError::NotImplemented(_))));
        assert_eq!(client.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_requests_reach_daemon() {
        let (mut client, mut daemon) = pair().await;

        let tid = client.describe("Echo", Some("1"), None).unwrap();
        let q = next_query(&mut daemon).await;
        assert_eq!(q.id, tid);
        assert_eq!(q.command, "Describe");
        let payload = q.payload.unwrap();
        assert_eq!(payload.get_str("version"), Some("1"));
        assert!(payload.get("minversion").is_none());

        client.enumerate().unwrap();
        assert_eq!(next_query(&mut daemon).await.command, "ActiveServices");

        client.set_state("color", Value::from("blue")).unwrap();
        match daemon.next_event().await {
            Some(ChannelEvent::Message(m)) => {
                assert_eq!(m.command, "SetState");
                assert_eq!(m.payload.unwrap().get_str("value"), Some("blue"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_calls_after_peer_end() {
        let (mut client, mut daemon) = pair().await;
        let tid = client.get_state("color").unwrap();
        let _ = next_query(&mut daemon).await;
        daemon.disconnect().await;

        match client.next_event().await {
            Some(ClientEvent::State { tid: got, result: Err(f) }) => {
                assert_eq!(got, tid);
                assert_eq!(f.code, ErrorCode::PeerEndedConnection);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.next_event().await, Some(ClientEvent::PeerEnded));
        assert_eq!(client.next_event().await, None);

        assert!(matches!(client.enumerate(), Err(HostError::PeerEndedConnection)));
        assert!(matches!(
            client.set_state("k", Value::Null),
            Err(HostError::PeerEndedConnection)
        ));
    }
}
