//! Correlates daemon responses with the client requests they answer.
//!
//! Many requests share one channel. Each outstanding request is recorded
//! under its transaction id with the kind of answer it expects. A response
//! removes its record before the outcome is published, so whoever consumes
//! [`ClientEvent`]s may immediately issue new requests. `InvokeCallback`
//! messages are routed to their invoke transaction without removing it.

use crate::error::{ErrorCode, ServiceFailure};
use crate::ipc::{ChannelListener, ChannelSender, Message, Query, Response, TerminationReason, Value, ValueKind};
use crate::service::{ServiceDescription, ServiceKey};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type Outcome<T> = std::result::Result<T, ServiceFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Enumerate,
    Describe,
    GetState,
    Require,
    Invoke,
}

/// Something the daemon told the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    InvokeResults {
        tid: u32,
        result: Outcome<Value>,
    },
    /// A callback argument of invoke `tid` fired. More may follow.
    InvokeCallback {
        tid: u32,
        callback: i64,
        parameters: Option<Value>,
    },
    Require {
        tid: u32,
        result: Outcome<Vec<ServiceDescription>>,
    },
    Describe {
        tid: u32,
        result: Outcome<ServiceDescription>,
    },
    Enumerate {
        tid: u32,
        result: Outcome<Vec<ServiceKey>>,
    },
    State {
        tid: u32,
        result: Outcome<Value>,
    },
    /// The daemon asks the user something. Answer with
    /// `Client::deliver_user_response(prompt_id, ..)`.
    PromptUser {
        prompt_id: u32,
        path: String,
        arguments: Value,
    },
    PeerEnded,
}

pub struct TransactionManager {
    transactions: HashMap<u32, TransactionKind>,
    events: mpsc::UnboundedSender<ClientEvent>,
    peer_ended: bool,
}

impl TransactionManager {
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            transactions: HashMap::new(),
            events,
            peer_ended: false,
        }
    }

    pub fn add_transaction(&mut self, tid: u32, kind: TransactionKind) {
        self.transactions.insert(tid, kind);
    }

    /// Forget a transaction. A late response for it is dropped.
    pub fn cancel_transaction(&mut self, tid: u32) -> bool {
        self.transactions.remove(&tid).is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.transactions.len()
    }

    pub fn peer_ended(&self) -> bool {
        self.peer_ended
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// `{success, value | error, verboseError}` into an outcome.
fn decode_envelope(payload: Option<&Value>) -> Outcome<Value> {
    let Some(p) = payload.filter(|p| p.has("success", ValueKind::Boolean)) else {
        return Err(ServiceFailure::new(ErrorCode::ProtocolError));
    };
    if p.get_bool("success").unwrap_or(false) {
        Ok(p.get("value").cloned().unwrap_or(Value::Null))
    } else {
        Err(ServiceFailure::from_strings(
            p.get_str("error"),
            p.get_str("verboseError"),
        ))
    }
}

fn protocol_error() -> ServiceFailure {
    ServiceFailure::new(ErrorCode::ProtocolError)
}

/// The event `kind` resolves to when it fails with `failure`.
fn failure_event(tid: u32, kind: TransactionKind, failure: ServiceFailure) -> ClientEvent {
    match kind {
        TransactionKind::Invoke => ClientEvent::InvokeResults {
            tid,
            result: Err(failure),
        },
        TransactionKind::GetState => ClientEvent::State {
            tid,
            result: Err(failure),
        },
        TransactionKind::Require => ClientEvent::Require {
            tid,
            result: Err(failure),
        },
        TransactionKind::Describe => ClientEvent::Describe {
            tid,
            result: Err(failure),
        },
        TransactionKind::Enumerate => ClientEvent::Enumerate {
            tid,
            result: Err(failure),
        },
    }
}

fn to_descriptions(value: Value) -> Outcome<Vec<ServiceDescription>> {
    value
        .as_list()
        .ok_or_else(protocol_error)?
        .iter()
        .map(|v| ServiceDescription::from_value(v).map_err(|_| protocol_error()))
        .collect()
}

fn to_service_keys(value: Value) -> Outcome<Vec<ServiceKey>> {
    value
        .as_list()
        .ok_or_else(protocol_error)?
        .iter()
        .map(|v| match (v.get_str("name"), v.get_str("version")) {
            (Some(name), Some(version)) => Ok(ServiceKey::new(name, version)),
            _ => Err(protocol_error()),
        })
        .collect()
}

impl ChannelListener for TransactionManager {
    fn on_message(&mut self, _sender: &ChannelSender, message: Message) {
        debug!("message received ({})", message.command);
        if message.command != "InvokeCallback" {
            warn!("invalid message received from daemon: {}", message.command);
            return;
        }
        let Some(p) = message.payload.as_ref() else {
            warn!("InvokeCallback message without payload, dropping");
            return;
        };
        let callback = p
            .get("callbackInfo/callback")
            .and_then(|c| c.as_callback().or_else(|| c.as_i64()));
        let (Some(tid), Some(callback)) = (p.get_i64("tid"), callback) else {
            warn!("InvokeCallback message without 'tid' or 'callbackInfo/callback', dropping");
            return;
        };
        let tid = tid as u32;
        if self.transactions.get(&tid) != Some(&TransactionKind::Invoke) {
            warn!("InvokeCallback received for unknown transaction {}", tid);
            return;
        }
        self.emit(ClientEvent::InvokeCallback {
            tid,
            callback,
            parameters: p.get("callbackInfo/parameters").cloned(),
        });
    }

    fn on_query(&mut self, _sender: &ChannelSender, query: Query, _response: &mut Response) -> bool {
        if query.command != "PromptUser" {
            warn!("invalid query received from daemon: {}", query.command);
            return false;
        }
        match query.payload.as_ref().and_then(|p| p.get_str("path")) {
            Some(path) => self.emit(ClientEvent::PromptUser {
                prompt_id: query.id,
                path: path.to_string(),
                arguments: query
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null),
            }),
            None => warn!("malformed PromptUser query received"),
        }
        false
    }

    fn on_response(&mut self, _sender: &ChannelSender, response: Response) {
        let tid = response.response_to;
        let Some(kind) = self.transactions.remove(&tid) else {
            warn!("response received for unknown transaction {}", tid);
            return;
        };
        let outcome = decode_envelope(response.payload.as_ref());

        let event = match (response.command.as_str(), kind) {
            ("Invoke", TransactionKind::Invoke) => ClientEvent::InvokeResults {
                tid,
                result: outcome,
            },
            ("Require", TransactionKind::Require) => ClientEvent::Require {
                tid,
                result: outcome.and_then(to_descriptions),
            },
            ("Describe", TransactionKind::Describe) => ClientEvent::Describe {
                tid,
                result: outcome.and_then(|v| {
                    ServiceDescription::from_value(&v).map_err(|_| protocol_error())
                }),
            },
            ("ActiveServices", TransactionKind::Enumerate) => ClientEvent::Enumerate {
                tid,
                result: outcome.and_then(to_service_keys),
            },
            ("GetState", TransactionKind::GetState) => ClientEvent::State {
                tid,
                result: outcome,
            },
            (command, kind) => {
                warn!("unexpected {} response for {:?} transaction {}", command, kind, tid);
                failure_event(tid, kind, protocol_error())
            }
        };
        self.emit(event);
    }

    fn channel_ended(&mut self, reason: TerminationReason, error: Option<String>) {
        info!(
            "connection to daemon ended ({}){}",
            reason,
            error.map(|e| format!(" - {}", e)).unwrap_or_default()
        );
        if reason != TerminationReason::DisconnectCalled {
            self.peer_ended = true;
        }
        let failure = ServiceFailure::new(ErrorCode::PeerEndedConnection);
        let mut outstanding: Vec<_> = self.transactions.drain().collect();
        outstanding.sort_by_key(|(tid, _)| *tid);
        for (tid, kind) in outstanding {
            self.emit(failure_event(tid, kind, failure.clone()));
        }
        self.emit(ClientEvent::PeerEnded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Channel, ChannelEvent, ChannelServer};
    use crate::service::ServiceVersion;
    use std::time::Duration;

    /// A manager wired to a real channel, plus the daemon end.
    async fn pair() -> (Channel, Channel, TransactionManager, mpsc::UnboundedReceiver<ClientEvent>) {
        let address = crate::ipc::ephemeral_address();
        let mut server = ChannelServer::start(&address).unwrap();
        let client = Channel::connect(&address).await.unwrap();
        let daemon = tokio::time::timeout(Duration::from_secs(5), server.next_channel())
            .await
            .unwrap()
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (client, daemon, TransactionManager::new(tx), rx)
    }

    async fn pump(channel: &mut Channel, manager: &mut TransactionManager) {
        let event = tokio::time::timeout(Duration::from_secs(5), channel.next_event())
            .await
            .unwrap()
            .unwrap();
        channel.dispatch(event, manager);
    }

    async fn next_query(daemon: &mut Channel) -> Query {
        match tokio::time::timeout(Duration::from_secs(5), daemon.next_event()).await {
            Ok(Some(ChannelEvent::Query(q))) => q,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_callbacks_then_result() {
        let (mut client, mut daemon, mut manager, mut events) = pair().await;
        let query = Query::new("Invoke").with_payload(Value::map().with("service", "Echo"));
        manager.add_transaction(query.id, TransactionKind::Invoke);
        assert!(client.send_query(&query));
        let q = next_query(&mut daemon).await;

        for i in 0..2i64 {
            daemon.send_message(&Message::new("InvokeCallback").with_payload(
                Value::map().with("tid", q.id).with(
                    "callbackInfo",
                    Value::map().with("callback", Value::Callback(9)).with("parameters", i),
                ),
            ));
            pump(&mut client, &mut manager).await;
            assert_eq!(
                events.try_recv().unwrap(),
                ClientEvent::InvokeCallback {
                    tid: q.id,
                    callback: 9,
                    parameters: Some(Value::from(i)),
                }
            );
        }
        assert_eq!(manager.outstanding(), 1);

        daemon.send_response(
            &q.response()
                .with_payload(Value::map().with("success", true).with("value", "hi")),
        );
        pump(&mut client, &mut manager).await;
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::InvokeResults {
                tid: q.id,
                result: Ok(Value::from("hi")),
            }
        );
        assert_eq!(manager.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_error_translation() {
        let (mut client, mut daemon, mut manager, mut events) = pair().await;
        let mut expected = Vec::new();
        for (error, verbose, code) in [
            (Some("BP.noSuchFunction"), None, ErrorCode::NoSuchFunction),
            (Some("Echo.tooLoud"), None, ErrorCode::ExtendedError),
            (Some("BP.serviceExecError"), Some("disk full"), ErrorCode::ExtendedError),
            (None, None, ErrorCode::ProtocolError),
        ] {
            let query = Query::new("Invoke");
            manager.add_transaction(query.id, TransactionKind::Invoke);
            client.send_query(&query);
            let q = next_query(&mut daemon).await;
            let mut payload = Value::map().with("success", false);
            if let Some(e) = error {
                payload.insert("error", e);
            }
            if let Some(v) = verbose {
                payload.insert("verboseError", v);
            }
            daemon.send_response(&q.response().with_payload(payload));
            expected.push((q.id, code));
        }
        for (tid, code) in expected {
            pump(&mut client, &mut manager).await;
            match events.try_recv().unwrap() {
                ClientEvent::InvokeResults { tid: got, result: Err(f) } => {
                    assert_eq!(got, tid);
                    assert_eq!(f.code, code);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_typed_responses() {
        let (mut client, mut daemon, mut manager, mut events) = pair().await;

        let describe = Query::new("Describe");
        manager.add_transaction(describe.id, TransactionKind::Describe);
        client.send_query(&describe);
        let q = next_query(&mut daemon).await;
        let d = ServiceDescription::new("Echo", &ServiceVersion::new(1, 0, 0));
        daemon.send_response(
            &q.response()
                .with_payload(Value::map().with("success", true).with("value", d.to_value().unwrap())),
        );
        pump(&mut client, &mut manager).await;
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::Describe {
                tid: q.id,
                result: Ok(d),
            }
        );

        let active = Query::new("ActiveServices");
        manager.add_transaction(active.id, TransactionKind::Enumerate);
        client.send_query(&active);
        let q = next_query(&mut daemon).await;
        let list = Value::List(vec![Value::map().with("name", "Echo").with("version", "1.0.0")]);
        daemon.send_response(
            &q.response()
                .with_payload(Value::map().with("success", true).with("value", list)),
        );
        pump(&mut client, &mut manager).await;
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::Enumerate {
                tid: q.id,
                result: Ok(vec![ServiceKey::new("Echo", "1.0.0")]),
            }
        );

        let require = Query::new("Require");
        manager.add_transaction(require.id, TransactionKind::Require);
        client.send_query(&require);
        let q = next_query(&mut daemon).await;
        daemon.send_response(
            &q.response()
                .with_payload(Value::map().with("success", true).with("value", "not a list")),
        );
        pump(&mut client, &mut manager).await;
        match events.try_recv().unwrap() {
            ClientEvent::Require { result: Err(f), .. } => assert_eq!(f.code, ErrorCode::ProtocolError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_cancelled_responses_dropped() {
        let (mut client, mut daemon, mut manager, mut events) = pair().await;
        let query = Query::new("GetState");
        manager.add_transaction(query.id, TransactionKind::GetState);
        client.send_query(&query);
        let q = next_query(&mut daemon).await;
        assert!(manager.cancel_transaction(q.id));
        daemon.send_response(&q.response().with_payload(Value::map().with("success", true)));
        pump(&mut client, &mut manager).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mismatched_response_fails_transaction() {
        let (mut client, mut daemon, mut manager, mut events) = pair().await;
        let query = Query::new("Describe");
        manager.add_transaction(query.id, TransactionKind::Describe);
        client.send_query(&query);
        let q = next_query(&mut daemon).await;
        daemon.send_response(
            &Response::new(q.id, "GetState").with_payload(Value::map().with("success", true)),
        );
        pump(&mut client, &mut manager).await;
        match events.try_recv().unwrap() {
            ClientEvent::Describe { tid, result: Err(f) } => {
                assert_eq!(tid, q.id);
                assert_eq!(f.code, ErrorCode::ProtocolError);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(manager.outstanding(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prompt_user_query() {
        let (mut client, daemon, mut manager, mut events) = pair().await;
        let prompt = Query::new("PromptUser")
            .with_payload(Value::map().with("path", "/ui/confirm.html"));
        daemon.send_query(&prompt);
        pump(&mut client, &mut manager).await;
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::PromptUser {
                prompt_id: prompt.id,
                path: "/ui/confirm.html".into(),
                arguments: Value::Null,
            }
        );
    }

    #[tokio::test]
    async fn test_peer_end_fails_outstanding() {
        let (mut client, mut daemon, mut manager, mut events) = pair().await;
        let query = Query::new("Invoke");
        manager.add_transaction(query.id, TransactionKind::Invoke);
        client.send_query(&query);
        let _ = next_query(&mut daemon).await;
        daemon.disconnect().await;

        pump(&mut client, &mut manager).await;
        assert!(manager.peer_ended());
        match events.try_recv().unwrap() {
            ClientEvent::InvokeResults { tid, result: Err(f) } => {
                assert_eq!(tid, query.id);
                assert_eq!(f.code, ErrorCode::PeerEndedConnection);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events.try_recv().unwrap(), ClientEvent::PeerEnded);
    }
}
