//! Typed messages layered over frames.
//!
//! Every frame carries one JSON envelope:
//!
//! ```text
//! { "command": "...", "id": 1001?, "responseTo": 1001?, "payload": <Value>? }
//! ```
//!
//! An envelope with `responseTo` is a [`Response`], one with `id` is a
//! [`Query`], and anything else is a fire-and-forget [`Message`].

use super::value::Value;
use crate::config::IpcConfig;
use crate::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TRANSACTION_ID: AtomicU32 = AtomicU32::new(IpcConfig::FIRST_TRANSACTION_ID);

/// Next process-wide transaction id. Never zero.
pub fn next_transaction_id() -> u32 {
    loop {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_to: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Fire-and-forget message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: String,
    pub payload: Option<Value>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Request expecting a [`Response`] with the same transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub command: String,
    pub id: u32,
    pub payload: Option<Value>,
}

impl Query {
    /// New query with a freshly allocated transaction id.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            id: next_transaction_id(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// An empty response addressed to this query.
    pub fn response(&self) -> Response {
        Response::new(self.id, self.command.clone())
    }
}

/// Answer to a [`Query`]. `response_to` equals the query's id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub command: String,
    pub response_to: u32,
    pub payload: Option<Value>,
}

impl Response {
    pub fn new(response_to: u32, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            response_to,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(Message),
    Query(Query),
    Response(Response),
}

impl Incoming {
    pub fn command(&self) -> &str {
        match self {
            Incoming::Message(m) => &m.command,
            Incoming::Query(q) => &q.command,
            Incoming::Response(r) => &r.command,
        }
    }
}

pub fn decode(bytes: &[u8]) -> Result<Incoming> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.command.is_empty() {
        return Err(HostError::Protocol("message without command".into()));
    }
    Ok(match (envelope.response_to, envelope.id) {
        (Some(response_to), _) => Incoming::Response(Response {
            command: envelope.command,
            response_to,
            payload: envelope.payload,
        }),
        (None, Some(id)) => Incoming::Query(Query {
            command: envelope.command,
            id,
            payload: envelope.payload,
        }),
        (None, None) => Incoming::Message(Message {
            command: envelope.command,
            payload: envelope.payload,
        }),
    })
}

fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&Envelope {
            command: self.command.clone(),
            id: None,
            response_to: None,
            payload: self.payload.clone(),
        })
    }
}

impl Query {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&Envelope {
            command: self.command.clone(),
            id: Some(self.id),
            response_to: None,
            payload: self.payload.clone(),
        })
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&Envelope {
            command: self.command.clone(),
            id: None,
            response_to: Some(self.response_to),
            payload: self.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_are_unique_and_start_high() {
        let a = Query::new("x").id;
        let b = Query::new("x").id;
        assert!(a >= IpcConfig::FIRST_TRANSACTION_ID);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_classifies_envelopes() {
        let q = Query::new("allocate").with_payload(Value::map().with("uri", "t://x"));
        match decode(&q.encode().unwrap()).unwrap() {
            Incoming::Query(decoded) => assert_eq!(decoded, q),
            other => panic!("expected query, got {:?}", other),
        }

        let r = q.response().with_payload(3i64);
        match decode(&r.encode().unwrap()).unwrap() {
            Incoming::Response(decoded) => {
                assert_eq!(decoded.response_to, q.id);
                assert_eq!(decoded.payload, Some(Value::Integer(3)));
            }
            other => panic!("expected response, got {:?}", other),
        }

        let m = Message::new("destroy").with_payload(4i64);
        assert!(matches!(decode(&m.encode().unwrap()).unwrap(), Incoming::Message(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"command": ""}"#).is_err());
        assert!(decode(br#"{"id": 4}"#).is_err());
    }
}
