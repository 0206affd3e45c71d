//! The seam between service instances and whoever drives them.
//!
//! A client session owns instances (`Arc<dyn ServiceInstance>`) and hands
//! each one an [`ExecutionContext`]. Instances report results, callbacks and
//! prompts back through the context's event queue, so the session sees them
//! on its own task in arrival order.

use crate::config::ServiceStateConfig;
use crate::ipc::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

static NEXT_INSTANTIATE_ID: AtomicU32 = AtomicU32::new(ServiceStateConfig::FIRST_INSTANTIATE_ID);

/// Id correlating an `instantiate` call with its [`RegistryEvent`].
pub fn next_instantiate_id() -> u32 {
    NEXT_INSTANTIATE_ID.fetch_add(1, Ordering::Relaxed)
}

/// An allocated execution context inside a built-in or spawned service.
pub trait ServiceInstance: Send + Sync {
    /// Run `function`. The outcome arrives later as `Complete` or `Failure`
    /// tagged with `tid`, possibly preceded by `Callback`s.
    fn execute(&self, tid: u32, function: &str, arguments: Value);

    /// Answer to an earlier `Prompt`.
    fn user_response(&self, _prompt_id: u32, _response: Value) {}
}

pub enum InstanceEvent {
    Complete {
        tid: u32,
        results: Value,
    },
    Failure {
        tid: u32,
        error: String,
        verbose_error: Option<String>,
    },
    /// A callback argument invoked mid-execution. Never terminal.
    Callback {
        tid: u32,
        callback_id: i64,
        value: Option<Value>,
    },
    Prompt {
        instance: Weak<dyn ServiceInstance>,
        prompt_id: u32,
        path: PathBuf,
        arguments: Option<Value>,
    },
}

impl fmt::Debug for InstanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceEvent::Complete { tid, results } => f
                .debug_struct("Complete")
                .field("tid", tid)
                .field("results", results)
                .finish(),
            InstanceEvent::Failure {
                tid,
                error,
                verbose_error,
            } => f
                .debug_struct("Failure")
                .field("tid", tid)
                .field("error", error)
                .field("verbose_error", verbose_error)
                .finish(),
            InstanceEvent::Callback {
                tid,
                callback_id,
                value,
            } => f
                .debug_struct("Callback")
                .field("tid", tid)
                .field("callback_id", callback_id)
                .field("value", value)
                .finish(),
            InstanceEvent::Prompt {
                prompt_id, path, ..
            } => f
                .debug_struct("Prompt")
                .field("prompt_id", prompt_id)
                .field("path", path)
                .finish(),
        }
    }
}

/// Who an instance works for.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub uri: String,
    pub locale: String,
    pub user_agent: String,
    pub client_pid: u32,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl ExecutionContext {
    pub fn new(events: mpsc::UnboundedSender<InstanceEvent>) -> Self {
        Self {
            uri: String::new(),
            locale: "en".to_string(),
            user_agent: String::new(),
            client_pid: 0,
            events,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_client_pid(mut self, pid: u32) -> Self {
        self.client_pid = pid;
        self
    }

    /// False once the owning session has gone away.
    pub fn is_alive(&self) -> bool {
        !self.events.is_closed()
    }

    pub fn send_complete(&self, tid: u32, results: Value) {
        let _ = self.events.send(InstanceEvent::Complete { tid, results });
    }

    pub fn send_failure(&self, tid: u32, error: impl Into<String>, verbose_error: Option<String>) {
        let _ = self.events.send(InstanceEvent::Failure {
            tid,
            error: error.into(),
            verbose_error,
        });
    }

    pub fn invoke_callback(&self, tid: u32, callback_id: i64, value: Option<Value>) {
        let _ = self.events.send(InstanceEvent::Callback {
            tid,
            callback_id,
            value,
        });
    }

    pub fn prompt_user(
        &self,
        instance: Weak<dyn ServiceInstance>,
        prompt_id: u32,
        path: PathBuf,
        arguments: Option<Value>,
    ) {
        let _ = self.events.send(InstanceEvent::Prompt {
            instance,
            prompt_id,
            path,
            arguments,
        });
    }
}

/// Outcome of `instantiate`, keyed by the id it returned.
pub enum RegistryEvent {
    GotInstance {
        instantiate_id: u32,
        instance: Arc<dyn ServiceInstance>,
    },
    InstanceFailed {
        instantiate_id: u32,
    },
}

impl RegistryEvent {
    pub fn instantiate_id(&self) -> u32 {
        match self {
            RegistryEvent::GotInstance { instantiate_id, .. }
            | RegistryEvent::InstanceFailed { instantiate_id } => *instantiate_id,
        }
    }
}

impl fmt::Debug for RegistryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryEvent::GotInstance { instantiate_id, .. } => {
                write!(f, "GotInstance({})", instantiate_id)
            }
            RegistryEvent::InstanceFailed { instantiate_id } => {
                write!(f, "InstanceFailed({})", instantiate_id)
            }
        }
    }
}
