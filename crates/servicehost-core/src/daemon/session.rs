//! One client session on the daemon side.
//!
//! A session starts with `CreateSession`, which records who the client is.
//! Every later query is answered from the registry, and invokes run on
//! instances the session creates on first use and keeps per service.
//!
//! The session task drains three queues: channel events, events from its
//! instances, and instantiation results from the registry.

use super::StateStore;
use crate::config::SessionConfig;
use crate::ipc::{Channel, ChannelEvent, ChannelSender, Message, Query, Response, Value, ValueKind};
use crate::registry::{ExecutionContext, InstanceEvent, RegistryEvent, ServiceInstance, ServiceRegistry};
use crate::service::ServiceKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `{success: true, value?}`
pub fn success(value: Option<Value>) -> Value {
    let mut payload = Value::map().with("success", true);
    if let Some(value) = value {
        payload.insert("value", value);
    }
    payload
}

/// `{success: false, error, verboseError?}`
pub fn failure(error: &str, verbose_error: Option<&str>) -> Value {
    let mut payload = Value::map().with("success", false).with("error", error);
    if let Some(verbose) = verbose_error {
        payload.insert("verboseError", verbose);
    }
    payload
}

/// An invoke waiting for its instance to come up.
#[derive(Debug)]
struct PendingInvoke {
    tid: u32,
    function: String,
    arguments: Value,
}

#[derive(Debug)]
struct Starting {
    key: ServiceKey,
    invokes: Vec<PendingInvoke>,
}

pub struct Session {
    sender: ChannelSender,
    registry: Arc<ServiceRegistry>,
    store: StateStore,
    context: Option<ExecutionContext>,
    instance_events: mpsc::UnboundedSender<InstanceEvent>,
    registry_events: mpsc::UnboundedSender<RegistryEvent>,
    instances: HashMap<ServiceKey, Arc<dyn ServiceInstance>>,
    /// instantiate id -> service being started and the invokes it blocks.
    starting: HashMap<u32, Starting>,
    /// PromptUser query id -> (instance, its prompt id).
    prompts: HashMap<u32, (Weak<dyn ServiceInstance>, u32)>,
}

impl Session {
    /// Serve `channel` until the client goes away.
    pub async fn run(mut channel: Channel, registry: Arc<ServiceRegistry>, store: StateStore) {
        let Some(sender) = channel.sender() else {
            return;
        };
        let (instance_tx, mut instance_rx) = mpsc::unbounded_channel();
        let (registry_tx, mut registry_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            sender,
            registry,
            store,
            context: None,
            instance_events: instance_tx,
            registry_events: registry_tx,
            instances: HashMap::new(),
            starting: HashMap::new(),
            prompts: HashMap::new(),
        };
        debug!("session started on channel {}", channel.id());

        loop {
            tokio::select! {
                event = channel.next_event() => match event {
                    Some(ChannelEvent::Ended { reason, error }) => {
                        info!(
                            "session ended ({}){}",
                            reason,
                            error.map(|e| format!(": {}", e)).unwrap_or_default()
                        );
                        break;
                    }
                    Some(event) => session.on_channel_event(event),
                    None => break,
                },
                Some(event) = instance_rx.recv() => session.on_instance_event(event),
                Some(event) = registry_rx.recv() => session.on_registry_event(event),
            }
        }
        // Dropping the instances shuts them down.
        session.instances.clear();
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Query(query) => self.on_query(query),
            ChannelEvent::Message(message) => self.on_message(message),
            ChannelEvent::Response(response) => self.on_response(response),
            ChannelEvent::Ended { .. } => {}
        }
    }

    fn reply(&self, query: &Query, payload: Value) {
        if !self.sender.send_response(&query.response().with_payload(payload)) {
            warn!("failed to answer {} ({})", query.command, query.id);
        }
    }

    fn on_query(&mut self, query: Query) {
        debug!("query {} ({})", query.command, query.id);
        if query.command == SessionConfig::CREATE_SESSION_COMMAND {
            let payload = self.create_session(&query);
            self.reply(&query, payload);
            return;
        }
        if self.context.is_none() {
            warn!("{} received before CreateSession", query.command);
            self.reply(&query, failure("BP.invalidState", Some("no session")));
            return;
        }
        let payload = match query.command.as_str() {
            "Invoke" => match self.invoke(&query) {
                Some(payload) => payload,
                None => return,
            },
            "Describe" => self.describe(&query),
            "Require" => self.require(&query),
            "ActiveServices" => self.active_services(),
            "GetState" => self.get_state(&query),
            other => {
                warn!("unknown query {}", other);
                failure("BP.invalidParameters", Some(&format!("unknown command {}", other)))
            }
        };
        self.reply(&query, payload);
    }

    fn on_message(&mut self, message: Message) {
        if message.command != "SetState" {
            warn!("unknown message {}", message.command);
            return;
        }
        let Some(key) = message.payload.as_ref().and_then(|p| p.get_str("key")) else {
            warn!("SetState without a key");
            return;
        };
        let value = message
            .payload
            .as_ref()
            .and_then(|p| p.get("value"))
            .cloned()
            .unwrap_or_default();
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if value == Value::Null {
            store.remove(key);
        } else {
            store.insert(key.to_string(), value);
        }
    }

    fn on_response(&mut self, response: Response) {
        if response.command != "PromptUser" {
            warn!("unexpected {} response", response.command);
            return;
        }
        let Some((instance, prompt_id)) = self.prompts.remove(&response.response_to) else {
            warn!("user response for unknown prompt {}, dropping", response.response_to);
            return;
        };
        match instance.upgrade() {
            Some(instance) => instance.user_response(prompt_id, response.payload.unwrap_or_default()),
            None => debug!("prompt {} answered after its instance went away", prompt_id),
        }
    }

    fn create_session(&mut self, query: &Query) -> Value {
        if self.context.is_some() {
            return failure("BP.invalidState", Some("session already created"));
        }
        let Some(p) = query.payload.as_ref().filter(|p| p.has("uri", ValueKind::String)) else {
            return failure("BP.unapprovedDomain", Some("missing 'uri'"));
        };
        let uri = p.get_str("uri").unwrap_or_default();
        if uri.is_empty() {
            return failure("BP.unapprovedDomain", Some("empty 'uri'"));
        }
        let mut context = ExecutionContext::new(self.instance_events.clone()).with_uri(uri);
        if let Some(locale) = p.get_str("locale").filter(|l| !l.is_empty()) {
            context = context.with_locale(locale);
        }
        if let Some(agent) = p.get_str("userAgent") {
            context = context.with_user_agent(agent);
        }
        if let Some(pid) = p.get_i64("clientPid") {
            context = context.with_client_pid(pid as u32);
        }
        info!("session created for {} (pid {})", context.uri, context.client_pid);
        self.context = Some(context);
        success(None)
    }

    /// Returns `None` when the answer comes later.
    fn invoke(&mut self, query: &Query) -> Option<Value> {
        let Some(p) = query.payload.as_ref() else {
            return Some(failure("BP.invalidParameters", None));
        };
        let (Some(name), Some(function)) = (p.get_str("service"), p.get_str("function")) else {
            return Some(failure("BP.invalidParameters", Some("'service' and 'function' are required")));
        };
        let version = p.get_str("version").unwrap_or_default();
        let arguments = p.get("arguments").cloned().unwrap_or_default();

        let Some(description) = self.registry.describe(name, version, "") else {
            debug!("invoke of unknown service {} {}", name, version);
            return Some(failure("BP.noSuchService", None));
        };
        let Some(f) = description.function(function) else {
            debug!("{} has no function {}", description.name, function);
            return Some(failure("BP.noSuchFunction", None));
        };
        if let Err(e) = f.validate_arguments(&arguments) {
            return Some(failure("BP.invalidParameters", Some(&e.to_string())));
        }

        let key = ServiceKey::new(&description.name, &description.version_string);
        let pending = PendingInvoke {
            tid: query.id,
            function: function.to_string(),
            arguments,
        };
        if let Some(instance) = self.instances.get(&key) {
            instance.execute(pending.tid, &pending.function, pending.arguments);
            return None;
        }
        if let Some(starting) = self.starting.values_mut().find(|s| s.key == key) {
            starting.invokes.push(pending);
            return None;
        }

        let context = self.context.clone()?;
        match self
            .registry
            .instantiate(&key.name, &key.version, context, self.registry_events.clone())
        {
            Ok(instantiate_id) => {
                debug!("starting {} for invoke {} ({})", key, query.id, instantiate_id);
                self.starting.insert(instantiate_id, Starting {
                    key,
                    invokes: vec![pending],
                });
                None
            }
            Err(e) => Some(failure("BP.serviceExecError", Some(&e.to_string()))),
        }
    }

    fn describe(&self, query: &Query) -> Value {
        let Some(p) = query.payload.as_ref().filter(|p| p.has("name", ValueKind::String)) else {
            return failure("BP.invalidParameters", None);
        };
        let name = p.get_str("name").unwrap_or_default();
        let version = p.get_str("version").unwrap_or_default();
        let min_version = p.get_str("minversion").unwrap_or_default();
        match self
            .registry
            .describe(name, version, min_version)
            .and_then(|d| d.to_value().ok())
        {
            Some(value) => success(Some(value)),
            None => failure("BP.noSuchService", None),
        }
    }

    fn require(&self, query: &Query) -> Value {
        let Some(services) = query
            .payload
            .as_ref()
            .and_then(|p| p.get("services"))
            .and_then(Value::as_list)
        else {
            return failure("BP.invalidParameters", Some("'services' list is required"));
        };

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for statement in services {
            let Some(name) = statement.get_str("service") else {
                warn!("malformed require statement, missing 'service', skipping");
                continue;
            };
            let version = statement.get_str("version").unwrap_or_default();
            let min_version = statement.get_str("minversion").unwrap_or_default();
            match self
                .registry
                .describe(name, version, min_version)
                .and_then(|d| d.to_value().ok())
            {
                Some(value) => found.push(value),
                None => missing.push(format!("{} {} {}", name, version, min_version).trim().to_string()),
            }
        }
        if missing.is_empty() {
            success(Some(Value::List(found)))
        } else {
            failure(
                "BP.requireError",
                Some(&format!("not installed: {}", missing.join(", "))),
            )
        }
    }

    fn active_services(&self) -> Value {
        let list = self
            .registry
            .available_summaries()
            .into_iter()
            .map(|s| {
                Value::map()
                    .with("name", s.name.as_str())
                    .with("version", s.version.as_str())
                    .with("type", s.kind.as_str())
            })
            .collect();
        success(Some(Value::List(list)))
    }

    fn get_state(&self, query: &Query) -> Value {
        let Some(key) = query.payload.as_ref().and_then(|p| p.get_str("key")) else {
            return failure("BP.invalidParameters", Some("'key' is required"));
        };
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        success(store.get(key).cloned())
    }

    fn on_registry_event(&mut self, event: RegistryEvent) {
        let Some(starting) = self.starting.remove(&event.instantiate_id()) else {
            warn!("instantiation {} is not ours", event.instantiate_id());
            return;
        };
        match event {
            RegistryEvent::GotInstance { instance, .. } => {
                debug!("{} is up, running {} invokes", starting.key, starting.invokes.len());
                for pending in starting.invokes {
                    instance.execute(pending.tid, &pending.function, pending.arguments);
                }
                self.instances.insert(starting.key, instance);
            }
            RegistryEvent::InstanceFailed { .. } => {
                let verbose = format!("{} failed to start", starting.key);
                for pending in starting.invokes {
                    let response = Response::new(pending.tid, "Invoke")
                        .with_payload(failure("BP.serviceExecError", Some(&verbose)));
                    self.sender.send_response(&response);
                }
            }
        }
    }

    fn on_instance_event(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Complete { tid, results } => {
                self.sender
                    .send_response(&Response::new(tid, "Invoke").with_payload(success(Some(results))));
            }
            InstanceEvent::Failure {
                tid,
                error,
                verbose_error,
            } => {
                self.sender.send_response(
                    &Response::new(tid, "Invoke").with_payload(failure(&error, verbose_error.as_deref())),
                );
            }
            InstanceEvent::Callback {
                tid,
                callback_id,
                value,
            } => {
                let mut info = Value::map().with("callback", Value::Callback(callback_id));
                if let Some(value) = value {
                    info.insert("parameters", value);
                }
                let message = Message::new("InvokeCallback")
                    .with_payload(Value::map().with("tid", tid).with("callbackInfo", info));
                if !self.sender.send_message(&message) {
                    warn!("failed to deliver callback for invoke {}", tid);
                }
            }
            InstanceEvent::Prompt {
                instance,
                prompt_id,
                path,
                arguments,
            } => {
                let query = Query::new("PromptUser").with_payload(
                    Value::map()
                        .with("path", path.to_string_lossy().as_ref())
                        .with("arguments", arguments.unwrap_or_default()),
                );
                if self.sender.send_query(&query) {
                    self.prompts.insert(query.id, (instance, prompt_id));
                } else {
                    warn!("failed to send user prompt {}", prompt_id);
                }
            }
        }
    }
}
