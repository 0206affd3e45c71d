//! The process side of a spawned service.
//!
//! The `servicehost-harness` binary loads a service directory, picks the
//! compiled-in [`ServiceImplementation`] named by the manifest's library,
//! connects back to the controller that spawned it and serves the
//! controller protocol until the channel ends.
//!
//! ```text
//! harness                           controller
//!   | ---- loaded {service, version, apiVersion} --> |
//!   | <--------------- getDescription -------------- |
//!   | <----- allocate {uri, data_dir, ...} --------- |  -> instance id
//!   | <----- invoke {instance, function, args} ----- |  -> answered later
//!   | ------ callback / promptUser ----------------> |
//!   | <----- promptResponse / destroy -------------- |
//! ```

pub mod echo;

pub use echo::EchoService;

use crate::config::AppConfig;
use crate::ipc::{Channel, ChannelListener, ChannelSender, Message, Query, Response, TerminationReason, Value};
use crate::service::{ServiceDescription, ServiceSummary};
use crate::{HostError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Where a harness finds its service and its controller.
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub service_dir: PathBuf,
    pub ipc_name: String,
    pub provider_path: Option<PathBuf>,
}

/// What an `allocate` request carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub uri: String,
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub locale: String,
    pub user_agent: String,
    pub client_pid: u32,
}

impl Allocation {
    fn from_payload(p: &Value) -> Self {
        Self {
            uri: p.get_str("uri").unwrap_or_default().to_string(),
            data_dir: PathBuf::from(p.get_str("data_dir").unwrap_or_default()),
            temp_dir: PathBuf::from(p.get_str("temp_dir").unwrap_or_default()),
            locale: p.get_str("locale").unwrap_or("en").to_string(),
            user_agent: p.get_str("userAgent").unwrap_or_default().to_string(),
            client_pid: p.get_i64("clientPid").unwrap_or_default() as u32,
        }
    }
}

/// One `invoke` to answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub instance: u32,
    pub tid: u32,
    pub function: String,
    pub arguments: Value,
}

/// Sends results and requests back to the controller.
#[derive(Debug)]
pub struct Outbox<'a> {
    sender: &'a ChannelSender,
    next_prompt_id: &'a mut u32,
}

impl Outbox<'_> {
    fn answer(&self, call: &Invocation, payload: Value) {
        let response = Response::new(call.tid, "invoke").with_payload(payload.with("instance", call.instance));
        if !self.sender.send_response(&response) {
            warn!("failed to answer invoke {}", call.tid);
        }
    }

    pub fn complete(&self, call: &Invocation, results: Value) {
        self.answer(call, Value::map().with("success", true).with("results", results));
    }

    pub fn fail(&self, call: &Invocation, error: &str, verbose_error: Option<&str>) {
        let mut payload = Value::map().with("success", false).with("error", error);
        if let Some(verbose) = verbose_error {
            payload.insert("verboseError", verbose);
        }
        self.answer(call, payload);
    }

    /// Invoke a callback argument of `call`. May happen any number of times
    /// before the call completes.
    pub fn callback(&self, call: &Invocation, callback_id: i64, value: Value) {
        let message = Message::new("callback").with_payload(
            Value::map()
                .with("instance", call.instance)
                .with("tid", call.tid)
                .with("id", callback_id)
                .with("value", value),
        );
        self.sender.send_message(&message);
    }

    /// Ask the user something. The answer comes back through
    /// [`ServiceImplementation::prompt_response`] with the returned id.
    pub fn prompt_user(&mut self, instance: u32, path: &str, arguments: Option<Value>) -> u32 {
        let id = *self.next_prompt_id;
        *self.next_prompt_id += 1;
        let mut payload = Value::map()
            .with("instance", instance)
            .with("id", id)
            .with("path", path);
        if let Some(arguments) = arguments {
            payload.insert("arguments", arguments);
        }
        self.sender.send_message(&Message::new("promptUser").with_payload(payload));
        id
    }
}

/// A service compiled into the harness.
pub trait ServiceImplementation: Send {
    fn describe(&self, summary: &ServiceSummary) -> ServiceDescription;

    fn allocate(&mut self, _instance: u32, _allocation: &Allocation) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _instance: u32) {}

    fn invoke(&mut self, call: Invocation, out: &mut Outbox<'_>);

    fn prompt_response(&mut self, _prompt_id: u32, _response: Value, _out: &mut Outbox<'_>) {}
}

/// The implementation for a manifest's `ServiceLibrary` value.
pub fn implementation_for(library: &str) -> Option<Box<dyn ServiceImplementation>> {
    let stem = Path::new(library)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.trim_start_matches("lib") {
        "echo" => Some(Box::new(EchoService::default())),
        _ => None,
    }
}

/// Serves one service over its controller channel.
pub struct Harness {
    summary: ServiceSummary,
    implementation: Box<dyn ServiceImplementation>,
    instances: BTreeSet<u32>,
    next_instance: u32,
    next_prompt_id: u32,
}

impl Harness {
    /// Load the service at `options.service_dir`.
    pub fn load(options: &HarnessOptions) -> Result<Self> {
        let summary = ServiceSummary::load(&options.service_dir)?;
        let library = match &options.provider_path {
            Some(provider) => ServiceSummary::load(provider)?.library,
            None => summary.library.clone(),
        };
        let library = library.ok_or_else(|| HostError::InvalidManifest {
            path: summary.manifest_path(),
            message: "no ServiceLibrary to run".into(),
        })?;
        let implementation = implementation_for(&library).ok_or_else(|| HostError::InvalidManifest {
            path: summary.manifest_path(),
            message: format!("unknown service library '{}'", library),
        })?;
        info!("loaded {} {} ({})", summary.name, summary.version, library);
        Ok(Self {
            summary,
            implementation,
            instances: BTreeSet::new(),
            next_instance: 1,
            next_prompt_id: 1,
        })
    }

    /// Connect to the controller and serve until the channel ends.
    pub async fn run(mut self, ipc_name: &str) -> Result<()> {
        let mut channel = Channel::connect(ipc_name).await?;
        let loaded = Message::new("loaded").with_payload(
            Value::map()
                .with("service", self.summary.name.as_str())
                .with("version", self.summary.version.as_str())
                .with("apiVersion", AppConfig::API_VERSION),
        );
        if !channel.send_message(&loaded) {
            return Err(HostError::NotConnected);
        }
        debug!("connected to controller at {}", ipc_name);
        channel.run(&mut self).await;
        Ok(())
    }

    fn outbox<'a>(sender: &'a ChannelSender, next_prompt_id: &'a mut u32) -> Outbox<'a> {
        Outbox {
            sender,
            next_prompt_id,
        }
    }
}

impl ChannelListener for Harness {
    fn on_message(&mut self, sender: &ChannelSender, message: Message) {
        match message.command.as_str() {
            "destroy" => match message.payload.as_ref().and_then(Value::as_i64) {
                Some(id) if self.instances.remove(&(id as u32)) => {
                    debug!("destroying instance {}", id);
                    self.implementation.destroy(id as u32);
                }
                _ => warn!("destroy for unknown instance"),
            },
            "promptResponse" => {
                let Some(p) = message.payload.as_ref() else {
                    warn!("promptResponse without payload");
                    return;
                };
                let Some(prompt_id) = p.get_i64("promptId") else {
                    warn!("promptResponse without 'promptId'");
                    return;
                };
                let response = p.get("arguments").cloned().unwrap_or_default();
                let mut out = Self::outbox(sender, &mut self.next_prompt_id);
                self.implementation
                    .prompt_response(prompt_id as u32, response, &mut out);
            }
            other => warn!("ignoring unexpected message {}", other),
        }
    }

    fn on_query(&mut self, sender: &ChannelSender, query: Query, response: &mut Response) -> bool {
        match query.command.as_str() {
            "getDescription" => match self.implementation.describe(&self.summary).to_value() {
                Ok(v) => {
                    response.payload = Some(v);
                    true
                }
                Err(e) => {
                    error!("cannot encode description: {}", e);
                    false
                }
            },
            "allocate" => {
                let allocation = Allocation::from_payload(&query.payload.unwrap_or_default());
                let id = self.next_instance;
                if let Err(e) = self.implementation.allocate(id, &allocation) {
                    error!("allocate failed: {}", e);
                    response.payload = Some(
                        Value::map()
                            .with("success", false)
                            .with("error", "BP.serviceExecError")
                            .with("verboseError", e.to_string()),
                    );
                    return true;
                }
                self.next_instance += 1;
                self.instances.insert(id);
                debug!("allocated instance {} for {}", id, allocation.uri);
                response.payload = Some(Value::from(id));
                true
            }
            "invoke" => {
                let p = query.payload.unwrap_or_default();
                let call = Invocation {
                    instance: p.get_i64("instance").unwrap_or_default() as u32,
                    tid: query.id,
                    function: p.get_str("function").unwrap_or_default().to_string(),
                    arguments: p.get("arguments").cloned().unwrap_or_default(),
                };
                let mut out = Self::outbox(sender, &mut self.next_prompt_id);
                if !self.instances.contains(&call.instance) {
                    out.fail(&call, "BP.invalidInstance", Some("no such instance"));
                } else {
                    self.implementation.invoke(call, &mut out);
                }
                false
            }
            other => {
                warn!("ignoring unexpected query {}", other);
                false
            }
        }
    }

    fn on_response(&mut self, _sender: &ChannelSender, response: Response) {
        warn!("ignoring unexpected response {}", response.command);
    }

    fn channel_ended(&mut self, reason: TerminationReason, error: Option<String>) {
        info!(
            "controller channel ended ({}){}",
            reason,
            error.map(|e| format!(": {}", e)).unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ephemeral_address, ChannelEvent, ChannelServer};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Refuses every allocation.
    struct Full;

    impl ServiceImplementation for Full {
        fn describe(&self, summary: &ServiceSummary) -> ServiceDescription {
            ServiceDescription::new(&summary.name, &summary.service_version())
        }

        fn allocate(&mut self, _instance: u32, _allocation: &Allocation) -> Result<()> {
            Err(HostError::Other("no room for another instance".into()))
        }

        fn invoke(&mut self, call: Invocation, out: &mut Outbox<'_>) {
            out.fail(&call, "BP.noSuchFunction", None);
        }
    }

    fn harness(tmp: &TempDir, implementation: Box<dyn ServiceImplementation>) -> Harness {
        let dir = tmp.path().join("Full").join("1.0.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.json"),
            r#"{"type": "standalone", "ServiceLibrary": "full",
                "strings": {"en": {"title": "Full", "summary": "Always full"}}}"#,
        )
        .unwrap();
        Harness {
            summary: ServiceSummary::load(&dir).unwrap(),
            implementation,
            instances: BTreeSet::new(),
            next_instance: 1,
            next_prompt_id: 1,
        }
    }

    /// A harness plus both ends of its controller channel.
    struct Wired {
        harness: Harness,
        service_end: Channel,
        controller_end: Channel,
    }

    impl Wired {
        async fn new(harness: Harness) -> Self {
            let address = ephemeral_address();
            let mut server = ChannelServer::start(&address).unwrap();
            let service_end = Channel::connect(&address).await.unwrap();
            let controller_end = server.next_channel().await.unwrap();
            Self {
                harness,
                service_end,
                controller_end,
            }
        }

        /// Send `query` from the controller side, let the harness handle it
        /// and return what comes back.
        async fn ask(&mut self, query: Query) -> Response {
            assert!(self.controller_end.send_query(&query));
            let event = tokio::time::timeout(Duration::from_secs(2), self.service_end.next_event())
                .await
                .unwrap()
                .unwrap();
            self.service_end.dispatch(event, &mut self.harness);
            match tokio::time::timeout(Duration::from_secs(2), self.controller_end.next_event()).await {
                Ok(Some(ChannelEvent::Response(r))) => {
                    assert_eq!(r.response_to, query.id);
                    r
                }
                other => panic!("expected a response, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_refused_allocation_is_answered() {
        let tmp = TempDir::new().unwrap();
        let mut wired = Wired::new(harness(&tmp, Box::new(Full))).await;

        let query = Query::new("allocate").with_payload(Value::map().with("uri", "test://full"));
        let payload = wired.ask(query).await.payload.unwrap();
        assert_eq!(payload.get_bool("success"), Some(false));
        assert_eq!(payload.get_str("error"), Some("BP.serviceExecError"));
        assert!(payload.get_str("verboseError").unwrap().contains("no room"));

        // Nothing was allocated, so invokes are rejected.
        let invoke = Query::new("invoke").with_payload(
            Value::map().with("instance", 1i64).with("function", "anything"),
        );
        let payload = wired.ask(invoke).await.payload.unwrap();
        assert_eq!(payload.get_str("error"), Some("BP.invalidInstance"));
    }

    #[tokio::test]
    async fn test_allocation_ids_count_from_one() {
        let tmp = TempDir::new().unwrap();
        let mut wired = Wired::new(harness(&tmp, Box::new(EchoService::default()))).await;
        for expected in 1..=2i64 {
            let response = wired.ask(Query::new("allocate")).await;
            assert_eq!(response.payload.and_then(|p| p.as_i64()), Some(expected));
        }
    }
}
