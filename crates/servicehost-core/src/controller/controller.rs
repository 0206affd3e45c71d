//! Lifecycle and protocol driver for one spawned service process.
//!
//! # States
//!
//! ```text
//! Created -> run() -> Spawning -+-> SpawnFailed        (run returns Err)
//!                               +-> PrematurelyEnded   (Ended)
//!                               +-> Connected -> Running -> Ended
//! ```
//!
//! While spawning, a poll task checks every 200 ms whether the child has
//! already exited. Once the connector hands over the service's channel the
//! poll stops, and process death is only observed as the channel ending.
//!
//! Every observable outcome is posted as a [`ControllerNotification`] on
//! the sender passed to [`Controller::new`]. Background tasks only hold weak
//! references, so dropping the last `Arc<Controller>` tears everything down
//! and terminates the child.

use super::connector::{Connector, Handshake};
use crate::config::ControllerConfig;
use crate::ipc::{
    Channel, ChannelListener, ChannelSender, Message, Query, Response, TerminationReason, Value,
    ValueKind,
};
use crate::service::ServiceDescription;
use crate::{HostError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Process-unique controller identity.
pub type ControllerId = u64;

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Error token for an `allocate` answered without an instance id.
const ALLOCATION_ERROR: &str = "bp.allocationError";

/// Something a controller observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// The service connected and completed its handshake.
    Initialized {
        service: String,
        version: String,
        api_version: i64,
    },
    /// The process exited before connecting, failed its handshake, or its
    /// channel ended. Sent at most once.
    Ended,
    Described(ServiceDescription),
    Allocated {
        allocation_id: u32,
        instance_id: u32,
    },
    /// The service refused the allocation or answered with something other
    /// than an instance id.
    AllocationFailed {
        allocation_id: u32,
        error: String,
        verbose_error: Option<String>,
    },
    InvokeResults {
        instance_id: u32,
        tid: u32,
        results: Option<Value>,
    },
    InvokeError {
        instance_id: u32,
        tid: u32,
        error: String,
        verbose_error: Option<String>,
    },
    Callback {
        instance_id: u32,
        tid: u32,
        callback_id: i64,
        value: Option<Value>,
    },
    Prompt {
        instance_id: u32,
        prompt_id: u32,
        path: PathBuf,
        arguments: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerNotification {
    pub controller: ControllerId,
    pub event: ControllerEvent,
}

/// How to launch the service harness.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub harness_path: PathBuf,
    pub provider_path: Option<PathBuf>,
    pub title: String,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(harness_path: impl Into<PathBuf>) -> Self {
        Self {
            harness_path: harness_path.into(),
            ..Default::default()
        }
    }

    pub fn with_provider_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.provider_path = Some(path.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Per-instance context sent with `allocate`.
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub uri: String,
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub locale: String,
    pub user_agent: String,
    pub client_pid: u32,
}

impl AllocationRequest {
    fn to_payload(&self) -> Value {
        let uri = if self.uri.is_empty() {
            ControllerConfig::UNKNOWN_CLIENT_URI
        } else {
            self.uri.as_str()
        };
        Value::map()
            .with("uri", uri)
            .with("data_dir", self.data_dir.to_string_lossy().into_owned())
            .with("temp_dir", self.temp_dir.to_string_lossy().into_owned())
            .with("locale", self.locale.as_str())
            .with("userAgent", self.user_agent.as_str())
            .with("clientPid", self.client_pid)
    }
}

#[derive(Default)]
struct Inner {
    started: bool,
    identity: Option<Handshake>,
    child: Option<Child>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    connector: Option<Connector>,
    poll_task: Option<JoinHandle<()>>,
    sender: Option<ChannelSender>,
    pump_stop: Option<oneshot::Sender<()>>,
}

pub struct Controller {
    id: ControllerId,
    path: PathBuf,
    this: Weak<Controller>,
    events: mpsc::UnboundedSender<ControllerNotification>,
    ended: AtomicBool,
    inner: Mutex<Inner>,
}

impl Controller {
    /// A controller for the service installed at `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<ControllerNotification>,
    ) -> Arc<Self> {
        let path = path.into();
        Arc::new_cyclic(|this| Self {
            id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
            path,
            this: this.clone(),
            events,
            ended: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner().pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner().exit_code
    }

    pub fn is_connected(&self) -> bool {
        self.inner().sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// `(service, version)` as reported by the service's handshake.
    pub fn identity(&self) -> Option<(String, String)> {
        self.inner()
            .identity
            .as_ref()
            .map(|h| (h.service.clone(), h.version.clone()))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the harness for this service and start waiting for it.
    pub fn run(&self, options: &RunOptions) -> Result<()> {
        let mut inner = self.inner();
        if inner.started {
            return Err(HostError::AlreadyRunning(self.path.clone()));
        }
        inner.started = true;

        if !self.path.is_dir() {
            return Err(HostError::SpawnFailed {
                path: self.path.clone(),
                message: "no such directory".into(),
            });
        }
        if !options.harness_path.is_file() {
            return Err(HostError::SpawnFailed {
                path: options.harness_path.clone(),
                message: "no such file".into(),
            });
        }

        let connector = Connector::start(self.this.clone())?;

        let mut cmd = Command::new(&options.harness_path);
        cmd.arg("--run-service")
            .arg(&self.path)
            .arg("--ipc-name")
            .arg(connector.address());
        if let Some(provider) = &options.provider_path {
            cmd.arg("--provider-path").arg(canonical(provider));
        }
        if let Some(level) = &options.log_level {
            cmd.arg("--log-level").arg(level);
        }
        if let Some(file) = &options.log_file {
            cmd.arg("--log-file").arg(file);
        }
        #[cfg(unix)]
        if !options.title.is_empty() {
            cmd.arg0(&options.title);
        }
        cmd.current_dir(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| {
            error!("failed to spawn service process for {}: {}", self.path.display(), e);
            HostError::SpawnFailed {
                path: options.harness_path.clone(),
                message: e.to_string(),
            }
        })?;

        inner.pid = child.id();
        info!(
            "spawned service process for {} (pid {:?}), waiting for connection on {}",
            self.path.display(),
            inner.pid,
            connector.address()
        );
        inner.child = Some(child);
        inner.connector = Some(connector);
        inner.poll_task = Some(tokio::spawn(Self::watch_spawn(self.this.clone())));
        Ok(())
    }

    async fn watch_spawn(this: Weak<Controller>) {
        let mut ticker = tokio::time::interval(ControllerConfig::SPAWN_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(controller) = this.upgrade() else {
                return;
            };
            if controller.poll_exit() {
                controller.notify_ended();
                return;
            }
        }
    }

    /// Non-blocking check for premature exit.
    fn poll_exit(&self) -> bool {
        let mut inner = self.inner();
        if inner.sender.is_some() {
            return false;
        }
        let Some(child) = inner.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                error!(
                    "spawned service process for {} exited with {}",
                    self.path.display(),
                    status
                );
                inner.exit_code = status.code();
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("cannot query service process status: {}", e);
                true
            }
        }
    }

    /// Take ownership of the service's channel after a good handshake.
    pub(crate) fn on_connected(&self, channel: Channel, handshake: Handshake) {
        if self.ended.load(Ordering::SeqCst) {
            warn!("{} connected after its controller ended", handshake.service);
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut inner = self.inner();
            if let Some(task) = inner.poll_task.take() {
                task.abort();
            }
            info!(
                "received connected IPC channel for {} v{} (api {})",
                handshake.service, handshake.version, handshake.api_version
            );
            inner.sender = channel.sender();
            inner.pump_stop = Some(stop_tx);
            inner.identity = Some(handshake.clone());
        }

        self.notify(ControllerEvent::Initialized {
            service: handshake.service,
            version: handshake.version,
            api_version: handshake.api_version,
        });
        tokio::spawn(Self::pump(self.this.clone(), channel, stop_rx));
    }

    /// The handshake failed before a channel was handed over.
    pub(crate) fn connect_failed(&self) {
        if let Some(task) = self.inner().poll_task.take() {
            task.abort();
        }
        self.notify_ended();
    }

    async fn pump(this: Weak<Controller>, mut channel: Channel, mut stop_rx: oneshot::Receiver<()>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                event = channel.next_event() => event,
            };
            let Some(event) = event else { break };
            let Some(controller) = this.upgrade() else { break };
            let ended = matches!(event, crate::ipc::ChannelEvent::Ended { .. });
            channel.dispatch(event, &mut Handler { controller: &controller });
            if ended {
                break;
            }
        }
        channel.disconnect().await;
    }

    fn sender(&self) -> Option<ChannelSender> {
        self.inner().sender.clone()
    }

    /// Ask the service for its description. Answered with `Described`.
    pub fn describe(&self) -> bool {
        self.sender()
            .is_some_and(|s| s.send_query(&Query::new("getDescription")))
    }

    /// Create an instance. The returned transaction id is the allocation id
    /// carried back by `Allocated`.
    pub fn allocate(&self, request: &AllocationRequest) -> Option<u32> {
        let sender = self.sender()?;
        let query = Query::new("allocate").with_payload(request.to_payload());
        sender.send_query(&query).then_some(query.id)
    }

    /// Invoke a function on an instance. The returned transaction id comes
    /// back on `InvokeResults`, `InvokeError` and `Callback`.
    pub fn invoke(&self, instance_id: u32, function: &str, arguments: Option<Value>) -> Option<u32> {
        let sender = self.sender()?;
        let mut payload = Value::map().with("function", function);
        if let Some(args) = arguments {
            payload.insert("arguments", args);
        }
        payload.insert("instance", instance_id);
        let query = Query::new("invoke").with_payload(payload);
        sender.send_query(&query).then_some(query.id)
    }

    pub fn destroy(&self, instance_id: u32) {
        match self.sender() {
            Some(s) => {
                s.send_message(&Message::new("destroy").with_payload(instance_id));
            }
            None => debug!("destroy({}) on unconnected controller {}", instance_id, self.id),
        }
    }

    /// Answer a `Prompt`.
    pub fn send_prompt_response(&self, prompt_id: u32, arguments: Option<Value>) {
        if let Some(s) = self.sender() {
            let mut payload = Value::map().with("promptId", prompt_id);
            if let Some(args) = arguments {
                payload.insert("arguments", args);
            }
            s.send_message(&Message::new("promptResponse").with_payload(payload));
        }
    }

    fn notify(&self, event: ControllerEvent) {
        let _ = self.events.send(ControllerNotification {
            controller: self.id,
            event,
        });
    }

    fn notify_ended(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.notify(ControllerEvent::Ended);
        }
    }

    fn on_response(&self, response: Response) {
        debug!("received IPC response: {}", response.command);
        match response.command.as_str() {
            "getDescription" => {
                match response.payload.as_ref().map(ServiceDescription::from_value) {
                    Some(Ok(d)) => self.notify(ControllerEvent::Described(d)),
                    _ => error!("malformed IPC response to getDescription query"),
                }
            }
            "allocate" => {
                let allocation_id = response.response_to;
                let payload = response.payload.unwrap_or_default();
                match payload.as_i64() {
                    Some(id) if id > 0 && id <= i64::from(u32::MAX) => {
                        self.notify(ControllerEvent::Allocated {
                            allocation_id,
                            instance_id: id as u32,
                        })
                    }
                    _ => {
                        let error = payload.get_str("error").map(str::to_string);
                        if error.is_none() {
                            error!("malformed IPC response to allocate query");
                        }
                        self.notify(ControllerEvent::AllocationFailed {
                            allocation_id,
                            error: error.unwrap_or_else(|| ALLOCATION_ERROR.to_string()),
                            verbose_error: payload.get_str("verboseError").map(str::to_string),
                        });
                    }
                }
            }
            "invoke" => {
                let Some(p) = response.payload.as_ref().filter(|p| {
                    p.has("success", ValueKind::Boolean) && p.has("instance", ValueKind::Integer)
                }) else {
                    error!("malformed IPC response to invoke query");
                    return;
                };
                let instance_id = p.get_i64("instance").unwrap_or_default() as u32;
                if p.get_bool("success").unwrap_or(false) {
                    self.notify(ControllerEvent::InvokeResults {
                        instance_id,
                        tid: response.response_to,
                        results: p.get("results").cloned(),
                    });
                } else {
                    self.notify(ControllerEvent::InvokeError {
                        instance_id,
                        tid: response.response_to,
                        error: p.get_str("error").unwrap_or("bp.unknownError").to_string(),
                        verbose_error: p.get_str("verboseError").map(str::to_string),
                    });
                }
            }
            other => error!("received unhandled IPC response: {}", other),
        }
    }

    fn on_message(&self, message: Message) {
        let p = message.payload.as_ref();
        match message.command.as_str() {
            "callback" => {
                let Some(p) = p.filter(|p| {
                    p.has("tid", ValueKind::Integer)
                        && p.has("id", ValueKind::Integer)
                        && p.has("instance", ValueKind::Integer)
                }) else {
                    error!("malformed IPC payload for callback message");
                    return;
                };
                self.notify(ControllerEvent::Callback {
                    instance_id: p.get_i64("instance").unwrap_or_default() as u32,
                    tid: p.get_i64("tid").unwrap_or_default() as u32,
                    callback_id: p.get_i64("id").unwrap_or_default(),
                    value: p.get("value").cloned(),
                });
            }
            "promptUser" => {
                let Some(p) = p.filter(|p| {
                    p.has("id", ValueKind::Integer)
                        && p.has("path", ValueKind::String)
                        && p.has("instance", ValueKind::Integer)
                }) else {
                    error!("malformed IPC payload for promptUser message");
                    return;
                };
                self.notify(ControllerEvent::Prompt {
                    instance_id: p.get_i64("instance").unwrap_or_default() as u32,
                    prompt_id: p.get_i64("id").unwrap_or_default() as u32,
                    path: PathBuf::from(p.get_str("path").unwrap_or_default()),
                    arguments: p.get("arguments").cloned(),
                });
            }
            other => warn!("ignoring unexpected message from service: {}", other),
        }
    }
}

/// Adapts channel events to controller notifications on the pump task.
struct Handler<'a> {
    controller: &'a Controller,
}

impl ChannelListener for Handler<'_> {
    fn on_message(&mut self, _sender: &ChannelSender, message: Message) {
        self.controller.on_message(message);
    }

    fn on_query(&mut self, _sender: &ChannelSender, query: Query, _response: &mut Response) -> bool {
        info!("ignoring IPC query from service: {}", query.command);
        false
    }

    fn on_response(&mut self, _sender: &ChannelSender, response: Response) {
        self.controller.on_response(response);
    }

    fn channel_ended(&mut self, reason: TerminationReason, error: Option<String>) {
        info!(
            "service channel for controller {} ended: {} {}",
            self.controller.id,
            reason,
            error.unwrap_or_default()
        );
        self.controller.inner().sender = None;
        self.controller.notify_ended();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = inner.poll_task.take() {
            task.abort();
        }
        if let Some(stop) = inner.pump_stop.take() {
            let _ = stop.send(());
        }
        inner.connector = None;
        inner.sender = None;
        if let Some(mut child) = inner.child.take() {
            terminate(&mut child);
        }
        debug!("controller {} for {} dropped", self.id, self.path.display());
    }
}

/// Ask a still-running child to exit.
fn terminate(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("failed to send SIGTERM to {}: {}", pid, e);
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!("failed to kill service process: {}", e);
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
