//! Spawned-service manager.
//!
//! [`DynamicServiceManager`] is a handle to a manager task that owns every
//! spawned [`Controller`] and the [`DynamicServiceState`] bookkeeping. The
//! task consumes three inputs in one `select!` loop:
//!
//! - commands from the handle and from live instances,
//! - notifications from its controllers,
//! - the idle timer, always armed for the soonest idle deadline.
//!
//! The catalog of installed services is shared with the handle so lookups
//! (`describe`, `summary`, `have_service`) never wait on the task.

use super::instance::DynamicInstance;
use super::scanner::{self, ServiceCatalog};
use super::state::DynamicServiceState;
use crate::config::{ControllerConfig, PathsConfig};
use crate::controller::{
    AllocationRequest, Controller, ControllerEvent, ControllerId, ControllerNotification, RunOptions,
};
use crate::ipc::Value;
use crate::registry::{next_instantiate_id, ExecutionContext, RegistryEvent};
use crate::service::{
    InterfaceCache, ServiceDescription, ServiceKey, ServiceKind, ServiceSummary, ServiceVersion,
};
use crate::{HostError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Error token for invocations whose service process went away.
const INSTANCE_ERROR: &str = "bp.instanceError";

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub services_dir: PathBuf,
    pub harness_path: PathBuf,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub interface_cache: Option<InterfaceCache>,
    /// Root of per-service data directories, `<root>/<name>/<major>`.
    pub data_dir: PathBuf,
    /// Where per-instance temp directories are placed.
    pub temp_dir: PathBuf,
    pub describe_timeout: Duration,
    pub max_concurrent_describes: usize,
}

impl ManagerOptions {
    pub fn new(services_dir: impl Into<PathBuf>, harness_path: impl Into<PathBuf>) -> Self {
        let services_dir = services_dir.into();
        let data_dir = services_dir
            .parent()
            .map(|p| p.join(PathsConfig::SERVICE_DATA_DIR_NAME))
            .unwrap_or_else(|| std::env::temp_dir().join(PathsConfig::SERVICE_DATA_DIR_NAME));
        Self {
            services_dir,
            harness_path: harness_path.into(),
            log_level: None,
            log_file: None,
            interface_cache: None,
            data_dir,
            temp_dir: std::env::temp_dir(),
            describe_timeout: ControllerConfig::DESCRIBE_TIMEOUT,
            max_concurrent_describes: ControllerConfig::MAX_CONCURRENT_DESCRIBES,
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_interface_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.interface_cache = Some(InterfaceCache::new(dir));
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_describe_timeout(mut self, timeout: Duration) -> Self {
        self.describe_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_describes(mut self, n: usize) -> Self {
        self.max_concurrent_describes = n;
        self
    }

    /// Harness launch options shared by every spawn.
    pub fn run_options(&self) -> RunOptions {
        let mut run = RunOptions::new(&self.harness_path);
        if let Some(level) = &self.log_level {
            run = run.with_log_level(level);
        }
        if let Some(file) = &self.log_file {
            run = run.with_log_file(file);
        }
        run
    }
}

pub(crate) enum Command {
    Instantiate {
        summary: ServiceSummary,
        provider: Option<PathBuf>,
        instantiate_id: u32,
        context: ExecutionContext,
        listener: mpsc::UnboundedSender<RegistryEvent>,
    },
    Execute {
        instance: Weak<DynamicInstance>,
        tid: u32,
        function: String,
        arguments: Value,
    },
    PromptResponse {
        instance: Weak<DynamicInstance>,
        prompt_id: u32,
        response: Value,
    },
    InstanceShutdown {
        key: ServiceKey,
        handle: u64,
        instance_id: u32,
        controller: ControllerId,
    },
    StopService {
        key: ServiceKey,
        reply: oneshot::Sender<bool>,
    },
    RunningServices {
        reply: oneshot::Sender<Vec<ServiceKey>>,
    },
    Rescan {
        reply: oneshot::Sender<()>,
    },
    ScanFinished(ServiceCatalog),
}

pub struct DynamicServiceManager {
    options: ManagerOptions,
    catalog: Arc<RwLock<ServiceCatalog>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl DynamicServiceManager {
    /// Start the manager task and run the initial disk scan.
    pub async fn start(options: ManagerOptions) -> Self {
        let catalog = Arc::new(RwLock::new(ServiceCatalog::new()));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            options: options.clone(),
            catalog: catalog.clone(),
            state: DynamicServiceState::new(),
            spawned: HashMap::new(),
            invocations: HashMap::new(),
            commands: commands.clone(),
            notifications,
            scanning: false,
            scan_waiters: Vec::new(),
            next_scan_waiters: Vec::new(),
        };
        let task = tokio::spawn(actor.run(command_rx, notification_rx));
        let manager = Self {
            options,
            catalog,
            commands,
            task,
        };
        manager.force_rescan().await;
        manager
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn catalog(&self) -> RwLockReadGuard<'_, ServiceCatalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the best installed match. Unparsable versions match nothing.
    fn find(&self, name: &str, version: &str, min_version: &str) -> Option<scanner::ScannedService> {
        let want = ServiceVersion::parse(version).ok()?;
        let want_min = ServiceVersion::parse(min_version).ok()?;
        scanner::best_match(&self.catalog(), name, &want, &want_min).cloned()
    }

    pub fn available_services(&self) -> Vec<ServiceDescription> {
        self.catalog().values().map(|s| s.description.clone()).collect()
    }

    pub fn available_summaries(&self) -> Vec<ServiceSummary> {
        self.catalog().values().map(|s| s.summary.clone()).collect()
    }

    pub fn describe(&self, name: &str, version: &str, min_version: &str) -> Option<ServiceDescription> {
        self.find(name, version, min_version).map(|s| s.description)
    }

    pub fn summary(&self, name: &str, version: &str, min_version: &str) -> Option<ServiceSummary> {
        self.find(name, version, min_version).map(|s| s.summary)
    }

    pub fn have_service(&self, name: &str, version: &str, min_version: &str) -> bool {
        self.find(name, version, min_version).is_some()
    }

    /// Start creating an instance of the newest installed `name` matching
    /// `version`. The outcome arrives on `listener` tagged with the returned
    /// id.
    pub fn instantiate(
        &self,
        name: &str,
        version: &str,
        context: ExecutionContext,
        listener: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Result<u32> {
        let want = ServiceVersion::parse(version)?;
        let (summary, provider) = {
            let catalog = self.catalog();
            let found = scanner::best_match(&catalog, name, &want, &ServiceVersion::any()).ok_or_else(
                || HostError::NoSuchService {
                    name: name.to_string(),
                    version: version.to_string(),
                },
            )?;
            let provider = match (&found.summary.kind, &found.summary.uses) {
                (ServiceKind::Dependent, Some(uses)) => Some(
                    scanner::find_provider(catalog.values().map(|s| &s.summary), uses)
                        .map(|p| p.path.clone())
                        .ok_or_else(|| HostError::NoProvider(found.summary.key().to_string()))?,
                ),
                _ => None,
            };
            (found.summary.clone(), provider)
        };

        let instantiate_id = next_instantiate_id();
        self.commands
            .send(Command::Instantiate {
                summary,
                provider,
                instantiate_id,
                context,
                listener,
            })
            .map_err(|_| HostError::InvalidState("service manager has stopped".into()))?;
        Ok(instantiate_id)
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).ok()?;
        rx.await.ok()
    }

    /// Running and starting services.
    pub async fn running_services(&self) -> Vec<ServiceKey> {
        self.ask(|reply| Command::RunningServices { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn is_busy(&self) -> bool {
        !self.running_services().await.is_empty()
    }

    /// Tear down a running or starting service at once. Returns whether
    /// anything was stopped.
    pub async fn stop_service(&self, name: &str, version: &str) -> bool {
        let key = ServiceKey::new(name, version);
        self.ask(|reply| Command::StopService { key, reply })
            .await
            .unwrap_or(false)
    }

    /// Rescan the services directory. Running services that disappeared
    /// from disk are stopped.
    pub async fn force_rescan(&self) {
        if self.ask(|reply| Command::Rescan { reply }).await.is_none() {
            warn!("service manager stopped before the rescan finished");
        }
    }

    /// Stop, forget and delete an installed service.
    pub async fn purge_service(&self, name: &str, version: &str) -> Result<()> {
        let summary = self
            .catalog()
            .get(&ServiceKey::new(name, version))
            .map(|s| s.summary.clone())
            .ok_or_else(|| HostError::NoSuchService {
                name: name.to_string(),
                version: version.to_string(),
            })?;
        info!("purging {} {}", name, version);
        self.stop_service(name, version).await;
        if let Some(cache) = &self.options.interface_cache {
            cache.purge(name, version)?;
        }
        tokio::fs::remove_dir_all(&summary.path)
            .await
            .map_err(|e| HostError::io_with_path(e, &summary.path))?;
        if let Some(parent) = summary.path.parent() {
            // Only succeeds once no other version is left.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        self.force_rescan().await;
        Ok(())
    }
}

impl Drop for DynamicServiceManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
struct SpawnedService {
    key: ServiceKey,
    shutdown_delay: Duration,
    major: u32,
}

struct Invocation {
    controller: ControllerId,
    client_tid: u32,
    instance: Weak<DynamicInstance>,
}

struct Actor {
    options: ManagerOptions,
    catalog: Arc<RwLock<ServiceCatalog>>,
    state: DynamicServiceState,
    spawned: HashMap<ControllerId, SpawnedService>,
    /// Controller invoke id -> the client's transaction.
    invocations: HashMap<u32, Invocation>,
    commands: mpsc::UnboundedSender<Command>,
    notifications: mpsc::UnboundedSender<ControllerNotification>,
    scanning: bool,
    scan_waiters: Vec<oneshot::Sender<()>>,
    next_scan_waiters: Vec<oneshot::Sender<()>>,
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notifications: mpsc::UnboundedReceiver<ControllerNotification>,
    ) {
        loop {
            let deadline = self.state.next_idle_deadline();
            tokio::select! {
                Some(command) = commands.recv() => self.on_command(command),
                Some(notification) = notifications.recv() => self.on_notification(notification),
                _ = idle_timer(deadline) => self.sweep_idle(),
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Instantiate {
                summary,
                provider,
                instantiate_id,
                context,
                listener,
            } => self.instantiate(summary, provider, instantiate_id, context, listener),
            Command::Execute {
                instance,
                tid,
                function,
                arguments,
            } => self.execute(instance, tid, &function, arguments),
            Command::PromptResponse {
                instance,
                prompt_id,
                response,
            } => {
                let Some(instance) = instance.upgrade() else {
                    return;
                };
                match self.state.controller(instance.controller()) {
                    Some(c) => c.send_prompt_response(prompt_id, Some(response)),
                    None => warn!("prompt {} answered after {} stopped", prompt_id, instance.key()),
                }
            }
            Command::InstanceShutdown {
                key,
                handle,
                instance_id,
                controller,
            } => {
                if instance_id != 0 {
                    if let Some(c) = self.state.controller(controller) {
                        c.destroy(instance_id);
                    }
                }
                if let Some(removed) =
                    self.state
                        .remove_instance(&key, handle, instance_id, controller, Instant::now())
                {
                    self.spawned.remove(&removed.id());
                }
            }
            Command::StopService { key, reply } => {
                let _ = reply.send(self.stop_service(&key));
            }
            Command::RunningServices { reply } => {
                let _ = reply.send(self.state.running_services());
            }
            Command::Rescan { reply } => {
                if self.scanning {
                    self.next_scan_waiters.push(reply);
                } else {
                    self.scan_waiters.push(reply);
                    self.start_scan();
                }
            }
            Command::ScanFinished(found) => self.scan_finished(found),
        }
    }

    fn instantiate(
        &mut self,
        summary: ServiceSummary,
        provider: Option<PathBuf>,
        instantiate_id: u32,
        context: ExecutionContext,
        listener: mpsc::UnboundedSender<RegistryEvent>,
    ) {
        let key = summary.key();
        let instance = DynamicInstance::new(
            key.clone(),
            instantiate_id,
            context,
            listener,
            self.commands.clone(),
        );

        if let Some(controller) = self.state.running_controller(&key) {
            debug!("{} is running, allocating directly", key);
            self.start_allocation(&controller, instance);
            return;
        }
        if let Some(controller) = self.state.pending_controller(&key) {
            debug!("{} is starting, queueing allocation", key);
            self.state.add_pending_allocation(&key, &controller, instance);
            return;
        }

        let controller = Controller::new(&summary.path, self.notifications.clone());
        let mut run = self
            .options
            .run_options()
            .with_title(scanner::process_title(&summary, &instance.context().locale));
        if let Some(provider) = provider {
            run = run.with_provider_path(provider);
        }
        if let Err(e) = controller.run(&run) {
            error!("failed to spawn {}: {}", key, e);
            instance.fail();
            return;
        }
        info!("spawned {} for instantiation {}", key, instantiate_id);
        self.spawned.insert(
            controller.id(),
            SpawnedService {
                key: key.clone(),
                shutdown_delay: summary.shutdown_delay,
                major: summary.service_version().major.unwrap_or(0),
            },
        );
        self.state.add_pending_allocation(&key, &controller, instance);
    }

    fn start_allocation(&mut self, controller: &Arc<Controller>, instance: Arc<DynamicInstance>) {
        let Some(spawned) = self.spawned.get(&controller.id()).cloned() else {
            error!("allocation against unknown controller {}", controller.id());
            instance.fail();
            return;
        };
        let context = instance.context();
        let request = AllocationRequest {
            uri: context.uri.clone(),
            data_dir: self
                .options
                .data_dir
                .join(&spawned.key.name)
                .join(spawned.major.to_string()),
            temp_dir: self.options.temp_dir.join(format!(
                "{}{}",
                PathsConfig::TEMP_DIR_PREFIX,
                uuid::Uuid::new_v4().simple()
            )),
            locale: context.locale.clone(),
            user_agent: context.user_agent.clone(),
            client_pid: context.client_pid,
        };
        match controller.allocate(&request) {
            Some(allocation_id) => self.state.add_running_allocation(
                &spawned.key,
                controller,
                spawned.shutdown_delay,
                allocation_id,
                instance,
            ),
            None => {
                error!("failed to send allocate to {}", spawned.key);
                instance.fail();
            }
        }
    }

    fn execute(&mut self, instance: Weak<DynamicInstance>, tid: u32, function: &str, arguments: Value) {
        let Some(instance) = instance.upgrade() else {
            return;
        };
        let instance_id = instance.instance_id();
        let arguments = match arguments {
            Value::Null => None,
            other => Some(other),
        };
        let invoke_id = self
            .state
            .controller(instance.controller())
            .filter(|_| instance_id != 0)
            .and_then(|c| c.invoke(instance_id, function, arguments));
        match invoke_id {
            Some(invoke_id) => {
                self.invocations.insert(
                    invoke_id,
                    Invocation {
                        controller: instance.controller(),
                        client_tid: tid,
                        instance: instance.downgrade(),
                    },
                );
            }
            None => {
                warn!("cannot invoke {} on {}: service is not running", function, instance.key());
                instance.context().send_failure(tid, INSTANCE_ERROR, None);
            }
        }
    }

    fn on_notification(&mut self, notification: ControllerNotification) {
        let id = notification.controller;
        match notification.event {
            ControllerEvent::Initialized {
                service, version, ..
            } => self.on_initialized(id, &service, &version),
            ControllerEvent::Ended => self.on_ended(id),
            ControllerEvent::Described(d) => {
                debug!("ignoring unsolicited description of {}", d.name)
            }
            ControllerEvent::Allocated {
                allocation_id,
                instance_id,
            } => match self.state.allocation_complete(id, allocation_id, instance_id) {
                Some(instance) => instance.deliver(),
                None => error!("allocated response with unknown allocation id {}", allocation_id),
            },
            ControllerEvent::AllocationFailed {
                allocation_id,
                error,
                verbose_error,
            } => match self.state.allocation_failed(id, allocation_id, Instant::now()) {
                Some((instance, released)) => {
                    warn!(
                        "{} refused allocation {}: {} {}",
                        instance.key(),
                        allocation_id,
                        error,
                        verbose_error.unwrap_or_default()
                    );
                    instance.fail();
                    if let Some(controller) = released {
                        self.spawned.remove(&controller.id());
                    }
                }
                None => error!("failed response with unknown allocation id {}", allocation_id),
            },
            ControllerEvent::InvokeResults { tid, results, .. } => {
                if let Some((instance, client_tid)) = self.take_invocation(id, tid) {
                    instance
                        .context()
                        .send_complete(client_tid, results.unwrap_or(Value::Null));
                }
            }
            ControllerEvent::InvokeError {
                tid,
                error,
                verbose_error,
                ..
            } => {
                if let Some((instance, client_tid)) = self.take_invocation(id, tid) {
                    instance.context().send_failure(client_tid, error, verbose_error);
                }
            }
            ControllerEvent::Callback {
                tid,
                callback_id,
                value,
                ..
            } => {
                let target = self
                    .invocations
                    .get(&tid)
                    .filter(|inv| inv.controller == id)
                    .and_then(|inv| Some((inv.instance.upgrade()?, inv.client_tid)));
                match target {
                    Some((instance, client_tid)) => {
                        instance.context().invoke_callback(client_tid, callback_id, value)
                    }
                    None => debug!("callback for unknown invocation {}", tid),
                }
            }
            ControllerEvent::Prompt {
                instance_id,
                prompt_id,
                path,
                arguments,
            } => match self.state.find_instance(id, instance_id) {
                Some(instance) => {
                    let weak: Weak<dyn crate::registry::ServiceInstance> = instance.downgrade();
                    instance.context().prompt_user(weak, prompt_id, path, arguments);
                }
                None => warn!("prompt from unknown instance {}", instance_id),
            },
        }
    }

    fn take_invocation(&mut self, controller: ControllerId, tid: u32) -> Option<(Arc<DynamicInstance>, u32)> {
        if self.invocations.get(&tid)?.controller != controller {
            return None;
        }
        let invocation = self.invocations.remove(&tid)?;
        match invocation.instance.upgrade() {
            Some(instance) => Some((instance, invocation.client_tid)),
            None => {
                debug!("dropping results for destroyed instance (tid {})", tid);
                None
            }
        }
    }

    fn on_initialized(&mut self, id: ControllerId, service: &str, version: &str) {
        let Some(key) = self.spawned.get(&id).map(|s| s.key.clone()) else {
            error!("initialized unknown controller {} ({} {})", id, service, version);
            return;
        };
        match self.state.pop_pending_allocations(&key) {
            Some((controller, instances)) if controller.id() == id => {
                info!("{} is up, starting {} allocations", key, instances.len());
                for instance in instances {
                    self.start_allocation(&controller, instance);
                }
            }
            Some((controller, instances)) => {
                error!("{} initialized a stale controller {}", key, id);
                self.spawned.remove(&id);
                for instance in instances {
                    self.state.add_pending_allocation(&key, &controller, instance);
                }
            }
            None => error!("{} initialized with no pending allocations", key),
        }
    }

    fn on_ended(&mut self, id: ControllerId) {
        let Some(spawned) = self.spawned.remove(&id) else {
            debug!("controller {} ended after it was released", id);
            return;
        };
        warn!("{} ended unexpectedly", spawned.key);
        if let Some((_, instances)) = self.state.pop_pending_for_controller(id) {
            for instance in instances {
                instance.fail();
            }
        }
        for instance in self.state.fail_running_allocations(id) {
            instance.fail();
        }
        self.fail_invocations(id, &spawned.key);
        self.state.remove_controller(id);
    }

    fn fail_invocations(&mut self, controller: ControllerId, key: &ServiceKey) {
        let failed: Vec<u32> = self
            .invocations
            .iter()
            .filter(|(_, inv)| inv.controller == controller)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in failed {
            let Some(invocation) = self.invocations.remove(&tid) else {
                continue;
            };
            if let Some(instance) = invocation.instance.upgrade() {
                instance.context().send_failure(
                    invocation.client_tid,
                    INSTANCE_ERROR,
                    Some(format!("{} stopped", key)),
                );
            }
        }
    }

    fn stop_service(&mut self, key: &ServiceKey) -> bool {
        let stopped = self.state.stop_service(key);
        for id in &stopped.controllers {
            self.spawned.remove(id);
            self.fail_invocations(*id, key);
        }
        for instance in &stopped.failed {
            instance.fail();
        }
        if !stopped.controllers.is_empty() {
            info!("stopped {}", key);
        }
        !stopped.controllers.is_empty()
    }

    fn sweep_idle(&mut self) {
        for (key, controller) in self.state.sweep_idle(Instant::now()) {
            debug!("releasing idle {}", key);
            self.spawned.remove(&controller.id());
        }
    }

    fn start_scan(&mut self) {
        self.scanning = true;
        let last_scan = self.catalog.read().unwrap_or_else(PoisonError::into_inner).clone();
        let running = self.state.running_services();
        let options = self.options.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let found = scanner::scan(&options.services_dir, &last_scan, &running, &options).await;
            let _ = commands.send(Command::ScanFinished(found));
        });
    }

    fn scan_finished(&mut self, found: ServiceCatalog) {
        for key in self.state.running_services() {
            if !found.contains_key(&key) {
                info!("{} is no longer installed", key);
                self.stop_service(&key);
            }
        }
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = found;

        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if self.next_scan_waiters.is_empty() {
            self.scanning = false;
        } else {
            self.scan_waiters = std::mem::take(&mut self.next_scan_waiters);
            self.start_scan();
        }
    }
}
