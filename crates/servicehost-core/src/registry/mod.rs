//! One lookup surface over built-in and spawned services.
//!
//! Built-in services are compiled into the daemon and registered as
//! [`BuiltinServiceFactory`] objects. Everything else is answered by the
//! [`DynamicServiceManager`]. Built-ins win when both could satisfy a
//! request.

pub mod context;

pub use context::{
    next_instantiate_id, ExecutionContext, InstanceEvent, RegistryEvent, ServiceInstance,
};

use crate::manager::DynamicServiceManager;
use crate::service::{ServiceDescription, ServiceKey, ServiceSummary, ServiceVersion};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A service implemented inside the daemon process.
#[async_trait]
pub trait BuiltinServiceFactory: Send + Sync {
    fn description(&self) -> &ServiceDescription;

    fn summary(&self) -> ServiceSummary {
        let d = self.description();
        ServiceSummary::builtin(&d.name, &d.version_string)
    }

    async fn create(&self, context: ExecutionContext) -> Result<Arc<dyn ServiceInstance>>;
}

#[derive(Default)]
pub struct ServiceRegistry {
    builtins: Vec<Arc<dyn BuiltinServiceFactory>>,
    dynamic: Option<DynamicServiceManager>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dynamic(mut self, manager: DynamicServiceManager) -> Self {
        self.dynamic = Some(manager);
        self
    }

    pub fn dynamic(&self) -> Option<&DynamicServiceManager> {
        self.dynamic.as_ref()
    }

    /// Register a built-in service. Refused if the same name and version is
    /// already registered.
    pub fn register(&mut self, factory: Arc<dyn BuiltinServiceFactory>) -> bool {
        let d = factory.description();
        if self.find_builtin(&d.name, &d.version_string, "").is_some() {
            warn!("built-in {} {} is already registered", d.name, d.version_string);
            return false;
        }
        self.builtins.push(factory);
        true
    }

    pub fn unregister_all(&mut self) {
        self.builtins.clear();
    }

    /// Newest built-in named `name` matching `version` and at least
    /// `min_version`.
    fn find_builtin(
        &self,
        name: &str,
        version: &str,
        min_version: &str,
    ) -> Option<&Arc<dyn BuiltinServiceFactory>> {
        if name.is_empty() {
            return None;
        }
        let want = ServiceVersion::parse(version).ok()?;
        let want_min = ServiceVersion::parse(min_version).ok()?;
        let mut best: Option<(&Arc<dyn BuiltinServiceFactory>, ServiceVersion)> = None;
        for factory in &self.builtins {
            let d = factory.description();
            if d.name != name {
                continue;
            }
            let current = d.service_version();
            let got = best.as_ref().map(|(_, v)| *v).unwrap_or_default();
            if ServiceVersion::is_newer_match(&current, &got, &want, &want_min) {
                best = Some((factory, current));
            }
        }
        best.map(|(f, _)| f)
    }

    pub fn describe(&self, name: &str, version: &str, min_version: &str) -> Option<ServiceDescription> {
        match self.find_builtin(name, version, min_version) {
            Some(f) => Some(f.description().clone()),
            None => self.dynamic.as_ref()?.describe(name, version, min_version),
        }
    }

    pub fn summary(&self, name: &str, version: &str, min_version: &str) -> Option<ServiceSummary> {
        match self.find_builtin(name, version, min_version) {
            Some(f) => Some(f.summary()),
            None => self.dynamic.as_ref()?.summary(name, version, min_version),
        }
    }

    pub fn have_service(&self, name: &str, version: &str, min_version: &str) -> bool {
        self.find_builtin(name, version, min_version).is_some()
            || self
                .dynamic
                .as_ref()
                .is_some_and(|m| m.have_service(name, version, min_version))
    }

    /// Built-ins first, then installed services.
    pub fn available_services(&self) -> Vec<ServiceDescription> {
        let mut all: Vec<_> = self.builtins.iter().map(|f| f.description().clone()).collect();
        if let Some(m) = &self.dynamic {
            all.extend(m.available_services());
        }
        all
    }

    pub fn available_summaries(&self) -> Vec<ServiceSummary> {
        let mut all: Vec<_> = self.builtins.iter().map(|f| f.summary()).collect();
        if let Some(m) = &self.dynamic {
            all.extend(m.available_summaries());
        }
        all
    }

    /// Start creating an instance. The result always arrives later on
    /// `listener`, even for built-ins, tagged with the returned id.
    pub fn instantiate(
        &self,
        name: &str,
        version: &str,
        context: ExecutionContext,
        listener: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Result<u32> {
        let Some(factory) = self.find_builtin(name, version, "").cloned() else {
            return match &self.dynamic {
                Some(m) => m.instantiate(name, version, context, listener),
                None => Err(crate::HostError::NoSuchService {
                    name: name.to_string(),
                    version: version.to_string(),
                }),
            };
        };

        let instantiate_id = next_instantiate_id();
        debug!("instantiating built-in {} as {}", factory.description().name, instantiate_id);
        tokio::spawn(async move {
            let event = match factory.create(context).await {
                Ok(instance) => RegistryEvent::GotInstance {
                    instantiate_id,
                    instance,
                },
                Err(e) => {
                    error!("built-in {} failed to instantiate: {}", factory.description().name, e);
                    RegistryEvent::InstanceFailed { instantiate_id }
                }
            };
            if listener.send(event).is_err() {
                debug!("instantiation {} finished after its listener went away", instantiate_id);
            }
        });
        Ok(instantiate_id)
    }

    pub async fn running_services(&self) -> Vec<ServiceKey> {
        match &self.dynamic {
            Some(m) => m.running_services().await,
            None => Vec::new(),
        }
    }

    pub async fn is_busy(&self) -> bool {
        match &self.dynamic {
            Some(m) => m.is_busy().await,
            None => false,
        }
    }

    pub async fn force_rescan(&self) {
        if let Some(m) = &self.dynamic {
            m.force_rescan().await;
        }
    }

    pub async fn purge_service(&self, name: &str, version: &str) -> Result<()> {
        match &self.dynamic {
            Some(m) => m.purge_service(name, version).await,
            None => Err(crate::HostError::NoSuchService {
                name: name.to_string(),
                version: version.to_string(),
            }),
        }
    }
}
