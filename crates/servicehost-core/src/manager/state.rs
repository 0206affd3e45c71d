//! Bookkeeping for spawned services.
//!
//! Tracks, per `(name, version)`, the controller that is starting (with the
//! instances queued on it) or running (with its live instances), the
//! instances waiting on an `allocate` response, and idle deadlines.
//!
//! Only the manager task touches this, so there is no locking here. Time is
//! passed in explicitly so idle behaviour can be tested without sleeping.

use super::instance::DynamicInstance;
use crate::config::ServiceStateConfig;
use crate::controller::{Controller, ControllerId};
use crate::service::ServiceKey;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

struct ControllerContext {
    controller: Arc<Controller>,
    /// Handles of instances allocated (or allocating) on this controller.
    instances: HashSet<u64>,
    /// Set while `instances` is empty.
    idle_since: Option<Instant>,
    shutdown_delay: Duration,
}

struct PendingService {
    controller: Arc<Controller>,
    instances: Vec<Arc<DynamicInstance>>,
}

/// What `stop_service` tore down.
#[derive(Default)]
pub(crate) struct StoppedService {
    pub controllers: Vec<ControllerId>,
    /// Instances that never finished allocating.
    pub failed: Vec<Arc<DynamicInstance>>,
}

#[derive(Default)]
pub(crate) struct DynamicServiceState {
    running: BTreeMap<ServiceKey, ControllerContext>,
    pending: BTreeMap<ServiceKey, PendingService>,
    /// Allocation id -> instance waiting for its `allocate` response.
    allocations: HashMap<u32, (ControllerId, Arc<DynamicInstance>)>,
    /// Allocated instances by controller and service-assigned id.
    instances: HashMap<ControllerId, HashMap<u32, Weak<DynamicInstance>>>,
}

impl DynamicServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_controller(&self, key: &ServiceKey) -> Option<Arc<Controller>> {
        self.running.get(key).map(|c| c.controller.clone())
    }

    pub fn pending_controller(&self, key: &ServiceKey) -> Option<Arc<Controller>> {
        self.pending.get(key).map(|p| p.controller.clone())
    }

    /// Running controller by id.
    pub fn controller(&self, id: ControllerId) -> Option<Arc<Controller>> {
        self.running
            .values()
            .find(|c| c.controller.id() == id)
            .map(|c| c.controller.clone())
    }

    /// Queue `instance` until `controller` connects. The state holds the
    /// instance strongly meanwhile.
    pub fn add_pending_allocation(
        &mut self,
        key: &ServiceKey,
        controller: &Arc<Controller>,
        instance: Arc<DynamicInstance>,
    ) {
        let entry = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingService {
                controller: controller.clone(),
                instances: Vec::new(),
            });
        if entry.controller.id() != controller.id() {
            error!(
                "{} already has pending controller {}, refusing {}",
                key,
                entry.controller.id(),
                controller.id()
            );
            return;
        }
        if !entry.instances.iter().any(|i| i.handle() == instance.handle()) {
            entry.instances.push(instance);
        }
    }

    /// Record an allocation in flight on a running controller, registering
    /// the controller if this is its first.
    pub fn add_running_allocation(
        &mut self,
        key: &ServiceKey,
        controller: &Arc<Controller>,
        shutdown_delay: Duration,
        allocation_id: u32,
        instance: Arc<DynamicInstance>,
    ) {
        let context = self
            .running
            .entry(key.clone())
            .or_insert_with(|| ControllerContext {
                controller: controller.clone(),
                instances: HashSet::new(),
                idle_since: None,
                shutdown_delay,
            });
        if context.controller.id() != controller.id() {
            error!(
                "{} is already running on controller {}, refusing {}",
                key,
                context.controller.id(),
                controller.id()
            );
            return;
        }
        context.instances.insert(instance.handle());
        context.idle_since = None;
        instance.set_controller(controller.id());
        self.allocations
            .insert(allocation_id, (controller.id(), instance));
    }

    /// The `allocate` response arrived: the state lets go of its strong
    /// reference and returns the instance to the caller.
    pub fn allocation_complete(
        &mut self,
        controller: ControllerId,
        allocation_id: u32,
        instance_id: u32,
    ) -> Option<Arc<DynamicInstance>> {
        match self.allocations.get(&allocation_id) {
            Some((c, _)) if *c == controller => {}
            Some(_) => {
                error!("allocation {} answered by the wrong controller", allocation_id);
                return None;
            }
            None => {
                debug!("no allocation in flight with id {}", allocation_id);
                return None;
            }
        }
        let (_, instance) = self.allocations.remove(&allocation_id)?;
        instance.set_instance_id(instance_id);
        self.instances
            .entry(controller)
            .or_default()
            .insert(instance_id, instance.downgrade());
        Some(instance)
    }

    /// The service refused or garbled an `allocate`. The instance is handed
    /// back for failing and no longer counts toward its controller, which
    /// may start idling or, with no shutdown delay, be returned for release.
    pub fn allocation_failed(
        &mut self,
        controller: ControllerId,
        allocation_id: u32,
        now: Instant,
    ) -> Option<(Arc<DynamicInstance>, Option<Arc<Controller>>)> {
        if self.allocations.get(&allocation_id)?.0 != controller {
            error!("allocation {} failed on the wrong controller", allocation_id);
            return None;
        }
        let (_, instance) = self.allocations.remove(&allocation_id)?;
        let released = self.remove_instance(instance.key(), instance.handle(), 0, controller, now);
        Some((instance, released))
    }

    /// Detach everything queued on the pending controller for `key`.
    pub fn pop_pending_allocations(
        &mut self,
        key: &ServiceKey,
    ) -> Option<(Arc<Controller>, Vec<Arc<DynamicInstance>>)> {
        self.pending
            .remove(key)
            .map(|p| (p.controller, p.instances))
    }

    /// Detach everything queued on a specific pending controller.
    pub fn pop_pending_for_controller(
        &mut self,
        controller: ControllerId,
    ) -> Option<(Arc<Controller>, Vec<Arc<DynamicInstance>>)> {
        let key = self
            .pending
            .iter()
            .find(|(_, p)| p.controller.id() == controller)
            .map(|(k, _)| k.clone())?;
        self.pop_pending_allocations(&key)
    }

    /// Remove every allocation in flight on `controller`.
    pub fn fail_running_allocations(&mut self, controller: ControllerId) -> Vec<Arc<DynamicInstance>> {
        let ids: Vec<u32> = self
            .allocations
            .iter()
            .filter(|(_, (c, _))| *c == controller)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.allocations.remove(&id).map(|(_, i)| i))
            .collect()
    }

    /// Forget a running controller. Its process goes away with the last
    /// strong reference.
    pub fn remove_controller(&mut self, controller: ControllerId) -> Option<Arc<Controller>> {
        self.instances.remove(&controller);
        let key = self
            .running
            .iter()
            .find(|(_, c)| c.controller.id() == controller)
            .map(|(k, _)| k.clone())?;
        self.running.remove(&key).map(|c| c.controller)
    }

    /// Called when an instance is dropped. If its controller has no
    /// instances left it is either removed at once (no shutdown delay) or
    /// starts idling.
    pub fn remove_instance(
        &mut self,
        key: &ServiceKey,
        handle: u64,
        instance_id: u32,
        controller: ControllerId,
        now: Instant,
    ) -> Option<Arc<Controller>> {
        if instance_id != 0 {
            if let Some(by_id) = self.instances.get_mut(&controller) {
                by_id.remove(&instance_id);
            }
        }
        let context = self.running.get_mut(key)?;
        if context.controller.id() != controller || !context.instances.remove(&handle) {
            return None;
        }
        if !context.instances.is_empty() {
            return None;
        }
        if context.shutdown_delay.is_zero() {
            info!("{} has no instances left, shutting it down", key);
            return self.remove_controller(controller);
        }
        debug!("{} is idle, shutting down in {:?}", key, context.shutdown_delay);
        context.idle_since = Some(now);
        None
    }

    pub fn find_instance(&self, controller: ControllerId, instance_id: u32) -> Option<Arc<DynamicInstance>> {
        self.instances
            .get(&controller)?
            .get(&instance_id)?
            .upgrade()
    }

    /// Keys of running and starting services.
    pub fn running_services(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .running
            .keys()
            .chain(self.pending.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn is_busy(&self) -> bool {
        !self.running.is_empty() || !self.pending.is_empty()
    }

    /// Drop the running and pending controllers for `key` right away,
    /// ignoring any shutdown delay.
    pub fn stop_service(&mut self, key: &ServiceKey) -> StoppedService {
        let mut stopped = StoppedService::default();
        if let Some(p) = self.pending.remove(key) {
            stopped.controllers.push(p.controller.id());
            stopped.failed.extend(p.instances);
        }
        if let Some(c) = self.running.remove(key) {
            let id = c.controller.id();
            self.instances.remove(&id);
            stopped.controllers.push(id);
            stopped.failed.extend(self.fail_running_allocations(id));
        }
        stopped
    }

    /// When the idle check should next run, if any controller is idling.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        self.running
            .values()
            .filter_map(|c| c.idle_since.map(|since| since + c.shutdown_delay))
            .min()
            .map(|deadline| deadline + ServiceStateConfig::IDLE_CHECK_MARGIN)
    }

    /// Remove every controller whose idle grace has run out by `now`.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<(ServiceKey, Arc<Controller>)> {
        let expired: Vec<ServiceKey> = self
            .running
            .iter()
            .filter(|(_, c)| c.idle_since.is_some_and(|since| since + c.shutdown_delay <= now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let context = self.running.remove(&key)?;
                self.instances.remove(&context.controller.id());
                info!("{} idle for {:?}, shutting it down", key, context.shutdown_delay);
                Some((key, context.controller))
            })
            .collect()
    }
}
