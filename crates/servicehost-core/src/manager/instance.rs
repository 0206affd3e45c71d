//! Client-facing handle for one instance of a spawned service.

use super::dynamic::Command;
use crate::controller::ControllerId;
use crate::ipc::Value;
use crate::registry::{ExecutionContext, RegistryEvent, ServiceInstance};
use crate::service::ServiceKey;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// An instance living inside a service process.
///
/// Every call is forwarded to the manager task. Dropping the last strong
/// reference tells the manager to `destroy` the instance and update the
/// idle bookkeeping of its controller.
pub(crate) struct DynamicInstance {
    key: ServiceKey,
    handle: u64,
    instantiate_id: u32,
    /// Assigned by the service process. Zero until allocated.
    instance_id: AtomicU32,
    /// Zero until an allocation was sent.
    controller: AtomicU64,
    context: ExecutionContext,
    listener: mpsc::UnboundedSender<RegistryEvent>,
    commands: mpsc::UnboundedSender<Command>,
    this: Weak<DynamicInstance>,
}

impl DynamicInstance {
    pub fn new(
        key: ServiceKey,
        instantiate_id: u32,
        context: ExecutionContext,
        listener: mpsc::UnboundedSender<RegistryEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            instantiate_id,
            instance_id: AtomicU32::new(0),
            controller: AtomicU64::new(0),
            context,
            listener,
            commands,
            this: this.clone(),
        })
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id.load(Ordering::SeqCst)
    }

    pub fn set_instance_id(&self, id: u32) {
        self.instance_id.store(id, Ordering::SeqCst);
    }

    pub fn controller(&self) -> ControllerId {
        self.controller.load(Ordering::SeqCst)
    }

    pub fn set_controller(&self, id: ControllerId) {
        self.controller.store(id, Ordering::SeqCst);
    }

    pub fn downgrade(&self) -> Weak<DynamicInstance> {
        self.this.clone()
    }

    /// Hand the instance to whoever asked for it. Ownership moves with the
    /// event; if the listener is gone the instance is dropped here.
    pub fn deliver(self: Arc<Self>) {
        let instantiate_id = self.instantiate_id;
        let listener = self.listener.clone();
        let instance: Arc<dyn ServiceInstance> = self;
        let _ = listener.send(RegistryEvent::GotInstance {
            instantiate_id,
            instance,
        });
    }

    pub fn fail(&self) {
        let _ = self.listener.send(RegistryEvent::InstanceFailed {
            instantiate_id: self.instantiate_id,
        });
    }
}

impl ServiceInstance for DynamicInstance {
    fn execute(&self, tid: u32, function: &str, arguments: Value) {
        let _ = self.commands.send(Command::Execute {
            instance: self.this.clone(),
            tid,
            function: function.to_string(),
            arguments,
        });
    }

    fn user_response(&self, prompt_id: u32, response: Value) {
        let _ = self.commands.send(Command::PromptResponse {
            instance: self.this.clone(),
            prompt_id,
            response,
        });
    }
}

impl Drop for DynamicInstance {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::InstanceShutdown {
            key: self.key.clone(),
            handle: self.handle,
            instance_id: self.instance_id(),
            controller: self.controller(),
        });
    }
}
