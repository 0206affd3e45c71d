//! Server end of the client protocol.
//!
//! A [`Daemon`] accepts client channels and runs one [`Session`] task per
//! channel. Sessions share the registry and a key/value state store.

pub mod session;

pub use session::{failure, success, Session};

use crate::ipc::{ChannelServer, Value};
use crate::registry::ServiceRegistry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Daemon-wide state set with `SetState` and read with `GetState`.
pub type StateStore = Arc<Mutex<BTreeMap<String, Value>>>;

pub struct Daemon {
    registry: Arc<ServiceRegistry>,
    store: StateStore,
}

impl Daemon {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            store: StateStore::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Accept clients until the server stops.
    pub async fn serve(&self, server: &mut ChannelServer) {
        info!("serving clients on {}", server.address());
        while let Some(channel) = server.next_channel().await {
            info!("client connected on channel {}", channel.id());
            tokio::spawn(Session::run(
                channel,
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientEvent, DaemonLauncher, DaemonProcess, InstallLayout, SessionOptions};
    use crate::config::PathsConfig;
    use crate::error::ErrorCode;
    use crate::ipc::{Channel, ChannelEvent, Query};
    use crate::registry::{BuiltinServiceFactory, ExecutionContext, ServiceInstance};
    use crate::service::{ArgumentType, Function, Parameter, ServiceDescription, ServiceKey, ServiceVersion};
    use crate::{HostError, Result};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Weak;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Greeter {
        description: ServiceDescription,
    }

    struct GreeterInstance {
        context: ExecutionContext,
        this: Weak<GreeterInstance>,
        asked: Mutex<Option<u32>>,
    }

    impl ServiceInstance for GreeterInstance {
        fn execute(&self, tid: u32, function: &str, arguments: Value) {
            match function {
                "hello" => {
                    let who = arguments.get_str("who").unwrap_or("world");
                    self.context.send_complete(tid, Value::from(format!("hello, {}", who)));
                }
                "count" => {
                    let cb = arguments.get("cb").and_then(Value::as_callback).unwrap_or(0);
                    for i in 1..=3i64 {
                        self.context.invoke_callback(tid, cb, Some(Value::from(i)));
                    }
                    self.context.send_complete(tid, Value::from(3i64));
                }
                "ask" => {
                    *self.asked.lock().unwrap() = Some(tid);
                    let this: Weak<dyn ServiceInstance> = self.this.clone();
                    self.context
                        .prompt_user(this, 5, PathBuf::from("/ui/ask.html"), None);
                }
                _ => self.context.send_failure(tid, "BP.noSuchFunction", None),
            }
        }

        fn user_response(&self, prompt_id: u32, response: Value) {
            assert_eq!(prompt_id, 5);
            if let Some(tid) = self.asked.lock().unwrap().take() {
                self.context.send_complete(tid, response);
            }
        }
    }

    #[async_trait]
    impl BuiltinServiceFactory for Greeter {
        fn description(&self) -> &ServiceDescription {
            &self.description
        }

        async fn create(&self, context: ExecutionContext) -> Result<Arc<dyn ServiceInstance>> {
            Ok(Arc::new_cyclic(|this| GreeterInstance {
                context,
                this: this.clone(),
                asked: Mutex::new(None),
            }))
        }
    }

    fn greeter() -> Arc<dyn BuiltinServiceFactory> {
        let function = |name: &str, params: Vec<Parameter>| Function {
            name: name.into(),
            documentation: None,
            parameters: params,
        };
        let param = |name: &str, kind| Parameter {
            name: name.into(),
            kind,
            required: false,
            documentation: None,
        };
        Arc::new(Greeter {
            description: ServiceDescription::new("Greeter", &ServiceVersion::new(1, 2, 0))
                .with_function(function("hello", vec![param("who", ArgumentType::String)]))
                .with_function(function("count", vec![param("cb", ArgumentType::Callback)]))
                .with_function(function("ask", vec![])),
        })
    }

    struct NoLauncher;

    impl DaemonLauncher for NoLauncher {
        fn launch(&self, _layout: &InstallLayout) -> Result<Box<dyn DaemonProcess>> {
            Err(HostError::Other("daemon should already be running".into()))
        }
    }

    /// A running daemon with the greeter built in, plus a connected client.
    async fn setup() -> (TempDir, Client) {
        let tmp = TempDir::new().unwrap();
        let layout = InstallLayout::new(tmp.path(), "1.0.0");
        std::fs::create_dir_all(layout.version_dir()).unwrap();
        std::fs::write(layout.version_dir().join(PathsConfig::INSTALLED_MARKER), b"").unwrap();

        let mut registry = ServiceRegistry::new();
        registry.register(greeter());
        let daemon = Daemon::new(registry);
        let mut server = ChannelServer::start(&layout.daemon_address()).unwrap();
        tokio::spawn(async move { daemon.serve(&mut server).await });

        let options = SessionOptions::new(layout, "test://daemon");
        let client = Client::connect(options, Arc::new(NoLauncher)).await.unwrap();
        (tmp, client)
    }

    async fn next(client: &mut Client) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), client.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_with_callbacks() {
        let (_tmp, mut client) = setup().await;

        let tid = client
            .execute("Greeter", "1", "hello", Some(Value::map().with("who", "tests")))
            .unwrap();
        assert_eq!(
            next(&mut client).await,
            ClientEvent::InvokeResults {
                tid,
                result: Ok(Value::from("hello, tests")),
            }
        );

        let tid = client
            .execute("Greeter", "", "count", Some(Value::map().with("cb", Value::Callback(11))))
            .unwrap();
        for i in 1..=3i64 {
            assert_eq!(
                next(&mut client).await,
                ClientEvent::InvokeCallback {
                    tid,
                    callback: 11,
                    parameters: Some(Value::from(i)),
                }
            );
        }
        assert!(matches!(next(&mut client).await, ClientEvent::InvokeResults { result: Ok(_), .. }));
    }

    #[tokio::test]
    async fn test_invoke_errors() {
        let (_tmp, mut client) = setup().await;
        for (service, function, args, code) in [
            ("Missing", "hello", None, ErrorCode::NoSuchService),
            ("Greeter", "nope", None, ErrorCode::NoSuchFunction),
            ("Greeter", "hello", Some(Value::map().with("who", 3i64)), ErrorCode::ExtendedError),
        ] {
            client.execute(service, "", function, args).unwrap();
            match next(&mut client).await {
                ClientEvent::InvokeResults { result: Err(f), .. } => assert_eq!(f.code, code),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_prompt_round_trip() {
        let (_tmp, mut client) = setup().await;
        let tid = client.execute("Greeter", "", "ask", None).unwrap();
        let ClientEvent::PromptUser { prompt_id, path, .. } = next(&mut client).await else {
            panic!("expected a prompt");
        };
        assert_eq!(path, "/ui/ask.html");
        client.deliver_user_response(prompt_id, Value::from("yes")).unwrap();
        assert_eq!(
            next(&mut client).await,
            ClientEvent::InvokeResults {
                tid,
                result: Ok(Value::from("yes")),
            }
        );
    }

    #[tokio::test]
    async fn test_describe_require_enumerate() {
        let (_tmp, mut client) = setup().await;

        client.describe("Greeter", Some("1.2"), None).unwrap();
        match next(&mut client).await {
            ClientEvent::Describe { result: Ok(d), .. } => assert_eq!(d.functions.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        client.describe("Greeter", None, Some("2")).unwrap();
        match next(&mut client).await {
            ClientEvent::Describe { result: Err(f), .. } => assert_eq!(f.code, ErrorCode::NoSuchService),
            other => panic!("unexpected {:?}", other),
        }

        let services = |names: &[&str]| {
            Value::map().with(
                "services",
                Value::List(names.iter().map(|n| Value::map().with("service", *n)).collect()),
            )
        };
        client.require(services(&["Greeter"])).unwrap();
        match next(&mut client).await {
            ClientEvent::Require { result: Ok(list), .. } => assert_eq!(list[0].name, "Greeter"),
            other => panic!("unexpected {:?}", other),
        }
        client.require(services(&["Greeter", "Missing"])).unwrap();
        match next(&mut client).await {
            ClientEvent::Require { result: Err(f), .. } => {
                assert_eq!(f.code, ErrorCode::ExtendedError);
                assert_eq!(f.error.as_deref(), Some("BP.requireError"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let tid = client.enumerate().unwrap();
        assert_eq!(
            next(&mut client).await,
            ClientEvent::Enumerate {
                tid,
                result: Ok(vec![ServiceKey::new("Greeter", "1.2.0")]),
            }
        );
    }

    #[tokio::test]
    async fn test_state_store() {
        let (_tmp, mut client) = setup().await;
        client.set_state("color", Value::from("blue")).unwrap();
        let tid = client.get_state("color").unwrap();
        assert_eq!(
            next(&mut client).await,
            ClientEvent::State {
                tid,
                result: Ok(Value::from("blue")),
            }
        );
        let tid = client.get_state("shape").unwrap();
        assert_eq!(
            next(&mut client).await,
            ClientEvent::State {
                tid,
                result: Ok(Value::Null),
            }
        );
    }

    #[tokio::test]
    async fn test_queries_need_a_session() {
        let address = crate::ipc::ephemeral_address();
        let mut server = ChannelServer::start(&address).unwrap();
        let daemon = Daemon::new(ServiceRegistry::new());
        tokio::spawn(async move { daemon.serve(&mut server).await });

        let mut channel = Channel::connect(&address).await.unwrap();
        let query = Query::new("ActiveServices");
        channel.send_query(&query);
        match tokio::time::timeout(Duration::from_secs(5), channel.next_event()).await {
            Ok(Some(ChannelEvent::Response(r))) => {
                assert_eq!(r.response_to, query.id);
                assert_eq!(r.payload.unwrap().get_bool("success"), Some(false));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
