//! ServiceHost Core - out-of-process service orchestration.
//!
//! A long-running daemon spawns services as separate processes, talks to
//! each over a private IPC channel, and lets clients allocate instances,
//! invoke functions, receive callbacks and prompt the user.
//!
//! # Layers
//!
//! - [`ipc`]: framed local sockets, typed messages and channels
//! - [`controller`]: spawning one service process and driving its protocol
//! - [`manager`]: installed services, allocations and idle shutdown
//! - [`registry`]: one lookup surface over built-in and spawned services
//! - [`daemon`]: the daemon's per-client sessions
//! - [`client`]: connecting to the daemon and correlating its answers
//! - [`harness`]: the process a controller spawns
//!
//! # Example
//!
//! ```rust,ignore
//! use servicehost_core::client::{Client, ClientEvent, InstallLayout, ProcessLauncher, SessionOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> servicehost_core::Result<()> {
//!     let layout = InstallLayout::new("/opt/servicehost", "1.0.0");
//!     let options = SessionOptions::new(layout, "app://example");
//!     let mut client = Client::connect(options, Arc::new(ProcessLauncher::new("servicehostd"))).await?;
//!
//!     let tid = client.execute("Echo", "1", "echo", None)?;
//!     while let Some(event) = client.next_event().await {
//!         if let ClientEvent::InvokeResults { tid: done, result } = event {
//!             if done == tid {
//!                 println!("{:?}", result);
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod harness;
pub mod ipc;
pub mod manager;
pub mod registry;
pub mod service;

// Re-export commonly used types
pub use client::{Client, ClientEvent, InstallLayout, SessionCreator, SessionOptions};
pub use config::BackoffPolicy;
pub use controller::{Controller, ControllerEvent};
pub use daemon::Daemon;
pub use error::{ErrorCode, HostError, Result, ServiceFailure};
pub use ipc::{Channel, ChannelServer, Value};
pub use manager::{DynamicServiceManager, ManagerOptions};
pub use registry::{BuiltinServiceFactory, ExecutionContext, ServiceInstance, ServiceRegistry};
pub use service::{ServiceDescription, ServiceKey, ServiceSummary, ServiceVersion};
