//! Services that run in their own processes.
//!
//! - `scanner`: finds installed services and learns their interfaces
//! - `state`: which controllers run or start, and idle shutdown
//! - `instance`: the handle a client holds for one allocated instance
//! - `dynamic`: the manager task tying these together

pub mod dynamic;
mod instance;
pub mod scanner;
mod state;

pub use dynamic::{DynamicServiceManager, ManagerOptions};
pub use scanner::{ScannedService, ServiceCatalog};
