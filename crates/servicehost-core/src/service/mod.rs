//! Installed services: identity, versions, manifests and interfaces.

pub mod cache;
pub mod description;
pub mod manifest;
pub mod version;

pub use cache::InterfaceCache;
pub use description::{ArgumentType, Function, Parameter, ServiceDescription};
pub use manifest::{Localization, ServiceKind, ServiceSummary, Uses};
pub use version::ServiceVersion;

use std::fmt;

/// `(name, version)` identity of one installed service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub version: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
