//! Service interface descriptions: the functions a service exposes and the
//! parameters each one takes.

use super::version::ServiceVersion;
use crate::ipc::Value;
use crate::{HostError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Map,
    List,
    Callback,
    Path,
    Any,
}

impl ArgumentType {
    /// Whether `value` is acceptable for a parameter of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ArgumentType::Any, _) => true,
            (ArgumentType::Null, Value::Null) => true,
            (ArgumentType::Boolean, Value::Boolean(_)) => true,
            (ArgumentType::Integer, Value::Integer(_)) => true,
            (ArgumentType::Double, Value::Double(_) | Value::Integer(_)) => true,
            (ArgumentType::String, Value::String(_)) => true,
            (ArgumentType::Map, Value::Map(_)) => true,
            (ArgumentType::List, Value::List(_)) => true,
            (ArgumentType::Callback, Value::Callback(_)) => true,
            (ArgumentType::Path, Value::Path(_) | Value::String(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArgumentType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Function {
    /// Check `arguments` against the declared parameters.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        let empty = std::collections::BTreeMap::new();
        let args = match arguments {
            Value::Null => &empty,
            Value::Map(m) => m,
            _ => {
                return Err(HostError::InvalidParameter(format!(
                    "arguments to {} must be a map",
                    self.name
                )))
            }
        };

        for param in &self.parameters {
            match args.get(&param.name) {
                Some(v) if !param.kind.accepts(v) => {
                    return Err(HostError::InvalidParameter(format!(
                        "{}: '{}' has the wrong type",
                        self.name, param.name
                    )))
                }
                None if param.required => {
                    return Err(HostError::InvalidParameter(format!(
                        "{}: missing required '{}'",
                        self.name, param.name
                    )))
                }
                _ => {}
            }
        }
        if let Some(unknown) = args
            .keys()
            .find(|k| !self.parameters.iter().any(|p| &p.name == *k))
        {
            return Err(HostError::InvalidParameter(format!(
                "{}: unknown argument '{}'",
                self.name, unknown
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescription {
    pub name: String,
    pub version_string: String,
    pub version: VersionTriple,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl ServiceDescription {
    pub fn new(name: impl Into<String>, version: &ServiceVersion) -> Self {
        let triple = VersionTriple {
            major: version.major.unwrap_or(0),
            minor: version.minor.unwrap_or(0),
            micro: version.micro.unwrap_or(0),
        };
        Self {
            name: name.into(),
            version_string: format!("{}.{}.{}", triple.major, triple.minor, triple.micro),
            version: triple,
            documentation: None,
            functions: Vec::new(),
        }
    }

    pub fn with_documentation(mut self, doc: impl Into<String>) -> Self {
        self.documentation = Some(doc.into());
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn service_version(&self) -> ServiceVersion {
        ServiceVersion::new(self.version.major, self.version.minor, self.version.micro)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn to_value(&self) -> Result<Value> {
        Value::from_serialize(self)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        value
            .deserialize_into()
            .map_err(|e| HostError::Protocol(format!("malformed service description: {}", e)))
    }
}
