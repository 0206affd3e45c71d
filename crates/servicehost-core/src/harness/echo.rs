//! The `echo` service library.

use super::{Invocation, Outbox, ServiceImplementation};
use crate::ipc::Value;
use crate::service::{ArgumentType, Function, Parameter, ServiceDescription, ServiceSummary};
use std::collections::HashMap;

/// `echo`, `callback`, `prompt`, `instance` and `fail`.
#[derive(Debug, Default)]
pub struct EchoService {
    /// prompt id -> the call waiting on it.
    waiting: HashMap<u32, Invocation>,
}

fn parameter(name: &str, kind: ArgumentType, required: bool) -> Parameter {
    Parameter {
        name: name.into(),
        kind,
        required,
        documentation: None,
    }
}

fn function(name: &str, doc: &str, parameters: Vec<Parameter>) -> Function {
    Function {
        name: name.into(),
        documentation: Some(doc.into()),
        parameters,
    }
}

impl ServiceImplementation for EchoService {
    fn describe(&self, summary: &ServiceSummary) -> ServiceDescription {
        let doc = summary
            .localization("en")
            .map(|l| l.summary.clone())
            .unwrap_or_default();
        ServiceDescription::new(&summary.name, &summary.service_version())
            .with_documentation(doc)
            .with_function(function(
                "echo",
                "Returns its arguments.",
                vec![parameter("msg", ArgumentType::Any, false)],
            ))
            .with_function(function(
                "callback",
                "Invokes cb once per element of values, then completes.",
                vec![
                    parameter("cb", ArgumentType::Callback, true),
                    parameter("values", ArgumentType::List, false),
                ],
            ))
            .with_function(function(
                "prompt",
                "Asks the user and completes with the answer.",
                vec![
                    parameter("path", ArgumentType::String, false),
                    parameter("arguments", ArgumentType::Any, false),
                ],
            ))
            .with_function(function(
                "instance",
                "Returns the id this instance was allocated under.",
                Vec::new(),
            ))
            .with_function(function(
                "fail",
                "Always fails.",
                vec![parameter("message", ArgumentType::String, false)],
            ))
    }

    fn invoke(&mut self, call: Invocation, out: &mut Outbox<'_>) {
        match call.function.as_str() {
            "echo" => out.complete(&call, call.arguments.clone()),
            "callback" => {
                let Some(cb) = call.arguments.get("cb").and_then(Value::as_callback) else {
                    out.fail(&call, "BP.invalidParameters", Some("'cb' must be a callback"));
                    return;
                };
                let values = call
                    .arguments
                    .get("values")
                    .and_then(Value::as_list)
                    .map(<[Value]>::to_vec)
                    .unwrap_or_default();
                for value in &values {
                    out.callback(&call, cb, value.clone());
                }
                out.complete(&call, Value::from(values.len() as i64));
            }
            "prompt" => {
                let path = call.arguments.get_str("path").unwrap_or("prompt.html").to_string();
                let arguments = call.arguments.get("arguments").cloned();
                let id = out.prompt_user(call.instance, &path, arguments);
                self.waiting.insert(id, call);
            }
            "instance" => out.complete(&call, Value::from(i64::from(call.instance))),
            "fail" => {
                let message = call.arguments.get_str("message").map(str::to_string);
                out.fail(&call, "BP.serviceExecError", message.as_deref());
            }
            _ => out.fail(&call, "BP.noSuchFunction", None),
        }
    }

    fn prompt_response(&mut self, prompt_id: u32, response: Value, out: &mut Outbox<'_>) {
        match self.waiting.remove(&prompt_id) {
            Some(call) => out.complete(&call, response),
            None => tracing::warn!("response to unknown prompt {}", prompt_id),
        }
    }

    fn destroy(&mut self, instance: u32) {
        self.waiting.retain(|_, call| call.instance != instance);
    }
}
