//! # Command
//!
//! A named, invokable operation a component exposes to the control engine.
//! Grounded on `examples/original_source/src/include/vde3/command.h`: a
//! command is `(name, function, description, argument-schema)` and its
//! function receives `(component, request-params, &mut reply)` and returns
//! a status. We express "status" as `crate::error::Result<Value>` so the
//! function either produces the JSON-RPC `result` value or a typed error
//! the control engine can map onto the wire `error` field.

use serde_json::Value;

use crate::component::Component;
use crate::error::Result;

/// The function pointer every command wraps. `params` is the JSON-RPC
/// request's `params` array; the return value becomes the JSON-RPC `result`.
pub type CommandFn = Arc<dyn Fn(&Component, &Value) -> Result<Value> + Send + Sync>;

use std::sync::Arc;

/// `(name, function, description, argument-schema)`.
#[derive(Clone)]
pub struct Command {
    name: String,
    description: String,
    /// Free-form schema describing expected `params`, surfaced to clients
    /// that introspect a component (out of scope to validate against here;
    /// the serialization library that would enforce it is itself out of
    /// scope).
    argument_schema: Value,
    func: CommandFn,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        argument_schema: Value,
        func: CommandFn,
    ) -> Self {
        Command {
            name: name.into(),
            description: description.into(),
            argument_schema,
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn argument_schema(&self) -> &Value {
        &self.argument_schema
    }

    pub fn invoke(&self, component: &Component, params: &Value) -> Result<Value> {
        (self.func)(component, params)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
