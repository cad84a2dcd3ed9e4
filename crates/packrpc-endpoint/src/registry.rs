//! Startup-time handler and method registration.
//!
//! Tables are filled once, before serving, and are read-only afterwards.
//! Registering the same request type id or method name twice fails
//! immediately instead of silently replacing the first entry.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use packrpc_codec::Value;
use packrpc_frame::{FrameError, MAX_REQUEST_TYPE_ID};

use crate::error::{Result, RpcError};

/// What a handler returns. Any error type can be propagated with `?`.
pub type HandlerResult = std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>>;

type HandlerFn = dyn Fn(Value) -> HandlerResult + Send + Sync;

/// A registered request handler.
#[derive(Clone)]
pub struct Handler {
    func: Arc<HandlerFn>,
    no_respond: bool,
}

impl Handler {
    /// True when callers never get a response frame from this handler.
    pub fn no_respond(&self) -> bool {
        self.no_respond
    }

    /// Run the handler on the request content.
    ///
    /// Errors and panics both come back as [`RpcError::Handler`].
    pub fn invoke(&self, type_id: u16, args: Value) -> Result<Value> {
        match catch_unwind(AssertUnwindSafe(|| (self.func)(args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(RpcError::Handler {
                type_id,
                message: err.to_string(),
            }),
            Err(panic) => Err(RpcError::Handler {
                type_id,
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("no_respond", &self.no_respond)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Dense table of handlers indexed by request type id.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    slots: Vec<Option<Handler>>,
    count: usize,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler whose return value is sent back to the caller.
    pub fn register<F>(&mut self, type_id: u16, handler: F) -> Result<&mut Self>
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(type_id, Arc::new(handler), false)
    }

    /// Register a handler that never sends a response, even when the
    /// request carries a request id.
    pub fn register_no_respond<F>(&mut self, type_id: u16, handler: F) -> Result<&mut Self>
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(type_id, Arc::new(handler), true)
    }

    fn insert(&mut self, type_id: u16, func: Arc<HandlerFn>, no_respond: bool) -> Result<&mut Self> {
        if type_id > MAX_REQUEST_TYPE_ID {
            return Err(FrameError::FieldOutOfRange {
                field: "request_type_id",
                value: u64::from(type_id),
                max: u64::from(MAX_REQUEST_TYPE_ID),
            }
            .into());
        }

        let index = usize::from(type_id);
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        if self.slots[index].is_some() {
            return Err(RpcError::DuplicateHandler(type_id));
        }

        self.slots[index] = Some(Handler { func, no_respond });
        self.count += 1;
        Ok(self)
    }

    pub fn lookup(&self, type_id: u16) -> Option<&Handler> {
        self.slots.get(usize::from(type_id))?.as_ref()
    }

    /// Look up and run a handler in one step.
    pub fn invoke(&self, type_id: u16, args: Value) -> Result<Value> {
        self.lookup(type_id)
            .ok_or(RpcError::UnknownHandler(type_id))?
            .invoke(type_id, args)
    }

    /// Registered type ids in ascending order.
    pub fn type_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(index, _)| u16::try_from(index).ok())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Maps `(interface, method)` names to request type ids.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    by_name: HashMap<(String, String), u16>,
    by_id: HashMap<u16, (String, String)>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a method to a type id. Both the name and the id must be unused.
    pub fn insert(
        &mut self,
        interface: impl Into<String>,
        method: impl Into<String>,
        type_id: u16,
    ) -> Result<&mut Self> {
        let key = (interface.into(), method.into());
        if self.by_name.contains_key(&key) {
            let (interface, method) = key;
            return Err(RpcError::DuplicateMethod { interface, method });
        }
        if self.by_id.contains_key(&type_id) {
            return Err(RpcError::DuplicateHandler(type_id));
        }

        self.by_id.insert(type_id, key.clone());
        self.by_name.insert(key, type_id);
        Ok(self)
    }

    pub fn lookup(&self, interface: &str, method: &str) -> Option<u16> {
        self.by_name
            .get(&(interface.to_string(), method.to_string()))
            .copied()
    }

    /// Like [`lookup`](Self::lookup), but a missing entry is an error.
    pub fn resolve(&self, interface: &str, method: &str) -> Result<u16> {
        self.lookup(interface, method)
            .ok_or_else(|| RpcError::UnknownMethod {
                interface: interface.to_string(),
                method: method.to_string(),
            })
    }

    /// `interface.method` for a type id, for diagnostics.
    pub fn name_of(&self, type_id: u16) -> Option<String> {
        self.by_id
            .get(&type_id)
            .map(|(interface, method)| format!("{interface}.{method}"))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
