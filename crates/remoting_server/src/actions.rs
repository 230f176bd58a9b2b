//! Domain actions invoked through `executeServerAction`.

use crate::context::ActionContext;
use crate::error::ServerResult;
use remoting_protocol::{Data, EncodableObjectData, Oid};
use std::collections::HashMap;

/// What an action returns to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// No return value.
    Nothing,
    /// A value.
    Value(EncodableObjectData),
    /// A single object, sent complete.
    Object(Oid),
    /// A list of objects of one type.
    Objects {
        /// Element type.
        type_name: String,
        /// Elements in order.
        oids: Vec<Oid>,
    },
}

/// Handler for one action: context, optional target and arguments.
pub type ActionHandler = Box<
    dyn Fn(&mut ActionContext<'_>, Option<&Oid>, &[Data]) -> ServerResult<ActionOutcome>
        + Send
        + Sync,
>;

/// Actions by declaring type and name.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<(String, String), ActionHandler>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as `action` of `type_name`.
    pub fn register<F>(&mut self, type_name: &str, action: &str, handler: F)
    where
        F: Fn(&mut ActionContext<'_>, Option<&Oid>, &[Data]) -> ServerResult<ActionOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .insert((type_name.to_string(), action.to_string()), Box::new(handler));
    }

    /// Returns the handler for `action` of `type_name`.
    pub fn get(&self, type_name: &str, action: &str) -> Option<&ActionHandler> {
        self.handlers
            .get(&(type_name.to_string(), action.to_string()))
    }

    /// Returns the number of registered actions.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no action is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
