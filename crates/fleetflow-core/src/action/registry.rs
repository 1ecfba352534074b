//! Node-type dispatch table.
//!
//! Maps a node type name to its [`SharedAction`]. Graphs resolve every
//! action node through the registry once, at load time; nothing is looked up
//! by name while a run is executing.

use std::collections::HashMap;
use std::sync::Arc;

use super::builtin;
use super::{ActionHandler, SharedAction};

#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, SharedAction>,
}

impl ActionRegistry {
    /// Empty registry (control constructs still work, they are not actions).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register (or replace) the handler for `node_type`.
    ///
    /// Control-construct names (`If`, `Try`, ...) are resolved before the
    /// registry is consulted, so registering them has no effect.
    pub fn register<H: ActionHandler>(&mut self, node_type: &str, handler: H) -> &mut Self {
        self.handlers
            .insert(node_type.to_string(), Arc::new(handler));
        self
    }

    pub fn register_shared(&mut self, node_type: &str, handler: SharedAction) -> &mut Self {
        self.handlers.insert(node_type.to_string(), handler);
        self
    }

    pub fn get(&self, node_type: &str) -> Option<SharedAction> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered type names, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
