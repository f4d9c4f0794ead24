//! Action and agent module catalog
//!
//! A [`CatalogBuilder`] collects action implementations and agent modules
//! while the application wires itself up. Workers receive an immutable
//! [`Catalog`] snapshot, passed in explicitly rather than looked up from a
//! global, so every worker resolves names the same way for its lifetime.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::action::Action;
use super::builtin;
use super::module::AgentModule;

#[derive(Clone, Default)]
struct Entries {
    actions: HashMap<String, Arc<dyn Action>>,
    modules: HashMap<String, Arc<dyn AgentModule>>,
}

/// Mutable catalog used during setup
#[derive(Default)]
pub struct CatalogBuilder {
    entries: RwLock<Entries>,
}

impl CatalogBuilder {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the built-in state actions
    pub fn with_builtins() -> Self {
        let builder = Self::new();
        for action in builtin::all() {
            builder.register_action(action);
        }
        builder
    }

    /// Register an action under its own name, replacing any previous entry
    pub fn register_action(&self, action: Arc<dyn Action>) -> &Self {
        let name = action.name().to_string();
        self.entries.write().actions.insert(name, action);
        self
    }

    /// Register an agent module under its own name, replacing any previous entry
    pub fn register_module(&self, module: Arc<dyn AgentModule>) -> &Self {
        let name = module.name().to_string();
        self.entries.write().modules.insert(name, module);
        self
    }

    /// Produce an immutable snapshot
    pub fn build(&self) -> Catalog {
        let entries = self.entries.read().clone();
        Catalog {
            entries: Arc::new(entries),
        }
    }
}

/// Immutable view of registered actions and modules
#[derive(Clone, Default)]
pub struct Catalog {
    entries: Arc<Entries>,
}

impl Catalog {
    /// Look up an action
    pub fn action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.entries.actions.get(name).cloned()
    }

    /// Look up an agent module
    pub fn module(&self, name: &str) -> Option<Arc<dyn AgentModule>> {
        self.entries.modules.get(name).cloned()
    }

    /// Whether the action resolves
    pub fn has_action(&self, name: &str) -> bool {
        self.entries.actions.contains_key(name)
    }

    /// Whether the module resolves
    pub fn has_module(&self, name: &str) -> bool {
        self.entries.modules.contains_key(name)
    }

    /// Registered action names, sorted
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered module names, sorted
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.modules.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("actions", &self.action_names())
            .field("modules", &self.module_names())
            .finish()
    }
}
