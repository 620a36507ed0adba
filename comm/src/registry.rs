//! Node type registry.
//!
//! Group declarations name a node type; the registry maps that name to a
//! factory producing fresh [`NodeLogic`] instances. Applications register
//! their types before loading a topology.

use {
    crate::{
        error::{CommError, Result},
        node::NodeLogic,
    },
    std::{collections::HashMap, sync::RwLock},
};

type Factory = Box<dyn Fn() -> Box<dyn NodeLogic> + Send + Sync>;

/// Name → factory table for node types.
#[derive(Default)]
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names();
        f.debug_struct("NodeRegistry").field("types", &names).finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`. Re-registering replaces the
    /// previous factory; the last registration wins.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn NodeLogic> + Send + Sync + 'static,
    {
        let mut factories = match self.factories.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate one node of the named type.
    pub fn create(&self, name: &str) -> Result<Box<dyn NodeLogic>> {
        let factories = match self.factories.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| CommError::UnknownNodeType(name.to_string()))
    }

    /// True when a factory exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        match self.factories.read() {
            Ok(g) => g.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let factories = match self.factories.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }
}
