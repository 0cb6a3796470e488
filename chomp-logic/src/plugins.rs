//! Named plugin registry for stream handlers, tick reducers and payload
//! pre-transformers. Configuration references plugins by name; a reference
//! to an unregistered name is rejected at startup.

use std::{collections::HashMap, sync::Arc};

use crate::{
    epoch::{Epoch, EpochView},
    value::Value,
};

/// Mutates the live epoch with one decoded stream message.
pub type Handler = Arc<dyn Fn(&serde_json::Value, &mut Epoch) + Send + Sync>;

/// Reduces a frozen epoch view to one field value at a tick boundary.
pub type Reducer = Arc<dyn Fn(&EpochView) -> Option<Value> + Send + Sync>;

/// Applied once to a decoded payload before field selection.
pub type PreTransformer = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

#[derive(Default, Clone)]
pub struct PluginRegistry {
    handlers: HashMap<String, Handler>,
    reducers: HashMap<String, Reducer>,
    pre_transformers: HashMap<String, PreTransformer>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&serde_json::Value, &mut Epoch) + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_reducer<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&EpochView) -> Option<Value> + Send + Sync + 'static,
    {
        self.reducers.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_pre_transformer<F>(&mut self, name: &str, f: F)
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.pre_transformers.insert(name.to_string(), Arc::new(f));
    }

    pub fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn reducer(&self, name: &str) -> Option<Reducer> {
        self.reducers.get(name).cloned()
    }

    pub fn pre_transformer(&self, name: &str) -> Option<PreTransformer> {
        self.pre_transformers.get(name).cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn has_reducer(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }

    pub fn has_pre_transformer(&self, name: &str) -> bool {
        self.pre_transformers.contains_key(name)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("reducers", &self.reducers.keys().collect::<Vec<_>>())
            .field(
                "pre_transformers",
                &self.pre_transformers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}
