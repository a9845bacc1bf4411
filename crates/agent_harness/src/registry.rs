use std::sync::Arc;

use crate::adapter::Adapter;
use crate::error::HarnessError;

/// Name-keyed mapping from backend id to adapter instance.
///
/// Single-writer configuration established at startup; registrations are
/// expected to complete before concurrent lookups begin. `Vec`-backed so
/// [`AdapterRegistry::list`] reflects insertion order.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: Vec<(String, Arc<dyn Adapter>)>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own id. Fails when the id is taken.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) -> Result<(), HarnessError> {
        let name = adapter.id().to_string();
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(HarnessError::DuplicateAdapter(name));
        }
        self.entries.push((name, adapter));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, adapter)| Arc::clone(adapter))
    }

    /// All registered names, in insertion order.
    pub fn list(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Removes a registration; returns whether the name was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| existing != name);
        self.entries.len() != before
    }
}
