//! Store registry for resolving a key-value store from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use serde_json::Value;

use recsync_common::{Error, Result};
use crate::store::KeyValueStore;

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn KeyValueStore>> + Send + Sync>;

/// Registry for key-value store factories.
///
/// Allows a store to be chosen by name from configuration, e.g.
/// `{"type": "local", "root": "/var/lib/recsync"}`.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: &Value) -> Result<Arc<dyn KeyValueStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Store '{}' is not registered", name))
        })?;
        factory(config)
    }

    /// Resolve a store from a config object carrying a `"type"` field.
    pub fn resolve_config(&self, config: &Value) -> Result<Arc<dyn KeyValueStore>> {
        let name = config
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config("Store config requires a 'type' field".to_string()))?;
        self.resolve(name, config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in stores.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    registry.factories.insert(
        "local".to_string(),
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Config("Local store requires 'root' path".to_string()))?;
            Ok(Arc::new(crate::local::LocalStore::new(root)?))
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.stores(), vec!["local", "memory"]);
        assert!(registry.has_store("memory"));
    }

    #[test]
    fn test_resolve_memory() {
        let registry = create_default_registry();
        let store = registry.resolve_config(&json!({"type": "memory"})).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_resolve_local_requires_root() {
        let registry = create_default_registry();
        assert!(registry.resolve("local", &json!({})).is_err());

        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().to_string_lossy().to_string();
        let store = registry
            .resolve_config(&json!({"type": "local", "root": root}))
            .unwrap();
        assert_eq!(store.name(), "local");
    }

    #[test]
    fn test_unknown_store() {
        let registry = create_default_registry();
        assert!(registry.resolve("sqlite", &json!({})).is_err());
        assert!(registry.resolve_config(&json!({})).is_err());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = create_default_registry();
        let result = registry.register(
            "memory",
            Box::new(|_| Ok(Arc::new(crate::memory::MemoryStore::new()))),
        );
        assert!(result.is_err());
    }
}
