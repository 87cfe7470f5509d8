//! Database driver abstraction
//!
//! A [`DriverRegistry`] maps a connection type name to the factory that
//! builds drivers for it.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

pub use memory::{MemoryDriver, MemoryDriverFactory, MemoryState};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDriver, SqliteDriverFactory};
pub use traits::{DatabaseDriver, DriverFactory, QueryCanceler, ReservedConnection, RunningQuery};
pub use types::*;

use crate::error::DriverError;

/// Dispatches [`DriverFactory::build`] on `connection_type`
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Registry with no drivers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled into this build
    pub fn with_defaults() -> Self {
        let registry = Self::new().register("memory", MemoryDriverFactory::new());
        #[cfg(feature = "sqlite")]
        let registry = registry.register("sqlite", SqliteDriverFactory);
        registry
    }

    /// Add or replace the factory for `connection_type`
    pub fn register(mut self, connection_type: &str, factory: impl DriverFactory + 'static) -> Self {
        self.factories
            .insert(connection_type.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    /// Registered connection type names, sorted
    pub fn connection_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl DriverFactory for DriverRegistry {
    fn build(&self, config: &ConnectionConfig) -> Result<Arc<dyn DatabaseDriver>, DriverError> {
        let name = config.connection_type.to_ascii_lowercase();
        let factory = self
            .factories
            .get(&name)
            .ok_or_else(|| DriverError::UnsupportedType(config.connection_type.clone()))?;
        factory.build(config)
    }
}
