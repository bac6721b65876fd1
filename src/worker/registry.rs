use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::WorkUnit;
use crate::errors::{FanoutError, Result};

/// Units of work by name
#[derive(Clone, Default)]
pub struct WorkUnitRegistry {
    units: Arc<DashMap<String, Arc<dyn WorkUnit>>>,
}

impl WorkUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with every unit declared through `#[work_unit]`
    pub fn with_registered() -> Result<Self> {
        let registry = Self::new();
        for factory in crate::WORK_UNITS {
            registry.register(factory())?;
        }
        debug!(count = registry.units.len(), "Loaded registered work units");
        Ok(registry)
    }

    pub fn register(&self, unit: Arc<dyn WorkUnit>) -> Result<()> {
        let name = unit.name().to_string();
        if self.units.contains_key(&name) {
            return Err(FanoutError::configuration(format!(
                "Work unit already registered: {}",
                name
            )));
        }
        self.units.insert(name, unit);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn WorkUnit>> {
        self.units
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FanoutError::WorkUnitNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
