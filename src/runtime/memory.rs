//! In-process container runtime.
//!
//! Keeps units in a map instead of talking to a daemon.  Used by the
//! `memory` backend and by tests that need a runtime whose state they can
//! inspect.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use super::{ContainerRuntime, Unit, ACTIVE};
use crate::error::RuntimeError;
use crate::model::Application;

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    units: Mutex<BTreeMap<String, Unit>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_units(units: impl IntoIterator<Item = Unit>) -> Self {
        Self {
            units: Mutex::new(units.into_iter().map(|u| (u.name.clone(), u)).collect()),
        }
    }

    pub async fn units(&self) -> Vec<Unit> {
        self.units.lock().await.values().cloned().collect()
    }

    /// Change a unit's activation state, as if its container had exited or
    /// been restarted outside our control.
    pub async fn set_activation_state(&self, name: &str, state: &str) {
        if let Some(unit) = self.units.lock().await.get_mut(name) {
            unit.activation_state = state.to_string();
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn list_units(&self) -> Result<Vec<Unit>, RuntimeError> {
        Ok(self.units().await)
    }

    async fn create(&self, application: &Application) -> Result<(), RuntimeError> {
        let mut units = self.units.lock().await;
        if units.contains_key(&application.name) {
            return Err(RuntimeError::Other(format!(
                "Unit already exists: {}",
                application.name
            )));
        }
        let state = if application.running { ACTIVE } else { "inactive" };
        units.insert(
            application.name.clone(),
            Unit::from_application(application, state),
        );
        debug!("Created unit {} ({})", application.name, state);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        if self.units.lock().await.remove(name).is_some() {
            debug!("Removed unit {}", name);
        }
        Ok(())
    }
}
