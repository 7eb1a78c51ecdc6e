//! Manager family registries.
//!
//! Maps a stable manager-type identifier to a constructor capable of
//! rehydrating a manager from its persisted raw state. Pump families and CGM
//! families live in separate registries. Registration happens once at process
//! start; afterwards the registry is read-only and shared as `Arc`, safe for
//! concurrent lookup from any thread.
//!
//! Reconstruction failure is not an error: a previously configured family may
//! no longer be compiled into the build, and a malformed blob must degrade to
//! "no active device". Both cases return `None` and log.

use crate::device::capabilities::{CgmManager, PumpManager, RawState};
use crate::model::PersistedManagerState;
use anyhow::Result;
use log::warn;
use std::collections::HashMap;

/// Constructor rehydrating one manager family from raw state.
pub type ManagerConstructor<M> = fn(&RawState) -> Result<Box<M>>;

/// Identifier-keyed constructor registry for one device class.
pub struct ManagerRegistry<M: ?Sized> {
    constructors: HashMap<String, ManagerConstructor<M>>,
}

pub type PumpRegistry = ManagerRegistry<dyn PumpManager>;
pub type CgmRegistry = ManagerRegistry<dyn CgmManager>;

impl<M: ?Sized> ManagerRegistry<M> {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a family constructor. Idempotent by identifier; the last
    /// registration for a given identifier wins.
    pub fn register(&mut self, identifier: impl Into<String>, constructor: ManagerConstructor<M>) {
        self.constructors.insert(identifier.into(), constructor);
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.constructors.contains_key(identifier)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Rehydrate a manager from persisted state.
    ///
    /// Returns `None` when the identifier is unknown or the constructor
    /// rejects the blob; the session then continues without that device.
    pub fn reconstruct(&self, persisted: &PersistedManagerState) -> Option<Box<M>> {
        let Some(constructor) = self.constructors.get(&persisted.manager_identifier) else {
            warn!(
                "no manager family registered for identifier '{}', continuing without it",
                persisted.manager_identifier
            );
            return None;
        };

        match constructor(&persisted.state) {
            Ok(manager) => Some(manager),
            Err(err) => {
                warn!(
                    "manager '{}' rejected persisted state: {err}",
                    persisted.manager_identifier
                );
                None
            }
        }
    }
}

impl<M: ?Sized> Default for ManagerRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockCgm, MockPump};

    #[test]
    fn register_is_idempotent_by_identifier() {
        let mut registry = PumpRegistry::new();
        registry.register(MockPump::IDENTIFIER, MockPump::from_raw_state);
        registry.register(MockPump::IDENTIFIER, MockPump::from_raw_state);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(MockPump::IDENTIFIER));
    }

    #[test]
    fn reconstruct_unknown_identifier_yields_none() {
        let registry = PumpRegistry::new();
        let persisted = PersistedManagerState {
            manager_identifier: "RetiredPumpFamily".into(),
            state: serde_json::json!({}),
        };
        assert!(registry.reconstruct(&persisted).is_none());
    }

    #[test]
    fn reconstruct_rejected_state_yields_none() {
        let mut registry = CgmRegistry::new();
        registry.register(MockCgm::IDENTIFIER, MockCgm::from_raw_state);
        let persisted = PersistedManagerState {
            manager_identifier: MockCgm::IDENTIFIER.into(),
            state: serde_json::json!("not an object"),
        };
        assert!(registry.reconstruct(&persisted).is_none());
    }
}
