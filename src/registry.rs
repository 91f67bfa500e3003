// src/registry.rs
use std::{fmt, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{error::RunnerError, worker::Worker};

/// What is running right now: tenant id -> worker.
///
/// Only reconciler lanes mutate it, one lane per tenant, so two writers never
/// race on the same key. `insert` still refuses to overwrite.
#[derive(Default)]
pub struct Registry {
    workers: DashMap<String, Arc<Worker>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<Worker>> {
        self.workers.get(tenant_id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, tenant_id: &str, worker: Arc<Worker>) -> Result<(), RunnerError> {
        match self.workers.entry(tenant_id.to_string()) {
            Entry::Occupied(_) => Err(RunnerError::DuplicateTenant {
                tenant: tenant_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(worker);
                Ok(())
            }
        }
    }

    pub fn remove(&self, tenant_id: &str) -> Option<Arc<Worker>> {
        self.workers.remove(tenant_id).map(|(_, worker)| worker)
    }

    /// List the ids of all running tenants.
    pub fn tenants(&self) -> Vec<String> {
        self.workers.iter().map(|kv| kv.key().clone()).collect()
    }

    /// Take every worker out, for forced release at shutdown.
    pub fn drain(&self) -> Vec<Arc<Worker>> {
        self.tenants()
            .into_iter()
            .filter_map(|tenant| self.remove(&tenant))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tenants", &self.tenants())
            .finish()
    }
}
