//! Code reference registry: (owner, project, function) → content address.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use peerhost_core::config::FunctionEntry;
use peerhost_core::{CodeRef, FunctionId};

use crate::job_store::StoreError;

#[async_trait]
pub trait CodeRegistry: Send + Sync {
    async fn lookup(&self, id: &FunctionId) -> Result<Option<CodeRef>, StoreError>;

    /// Upsert on the (owner, project, function) key.
    async fn register(&self, id: FunctionId, code_ref: CodeRef) -> Result<(), StoreError>;
}

/// In-memory registry, usually seeded from config.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    entries: Arc<DashMap<FunctionId, CodeRef>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[FunctionEntry]) -> Self {
        let registry = Self::new();
        for e in entries {
            registry.entries.insert(
                FunctionId::new(&e.owner, &e.project, &e.function),
                CodeRef(e.code_ref.clone()),
            );
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CodeRegistry for MemoryRegistry {
    async fn lookup(&self, id: &FunctionId) -> Result<Option<CodeRef>, StoreError> {
        let found = self.entries.get(id).map(|c| c.clone());
        match &found {
            Some(code_ref) => tracing::debug!(function = %id, %code_ref, "registry hit"),
            None => tracing::debug!(function = %id, "registry miss"),
        }
        Ok(found)
    }

    async fn register(&self, id: FunctionId, code_ref: CodeRef) -> Result<(), StoreError> {
        tracing::info!(function = %id, %code_ref, "function registered");
        self.entries.insert(id, code_ref);
        Ok(())
    }
}
