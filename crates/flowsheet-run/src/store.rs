//! Run persistence.
//!
//! The orchestrator speaks to a [`RunStore`] trait; the in-memory store is
//! the reference implementation and the test double. A database-backed store
//! is an external collaborator behind the same trait.

use crate::{Run, RunError};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

pub trait RunStore: Send + Sync {
    fn insert(&self, run: Run) -> Result<(), RunError>;
    fn get(&self, id: Uuid) -> Result<Run, RunError>;
    fn update(&self, run: Run) -> Result<(), RunError>;
    fn list(&self) -> Vec<Run>;
}

/// Process-local store over a `RwLock<HashMap>`.
///
/// Reads hand out clones; a mutation is read-modify-update, and concurrent
/// saves to the same run are last-write-wins at save granularity. There is
/// no optimistic-concurrency guard on the overlay.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for InMemoryRunStore {
    fn insert(&self, run: Run) -> Result<(), RunError> {
        self.runs.write().insert(run.id, run);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Run, RunError> {
        self.runs
            .read()
            .get(&id)
            .cloned()
            .ok_or(RunError::NotFound(id))
    }

    fn update(&self, run: Run) -> Result<(), RunError> {
        let mut runs = self.runs.write();
        if !runs.contains_key(&run.id) {
            return Err(RunError::NotFound(run.id));
        }
        runs.insert(run.id, run);
        Ok(())
    }

    fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}
