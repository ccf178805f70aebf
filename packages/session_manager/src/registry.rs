//! In-memory registry of session records.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::EngineSession;
use crate::record::{SessionRecord, SessionSnapshot, SessionState};

/// Map of instance id to its record. Every operation is a single atomic
/// point mutation or read; records for different ids never contend beyond
/// the map lock itself.
#[derive(Default)]
pub struct Registry {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.records.read().await.get(id).map(SessionRecord::snapshot)
    }

    /// Snapshot of every record, in no particular order.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        self.records
            .read()
            .await
            .values()
            .map(SessionRecord::snapshot)
            .collect()
    }

    /// Insert a record keyed by its id, returning any record it replaced.
    pub async fn put(&self, record: SessionRecord) -> Option<SessionRecord> {
        self.records.write().await.insert(record.id.clone(), record)
    }

    pub async fn remove(&self, id: &str) -> Option<SessionRecord> {
        self.records.write().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Mutate a record in place. `None` if it does not exist.
    pub async fn update<R>(&self, id: &str, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        self.records.write().await.get_mut(id).map(f)
    }

    /// Mutate a record only while it still belongs to `generation`.
    pub(crate) async fn update_current<R>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Option<R> {
        self.records
            .write()
            .await
            .get_mut(id)
            .filter(|record| record.generation == generation)
            .map(f)
    }

    pub(crate) async fn is_current(&self, id: &str, generation: u64) -> bool {
        self.records
            .read()
            .await
            .get(id)
            .is_some_and(|record| record.generation == generation)
    }

    /// Run `f` against the whole map under one write lock, for transitions
    /// that must check and insert atomically.
    pub(crate) async fn transact<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, SessionRecord>) -> R,
    ) -> R {
        f(&mut *self.records.write().await)
    }

    /// The live engine session for `id`, alongside the record's state.
    pub(crate) async fn live_session(
        &self,
        id: &str,
    ) -> Option<(SessionState, Option<Arc<dyn EngineSession>>)> {
        self.records.read().await.get(id).map(|record| {
            (
                record.state,
                record.socket.as_ref().map(|socket| socket.session()),
            )
        })
    }

    pub(crate) async fn drain(&self) -> Vec<SessionRecord> {
        self.records
            .write()
            .await
            .drain()
            .map(|(_, record)| record)
            .collect()
    }
}
