use crate::session::StateMap;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Receives the session state once a run has finished, whatever its outcome.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn persist(&self, run_id: Uuid, snapshot: StateMap) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, StateMap>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, run_id: &Uuid) -> Option<StateMap> {
        self.snapshots.read().await.get(run_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn persist(&self, run_id: Uuid, snapshot: StateMap) -> Result<()> {
        tracing::debug!(%run_id, keys = snapshot.len(), "persisting snapshot");
        self.snapshots.write().await.insert(run_id, snapshot);
        Ok(())
    }
}
