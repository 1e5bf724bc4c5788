use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use warden_shared::{ConversationState, ExtensionRequest, RegistrationRequest, TrafficSnapshot};

use crate::error::StoreError;

/// Keyed persistence for conversation state, pending requests and traffic snapshots.
///
/// Implementations own their synchronization; callers never hold a lock across calls.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_registration(&self, user_id: i64) -> Result<Option<RegistrationRequest>, StoreError>;
    async fn put_registration(&self, request: &RegistrationRequest) -> Result<(), StoreError>;
    async fn delete_registration(&self, user_id: i64) -> Result<(), StoreError>;
    async fn pending_registrations(&self) -> Result<Vec<RegistrationRequest>, StoreError>;

    async fn get_extension(&self, user_id: i64) -> Result<Option<ExtensionRequest>, StoreError>;
    async fn put_extension(&self, request: &ExtensionRequest) -> Result<(), StoreError>;
    async fn delete_extension(&self, user_id: i64) -> Result<(), StoreError>;

    async fn get_conversation(&self, id: i64) -> Result<Option<ConversationState>, StoreError>;
    async fn set_conversation(&self, id: i64, state: ConversationState) -> Result<(), StoreError>;
    async fn clear_conversation(&self, id: i64) -> Result<(), StoreError>;

    async fn insert_snapshot(&self, snapshot: &TrafficSnapshot) -> Result<(), StoreError>;
    /// Snapshots for one inbound with `from <= taken_at <= to`, oldest first.
    async fn snapshots_between(
        &self,
        inbound_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficSnapshot>, StoreError>;
    /// Returns the number of snapshots removed.
    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-process [`StateStore`]; snapshots are indexed by `(inbound_id, taken_at)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    registrations: RwLock<HashMap<i64, RegistrationRequest>>,
    extensions: RwLock<HashMap<i64, ExtensionRequest>>,
    conversations: RwLock<HashMap<i64, ConversationState>>,
    snapshots: RwLock<BTreeMap<(i64, DateTime<Utc>), TrafficSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_registration(&self, user_id: i64) -> Result<Option<RegistrationRequest>, StoreError> {
        Ok(self.registrations.read().await.get(&user_id).cloned())
    }

    async fn put_registration(&self, request: &RegistrationRequest) -> Result<(), StoreError> {
        self.registrations
            .write()
            .await
            .insert(request.user_id, request.clone());
        Ok(())
    }

    async fn delete_registration(&self, user_id: i64) -> Result<(), StoreError> {
        self.registrations.write().await.remove(&user_id);
        Ok(())
    }

    async fn pending_registrations(&self) -> Result<Vec<RegistrationRequest>, StoreError> {
        let mut pending: Vec<_> = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| r.status == warden_shared::RegistrationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn get_extension(&self, user_id: i64) -> Result<Option<ExtensionRequest>, StoreError> {
        Ok(self.extensions.read().await.get(&user_id).cloned())
    }

    async fn put_extension(&self, request: &ExtensionRequest) -> Result<(), StoreError> {
        self.extensions
            .write()
            .await
            .insert(request.user_id, request.clone());
        Ok(())
    }

    async fn delete_extension(&self, user_id: i64) -> Result<(), StoreError> {
        self.extensions.write().await.remove(&user_id);
        Ok(())
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn set_conversation(&self, id: i64, state: ConversationState) -> Result<(), StoreError> {
        self.conversations.write().await.insert(id, state);
        Ok(())
    }

    async fn clear_conversation(&self, id: i64) -> Result<(), StoreError> {
        self.conversations.write().await.remove(&id);
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &TrafficSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert((snapshot.inbound_id, snapshot.taken_at), snapshot.clone());
        Ok(())
    }

    async fn snapshots_between(
        &self,
        inbound_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficSnapshot>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .snapshots
            .read()
            .await
            .range((inbound_id, from)..=(inbound_id, to))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|(_, taken_at), _| *taken_at >= cutoff);
        Ok((before - snapshots.len()) as u64)
    }
}
