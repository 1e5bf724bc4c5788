mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{FakePanel, Recipient, RecordingNotifier, inbound, setup_tracing};
use serde_json::json;
use std::sync::Arc;
use warden_core::config::Thresholds;
use warden_core::services::forecast_service::{AlertKind, AlertScope, ForecastEngine, ForecastScope};
use warden_core::shared::{ConversationState, ExtensionRequest, RegistrationRequest, TrafficSnapshot};
use warden_core::{MemoryStore, Notice, StateStore, StoreError, WardenConfig};

struct Harness {
    panel: Arc<FakePanel>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    engine: ForecastEngine,
}

fn harness() -> Harness {
    harness_with(|store| store as Arc<dyn StateStore>)
}

/// Builds the engine over whatever store `wrap` puts in front of the shared [`MemoryStore`].
fn harness_with<F>(wrap: F) -> Harness
where
    F: FnOnce(Arc<MemoryStore>) -> Arc<dyn StateStore>,
{
    setup_tracing();
    let panel = Arc::new(FakePanel::new(vec![
        inbound(1, "Main", "vless", json!([])),
        inbound(2, "NL", "trojan", json!([])),
    ]));
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let mut config: WardenConfig = common::config(false);
    config.forecast.inbound = Thresholds {
        absolute_bytes: 5000,
        ..Thresholds::default()
    };
    config.forecast.aggregate = Thresholds {
        absolute_bytes: 10_000,
        ..Thresholds::default()
    };

    let engine = ForecastEngine::new(panel.clone(), wrap(store.clone()), notifier.clone(), Arc::new(config));
    Harness {
        panel,
        store,
        notifier,
        engine,
    }
}

fn april(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, day, hour, 0, 0).unwrap()
}

/// Inbound 1 uses 10 bytes/hour, inbound 2 uses 5 bytes/hour.
async fn collect_three(h: &Harness) -> Vec<usize> {
    let mut alerts = Vec::new();
    for (hour, one, two) in [(0, 0, 0), (10, 100, 50), (20, 200, 100)] {
        h.panel.set_counters(1, one / 2, one - one / 2);
        h.panel.set_counters(2, 0, two);
        let report = h.engine.collect_snapshot_at(april(1, hour)).await.unwrap();
        assert_eq!(report.stored, 2);
        alerts.push(report.alerts.len());
    }
    alerts
}

#[tokio::test]
async fn collection_stores_one_snapshot_per_inbound() {
    let h = harness();
    collect_three(&h).await;

    assert_eq!(h.store.snapshot_count().await, 6);
    let rows = h.store.snapshots_between(1, april(1, 0), april(1, 20)).await.unwrap();
    assert_eq!(rows.iter().map(|s| s.total()).collect::<Vec<_>>(), vec![0, 100, 200]);
}

#[tokio::test]
async fn alerts_fire_once_per_crossing() {
    let h = harness();

    // Inbound 1 projects 7200 (over 5000); the sum projects 10800 (over 10000).
    assert_eq!(collect_three(&h).await, vec![0, 2, 0]);

    let alerts: Vec<_> = h
        .notifier
        .to(Recipient::Operators)
        .into_iter()
        .filter_map(|n| match n {
            Notice::TrafficAlert(alert) => Some(alert),
            _ => None,
        })
        .collect();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].scope, AlertScope::Inbound(1));
    assert_eq!(alerts[0].kind, AlertKind::Absolute);
    assert_eq!(alerts[0].predicted, 7200);
    assert_eq!(alerts[1].scope, AlertScope::Aggregate);
    assert_eq!(alerts[1].predicted, 10_800);
}

#[tokio::test]
async fn forecast_per_inbound_and_aggregate() {
    let h = harness();
    collect_three(&h).await;
    let now = april(1, 20);

    let one = h
        .engine
        .compute_forecast_at(ForecastScope::Inbound(1), now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.consumed, 200);
    assert_eq!(one.predicted, 200 + 10 * 700);

    let total = h
        .engine
        .compute_forecast_at(ForecastScope::Aggregate, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(total.consumed, 300);
    assert_eq!(total.predicted, 7200 + 3600);

    assert!(
        h.engine
            .compute_forecast_at(ForecastScope::Inbound(99), now)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn counter_reset_is_not_subtracted() {
    let h = harness();
    for (hour, total) in [(0, 100), (1, 40), (2, 90)] {
        h.store
            .insert_snapshot(&TrafficSnapshot {
                inbound_id: 1,
                taken_at: april(2, hour),
                up: 0,
                down: total,
            })
            .await
            .unwrap();
    }

    let f = h
        .engine
        .compute_forecast_at(ForecastScope::Inbound(1), april(2, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.consumed, 90);
}

#[tokio::test]
async fn cleanup_honours_retention() {
    let h = harness();
    let now = april(30, 0);
    for age in [90, 63, 1] {
        h.store
            .insert_snapshot(&TrafficSnapshot {
                inbound_id: 1,
                taken_at: now - Duration::days(age),
                up: 0,
                down: 0,
            })
            .await
            .unwrap();
    }

    assert_eq!(h.engine.cleanup_snapshots_at(now).await.unwrap(), 2);
    assert_eq!(h.store.snapshot_count().await, 1);
}

#[tokio::test]
async fn expired_session_during_collection_is_renewed() {
    let h = harness();
    h.panel.expire_session_once();

    let report = h.engine.collect_snapshot_at(april(1, 0)).await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(h.panel.renewals(), 1);
}

/// Delegates to a [`MemoryStore`] but refuses snapshots for one inbound.
struct SnapshotRejectingStore {
    inner: Arc<MemoryStore>,
    rejected_inbound: i64,
}

#[async_trait]
impl StateStore for SnapshotRejectingStore {
    async fn get_registration(&self, user_id: i64) -> Result<Option<RegistrationRequest>, StoreError> {
        self.inner.get_registration(user_id).await
    }

    async fn put_registration(&self, request: &RegistrationRequest) -> Result<(), StoreError> {
        self.inner.put_registration(request).await
    }

    async fn delete_registration(&self, user_id: i64) -> Result<(), StoreError> {
        self.inner.delete_registration(user_id).await
    }

    async fn pending_registrations(&self) -> Result<Vec<RegistrationRequest>, StoreError> {
        self.inner.pending_registrations().await
    }

    async fn get_extension(&self, user_id: i64) -> Result<Option<ExtensionRequest>, StoreError> {
        self.inner.get_extension(user_id).await
    }

    async fn put_extension(&self, request: &ExtensionRequest) -> Result<(), StoreError> {
        self.inner.put_extension(request).await
    }

    async fn delete_extension(&self, user_id: i64) -> Result<(), StoreError> {
        self.inner.delete_extension(user_id).await
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<ConversationState>, StoreError> {
        self.inner.get_conversation(id).await
    }

    async fn set_conversation(&self, id: i64, state: ConversationState) -> Result<(), StoreError> {
        self.inner.set_conversation(id, state).await
    }

    async fn clear_conversation(&self, id: i64) -> Result<(), StoreError> {
        self.inner.clear_conversation(id).await
    }

    async fn insert_snapshot(&self, snapshot: &TrafficSnapshot) -> Result<(), StoreError> {
        if snapshot.inbound_id == self.rejected_inbound {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.insert_snapshot(snapshot).await
    }

    async fn snapshots_between(
        &self,
        inbound_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficSnapshot>, StoreError> {
        self.inner.snapshots_between(inbound_id, from, to).await
    }

    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.delete_snapshots_before(cutoff).await
    }
}

#[tokio::test]
async fn store_failure_skips_only_that_inbound() {
    let h = harness_with(|inner| {
        Arc::new(SnapshotRejectingStore {
            inner,
            rejected_inbound: 2,
        })
    });

    let mut reports = Vec::new();
    for (hour, one, two) in [(0, 0, 0), (10, 100, 50)] {
        h.panel.set_counters(1, 0, one);
        h.panel.set_counters(2, 0, two);
        reports.push(h.engine.collect_snapshot_at(april(1, hour)).await.unwrap());
    }

    let last = &reports[1];
    assert_eq!(last.stored, 1);
    assert_eq!(last.failed.len(), 1);
    assert_eq!(last.failed[0].0, 2);
    assert!(last.failed[0].1.contains("disk full"));

    assert_eq!(h.store.snapshot_count().await, 2);
    assert!(h.store.snapshots_between(2, april(1, 0), april(1, 10)).await.unwrap().is_empty());

    // Inbound 1 alone projects 7200, over its 5000 limit but under the 10000 aggregate one.
    assert_eq!(last.alerts.len(), 1);
    assert_eq!(last.alerts[0].scope, AlertScope::Inbound(1));
    assert_eq!(last.alerts[0].predicted, 7200);
}
