use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use warden_shared::TrafficSnapshot;

use crate::config::{Thresholds, WardenConfig};
use crate::error::{GatewayError, Result};
use crate::notifier::{self, Notice, Notifier};
use crate::panel::{self, PanelGateway};
use crate::store::StateStore;

/// Accounting period a forecast extrapolates to: the current UTC calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn month_of(now: DateTime<Utc>) -> Self {
        let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or(now.date_naive());
        let next = first.checked_add_months(Months::new(1)).unwrap_or(first);
        Self {
            start: first.and_time(NaiveTime::MIN).and_utc(),
            end: next.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub consumed: i64,
    pub rate_per_hour: f64,
    pub predicted: i64,
    pub hours_observed: f64,
    pub hours_remaining: f64,
    pub samples: usize,
}

impl Forecast {
    /// Cross-inbound sum of several per-inbound forecasts.
    pub fn aggregate(parts: &[Forecast]) -> Option<Forecast> {
        if parts.is_empty() {
            return None;
        }
        Some(Forecast {
            consumed: parts.iter().map(|f| f.consumed).sum(),
            rate_per_hour: parts.iter().map(|f| f.rate_per_hour).sum(),
            predicted: parts.iter().map(|f| f.predicted).sum(),
            hours_observed: parts.iter().map(|f| f.hours_observed).fold(0.0, f64::max),
            hours_remaining: parts.iter().map(|f| f.hours_remaining).fold(0.0, f64::max),
            samples: parts.iter().map(|f| f.samples).sum(),
        })
    }
}

/// Sum of adjacent deltas. A drop means the counter was reset, so the later
/// sample's raw value is what was consumed since the reset.
pub fn consumed(totals: &[i64]) -> i64 {
    totals
        .windows(2)
        .map(|pair| {
            let delta = pair[1] - pair[0];
            if delta < 0 { pair[1] } else { delta }
        })
        .sum()
}

/// Linear extrapolation of the samples inside `period` up to its end.
/// Needs at least two samples spanning a non-zero interval.
pub fn forecast(samples: &[TrafficSnapshot], period: &Period, now: DateTime<Utc>) -> Option<Forecast> {
    let in_period: Vec<&TrafficSnapshot> = samples
        .iter()
        .filter(|s| period.contains(s.taken_at) && s.taken_at <= now)
        .collect();
    if in_period.len() < 2 {
        return None;
    }

    let first = in_period[0].taken_at;
    let last = in_period[in_period.len() - 1].taken_at;
    let hours_observed = hours(last - first);
    if hours_observed <= 0.0 {
        return None;
    }

    let totals: Vec<i64> = in_period.iter().map(|s| s.total()).collect();
    let consumed = consumed(&totals);
    let rate_per_hour = consumed as f64 / hours_observed;
    let hours_remaining = hours(period.end - now).max(0.0);
    let predicted = consumed + (rate_per_hour * hours_remaining).round() as i64;

    Some(Forecast {
        consumed,
        rate_per_hour,
        predicted,
        hours_observed,
        hours_remaining,
        samples: in_period.len(),
    })
}

fn hours(d: Duration) -> f64 {
    d.num_seconds() as f64 / 3600.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertScope {
    Inbound(i64),
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Projection reached `percent` of `limit_bytes`.
    Percent,
    Absolute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficAlert {
    pub scope: AlertScope,
    pub kind: AlertKind,
    pub threshold: i64,
    pub predicted: i64,
    pub consumed: i64,
}

/// Hysteresis flags for one scope. A check fires once when the projection
/// reaches its threshold and re-arms only after it falls back below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertGate {
    pub percent_armed: bool,
    pub absolute_armed: bool,
}

impl Default for AlertGate {
    fn default() -> Self {
        Self {
            percent_armed: true,
            absolute_armed: true,
        }
    }
}

impl AlertGate {
    pub fn evaluate(&mut self, predicted: i64, thresholds: &Thresholds) -> Vec<(AlertKind, i64)> {
        let mut fired = Vec::new();
        if let Some(threshold) = percent_threshold(thresholds) {
            if step(&mut self.percent_armed, predicted, threshold) {
                fired.push((AlertKind::Percent, threshold));
            }
        }
        if thresholds.absolute_bytes > 0 && step(&mut self.absolute_armed, predicted, thresholds.absolute_bytes) {
            fired.push((AlertKind::Absolute, thresholds.absolute_bytes));
        }
        fired
    }
}

fn percent_threshold(t: &Thresholds) -> Option<i64> {
    if t.limit_bytes > 0 && t.percent > 0.0 {
        Some((t.limit_bytes as f64 * t.percent / 100.0).round() as i64)
    } else {
        None
    }
}

fn step(armed: &mut bool, predicted: i64, threshold: i64) -> bool {
    if predicted >= threshold {
        let fire = *armed;
        *armed = false;
        fire
    } else {
        *armed = true;
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastScope {
    Inbound(i64),
    Aggregate,
}

#[derive(Debug, Default)]
pub struct CollectReport {
    pub stored: usize,
    pub failed: Vec<(i64, String)>,
    pub alerts: Vec<TrafficAlert>,
}

pub struct ForecastEngine {
    gateway: Arc<dyn PanelGateway>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    config: Arc<WardenConfig>,
    gates: Mutex<HashMap<AlertScope, AlertGate>>,
}

impl ForecastEngine {
    pub fn new(
        gateway: Arc<dyn PanelGateway>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        config: Arc<WardenConfig>,
    ) -> Self {
        Self {
            gateway,
            store,
            notifier,
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub async fn collect_snapshot(&self) -> Result<CollectReport, GatewayError> {
        self.collect_snapshot_at(Utc::now()).await
    }

    /// Stores one snapshot per inbound, then evaluates alerts for the ones stored.
    pub async fn collect_snapshot_at(&self, now: DateTime<Utc>) -> Result<CollectReport, GatewayError> {
        let gateway = self.gateway.as_ref();
        let inbounds = panel::with_reauth(gateway, || gateway.list_inbounds()).await?;

        let mut report = CollectReport::default();
        let mut stored_ids = Vec::with_capacity(inbounds.len());
        for inbound in &inbounds {
            let snapshot = TrafficSnapshot {
                inbound_id: inbound.id,
                taken_at: now,
                up: inbound.up,
                down: inbound.down,
            };
            match self.store.insert_snapshot(&snapshot).await {
                Ok(()) => {
                    report.stored += 1;
                    stored_ids.push(inbound.id);
                }
                Err(e) => {
                    warn!("Failed to store traffic snapshot for inbound {}: {}", inbound.id, e);
                    report.failed.push((inbound.id, e.to_string()));
                }
            }
        }

        report.alerts = self.evaluate_alerts(&stored_ids, now).await;
        info!(
            "Traffic snapshot collected: {} stored, {} failed, {} alerts",
            report.stored,
            report.failed.len(),
            report.alerts.len()
        );
        Ok(report)
    }

    /// Runs every scope through its gate and notifies operators of the alerts that fired.
    pub async fn evaluate_alerts(&self, inbound_ids: &[i64], now: DateTime<Utc>) -> Vec<TrafficAlert> {
        let mut per_inbound = Vec::with_capacity(inbound_ids.len());
        for &id in inbound_ids {
            match self.inbound_forecast(id, now).await {
                Ok(Some(f)) => per_inbound.push((id, f)),
                Ok(None) => debug!("Not enough samples to forecast inbound {}", id),
                Err(e) => warn!("Skipping forecast for inbound {}: {}", id, e),
            }
        }
        let parts: Vec<Forecast> = per_inbound.iter().map(|(_, f)| f.clone()).collect();
        let aggregate = Forecast::aggregate(&parts);

        let alerts = {
            let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            let mut alerts = Vec::new();
            for (id, f) in &per_inbound {
                let scope = AlertScope::Inbound(*id);
                let gate = gates.entry(scope).or_default();
                for (kind, threshold) in gate.evaluate(f.predicted, &self.config.forecast.inbound) {
                    alerts.push(TrafficAlert {
                        scope,
                        kind,
                        threshold,
                        predicted: f.predicted,
                        consumed: f.consumed,
                    });
                }
            }
            if let Some(f) = &aggregate {
                let gate = gates.entry(AlertScope::Aggregate).or_default();
                for (kind, threshold) in gate.evaluate(f.predicted, &self.config.forecast.aggregate) {
                    alerts.push(TrafficAlert {
                        scope: AlertScope::Aggregate,
                        kind,
                        threshold,
                        predicted: f.predicted,
                        consumed: f.consumed,
                    });
                }
            }
            alerts
        };

        for alert in &alerts {
            warn!(
                "Traffic forecast {:?} reached {:?} threshold: predicted {} >= {}",
                alert.scope, alert.kind, alert.predicted, alert.threshold
            );
            notifier::deliver_to_operators(self.notifier.as_ref(), Notice::TrafficAlert(alert.clone())).await;
        }
        alerts
    }

    pub async fn compute_forecast(&self, scope: ForecastScope) -> Result<Option<Forecast>> {
        self.compute_forecast_at(scope, Utc::now()).await
    }

    pub async fn compute_forecast_at(&self, scope: ForecastScope, now: DateTime<Utc>) -> Result<Option<Forecast>> {
        match scope {
            ForecastScope::Inbound(id) => self.inbound_forecast(id, now).await,
            ForecastScope::Aggregate => {
                let gateway = self.gateway.as_ref();
                let inbounds = panel::with_reauth(gateway, || gateway.list_inbounds()).await?;
                let mut parts = Vec::with_capacity(inbounds.len());
                for inbound in &inbounds {
                    match self.inbound_forecast(inbound.id, now).await {
                        Ok(Some(f)) => parts.push(f),
                        Ok(None) => {}
                        Err(e) => warn!("Skipping inbound {} in aggregate forecast: {}", inbound.id, e),
                    }
                }
                Ok(Forecast::aggregate(&parts))
            }
        }
    }

    async fn inbound_forecast(&self, inbound_id: i64, now: DateTime<Utc>) -> Result<Option<Forecast>> {
        let period = Period::month_of(now);
        let samples = self.store.snapshots_between(inbound_id, period.start, now).await?;
        Ok(forecast(&samples, &period, now))
    }

    pub async fn cleanup_snapshots(&self) -> Result<u64> {
        self.cleanup_snapshots_at(Utc::now()).await
    }

    pub async fn cleanup_snapshots_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention = Duration::days(i64::from(self.config.schedule.snapshot_retention_days));
        let removed = self.store.delete_snapshots_before(now - retention).await?;
        info!("Removed {} traffic snapshots older than {} days", removed, retention.num_days());
        Ok(removed)
    }
}
