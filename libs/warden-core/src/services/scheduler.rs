use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::config::WardenConfig;
use crate::services::forecast_service::ForecastEngine;
use crate::services::identity_sync::IdentitySyncEngine;

/// Independent interval timers, one task each, stopped together by a broadcast signal.
pub struct Scheduler {
    shutdown_sender: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            shutdown_sender: tx,
            handles: Vec::new(),
        }
    }

    /// Runs `job` immediately and then every `period`. A failed run is logged and the
    /// timer keeps going; shutdown is only observed between runs.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut shutdown_signal = self.shutdown_sender.subscribe();
        let handle = tokio::spawn(async move {
            info!("Starting {} every {}s", name, period.as_secs());
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_signal.recv() => {
                        info!("{} received shutdown signal, stopping...", name);
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = job().await {
                            error!("{} failed: {}", name, e);
                        }
                    }
                }
            }
        });
        self.handles.push((name, handle));
    }

    /// Identity sync, snapshot collection and snapshot cleanup on their configured intervals.
    pub fn start(&mut self, config: &WardenConfig, sync: Arc<IdentitySyncEngine>, forecast: Arc<ForecastEngine>) {
        let schedule = &config.schedule;

        self.spawn_periodic("identity sync", schedule.sync_interval(), move || {
            let sync = sync.clone();
            async move {
                sync.run_cycle().await?;
                Ok::<(), anyhow::Error>(())
            }
        });

        let collector = forecast.clone();
        self.spawn_periodic("traffic snapshot", schedule.snapshot_interval(), move || {
            let collector = collector.clone();
            async move {
                collector.collect_snapshot().await?;
                Ok::<(), anyhow::Error>(())
            }
        });

        self.spawn_periodic("snapshot cleanup", schedule.cleanup_interval(), move || {
            let forecast = forecast.clone();
            async move {
                forecast.cleanup_snapshots().await?;
                Ok::<(), anyhow::Error>(())
            }
        });
    }

    pub fn running(&self) -> usize {
        self.handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    pub async fn shutdown(self) {
        // No receivers simply means nothing was started.
        let _ = self.shutdown_sender.send(());
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("{} task ended abnormally: {}", name, e);
            }
        }
        info!("Scheduler stopped");
    }
}
