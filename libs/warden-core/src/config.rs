use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::time::Duration;

const CONFIG_PATHS: [&str; 2] = ["/etc/caramba/warden.toml", "./warden.toml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Links are issued as `{subscription_base_url}/{subId}`.
    pub subscription_base_url: String,
    #[serde(default)]
    pub operator_ids: Vec<i64>,
    /// Inbound that receives new accounts and supplies canonical attributes.
    #[serde(default)]
    pub reference_inbound_id: Option<i64>,
    #[serde(default = "default_duration_choices")]
    pub duration_choices: Vec<u32>,
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
    #[serde(default)]
    pub trial_auto_approve: bool,
    #[serde(default)]
    pub default_traffic_cap_bytes: i64,
    #[serde(default)]
    pub default_device_limit: i64,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub snapshot_retention_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            snapshot_interval_secs: default_snapshot_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            snapshot_retention_days: default_retention_days(),
        }
    }
}

impl ScheduleConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Alert thresholds for one scope. A zero value disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Thresholds {
    /// Monthly budget the percentage check is measured against.
    #[serde(default)]
    pub limit_bytes: i64,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub absolute_bytes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastConfig {
    #[serde(default)]
    pub inbound: Thresholds,
    #[serde(default)]
    pub aggregate: Thresholds,
}

fn default_duration_choices() -> Vec<u32> {
    vec![30, 90, 180]
}

fn default_trial_days() -> u32 {
    3
}

fn default_sync_interval() -> u64 {
    6 * 3600
}

fn default_snapshot_interval() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    24 * 3600
}

fn default_retention_days() -> u32 {
    62
}

impl WardenConfig {
    /// Loads `/etc/caramba/warden.toml` or `./warden.toml`, falling back to the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        for path in CONFIG_PATHS {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Self::from_toml_str(&contents).with_context(|| format!("Invalid config file {path}"));
            }
        }

        tracing::info!("Loading config from environment");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let schedule = ScheduleConfig {
            sync_interval_secs: parse_or(&get, "SYNC_INTERVAL_SECS", default_sync_interval())?,
            snapshot_interval_secs: parse_or(&get, "SNAPSHOT_INTERVAL_SECS", default_snapshot_interval())?,
            cleanup_interval_secs: parse_or(&get, "CLEANUP_INTERVAL_SECS", default_cleanup_interval())?,
            snapshot_retention_days: parse_or(&get, "SNAPSHOT_RETENTION_DAYS", default_retention_days())?,
        };

        let forecast = ForecastConfig {
            inbound: Thresholds {
                limit_bytes: parse_or(&get, "INBOUND_LIMIT_BYTES", 0)?,
                percent: parse_or(&get, "INBOUND_ALERT_PERCENT", 0.0)?,
                absolute_bytes: parse_or(&get, "INBOUND_ALERT_BYTES", 0)?,
            },
            aggregate: Thresholds {
                limit_bytes: parse_or(&get, "TOTAL_LIMIT_BYTES", 0)?,
                percent: parse_or(&get, "TOTAL_ALERT_PERCENT", 0.0)?,
                absolute_bytes: parse_or(&get, "TOTAL_ALERT_BYTES", 0)?,
            },
        };

        let config = Self {
            subscription_base_url: get("SUBSCRIPTION_BASE_URL").context("SUBSCRIPTION_BASE_URL must be set")?,
            operator_ids: parse_list(get("OPERATOR_IDS"), "OPERATOR_IDS")?.unwrap_or_default(),
            reference_inbound_id: get("REFERENCE_INBOUND_ID")
                .map(|v| v.trim().parse::<i64>().context("REFERENCE_INBOUND_ID must be an integer"))
                .transpose()?,
            duration_choices: parse_list(get("DURATION_CHOICES"), "DURATION_CHOICES")?
                .unwrap_or_else(default_duration_choices),
            trial_days: parse_or(&get, "TRIAL_DAYS", default_trial_days())?,
            trial_auto_approve: parse_or(&get, "TRIAL_AUTO_APPROVE", false)?,
            default_traffic_cap_bytes: parse_or(&get, "DEFAULT_TRAFFIC_CAP_BYTES", 0)?,
            default_device_limit: parse_or(&get, "DEFAULT_DEVICE_LIMIT", 0)?,
            schedule,
            forecast,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscription_base_url.trim().is_empty() {
            bail!("subscription_base_url must not be empty");
        }
        if self.duration_choices.is_empty() || self.duration_choices.contains(&0) {
            bail!("duration_choices must list at least one non-zero duration");
        }
        let s = &self.schedule;
        if s.sync_interval_secs == 0 || s.snapshot_interval_secs == 0 || s.cleanup_interval_secs == 0 {
            bail!("schedule intervals must be greater than zero");
        }
        Ok(())
    }

    pub fn is_operator(&self, id: i64) -> bool {
        self.operator_ids.contains(&id)
    }

    /// Durations a user may pick; the trial duration is offered alongside the paid ones.
    pub fn allows_duration(&self, days: u32) -> bool {
        self.duration_choices.contains(&days) || (self.trial_days > 0 && days == self.trial_days)
    }

    pub fn subscription_link(&self, sub_id: &str) -> String {
        format!("{}/{}", self.subscription_base_url.trim_end_matches('/'), sub_id)
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

fn parse_list<T>(raw: Option<String>, key: &str) -> Result<Option<Vec<T>>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<T>().with_context(|| format!("{key} has an invalid entry: {part}")))
            .collect()
    })
    .transpose()
}
