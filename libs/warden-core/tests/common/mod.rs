#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use warden_core::notifier::Notifier;
use warden_core::{GatewayError, Notice, PanelGateway, WardenConfig};
use warden_core::shared::{ClientRecord, ClientTraffic, Inbound, InboundSettings, Protocol};

pub const OPERATOR: i64 = 100;
pub const DAY_MS: i64 = 86_400_000;

pub fn setup_tracing() {
    let _ = warden_core::telemetry::init_tracing("warn");
}

pub fn config(trial_auto_approve: bool) -> WardenConfig {
    WardenConfig::from_toml_str(&format!(
        r#"
        subscription_base_url = "https://sub.example.com/s/"
        operator_ids = [{OPERATOR}]
        reference_inbound_id = 1
        duration_choices = [30, 90]
        trial_days = 3
        trial_auto_approve = {trial_auto_approve}
        default_traffic_cap_bytes = 50000000000
        default_device_limit = 2
        "#
    ))
    .expect("test config")
}

pub fn inbound(id: i64, remark: &str, protocol: &str, clients: Value) -> Inbound {
    let mut settings = json!({ "clients": clients });
    if protocol == "shadowsocks" {
        settings["method"] = json!("2022-blake3-aes-256-gcm");
        settings["password"] = json!("server-key");
    }
    Inbound {
        id,
        remark: remark.to_string(),
        protocol: Protocol::from(protocol),
        enable: true,
        settings: settings.to_string(),
        up: 0,
        down: 0,
    }
}

/// In-memory panel that enforces email uniqueness across all inbounds like the real one.
#[derive(Default)]
pub struct FakePanel {
    inbounds: Mutex<Vec<Inbound>>,
    traffic: Mutex<HashMap<String, ClientTraffic>>,
    failing: Mutex<HashSet<i64>>,
    expire_next: AtomicBool,
    adds: AtomicUsize,
    updates: AtomicUsize,
    renewals: AtomicUsize,
}

impl FakePanel {
    pub fn new(inbounds: Vec<Inbound>) -> Self {
        Self {
            inbounds: Mutex::new(inbounds),
            ..Self::default()
        }
    }

    pub fn clients(&self, inbound_id: i64) -> Vec<ClientRecord> {
        self.inbounds
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == inbound_id)
            .map(|i| i.parse_settings().unwrap().clients)
            .unwrap_or_default()
    }

    pub fn client_of(&self, inbound_id: i64, tg_id: i64) -> Option<ClientRecord> {
        self.clients(inbound_id).into_iter().find(|c| c.tg_id == tg_id)
    }

    /// Every write and traffic lookup against `inbound_id` is rejected until [`FakePanel::recover`].
    pub fn fail_inbound(&self, inbound_id: i64) {
        self.failing.lock().unwrap().insert(inbound_id);
    }

    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn expire_session_once(&self) {
        self.expire_next.store(true, Ordering::SeqCst);
    }

    pub fn set_counters(&self, inbound_id: i64, up: i64, down: i64) {
        let mut inbounds = self.inbounds.lock().unwrap();
        if let Some(inbound) = inbounds.iter_mut().find(|i| i.id == inbound_id) {
            inbound.up = up;
            inbound.down = down;
        }
    }

    pub fn set_client_traffic(&self, inbound_id: i64, email: &str, up: i64, down: i64) {
        self.traffic.lock().unwrap().insert(
            email.to_string(),
            ClientTraffic {
                inbound_id,
                email: email.to_string(),
                up,
                down,
                enable: true,
            },
        );
    }

    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn check_session(&self) -> Result<(), GatewayError> {
        if self.expire_next.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::SessionExpired);
        }
        Ok(())
    }

    fn check_failing(&self, inbound_id: i64) -> Result<(), GatewayError> {
        if self.failing.lock().unwrap().contains(&inbound_id) {
            return Err(GatewayError::Rejected(format!("inbound {inbound_id} is read-only")));
        }
        Ok(())
    }

    fn edit<F>(&self, inbound_id: i64, change: F) -> Result<(), GatewayError>
    where
        F: FnOnce(&Protocol, &mut InboundSettings) -> Result<(), GatewayError>,
    {
        let mut inbounds = self.inbounds.lock().unwrap();
        let inbound = inbounds
            .iter_mut()
            .find(|i| i.id == inbound_id)
            .ok_or_else(|| GatewayError::NotFound(format!("inbound {inbound_id}")))?;
        let mut settings = inbound
            .parse_settings()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        change(&inbound.protocol, &mut settings)?;
        inbound.settings = settings.to_json().map_err(|e| GatewayError::Rejected(e.to_string()))?;
        Ok(())
    }

    fn email_in_use(&self, email: &str, except: Option<(i64, &str)>) -> bool {
        let inbounds = self.inbounds.lock().unwrap();
        inbounds.iter().any(|inbound| {
            let Ok(settings) = inbound.parse_settings() else {
                return false;
            };
            settings.clients.iter().any(|c| {
                let is_self = except
                    .is_some_and(|(id, key)| id == inbound.id && c.key(&inbound.protocol) == Some(key));
                !is_self && c.email.eq_ignore_ascii_case(email)
            })
        })
    }
}

#[async_trait]
impl PanelGateway for FakePanel {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, GatewayError> {
        self.check_session()?;
        Ok(self.inbounds.lock().unwrap().clone())
    }

    async fn add_client(&self, inbound_id: i64, client: &ClientRecord) -> Result<(), GatewayError> {
        self.check_session()?;
        self.check_failing(inbound_id)?;
        if self.email_in_use(&client.email, None) {
            return Err(GatewayError::Rejected(format!("duplicate email: {}", client.email)));
        }
        self.edit(inbound_id, |_, settings| {
            settings.clients.push(client.clone());
            Ok(())
        })?;
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_client(&self, inbound_id: i64, client_key: &str, client: &ClientRecord) -> Result<(), GatewayError> {
        self.check_session()?;
        self.check_failing(inbound_id)?;
        if self.email_in_use(&client.email, Some((inbound_id, client_key))) {
            return Err(GatewayError::Rejected(format!("duplicate email: {}", client.email)));
        }
        self.edit(inbound_id, |protocol, settings| {
            let slot = settings
                .clients
                .iter_mut()
                .find(|c| c.key(protocol) == Some(client_key))
                .ok_or_else(|| GatewayError::NotFound(format!("client {client_key}")))?;
            *slot = client.clone();
            Ok(())
        })?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_client(&self, inbound_id: i64, client_key: &str) -> Result<(), GatewayError> {
        self.check_session()?;
        self.check_failing(inbound_id)?;
        self.edit(inbound_id, |protocol, settings| {
            let before = settings.clients.len();
            settings.clients.retain(|c| c.key(protocol) != Some(client_key));
            if settings.clients.len() == before {
                return Err(GatewayError::NotFound(format!("client {client_key}")));
            }
            Ok(())
        })
    }

    async fn client_traffic(&self, email: &str) -> Result<Option<ClientTraffic>, GatewayError> {
        self.check_session()?;
        let traffic = self.traffic.lock().unwrap().get(email).cloned();
        if let Some(t) = &traffic {
            self.check_failing(t.inbound_id)?;
        }
        Ok(traffic)
    }

    async fn renew_session(&self) -> Result<(), GatewayError> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recipient {
    User(i64),
    Operator(i64),
    Operators,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Recipient, Notice)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(Recipient, Notice)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn to(&self, recipient: Recipient) -> Vec<Notice> {
        self.sent()
            .into_iter()
            .filter(|(r, _)| *r == recipient)
            .map(|(_, n)| n)
            .collect()
    }

    fn record(&self, recipient: Recipient, notice: Notice) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((recipient, notice));
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, user_id: i64, notice: Notice) -> anyhow::Result<()> {
        self.record(Recipient::User(user_id), notice)
    }

    async fn notify_operator(&self, operator_id: i64, notice: Notice) -> anyhow::Result<()> {
        self.record(Recipient::Operator(operator_id), notice)
    }

    async fn notify_operators(&self, notice: Notice) -> anyhow::Result<()> {
        self.record(Recipient::Operators, notice)
    }
}
