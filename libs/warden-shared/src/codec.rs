//! Typed view over the client list the panel embeds in each inbound's `settings`.
//!
//! The panel stores settings as a JSON string and several of its versions
//! disagree on numeric encodings, so numbers are read leniently and always
//! written back as plain integers. Keys this crate does not model are carried
//! in `extra` and re-emitted untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::models::Protocol;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed inbound settings: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(rename = "subId", default)]
    pub sub_id: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Epoch milliseconds, 0 means unlimited, negative means "days after first use".
    #[serde(rename = "expiryTime", default, deserialize_with = "lenient_i64")]
    pub expiry_time: i64,
    /// Traffic cap in bytes, 0 means unlimited.
    #[serde(rename = "totalGB", default, deserialize_with = "lenient_i64")]
    pub total_bytes: i64,
    #[serde(rename = "tgId", default, deserialize_with = "lenient_i64")]
    pub tg_id: i64,
    #[serde(rename = "limitIp", default, deserialize_with = "lenient_i64")]
    pub limit_ip: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_enable() -> bool {
    true
}

impl ClientRecord {
    /// Identifier the panel addresses this client by on update/delete calls.
    pub fn key(&self, protocol: &Protocol) -> Option<&str> {
        match protocol {
            Protocol::Vmess | Protocol::Vless => self.id.as_deref(),
            Protocol::Trojan => self.password.as_deref(),
            Protocol::Shadowsocks => Some(self.email.as_str()).filter(|e| !e.is_empty()),
            Protocol::Other(_) => None,
        }
    }

    pub fn username(&self) -> &str {
        canonical_username(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default, deserialize_with = "nullable_clients")]
    pub clients: Vec<ClientRecord>,
    /// Shadowsocks cipher, inherited by clients created in this inbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundSettings {
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        if raw.trim().is_empty() {
            return Ok(Self {
                clients: Vec::new(),
                method: None,
                extra: Map::new(),
            });
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// `flow` used by existing clients, so new vless clients match the inbound's transport.
    pub fn client_flow(&self) -> Option<&str> {
        self.clients
            .iter()
            .filter_map(|c| c.flow.as_deref())
            .find(|flow| !flow.is_empty())
    }
}

/// Payload accepted by the panel's add/update client endpoints.
pub fn encode_clients(clients: &[ClientRecord]) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&json!({ "clients": clients }))?)
}

/// Normalizes any numeric encoding the panel produces to an integer.
pub fn normalize_number(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().map(float_to_i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(float_to_i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn float_to_i64(f: f64) -> i64 {
    if f.is_finite() { f.round() as i64 } else { 0 }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_number(&value))
}

fn nullable_clients<'de, D>(deserializer: D) -> Result<Vec<ClientRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ClientRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Per-inbound email suffix derived from the inbound remark.
pub fn inbound_suffix(remark: &str, inbound_id: i64) -> String {
    let mut slug = String::new();
    for ch in remark.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        format!("in{inbound_id}")
    } else {
        slug
    }
}

pub fn suffixed_email(username: &str, suffix: &str) -> String {
    format!("{username}@{suffix}")
}

/// Usernames never contain `@`, so everything from the first one on is a suffix.
pub fn canonical_username(email: &str) -> &str {
    email.split_once('@').map_or(email, |(name, _)| name)
}
