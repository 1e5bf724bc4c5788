use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{CodecError, InboundSettings};

/// Inbound protocol as reported by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Other(String),
}

impl Protocol {
    /// Whether inbounds of this protocol hold a per-user client list.
    pub fn carries_clients(&self) -> bool {
        !matches!(self, Protocol::Other(_))
    }

    /// Stream-style protocols identify clients by UUID, the rest by password.
    pub fn uses_uuid(&self) -> bool {
        matches!(self, Protocol::Vmess | Protocol::Vless)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Other(tag) => tag,
        }
    }
}

impl From<String> for Protocol {
    fn from(tag: String) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "vmess" => Protocol::Vmess,
            "vless" => Protocol::Vless,
            "trojan" => Protocol::Trojan,
            "shadowsocks" => Protocol::Shadowsocks,
            _ => Protocol::Other(tag),
        }
    }
}

impl From<&str> for Protocol {
    fn from(tag: &str) -> Self {
        Protocol::from(tag.to_string())
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One listener configured on the panel, with its embedded client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Raw JSON string exactly as the panel stores it.
    #[serde(default)]
    pub settings: String,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
}

fn default_true() -> bool {
    true
}

impl Inbound {
    pub fn parse_settings(&self) -> Result<InboundSettings, CodecError> {
        InboundSettings::parse(&self.settings)
    }

    pub fn total_traffic(&self) -> i64 {
        self.up.saturating_add(self.down)
    }
}

/// Per-client counters returned by the panel's traffic-by-email lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTraffic {
    pub inbound_id: i64,
    pub email: String,
    pub up: i64,
    pub down: i64,
    pub enable: bool,
}

impl ClientTraffic {
    pub fn total(&self) -> i64 {
        self.up.saturating_add(self.down)
    }
}

/// Messaging-platform identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub display_name: String,
}

/// Lifecycle of a registration request. `Approved` and `Rejected` name the
/// decision only: a decided request is removed from the store, so neither is
/// ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    InputUsername,
    InputDuration,
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationStatus::InputUsername => "input_username",
            RegistrationStatus::InputDuration => "input_duration",
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Approved => "approved",
            RegistrationStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub user_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    pub duration_days: Option<u32>,
    pub status: RegistrationStatus,
    pub created_at: DateTime<Utc>,
}

impl RegistrationRequest {
    pub fn new(user: &User, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            display_name: user.display_name.clone(),
            username: None,
            duration_days: None,
            status: RegistrationStatus::InputUsername,
            created_at: now,
        }
    }
}

/// Same lifecycle as [`RegistrationStatus`] without the username step; the
/// terminal variants are likewise never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    InputDuration,
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtensionStatus::InputDuration => "input_duration",
            ExtensionStatus::Pending => "pending",
            ExtensionStatus::Approved => "approved",
            ExtensionStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRequest {
    pub user_id: i64,
    pub display_name: String,
    pub duration_days: Option<u32>,
    pub status: ExtensionStatus,
    pub created_at: DateTime<Utc>,
    /// Expiry fixed by the first approval attempt, reused when the operator retries.
    #[serde(default)]
    pub target_expiry: Option<i64>,
}

impl ExtensionRequest {
    pub fn new(user: &User, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            display_name: user.display_name.clone(),
            duration_days: None,
            status: ExtensionStatus::InputDuration,
            created_at: now,
            target_expiry: None,
        }
    }
}

/// What the next free-text message from a user or operator is expected to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationState {
    AwaitingUsername,
    AwaitingRename { tg_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub inbound_id: i64,
    pub taken_at: DateTime<Utc>,
    pub up: i64,
    pub down: i64,
}

impl TrafficSnapshot {
    pub fn total(&self) -> i64 {
        self.up.saturating_add(self.down)
    }
}
