//! One parsed view of every client-bearing inbound, folded into logical accounts.

use serde_json::Map;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};
use warden_shared::codec::inbound_suffix;
use warden_shared::{ClientRecord, Inbound, InboundSettings, Protocol};

use crate::credentials::fresh_credential;
use crate::error::{GatewayError, WardenError};
use crate::panel::{self, PanelGateway};

/// Attributes replicated verbatim to every copy of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAttributes {
    pub tg_id: i64,
    pub sub_id: String,
    pub enable: bool,
    pub expiry_time: i64,
    pub total_bytes: i64,
    pub limit_ip: i64,
}

impl AccountAttributes {
    pub fn of(record: &ClientRecord) -> Self {
        Self {
            tg_id: record.tg_id,
            sub_id: record.sub_id.clone(),
            enable: record.enable,
            expiry_time: record.expiry_time,
            total_bytes: record.total_bytes,
            limit_ip: record.limit_ip,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedInbound {
    pub inbound: Inbound,
    pub settings: InboundSettings,
    pub suffix: String,
}

impl ParsedInbound {
    /// New record for this inbound with its own freshly generated credential.
    pub fn new_client(&self, email: String, attrs: &AccountAttributes) -> ClientRecord {
        let protocol = &self.inbound.protocol;
        let credential = fresh_credential(protocol, self.settings.method.as_deref());
        let flow = match protocol {
            Protocol::Vless => Some(self.settings.client_flow().unwrap_or_default().to_string()),
            _ => None,
        };
        ClientRecord {
            email,
            id: credential.id,
            password: credential.password,
            method: credential.method,
            flow,
            sub_id: attrs.sub_id.clone(),
            enable: attrs.enable,
            expiry_time: attrs.expiry_time,
            total_bytes: attrs.total_bytes,
            tg_id: attrs.tg_id,
            limit_ip: attrs.limit_ip,
            extra: Map::new(),
        }
    }
}

/// A client record together with the inbound it lives in.
#[derive(Debug, Clone)]
pub struct AccountCopy {
    pub inbound_id: i64,
    pub protocol: Protocol,
    pub client: ClientRecord,
}

impl AccountCopy {
    pub fn key(&self) -> Result<&str, WardenError> {
        self.client
            .key(&self.protocol)
            .ok_or_else(|| WardenError::MissingClientKey(self.client.email.clone()))
    }
}

/// All records sharing one owning-user id. `copies[0]` is the canonical copy.
#[derive(Debug, Clone)]
pub struct Account {
    pub tg_id: i64,
    pub username: String,
    pub copies: Vec<AccountCopy>,
}

impl Account {
    pub fn canonical(&self) -> &ClientRecord {
        &self.copies[0].client
    }

    pub fn is_present_in(&self, inbound_id: i64) -> bool {
        self.copies.iter().any(|c| c.inbound_id == inbound_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Reference inbound first, the rest in panel order.
    pub inbounds: Vec<ParsedInbound>,
    /// Inbounds whose settings could not be parsed this round.
    pub malformed: Vec<i64>,
}

impl Inventory {
    pub async fn load(gateway: &dyn PanelGateway, reference_inbound_id: Option<i64>) -> Result<Self, GatewayError> {
        let inbounds = panel::with_reauth(gateway, || gateway.list_inbounds()).await?;
        Ok(Self::from_inbounds(inbounds, reference_inbound_id))
    }

    pub fn from_inbounds(mut inbounds: Vec<Inbound>, reference_inbound_id: Option<i64>) -> Self {
        if let Some(reference) = reference_inbound_id {
            if let Some(pos) = inbounds.iter().position(|i| i.id == reference) {
                let inbound = inbounds.remove(pos);
                inbounds.insert(0, inbound);
            } else {
                warn!("Reference inbound {} not found on panel", reference);
            }
        }

        let mut inventory = Self::default();
        for inbound in inbounds {
            if !inbound.protocol.carries_clients() {
                debug!("Skipping inbound {} ({}): no client list", inbound.id, inbound.protocol);
                continue;
            }
            match inbound.parse_settings() {
                Ok(settings) => {
                    let suffix = inbound_suffix(&inbound.remark, inbound.id);
                    inventory.inbounds.push(ParsedInbound {
                        inbound,
                        settings,
                        suffix,
                    });
                }
                Err(e) => {
                    warn!("Inbound {} has unreadable settings, treating as empty: {}", inbound.id, e);
                    inventory.malformed.push(inbound.id);
                }
            }
        }
        inventory
    }

    /// The inbound new accounts are created in.
    pub fn reference(&self) -> Option<&ParsedInbound> {
        self.inbounds.first()
    }

    /// Accounts keyed by owning-user id. Unowned records (`tgId == 0`) are left out.
    pub fn accounts(&self) -> BTreeMap<i64, Account> {
        let mut accounts: BTreeMap<i64, Account> = BTreeMap::new();
        for parsed in &self.inbounds {
            for client in &parsed.settings.clients {
                if client.tg_id == 0 {
                    continue;
                }
                let copy = AccountCopy {
                    inbound_id: parsed.inbound.id,
                    protocol: parsed.inbound.protocol.clone(),
                    client: client.clone(),
                };
                accounts
                    .entry(client.tg_id)
                    .or_insert_with(|| Account {
                        tg_id: client.tg_id,
                        username: client.username().to_string(),
                        copies: Vec::new(),
                    })
                    .copies
                    .push(copy);
            }
        }
        accounts
    }

    pub fn account(&self, tg_id: i64) -> Option<Account> {
        self.accounts().remove(&tg_id)
    }

    pub fn emails(&self) -> HashSet<String> {
        self.inbounds
            .iter()
            .flat_map(|p| p.settings.clients.iter().map(|c| c.email.to_ascii_lowercase()))
            .collect()
    }

    /// Case-insensitive match against every canonical username on the panel.
    pub fn username_taken(&self, username: &str) -> bool {
        self.inbounds
            .iter()
            .flat_map(|p| p.settings.clients.iter())
            .any(|c| c.username().eq_ignore_ascii_case(username))
    }
}
