use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use warden_shared::ClientRecord;
use warden_shared::codec::suffixed_email;

use crate::error::GatewayError;
use crate::panel::{self, PanelGateway};
use crate::services::inventory::{AccountAttributes, Inventory};
use crate::services::report::{BulkReport, ItemOutcome};

/// A copy the sync cycle is about to create.
#[derive(Debug, Clone)]
pub struct PlannedClient {
    pub inbound_id: i64,
    pub tg_id: i64,
    pub record: ClientRecord,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub inbounds: usize,
    pub malformed: Vec<i64>,
    pub accounts: usize,
    pub creates: BulkReport,
}

/// Makes every owning-user id present in every client-bearing inbound.
pub struct IdentitySyncEngine {
    gateway: Arc<dyn PanelGateway>,
    reference_inbound_id: Option<i64>,
}

impl IdentitySyncEngine {
    pub fn new(gateway: Arc<dyn PanelGateway>, reference_inbound_id: Option<i64>) -> Self {
        Self {
            gateway,
            reference_inbound_id,
        }
    }

    /// One reconciliation pass. Only the inbound listing can fail the whole cycle;
    /// individual create failures are recorded and left for the next cycle.
    pub async fn run_cycle(&self) -> Result<SyncReport, GatewayError> {
        let gateway = self.gateway.as_ref();
        let inventory = Inventory::load(gateway, self.reference_inbound_id).await?;
        let planned = plan_missing_copies(&inventory);

        let mut creates = BulkReport::default();
        for item in planned {
            let result = panel::with_reauth(gateway, || gateway.add_client(item.inbound_id, &item.record)).await;
            match &result {
                Ok(()) => info!(
                    "Replicated user {} into inbound {} as {}",
                    item.tg_id, item.inbound_id, item.record.email
                ),
                Err(e) => warn!(
                    "Failed to replicate user {} into inbound {}: {}",
                    item.tg_id, item.inbound_id, e
                ),
            }
            creates.push(ItemOutcome {
                inbound_id: item.inbound_id,
                tg_id: item.tg_id,
                email: item.record.email,
                result: result.map_err(Into::into),
            });
        }

        let report = SyncReport {
            inbounds: inventory.inbounds.len(),
            malformed: inventory.malformed.clone(),
            accounts: inventory.accounts().len(),
            creates,
        };
        info!(
            "Identity sync complete: {} accounts across {} inbounds, {} created, {} failed",
            report.accounts,
            report.inbounds,
            report.creates.succeeded(),
            report.creates.failed()
        );
        Ok(report)
    }
}

/// Every (account, inbound) pair without a record, with the record to create.
///
/// Inbounds whose settings failed to parse are absent from the inventory and are
/// never targeted, since their existing clients are unknown.
pub fn plan_missing_copies(inventory: &Inventory) -> Vec<PlannedClient> {
    let accounts = inventory.accounts();
    let mut taken = inventory.emails();
    let mut planned = Vec::new();

    for (index, target) in inventory.inbounds.iter().enumerate() {
        let is_reference = index == 0;
        for account in accounts.values() {
            if account.is_present_in(target.inbound.id) {
                continue;
            }
            let email = unique_email(&account.username, &target.suffix, is_reference, &mut taken);
            let attrs = AccountAttributes::of(account.canonical());
            planned.push(PlannedClient {
                inbound_id: target.inbound.id,
                tg_id: account.tg_id,
                record: target.new_client(email, &attrs),
            });
        }
    }
    planned
}

/// The panel enforces email uniqueness panel-wide; collisions bump the suffix, never the username.
fn unique_email(username: &str, suffix: &str, is_reference: bool, taken: &mut HashSet<String>) -> String {
    let mut candidates = Vec::with_capacity(2);
    if is_reference {
        candidates.push(username.to_string());
    }
    candidates.push(suffixed_email(username, suffix));

    let email = candidates
        .into_iter()
        .find(|c| !taken.contains(&c.to_ascii_lowercase()))
        .unwrap_or_else(|| {
            (2..)
                .map(|n| suffixed_email(username, &format!("{suffix}-{n}")))
                .find(|c| !taken.contains(&c.to_ascii_lowercase()))
                .unwrap_or_default()
        });
    taken.insert(email.to_ascii_lowercase());
    email
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_shared::{Inbound, Protocol};

    fn inbound(id: i64, remark: &str, protocol: &str, settings: serde_json::Value) -> Inbound {
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

    fn inventory() -> Inventory {
        Inventory::from_inbounds(
            vec![
                inbound(
                    1,
                    "Main",
                    "vless",
                    json!({"clients": [{"email": "alice", "id": "a-uuid", "flow": "xtls-rprx-vision",
                        "tgId": 7, "subId": "sub7", "expiryTime": 1000, "totalGB": 50, "limitIp": 2}]}),
                ),
                inbound(
                    2,
                    "Shadow DE",
                    "shadowsocks",
                    json!({"method": "2022-blake3-aes-128-gcm", "password": "server",
                        "clients": [{"email": "bob@shadow-de", "password": "x", "tgId": 8, "subId": "sub8"}]}),
                ),
            ],
            Some(1),
        )
    }

    #[test]
    fn plans_one_create_per_missing_pair() {
        let planned = plan_missing_copies(&inventory());
        assert_eq!(planned.len(), 2);

        let alice = planned.iter().find(|p| p.tg_id == 7).unwrap();
        assert_eq!(alice.inbound_id, 2);
        assert_eq!(alice.record.email, "alice@shadow-de");
        assert_eq!(alice.record.sub_id, "sub7");
        assert_eq!(alice.record.expiry_time, 1000);
        assert_eq!(alice.record.total_bytes, 50);
        assert_eq!(alice.record.limit_ip, 2);
        assert_eq!(alice.record.method.as_deref(), Some("2022-blake3-aes-128-gcm"));
        assert!(alice.record.id.is_none());

        let bob = planned.iter().find(|p| p.tg_id == 8).unwrap();
        assert_eq!(bob.inbound_id, 1);
        assert_eq!(bob.record.email, "bob");
        assert_eq!(bob.record.flow.as_deref(), Some("xtls-rprx-vision"));
        assert_ne!(bob.record.id.as_deref(), Some("a-uuid"));
    }

    #[test]
    fn email_collisions_bump_the_suffix() {
        let mut taken: HashSet<String> = ["carol".to_string(), "carol@de".to_string()].into_iter().collect();
        assert_eq!(unique_email("carol", "de", true, &mut taken), "carol@de-2");
        assert_eq!(unique_email("carol", "de", false, &mut taken), "carol@de-3");
        assert!(taken.contains("carol@de-3"));
    }
}
