use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use warden_shared::codec::suffixed_email;
use warden_shared::{ClientRecord, ConversationState};

use crate::error::{Result, WardenError};
use crate::panel::{self, PanelGateway};
use crate::services::inventory::{Account, AccountCopy, Inventory};
use crate::services::report::{BulkReport, ItemOutcome};
use crate::store::StateStore;

const CALLBACK_CAPACITY: usize = 512;

/// Reference to one logical account, resolved from a short callback token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRef {
    pub tg_id: i64,
    pub username: String,
}

/// Bounded token table for callback payloads too small to carry client data.
/// The oldest entry is evicted once `capacity` is reached.
#[derive(Debug)]
pub struct CallbackTable<T> {
    capacity: usize,
    next: u64,
    entries: HashMap<String, T>,
    order: VecDeque<String>,
}

impl<T: Clone> CallbackTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> String {
        self.next += 1;
        let token = format!("c{:x}", self.next);
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(token.clone(), value);
        self.order.push_back(token.clone());
        token
    }

    pub fn get(&self, token: &str) -> Option<T> {
        self.entries.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Traffic of one account; the total is the sum over every inbound copy.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTraffic {
    pub tg_id: i64,
    pub username: String,
    pub per_inbound: Vec<(i64, i64)>,
    pub total: i64,
    /// Inbounds whose counters could not be read; `total` leaves them out.
    pub unavailable: Vec<i64>,
}

impl UserTraffic {
    pub fn is_partial(&self) -> bool {
        !self.unavailable.is_empty()
    }
}

/// Operator actions on a logical account, applied to every inbound copy at once.
pub struct AccountService {
    gateway: Arc<dyn PanelGateway>,
    store: Arc<dyn StateStore>,
    reference_inbound_id: Option<i64>,
    callbacks: Mutex<CallbackTable<ClientRef>>,
}

impl AccountService {
    pub fn new(gateway: Arc<dyn PanelGateway>, store: Arc<dyn StateStore>, reference_inbound_id: Option<i64>) -> Self {
        Self {
            gateway,
            store,
            reference_inbound_id,
            callbacks: Mutex::new(CallbackTable::new(CALLBACK_CAPACITY)),
        }
    }

    async fn inventory(&self) -> Result<Inventory> {
        Ok(Inventory::load(self.gateway.as_ref(), self.reference_inbound_id).await?)
    }

    pub async fn find_account(&self, tg_id: i64) -> Result<Option<Account>> {
        Ok(self.inventory().await?.account(tg_id))
    }

    async fn require_account(&self, tg_id: i64) -> Result<Account> {
        self.find_account(tg_id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("account for user {tg_id}")))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inventory().await?.accounts().into_values().collect())
    }

    /// Short token for an operator button that acts on `account`.
    pub fn client_handle(&self, account: &Account) -> String {
        let mut table = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(ClientRef {
            tg_id: account.tg_id,
            username: account.username.clone(),
        })
    }

    pub fn resolve_handle(&self, token: &str) -> Result<ClientRef> {
        let table = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        table
            .get(token)
            .ok_or_else(|| WardenError::NotFound(format!("callback {token}")))
    }

    pub async fn set_enabled(&self, tg_id: i64, enable: bool) -> Result<BulkReport> {
        let account = self.require_account(tg_id).await?;
        let report = self
            .update_copies(&account, |copy| {
                let mut updated = copy.client.clone();
                updated.enable = enable;
                updated
            })
            .await;
        info!(
            "Set enable={} for user {} on {}/{} inbounds",
            enable,
            tg_id,
            report.succeeded(),
            report.outcomes.len()
        );
        report.into_result()
    }

    /// Renames the canonical username on every copy, keeping each copy's suffix.
    pub async fn rename(&self, tg_id: i64, new_username: &str) -> Result<BulkReport> {
        let new_username = validate_username(new_username)?;
        let inventory = self.inventory().await?;
        let account = inventory
            .account(tg_id)
            .ok_or_else(|| WardenError::NotFound(format!("account for user {tg_id}")))?;
        if !account.username.eq_ignore_ascii_case(&new_username) && inventory.username_taken(&new_username) {
            return Err(WardenError::UsernameTaken(new_username));
        }

        let report = self
            .update_copies(&account, |copy| {
                let mut updated = copy.client.clone();
                updated.email = renamed_email(&copy.client.email, &new_username);
                updated
            })
            .await;
        info!("Renamed user {} from {} to {}", tg_id, account.username, new_username);
        report.into_result()
    }

    /// Removes every copy of the account. Only ever triggered by an operator.
    pub async fn delete_account(&self, tg_id: i64) -> Result<BulkReport> {
        let account = self.require_account(tg_id).await?;
        let gateway = self.gateway.as_ref();
        let mut report = BulkReport::default();

        for copy in &account.copies {
            let result = match copy.key() {
                Ok(key) => panel::with_reauth(gateway, || gateway.delete_client(copy.inbound_id, key))
                    .await
                    .map_err(WardenError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Failed to delete {} from inbound {}: {}", copy.client.email, copy.inbound_id, e);
            }
            report.push(ItemOutcome {
                inbound_id: copy.inbound_id,
                tg_id,
                email: copy.client.email.clone(),
                result,
            });
        }
        info!("Deleted user {} from {}/{} inbounds", tg_id, report.succeeded(), report.outcomes.len());
        report.into_result()
    }

    /// Sums the per-copy counters; copies on different inbounds carry distinct bytes.
    pub async fn user_traffic(&self, tg_id: i64) -> Result<UserTraffic> {
        let account = self.require_account(tg_id).await?;
        let gateway = self.gateway.as_ref();
        let mut per_inbound = Vec::with_capacity(account.copies.len());
        let mut unavailable = Vec::new();

        for copy in &account.copies {
            let email = copy.client.email.as_str();
            match panel::with_reauth(gateway, || gateway.client_traffic(email)).await {
                Ok(Some(traffic)) => per_inbound.push((copy.inbound_id, traffic.total())),
                Ok(None) => per_inbound.push((copy.inbound_id, 0)),
                Err(e) => {
                    warn!("Traffic lookup failed for {}: {}", email, e);
                    unavailable.push(copy.inbound_id);
                }
            }
        }

        let total = per_inbound.iter().map(|(_, bytes)| bytes).sum();
        Ok(UserTraffic {
            tg_id,
            username: account.username,
            per_inbound,
            total,
            unavailable,
        })
    }

    /// Puts the operator into the "type the new username" state for the account behind `token`.
    pub async fn begin_rename(&self, operator_id: i64, token: &str) -> Result<ClientRef> {
        let target = self.resolve_handle(token)?;
        self.store
            .set_conversation(operator_id, ConversationState::AwaitingRename { tg_id: target.tg_id })
            .await?;
        Ok(target)
    }

    pub async fn submit_rename(&self, operator_id: i64, text: &str) -> Result<BulkReport> {
        let tg_id = match self.store.get_conversation(operator_id).await? {
            Some(ConversationState::AwaitingRename { tg_id }) => tg_id,
            _ => return Err(WardenError::NotFound(format!("rename in progress for {operator_id}"))),
        };
        let report = self.rename(tg_id, text).await?;
        self.store.clear_conversation(operator_id).await?;
        Ok(report)
    }

    async fn update_copies<F>(&self, account: &Account, mut change: F) -> BulkReport
    where
        F: FnMut(&AccountCopy) -> ClientRecord,
    {
        let gateway = self.gateway.as_ref();
        let mut report = BulkReport::default();

        for copy in &account.copies {
            let updated = change(copy);
            let result = match copy.key() {
                Ok(key) => panel::with_reauth(gateway, || gateway.update_client(copy.inbound_id, key, &updated))
                    .await
                    .map_err(WardenError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Failed to update {} in inbound {}: {}", copy.client.email, copy.inbound_id, e);
            }
            report.push(ItemOutcome {
                inbound_id: copy.inbound_id,
                tg_id: account.tg_id,
                email: updated.email,
                result,
            });
        }
        report
    }
}

/// Usernames become panel emails, so they are restricted to a safe charset without `@`.
pub fn validate_username(raw: &str) -> Result<String> {
    let username = raw.trim();
    let valid_len = (3..=32).contains(&username.len());
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_len || !valid_chars {
        return Err(WardenError::InvalidInput(
            "username must be 3-32 characters of letters, digits, '_', '.' or '-'".to_string(),
        ));
    }
    Ok(username.to_string())
}

fn renamed_email(email: &str, new_username: &str) -> String {
    match email.split_once('@') {
        Some((_, suffix)) => suffixed_email(new_username, suffix),
        None => new_username.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_table_evicts_oldest() {
        let mut table = CallbackTable::new(2);
        let first = table.insert(1);
        let second = table.insert(2);
        let third = table.insert(3);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&first), None);
        assert_eq!(table.get(&second), Some(2));
        assert_eq!(table.get(&third), Some(3));
        assert!(third.len() < 64);
    }

    #[test]
    fn usernames_are_validated() {
        assert_eq!(validate_username("  alice_01 ").unwrap(), "alice_01");
        assert!(validate_username("al").is_err());
        assert!(validate_username("alice@de").is_err());
        assert!(validate_username("алиса").is_err());
    }

    #[test]
    fn rename_keeps_the_inbound_suffix() {
        assert_eq!(renamed_email("alice@de-2", "alicia"), "alicia@de-2");
        assert_eq!(renamed_email("alice", "alicia"), "alicia");
    }
}
