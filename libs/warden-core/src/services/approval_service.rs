use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use warden_shared::{
    ConversationState, ExtensionRequest, ExtensionStatus, RegistrationRequest, RegistrationStatus, User,
};

use crate::config::WardenConfig;
use crate::credentials::new_sub_id;
use crate::error::{Result, WardenError};
use crate::notifier::{self, Actor, Notice, Notifier, RequestKind};
use crate::panel::{self, PanelGateway};
use crate::services::account_service::validate_username;
use crate::services::inventory::{Account, AccountAttributes, Inventory};
use crate::services::report::{BulkReport, ItemOutcome};
use crate::store::StateStore;

const DAY_MS: i64 = 86_400_000;

/// New expiry for an extension of `days`.
///
/// `0` is unlimited and stays so. A negative expiry counts from first use on the
/// panel, so the extension makes it more negative. Otherwise time is stacked on
/// whatever is left, or restarted from `now_ms` when already expired.
pub fn extended_expiry(current_ms: i64, now_ms: i64, days: u32) -> i64 {
    let span = i64::from(days) * DAY_MS;
    match current_ms {
        0 => 0,
        c if c < 0 => c - span,
        c => c.max(now_ms) + span,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalReceipt {
    pub user_id: i64,
    pub username: String,
    pub sub_id: String,
    pub link: String,
    pub expiry_time: i64,
    pub inbound_id: i64,
}

#[derive(Debug)]
pub struct ExtensionReport {
    pub user_id: i64,
    pub username: String,
    pub expiry_time: i64,
    pub updates: BulkReport,
}

/// A trial approval running off the caller's task. It notifies on its own;
/// holding the handle is only needed to observe the result.
#[derive(Debug)]
pub struct ApprovalJob {
    pub user_id: i64,
    handle: JoinHandle<Result<ApprovalReceipt>>,
}

impl ApprovalJob {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<ApprovalReceipt> {
        self.handle.await.map_err(|e| WardenError::Job(e.to_string()))?
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Operators have been asked to approve.
    AwaitingApproval(RegistrationRequest),
    AutoApproving(ApprovalJob),
}

#[derive(Clone)]
pub struct ApprovalService {
    gateway: Arc<dyn PanelGateway>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    config: Arc<WardenConfig>,
}

impl ApprovalService {
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
        }
    }

    async fn inventory(&self) -> Result<Inventory> {
        Ok(Inventory::load(self.gateway.as_ref(), self.config.reference_inbound_id).await?)
    }

    fn authorize(&self, operator_id: i64) -> Result<()> {
        if self.config.is_operator(operator_id) {
            Ok(())
        } else {
            warn!("Rejected approval action from non-operator {}", operator_id);
            Err(WardenError::Unauthorized(operator_id))
        }
    }

    pub async fn waiting_state(&self, id: i64) -> Result<Option<ConversationState>> {
        Ok(self.store.get_conversation(id).await?)
    }

    pub async fn pending_registrations(&self) -> Result<Vec<RegistrationRequest>> {
        Ok(self.store.pending_registrations().await?)
    }

    // Registration

    pub async fn start_registration(&self, user: &User) -> Result<RegistrationRequest> {
        if self.inventory().await?.account(user.id).is_some() {
            return Err(WardenError::AlreadyRegistered(user.id));
        }
        if let Some(existing) = self.store.get_registration(user.id).await? {
            if existing.status == RegistrationStatus::Pending {
                return Err(WardenError::AlreadyPending(user.id));
            }
        }

        let request = RegistrationRequest::new(user, Utc::now());
        self.store.put_registration(&request).await?;
        self.store
            .set_conversation(user.id, ConversationState::AwaitingUsername)
            .await?;
        info!("User {} started registration", user.id);
        Ok(request)
    }

    pub async fn submit_username(&self, user_id: i64, text: &str) -> Result<RegistrationRequest> {
        let mut request = self.registration_in(user_id, RegistrationStatus::InputUsername).await?;
        let username = validate_username(text)?;
        let taken = self.inventory().await?.username_taken(&username);
        if taken || self.username_reserved(user_id, &username).await? {
            return Err(WardenError::UsernameTaken(username));
        }

        request.username = Some(username);
        request.status = RegistrationStatus::InputDuration;
        self.store.put_registration(&request).await?;
        self.store.clear_conversation(user_id).await?;
        Ok(request)
    }

    pub async fn submit_duration(&self, user_id: i64, days: u32) -> Result<SubmitOutcome> {
        let mut request = self.registration_in(user_id, RegistrationStatus::InputDuration).await?;
        if !self.config.allows_duration(days) {
            return Err(WardenError::InvalidInput(format!("{days} days is not an offered duration")));
        }

        // Another request may have claimed the name while this one sat at the duration step.
        if let Some(username) = request.username.clone() {
            if self.username_reserved(user_id, &username).await? {
                request.username = None;
                request.status = RegistrationStatus::InputUsername;
                self.store.put_registration(&request).await?;
                self.store
                    .set_conversation(user_id, ConversationState::AwaitingUsername)
                    .await?;
                return Err(WardenError::UsernameTaken(username));
            }
        }

        request.duration_days = Some(days);
        request.status = RegistrationStatus::Pending;
        self.store.put_registration(&request).await?;

        if self.config.trial_auto_approve && self.config.trial_days > 0 && days == self.config.trial_days {
            info!("Auto-approving {}-day trial for user {}", days, user_id);
            let service = self.clone();
            let handle = tokio::spawn(async move { service.execute_registration(user_id, Actor::System).await });
            return Ok(SubmitOutcome::AutoApproving(ApprovalJob { user_id, handle }));
        }

        notifier::deliver_to_operators(
            self.notifier.as_ref(),
            Notice::RegistrationRequested {
                request: request.clone(),
            },
        )
        .await;
        info!("Registration of user {} is waiting for approval", user_id);
        Ok(SubmitOutcome::AwaitingApproval(request))
    }

    pub async fn approve_registration(&self, request_id: i64, operator_id: i64) -> Result<ApprovalReceipt> {
        self.authorize(operator_id)?;
        self.execute_registration(request_id, Actor::Operator(operator_id)).await
    }

    /// On failure the request stays pending so the approval can simply be repeated.
    async fn execute_registration(&self, user_id: i64, actor: Actor) -> Result<ApprovalReceipt> {
        let request = self.registration_in(user_id, RegistrationStatus::Pending).await?;
        let receipt = match self.create_account(&request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Approval of user {} by {} failed: {}", user_id, actor, e);
                notifier::deliver_to_actor(
                    self.notifier.as_ref(),
                    actor,
                    Notice::ApprovalFailed {
                        kind: RequestKind::Registration,
                        user_id,
                        error: e.to_string(),
                    },
                )
                .await;
                return Err(e);
            }
        };

        self.store.delete_registration(user_id).await?;
        self.store.clear_conversation(user_id).await?;

        notifier::deliver_to_user(
            self.notifier.as_ref(),
            user_id,
            Notice::SubscriptionReady {
                username: receipt.username.clone(),
                link: receipt.link.clone(),
                qr_payload: receipt.link.clone(),
                expiry_time: receipt.expiry_time,
            },
        )
        .await;
        notifier::deliver_to_actor(
            self.notifier.as_ref(),
            actor,
            Notice::RequestApproved {
                kind: RequestKind::Registration,
                user_id,
                username: receipt.username.clone(),
                by: actor,
            },
        )
        .await;
        info!("Registered {} for user {} ({})", receipt.username, user_id, actor);
        Ok(receipt)
    }

    async fn create_account(&self, request: &RegistrationRequest) -> Result<ApprovalReceipt> {
        let (Some(username), Some(days)) = (request.username.clone(), request.duration_days) else {
            return Err(WardenError::InvalidState {
                user_id: request.user_id,
                actual: "incomplete".to_string(),
                expected: "username and duration",
            });
        };

        let inventory = self.inventory().await?;
        if let Some(account) = inventory.account(request.user_id) {
            // A retried approval whose create went through on the previous attempt.
            if account.username.eq_ignore_ascii_case(&username) {
                return Ok(self.receipt_for(&account));
            }
            return Err(WardenError::AlreadyRegistered(request.user_id));
        }
        if inventory.username_taken(&username) {
            return Err(WardenError::UsernameTaken(username));
        }
        let reference = inventory.reference().ok_or(WardenError::NoReferenceInbound)?;

        let attrs = AccountAttributes {
            tg_id: request.user_id,
            sub_id: new_sub_id(),
            enable: true,
            expiry_time: Utc::now().timestamp_millis() + i64::from(days) * DAY_MS,
            total_bytes: self.config.default_traffic_cap_bytes,
            limit_ip: self.config.default_device_limit,
        };
        let record = reference.new_client(username.clone(), &attrs);
        let inbound_id = reference.inbound.id;

        let gateway = self.gateway.as_ref();
        panel::with_reauth(gateway, || gateway.add_client(inbound_id, &record)).await?;

        Ok(ApprovalReceipt {
            user_id: request.user_id,
            username,
            link: self.config.subscription_link(&attrs.sub_id),
            sub_id: attrs.sub_id,
            expiry_time: attrs.expiry_time,
            inbound_id,
        })
    }

    fn receipt_for(&self, account: &Account) -> ApprovalReceipt {
        let canonical = account.canonical();
        ApprovalReceipt {
            user_id: account.tg_id,
            username: account.username.clone(),
            sub_id: canonical.sub_id.clone(),
            link: self.config.subscription_link(&canonical.sub_id),
            expiry_time: canonical.expiry_time,
            inbound_id: account.copies[0].inbound_id,
        }
    }

    pub async fn reject_registration(&self, request_id: i64, operator_id: i64) -> Result<()> {
        self.authorize(operator_id)?;
        if self.store.get_registration(request_id).await?.is_none() {
            return Err(WardenError::NotFound(format!("registration request {request_id}")));
        }
        self.store.delete_registration(request_id).await?;
        self.store.clear_conversation(request_id).await?;
        self.announce_rejection(RequestKind::Registration, request_id, operator_id).await;
        Ok(())
    }

    /// True when another user's pending registration asks for `username`.
    async fn username_reserved(&self, user_id: i64, username: &str) -> Result<bool> {
        let pending = self.store.pending_registrations().await?;
        Ok(pending.iter().any(|r| {
            r.user_id != user_id
                && r.username
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(username))
        }))
    }

    async fn registration_in(&self, user_id: i64, expected: RegistrationStatus) -> Result<RegistrationRequest> {
        let request = self
            .store
            .get_registration(user_id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("registration request {user_id}")))?;
        if request.status != expected {
            return Err(WardenError::InvalidState {
                user_id,
                actual: request.status.to_string(),
                expected: status_name(expected),
            });
        }
        Ok(request)
    }

    // Extension

    pub async fn start_extension(&self, user: &User) -> Result<ExtensionRequest> {
        if self.inventory().await?.account(user.id).is_none() {
            return Err(WardenError::NotFound(format!("account for user {}", user.id)));
        }
        if let Some(existing) = self.store.get_extension(user.id).await? {
            if existing.status == ExtensionStatus::Pending {
                return Err(WardenError::AlreadyPending(user.id));
            }
        }

        let request = ExtensionRequest::new(user, Utc::now());
        self.store.put_extension(&request).await?;
        info!("User {} started an extension", user.id);
        Ok(request)
    }

    pub async fn submit_extension_duration(&self, user_id: i64, days: u32) -> Result<ExtensionRequest> {
        let mut request = self.extension_in(user_id, ExtensionStatus::InputDuration).await?;
        if !self.config.allows_duration(days) {
            return Err(WardenError::InvalidInput(format!("{days} days is not an offered duration")));
        }
        let account = self
            .inventory()
            .await?
            .account(user_id)
            .ok_or_else(|| WardenError::NotFound(format!("account for user {user_id}")))?;

        request.duration_days = Some(days);
        request.status = ExtensionStatus::Pending;
        self.store.put_extension(&request).await?;

        notifier::deliver_to_operators(
            self.notifier.as_ref(),
            Notice::ExtensionRequested {
                request: request.clone(),
                username: account.username.clone(),
                current_expiry: account.canonical().expiry_time,
            },
        )
        .await;
        info!("Extension of {} by {} days is waiting for approval", account.username, days);
        Ok(request)
    }

    /// Pushes the new expiry to every copy. Credentials and `subId` are left as they are.
    pub async fn approve_extension(&self, request_id: i64, operator_id: i64) -> Result<ExtensionReport> {
        self.authorize(operator_id)?;
        let actor = Actor::Operator(operator_id);
        match self.apply_extension(request_id).await {
            Ok(report) => {
                self.store.delete_extension(request_id).await?;
                notifier::deliver_to_user(
                    self.notifier.as_ref(),
                    request_id,
                    Notice::ExtensionApplied {
                        username: report.username.clone(),
                        expiry_time: report.expiry_time,
                    },
                )
                .await;
                notifier::deliver_to_actor(
                    self.notifier.as_ref(),
                    actor,
                    Notice::RequestApproved {
                        kind: RequestKind::Extension,
                        user_id: request_id,
                        username: report.username.clone(),
                        by: actor,
                    },
                )
                .await;
                info!(
                    "Extended {} to {} across {} inbounds",
                    report.username,
                    report.expiry_time,
                    report.updates.outcomes.len()
                );
                Ok(report)
            }
            Err(e) => {
                warn!("Extension for user {} failed: {}", request_id, e);
                notifier::deliver_to_actor(
                    self.notifier.as_ref(),
                    actor,
                    Notice::ApprovalFailed {
                        kind: RequestKind::Extension,
                        user_id: request_id,
                        error: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn apply_extension(&self, user_id: i64) -> Result<ExtensionReport> {
        let mut request = self.extension_in(user_id, ExtensionStatus::Pending).await?;
        let days = request.duration_days.ok_or_else(|| WardenError::InvalidState {
            user_id,
            actual: "no duration".to_string(),
            expected: "a chosen duration",
        })?;
        let account = self
            .inventory()
            .await?
            .account(user_id)
            .ok_or_else(|| WardenError::NotFound(format!("account for user {user_id}")))?;

        let target = match request.target_expiry {
            Some(target) => target,
            None => {
                let target = extended_expiry(account.canonical().expiry_time, Utc::now().timestamp_millis(), days);
                request.target_expiry = Some(target);
                self.store.put_extension(&request).await?;
                target
            }
        };

        let gateway = self.gateway.as_ref();
        let mut updates = BulkReport::default();
        for copy in &account.copies {
            let mut updated = copy.client.clone();
            updated.expiry_time = target;
            let result = match copy.key() {
                Ok(key) => panel::with_reauth(gateway, || gateway.update_client(copy.inbound_id, key, &updated))
                    .await
                    .map_err(WardenError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Failed to extend {} in inbound {}: {}", copy.client.email, copy.inbound_id, e);
            }
            updates.push(ItemOutcome {
                inbound_id: copy.inbound_id,
                tg_id: user_id,
                email: copy.client.email.clone(),
                result,
            });
        }

        Ok(ExtensionReport {
            user_id,
            username: account.username,
            expiry_time: target,
            updates: updates.into_result()?,
        })
    }

    pub async fn reject_extension(&self, request_id: i64, operator_id: i64) -> Result<()> {
        self.authorize(operator_id)?;
        if self.store.get_extension(request_id).await?.is_none() {
            return Err(WardenError::NotFound(format!("extension request {request_id}")));
        }
        self.store.delete_extension(request_id).await?;
        self.announce_rejection(RequestKind::Extension, request_id, operator_id).await;
        Ok(())
    }

    async fn extension_in(&self, user_id: i64, expected: ExtensionStatus) -> Result<ExtensionRequest> {
        let request = self
            .store
            .get_extension(user_id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("extension request {user_id}")))?;
        if request.status != expected {
            return Err(WardenError::InvalidState {
                user_id,
                actual: request.status.to_string(),
                expected: extension_status_name(expected),
            });
        }
        Ok(request)
    }

    async fn announce_rejection(&self, kind: RequestKind, user_id: i64, operator_id: i64) {
        notifier::deliver_to_user(self.notifier.as_ref(), user_id, Notice::RequestRejected { kind }).await;
        notifier::deliver_to_actor(
            self.notifier.as_ref(),
            Actor::Operator(operator_id),
            Notice::RequestDismissed { kind, user_id },
        )
        .await;
        info!("Operator {} rejected {} request of user {}", operator_id, kind, user_id);
    }

    /// Drops whatever the user has in progress, including the waiting state.
    pub async fn cancel(&self, user_id: i64) -> Result<()> {
        self.store.delete_registration(user_id).await?;
        self.store.delete_extension(user_id).await?;
        self.store.clear_conversation(user_id).await?;
        info!("User {} cancelled their requests", user_id);
        Ok(())
    }
}

fn status_name(status: RegistrationStatus) -> &'static str {
    match status {
        RegistrationStatus::InputUsername => "input_username",
        RegistrationStatus::InputDuration => "input_duration",
        RegistrationStatus::Pending => "pending",
        RegistrationStatus::Approved => "approved",
        RegistrationStatus::Rejected => "rejected",
    }
}

fn extension_status_name(status: ExtensionStatus) -> &'static str {
    match status {
        ExtensionStatus::InputDuration => "input_duration",
        ExtensionStatus::Pending => "pending",
        ExtensionStatus::Approved => "approved",
        ExtensionStatus::Rejected => "rejected",
    }
}
