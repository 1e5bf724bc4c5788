use async_trait::async_trait;
use std::fmt;
use tracing::warn;
use warden_shared::{ExtensionRequest, RegistrationRequest};

use crate::services::forecast_service::TrafficAlert;

/// Who performed an approval action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Operator(i64),
    /// Trial auto-approval.
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Operator(id) => write!(f, "operator {id}"),
            Actor::System => f.write_str("auto-approval"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Registration,
    Extension,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Registration => f.write_str("registration"),
            RequestKind::Extension => f.write_str("extension"),
        }
    }
}

/// Typed outbound messages; rendering (text, keyboards, QR images) belongs to the messaging layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// To operators: a request waits for approve/reject. The request id is `user_id`.
    RegistrationRequested { request: RegistrationRequest },
    ExtensionRequested {
        request: ExtensionRequest,
        username: String,
        current_expiry: i64,
    },
    /// To the user: the subscription link and the payload to encode as a QR image.
    SubscriptionReady {
        username: String,
        link: String,
        qr_payload: String,
        expiry_time: i64,
    },
    ExtensionApplied { username: String, expiry_time: i64 },
    RequestRejected { kind: RequestKind },
    /// To the acting operator.
    RequestApproved {
        kind: RequestKind,
        user_id: i64,
        username: String,
        by: Actor,
    },
    RequestDismissed { kind: RequestKind, user_id: i64 },
    /// Raw error from a failed approval; the request stays pending.
    ApprovalFailed {
        kind: RequestKind,
        user_id: i64,
        error: String,
    },
    TrafficAlert(TrafficAlert),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user_id: i64, notice: Notice) -> anyhow::Result<()>;

    async fn notify_operator(&self, operator_id: i64, notice: Notice) -> anyhow::Result<()>;

    async fn notify_operators(&self, notice: Notice) -> anyhow::Result<()>;
}

/// Delivery failures are logged, never propagated into the workflow result.
pub async fn deliver_to_user(notifier: &dyn Notifier, user_id: i64, notice: Notice) {
    if let Err(e) = notifier.notify_user(user_id, notice).await {
        warn!("Failed to notify user {}: {}", user_id, e);
    }
}

/// Operator-initiated actions answer the operator; system actions go to every operator.
pub async fn deliver_to_actor(notifier: &dyn Notifier, actor: Actor, notice: Notice) {
    let result = match actor {
        Actor::Operator(id) => notifier.notify_operator(id, notice).await,
        Actor::System => notifier.notify_operators(notice).await,
    };
    if let Err(e) = result {
        warn!("Failed to notify {}: {}", actor, e);
    }
}

pub async fn deliver_to_operators(notifier: &dyn Notifier, notice: Notice) {
    if let Err(e) = notifier.notify_operators(notice).await {
        warn!("Failed to notify operators: {}", e);
    }
}
