use async_trait::async_trait;
use std::future::Future;
use tracing::warn;
use warden_shared::{ClientRecord, ClientTraffic, Inbound};

use crate::error::GatewayError;

/// Operations the bot needs from the VPN panel's HTTP API.
#[async_trait]
pub trait PanelGateway: Send + Sync {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, GatewayError>;

    async fn add_client(&self, inbound_id: i64, client: &ClientRecord) -> Result<(), GatewayError>;

    /// `client_key` is the identifier from [`ClientRecord::key`] before the update.
    async fn update_client(
        &self,
        inbound_id: i64,
        client_key: &str,
        client: &ClientRecord,
    ) -> Result<(), GatewayError>;

    async fn delete_client(&self, inbound_id: i64, client_key: &str) -> Result<(), GatewayError>;

    async fn client_traffic(&self, email: &str) -> Result<Option<ClientTraffic>, GatewayError>;

    async fn renew_session(&self) -> Result<(), GatewayError>;
}

/// Runs `op`, and on a transient failure renews the panel session and runs it once more.
pub async fn with_reauth<T, F, Fut>(gateway: &dyn PanelGateway, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!("Panel call failed ({}), renewing session and retrying once", e);
            gateway.renew_session().await?;
            op().await
        }
        other => other,
    }
}
