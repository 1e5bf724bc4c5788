pub mod config;
pub mod credentials;
pub mod error;
pub mod notifier;
pub mod panel;
pub mod services;
pub mod store;
pub mod telemetry;

pub use config::WardenConfig;
pub use error::{GatewayError, Result, StoreError, WardenError};
pub use notifier::{Actor, Notice, Notifier};
pub use panel::PanelGateway;
pub use store::{MemoryStore, StateStore};
pub use warden_shared as shared;
