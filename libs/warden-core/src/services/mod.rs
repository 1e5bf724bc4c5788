pub mod account_service;
pub mod approval_service;
pub mod forecast_service;
pub mod identity_sync;
pub mod inventory;
pub mod report;
pub mod scheduler;
