pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod store;
