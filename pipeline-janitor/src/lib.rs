pub mod config;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod provisioner;
