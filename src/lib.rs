pub mod aggregator;
pub mod app;
pub mod auth;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod provider;
pub mod relay;
pub mod rotation;
pub mod selector;
pub mod thinking;
pub mod usage;
pub mod validation;
