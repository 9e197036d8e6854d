pub mod config;
pub mod error;
pub mod expiring;
pub mod http;
pub mod login;
pub mod metrics;
pub mod ratings;
pub mod views;
