//! Multi-tenant integration credential broker
//!
//! Connects organizations to third-party providers and keeps their
//! credentials usable:
//!
//! - [`oauth`]: authorization-code flow with single-use state and a signed
//!   redirect binding
//! - [`broker`]: expiry-aware credential minting with single-flight refresh
//! - [`operations`]: dispatch of named provider operations under timeouts
//! - [`http::webhook`] and [`ingest`]: verified alert webhooks normalized into
//!   deduplicated vulnerabilities
//!
//! The provider catalog is an immutable [`registry::ProviderRegistry`] built at
//! startup and shared by `Arc`.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod model;
pub mod oauth;
pub mod operations;
pub mod providers;
pub mod registry;
pub mod storage;
pub mod telemetry;

pub use error::{BrokerError, Result};
