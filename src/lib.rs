//! MCP Core - Model Context Protocol building blocks
//!
//! This library provides the protocol core shared by MCP clients and servers:
//! JSON-RPC 2.0 messaging with request correlation, capability negotiation,
//! tool/resource/prompt registries, an interceptor pipeline and progress
//! tracking for long-running calls.
//!
//! # Architecture
//!
//! - **Protocol Layer**: envelope, error taxonomy, transport contract
//! - **Session Layer**: correlator, handshake, client and server sessions
//! - **Extension Layer**: interceptors, registries, progress tracking
//! - **Infrastructure Layer**: configuration, crate errors, logging bootstrap

pub mod config;
pub mod error;
pub mod mcp;

pub use config::Config;
pub use error::{AppError, AppResult};

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default `EnvFilter` directive when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "mcp_core=info";

/// Initialize the logging system with structured logging
///
/// Log levels are taken from `RUST_LOG`, falling back to `mcp_core=info`.
pub fn initialize_logging() -> Result<()> {
    initialize_logging_with(DEFAULT_LOG_FILTER)
}

/// Initialize logging with a fallback filter directive, e.g. from
/// [`config::LoggingConfig::level`]
pub fn initialize_logging_with(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
