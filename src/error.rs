//! Crate-level error handling
//!
//! `AppError` covers everything outside the protocol itself: configuration
//! loading, file I/O and serialization. Protocol failures keep their own
//! taxonomy in [`crate::mcp::errors`] and are wrapped here when they cross into
//! application code.

use thiserror::Error;

use crate::mcp::errors::MCPError;

/// Application result type alias
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Main application error enum
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Layered configuration errors (files and environment)
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// TOML parse errors
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML encoding errors
    #[error("TOML encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// MCP protocol errors
    #[error("MCP protocol error: {0}")]
    Mcp(#[from] MCPError),

    /// Invalid settings
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// Generic application errors
    #[error("Application error: {message}")]
    Application { message: String },
}

impl AppError {
    /// Create a new invalid-configuration error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a new Application error
    pub fn application<S: Into<String>>(message: S) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Mcp(e) => !e.is_fatal_transport(),
            AppError::Application { .. } => true,
            AppError::Io(_)
            | AppError::Config(_)
            | AppError::TomlDe(_)
            | AppError::TomlSer(_)
            | AppError::Serde(_)
            | AppError::Invalid { .. } => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::Io(_) => ErrorSeverity::High,
            AppError::Config(_) | AppError::TomlDe(_) | AppError::Invalid { .. } => {
                ErrorSeverity::High
            }
            AppError::TomlSer(_) | AppError::Serde(_) => ErrorSeverity::Medium,
            AppError::Mcp(e) => match e.severity() {
                crate::mcp::errors::ErrorSeverity::Low => ErrorSeverity::Low,
                crate::mcp::errors::ErrorSeverity::Medium => ErrorSeverity::Medium,
                crate::mcp::errors::ErrorSeverity::High => ErrorSeverity::Critical,
            },
            AppError::Application { .. } => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Convert severity to string for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }
}
