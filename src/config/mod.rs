//! Configuration management module
//!
//! Provides:
//! - TOML-based configuration files
//! - Environment variable overrides (`MCP_` prefix, `__` as the section separator)
//! - Validation and conversion into runtime client/server configs

use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info};

use crate::{
    error::{AppError, AppResult},
    mcp::{
        client::ClientConfig,
        interceptors::LoggingInterceptor,
        protocol::{
            Implementation, PromptsCapability, ProtocolVersion, ResourcesCapability,
            ServerCapabilities, ToolsCapability,
        },
        server::ServerConfig,
    },
};

/// Prefix for environment overrides, e.g. `MCP_CLIENT__REQUEST_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "MCP";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-side settings
    pub client: ClientSettings,
    /// Server-side settings
    pub server: ServerSettings,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./mcp-core.toml
    /// 2. <config dir>/mcp-core/config.toml
    /// 3. Default configuration
    pub async fn load() -> AppResult<Self> {
        info!("Loading configuration");

        if let Ok(config) = Self::load_from_file("./mcp-core.toml").await {
            info!("Loaded configuration from ./mcp-core.toml");
            return Ok(config);
        }

        if let Some(config_path) = Self::get_user_config_path() {
            if let Ok(config) = Self::load_from_file(&config_path).await {
                info!("Loaded configuration from {}", config_path.display());
                return Ok(config);
            }
        }

        info!("Using default configuration");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Layer `MCP_`-prefixed environment variables over an optional file
    pub fn load_with_env<P: AsRef<Path>>(path: Option<P>) -> AppResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            let path = path.as_ref();
            debug!("Layering environment over {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> AppResult<()> {
        self.client.validate()?;
        self.server.validate()?;
        debug!("Configuration validation passed");
        Ok(())
    }

    /// Runtime client config, with request logging when enabled
    pub fn client_config(&self) -> AppResult<ClientConfig> {
        let mut config = self.client.to_client_config()?;
        if self.logging.log_requests {
            config.interceptors = config.interceptors.with(self.logging.interceptor());
        }
        Ok(config)
    }

    /// Runtime server config, with request logging when enabled
    pub fn server_config(&self) -> ServerConfig {
        let mut config = self.server.to_server_config();
        if self.logging.log_requests {
            config.interceptors = config.interceptors.with(self.logging.interceptor());
        }
        config
    }

    /// Get user configuration directory path
    fn get_user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("mcp-core");
            path.push("config.toml");
            path
        })
    }
}

/// Client identity, timeouts and session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Client name sent at handshake
    pub name: String,
    /// Client version sent at handshake
    pub version: String,
    /// Requested protocol revision (`YYYY-MM-DD`)
    pub protocol_version: String,
    /// Per-request deadline in milliseconds
    pub request_timeout_ms: u64,
    /// Handshake deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// List catalogs right after the handshake
    pub auto_cache: bool,
    /// Bearer token sent as `_meta.authToken`
    pub auth_token: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: "mcp-core-client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: ProtocolVersion::CURRENT.to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            auto_cache: true,
            auth_token: None,
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(AppError::invalid("client name and version must not be empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(AppError::invalid("client.request_timeout_ms must be greater than 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(AppError::invalid("client.connect_timeout_ms must be greater than 0"));
        }
        self.protocol_version.parse::<ProtocolVersion>()?;
        Ok(())
    }

    pub fn to_client_config(&self) -> AppResult<ClientConfig> {
        let mut config = ClientConfig::new(Implementation::new(&self.name, &self.version))
            .with_protocol_version(self.protocol_version.parse()?)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_auto_cache(self.auto_cache);
        if let Some(token) = &self.auth_token {
            config = config.with_auth_token(token.clone());
        }
        Ok(config)
    }
}

/// Server identity and advertised capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Server name returned at handshake
    pub name: String,
    /// Server version returned at handshake
    pub version: String,
    /// Usage notes returned from `initialize`
    pub instructions: Option<String>,
    /// Deadline for server-initiated requests in milliseconds
    pub request_timeout_ms: u64,
    /// Advertise tools
    pub tools: bool,
    /// Advertise resources
    pub resources: bool,
    /// Allow resource subscriptions
    pub resource_subscribe: bool,
    /// Advertise prompts
    pub prompts: bool,
    /// Announce catalog changes with `list_changed` notifications
    pub list_changed: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "mcp-core-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            request_timeout_ms: 30_000,
            tools: true,
            resources: true,
            resource_subscribe: true,
            prompts: true,
            list_changed: true,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(AppError::invalid("server name and version must not be empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(AppError::invalid("server.request_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        let list_changed = self.list_changed;
        ServerCapabilities {
            tools: self.tools.then(|| ToolsCapability { list_changed }),
            resources: self.resources.then(|| ResourcesCapability {
                subscribe: self.resource_subscribe,
                list_changed,
            }),
            prompts: self.prompts.then(|| PromptsCapability { list_changed }),
            logging: None,
        }
    }

    pub fn to_server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(Implementation::new(&self.name, &self.version))
            .with_capabilities(self.capabilities())
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms));
        if let Some(instructions) = &self.instructions {
            config = config.with_instructions(instructions.clone());
        }
        config
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    /// Install a logging interceptor on clients and servers
    pub log_requests: bool,
    /// Include request params in request logs
    pub log_params: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "mcp_core=info".to_string(),
            log_requests: false,
            log_params: false,
        }
    }
}

impl LoggingConfig {
    fn interceptor(&self) -> LoggingInterceptor {
        if self.log_params {
            LoggingInterceptor::new().with_params()
        } else {
            LoggingInterceptor::new()
        }
    }
}
