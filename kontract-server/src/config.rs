//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via KONTRACT_CONFIG)
//! 3. Environment variables

use kontract_core::Perm;
use kontract_protocol::{CipherSuite, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Payload encryption configuration.
    pub crypto: CryptoConfig,
    /// Shared storage configuration.
    pub storage: StorageConfig,
    /// Gateway policy.
    pub gateway: GatewayConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("KONTRACT_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.crypto.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.gateway.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads secrets from external file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks cross-field constraints the types cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.crypto.validate()?;
        self.gateway.validate()?;
        if self.auth.required && self.auth.token_hashes.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth required but no token hashes configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("KONTRACT_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("KONTRACT_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("KONTRACT_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether a handshake token is required.
    pub required: bool,
    /// Valid token hashes (SHA-256 hex strings).
    pub token_hashes: Vec<String>,
    /// Optional file with one token hash per line.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(auth) = std::env::var("KONTRACT_AUTH_REQUIRED") {
            self.required = env_flag(&auth);
        }

        if let Ok(hash) = std::env::var("KONTRACT_AUTH_TOKEN_HASH") {
            if !hash.is_empty() {
                self.token_hashes.push(hash);
            }
        }

        if let Ok(path) = std::env::var("KONTRACT_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads token hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    self.token_hashes.push(line.to_string());
                }
            }
        }
        Ok(())
    }
}

/// Payload encryption configuration.
///
/// Without a master secret connections stay in plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Hex-encoded shared master secret.
    pub master_secret: Option<String>,
    /// Suites this server accepts.
    pub cipher_suites: Vec<CipherSuite>,
    /// Reject clients that offer no cipher suite.
    pub require_encryption: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_secret: None,
            cipher_suites: CipherSuite::ALL.to_vec(),
            require_encryption: false,
        }
    }
}

impl CryptoConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("KONTRACT_MASTER_SECRET") {
            if !secret.is_empty() {
                self.master_secret = Some(secret);
            }
        }

        if let Ok(suites) = std::env::var("KONTRACT_CIPHER_SUITES") {
            let parsed: Vec<CipherSuite> = suites
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.cipher_suites = parsed;
            }
        }

        if let Ok(require) = std::env::var("KONTRACT_REQUIRE_ENCRYPTION") {
            self.require_encryption = env_flag(&require);
        }
    }

    /// Decodes the master secret.
    pub fn master_secret_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        match &self.master_secret {
            Some(hex_secret) => {
                let bytes = hex::decode(hex_secret.trim()).map_err(|e| {
                    ConfigError::ValidationError(format!("master_secret is not hex: {}", e))
                })?;
                if bytes.len() < 16 {
                    return Err(ConfigError::ValidationError(format!(
                        "master_secret must be at least 16 bytes, got {}",
                        bytes.len()
                    )));
                }
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.master_secret_bytes()?;
        if self.cipher_suites.is_empty() {
            return Err(ConfigError::ValidationError(
                "cipher_suites must not be empty".to_string(),
            ));
        }
        if self.require_encryption && self.master_secret.is_none() {
            return Err(ConfigError::ValidationError(
                "require_encryption set but no master_secret".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store prefixes and routing.
    #[serde(flatten)]
    pub shared: kontract_storage::StorageConfig,
    /// How long committed sessions stay resumable, in seconds (0 = forever).
    pub session_ttl_secs: u64,
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ttl) = std::env::var("KONTRACT_SESSION_TTL") {
            if let Ok(secs) = ttl.parse() {
                self.session_ttl_secs = secs;
            }
        }

        if let Ok(prefixes) = std::env::var("KONTRACT_HOT_PREFIXES") {
            self.shared.hot_prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        match self.session_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Gateway policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Mask granted to routes that declare none.
    pub default_perm: u8,
    /// Per-call handler timeout in milliseconds (0 = none).
    pub call_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_perm: Perm::ALL.bits(),
            call_timeout_ms: 0,
        }
    }
}

impl GatewayConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(perm) = std::env::var("KONTRACT_DEFAULT_PERM") {
            if let Ok(bits) = perm.parse() {
                self.default_perm = bits;
            }
        }

        if let Ok(timeout) = std::env::var("KONTRACT_CALL_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.call_timeout_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if Perm::from_bits(self.default_perm).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "default_perm {} is not a 3-bit mask",
                self.default_perm
            )));
        }
        Ok(())
    }

    /// Default mask; out-of-range values fall back to full access.
    pub fn default_perm(&self) -> Perm {
        Perm::from_bits(self.default_perm).unwrap_or(Perm::ALL)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        match self.call_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("KONTRACT_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("KONTRACT_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a plain string.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
