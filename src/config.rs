use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ca::CaSettings;
use crate::error::{TrustError, TrustResult};
use crate::keystore::KeySource;
use crate::retry::RetryConfig;
use zeroize::Zeroizing;

/// Location of the project store
#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_name")]
    pub project: String,
    #[serde(default = "default_name")]
    pub stack: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/keyfleet")
}

fn default_name() -> String {
    "default".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            project: default_name(),
            stack: default_name(),
        }
    }
}

/// CA Factory settings
#[derive(Debug, Deserialize, Clone)]
pub struct CaConfig {
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_root_validity_days")]
    pub root_validity_days: i64,
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: i64,
    /// How long an exported revocation list stays trustworthy (None = forever)
    #[serde(default = "default_max_staleness")]
    pub revocation_max_staleness_secs: Option<i64>,
}

fn default_common_name() -> String {
    "keyfleet root".to_string()
}

fn default_organization() -> String {
    "keyfleet".to_string()
}

fn default_root_validity_days() -> i64 {
    1825
}

fn default_leaf_validity_days() -> i64 {
    90
}

fn default_max_staleness() -> Option<i64> {
    Some(86_400)
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            organization: default_organization(),
            root_validity_days: default_root_validity_days(),
            leaf_validity_days: default_leaf_validity_days(),
            revocation_max_staleness_secs: default_max_staleness(),
        }
    }
}

impl CaConfig {
    pub fn settings(&self) -> CaSettings {
        CaSettings {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            revocation_max_staleness: self
                .revocation_max_staleness_secs
                .map(chrono::Duration::seconds),
        }
    }

    pub fn root_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.root_validity_days)
    }

    pub fn leaf_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.leaf_validity_days)
    }
}

/// Where the operator key comes from
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OperatorKeyConfig {
    Pem {
        path: PathBuf,
    },
    Encrypted {
        path: PathBuf,
        /// Environment variable holding the passphrase
        #[serde(default = "default_passphrase_env")]
        passphrase_env: String,
    },
    Env {
        #[serde(default = "default_agent_var")]
        var: String,
    },
}

fn default_passphrase_env() -> String {
    "KEYFLEET_PASSPHRASE".to_string()
}

fn default_agent_var() -> String {
    "KEYFLEET_OPERATOR_SEED".to_string()
}

impl OperatorKeyConfig {
    pub fn key_source(&self) -> TrustResult<KeySource> {
        Ok(match self {
            Self::Pem { path } => KeySource::Pem(path.clone()),
            Self::Encrypted {
                path,
                passphrase_env,
            } => {
                let passphrase = std::env::var(passphrase_env).map_err(|_| {
                    TrustError::KeyUnavailable(format!("passphrase variable {} not set", passphrase_env))
                })?;
                KeySource::Encrypted {
                    path: path.clone(),
                    passphrase: Zeroizing::new(passphrase),
                }
            }
            Self::Env { var } => KeySource::Env(var.clone()),
        })
    }
}

/// Operator workstation settings
#[derive(Debug, Deserialize, Clone)]
pub struct OperatorConfig {
    pub key: OperatorKeyConfig,
    /// `authorized_recipients` file; defaults to one inside the project store
    #[serde(default)]
    pub recipients_path: Option<PathBuf>,
}

/// Escrow endpoint settings
#[derive(Debug, Deserialize, Clone)]
pub struct EscrowConfig {
    pub endpoint_id: String,
    #[serde(default = "default_escrow_host")]
    pub host: String,
    #[serde(default = "default_escrow_port")]
    pub port: u16,
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
    /// X25519 key deposits are sealed to (base64 file)
    pub recipient_key_path: PathBuf,
    pub bundle_path: PathBuf,
    /// Operator Ed25519 public key (base64)
    pub operator_public_key: String,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: i64,
}

fn default_escrow_host() -> String {
    "0.0.0.0".to_string()
}

fn default_escrow_port() -> u16 {
    7654
}

fn default_clock_skew_secs() -> i64 {
    crate::escrow::DEFAULT_CLOCK_SKEW_SECS
}

impl EscrowConfig {
    pub fn socket_addr(&self) -> TrustResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| TrustError::invalid_request(format!("invalid escrow bind address: {}", e)))
    }
}

/// Local hardware binding settings
#[derive(Debug, Deserialize, Clone)]
pub struct HardwareConfig {
    pub device_key_path: PathBuf,
    /// Files whose contents make up the measured boot state
    #[serde(default)]
    pub measured_paths: Vec<PathBuf>,
}

/// Boot-time unlock settings
#[derive(Debug, Deserialize, Clone)]
pub struct BootConfig {
    /// Boot reference document pushed by configuration management
    pub reference_path: PathBuf,
    pub device: String,
    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,
    #[serde(default = "default_cryptsetup_path")]
    pub cryptsetup_path: String,
    /// Upper bound for one endpoint exchange, retries included
    #[serde(default = "default_endpoint_timeout_secs")]
    pub endpoint_timeout_secs: u64,
    /// Timeout of a single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub hardware: Option<HardwareConfig>,
}

fn default_mapper_name() -> String {
    "cryptroot".to_string()
}

fn default_cryptsetup_path() -> String {
    "cryptsetup".to_string()
}

fn default_endpoint_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    5
}

impl BootConfig {
    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub operator: Option<OperatorConfig>,
    #[serde(default)]
    pub escrow: Option<EscrowConfig>,
    #[serde(default)]
    pub boot: Option<BootConfig>,
}

fn missing(section: &str) -> TrustError {
    TrustError::Config(ConfigError::NotFound(section.to_string()))
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load(extra: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = extra {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // Override with environment variables (prefix: KEYFLEET_)
            // e.g., KEYFLEET_ESCROW__PORT, KEYFLEET_VAULT__PROJECT
            .add_source(
                Environment::with_prefix("KEYFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn operator(&self) -> TrustResult<&OperatorConfig> {
        self.operator.as_ref().ok_or_else(|| missing("operator"))
    }

    pub fn escrow(&self) -> TrustResult<&EscrowConfig> {
        self.escrow.as_ref().ok_or_else(|| missing("escrow"))
    }

    pub fn boot(&self) -> TrustResult<&BootConfig> {
        self.boot.as_ref().ok_or_else(|| missing("boot"))
    }

    /// Authorized recipients file of the configured project.
    pub fn recipients_path(&self) -> PathBuf {
        self.operator
            .as_ref()
            .and_then(|o| o.recipients_path.clone())
            .unwrap_or_else(|| {
                self.vault
                    .state_dir
                    .join(&self.vault.project)
                    .join("authorized_recipients")
            })
    }
}
