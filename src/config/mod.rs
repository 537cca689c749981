use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub mod validation;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub run_configs: Vec<RunConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathsConfig {
    pub config_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_root: base.join(".projector"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Key material, naming and validity used when issuing certificates.
///
/// Defaults reproduce the installer's historical values: a 4096-bit CA valid
/// for 9999 days, a 4096-bit projector key and a 2048-bit HTTP key, both
/// valid for 4500 days.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecretsConfig {
    #[serde(default = "CertificateProfile::default_ca")]
    pub ca: CertificateProfile,
    #[serde(default = "CertificateProfile::default_projector")]
    pub projector: CertificateProfile,
    #[serde(default = "CertificateProfile::default_http")]
    pub http: CertificateProfile,
    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            ca: CertificateProfile::default_ca(),
            projector: CertificateProfile::default_projector(),
            http: CertificateProfile::default_http(),
            lock: LockConfig::default(),
        }
    }
}

impl SecretsConfig {
    /// Same naming and validity as the defaults, with every key size replaced.
    pub fn with_key_bits(bits: u32) -> Self {
        let mut config = Self::default();
        config.ca.key_bits = bits;
        config.projector.key_bits = bits;
        config.http.key_bits = bits;
        config
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CertificateProfile {
    pub distinguished_name: DistinguishedName,
    pub key_bits: u32,
    pub validity_days: u32,
}

impl CertificateProfile {
    pub fn default_ca() -> Self {
        Self {
            distinguished_name: DistinguishedName::new("PROJECTOR-CA", "Projector"),
            key_bits: 4096,
            validity_days: 9999,
        }
    }

    pub fn default_projector() -> Self {
        Self {
            distinguished_name: DistinguishedName::new("Idea", "Idea"),
            key_bits: 4096,
            validity_days: 4500,
        }
    }

    pub fn default_http() -> Self {
        Self {
            distinguished_name: DistinguishedName::new("Http", "Idea"),
            key_bits: 2048,
            validity_days: 4500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organizational_unit: String,
    pub organization: String,
    pub locality: String,
    pub state: String,
    pub country: String,
}

impl DistinguishedName {
    fn new(common_name: &str, organization: &str) -> Self {
        Self {
            common_name: common_name.to_string(),
            organizational_unit: "Development".to_string(),
            organization: organization.to_string(),
            locality: "SPB".to_string(),
            state: "SPB".to_string(),
            country: "RU".to_string(),
        }
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CN={}, OU={}, O={}, L={}, ST={}, C={}",
            self.common_name,
            self.organizational_unit,
            self.organization,
            self.locality,
            self.state,
            self.country
        )
    }
}

/// Installation-wide lock guarding CA creation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LockConfig {
    pub retry_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 50,
            timeout_ms: 120_000,
        }
    }
}

/// One server instance to provision secrets for.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunConfig {
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub path_to_app: PathBuf,
    pub http_address: String,
}

impl RunConfig {
    pub fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        path_to_app: impl Into<PathBuf>,
        http_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            path_to_app: path_to_app.into(),
            http_address: http_address.into(),
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("PROJECTOR").separator("__"))
            .build()?;

        Self::finish(settings.try_deserialize()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("PROJECTOR").separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;

        Self::finish(settings.try_deserialize()?)
    }

    fn finish(config: Self) -> anyhow::Result<Self> {
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Gives run configs without a stored token a fresh one for this session.
    pub fn fill_missing_tokens(&mut self) -> anyhow::Result<usize> {
        let mut filled = 0;
        for run_config in self.run_configs.iter_mut().filter(|rc| rc.token.is_empty()) {
            run_config.token = crate::secrets::generate_token()
                .with_context(|| format!("Failed to generate token for '{}'", run_config.name))?
                .into_string();
            tracing::warn!(
                "⚠️  Run config '{}' has no token, generated one for this run",
                run_config.name
            );
            filled += 1;
        }
        Ok(filled)
    }

    pub fn run_config(&self, name: &str) -> Option<&RunConfig> {
        self.run_configs.iter().find(|rc| rc.name == name)
    }

    #[cfg(test)]
    pub fn create_test_config(root: &Path) -> Self {
        AppConfig {
            paths: PathsConfig {
                config_root: root.to_path_buf(),
            },
            logging: LoggingConfig::default(),
            secrets: SecretsConfig::with_key_bits(2048),
            run_configs: vec![RunConfig::new(
                "demo",
                "abc123",
                "/opt/idea",
                "192.168.1.5",
            )],
        }
    }
}
