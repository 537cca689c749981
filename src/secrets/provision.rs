use std::path::PathBuf;
use tracing::{debug, info};

use super::artifacts::create_dir_if_not_exist;
use super::ca::{CaManager, CaStatus};
use super::error::{IoContext, Scope, SecretsError};
use super::issuer::{EndpointIssuer, IssuedEndpoint, KeyPairIssuer};
use super::paths::{keytool_path, SecretPaths};
use super::properties::{write_ssl_properties, SslProperties};
use crate::config::validation::validate_run_config;
use crate::config::{AppConfig, RunConfig, SecretsConfig};

/// Outcome of provisioning one run config.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub run_config: String,
    pub ca_status: CaStatus,
    pub projector: IssuedEndpoint,
    pub ssl_properties: PathBuf,
    pub properties: SslProperties,
    pub http: IssuedEndpoint,
}

/// Entry point composing CA bootstrap, endpoint issuance and properties export.
#[derive(Debug, Clone)]
pub struct SecretsProvisioner {
    paths: SecretPaths,
    config: SecretsConfig,
}

impl SecretsProvisioner {
    /// Relative roots are resolved against the working directory, since
    /// `ssl.properties` must carry an absolute keystore path.
    pub fn new(config_root: impl Into<PathBuf>, config: SecretsConfig) -> Result<Self, SecretsError> {
        let root = config_root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .io_step("resolve config root", &Scope::Installation, &root)?
                .join(root)
        };

        Ok(Self {
            paths: SecretPaths::new(root),
            config,
        })
    }

    pub fn from_app_config(app: &AppConfig) -> Result<Self, SecretsError> {
        Self::new(app.paths.config_root.clone(), app.secrets.clone())
    }

    pub fn paths(&self) -> &SecretPaths {
        &self.paths
    }

    pub fn ca_manager(&self) -> CaManager<'_> {
        CaManager::new(&self.paths, &self.config.ca, &self.config.lock)
    }

    /// Generates all connection secrets for `run_config`.
    ///
    /// The CA is created only if missing; both endpoint certificates and
    /// `ssl.properties` are regenerated on every call.
    pub fn generate_server_secrets(
        &self,
        run_config: &RunConfig,
    ) -> Result<ProvisionReport, SecretsError> {
        validate_run_config(run_config)?;
        let scope = Scope::run_config(&run_config.name);
        let name = run_config.name.as_str();

        info!("🚀 Generating server secrets for '{}'", name);
        debug!(
            "Keytool for '{}' would be {} (not needed, keys are generated natively)",
            name,
            keytool_path(&run_config.path_to_app).display()
        );

        let run_config_dir = self.paths.run_config_dir(name)?;
        create_dir_if_not_exist(&run_config_dir, &scope)?;

        let ca = self.ca_manager();
        let ca_status = ca.ensure_ca()?;
        if ca_status == CaStatus::Created {
            info!("📜 New CA created for this installation");
        }

        let issuer = KeyPairIssuer::new(
            &self.paths,
            &self.config.projector,
            &self.config.http,
            ca.load_from_keystore()?,
            ca.load_from_pem()?,
        );

        let projector = issuer.issue_projector(run_config)?;

        let ssl_properties = self.paths.ssl_properties(name)?;
        let properties =
            write_ssl_properties(&ssl_properties, &projector.keystore, &run_config.token, &scope)?;

        let http = issuer.issue_http(run_config)?;

        info!("✅ Secrets for '{}' written to {}", name, run_config_dir.display());
        Ok(ProvisionReport {
            run_config: run_config.name.clone(),
            ca_status,
            projector,
            ssl_properties,
            properties,
            http,
        })
    }
}
