//! File layout of every secret artifact.
//!
//! Installation-wide CA artifacts live in `<root>/ssl/`, everything issued for a
//! run config lives in `<root>/configs/<name>/`.

use std::path::{Path, PathBuf};

use super::error::{Scope, SecretsError};
use crate::config::validation::validate_name;

pub const SSL_PROPERTIES_FILE: &str = "ssl.properties";
const SSL_DIR: &str = "ssl";
const RUN_CONFIGS_DIR: &str = "configs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ca,
    Projector,
    HttpServer,
}

impl Role {
    /// File stem, also used as the keystore alias
    pub fn stem(&self) -> &'static str {
        match self {
            Role::Ca => "ca",
            Role::Projector => "projector",
            Role::HttpServer => "http_server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Keystore,
    Pkcs12,
    Certificate,
    PrivateKey,
    SigningRequest,
    Password,
    Lock,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Keystore => "jks",
            Extension::Pkcs12 => "p12",
            Extension::Certificate => "crt",
            Extension::PrivateKey => "key",
            Extension::SigningRequest => "csr",
            Extension::Password => "password",
            Extension::Lock => "lock",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecretPaths {
    root: PathBuf,
}

impl SecretPaths {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            root: config_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.root.join(SSL_DIR)
    }

    pub fn run_configs_dir(&self) -> PathBuf {
        self.root.join(RUN_CONFIGS_DIR)
    }

    pub fn scope_dir(&self, scope: &Scope) -> Result<PathBuf, SecretsError> {
        match scope {
            Scope::Installation => Ok(self.ssl_dir()),
            Scope::RunConfig(name) => {
                validate_name(name)?;
                Ok(self.run_configs_dir().join(name))
            }
        }
    }

    pub fn resolve(
        &self,
        scope: &Scope,
        role: Role,
        extension: Extension,
    ) -> Result<PathBuf, SecretsError> {
        let file = format!("{}.{}", role.stem(), extension.as_str());
        Ok(self.scope_dir(scope)?.join(file))
    }

    fn ca(&self, extension: Extension) -> PathBuf {
        self.ssl_dir()
            .join(format!("{}.{}", Role::Ca.stem(), extension.as_str()))
    }

    pub fn ca_keystore(&self) -> PathBuf {
        self.ca(Extension::Keystore)
    }

    pub fn ca_certificate(&self) -> PathBuf {
        self.ca(Extension::Certificate)
    }

    pub fn ca_pkcs12(&self) -> PathBuf {
        self.ca(Extension::Pkcs12)
    }

    pub fn ca_private_key(&self) -> PathBuf {
        self.ca(Extension::PrivateKey)
    }

    pub fn ca_password(&self) -> PathBuf {
        self.ca(Extension::Password)
    }

    pub fn ca_lock(&self) -> PathBuf {
        self.ca(Extension::Lock)
    }

    pub fn run_config_dir(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.scope_dir(&Scope::run_config(name))
    }

    fn endpoint(&self, name: &str, role: Role, extension: Extension) -> Result<PathBuf, SecretsError> {
        self.resolve(&Scope::run_config(name), role, extension)
    }

    pub fn projector_keystore(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::Projector, Extension::Keystore)
    }

    pub fn projector_pkcs12(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::Projector, Extension::Pkcs12)
    }

    pub fn projector_signing_request(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::Projector, Extension::SigningRequest)
    }

    pub fn projector_certificate(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::Projector, Extension::Certificate)
    }

    pub fn http_private_key(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::HttpServer, Extension::PrivateKey)
    }

    pub fn http_certificate(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::HttpServer, Extension::Certificate)
    }

    pub fn http_signing_request(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::HttpServer, Extension::SigningRequest)
    }

    pub fn http_keystore(&self, name: &str) -> Result<PathBuf, SecretsError> {
        self.endpoint(name, Role::HttpServer, Extension::Keystore)
    }

    pub fn ssl_properties(&self, name: &str) -> Result<PathBuf, SecretsError> {
        Ok(self.run_config_dir(name)?.join(SSL_PROPERTIES_FILE))
    }
}

/// Location of the keytool bundled with the IDE runtime.
///
/// Keys are generated natively, so this is only reported for diagnostics.
pub fn keytool_path(path_to_app: &Path) -> PathBuf {
    path_to_app.join("jbr").join("bin").join("keytool")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_paths() {
        let paths = SecretPaths::new("/home/user/.projector");
        assert_eq!(paths.ca_keystore(), PathBuf::from("/home/user/.projector/ssl/ca.jks"));
        assert_eq!(paths.ca_certificate(), PathBuf::from("/home/user/.projector/ssl/ca.crt"));
        assert_eq!(paths.ca_pkcs12(), PathBuf::from("/home/user/.projector/ssl/ca.p12"));
        assert_eq!(paths.ca_private_key(), PathBuf::from("/home/user/.projector/ssl/ca.key"));
    }

    #[test]
    fn test_run_config_paths() {
        let paths = SecretPaths::new("/root");
        let dir = PathBuf::from("/root/configs/demo");
        assert_eq!(paths.projector_keystore("demo").unwrap(), dir.join("projector.jks"));
        assert_eq!(paths.projector_pkcs12("demo").unwrap(), dir.join("projector.p12"));
        assert_eq!(paths.projector_signing_request("demo").unwrap(), dir.join("projector.csr"));
        assert_eq!(paths.projector_certificate("demo").unwrap(), dir.join("projector.crt"));
        assert_eq!(paths.http_private_key("demo").unwrap(), dir.join("http_server.key"));
        assert_eq!(paths.http_certificate("demo").unwrap(), dir.join("http_server.crt"));
        assert_eq!(paths.http_signing_request("demo").unwrap(), dir.join("http_server.csr"));
        assert_eq!(paths.http_keystore("demo").unwrap(), dir.join("http_server.jks"));
        assert_eq!(paths.ssl_properties("demo").unwrap(), dir.join("ssl.properties"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let paths = SecretPaths::new("/root");
        let first = paths
            .resolve(&Scope::Installation, Role::Ca, Extension::Keystore)
            .unwrap();
        let second = paths
            .resolve(&Scope::Installation, Role::Ca, Extension::Keystore)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, paths.ca_keystore());
    }

    #[test]
    fn test_rejects_invalid_names() {
        let paths = SecretPaths::new("/root");
        assert!(paths.projector_keystore("").is_err());
        assert!(paths.projector_keystore("../escape").is_err());
    }

    #[test]
    fn test_keytool_path() {
        assert_eq!(
            keytool_path(Path::new("/opt/idea")),
            PathBuf::from("/opt/idea/jbr/bin/keytool")
        );
    }
}
