use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509Req, X509};
use std::fs;
use tracing::{debug, info};

use super::artifacts::{create_dir_if_not_exist, ArtifactSaga};
use super::error::{IoContext, Scope, SecretsError, StepContext};
use super::keystore::{private_key_from_pkcs12, Keystore};
use super::lock::CaLock;
use super::paths::{Role, SecretPaths};
use super::token::generate_secret;
use super::x509::{self, LeafExtensions};
use crate::config::{CertificateProfile, LockConfig};

const CA_PASSWORD_LEN: usize = 32;

/// Anything able to sign endpoint certificate requests.
pub trait CertificateSigner {
    fn certificate(&self) -> &X509Ref;

    fn sign_request(
        &self,
        request: &X509Req,
        extensions: &LeafExtensions,
        scope: &Scope,
    ) -> Result<X509, SecretsError>;
}

/// The installation's root key and self-signed certificate.
pub struct CertificateAuthority {
    key: PKey<Private>,
    certificate: X509,
}

impl CertificateAuthority {
    pub fn new(key: PKey<Private>, certificate: X509) -> Self {
        Self { key, certificate }
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }
}

impl CertificateSigner for CertificateAuthority {
    fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    fn sign_request(
        &self,
        request: &X509Req,
        extensions: &LeafExtensions,
        scope: &Scope,
    ) -> Result<X509, SecretsError> {
        if !x509::verify_signing_request(request).step("verify signing request", scope)? {
            return Err(SecretsError::Invalid {
                step: "verify signing request",
                scope: scope.clone(),
                reason: "request signature does not match its public key".to_string(),
            });
        }
        x509::sign_request(request, &self.key, &self.certificate, extensions)
            .step("sign certificate with CA", scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaStatus {
    Created,
    Existing,
}

pub struct CaManager<'a> {
    paths: &'a SecretPaths,
    profile: &'a CertificateProfile,
    lock: &'a LockConfig,
}

impl<'a> CaManager<'a> {
    pub fn new(paths: &'a SecretPaths, profile: &'a CertificateProfile, lock: &'a LockConfig) -> Self {
        Self {
            paths,
            profile,
            lock,
        }
    }

    /// Presence check only: both the CA keystore and exported certificate exist.
    pub fn ca_exists(&self) -> bool {
        self.paths.ca_keystore().is_file() && self.paths.ca_certificate().is_file()
    }

    /// Creates the CA unless present; check and creation run under the CA lock.
    pub fn ensure_ca(&self) -> Result<CaStatus, SecretsError> {
        let scope = Scope::Installation;
        create_dir_if_not_exist(&self.paths.ssl_dir(), &scope)?;

        let _lock = CaLock::acquire(&self.paths.ca_lock(), self.lock)?;
        if self.ca_exists() {
            debug!("CA already present in {}", self.paths.ssl_dir().display());
            return Ok(CaStatus::Existing);
        }

        self.create_ca()?;
        Ok(CaStatus::Created)
    }

    /// Generates the CA and writes `ca.jks`, `ca.crt`, `ca.p12` and `ca.key`.
    ///
    /// Callers must hold the CA lock; [`CaManager::ensure_ca`] does.
    pub fn create_ca(&self) -> Result<CertificateAuthority, SecretsError> {
        let scope = Scope::Installation;
        let alias = Role::Ca.stem();
        create_dir_if_not_exist(&self.paths.ssl_dir(), &scope)?;

        info!(
            "🔐 Generating {}-bit CA '{}'",
            self.profile.key_bits, self.profile.distinguished_name
        );
        let mut saga = ArtifactSaga::new(scope.clone());

        let password = generate_secret(CA_PASSWORD_LEN)?;
        saga.write(
            &self.paths.ca_password(),
            password.as_bytes(),
            "write CA password",
        )?;

        let key = x509::generate_rsa(self.profile.key_bits).step("generate CA key", &scope)?;
        let certificate =
            x509::self_signed_ca(&key, self.profile).step("self-sign CA certificate", &scope)?;

        let mut keystore = Keystore::new();
        keystore
            .set_private_key(alias, &key, &password, vec![certificate.clone()])
            .step("build CA keystore", &scope)?;
        let keystore_bytes = keystore.to_bytes(&password).step("encode CA keystore", &scope)?;
        saga.write(&self.paths.ca_keystore(), &keystore_bytes, "write CA keystore")?;

        let certificate_pem = certificate.to_pem().step("export CA certificate", &scope)?;
        saga.write(
            &self.paths.ca_certificate(),
            &certificate_pem,
            "export CA certificate",
        )?;

        // p12 is derived from the keystore as written, and ca.key from the p12
        let pkcs12 = Keystore::from_bytes(&keystore_bytes, &password)
            .and_then(|store| store.to_pkcs12(alias, &password, &password))
            .step("convert CA keystore to PKCS#12", &scope)?;
        saga.write(&self.paths.ca_pkcs12(), &pkcs12, "write CA PKCS#12")?;

        let extracted = private_key_from_pkcs12(&pkcs12, &password)
            .step("extract CA key from PKCS#12", &scope)?;
        let key_pem = extracted
            .private_key_to_pem_pkcs8()
            .step("encode CA key", &scope)?;
        saga.write(&self.paths.ca_private_key(), &key_pem, "write CA key")?;

        saga.commit();
        info!("✅ CA created in {}", self.paths.ssl_dir().display());
        Ok(CertificateAuthority::new(key, certificate))
    }

    /// Loads the CA from its keystore, as used for projector signing.
    pub fn load_from_keystore(&self) -> Result<CertificateAuthority, SecretsError> {
        let scope = Scope::Installation;
        self.require_ca()?;

        let password_path = self.paths.ca_password();
        let password = fs::read_to_string(&password_path)
            .io_step("read CA password", &scope, &password_path)?;
        let password = password.trim_end();

        let keystore_path = self.paths.ca_keystore();
        let bytes = fs::read(&keystore_path).io_step("read CA keystore", &scope, &keystore_path)?;
        let keystore = Keystore::from_bytes(&bytes, password).step("decode CA keystore", &scope)?;

        let alias = Role::Ca.stem();
        let entry = keystore.private_key(alias).ok_or_else(|| SecretsError::Invalid {
            step: "decode CA keystore",
            scope: scope.clone(),
            reason: format!("no '{alias}' key entry"),
        })?;
        let key = entry.decrypt(password).step("decrypt CA key", &scope)?;
        let certificate = entry.certificate().cloned().ok_or_else(|| SecretsError::Invalid {
            step: "decode CA keystore",
            scope: scope.clone(),
            reason: "CA key entry has no certificate".to_string(),
        })?;

        Ok(CertificateAuthority::new(key, certificate))
    }

    /// Loads the CA from `ca.key` and `ca.crt`, as used for HTTP signing.
    pub fn load_from_pem(&self) -> Result<CertificateAuthority, SecretsError> {
        let scope = Scope::Installation;
        self.require_ca()?;

        let key_path = self.paths.ca_private_key();
        let key_pem = fs::read(&key_path).io_step("read CA key", &scope, &key_path)?;
        let cert_path = self.paths.ca_certificate();
        let cert_pem = fs::read(&cert_path).io_step("read CA certificate", &scope, &cert_path)?;

        let key = PKey::private_key_from_pem(&key_pem).step("parse CA key", &scope)?;
        let certificate = X509::from_pem(&cert_pem).step("parse CA certificate", &scope)?;

        let public = certificate.public_key().step("parse CA certificate", &scope)?;
        if !public.public_eq(&key) {
            return Err(SecretsError::Invalid {
                step: "load CA",
                scope,
                reason: "ca.key does not match ca.crt".to_string(),
            });
        }

        Ok(CertificateAuthority::new(key, certificate))
    }

    fn require_ca(&self) -> Result<(), SecretsError> {
        if self.ca_exists() {
            Ok(())
        } else {
            Err(SecretsError::CaMissing {
                dir: self.paths.ssl_dir(),
            })
        }
    }
}
