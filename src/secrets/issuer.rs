use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Req, X509};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::artifacts::ArtifactSaga;
use super::ca::CertificateSigner;
use super::error::{IoContext, Scope, SecretsError, StepContext};
use super::keystore::Keystore;
use super::paths::{Role, SecretPaths};
use super::x509::{self, san_for_address, LeafExtensions, SanEntry};
use crate::config::{CertificateProfile, RunConfig};

/// Files produced for one endpoint.
#[derive(Debug, Clone)]
pub struct IssuedEndpoint {
    pub role: Role,
    pub certificate: PathBuf,
    pub keystore: PathBuf,
    pub san: SanEntry,
    pub files: Vec<PathBuf>,
}

/// Issues the per-run-config endpoint certificates.
pub trait EndpointIssuer {
    fn issue_projector(&self, run_config: &RunConfig) -> Result<IssuedEndpoint, SecretsError>;

    fn issue_http(&self, run_config: &RunConfig) -> Result<IssuedEndpoint, SecretsError>;
}

pub struct KeyPairIssuer<'a, P, H> {
    paths: &'a SecretPaths,
    projector_profile: &'a CertificateProfile,
    http_profile: &'a CertificateProfile,
    projector_signer: P,
    http_signer: H,
}

impl<'a, P, H> KeyPairIssuer<'a, P, H>
where
    P: CertificateSigner,
    H: CertificateSigner,
{
    /// `projector_signer` and `http_signer` are usually the same CA, loaded
    /// from its keystore and from its PEM files respectively.
    pub fn new(
        paths: &'a SecretPaths,
        projector_profile: &'a CertificateProfile,
        http_profile: &'a CertificateProfile,
        projector_signer: P,
        http_signer: H,
    ) -> Self {
        Self {
            paths,
            projector_profile,
            http_profile,
            projector_signer,
            http_signer,
        }
    }
}

impl<P, H> EndpointIssuer for KeyPairIssuer<'_, P, H>
where
    P: CertificateSigner,
    H: CertificateSigner,
{
    fn issue_projector(&self, run_config: &RunConfig) -> Result<IssuedEndpoint, SecretsError> {
        let scope = Scope::run_config(&run_config.name);
        let name = run_config.name.as_str();
        let token = run_config.token.as_str();
        let alias = Role::Projector.stem();
        let ca_alias = Role::Ca.stem();

        let keystore_path = self.paths.projector_keystore(name)?;
        let csr_path = self.paths.projector_signing_request(name)?;
        let cert_path = self.paths.projector_certificate(name)?;
        let pkcs12_path = self.paths.projector_pkcs12(name)?;

        info!("🔑 Issuing projector certificate for '{}'", name);
        let mut saga = ArtifactSaga::new(scope.clone());

        // 1. key pair inside a fresh keystore, self-signed until the CA reply arrives
        let key = x509::generate_rsa(self.projector_profile.key_bits)
            .step("generate projector key", &scope)?;
        let placeholder = x509::self_signed(&key, self.projector_profile)
            .step("create projector keystore", &scope)?;
        let mut keystore = Keystore::new();
        keystore
            .set_private_key(alias, &key, token, vec![placeholder])
            .step("create projector keystore", &scope)?;
        save_keystore(&mut saga, &keystore, &keystore_path, token, "write projector keystore")?;

        // 2. signing request from the keystore entry
        let stored_key = reload_key(&keystore_path, alias, token, &scope)?;
        let request = x509::create_signing_request(
            &stored_key,
            &self.projector_profile.distinguished_name,
        )
        .step("create projector signing request", &scope)?;
        let request_pem = request.to_pem().step("encode projector signing request", &scope)?;
        saga.write(&csr_path, &request_pem, "write projector signing request")?;

        // 3. CA signs; the projector endpoint is always reached through localhost
        let san = SanEntry::Dns("localhost".to_string());
        let certificate = sign_from_file(
            &self.projector_signer,
            &csr_path,
            &LeafExtensions {
                san: san.clone(),
                validity_days: self.projector_profile.validity_days,
            },
            &scope,
        )?;
        let certificate_pem = certificate.to_pem().step("encode projector certificate", &scope)?;
        saga.write(&cert_path, &certificate_pem, "write projector certificate")?;

        // 4. trust the CA inside the keystore
        let ca_certificate = self.projector_signer.certificate().to_owned();
        keystore
            .set_trusted_certificate(ca_alias, ca_certificate.clone())
            .step("import CA into projector keystore", &scope)?;
        save_keystore(&mut saga, &keystore, &keystore_path, token, "import CA into projector keystore")?;

        // 5. install the signed reply, completing the chain
        let signed = read_certificate(&cert_path, &scope)?;
        keystore
            .set_certificate_chain(alias, vec![signed, ca_certificate])
            .step("import projector certificate", &scope)?;
        save_keystore(&mut saga, &keystore, &keystore_path, token, "import projector certificate")?;

        // 6. PKCS#12 copy for non-JVM consumers
        let pkcs12 = keystore
            .to_pkcs12(alias, token, token)
            .step("convert projector keystore to PKCS#12", &scope)?;
        saga.write(&pkcs12_path, &pkcs12, "write projector PKCS#12")?;

        let files = saga.commit();
        debug!("Projector artifacts for '{}': {:?}", name, files);
        Ok(IssuedEndpoint {
            role: Role::Projector,
            certificate: cert_path,
            keystore: keystore_path,
            san,
            files,
        })
    }

    fn issue_http(&self, run_config: &RunConfig) -> Result<IssuedEndpoint, SecretsError> {
        let scope = Scope::run_config(&run_config.name);
        let name = run_config.name.as_str();
        let token = run_config.token.as_str();

        let key_path = self.paths.http_private_key(name)?;
        let csr_path = self.paths.http_signing_request(name)?;
        let cert_path = self.paths.http_certificate(name)?;
        let keystore_path = self.paths.http_keystore(name)?;

        let san = san_for_address(&run_config.http_address);
        info!("🔑 Issuing HTTP certificate for '{}' ({})", name, san);
        let mut saga = ArtifactSaga::new(scope.clone());

        // 1. private key file
        let key = x509::generate_rsa(self.http_profile.key_bits).step("generate HTTP key", &scope)?;
        let key_pem = key.private_key_to_pem_pkcs8().step("encode HTTP key", &scope)?;
        saga.write(&key_path, &key_pem, "write HTTP key")?;

        // 2. signing request from the key file
        let key_pem = fs::read(&key_path).io_step("read HTTP key", &scope, &key_path)?;
        let stored_key = PKey::private_key_from_pem(&key_pem).step("parse HTTP key", &scope)?;
        let request =
            x509::create_signing_request(&stored_key, &self.http_profile.distinguished_name)
                .step("create HTTP signing request", &scope)?;
        let request_pem = request.to_pem().step("encode HTTP signing request", &scope)?;
        saga.write(&csr_path, &request_pem, "write HTTP signing request")?;

        // 3. CA signs with the SAN derived from the HTTP address
        let certificate = sign_from_file(
            &self.http_signer,
            &csr_path,
            &LeafExtensions {
                san: san.clone(),
                validity_days: self.http_profile.validity_days,
            },
            &scope,
        )?;
        let certificate_pem = certificate.to_pem().step("encode HTTP certificate", &scope)?;
        saga.write(&cert_path, &certificate_pem, "write HTTP certificate")?;

        // 4. keystore bundling key and chain
        let ca_certificate = self.http_signer.certificate().to_owned();
        let mut keystore = Keystore::new();
        keystore
            .set_private_key(
                Role::HttpServer.stem(),
                &stored_key,
                token,
                vec![certificate, ca_certificate.clone()],
            )
            .step("create HTTP keystore", &scope)?;
        keystore
            .set_trusted_certificate(Role::Ca.stem(), ca_certificate)
            .step("create HTTP keystore", &scope)?;
        save_keystore(&mut saga, &keystore, &keystore_path, token, "write HTTP keystore")?;

        let files = saga.commit();
        debug!("HTTP artifacts for '{}': {:?}", name, files);
        Ok(IssuedEndpoint {
            role: Role::HttpServer,
            certificate: cert_path,
            keystore: keystore_path,
            san,
            files,
        })
    }
}

fn save_keystore(
    saga: &mut ArtifactSaga,
    keystore: &Keystore,
    path: &Path,
    password: &str,
    step: &'static str,
) -> Result<(), SecretsError> {
    let bytes = keystore.to_bytes(password).step(step, saga.scope())?;
    saga.write(path, &bytes, step)
}

fn reload_key(
    path: &Path,
    alias: &str,
    password: &str,
    scope: &Scope,
) -> Result<PKey<Private>, SecretsError> {
    let step = "read key from keystore";
    let bytes = fs::read(path).io_step(step, scope, path)?;
    let keystore = Keystore::from_bytes(&bytes, password).step(step, scope)?;
    let entry = keystore.private_key(alias).ok_or_else(|| SecretsError::Invalid {
        step,
        scope: scope.clone(),
        reason: format!("no '{alias}' entry in {}", path.display()),
    })?;
    entry.decrypt(password).step(step, scope)
}

fn sign_from_file<S: CertificateSigner>(
    signer: &S,
    csr_path: &Path,
    extensions: &LeafExtensions,
    scope: &Scope,
) -> Result<X509, SecretsError> {
    let pem = fs::read(csr_path).io_step("read signing request", scope, csr_path)?;
    let request = X509Req::from_pem(&pem).step("parse signing request", scope)?;
    signer.sign_request(&request, extensions, scope)
}

fn read_certificate(path: &Path, scope: &Scope) -> Result<X509, SecretsError> {
    let pem = fs::read(path).io_step("read signed certificate", scope, path)?;
    X509::from_pem(&pem).step("parse signed certificate", scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretsConfig;
    use crate::secrets::ca::{CaManager, CertificateAuthority};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        paths: SecretPaths,
        config: SecretsConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let paths = SecretPaths::new(temp_dir.path());
            let config = SecretsConfig::with_key_bits(1024);
            CaManager::new(&paths, &config.ca, &config.lock)
                .create_ca()
                .unwrap();
            fs::create_dir_all(paths.run_config_dir("demo").unwrap()).unwrap();
            Self {
                _temp_dir: temp_dir,
                paths,
                config,
            }
        }

        fn issuer(&self) -> KeyPairIssuer<'_, CertificateAuthority, CertificateAuthority> {
            let manager = CaManager::new(&self.paths, &self.config.ca, &self.config.lock);
            KeyPairIssuer::new(
                &self.paths,
                &self.config.projector,
                &self.config.http,
                manager.load_from_keystore().unwrap(),
                manager.load_from_pem().unwrap(),
            )
        }
    }

    fn run_config(address: &str) -> RunConfig {
        RunConfig::new("demo", "abc123", "/opt/idea", address)
    }

    #[test]
    fn test_projector_keystore_holds_full_chain() {
        let fixture = Fixture::new();
        let issuer = fixture.issuer();
        let issued = issuer.issue_projector(&run_config("10.0.0.1")).unwrap();

        assert_eq!(issued.san, SanEntry::Dns("localhost".to_string()));
        let bytes = fs::read(&issued.keystore).unwrap();
        let keystore = Keystore::from_bytes(&bytes, "abc123").unwrap();

        let entry = keystore.private_key("projector").unwrap();
        assert_eq!(entry.chain.len(), 2);
        assert!(entry.decrypt("abc123").is_ok());

        let ca = issuer.projector_signer.certificate();
        assert!(x509::verify_issued_by(&entry.chain[0], ca).unwrap());
        assert_eq!(entry.chain[1].to_der().unwrap(), ca.to_der().unwrap());
        assert!(keystore.trusted_certificate("ca").is_some());
        assert_eq!(
            x509::subject_alt_names(&entry.chain[0]),
            vec![SanEntry::Dns("localhost".to_string())]
        );
    }

    #[test]
    fn test_projector_writes_all_files() {
        let fixture = Fixture::new();
        fixture.issuer().issue_projector(&run_config("localhost")).unwrap();
        for path in [
            fixture.paths.projector_keystore("demo").unwrap(),
            fixture.paths.projector_signing_request("demo").unwrap(),
            fixture.paths.projector_certificate("demo").unwrap(),
            fixture.paths.projector_pkcs12("demo").unwrap(),
        ] {
            assert!(path.is_file(), "missing {}", path.display());
        }
    }

    #[test]
    fn test_http_san_follows_address() {
        let fixture = Fixture::new();
        let issuer = fixture.issuer();

        for (address, expected) in [
            ("192.168.1.5", "IP:192.168.1.5"),
            ("example.internal", "DNS:example.internal"),
            ("localhost", "DNS:localhost"),
        ] {
            let issued = issuer.issue_http(&run_config(address)).unwrap();
            let pem = fs::read(&issued.certificate).unwrap();
            let cert = X509::from_pem(&pem).unwrap();
            let sans: Vec<String> = x509::subject_alt_names(&cert)
                .iter()
                .map(ToString::to_string)
                .collect();
            assert_eq!(sans, vec![expected.to_string()]);
        }
    }

    #[test]
    fn test_http_certificate_verifies_against_ca() {
        let fixture = Fixture::new();
        let issuer = fixture.issuer();
        let issued = issuer.issue_http(&run_config("10.0.0.1")).unwrap();

        let cert = X509::from_pem(&fs::read(&issued.certificate).unwrap()).unwrap();
        assert!(x509::verify_issued_by(&cert, issuer.http_signer.certificate()).unwrap());

        let key_pem = fs::read(fixture.paths.http_private_key("demo").unwrap()).unwrap();
        let key = PKey::private_key_from_pem(&key_pem).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert_eq!(x509::common_name(cert.subject_name()).as_deref(), Some("Http"));
    }

    #[test]
    fn test_failed_issuance_rolls_back() {
        let fixture = Fixture::new();
        let issuer = fixture.issuer();

        // A directory where the certificate should go makes step 3 fail
        let cert_path = fixture.paths.projector_certificate("demo").unwrap();
        fs::create_dir_all(&cert_path).unwrap();

        let result = issuer.issue_projector(&run_config("localhost"));
        assert!(matches!(result, Err(SecretsError::Io { .. })));
        assert!(!fixture.paths.projector_keystore("demo").unwrap().exists());
        assert!(!fixture.paths.projector_signing_request("demo").unwrap().exists());
    }

    #[test]
    fn test_failed_http_issuance_rolls_back() {
        let fixture = Fixture::new();
        let issuer = fixture.issuer();

        let cert_path = fixture.paths.http_certificate("demo").unwrap();
        fs::create_dir_all(&cert_path).unwrap();

        let result = issuer.issue_http(&run_config("192.168.1.5"));
        assert!(matches!(result, Err(SecretsError::Io { .. })));
        assert!(!fixture.paths.http_private_key("demo").unwrap().exists());
        assert!(!fixture.paths.http_signing_request("demo").unwrap().exists());
        assert!(!fixture.paths.http_keystore("demo").unwrap().exists());

        // A clean retry succeeds once the obstruction is gone
        fs::remove_dir(&cert_path).unwrap();
        assert!(issuer.issue_http(&run_config("192.168.1.5")).is_ok());
    }
}
