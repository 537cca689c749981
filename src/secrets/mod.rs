/// Secrets module for run config TLS material
///
/// This module bootstraps the installation CA and issues, per run config,
/// the projector keystore, the HTTP certificate and `ssl.properties`.
pub mod artifacts;
pub mod ca;
pub mod error;
pub mod issuer;
pub mod keystore;
pub mod lock;
pub mod paths;
pub mod properties;
pub mod provision;
pub mod token;
pub mod x509;

// Re-export the provisioning surface for easy use
pub use ca::{CaManager, CaStatus, CertificateAuthority, CertificateSigner};
pub use error::{Scope, SecretsError};
pub use issuer::{EndpointIssuer, IssuedEndpoint, KeyPairIssuer};
pub use paths::{Extension, Role, SecretPaths};
pub use properties::{write_ssl_properties, SslProperties};
pub use provision::{ProvisionReport, SecretsProvisioner};
pub use token::{generate_token, Token};
