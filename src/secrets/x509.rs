use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Name, X509NameRef, X509Ref, X509Req, X509ReqRef, X509};
use std::fmt;
use std::net::IpAddr;

use crate::config::validation::parse_ip_literal;
use crate::config::{CertificateProfile, DistinguishedName};

const SERIAL_BITS: i32 = 159;

/// Subject alternative name for an endpoint certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
}

impl fmt::Display for SanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanEntry::Dns(name) => write!(f, "DNS:{name}"),
            SanEntry::Ip(ip) => write!(f, "IP:{ip}"),
        }
    }
}

/// IP literals become `IP:` entries, everything else (including `localhost`) `DNS:`.
pub fn san_for_address(address: &str) -> SanEntry {
    match parse_ip_literal(address) {
        Some(ip) => SanEntry::Ip(ip),
        None => SanEntry::Dns(address.to_string()),
    }
}

pub fn generate_rsa(bits: u32) -> Result<PKey<Private>, ErrorStack> {
    PKey::from_rsa(Rsa::generate(bits)?)
}

pub fn build_name(dn: &DistinguishedName) -> Result<X509Name, ErrorStack> {
    let mut builder = X509Name::builder()?;
    builder.append_entry_by_nid(Nid::COUNTRYNAME, &dn.country)?;
    builder.append_entry_by_nid(Nid::STATEORPROVINCENAME, &dn.state)?;
    builder.append_entry_by_nid(Nid::LOCALITYNAME, &dn.locality)?;
    builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, &dn.organization)?;
    builder.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &dn.organizational_unit)?;
    builder.append_entry_by_nid(Nid::COMMONNAME, &dn.common_name)?;
    Ok(builder.build())
}

pub fn create_signing_request(
    key: &PKeyRef<Private>,
    dn: &DistinguishedName,
) -> Result<X509Req, ErrorStack> {
    let mut builder = X509Req::builder()?;
    builder.set_version(0)?;
    let name = build_name(dn)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn self_signed_builder(
    key: &PKeyRef<Private>,
    profile: &CertificateProfile,
) -> Result<X509Builder, ErrorStack> {
    let name = build_name(&profile.distinguished_name)?;

    let serial = random_serial()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(profile.validity_days)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

/// Plain self-signed certificate, what a fresh keystore key entry starts with.
pub fn self_signed(key: &PKeyRef<Private>, profile: &CertificateProfile) -> Result<X509, ErrorStack> {
    let mut builder = self_signed_builder(key, profile)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Self-signed root certificate with keyCertSign usage and CA:true constraints.
pub fn self_signed_ca(
    key: &PKeyRef<Private>,
    profile: &CertificateProfile,
) -> Result<X509, ErrorStack> {
    let mut builder = self_signed_builder(key, profile)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(KeyUsage::new().critical().key_cert_sign().build()?)?;
    let subject_key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Extensions placed on every endpoint certificate.
#[derive(Debug, Clone)]
pub struct LeafExtensions {
    pub san: SanEntry,
    pub validity_days: u32,
}

/// Issues a certificate for `request`, signed by the CA key.
pub fn sign_request(
    request: &X509ReqRef,
    ca_key: &PKeyRef<Private>,
    ca_cert: &X509Ref,
    extensions: &LeafExtensions,
) -> Result<X509, ErrorStack> {
    let request_key = request.public_key()?;
    let serial = random_serial()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(extensions.validity_days)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(request.subject_name())?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    builder.set_pubkey(&request_key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let mut san = SubjectAlternativeName::new();
    match &extensions.san {
        SanEntry::Dns(name) => san.dns(name),
        SanEntry::Ip(ip) => san.ip(&ip.to_string()),
    };
    let san = san.build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(san)?;

    let subject_key_id =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(subject_key_id)?;
    let authority_key_id = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(authority_key_id)?;

    builder.sign(ca_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Checks the request is signed by the key it carries.
pub fn verify_signing_request(request: &X509ReqRef) -> Result<bool, ErrorStack> {
    let public_key = request.public_key()?;
    request.verify(&public_key)
}

/// True when `cert` was issued by `ca` and its signature checks out.
pub fn verify_issued_by(cert: &X509Ref, ca: &X509Ref) -> Result<bool, ErrorStack> {
    if !same_name(cert.issuer_name(), ca.subject_name())? {
        return Ok(false);
    }
    let ca_key = ca.public_key()?;
    cert.verify(&ca_key)
}

pub fn same_name(a: &X509NameRef, b: &X509NameRef) -> Result<bool, ErrorStack> {
    Ok(a.to_der()? == b.to_der()?)
}

/// SAN entries of a certificate, rendered as `DNS:..` / `IP:..`.
pub fn subject_alt_names(cert: &X509Ref) -> Vec<SanEntry> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };

    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(SanEntry::Dns(dns.to_string()));
            }
            name.ipaddress().and_then(|raw| match raw.len() {
                4 => {
                    let octets: [u8; 4] = raw.try_into().ok()?;
                    Some(SanEntry::Ip(IpAddr::from(octets)))
                }
                16 => {
                    let octets: [u8; 16] = raw.try_into().ok()?;
                    Some(SanEntry::Ip(IpAddr::from(octets)))
                }
                _ => None,
            })
        })
        .collect()
}

pub fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_profile() -> CertificateProfile {
        let mut profile = CertificateProfile::default_ca();
        profile.key_bits = 1024;
        profile
    }

    #[test]
    fn test_san_selection() {
        assert_eq!(san_for_address("192.168.1.5").to_string(), "IP:192.168.1.5");
        assert_eq!(
            san_for_address("example.internal").to_string(),
            "DNS:example.internal"
        );
        assert_eq!(san_for_address("localhost").to_string(), "DNS:localhost");
        assert_eq!(san_for_address("[::1]").to_string(), "IP:::1");
    }

    #[test]
    fn test_self_signed_ca_is_self_issued() {
        let profile = small_profile();
        let key = generate_rsa(profile.key_bits).unwrap();
        let ca = self_signed_ca(&key, &profile).unwrap();

        assert!(verify_issued_by(&ca, &ca).unwrap());
        assert_eq!(common_name(ca.subject_name()).as_deref(), Some("PROJECTOR-CA"));
    }

    #[test]
    fn test_signed_leaf_carries_san_and_issuer() {
        let profile = small_profile();
        let ca_key = generate_rsa(profile.key_bits).unwrap();
        let ca = self_signed_ca(&ca_key, &profile).unwrap();

        let leaf_key = generate_rsa(1024).unwrap();
        let request = create_signing_request(
            &leaf_key,
            &CertificateProfile::default_http().distinguished_name,
        )
        .unwrap();
        let leaf = sign_request(
            &request,
            &ca_key,
            &ca,
            &LeafExtensions {
                san: san_for_address("10.1.2.3"),
                validity_days: 30,
            },
        )
        .unwrap();

        assert!(verify_issued_by(&leaf, &ca).unwrap());
        assert_eq!(
            subject_alt_names(&leaf),
            vec![SanEntry::Ip("10.1.2.3".parse().unwrap())]
        );
        assert_eq!(common_name(leaf.subject_name()).as_deref(), Some("Http"));
    }

    #[test]
    fn test_leaf_does_not_verify_against_foreign_ca() {
        let profile = small_profile();
        let ca_key = generate_rsa(profile.key_bits).unwrap();
        let ca = self_signed_ca(&ca_key, &profile).unwrap();
        let other_key = generate_rsa(profile.key_bits).unwrap();
        let other = self_signed_ca(&other_key, &profile).unwrap();

        let leaf_key = generate_rsa(1024).unwrap();
        let request =
            create_signing_request(&leaf_key, &profile.distinguished_name).unwrap();
        let leaf = sign_request(
            &request,
            &ca_key,
            &ca,
            &LeafExtensions {
                san: san_for_address("localhost"),
                validity_days: 1,
            },
        )
        .unwrap();

        // Same DN, different key
        assert!(!verify_issued_by(&leaf, &other).unwrap());
    }
}
