//! Java KeyStore (JKS) reader and writer.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! u32 magic 0xFEEDFEED | u32 version 2 | u32 entry count
//! entry: u32 tag | UTF alias | u64 created (ms)
//!   tag 1 (private key): u32 len, EncryptedPrivateKeyInfo
//!                        u32 chain len, { UTF "X.509", u32 len, DER }*
//!   tag 2 (trusted):     UTF "X.509", u32 len, DER
//! SHA-1(UTF-16BE(password) || "Mighty Aphrodite" || everything above)
//! ```
//!
//! Private keys use the Sun `KeyProtector` scheme: a SHA-1 keystream seeded
//! with a random salt, followed by a SHA-1 checksum of the plaintext key.

use openssl::error::ErrorStack;
use openssl::hash::{Hasher, MessageDigest};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const MAGIC: u32 = 0xFEED_FEED;
const VERSION: u32 = 2;
const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;
const CERT_TYPE: &str = "X.509";
const INTEGRITY_WHITENER: &[u8] = b"Mighty Aphrodite";

const DIGEST_LEN: usize = 20;
const SALT_LEN: usize = 20;

// 1.3.6.1.4.1.42.2.17.1.1
const KEY_PROTECTOR_OID: &[u8] = &[0x2B, 0x06, 0x01, 0x04, 0x01, 0x2A, 0x02, 0x11, 0x01, 0x01];

const DER_SEQUENCE: u8 = 0x30;
const DER_OID: u8 = 0x06;
const DER_NULL: u8 = 0x05;
const DER_OCTET_STRING: u8 = 0x04;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("not a JKS keystore (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported keystore version {0}")]
    UnsupportedVersion(u32),

    #[error("keystore data is truncated")]
    Truncated,

    #[error("keystore integrity check failed (wrong password or corrupted file)")]
    IntegrityCheckFailed,

    #[error("key entry checksum mismatch (wrong key password or corrupted entry)")]
    KeyChecksumMismatch,

    #[error("unknown keystore entry tag {0}")]
    UnknownTag(u32),

    #[error("unsupported certificate type '{0}'")]
    UnsupportedCertificateType(String),

    #[error("malformed protected key: {0}")]
    MalformedKey(&'static str),

    #[error("alias '{0}' cannot be stored in a keystore")]
    InvalidAlias(String),

    #[error("keystore has no entry '{0}'")]
    MissingEntry(String),

    #[error("keystore entry '{0}' has an empty certificate chain")]
    EmptyChain(String),

    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),

    #[error("secure random source unavailable: {0}")]
    Randomness(#[from] rand::Error),
}

pub struct PrivateKeyEntry {
    pub alias: String,
    pub created_ms: u64,
    protected_key: Vec<u8>,
    pub chain: Vec<X509>,
}

impl PrivateKeyEntry {
    /// Recovers the private key, verifying the entry checksum.
    pub fn decrypt(&self, key_password: &str) -> Result<PKey<Private>, KeystoreError> {
        let plain = unprotect_key(&self.protected_key, key_password)?;
        Ok(PKey::private_key_from_pkcs8(&plain)?)
    }

    pub fn certificate(&self) -> Option<&X509> {
        self.chain.first()
    }
}

pub struct TrustedCertificateEntry {
    pub alias: String,
    pub created_ms: u64,
    pub certificate: X509,
}

pub enum KeystoreEntry {
    PrivateKey(PrivateKeyEntry),
    TrustedCertificate(TrustedCertificateEntry),
}

impl KeystoreEntry {
    pub fn alias(&self) -> &str {
        match self {
            KeystoreEntry::PrivateKey(entry) => &entry.alias,
            KeystoreEntry::TrustedCertificate(entry) => &entry.alias,
        }
    }
}

#[derive(Default)]
pub struct Keystore {
    entries: Vec<KeystoreEntry>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[KeystoreEntry] {
        &self.entries
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.entries.iter().map(KeystoreEntry::alias).collect()
    }

    /// Stores `key` under `alias`, replacing any previous entry of that name.
    pub fn set_private_key(
        &mut self,
        alias: &str,
        key: &PKeyRef<Private>,
        key_password: &str,
        chain: Vec<X509>,
    ) -> Result<(), KeystoreError> {
        let alias = normalize_alias(alias)?;
        if chain.is_empty() {
            return Err(KeystoreError::EmptyChain(alias));
        }
        let protected_key = protect_key(&key.private_key_to_pkcs8()?, key_password)?;
        self.replace(KeystoreEntry::PrivateKey(PrivateKeyEntry {
            alias,
            created_ms: now_ms(),
            protected_key,
            chain,
        }));
        Ok(())
    }

    pub fn set_trusted_certificate(
        &mut self,
        alias: &str,
        certificate: X509,
    ) -> Result<(), KeystoreError> {
        let alias = normalize_alias(alias)?;
        self.replace(KeystoreEntry::TrustedCertificate(TrustedCertificateEntry {
            alias,
            created_ms: now_ms(),
            certificate,
        }));
        Ok(())
    }

    /// Installs a signed certificate chain on an existing key entry, the way a
    /// CA reply is imported.
    pub fn set_certificate_chain(
        &mut self,
        alias: &str,
        chain: Vec<X509>,
    ) -> Result<(), KeystoreError> {
        let alias = normalize_alias(alias)?;
        if chain.is_empty() {
            return Err(KeystoreError::EmptyChain(alias));
        }
        let entry = self
            .entries
            .iter_mut()
            .find_map(|entry| match entry {
                KeystoreEntry::PrivateKey(key) if key.alias == alias => Some(key),
                _ => None,
            })
            .ok_or_else(|| KeystoreError::MissingEntry(alias.clone()))?;
        entry.chain = chain;
        Ok(())
    }

    pub fn private_key(&self, alias: &str) -> Option<&PrivateKeyEntry> {
        let alias = alias.to_lowercase();
        self.entries.iter().find_map(|entry| match entry {
            KeystoreEntry::PrivateKey(key) if key.alias == alias => Some(key),
            _ => None,
        })
    }

    pub fn trusted_certificate(&self, alias: &str) -> Option<&X509> {
        let alias = alias.to_lowercase();
        self.entries.iter().find_map(|entry| match entry {
            KeystoreEntry::TrustedCertificate(trusted) if trusted.alias == alias => {
                Some(&trusted.certificate)
            }
            _ => None,
        })
    }

    fn replace(&mut self, entry: KeystoreEntry) {
        self.entries.retain(|existing| existing.alias() != entry.alias());
        self.entries.push(entry);
    }

    pub fn to_bytes(&self, store_password: &str) -> Result<Vec<u8>, KeystoreError> {
        let mut out = Vec::new();
        put_u32(&mut out, MAGIC);
        put_u32(&mut out, VERSION);
        put_u32(&mut out, self.entries.len() as u32);

        for entry in &self.entries {
            match entry {
                KeystoreEntry::PrivateKey(key) => {
                    put_u32(&mut out, TAG_PRIVATE_KEY);
                    put_utf(&mut out, &key.alias)?;
                    put_u64(&mut out, key.created_ms);
                    put_bytes(&mut out, &key.protected_key);
                    put_u32(&mut out, key.chain.len() as u32);
                    for cert in &key.chain {
                        put_certificate(&mut out, cert)?;
                    }
                }
                KeystoreEntry::TrustedCertificate(trusted) => {
                    put_u32(&mut out, TAG_TRUSTED_CERT);
                    put_utf(&mut out, &trusted.alias)?;
                    put_u64(&mut out, trusted.created_ms);
                    put_certificate(&mut out, &trusted.certificate)?;
                }
            }
        }

        let digest = integrity_digest(store_password, &out)?;
        out.extend_from_slice(&digest);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8], store_password: &str) -> Result<Self, KeystoreError> {
        if bytes.len() < DIGEST_LEN {
            return Err(KeystoreError::Truncated);
        }
        let (body, stored_digest) = bytes.split_at(bytes.len() - DIGEST_LEN);

        let mut reader = Reader::new(body);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(KeystoreError::BadMagic(magic));
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(KeystoreError::UnsupportedVersion(version));
        }

        if integrity_digest(store_password, body)?.as_slice() != stored_digest {
            return Err(KeystoreError::IntegrityCheckFailed);
        }

        let count = reader.u32()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let tag = reader.u32()?;
            let alias = reader.utf()?;
            let created_ms = reader.u64()?;
            let entry = match tag {
                TAG_PRIVATE_KEY => {
                    let protected_key = reader.bytes()?.to_vec();
                    let chain_len = reader.u32()?;
                    let mut chain = Vec::new();
                    for _ in 0..chain_len {
                        chain.push(reader.certificate()?);
                    }
                    KeystoreEntry::PrivateKey(PrivateKeyEntry {
                        alias,
                        created_ms,
                        protected_key,
                        chain,
                    })
                }
                TAG_TRUSTED_CERT => KeystoreEntry::TrustedCertificate(TrustedCertificateEntry {
                    alias,
                    created_ms,
                    certificate: reader.certificate()?,
                }),
                other => return Err(KeystoreError::UnknownTag(other)),
            };
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Exports one key entry with its chain as a PKCS#12 archive.
    pub fn to_pkcs12(
        &self,
        alias: &str,
        key_password: &str,
        pkcs12_password: &str,
    ) -> Result<Vec<u8>, KeystoreError> {
        let entry = self
            .private_key(alias)
            .ok_or_else(|| KeystoreError::MissingEntry(alias.to_string()))?;
        let key = entry.decrypt(key_password)?;
        let (leaf, rest) = entry
            .chain
            .split_first()
            .ok_or_else(|| KeystoreError::EmptyChain(entry.alias.clone()))?;

        let mut builder = Pkcs12::builder();
        builder.name(&entry.alias).pkey(&key).cert(leaf);
        if !rest.is_empty() {
            let mut ca = Stack::new()?;
            for cert in rest {
                ca.push(cert.clone())?;
            }
            builder.ca(ca);
        }

        Ok(builder.build2(pkcs12_password)?.to_der()?)
    }
}

/// Pulls the private key out of a PKCS#12 archive.
pub fn private_key_from_pkcs12(der: &[u8], password: &str) -> Result<PKey<Private>, KeystoreError> {
    let parsed = Pkcs12::from_der(der)?.parse2(password)?;
    parsed
        .pkey
        .ok_or_else(|| KeystoreError::MissingEntry("private key".to_string()))
}

fn normalize_alias(alias: &str) -> Result<String, KeystoreError> {
    // BMP characters without NUL encode identically in Java's modified UTF-8
    if alias.is_empty() || alias.chars().any(|c| c == '\0' || (c as u32) > 0xFFFF) {
        return Err(KeystoreError::InvalidAlias(alias.to_string()));
    }
    Ok(alias.to_lowercase())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn password_bytes(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

fn sha1(parts: &[&[u8]]) -> Result<[u8; DIGEST_LEN], ErrorStack> {
    let mut hasher = Hasher::new(MessageDigest::sha1())?;
    for part in parts {
        hasher.update(part)?;
    }
    let digest = hasher.finish()?;
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

fn integrity_digest(password: &str, body: &[u8]) -> Result<[u8; DIGEST_LEN], ErrorStack> {
    sha1(&[password_bytes(password).as_slice(), INTEGRITY_WHITENER, body])
}

fn key_stream(password: &[u8], salt: &[u8], len: usize) -> Result<Vec<u8>, ErrorStack> {
    let mut stream = Vec::with_capacity(len + DIGEST_LEN);
    let mut digest = salt.to_vec();
    while stream.len() < len {
        digest = sha1(&[password, digest.as_slice()])?.to_vec();
        stream.extend_from_slice(&digest);
    }
    stream.truncate(len);
    Ok(stream)
}

fn protect_key(plain: &[u8], key_password: &str) -> Result<Vec<u8>, KeystoreError> {
    let password = password_bytes(key_password);
    let mut salt = [0u8; SALT_LEN];
    OsRng.try_fill_bytes(&mut salt)?;

    let stream = key_stream(&password, &salt, plain.len())?;
    let mut protected = Vec::with_capacity(SALT_LEN + plain.len() + DIGEST_LEN);
    protected.extend_from_slice(&salt);
    protected.extend(plain.iter().zip(&stream).map(|(p, k)| p ^ k));
    let checksum = sha1(&[password.as_slice(), plain])?;
    protected.extend_from_slice(&checksum);

    Ok(encode_encrypted_key_info(&protected))
}

fn unprotect_key(encoded: &[u8], key_password: &str) -> Result<Vec<u8>, KeystoreError> {
    let protected = decode_encrypted_key_info(encoded)?;
    if protected.len() <= SALT_LEN + DIGEST_LEN {
        return Err(KeystoreError::MalformedKey("protected key too short"));
    }

    let password = password_bytes(key_password);
    let (salt, rest) = protected.split_at(SALT_LEN);
    let (encrypted, checksum) = rest.split_at(rest.len() - DIGEST_LEN);

    let stream = key_stream(&password, salt, encrypted.len())?;
    let plain: Vec<u8> = encrypted.iter().zip(&stream).map(|(e, k)| e ^ k).collect();

    if sha1(&[password.as_slice(), plain.as_slice()])?.as_slice() != checksum {
        return Err(KeystoreError::KeyChecksumMismatch);
    }
    Ok(plain)
}

fn encode_encrypted_key_info(protected: &[u8]) -> Vec<u8> {
    let mut algorithm = der_tlv(DER_OID, KEY_PROTECTOR_OID);
    algorithm.extend(der_tlv(DER_NULL, &[]));
    let mut body = der_tlv(DER_SEQUENCE, &algorithm);
    body.extend(der_tlv(DER_OCTET_STRING, protected));
    der_tlv(DER_SEQUENCE, &body)
}

fn decode_encrypted_key_info(encoded: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let mut outer = DerReader::new(encoded);
    let mut info = DerReader::new(outer.element(DER_SEQUENCE)?);
    let mut algorithm = DerReader::new(info.element(DER_SEQUENCE)?);
    if algorithm.element(DER_OID)? != KEY_PROTECTOR_OID {
        return Err(KeystoreError::MalformedKey("unsupported key protection algorithm"));
    }
    Ok(info.element(DER_OCTET_STRING)?.to_vec())
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let len_bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|&b| b == 0)
            .collect();
        out.push(0x80 | len_bytes.len() as u8);
        out.extend(len_bytes);
    }
    out.extend_from_slice(content);
    out
}

struct DerReader<'a> {
    data: &'a [u8],
}

impl<'a> DerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KeystoreError> {
        if self.data.len() < n {
            return Err(KeystoreError::MalformedKey("truncated DER"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn element(&mut self, tag: u8) -> Result<&'a [u8], KeystoreError> {
        if self.take(1)?[0] != tag {
            return Err(KeystoreError::MalformedKey("unexpected DER tag"));
        }
        let first = self.take(1)?[0];
        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > std::mem::size_of::<usize>() {
                return Err(KeystoreError::MalformedKey("unsupported DER length"));
            }
            self.take(count)?
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize)
        };
        self.take(len)
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn put_utf(out: &mut Vec<u8>, value: &str) -> Result<(), KeystoreError> {
    let len = u16::try_from(value.len())
        .map_err(|_| KeystoreError::InvalidAlias(value.to_string()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_certificate(out: &mut Vec<u8>, cert: &X509) -> Result<(), KeystoreError> {
    put_utf(out, CERT_TYPE)?;
    put_bytes(out, &cert.to_der()?);
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KeystoreError> {
        if self.data.len() < n {
            return Err(KeystoreError::Truncated);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, KeystoreError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32, KeystoreError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, KeystoreError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8], KeystoreError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn utf(&mut self) -> Result<String, KeystoreError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| KeystoreError::InvalidAlias(String::from_utf8_lossy(raw).into_owned()))
    }

    fn certificate(&mut self) -> Result<X509, KeystoreError> {
        let cert_type = self.utf()?;
        if cert_type != CERT_TYPE {
            return Err(KeystoreError::UnsupportedCertificateType(cert_type));
        }
        Ok(X509::from_der(self.bytes()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateProfile;
    use crate::secrets::x509;

    fn test_identity() -> (PKey<Private>, X509) {
        let mut profile = CertificateProfile::default_ca();
        profile.key_bits = 1024;
        let key = x509::generate_rsa(profile.key_bits).unwrap();
        let cert = x509::self_signed_ca(&key, &profile).unwrap();
        (key, cert)
    }

    #[test]
    fn test_header_and_digest_layout() {
        let store = Keystore::new();
        let bytes = store.to_bytes("changeit").unwrap();
        assert_eq!(&bytes[..4], &[0xFE, 0xED, 0xFE, 0xED]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(bytes.len(), 12 + DIGEST_LEN);
    }

    #[test]
    fn test_private_key_entry_survives_reload() {
        let (key, cert) = test_identity();
        let mut store = Keystore::new();
        store
            .set_private_key("Projector", &key, "keypass", vec![cert.clone()])
            .unwrap();
        store.set_trusted_certificate("ca", cert.clone()).unwrap();

        let bytes = store.to_bytes("storepass").unwrap();
        let loaded = Keystore::from_bytes(&bytes, "storepass").unwrap();

        let mut aliases = loaded.aliases();
        aliases.sort();
        assert_eq!(aliases, vec!["ca", "projector"]);

        let entry = loaded.private_key("projector").unwrap();
        let decrypted = entry.decrypt("keypass").unwrap();
        assert!(decrypted.public_eq(&key));
        assert_eq!(
            entry.certificate().unwrap().to_der().unwrap(),
            cert.to_der().unwrap()
        );
        assert!(loaded.trusted_certificate("CA").is_some());
    }

    #[test]
    fn test_wrong_store_password_fails_integrity() {
        let store = Keystore::new();
        let bytes = store.to_bytes("right").unwrap();
        assert!(matches!(
            Keystore::from_bytes(&bytes, "wrong"),
            Err(KeystoreError::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_wrong_key_password_fails_checksum() {
        let (key, cert) = test_identity();
        let mut store = Keystore::new();
        store.set_private_key("k", &key, "right", vec![cert]).unwrap();
        let entry = store.private_key("k").unwrap();
        assert!(matches!(
            entry.decrypt("wrong"),
            Err(KeystoreError::KeyChecksumMismatch)
        ));
    }

    #[test]
    fn test_corrupted_and_truncated_input() {
        assert!(matches!(
            Keystore::from_bytes(&[0u8; 4], "x"),
            Err(KeystoreError::Truncated)
        ));

        let mut bytes = Keystore::new().to_bytes("x").unwrap();
        bytes[0] = 0xCE;
        assert!(matches!(
            Keystore::from_bytes(&bytes, "x"),
            Err(KeystoreError::BadMagic(_))
        ));
    }

    #[test]
    fn test_set_certificate_chain_requires_key_entry() {
        let (key, cert) = test_identity();
        let mut store = Keystore::new();
        assert!(matches!(
            store.set_certificate_chain("missing", vec![cert.clone()]),
            Err(KeystoreError::MissingEntry(_))
        ));

        store.set_private_key("k", &key, "pw", vec![cert.clone()]).unwrap();
        store
            .set_certificate_chain("k", vec![cert.clone(), cert])
            .unwrap();
        assert_eq!(store.private_key("k").unwrap().chain.len(), 2);
    }

    #[test]
    fn test_pkcs12_export_and_key_extraction() {
        let (key, cert) = test_identity();
        let mut store = Keystore::new();
        store.set_private_key("ca", &key, "pw", vec![cert]).unwrap();

        let der = store.to_pkcs12("ca", "pw", "p12pass").unwrap();
        let extracted = private_key_from_pkcs12(&der, "p12pass").unwrap();
        assert!(extracted.public_eq(&key));
        assert!(private_key_from_pkcs12(&der, "bad").is_err());
    }

    #[test]
    fn test_der_long_lengths() {
        let content = vec![0xAB; 300];
        let encoded = der_tlv(DER_OCTET_STRING, &content);
        assert_eq!(&encoded[..4], &[DER_OCTET_STRING, 0x82, 0x01, 0x2C]);
        let mut reader = DerReader::new(&encoded);
        assert_eq!(reader.element(DER_OCTET_STRING).unwrap(), content.as_slice());
    }

    #[test]
    fn test_rejects_invalid_alias() {
        let (_, cert) = test_identity();
        let mut store = Keystore::new();
        assert!(store.set_trusted_certificate("", cert).is_err());
    }
}
