use super::{AppConfig, CertificateProfile, LockConfig, RunConfig};
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::net::IpAddr;

/// Configuration validation errors with helpful messages
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Run config name '{name}' is invalid: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Run config '{name}' is defined more than once")]
    DuplicateName { name: String },

    #[error("Run config '{name}' has an empty token")]
    EmptyToken { name: String },

    #[error("Run config '{name}' has an invalid token: {reason}")]
    InvalidToken { name: String, reason: String },

    #[error("Invalid host address '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("Invalid {profile} profile: {reason}")]
    InvalidProfile { profile: String, reason: String },

    #[error("Invalid lock setting {field}: {reason}")]
    InvalidLock { field: String, reason: String },
}

const MIN_KEY_BITS: u32 = 1024;
// Characters with meaning in a Java properties file
const PROPERTIES_METACHARS: &[char] = &['=', ':', '\\', '#', '!'];
const MAX_KEY_BITS: u32 = 16384;

/// Validates the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    validate_profile(&config.secrets.ca, "ca")?;
    validate_profile(&config.secrets.projector, "projector")?;
    validate_profile(&config.secrets.http, "http")?;
    validate_lock(&config.secrets.lock)?;

    let mut seen = HashSet::new();
    // Tokens may still be missing here, they are filled in after loading
    for run_config in &config.run_configs {
        validate_name(&run_config.name)?;
        validate_host(&run_config.http_address)?;
        if !run_config.token.is_empty() {
            validate_token(&run_config.name, &run_config.token)?;
        }
        if !seen.insert(run_config.name.as_str()) {
            bail!(ValidationError::DuplicateName {
                name: run_config.name.clone(),
            });
        }
    }

    Ok(())
}

/// Validates a single run config as handed over by the caller
pub fn validate_run_config(run_config: &RunConfig) -> Result<(), ValidationError> {
    validate_name(&run_config.name)?;
    validate_token(&run_config.name, &run_config.token)?;
    validate_host(&run_config.http_address)
}

/// Tokens end up verbatim in `ssl.properties`, one per line
pub fn validate_token(name: &str, token: &str) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidToken {
        name: name.to_string(),
        reason,
    };

    if token.is_empty() {
        return Err(ValidationError::EmptyToken {
            name: name.to_string(),
        });
    }
    if let Some(c) = token.chars().find(|c| c.is_control() || c.is_whitespace()) {
        return Err(invalid(format!(
            "contains whitespace or control character {:?}",
            c
        )));
    }
    if let Some(c) = token.chars().find(|c| PROPERTIES_METACHARS.contains(c)) {
        return Err(invalid(format!("contains reserved character '{}'", c)));
    }

    Ok(())
}

/// Names become directory names, so anything path-like is rejected
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name cannot be a relative directory"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("name cannot contain path separators"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name cannot contain control characters"));
    }

    Ok(())
}

/// Validates host address format
pub fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Err(ValidationError::InvalidHost {
            host: host.to_string(),
            reason: "host cannot be empty".to_string(),
        });
    }

    if host.contains(' ') {
        return Err(ValidationError::InvalidHost {
            host: host.to_string(),
            reason: "host cannot contain spaces".to_string(),
        });
    }

    if parse_ip_literal(host).is_some() {
        return Ok(());
    }

    validate_hostname(host)
}

/// Parses an IPv4 or IPv6 literal, accepting the bracketed `[::1]` form
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse::<IpAddr>().ok()
}

/// Validates hostname format (basic rules)
fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    if hostname.len() > 253 {
        return Err(ValidationError::InvalidHost {
            host: hostname.to_string(),
            reason: "hostname cannot exceed 253 characters".to_string(),
        });
    }

    for c in hostname.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' {
            return Err(ValidationError::InvalidHost {
                host: hostname.to_string(),
                reason: format!("hostname contains invalid character '{}'", c),
            });
        }
    }

    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err(ValidationError::InvalidHost {
            host: hostname.to_string(),
            reason: "hostname cannot start or end with dash".to_string(),
        });
    }

    Ok(())
}

fn validate_profile(profile: &CertificateProfile, name: &str) -> Result<()> {
    let invalid = |reason: String| ValidationError::InvalidProfile {
        profile: name.to_string(),
        reason,
    };

    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&profile.key_bits) {
        bail!(invalid(format!(
            "key_bits {} must be between {MIN_KEY_BITS} and {MAX_KEY_BITS}",
            profile.key_bits
        )));
    }

    if profile.validity_days == 0 {
        bail!(invalid("validity_days cannot be 0".to_string()));
    }

    let dn = &profile.distinguished_name;
    if dn.common_name.is_empty() {
        bail!(invalid("common_name cannot be empty".to_string()));
    }
    if dn.country.len() != 2 || !dn.country.chars().all(|c| c.is_ascii_alphabetic()) {
        bail!(invalid(format!(
            "country '{}' must be a two-letter code",
            dn.country
        )));
    }

    Ok(())
}

fn validate_lock(lock: &LockConfig) -> Result<()> {
    if lock.retry_interval_ms == 0 {
        bail!(ValidationError::InvalidLock {
            field: "retry_interval_ms".to_string(),
            reason: "cannot be 0".to_string(),
        });
    }
    if lock.timeout_ms < lock.retry_interval_ms {
        bail!(ValidationError::InvalidLock {
            field: "timeout_ms".to_string(),
            reason: "must be at least retry_interval_ms".to_string(),
        });
    }
    Ok(())
}
