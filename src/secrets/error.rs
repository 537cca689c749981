use openssl::error::ErrorStack;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::keystore::KeystoreError;
use crate::config::validation::ValidationError;

/// Which set of artifacts an operation was working on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Installation,
    RunConfig(String),
}

impl Scope {
    pub fn run_config(name: impl Into<String>) -> Self {
        Scope::RunConfig(name.into())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Installation => f.write_str("installation CA"),
            Scope::RunConfig(name) => write!(f, "run config '{name}'"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Invalid run config: {0}")]
    InvalidRunConfig(#[from] ValidationError),

    #[error("{step} failed for {scope}: {source}")]
    Crypto {
        step: &'static str,
        scope: Scope,
        source: ErrorStack,
    },

    #[error("{step} failed for {scope} at {}: {source}", path.display())]
    Io {
        step: &'static str,
        scope: Scope,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{step} failed for {scope}: {source}")]
    Keystore {
        step: &'static str,
        scope: Scope,
        source: KeystoreError,
    },

    #[error("Secure random source unavailable: {0}")]
    Randomness(#[from] rand::Error),

    #[error("Timed out after {waited_ms}ms waiting for CA lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("CA is missing or incomplete under {}", dir.display())]
    CaMissing { dir: PathBuf },

    #[error("{step} failed for {scope}: {reason}")]
    Invalid {
        step: &'static str,
        scope: Scope,
        reason: String,
    },
}

/// Attaches the failing step and scope to lower level errors.
pub trait StepContext<T> {
    fn step(self, step: &'static str, scope: &Scope) -> Result<T, SecretsError>;
}

impl<T> StepContext<T> for Result<T, ErrorStack> {
    fn step(self, step: &'static str, scope: &Scope) -> Result<T, SecretsError> {
        self.map_err(|source| SecretsError::Crypto {
            step,
            scope: scope.clone(),
            source,
        })
    }
}

impl<T> StepContext<T> for Result<T, KeystoreError> {
    fn step(self, step: &'static str, scope: &Scope) -> Result<T, SecretsError> {
        self.map_err(|source| SecretsError::Keystore {
            step,
            scope: scope.clone(),
            source,
        })
    }
}

/// I/O errors additionally carry the path they were about.
pub trait IoContext<T> {
    fn io_step(
        self,
        step: &'static str,
        scope: &Scope,
        path: impl Into<PathBuf>,
    ) -> Result<T, SecretsError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_step(
        self,
        step: &'static str,
        scope: &Scope,
        path: impl Into<PathBuf>,
    ) -> Result<T, SecretsError> {
        self.map_err(|source| SecretsError::Io {
            step,
            scope: scope.clone(),
            path: path.into(),
            source,
        })
    }
}
