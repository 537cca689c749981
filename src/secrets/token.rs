use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::fmt;

use super::error::SecretsError;

pub const TOKEN_LEN: usize = 20;

/// Password protecting a run config's keystores.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

// Keep secrets out of debug logs
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Generates the access token for a run config.
pub fn generate_token() -> Result<Token, SecretsError> {
    generate_secret(TOKEN_LEN).map(Token)
}

/// Draws `len` characters uniformly from `[A-Za-z0-9]` using the OS random source.
pub fn generate_secret(len: usize) -> Result<String, SecretsError> {
    // `sample_iter` panics on RNG failure, so surface it as an error first
    let mut preflight = [0u8; 1];
    OsRng.try_fill_bytes(&mut preflight)?;

    Ok(OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect())
}
