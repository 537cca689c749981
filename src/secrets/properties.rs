use std::path::{Path, PathBuf};

use super::artifacts::write_secret_file;
use super::error::{Scope, SecretsError};

pub const STORE_TYPE_JKS: &str = "JKS";

/// Keystore settings the server reads at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslProperties {
    pub store_type: String,
    pub file_path: PathBuf,
    pub store_password: String,
    pub key_password: String,
}

impl SslProperties {
    pub fn for_keystore(keystore: &Path, token: &str) -> Self {
        Self {
            store_type: STORE_TYPE_JKS.to_string(),
            file_path: keystore.to_path_buf(),
            store_password: token.to_string(),
            key_password: token.to_string(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "STORE_TYPE={}\nFILE_PATH={}\nSTORE_PASSWORD={}\nKEY_PASSWORD={}\n",
            self.store_type,
            self.file_path.display(),
            self.store_password,
            self.key_password
        )
    }

    /// Parses the four-line format back; unknown keys are ignored.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut store_type = None;
        let mut file_path = None;
        let mut store_password = None;
        let mut key_password = None;

        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "STORE_TYPE" => store_type = Some(value.to_string()),
                "FILE_PATH" => file_path = Some(PathBuf::from(value)),
                "STORE_PASSWORD" => store_password = Some(value.to_string()),
                "KEY_PASSWORD" => key_password = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Self {
            store_type: store_type?,
            file_path: file_path?,
            store_password: store_password?,
            key_password: key_password?,
        })
    }
}

/// Writes `ssl.properties`, always replacing the previous file.
pub fn write_ssl_properties(
    path: &Path,
    keystore: &Path,
    token: &str,
    scope: &Scope,
) -> Result<SslProperties, SecretsError> {
    let properties = SslProperties::for_keystore(keystore, token);
    write_secret_file(
        path,
        properties.render().as_bytes(),
        "write ssl.properties",
        scope,
    )?;
    Ok(properties)
}
