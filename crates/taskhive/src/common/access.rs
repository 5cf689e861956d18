use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use orion::aead::SecretKey;
use serde::{Deserialize, Serialize};

/// Where a running server can be reached, stored in a file for workers and clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub version: String,
    pub server_uid: String,
    pub host: String,
    pub worker_port: u16,
    pub client_port: u16,
    /// Hex encoded key; missing when authentication is disabled
    pub secret_key: Option<String>,
}

impl AccessRecord {
    pub fn worker_address(&self) -> String {
        format!("{}:{}", self.host, self.worker_port)
    }

    pub fn client_address(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn secret_key(&self) -> anyhow::Result<Option<Arc<SecretKey>>> {
        self.secret_key.as_deref().map(parse_secret_key).transpose()
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("Cannot write access file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read access file {}", path.display()))?;
        let record: AccessRecord = serde_json::from_str(&data)
            .with_context(|| format!("Invalid access file {}", path.display()))?;
        if record.version != crate::TASKHIVE_VERSION {
            anyhow::bail!(
                "Access file was written by version {}, this is version {}",
                record.version,
                crate::TASKHIVE_VERSION
            );
        }
        Ok(record)
    }
}

pub fn parse_secret_key(value: &str) -> anyhow::Result<Arc<SecretKey>> {
    let bytes = hex::decode(value.trim()).context("Secret key is not a valid hex string")?;
    let key = SecretKey::from_slice(&bytes)
        .map_err(|_| anyhow::anyhow!("Secret key has an invalid length"))?;
    Ok(Arc::new(key))
}

pub fn serialize_secret_key(key: &SecretKey) -> String {
    hex::encode(key.unprotected_as_bytes())
}
