//! Key material for address derivation.
//!
//! Seeds are held in zeroizing buffers and never logged.

use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::error::{RegistryError, RegistryResult};

/// Where key material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Hex seed in an environment variable.
    EnvVar { var_name: String },
    /// Hex seed in a file (recommend 0600 permissions).
    File { path: PathBuf },
    /// Extended public key for watch-only derivation.
    PublicKey { value: String },
}

/// Loaded key material.
#[derive(Default)]
pub struct SeedVault {
    seed: Option<Zeroizing<Vec<u8>>>,
    public_key: Option<String>,
}

impl std::fmt::Debug for SeedVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedVault")
            .field("seed", &self.seed.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key)
            .finish()
    }
}

fn parse_hex_seed(hex_str: &str) -> RegistryResult<Zeroizing<Vec<u8>>> {
    let trimmed = hex_str.trim().trim_start_matches("0x");
    Ok(Zeroizing::new(hex::decode(trimmed)?))
}

impl SeedVault {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from the configured source.
    pub fn load(source: &KeySource) -> RegistryResult<Self> {
        match source {
            KeySource::EnvVar { var_name } => {
                let hex = Zeroizing::new(
                    std::env::var(var_name)
                        .map_err(|_| RegistryError::EnvVarNotFound(var_name.clone()))?,
                );
                Self::from_hex(&hex)
            }
            KeySource::File { path } => {
                let content = Zeroizing::new(std::fs::read_to_string(path)?);
                Self::from_hex(&content)
            }
            KeySource::PublicKey { value } => Ok(Self::from_public_key(value.clone())),
        }
    }

    pub fn from_hex(hex_seed: &str) -> RegistryResult<Self> {
        Ok(Self {
            seed: Some(parse_hex_seed(hex_seed)?),
            public_key: None,
        })
    }

    pub fn from_public_key(public_key: String) -> Self {
        Self {
            seed: None,
            public_key: Some(public_key),
        }
    }

    pub fn seed(&self) -> RegistryResult<&[u8]> {
        self.seed
            .as_deref()
            .map(Vec::as_slice)
            .ok_or(RegistryError::KeyNotLoaded)
    }

    pub fn public_key(&self) -> RegistryResult<&str> {
        self.public_key
            .as_deref()
            .ok_or(RegistryError::KeyNotLoaded)
    }

    /// Seed re-encoded as lowercase hex.
    pub fn seed_hex(&self) -> RegistryResult<Zeroizing<String>> {
        Ok(Zeroizing::new(hex::encode(self.seed()?)))
    }

    pub fn has_seed(&self) -> bool {
        self.seed.is_some()
    }
}
