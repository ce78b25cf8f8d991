//! Registry error types.

use thiserror::Error;

use custody_core::{AddressRole, CoreError, SystemAddressKind};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Address not registered: {coin_name}/{address}")]
    UnknownAddress { coin_name: String, address: String },

    #[error("Address {address} already registered for {coin_name} as {existing}")]
    AddressConflict {
        coin_name: String,
        address: String,
        existing: AddressRole,
    },

    #[error("No {kind:?} address configured for {coin_name}")]
    SystemAddressUnavailable {
        coin_name: String,
        kind: SystemAddressKind,
    },

    #[error("Key material not loaded")]
    KeyNotLoaded,

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid key hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
