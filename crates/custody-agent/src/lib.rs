//! Multi-chain custody reconciliation agent.
//!
//! Wires the engine crates into a runnable service:
//! - [`AppConfig`]: TOML + environment configuration
//! - [`LedgerClient`]: host-facing operations of one chain
//! - [`Application`]: one round-driven task per chain, graceful shutdown

pub mod app;
pub mod client;
pub mod config;
pub mod error;

pub use app::{Application, ChainRuntime};
pub use client::{ClientHooks, LedgerClient, NoopClientHooks, EXPORTED_METHODS};
pub use config::{AppConfig, ChainConfig, CoinConfig, KeyConfig};
pub use error::{AppError, AppResult};
