//! Block scanning for the custody engine.
//!
//! # Key Components
//!
//! - [`Scanner`]: cursor-driven block folding with reorg detection
//! - [`Classifier`]: tags decoded records normal/unexpected/internal/special
//! - [`ScanHalt`]: latch that stops scanning after an unrecoverable reorg

pub mod classifier;
pub mod error;
pub mod halt;
pub mod scanner;

pub use classifier::{Classifier, Discard};
pub use error::{ScanError, ScanResult};
pub use halt::ScanHalt;
pub use scanner::{ScanReport, Scanner, ScannerConfig};
