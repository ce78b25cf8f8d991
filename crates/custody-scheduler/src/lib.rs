//! Closer rounds for the custody engine.
//!
//! # Key Components
//!
//! - [`ChainRunner`]: drives scan, confirmation, sweep and settlement rounds
//! - [`RoundHooks`] / [`RoundEnvelope`]: business hooks with envelope invariants
//! - [`RulerData`]: versioned round state persisted between rounds
//! - [`Clock`]: injectable time source

pub mod clock;
pub mod error;
pub mod hooks;
pub mod ruler;
pub mod runner;

pub use clock::{Clock, SystemClock};
pub use error::{SchedulerError, SchedulerResult};
pub use hooks::{NoopRoundHooks, RoundEnvelope, RoundHooks};
pub use ruler::{RulerData, RULER_VERSION};
pub use runner::{ChainRunner, Checkpoint, CoinRound, RoundSummary, RunnerConfig};
