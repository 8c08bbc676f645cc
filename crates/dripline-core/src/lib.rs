//! # Dripline Core
//!
//! Shared pieces for every Dripline crate: the error taxonomy and the
//! TOML configuration loaded from `~/.dripline/config.toml`.

pub mod config;
pub mod error;

pub use config::DriplineConfig;
pub use error::{DriplineError, Result, TransitionError};
