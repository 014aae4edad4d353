//! # Flowkeeper Core
//!
//! Configuration and the shared error type used by the store, the scheduler
//! and the `flowkeeper` binary.

pub mod config;
pub mod error;

pub use config::FlowkeeperConfig;
pub use error::{FlowkeeperError, Result};
