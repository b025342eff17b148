//! Host agent that supervises a single QEMU virtual machine.

/// Lifecycle components and the agent that drives them.
pub mod core;

/// CLI argument parsing (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

mod config;
mod error;

pub use config::*;
pub use error::*;
