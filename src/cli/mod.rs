//! CLI module
//!
//! Command-line interface for exercising a tracker by hand.

pub mod args;
pub mod config;

pub use args::{CliArgs, Command, EventArg};
pub use config::{Config, Operation};
