//! Command line surface for the `redjam` binary

pub mod commands;
pub mod error;

pub use error::CliError;
