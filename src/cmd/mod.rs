//! CLI command handlers

use clap::Subcommand;

pub mod root;
pub mod validate;

#[derive(Subcommand)]
pub enum Commands {
    /// Check the configuration file and print the resolved engine
    Validate,
}
