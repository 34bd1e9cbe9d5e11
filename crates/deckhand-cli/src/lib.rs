//! deckhand CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// deckhand - release validation, rendering and delivery
#[derive(Parser, Debug)]
#[command(name = "deckhand")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check versions, render the overlay and apply it to the cluster
    Deploy(commands::deploy::DeployArgs),
    /// Copy release images from a source registry into the target registry
    Import(commands::import::ImportArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Deploy(args) => commands::deploy::run(args).await,
            Commands::Import(args) => commands::import::run(args).await,
        }
    }
}
