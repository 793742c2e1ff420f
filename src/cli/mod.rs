//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hopscope",
    version,
    about = "Flow enrichment service: hop discovery and geolocation for network flows",
    long_about = "Hopscope consumes flow records from a message queue, classifies each flow as \
                  internal or external, traces the hops of flows that cross the network boundary, \
                  geolocates every address involved and republishes the augmented records."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/hopscope/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume flows from the inbound queue until interrupted
    Run,

    /// Trace the hops to a destination once and print them as JSON
    Trace {
        /// Destination address
        destination: String,

        /// Source address recorded on the output
        #[arg(short, long, default_value = "0.0.0.0")]
        from: String,
    },

    /// Geolocate a single address and print it as JSON
    Resolve {
        /// Address to geolocate
        address: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
