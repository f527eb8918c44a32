//! Clap CLI definitions for nanolink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  nanolink registry                          Run a discovery registry on 0.0.0.0:4345
  nanolink keygen                            Print a fresh encrypt/auth key pair
  nanolink register --registry 127.0.0.1:4345 --name chat-1 --type Chat --host 10.0.0.5 --port 6000
  nanolink lookup --registry 127.0.0.1:4345 --type Chat
  nanolink probe --host 10.0.0.5 --port 6000";

/// nanolink: framed, encrypted message channels with service discovery.
#[derive(Parser)]
#[command(name = "nanolink", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a discovery registry until Ctrl+C.
    Registry {
        /// Listen address (overrides `registry.listen_addr`).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Generate a base64 encryption/authentication key pair.
    Keygen {
        /// Output as TOML for the `[keys]` config section.
        #[arg(long)]
        toml: bool,
    },
    /// Advertise a service descriptor to a registry.
    Register {
        /// Registry address (host:port).
        #[arg(long)]
        registry: String,
        /// Unique service name.
        #[arg(long)]
        name: String,
        /// Service type.
        #[arg(long = "type")]
        service_type: String,
        /// Host the service listens on.
        #[arg(long)]
        host: String,
        /// Port the service listens on.
        #[arg(long)]
        port: u16,
        /// Register the descriptor already flagged as expired.
        #[arg(long)]
        expired: bool,
    },
    /// Query a registry's contents.
    Lookup {
        /// Registry address (host:port).
        #[arg(long)]
        registry: String,
        /// Only services of this type.
        #[arg(long = "type", conflicts_with = "name")]
        service_type: Option<String>,
        /// Only the service with this name.
        #[arg(long)]
        name: Option<String>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check whether a TCP endpoint accepts connections.
    Probe {
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
    },
}
