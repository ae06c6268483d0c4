//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`dropline.toml` by default, `--conf` to override)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{EngineConfig, DEFAULT_RENDEZVOUS_URL};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "dropline.toml";

/// Dropline - peer-to-peer file transfer over WebRTC data channels.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// WebSocket URL of the rendezvous relay.
    #[clap(long)]
    pub rendezvous: Option<String>,

    /// Room to join. Without it the relay creates a new room.
    #[clap(long)]
    pub room: Option<String>,

    /// Address-discovery server (stun:/turn: URL). Repeatable; order is kept.
    #[clap(long = "ice")]
    #[serde(default)]
    pub ice: Vec<String>,

    /// Directory received files are saved into.
    #[clap(long)]
    pub out: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(default)]
    pub verbose: u8,

    /// Configuration file. Defaults to ./dropline.toml when present.
    #[clap(long)]
    #[serde(skip)]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    #[serde(skip)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Send one or more files to the first peer that joins the room.
    Send {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Wait for a peer and save every file it sends.
    Receive,
}

impl Default for Command {
    fn default() -> Self {
        Self::Receive
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let cli_args = Args::parse();

        let path = cli_args
            .conf
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        // An explicit --conf must exist; the default file is optional.
        if cli_args.conf.is_none() && !path.exists() {
            return Ok(cli_args);
        }
        let file_args = Self::from_file(&path)?;
        Ok(Self::merge(file_args, cli_args))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str::<Args>(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.rendezvous.is_some() {
            file.rendezvous = cli.rendezvous;
        }
        if cli.room.is_some() {
            file.room = cli.room;
        }
        if !cli.ice.is_empty() {
            file.ice = cli.ice;
        }
        if cli.out.is_some() {
            file.out = cli.out;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        file.conf = cli.conf;
        file.command = cli.command;
        file
    }

    pub fn rendezvous_url(&self) -> &str {
        self.rendezvous.as_deref().unwrap_or(DEFAULT_RENDEZVOUS_URL)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::with_ice_servers(self.ice.clone())
    }

    pub fn out_dir(&self) -> PathBuf {
        self.out.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}
