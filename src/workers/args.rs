//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, or `sharenear.toml` if present)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{TransferConfig, WireFormat};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONFIG_FILE: &str = "sharenear.toml";
const DEFAULT_OUT_DIR: &str = "received";

/// Sharenear - send a file between two local peers over a data channel.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// File to send from alice to bob.
    pub file: PathBuf,

    /// Directory the received file is written to.
    #[clap(long)]
    pub out: Option<PathBuf>,

    /// Transport connecting the two peers (memory or webrtc) [default: memory].
    #[clap(long)]
    pub transport: Option<TransportOption>,

    /// Chunk framing on the data channel (split or framed).
    #[clap(long)]
    pub wire_format: Option<WireFormat>,

    /// Chunk size in bytes (1..=65536).
    #[clap(long)]
    pub chunk_size: Option<usize>,

    /// TOML configuration file.
    #[clap(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Session tunables, from the `[transfer]` table of the config file.
    #[clap(skip)]
    pub transfer: TransferConfig,
}

impl Args {
    /// Load Args from CLI + TOML file (if any).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let cli_args = Args::parse();

        let file_args = match &cli_args.config {
            Some(path) => Some(Self::from_file(path)?),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Some(Self::from_file(&default_path)?)
                } else {
                    None
                }
            }
        };

        Ok(match file_args {
            Some(file_args) => Self::merge(file_args, cli_args),
            None => cli_args,
        })
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Args>(content)?)
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        file.file = cli.file;
        if cli.out.is_some() {
            file.out = cli.out;
        }
        if cli.wire_format.is_some() {
            file.wire_format = cli.wire_format;
        }
        if cli.chunk_size.is_some() {
            file.chunk_size = cli.chunk_size;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.transport.is_some() {
            file.transport = cli.transport;
        }
        file.config = cli.config;
        file
    }

    pub fn transport(&self) -> TransportOption {
        self.transport.unwrap_or_default()
    }

    pub fn out_dir(&self) -> PathBuf {
        self.out
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR))
    }

    /// The session configuration with flag overrides applied, validated.
    pub fn transfer_config(&self) -> Result<TransferConfig> {
        let mut config = self.transfer.clone();
        if let Some(format) = self.wire_format {
            config.wire_format = format;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        config.validate().context("invalid transfer configuration")?;
        Ok(config)
    }
}

// ── Transport Option ──────────────────────────────────────────────────────────

/// Available command line options for the peer transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportOption {
    /// In-process transport, no network involved.
    #[default]
    Memory,
    /// Real WebRTC peer connections over loopback.
    Webrtc,
}

impl FromStr for TransportOption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "webrtc" => Ok(Self::Webrtc),
            other => bail!("unknown transport {other:?}, expected memory or webrtc"),
        }
    }
}

impl Display for TransportOption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Webrtc => f.write_str("webrtc"),
        }
    }
}
