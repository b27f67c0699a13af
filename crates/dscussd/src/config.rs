//! Configuration surface for `dscussd`.
//!
//! TOML parsing of `<data_dir>/config` is an out-of-scope collaborator
//!: this module only defines the read-only snapshot type that
//! collaborator hands to [`crate::node::Node::init`], plus the `clap`
//! CLI surface for the one-shot subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8004;

/// Default dial-loop tick.
pub const DEFAULT_DIAL_TICK: Duration = Duration::from_secs(1);

/// Default TCP connect timeout, one of the two recognized `config` keys.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only settings snapshot passed into [`crate::node::Node::init`].
/// The out-of-scope config-file loader is responsible for producing one of
/// these from `<data_dir>/config`; this crate never parses that file
/// itself.
#[derive(Clone, Debug)]
pub struct NodeSettings {
    /// `network.port`, 1..=65535.
    pub port: u16,
    /// `network.connect_timeout`.
    pub connect_timeout: Duration,
    /// Dial-loop tick interval.
    pub dial_tick: Duration,
    /// Required leading-zero bits for proof-of-work validation.
    pub required_zero_bits: u32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_tick: DEFAULT_DIAL_TICK,
            required_zero_bits: dscuss_core::pow::DEFAULT_REQUIRED_ZERO_BITS,
        }
    }
}

impl NodeSettings {
    /// Sanity-check a settings snapshot before it reaches [`crate::node::Node`].
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("network.port must be nonzero");
        }
        if self.connect_timeout.is_zero() {
            anyhow::bail!("network.connect_timeout must be positive");
        }
        Ok(())
    }
}

/// The one-shot CLI surface. The interactive `>` prompt and line
/// dispatch loop are the out-of-scope REPL collaborator; this struct only
/// covers a single invocation of `dscussd`.
#[derive(Parser, Debug)]
#[command(
    name = "dscuss",
    version,
    about = "Dscuss peer-to-peer discussion node",
    disable_version_flag = true
)]
pub struct Cli {
    /// Data directory holding `<nickname>/{privkey.pem,db,subscriptions,addresses}`.
    #[arg(short = 'c', long = "config", default_value = "./dscuss-data")]
    pub data_dir: PathBuf,

    /// Print version and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a new local identity: runs proof-of-work, writes the
    /// keypair, and creates the local store.
    Register {
        nickname: String,
        /// Optional free-text bio.
        info: Option<String>,
    },
    /// Log in as an existing identity and run the node until interrupted.
    Login { nickname: String },
    /// Tear down the currently logged-in session. A no-op (with a warning)
    /// if nothing is logged in.
    Logout,
    /// List currently connected peers.
    Lspeer,
    /// Print help for a command, or the command list if none is given.
    Help { command: Option<String> },
}
