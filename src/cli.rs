//! Command-line interface for bridgenet
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// bridgenet - attach container network namespaces to a host bridge
#[derive(Parser)]
#[command(name = "bridgenet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "bridgenet.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create the host bridge if it does not exist yet
    Bridge {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Attach a network namespace to the bridge with a veth pair
    Attach {
        /// Network namespace path (e.g. /var/run/netns/pod1)
        #[arg(short, long)]
        netns: PathBuf,

        /// Container address in CIDR notation (e.g., 10.1.1.2/24)
        #[arg(short, long)]
        address: Ipv4Net,

        /// Interface name inside the namespace (defaults to runtime.ifname)
        #[arg(short, long)]
        ifname: Option<String>,

        /// Default gateway (defaults to the bridge address)
        #[arg(short, long)]
        gateway: Option<Ipv4Addr>,

        /// MTU of the veth pair (defaults to bridge.mtu)
        #[arg(long)]
        mtu: Option<u32>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove the veth pair from a network namespace
    Detach {
        /// Network namespace path
        #[arg(short, long)]
        netns: PathBuf,

        /// Interface name inside the namespace (defaults to runtime.ifname)
        #[arg(short, long)]
        ifname: Option<String>,
    },

    /// Verify that an interface in a namespace carries an address
    Check {
        /// Network namespace path
        #[arg(short, long)]
        netns: PathBuf,

        /// Expected address
        #[arg(short, long)]
        address: Ipv4Addr,

        /// Interface name inside the namespace (defaults to runtime.ifname)
        #[arg(short, long)]
        ifname: Option<String>,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completions
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "bridgenet", &mut std::io::stdout());
    }
}
