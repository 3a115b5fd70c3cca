//! bridgenet - attach container network namespaces to a host bridge
//!
//! Reads the bridge definition from `bridgenet.toml`, creates the bridge on
//! demand and manages one veth pair per container namespace.

mod cli;
mod logging;

use bridgenet::error::Result;
use bridgenet::manifest;
use bridgenet::network::{AttachmentRequest, BridgeManager, Iproute, NetNs, VethAttacher};
use cli::{Cli, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    // Commands that don't require config
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    logging::init(cli.verbose);

    let config = manifest::load(&cli.config)?;
    let links = Iproute::new(&config.runtime.ip_command);

    match cli.command {
        Commands::Bridge { json } => {
            let bridge = BridgeManager::new(&links).ensure(&config.bridge_spec())?;
            if json {
                println!("{}", to_json(&bridge)?);
            } else {
                println!(
                    "{} (index {}, mtu {}, {})",
                    bridge.name(),
                    bridge.link().index,
                    bridge.link().mtu,
                    if bridge.link().up { "up" } else { "down" }
                );
            }
        }

        Commands::Attach {
            netns,
            address,
            ifname,
            gateway,
            mtu,
            json,
        } => {
            let bridge = BridgeManager::new(&links).ensure(&config.bridge_spec())?;
            let request = AttachmentRequest::new(
                NetNs::open(&netns)?,
                bridge,
                ifname.unwrap_or_else(|| config.runtime.ifname.clone()),
                address,
                gateway.unwrap_or_else(|| config.bridge.gateway.addr()),
            )
            .with_mtu(mtu.unwrap_or(config.bridge.mtu));
            request.validate()?;

            let attachment = VethAttacher::new(&links).setup(&request)?;
            if json {
                println!("{}", to_json(&attachment)?);
            } else {
                println!(
                    "{} in {} <-> {} on {} ({} via {})",
                    attachment.container_interface,
                    netns.display(),
                    attachment.host_interface,
                    attachment.bridge,
                    attachment.address,
                    attachment.gateway
                );
            }
        }

        Commands::Detach { netns, ifname } => {
            let ifname = ifname.unwrap_or_else(|| config.runtime.ifname.clone());
            VethAttacher::new(&links).teardown(&NetNs::open(&netns)?, &ifname)?;
            println!("{} removed from {}", ifname, netns.display());
        }

        Commands::Check {
            netns,
            address,
            ifname,
        } => {
            let ifname = ifname.unwrap_or_else(|| config.runtime.ifname.clone());
            VethAttacher::new(&links).check(&NetNs::open(&netns)?, &ifname, address)?;
            println!("{} has {}", ifname, address);
        }

        Commands::Completion { .. } => {}
    }

    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
