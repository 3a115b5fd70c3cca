//! Linux link backend built on iproute2
//!
//! Runs `ip` for every link operation. A child process inherits the network
//! namespace of the thread that spawned it, so commands act on the ambient
//! namespace set through `NetnsOps`. Queries use `ip -j` and are parsed with
//! serde.

use crate::error::{Error, Result};
use crate::network::link::{Link, LinkKind, LinkOps, random_veth_name};
use crate::network::netns::{NetNs, NetnsOps};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// A failed `ip` invocation
#[derive(Debug)]
struct IpFailure {
    command: String,
    stderr: String,
}

impl IpFailure {
    fn exists(&self) -> bool {
        self.stderr.contains("File exists")
    }

    fn missing(&self) -> bool {
        self.stderr.contains("does not exist") || self.stderr.contains("Cannot find device")
    }

    fn into_error(self) -> Error {
        Error::CommandFailed {
            command: self.command,
            message: self.stderr,
        }
    }
}

/// `ip -j link show` entry
#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

impl From<IpLink> for Link {
    fn from(l: IpLink) -> Self {
        let kind = match (l.linkinfo.and_then(|i| i.info_kind), l.link_type.as_deref()) {
            (Some(k), _) if k == "bridge" => LinkKind::Bridge,
            (Some(k), _) if k == "veth" => LinkKind::Veth,
            (Some(k), _) => LinkKind::Other(k),
            (None, Some("loopback")) => LinkKind::Loopback,
            (None, Some(t)) => LinkKind::Other(t.to_string()),
            (None, None) => LinkKind::Other("unknown".to_string()),
        };
        Link {
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            index: l.ifindex,
            kind,
            mtu: l.mtu,
            master: l.master,
        }
    }
}

/// `ip -j addr show` entry
#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

/// Entries filtered out by `-4` show up as empty objects, hence the options.
#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    local: Option<Ipv4Addr>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

fn parse_links(json: &str) -> Result<Vec<Link>> {
    let links: Vec<IpLink> = serde_json::from_str(json)
        .map_err(|e| Error::Network(format!("Invalid 'ip -j link' output: {}", e)))?;
    Ok(links.into_iter().map(Link::from).collect())
}

fn parse_addrs_v4(json: &str) -> Result<Vec<Ipv4Net>> {
    let entries: Vec<IpAddrEntry> = serde_json::from_str(json)
        .map_err(|e| Error::Network(format!("Invalid 'ip -j addr' output: {}", e)))?;

    let mut addrs = Vec::new();
    for info in entries.into_iter().flat_map(|e| e.addr_info) {
        if info.family.as_deref() != Some("inet") {
            continue;
        }
        if let (Some(local), Some(prefix)) = (info.local, info.prefixlen) {
            let net = Ipv4Net::new(local, prefix)
                .map_err(|e| Error::Network(format!("Invalid prefix for {}: {}", local, e)))?;
            addrs.push(net);
        }
    }
    Ok(addrs)
}

/// Attempts at a random host veth name before giving up
const PEER_NAME_ATTEMPTS: u32 = 3;

/// Which end of a new veth pair collided with an existing device
#[derive(Debug, PartialEq, Eq)]
enum VethClash {
    Container,
    Peer,
    Retry,
}

fn veth_clash(container_taken: bool, peer_fixed: bool, attempt: u32) -> VethClash {
    if container_taken {
        VethClash::Container
    } else if peer_fixed || attempt >= PEER_NAME_ATTEMPTS {
        VethClash::Peer
    } else {
        VethClash::Retry
    }
}

/// Link backend that shells out to iproute2
#[derive(Debug, Clone)]
pub struct Iproute {
    program: PathBuf,
}

impl Default for Iproute {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl Iproute {
    /// Use `program` as the `ip` binary
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> std::result::Result<String, IpFailure> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        debug!(command = %command, "running ip");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| IpFailure {
                command: command.clone(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(IpFailure {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn exec(&self, args: &[&str]) -> Result<()> {
        self.run(args).map(|_| ()).map_err(IpFailure::into_error)
    }
}

impl NetnsOps for Iproute {
    type Netns = NetNs;

    fn current_netns(&self) -> Result<NetNs> {
        NetNs::current()
    }

    fn set_netns(&self, ns: &NetNs) -> Result<()> {
        ns.switch()
    }
}

impl LinkOps for Iproute {
    fn find_link(&self, name: &str) -> Result<Option<Link>> {
        match self.run(&["-j", "-d", "link", "show", "dev", name]) {
            Ok(out) => Ok(parse_links(&out)?.into_iter().find(|l| l.name == name)),
            Err(f) if f.missing() => Ok(None),
            Err(f) => Err(f.into_error()),
        }
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        let args: &[&str] = &[
            "link",
            "add",
            "name",
            name,
            "mtu",
            mtu.as_str(),
            "type",
            "bridge",
        ];
        match self.run(args) {
            Ok(_) => Ok(()),
            Err(f) if f.exists() => Err(Error::LinkExists(name.to_string())),
            Err(f) => Err(f.into_error()),
        }
    }

    fn add_veth(
        &self,
        name: &str,
        mtu: u32,
        peer_name: Option<&str>,
        peer_ns: &NetNs,
    ) -> Result<String> {
        let mtu = mtu.to_string();
        let peer_ns = peer_ns.fd_path();

        let mut attempt = 1;
        loop {
            let peer = peer_name.map(str::to_string).unwrap_or_else(random_veth_name);
            let args: &[&str] = &[
                "link",
                "add",
                "name",
                name,
                "mtu",
                mtu.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                peer.as_str(),
                "mtu",
                mtu.as_str(),
                "netns",
                peer_ns.as_str(),
            ];
            let failure = match self.run(args) {
                Ok(_) => return Ok(peer),
                Err(f) if f.exists() => f,
                Err(f) => return Err(f.into_error()),
            };

            // "File exists" does not say which end clashed
            let container_taken = self.find_link(name)?.is_some();
            match veth_clash(container_taken, peer_name.is_some(), attempt) {
                VethClash::Container => return Err(Error::LinkExists(name.to_string())),
                VethClash::Peer => return Err(Error::LinkExists(peer)),
                VethClash::Retry => {
                    debug!(
                        peer = %peer,
                        error = %failure.stderr,
                        "host veth name taken, retrying"
                    );
                    attempt += 1;
                }
            }
        }
    }

    fn del_link(&self, link: &Link) -> Result<()> {
        self.exec(&["link", "del", "dev", link.name.as_str()])
    }

    fn addr_add(&self, link: &Link, addr: Ipv4Net) -> Result<()> {
        let cidr = addr.to_string();
        match self.run(&["addr", "add", cidr.as_str(), "dev", link.name.as_str()]) {
            Ok(_) => Ok(()),
            Err(f) if f.exists() => Err(Error::AddressExists {
                address: cidr,
                interface: link.name.clone(),
            }),
            Err(f) => Err(f.into_error()),
        }
    }

    fn addr_list_v4(&self, link: &Link) -> Result<Vec<Ipv4Net>> {
        let out = self
            .run(&["-j", "-4", "addr", "show", "dev", link.name.as_str()])
            .map_err(IpFailure::into_error)?;
        parse_addrs_v4(&out)
    }

    fn set_up(&self, link: &Link) -> Result<()> {
        self.exec(&["link", "set", "dev", link.name.as_str(), "up"])
    }

    fn set_master(&self, link: &Link, master: &Link) -> Result<()> {
        let args: &[&str] = &[
            "link",
            "set",
            "dev",
            link.name.as_str(),
            "master",
            master.name.as_str(),
        ];
        self.exec(args)
    }

    fn add_default_route(&self, gateway: Ipv4Addr, link: &Link) -> Result<()> {
        let gw = gateway.to_string();
        let args: &[&str] = &[
            "route",
            "add",
            "default",
            "via",
            gw.as_str(),
            "dev",
            link.name.as_str(),
        ];
        self.exec(args)
    }
}
