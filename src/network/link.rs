//! Link layer primitives
//!
//! `LinkOps` is the device table of the calling thread's ambient namespace:
//! creating bridges and veth pairs, addresses, administrative state, master
//! relations and routes. Backends implement it on top of `NetnsOps` so veth
//! creation can name the namespace the peer end is placed in.

use crate::error::{Error, Result};
use crate::network::netns::NetnsOps;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Kind of network device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Bridge,
    Veth,
    Loopback,
    Other(String),
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Bridge => write!(f, "bridge"),
            LinkKind::Veth => write!(f, "veth"),
            LinkKind::Loopback => write!(f, "loopback"),
            LinkKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// Snapshot of a network device
///
/// The index is only meaningful inside the namespace the snapshot was taken
/// in. A device moved to another namespace gets a new index, so snapshots are
/// re-fetched by name after any move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
    pub mtu: u32,
    pub up: bool,
    /// Name of the master device (bridge) this link is enslaved to
    pub master: Option<String>,
}

/// Device operations against the calling thread's ambient namespace
pub trait LinkOps: NetnsOps {
    /// Look up a device by name, `None` when it does not exist
    fn find_link(&self, name: &str) -> Result<Option<Link>>;

    /// Look up a device that must exist
    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.find_link(name)?
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    /// Create a bridge device
    ///
    /// Returns `Error::LinkExists` when a device with that name is present.
    fn add_bridge(&self, name: &str, mtu: u32) -> Result<()>;

    /// Create a veth pair whose `name` end stays here and whose peer is placed in `peer_ns`
    ///
    /// When `peer_name` is `None` the backend picks one. Returns the peer's name.
    fn add_veth(
        &self,
        name: &str,
        mtu: u32,
        peer_name: Option<&str>,
        peer_ns: &Self::Netns,
    ) -> Result<String>;

    /// Delete a device (deleting one veth end removes its peer too)
    fn del_link(&self, link: &Link) -> Result<()>;

    /// Assign an address; `Error::AddressExists` when the device already carries it
    fn addr_add(&self, link: &Link, addr: Ipv4Net) -> Result<()>;

    /// IPv4 addresses assigned to a device
    fn addr_list_v4(&self, link: &Link) -> Result<Vec<Ipv4Net>>;

    /// Set a device administratively up
    fn set_up(&self, link: &Link) -> Result<()>;

    /// Enslave `link` to `master`
    fn set_master(&self, link: &Link, master: &Link) -> Result<()>;

    /// Install a default route via `gateway` out of `link`
    fn add_default_route(&self, gateway: Ipv4Addr, link: &Link) -> Result<()>;
}

/// Check that `name` is usable as a Linux interface name
pub fn validate_ifname(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidInterfaceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    // IF_NAMESIZE includes the trailing NUL
    if name.len() >= libc::IF_NAMESIZE {
        return Err(invalid(&format!(
            "longer than {} characters",
            libc::IF_NAMESIZE - 1
        )));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved"));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(invalid("contains '/', ':' or whitespace"));
    }

    Ok(())
}

/// Random host-side veth name in the `vethXXXXXXXX` form
pub fn random_veth_name() -> String {
    format!("veth{:08x}", rand::random::<u32>())
}
