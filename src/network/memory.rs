//! In-memory host network stack
//!
//! A model of a host with several network namespaces that implements
//! `NetnsOps` and `LinkOps` without touching the kernel. It reproduces the
//! behavior the attachment code depends on:
//!
//! - the ambient namespace is tracked per thread
//! - device indexes are allocated from one counter, so a device moved into
//!   another namespace always comes out with a different index
//! - operations resolve devices by index, so a stale snapshot taken before a
//!   move fails like it would against the kernel
//! - deleting one veth end deletes its peer
//!
//! Every link operation is recorded in a call log, and individual operations
//! can be made to fail.

use crate::error::{Error, Result};
use crate::network::link::{Link, LinkKind, LinkOps};
use crate::network::netns::NetnsOps;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Handle to a namespace of a `MemoryHost`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NsId(u32);

impl fmt::Display for NsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "netns:{}", self.0)
    }
}

/// The host (initial) namespace
pub const HOST_NETNS: NsId = NsId(0);

/// Link operations that can be observed and failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FindLink,
    AddBridge,
    AddVeth,
    DelLink,
    AddrAdd,
    AddrList,
    SetUp,
    SetMaster,
    AddRoute,
}

/// One recorded link operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub netns: NsId,
    pub name: String,
}

/// A device as stored by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
    pub mtu: u32,
    pub up: bool,
    pub master: Option<u32>,
    pub addrs: Vec<Ipv4Net>,
    /// Index the device was given when it was created
    pub created_index: u32,
    pair: Option<u64>,
}

/// A route as stored by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub device: u32,
}

#[derive(Debug, Default)]
struct Namespace {
    devices: BTreeMap<u32, Device>,
    routes: Vec<Route>,
}

impl Namespace {
    fn by_name(&self, name: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.name == name)
    }
}

#[derive(Debug, Default)]
struct State {
    namespaces: HashMap<NsId, Namespace>,
    ambient: HashMap<ThreadId, NsId>,
    next_netns: u32,
    next_index: u32,
    next_pair: u64,
    next_veth: u32,
    faults: HashSet<Op>,
    preempt_bridges: HashSet<String>,
    lose_next_peer: bool,
    calls: Vec<Call>,
}

impl State {
    fn alloc_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn ambient(&self) -> NsId {
        self.ambient
            .get(&thread::current().id())
            .copied()
            .unwrap_or(HOST_NETNS)
    }

    fn record(&mut self, op: Op, name: &str) -> Result<NsId> {
        let netns = self.ambient();
        self.calls.push(Call {
            op,
            netns,
            name: name.to_string(),
        });
        if self.faults.contains(&op) {
            return Err(Error::Network(format!("injected {:?} failure on '{}'", op, name)));
        }
        Ok(netns)
    }

    fn namespace(&mut self, netns: NsId) -> Result<&mut Namespace> {
        self.namespaces
            .get_mut(&netns)
            .ok_or_else(|| Error::Network(format!("{} no longer exists", netns)))
    }

    /// Resolve a snapshot against the ambient namespace by index
    fn device_mut(&mut self, netns: NsId, link: &Link) -> Result<&mut Device> {
        let ns = self.namespace(netns)?;
        match ns.devices.get_mut(&link.index) {
            Some(dev) if dev.name == link.name => Ok(dev),
            _ => Err(Error::Network(format!(
                "no device with index {} ('{}') in {}",
                link.index, link.name, netns
            ))),
        }
    }

    fn insert_device(
        &mut self,
        netns: NsId,
        name: &str,
        kind: LinkKind,
        mtu: u32,
        pair: Option<u64>,
    ) -> Result<u32> {
        let index = self.alloc_index();
        let ns = self.namespace(netns)?;
        if ns.by_name(name).is_some() {
            return Err(Error::LinkExists(name.to_string()));
        }
        ns.devices.insert(
            index,
            Device {
                name: name.to_string(),
                index,
                kind,
                mtu,
                up: false,
                master: None,
                addrs: Vec::new(),
                created_index: index,
                pair,
            },
        );
        Ok(index)
    }
}

/// In-memory host with a host namespace and any number of container namespaces
#[derive(Debug)]
pub struct MemoryHost {
    state: Mutex<State>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// A host with an empty host namespace
    pub fn new() -> Self {
        let mut state = State::default();
        state.namespaces.insert(HOST_NETNS, Namespace::default());
        state.next_netns = 1;
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a new, empty namespace
    pub fn add_netns(&self) -> NsId {
        let mut state = self.lock();
        let id = NsId(state.next_netns);
        state.next_netns += 1;
        state.namespaces.insert(id, Namespace::default());
        id
    }

    /// Destroy a namespace and everything in it
    pub fn remove_netns(&self, netns: NsId) {
        self.lock().namespaces.remove(&netns);
    }

    /// Make every later call of `op` fail
    pub fn fail(&self, op: Op) {
        self.lock().faults.insert(op);
    }

    /// Stop failing injected operations
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Simulate another creator winning the race for bridge `name`
    ///
    /// The next `add_bridge` for that name creates the device itself and then
    /// reports that it already exists.
    pub fn preempt_bridge(&self, name: &str) {
        self.lock().preempt_bridges.insert(name.to_string());
    }

    /// Make the host end of the next moved veth pair disappear in transit
    ///
    /// `add_veth` still reports the peer name, but no device by that name
    /// shows up in the peer namespace.
    pub fn lose_next_peer(&self) {
        self.lock().lose_next_peer = true;
    }

    /// All link operations performed so far
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of `op`
    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Device named `name` in `netns`
    pub fn device(&self, netns: NsId, name: &str) -> Option<Device> {
        self.lock()
            .namespaces
            .get(&netns)
            .and_then(|ns| ns.by_name(name).cloned())
    }

    /// All devices in `netns`
    pub fn devices(&self, netns: NsId) -> Vec<Device> {
        self.lock()
            .namespaces
            .get(&netns)
            .map(|ns| ns.devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Routing table of `netns`
    pub fn routes(&self, netns: NsId) -> Vec<Route> {
        self.lock()
            .namespaces
            .get(&netns)
            .map(|ns| ns.routes.clone())
            .unwrap_or_default()
    }

    /// Name of the master of `name` in `netns`
    pub fn master_of(&self, netns: NsId, name: &str) -> Option<String> {
        let state = self.lock();
        let ns = state.namespaces.get(&netns)?;
        let master = ns.by_name(name)?.master?;
        ns.devices.get(&master).map(|d| d.name.clone())
    }
}

impl NetnsOps for MemoryHost {
    type Netns = NsId;

    fn current_netns(&self) -> Result<NsId> {
        Ok(self.lock().ambient())
    }

    fn set_netns(&self, ns: &NsId) -> Result<()> {
        let mut state = self.lock();
        if !state.namespaces.contains_key(ns) {
            return Err(Error::Namespace {
                path: ns.to_string(),
                message: "no such namespace".to_string(),
            });
        }
        state.ambient.insert(thread::current().id(), *ns);
        Ok(())
    }
}

impl LinkOps for MemoryHost {
    fn find_link(&self, name: &str) -> Result<Option<Link>> {
        let mut state = self.lock();
        let netns = state.record(Op::FindLink, name)?;
        let ns = state.namespace(netns)?;
        let Some(dev) = ns.by_name(name) else {
            return Ok(None);
        };
        let master = dev
            .master
            .and_then(|m| ns.devices.get(&m))
            .map(|m| m.name.clone());
        Ok(Some(Link {
            name: dev.name.clone(),
            index: dev.index,
            kind: dev.kind.clone(),
            mtu: dev.mtu,
            up: dev.up,
            master,
        }))
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<()> {
        let mut state = self.lock();
        let netns = state.record(Op::AddBridge, name)?;
        if state.preempt_bridges.remove(name) {
            state.insert_device(netns, name, LinkKind::Bridge, mtu, None)?;
            return Err(Error::LinkExists(name.to_string()));
        }
        state.insert_device(netns, name, LinkKind::Bridge, mtu, None)?;
        Ok(())
    }

    fn add_veth(
        &self,
        name: &str,
        mtu: u32,
        peer_name: Option<&str>,
        peer_ns: &NsId,
    ) -> Result<String> {
        let mut state = self.lock();
        let netns = state.record(Op::AddVeth, name)?;
        let peer_name = match peer_name {
            Some(n) => n.to_string(),
            None => {
                state.next_veth += 1;
                format!("veth{:08x}", state.next_veth)
            }
        };

        state.next_pair += 1;
        let pair = Some(state.next_pair);

        // Both ends are born here; the peer is then moved and re-indexed.
        state.insert_device(netns, name, LinkKind::Veth, mtu, pair)?;
        let inserted = state.insert_device(netns, &peer_name, LinkKind::Veth, mtu, pair);
        let peer_index = match inserted {
            Ok(index) => index,
            Err(e) => {
                state.namespace(netns)?.devices.retain(|_, d| d.pair != pair);
                return Err(e);
            }
        };

        if *peer_ns != netns {
            let moved_index = state.alloc_index();
            let Some(mut peer) = state.namespace(netns)?.devices.remove(&peer_index) else {
                return Err(Error::Network(format!("veth peer '{}' lost during move", peer_name)));
            };
            let clash = match state.namespaces.get(peer_ns) {
                Some(target) => target.by_name(&peer_name).is_some(),
                None => true,
            };
            if clash {
                state.namespace(netns)?.devices.retain(|_, d| d.pair != pair);
                return Err(Error::LinkExists(peer_name));
            }
            if std::mem::take(&mut state.lose_next_peer) {
                return Ok(peer_name);
            }
            peer.index = moved_index;
            state.namespace(*peer_ns)?.devices.insert(moved_index, peer);
        }

        Ok(peer_name)
    }

    fn del_link(&self, link: &Link) -> Result<()> {
        let mut state = self.lock();
        let netns = state.record(Op::DelLink, &link.name)?;
        let dev = state.device_mut(netns, link)?;
        let (index, pair) = (dev.index, dev.pair);

        let ns = state.namespace(netns)?;
        ns.devices.remove(&index);
        ns.routes.retain(|r| r.device != index);
        for dev in ns.devices.values_mut() {
            if dev.master == Some(index) {
                dev.master = None;
            }
        }

        if pair.is_some() {
            for ns in state.namespaces.values_mut() {
                let gone: Vec<u32> = ns
                    .devices
                    .values()
                    .filter(|d| d.pair == pair)
                    .map(|d| d.index)
                    .collect();
                for index in gone {
                    ns.devices.remove(&index);
                    ns.routes.retain(|r| r.device != index);
                }
            }
        }

        Ok(())
    }

    fn addr_add(&self, link: &Link, addr: Ipv4Net) -> Result<()> {
        let mut state = self.lock();
        let netns = state.record(Op::AddrAdd, &link.name)?;
        // Like the kernel, only the same device holding the address clashes.
        let dev = state.device_mut(netns, link)?;
        if dev.addrs.contains(&addr) {
            return Err(Error::AddressExists {
                address: addr.to_string(),
                interface: link.name.clone(),
            });
        }
        dev.addrs.push(addr);
        Ok(())
    }

    fn addr_list_v4(&self, link: &Link) -> Result<Vec<Ipv4Net>> {
        let mut state = self.lock();
        let netns = state.record(Op::AddrList, &link.name)?;
        Ok(state.device_mut(netns, link)?.addrs.clone())
    }

    fn set_up(&self, link: &Link) -> Result<()> {
        let mut state = self.lock();
        let netns = state.record(Op::SetUp, &link.name)?;
        state.device_mut(netns, link)?.up = true;
        Ok(())
    }

    fn set_master(&self, link: &Link, master: &Link) -> Result<()> {
        let mut state = self.lock();
        let netns = state.record(Op::SetMaster, &link.name)?;
        let master_index = {
            let m = state.device_mut(netns, master)?;
            if m.kind != LinkKind::Bridge {
                return Err(Error::Network(format!("'{}' is not a bridge", master.name)));
            }
            m.index
        };
        state.device_mut(netns, link)?.master = Some(master_index);
        Ok(())
    }

    fn add_default_route(&self, gateway: Ipv4Addr, link: &Link) -> Result<()> {
        let mut state = self.lock();
        let netns = state.record(Op::AddRoute, &link.name)?;
        let dev = state.device_mut(netns, link)?;
        if !dev.up {
            return Err(Error::Network(format!("'{}' is down", link.name)));
        }
        if !dev.addrs.iter().any(|a| a.contains(&gateway)) {
            return Err(Error::Network(format!(
                "gateway {} unreachable via '{}'",
                gateway, link.name
            )));
        }
        let device = dev.index;

        let destination = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0)
            .map_err(|e| Error::Network(e.to_string()))?;
        let ns = state.namespace(netns)?;
        if ns.routes.iter().any(|r| r.destination == destination) {
            return Err(Error::Network("default route already exists".to_string()));
        }
        ns.routes.push(Route {
            destination,
            gateway,
            device,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::netns::with_netns;

    #[test]
    fn test_veth_peer_moves_with_new_index() {
        let host = MemoryHost::new();
        let pod = host.add_netns();

        let peer = with_netns(&host, &pod, |host_ns| {
            host.add_veth("eth0", 1500, None, host_ns)
        })
        .unwrap();

        let container_end = host.device(pod, "eth0").unwrap();
        let host_end = host.device(HOST_NETNS, &peer).unwrap();
        assert_eq!(container_end.index, container_end.created_index);
        assert_ne!(host_end.index, host_end.created_index);
        assert!(host.device(pod, &peer).is_none());
    }

    #[test]
    fn test_stale_snapshot_is_rejected() {
        let host = MemoryHost::new();
        host.add_bridge("br0", 1500).unwrap();
        let link = host.link_by_name("br0").unwrap();

        let stale = Link {
            index: link.index + 100,
            ..link
        };
        assert!(host.set_up(&stale).is_err());
    }

    #[test]
    fn test_deleting_one_end_removes_peer() {
        let host = MemoryHost::new();
        let pod = host.add_netns();
        let peer = with_netns(&host, &pod, |host_ns| {
            host.add_veth("eth0", 1500, None, host_ns)
        })
        .unwrap();

        with_netns(&host, &pod, |_| {
            let link = host.link_by_name("eth0")?;
            host.del_link(&link)
        })
        .unwrap();

        assert!(host.device(pod, "eth0").is_none());
        assert!(host.device(HOST_NETNS, &peer).is_none());
    }

    #[test]
    fn test_injected_fault_is_recorded() {
        let host = MemoryHost::new();
        host.fail(Op::AddBridge);

        assert!(host.add_bridge("br0", 1500).is_err());
        assert_eq!(host.count(Op::AddBridge), 1);
        assert!(host.device(HOST_NETNS, "br0").is_none());

        host.clear_faults();
        assert!(host.add_bridge("br0", 1500).is_ok());
    }

    #[test]
    fn test_duplicate_address_on_same_device() {
        let host = MemoryHost::new();
        host.add_bridge("br0", 1500).unwrap();
        let br = host.link_by_name("br0").unwrap();
        let addr: Ipv4Net = "10.1.1.1/24".parse().unwrap();

        host.addr_add(&br, addr).unwrap();
        let err = host.addr_add(&br, addr).unwrap_err();
        assert!(err.is_exists());
    }

    #[test]
    fn test_same_address_on_two_devices_is_allowed() {
        let host = MemoryHost::new();
        host.add_bridge("br0", 1500).unwrap();
        host.add_bridge("br1", 1500).unwrap();
        let addr: Ipv4Net = "10.1.1.1/24".parse().unwrap();

        host.addr_add(&host.link_by_name("br0").unwrap(), addr).unwrap();
        host.addr_add(&host.link_by_name("br1").unwrap(), addr).unwrap();

        assert_eq!(host.device(HOST_NETNS, "br1").unwrap().addrs, vec![addr]);
    }

    #[test]
    fn test_lost_peer_never_arrives() {
        let host = MemoryHost::new();
        let pod = host.add_netns();
        host.lose_next_peer();

        let peer = with_netns(&host, &pod, |host_ns| {
            host.add_veth("eth0", 1500, None, host_ns)
        })
        .unwrap();

        assert!(host.device(pod, "eth0").is_some());
        assert!(host.device(HOST_NETNS, &peer).is_none());
        assert!(host.device(pod, &peer).is_none());
    }
}
