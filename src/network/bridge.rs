//! Bridge interface management
//!
//! Provides:
//! - Idempotent create-or-fetch of the host bridge
//! - Gateway address assignment and bringing the bridge up
//!
//! A bridge that already exists is accepted as-is. Concurrent creators of the
//! same bridge (threads or separate plugin processes) converge without
//! locking: "already exists" from the create call and from assigning the same
//! gateway address are both treated as success.

use crate::error::{Error, Result};
use crate::network::link::{Link, LinkOps, validate_ifname};
use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Default MTU for new bridges
pub const DEFAULT_MTU: u32 = 1500;

/// Desired bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSpec {
    /// Bridge interface name (e.g., "cni0")
    pub name: String,
    /// MTU used when the bridge is created
    pub mtu: u32,
    /// Address of the bridge itself, which containers use as their gateway
    pub gateway: Ipv4Net,
}

impl BridgeSpec {
    /// Create a new bridge spec with the default MTU
    pub fn new(name: impl Into<String>, gateway: Ipv4Net) -> Self {
        Self {
            name: name.into(),
            mtu: DEFAULT_MTU,
            gateway,
        }
    }

    /// Set the MTU used on creation
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Handle to the host bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bridge {
    link: Link,
}

impl Bridge {
    /// Wrap a link known to be the host bridge
    pub fn from_link(link: Link) -> Self {
        Self { link }
    }

    /// Bridge name
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// The bridge device as seen when it was resolved
    pub fn link(&self) -> &Link {
        &self.link
    }
}

/// Creates or fetches the host bridge
pub struct BridgeManager<'a, L: LinkOps + ?Sized> {
    links: &'a L,
}

impl<'a, L: LinkOps + ?Sized> BridgeManager<'a, L> {
    pub fn new(links: &'a L) -> Self {
        Self { links }
    }

    /// Make sure the bridge described by `spec` exists and return it
    ///
    /// Must be called from the host namespace.
    pub fn ensure(&self, spec: &BridgeSpec) -> Result<Bridge> {
        let name = spec.name.as_str();
        let wrap = |action: &'static str| {
            move |e: Error| Error::BridgeOperation {
                bridge: name.to_string(),
                action,
                source: Box::new(e),
            }
        };

        validate_ifname(name).map_err(wrap("validate"))?;

        if let Some(link) = self.links.find_link(name).map_err(wrap("look up"))? {
            if link.mtu != spec.mtu {
                warn!(
                    bridge = %name,
                    existing_mtu = link.mtu,
                    requested_mtu = spec.mtu,
                    "bridge exists with a different MTU, leaving it unchanged"
                );
            }
            debug!(bridge = %name, index = link.index, "reusing existing bridge");
            return Ok(Bridge::from_link(link));
        }

        match self.links.add_bridge(name, spec.mtu) {
            Ok(()) => info!(bridge = %name, mtu = spec.mtu, "created bridge"),
            Err(Error::LinkExists(_)) => {
                debug!(bridge = %name, "bridge created concurrently, fetching it")
            }
            Err(e) => return Err(wrap("create")(e)),
        }

        let link = self.links.link_by_name(name).map_err(wrap("fetch"))?;

        match self.links.addr_add(&link, spec.gateway) {
            Ok(()) => {}
            Err(Error::AddressExists { .. }) => {
                debug!(bridge = %name, gateway = %spec.gateway, "gateway address already assigned")
            }
            Err(e) => return Err(wrap("assign address to")(e)),
        }

        self.links.set_up(&link).map_err(wrap("bring up"))?;

        // Re-read so the handle reflects the up state
        let link = self.links.link_by_name(name).map_err(wrap("fetch"))?;
        Ok(Bridge::from_link(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::{HOST_NETNS, MemoryHost, Op};
    use std::sync::Barrier;

    fn spec() -> BridgeSpec {
        BridgeSpec::new("cni0", "10.1.1.1/24".parse().unwrap())
    }

    #[test]
    fn test_ensure_creates_configured_bridge() {
        let host = MemoryHost::new();
        let bridge = BridgeManager::new(&host).ensure(&spec()).unwrap();

        assert_eq!(bridge.name(), "cni0");
        assert!(bridge.link().up);

        let dev = host.device(HOST_NETNS, "cni0").unwrap();
        assert_eq!(dev.mtu, 1500);
        assert_eq!(dev.addrs, vec!["10.1.1.1/24".parse::<Ipv4Net>().unwrap()]);
        assert!(dev.up);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let host = MemoryHost::new();
        let manager = BridgeManager::new(&host);

        let first = manager.ensure(&spec()).unwrap();
        let second = manager.ensure(&spec()).unwrap();

        assert_eq!(first.link().index, second.link().index);
        assert_eq!(host.count(Op::AddBridge), 1);
        assert_eq!(host.count(Op::AddrAdd), 1);
        assert_eq!(host.count(Op::SetUp), 1);
    }

    #[test]
    fn test_existing_bridge_is_not_reconciled() {
        let host = MemoryHost::new();
        let manager = BridgeManager::new(&host);
        manager.ensure(&spec()).unwrap();

        let drifted = BridgeSpec::new("cni0", "10.9.9.1/24".parse().unwrap()).with_mtu(9000);
        let bridge = manager.ensure(&drifted).unwrap();

        assert_eq!(bridge.link().mtu, 1500);
        let dev = host.device(HOST_NETNS, "cni0").unwrap();
        assert_eq!(dev.addrs, vec!["10.1.1.1/24".parse::<Ipv4Net>().unwrap()]);
    }

    #[test]
    fn test_lost_creation_race_is_benign() {
        let host = MemoryHost::new();
        host.preempt_bridge("cni0");

        let bridge = BridgeManager::new(&host).ensure(&spec()).unwrap();

        assert_eq!(bridge.name(), "cni0");
        assert_eq!(host.devices(HOST_NETNS).len(), 1);
        assert!(host.device(HOST_NETNS, "cni0").unwrap().up);
    }

    #[test]
    fn test_concurrent_ensure_converges_on_one_device() {
        const CALLERS: usize = 16;
        let host = MemoryHost::new();
        let barrier = Barrier::new(CALLERS);
        let (host, barrier) = (&host, &barrier);

        let bridges: Vec<Result<Bridge>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        BridgeManager::new(host).ensure(&spec())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let indexes: Vec<u32> = bridges
            .into_iter()
            .map(|b| b.unwrap().link().index)
            .collect();
        assert!(indexes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(host.devices(HOST_NETNS).len(), 1);
        assert_eq!(host.device(HOST_NETNS, "cni0").unwrap().addrs.len(), 1);
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let host = MemoryHost::new();
        host.fail(Op::AddBridge);

        let err = BridgeManager::new(&host).ensure(&spec()).unwrap_err();
        assert!(matches!(err, Error::BridgeOperation { action: "create", .. }));
    }

    #[test]
    fn test_address_failure_is_fatal() {
        let host = MemoryHost::new();
        host.fail(Op::AddrAdd);

        let err = BridgeManager::new(&host).ensure(&spec()).unwrap_err();
        assert!(matches!(
            err,
            Error::BridgeOperation { action: "assign address to", .. }
        ));
        assert_eq!(host.count(Op::SetUp), 0);
    }

    #[test]
    fn test_bring_up_failure_is_fatal() {
        let host = MemoryHost::new();
        host.fail(Op::SetUp);

        let err = BridgeManager::new(&host).ensure(&spec()).unwrap_err();
        assert!(matches!(err, Error::BridgeOperation { action: "bring up", .. }));
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let host = MemoryHost::new();
        let bad = BridgeSpec::new("a-very-long-bridge-name", "10.1.1.1/24".parse().unwrap());

        assert!(BridgeManager::new(&host).ensure(&bad).is_err());
        assert_eq!(host.count(Op::AddBridge), 0);
    }
}
