//! Veth attachment of containers to the host bridge
//!
//! Veth pairs are virtual Ethernet pairs used to connect a container's
//! network namespace to the bridge. Both ends are created inside the
//! container namespace and the host end is placed in the host namespace as
//! part of creation. Moving a device between namespaces gives it a new kernel
//! index, so the host end is always looked up again by name afterwards.
//!
//! Setup is not transactional: a failure part-way leaves whatever was already
//! done in place. Callers clean up with `teardown` and retry from scratch.

use crate::error::{Error, Result};
use crate::network::attachment::{Attachment, AttachmentRequest};
use crate::network::bridge::Bridge;
use crate::network::link::{Link, LinkOps};
use crate::network::netns::{NetnsGuard, with_netns};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Steps of veth setup, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    EnterNamespace,
    CreateVeth,
    LookupContainerEnd,
    AssignAddress,
    ContainerEndUp,
    DefaultRoute,
    LeaveNamespace,
    LookupHostEnd,
    JoinBridge,
    HostEndUp,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupStep::EnterNamespace => "enter namespace",
            SetupStep::CreateVeth => "create veth pair",
            SetupStep::LookupContainerEnd => "look up container end",
            SetupStep::AssignAddress => "assign address",
            SetupStep::ContainerEndUp => "bring up container end",
            SetupStep::DefaultRoute => "add default route",
            SetupStep::LeaveNamespace => "leave namespace",
            SetupStep::LookupHostEnd => "look up host end",
            SetupStep::JoinBridge => "join bridge",
            SetupStep::HostEndUp => "bring up host end",
        };
        f.write_str(s)
    }
}

fn step_err(step: SetupStep, interface: &str) -> impl FnOnce(Error) -> Error + '_ {
    move |e| Error::VethSetup {
        step,
        interface: interface.to_string(),
        source: Box::new(e),
    }
}

/// Attaches containers to the host bridge and detaches them again
pub struct VethAttacher<'a, L: LinkOps + ?Sized> {
    links: &'a L,
}

impl<'a, L: LinkOps + ?Sized> VethAttacher<'a, L> {
    pub fn new(links: &'a L) -> Self {
        Self { links }
    }

    /// Connect the container namespace in `req` to its bridge
    ///
    /// Must be called from the host namespace. On failure nothing is rolled
    /// back; see the module docs.
    pub fn setup(&self, req: &AttachmentRequest<L::Netns>) -> Result<Attachment> {
        let guard = NetnsGuard::enter(self.links, &req.netns)
            .map_err(step_err(SetupStep::EnterNamespace, &req.ifname))?;

        // An error here drops the guard, which restores the host namespace.
        let host_name = self.configure_container_end(guard.original(), req)?;

        guard
            .exit()
            .map_err(step_err(SetupStep::LeaveNamespace, &req.ifname))?;

        // The index the host end had at creation is gone; resolve by name.
        let host_link = self
            .links
            .find_link(&host_name)
            .map_err(step_err(SetupStep::LookupHostEnd, &host_name))?
            .ok_or_else(|| Error::HostVethMissing(host_name.clone()))?;

        self.join_bridge(&host_link, &req.bridge)?;

        info!(
            container_interface = %req.ifname,
            host_interface = %host_name,
            bridge = %req.bridge.name(),
            address = %req.address,
            "attached container to bridge"
        );

        Ok(Attachment {
            container_interface: req.ifname.clone(),
            host_interface: host_name,
            bridge: req.bridge.name().to_string(),
            address: req.address,
            gateway: req.gateway,
        })
    }

    /// Runs inside the container namespace; returns the host end's name
    fn configure_container_end(
        &self,
        host_ns: &L::Netns,
        req: &AttachmentRequest<L::Netns>,
    ) -> Result<String> {
        let ifname = req.ifname.as_str();

        let host_name = self
            .links
            .add_veth(ifname, req.mtu, None, host_ns)
            .map_err(step_err(SetupStep::CreateVeth, ifname))?;
        debug!(container_interface = %ifname, host_interface = %host_name, "created veth pair");

        let link = self
            .links
            .link_by_name(ifname)
            .map_err(step_err(SetupStep::LookupContainerEnd, ifname))?;

        self.links
            .addr_add(&link, req.address)
            .map_err(step_err(SetupStep::AssignAddress, ifname))?;

        self.links
            .set_up(&link)
            .map_err(step_err(SetupStep::ContainerEndUp, ifname))?;

        self.links
            .add_default_route(req.gateway, &link)
            .map_err(step_err(SetupStep::DefaultRoute, ifname))?;

        Ok(host_name)
    }

    fn join_bridge(&self, host_link: &Link, bridge: &Bridge) -> Result<()> {
        let name = host_link.name.as_str();

        self.links
            .set_master(host_link, bridge.link())
            .map_err(step_err(SetupStep::JoinBridge, name))?;

        self.links
            .set_up(host_link)
            .map_err(step_err(SetupStep::HostEndUp, name))
    }

    /// Delete `ifname` from the container namespace
    ///
    /// Deleting the container end removes the host end with it. An interface
    /// that is already gone is not an error.
    pub fn teardown(&self, netns: &L::Netns, ifname: &str) -> Result<()> {
        with_netns(self.links, netns, |_| match self.links.find_link(ifname)? {
            Some(link) => {
                self.links.del_link(&link)?;
                info!(container_interface = %ifname, "removed veth pair");
                Ok(())
            }
            None => {
                debug!(container_interface = %ifname, "veth already removed");
                Ok(())
            }
        })
        .map_err(|e| Error::VethTeardown {
            interface: ifname.to_string(),
            source: Box::new(e),
        })
    }

    /// Verify that `ifname` in the container namespace carries `expected`
    ///
    /// A missing interface is reported as `Error::InterfaceNotFound`, a
    /// present interface without the address as `Error::AddressNotFound`.
    pub fn check(&self, netns: &L::Netns, ifname: &str, expected: Ipv4Addr) -> Result<()> {
        with_netns(self.links, netns, |_| {
            let link = self.links.link_by_name(ifname)?;

            let addrs = self.links.addr_list_v4(&link).map_err(|e| Error::VethCheck {
                interface: ifname.to_string(),
                source: Box::new(e),
            })?;

            if addrs.iter().any(|a| a.addr() == expected) {
                return Ok(());
            }

            Err(Error::AddressNotFound {
                address: expected,
                interface: ifname.to_string(),
            })
        })
    }
}
