//! Container attachment parameters and results
//!
//! Provides:
//! - `AttachmentRequest`, the per-container input to veth setup
//! - `Attachment`, what a successful setup produced

use crate::error::{Error, Result};
use crate::network::bridge::{Bridge, DEFAULT_MTU};
use crate::network::link::validate_ifname;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Everything needed to attach one container to the bridge
#[derive(Debug, Clone)]
pub struct AttachmentRequest<N> {
    /// Container network namespace
    pub netns: N,
    /// Bridge the host end is joined to
    pub bridge: Bridge,
    /// MTU of both veth ends
    pub mtu: u32,
    /// Interface name inside the container (e.g., "eth0")
    pub ifname: String,
    /// Container address with prefix (e.g., 10.1.1.2/24)
    pub address: Ipv4Net,
    /// Default gateway, normally the bridge address
    pub gateway: Ipv4Addr,
}

impl<N> AttachmentRequest<N> {
    /// Create a new request with the default MTU
    pub fn new(
        netns: N,
        bridge: Bridge,
        ifname: impl Into<String>,
        address: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Self {
        Self {
            netns,
            bridge,
            mtu: DEFAULT_MTU,
            ifname: ifname.into(),
            address,
            gateway,
        }
    }

    /// Set the MTU of the veth pair
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Check the request before touching any namespace
    ///
    /// The gateway has to be inside the container's subnet and must not be
    /// the container address itself, otherwise the default route cannot be
    /// installed.
    pub fn validate(&self) -> Result<()> {
        validate_ifname(&self.ifname)?;

        if !self.address.contains(&self.gateway) {
            return Err(Error::ConfigValidation(format!(
                "Gateway {} is not in subnet {}",
                self.gateway,
                self.address.trunc()
            )));
        }
        if self.address.addr() == self.gateway {
            return Err(Error::ConfigValidation(format!(
                "Container address {} equals the gateway",
                self.address
            )));
        }

        Ok(())
    }
}

/// Result of a successful veth setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    /// Interface name inside the container
    pub container_interface: String,
    /// Host-side veth name
    pub host_interface: String,
    /// Bridge the host end was joined to
    pub bridge: String,
    /// Address assigned inside the container
    pub address: Ipv4Net,
    /// Default gateway inside the container
    pub gateway: Ipv4Addr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::link::{Link, LinkKind};

    fn bridge() -> Bridge {
        Bridge::from_link(Link {
            name: "cni0".into(),
            index: 3,
            kind: LinkKind::Bridge,
            mtu: 1500,
            up: true,
            master: None,
        })
    }

    #[test]
    fn test_request_defaults() {
        let req = AttachmentRequest::new(
            (),
            bridge(),
            "eth0",
            "10.1.1.2/24".parse().unwrap(),
            "10.1.1.1".parse().unwrap(),
        );

        assert_eq!(req.mtu, 1500);
        assert_eq!(req.with_mtu(1450).mtu, 1450);
    }

    #[test]
    fn test_validate_accepts_gateway_in_subnet() {
        let req = AttachmentRequest::new(
            (),
            bridge(),
            "eth0",
            "10.1.1.2/24".parse().unwrap(),
            "10.1.1.1".parse().unwrap(),
        );
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unreachable_gateway() {
        let req = AttachmentRequest::new(
            (),
            bridge(),
            "eth0",
            "10.1.1.2/24".parse().unwrap(),
            "10.2.0.1".parse().unwrap(),
        );
        assert!(matches!(req.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_validate_rejects_gateway_as_own_address() {
        let req = AttachmentRequest::new(
            (),
            bridge(),
            "eth0",
            "10.1.1.1/24".parse().unwrap(),
            "10.1.1.1".parse().unwrap(),
        );
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ifname() {
        let req = AttachmentRequest::new(
            (),
            bridge(),
            "container-interface0",
            "10.1.1.2/24".parse().unwrap(),
            "10.1.1.1".parse().unwrap(),
        );
        assert!(matches!(
            req.validate(),
            Err(Error::InvalidInterfaceName { .. })
        ));
    }
}
