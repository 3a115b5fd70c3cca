//! Network attachment for containers on a shared host bridge
//!
//! Provides:
//! - Bridge create-or-fetch on the host (`bridge`)
//! - Veth setup, teardown and verification per container (`veth`)
//! - Scoped network namespace entry (`netns`)
//! - The link layer interface and its backends (`link`, `iproute`, `memory`)

pub mod attachment;
pub mod bridge;
#[cfg(target_os = "linux")]
pub mod iproute;
pub mod link;
pub mod memory;
pub mod netns;
pub mod veth;

pub use attachment::{Attachment, AttachmentRequest};
pub use bridge::{Bridge, BridgeManager, BridgeSpec};
#[cfg(target_os = "linux")]
pub use iproute::Iproute;
pub use link::{Link, LinkKind, LinkOps};
pub use memory::MemoryHost;
#[cfg(target_os = "linux")]
pub use netns::NetNs;
pub use netns::{NetnsGuard, NetnsOps, with_netns};
pub use veth::{SetupStep, VethAttacher};
