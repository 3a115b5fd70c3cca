//! bridgenet - bridge and veth attachment for container network plugins
//!
//! Connects container network namespaces to a single host bridge: the bridge
//! is created idempotently, each container gets a veth pair with an address
//! and a default route, and attachments can be torn down and verified.

pub mod error;
pub mod manifest;
pub mod network;

pub use error::{Error, Result};
