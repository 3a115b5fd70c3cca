//! Unified error types for bridgenet

use crate::network::veth::SetupStep;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for bridgenet operations
#[derive(Error, Debug)]
pub enum Error {
    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Namespace errors
    #[error("Network namespace '{path}': {message}")]
    Namespace { path: String, message: String },

    // Link layer errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Interface '{0}' already exists")]
    LinkExists(String),

    #[error("Address {address} already exists on '{interface}'")]
    AddressExists { address: String, interface: String },

    #[error("Invalid interface name '{name}': {reason}")]
    InvalidInterfaceName { name: String, reason: String },

    // Bridge errors
    #[error("Failed to {action} bridge '{bridge}': {source}")]
    BridgeOperation {
        bridge: String,
        action: &'static str,
        #[source]
        source: Box<Error>,
    },

    // Veth errors
    #[error("Veth setup failed at '{step}' on '{interface}': {source}")]
    VethSetup {
        step: SetupStep,
        interface: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Host veth '{0}' vanished after the namespace move")]
    HostVethMissing(String),

    #[error("Failed to tear down '{interface}': {source}")]
    VethTeardown {
        interface: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to check '{interface}': {source}")]
    VethCheck {
        interface: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to find ip {address} for {interface}")]
    AddressNotFound { address: Ipv4Addr, interface: String },
}

impl Error {
    /// Whether the innermost cause is a missing interface
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::InterfaceNotFound(_) | Error::HostVethMissing(_) => true,
            Error::BridgeOperation { source, .. }
            | Error::VethSetup { source, .. }
            | Error::VethTeardown { source, .. }
            | Error::VethCheck { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the error reports an object that already exists
    pub fn is_exists(&self) -> bool {
        matches!(self, Error::LinkExists(_) | Error::AddressExists { .. })
    }
}

/// Result type alias for bridgenet operations
pub type Result<T> = std::result::Result<T, Error>;
