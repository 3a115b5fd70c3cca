//! Configuration file parsing for bridgenet
//!
//! Parses `bridgenet.toml` configuration files using serde

use crate::error::{Error, Result};
use crate::network::bridge::{BridgeSpec, DEFAULT_MTU};
use crate::network::link::validate_ifname;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Smallest MTU the kernel accepts for IPv4
const MIN_MTU: u32 = 68;
const MAX_MTU: u32 = 65535;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Host bridge settings
    pub bridge: BridgeConfig,

    /// Defaults for attach/detach/check
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ifname(&self.bridge.name)
            .map_err(|e| Error::ConfigValidation(format!("bridge.name: {}", e)))?;

        if !(MIN_MTU..=MAX_MTU).contains(&self.bridge.mtu) {
            return Err(Error::ConfigValidation(format!(
                "bridge.mtu {} is outside {}..={}",
                self.bridge.mtu, MIN_MTU, MAX_MTU
            )));
        }

        // /31 and /32 leave no room for containers next to the gateway
        if self.bridge.gateway.prefix_len() > 30 {
            return Err(Error::ConfigValidation(format!(
                "bridge.gateway {} leaves no addresses for containers",
                self.bridge.gateway
            )));
        }
        let gw = self.bridge.gateway;
        if gw.addr() == gw.network() || gw.addr() == gw.broadcast() {
            return Err(Error::ConfigValidation(format!(
                "bridge.gateway {} is not a host address",
                gw
            )));
        }

        validate_ifname(&self.runtime.ifname)
            .map_err(|e| Error::ConfigValidation(format!("runtime.ifname: {}", e)))?;

        Ok(())
    }

    /// Bridge spec for `BridgeManager::ensure`
    pub fn bridge_spec(&self) -> BridgeSpec {
        BridgeSpec::new(self.bridge.name.clone(), self.bridge.gateway).with_mtu(self.bridge.mtu)
    }
}

/// Host bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bridge interface name
    pub name: String,

    /// MTU for the bridge and the veth pairs attached to it
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Bridge address with prefix; containers route through it
    pub gateway: Ipv4Net,
}

/// Runtime defaults
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// iproute2 binary
    #[serde(default = "default_ip_command")]
    pub ip_command: PathBuf,

    /// Interface name inside containers
    #[serde(default = "default_ifname")]
    pub ifname: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ip_command: default_ip_command(),
            ifname: default_ifname(),
        }
    }
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_ip_command() -> PathBuf {
    PathBuf::from("ip")
}

fn default_ifname() -> String {
    "eth0".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[bridge]
name = "cni0"
gateway = "10.1.1.1/24"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bridge.name, "cni0");
        assert_eq!(config.bridge.mtu, 1500);
        assert_eq!(config.runtime.ifname, "eth0");
        assert_eq!(config.runtime.ip_command, PathBuf::from("ip"));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[bridge]
name = "br-pods"
mtu = 1450
gateway = "172.20.0.1/16"

[runtime]
ip_command = "/usr/sbin/ip"
ifname = "net0"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let spec = config.bridge_spec();
        assert_eq!(spec.name, "br-pods");
        assert_eq!(spec.mtu, 1450);
        assert_eq!(spec.gateway, "172.20.0.1/16".parse::<Ipv4Net>().unwrap());
        assert_eq!(config.runtime.ip_command, PathBuf::from("/usr/sbin/ip"));
        assert_eq!(config.runtime.ifname, "net0");
    }

    #[test]
    fn test_missing_gateway_is_a_parse_error() {
        let toml = r#"
[bridge]
name = "cni0"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            (r#"name = "a-very-long-bridge-name"
gateway = "10.1.1.1/24""#, "bridge.name"),
            (r#"name = "cni0"
mtu = 40
gateway = "10.1.1.1/24""#, "bridge.mtu"),
            (r#"name = "cni0"
gateway = "10.1.1.1/32""#, "leaves no addresses"),
            (r#"name = "cni0"
gateway = "10.1.1.0/24""#, "not a host address"),
        ];

        for (bridge, expected) in cases {
            let toml = format!("[bridge]\n{}\n", bridge);
            let config: Config = toml::from_str(&toml).unwrap();
            match config.validate() {
                Err(Error::ConfigValidation(msg)) => assert!(
                    msg.contains(expected),
                    "expected '{}' in '{}'",
                    expected,
                    msg
                ),
                other => panic!("expected validation error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/bridgenet.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
