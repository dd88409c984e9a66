//! Command line and environment configuration
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Every setting is validated at startup
//! - CM-7: Least Functionality - Only the configured link and networks are used

use crate::error::{NdpError, Result};
use crate::gateway::{DEFAULT_RETRY_INTERVAL, GatewayWait};
use crate::ipset::AddressSet;
use crate::types::MacAddress;
use clap::Parser;
use std::time::Duration;
use tracing::Level;

/// Environment variable selecting the minimum log severity
pub const LOG_LEVEL_ENV: &str = "NDPRESP_LOG";

/// IPv6 Neighbor Discovery responder
#[derive(Parser, Debug, Clone)]
#[command(name = "ndpresponder")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Interface to capture on, transmit on and scope neighbor operations to
    #[arg(short = 'i', long)]
    pub ifname: String,

    /// Static target prefix answered for multicast solicitations (repeatable)
    #[arg(short = 'n', long = "subnet", value_name = "PREFIX")]
    pub subnets: Vec<String>,

    /// Docker network whose container addresses are answered (repeatable)
    #[arg(short = 'N', long = "docker-network", value_name = "NAME")]
    pub docker_networks: Vec<String>,

    /// Seconds to wait for the gateway neighbor entry, 0 waits forever
    #[arg(long, default_value_t = 0, value_name = "SECONDS")]
    pub gateway_timeout: u64,

    /// Milliseconds between gateway resolution attempts
    #[arg(long, default_value_t = DEFAULT_RETRY_INTERVAL.as_millis() as u64, value_name = "MS")]
    pub gateway_retry_ms: u64,

    /// Skip gateway discovery
    #[arg(long)]
    pub no_gateway: bool,
}

/// Interface identity needed by the sockets and the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac: MacAddress,
}

impl InterfaceInfo {
    /// Look up `name` among the host's interfaces
    pub fn lookup(name: &str) -> Result<Self> {
        let iface = pnet::datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| NdpError::InterfaceNotFound(name.to_string()))?;

        let mac = iface
            .mac
            .map(MacAddress::from)
            .filter(|mac| !mac.is_zero())
            .ok_or_else(|| NdpError::Config(format!("interface {name} has no MAC address")))?;

        Ok(Self {
            name: iface.name,
            index: iface.index,
            mac,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub wait: GatewayWait,
    pub retry_interval: Duration,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub interface: InterfaceInfo,
    pub static_targets: AddressSet,
    pub docker_networks: Vec<String>,
    /// `None` when gateway discovery is disabled
    pub gateway: Option<GatewaySettings>,
}

impl Config {
    /// Validate `args` and resolve the interface
    pub fn from_args(args: &Args) -> Result<Self> {
        let static_targets = AddressSet::from_prefixes(&args.subnets)?;
        let interface = InterfaceInfo::lookup(&args.ifname)?;
        Self::build(args, static_targets, interface)
    }

    /// Like [`Config::from_args`] with an already resolved interface
    pub fn with_interface(args: &Args, interface: InterfaceInfo) -> Result<Self> {
        let static_targets = AddressSet::from_prefixes(&args.subnets)?;
        Self::build(args, static_targets, interface)
    }

    fn build(args: &Args, static_targets: AddressSet, interface: InterfaceInfo) -> Result<Self> {
        if args.gateway_retry_ms == 0 {
            return Err(NdpError::Config(
                "--gateway-retry-ms must be greater than 0".into(),
            ));
        }

        let gateway = (!args.no_gateway).then(|| GatewaySettings {
            wait: GatewayWait::from_secs(args.gateway_timeout),
            retry_interval: Duration::from_millis(args.gateway_retry_ms),
        });

        Ok(Self {
            interface,
            static_targets,
            docker_networks: args.docker_networks.clone(),
            gateway,
        })
    }
}

/// Minimum log severity from [`LOG_LEVEL_ENV`], `info` when unset
pub fn log_level_from_env() -> Result<Level> {
    parse_log_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref())
}

pub fn parse_log_level(value: Option<&str>) -> Result<Level> {
    let Some(value) = value else {
        return Ok(Level::INFO);
    };
    match value.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(NdpError::Config(format!(
            "{LOG_LEVEL_ENV}={value:?} is not one of trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eth0() -> InterfaceInfo {
        InterfaceInfo {
            name: "eth0".into(),
            index: 2,
            mac: MacAddress([0x02, 0, 0, 0, 0, 0x01]),
        }
    }

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::try_parse_from([
            "ndpresponder",
            "-i",
            "eth0",
            "-n",
            "2001:db8::/64",
            "--subnet",
            "2001:db8:1::5",
            "-N",
            "backend",
            "--docker-network",
            "frontend",
            "--gateway-timeout",
            "30",
        ])
        .unwrap();

        assert_eq!(args.ifname, "eth0");
        assert_eq!(args.subnets, vec!["2001:db8::/64", "2001:db8:1::5"]);
        assert_eq!(args.docker_networks, vec!["backend", "frontend"]);

        let config = Config::with_interface(&args, eth0()).unwrap();
        assert!(config.static_targets.contains(&"2001:db8::1234".parse().unwrap()));
        assert!(config.static_targets.contains(&"2001:db8:1::5".parse().unwrap()));
        assert_eq!(
            config.gateway,
            Some(GatewaySettings {
                wait: GatewayWait::Timeout(Duration::from_secs(30)),
                retry_interval: Duration::from_secs(1),
            })
        );
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["ndpresponder", "--ifname", "eth0"]).unwrap();
        assert!(args.subnets.is_empty());
        assert!(args.docker_networks.is_empty());

        let config = Config::with_interface(&args, eth0()).unwrap();
        assert!(config.static_targets.is_empty());
        assert_eq!(config.gateway.map(|g| g.wait), Some(GatewayWait::Forever));
    }

    #[test]
    fn test_ifname_is_required() {
        assert!(Args::try_parse_from(["ndpresponder", "-n", "2001:db8::/64"]).is_err());
    }

    #[test]
    fn test_invalid_subnet_names_entry() {
        let args = Args::try_parse_from([
            "ndpresponder",
            "-i",
            "eth0",
            "-n",
            "2001:db8::/64",
            "-n",
            "not-a-prefix",
        ])
        .unwrap();
        let err = Config::with_interface(&args, eth0()).unwrap_err();
        assert!(err.to_string().contains("not-a-prefix"));
    }

    #[test]
    fn test_no_gateway() {
        let args = Args::try_parse_from(["ndpresponder", "-i", "eth0", "--no-gateway"]).unwrap();
        let config = Config::with_interface(&args, eth0()).unwrap();
        assert_eq!(config.gateway, None);
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let args =
            Args::try_parse_from(["ndpresponder", "-i", "eth0", "--gateway-retry-ms", "0"]).unwrap();
        assert!(Config::with_interface(&args, eth0()).is_err());
    }

    #[test]
    fn test_unknown_interface() {
        let err = InterfaceInfo::lookup("ndpresp-does-not-exist0").unwrap_err();
        assert!(matches!(err, NdpError::InterfaceNotFound(_)));
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level(None).unwrap(), Level::INFO);
        assert_eq!(parse_log_level(Some("debug")).unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(Some("WARN")).unwrap(), Level::WARN);
        assert!(parse_log_level(Some("verbose")).is_err());
        assert!(parse_log_level(Some("")).is_err());
    }
}
