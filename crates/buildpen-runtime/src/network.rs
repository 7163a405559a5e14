//! Host networking for container builds: a dedicated bridge with NAT and a
//! dnsmasq instance, plus the lock that makes the bridge a host-wide
//! singleton.

use crate::process::{call_command, run_command, to_argv};
use crate::BackendError;
use fs2::FileExt;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tag on every firewall rule we add, so stale ones can be identified.
const IPTABLES_COMMENT: &str = "managed by buildpen";

/// User dnsmasq drops privileges to.
const DNSMASQ_USER: &str = "buildd";

/// An IPv4 subnet written `address/prefix`, where the address part is the
/// gateway to be assigned to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Network {
    fn mask(self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    pub fn network(self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    pub fn broadcast(self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask() | !self.mask())
    }

    pub fn gateway(self) -> Ipv4Addr {
        self.address
    }

    /// First host address that is not the network, gateway, or broadcast
    /// address. Deterministic, so containers always get the same address.
    pub fn first_usable_host(self) -> Option<Ipv4Addr> {
        let network = u32::from(self.network());
        let broadcast = u32::from(self.broadcast());
        let gateway = u32::from(self.gateway());
        (network + 1..broadcast).find_map(|candidate| {
            if candidate == gateway {
                None
            } else {
                Some(Ipv4Addr::from(candidate))
            }
        })
    }

    /// The same subnet with a different address part.
    pub fn with_address(self, address: Ipv4Addr) -> Self {
        Self {
            address,
            prefix: self.prefix,
        }
    }
}

impl std::str::FromStr for Ipv4Network {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BackendError::Config(format!("invalid IPv4 subnet: {s}"));
        let (address, prefix) = s.split_once('/').ok_or_else(bad)?;
        let address: Ipv4Addr = address.parse().map_err(|_| bad())?;
        let prefix: u8 = prefix.parse().map_err(|_| bad())?;
        if prefix > 32 {
            return Err(bad());
        }
        Ok(Self { address, prefix })
    }
}

impl std::fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Advisory lock making bridge ownership explicit: only one build on a host
/// may hold the bridge at a time.
pub struct BridgeLock {
    lock_file: File,
}

impl BridgeLock {
    pub fn acquire(path: &Path) -> Result<Self, BackendError> {
        let lock_file = File::create(path)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            BackendError::Failed(format!(
                "bridge lock {} is held by another build",
                path.display()
            ))
        })?;
        Ok(Self { lock_file })
    }
}

impl Drop for BridgeLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
    }
}

/// The bridge device, its subnet, and the services hanging off it.
pub struct Bridge {
    pub name: String,
    pub network: Ipv4Network,
    run_dir: PathBuf,
}

impl Bridge {
    pub fn new(name: impl Into<String>, network: Ipv4Network, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            network,
            run_dir: run_dir.into(),
        }
    }

    fn sys_dir(&self) -> PathBuf {
        PathBuf::from(format!("/sys/class/net/{}", self.name))
    }

    fn dnsmasq_pid_file(&self) -> PathBuf {
        self.run_dir.join("dnsmasq.pid")
    }

    fn lock_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.lock", self.name))
    }

    /// Bring the bridge up: device, address, NAT, forwarding, dnsmasq.
    ///
    /// Returns the lock that keeps other builds off the bridge; dropping it
    /// releases ownership, so hold it until [`Bridge::stop`].
    pub fn start(&self) -> Result<BridgeLock, BackendError> {
        std::fs::create_dir_all(&self.run_dir)?;
        let lock = BridgeLock::acquire(&self.lock_path())?;

        run_command(&to_argv(&["sudo", "ip", "link", "add", "dev", &self.name, "type", "bridge"]), None, false)?;
        run_command(
            &to_argv(&["sudo", "ip", "addr", "add", &self.network.to_string(), "dev", &self.name]),
            None,
            false,
        )?;
        run_command(&to_argv(&["sudo", "ip", "link", "set", "dev", &self.name, "up"]), None, false)?;
        run_command(&to_argv(&["sudo", "sysctl", "-q", "-w", "net.ipv4.ip_forward=1"]), None, false)?;

        self.iptables(&forward_mss_rule("-A", &self.name), true)?;
        self.iptables(&masquerade_rule("-A", self.network), true)?;

        let mut argv = to_argv(&[
            "sudo",
            "/usr/sbin/dnsmasq",
            "-s",
            "buildpen",
            "-S",
            "/buildpen/",
            "-u",
            DNSMASQ_USER,
            "--strict-order",
            "--bind-interfaces",
        ]);
        argv.push(format!(
            "--pid-file={}",
            self.dnsmasq_pid_file().to_string_lossy()
        ));
        argv.push("--except-interface=lo".to_owned());
        argv.push(format!("--interface={}", self.name));
        argv.push(format!("--listen-address={}", self.network.gateway()));
        run_command(&argv, None, false)?;

        Ok(lock)
    }

    /// Tear the bridge down. A no-op when the device does not exist, so
    /// stopping an already-stopped bridge is safe.
    pub fn stop(&self) -> Result<(), BackendError> {
        if !self.sys_dir().is_dir() {
            return Ok(());
        }
        call_command(&to_argv(&["sudo", "ip", "addr", "flush", "dev", &self.name]));
        call_command(&to_argv(&["sudo", "ip", "link", "set", "dev", &self.name, "down"]));
        self.iptables(&forward_mss_rule("-D", &self.name), true)?;
        self.iptables(&masquerade_rule("-D", self.network), false)?;
        self.stop_dnsmasq();
        call_command(&to_argv(&["sudo", "ip", "link", "delete", &self.name]));
        Ok(())
    }

    fn stop_dnsmasq(&self) {
        let pid_file = self.dnsmasq_pid_file();
        if let Ok(contents) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                call_command(&to_argv(&["sudo", "kill", "-9", &pid.to_string()]));
            }
            if let Err(e) = std::fs::remove_file(&pid_file) {
                debug!("cannot remove {}: {e}", pid_file.display());
            }
        }
    }

    fn iptables(&self, args: &[String], check: bool) -> Result<(), BackendError> {
        let mut argv = to_argv(&["sudo", "iptables", "-w"]);
        argv.extend_from_slice(args);
        argv.extend(to_argv(&["-m", "comment", "--comment", IPTABLES_COMMENT]));
        if check {
            run_command(&argv, None, false)?;
        } else {
            call_command(&argv);
        }
        Ok(())
    }
}

/// Clamp TCP MSS to path MTU for traffic forwarded from the bridge; some
/// build networks sit behind tunnels with a smaller MTU.
fn forward_mss_rule(op: &str, bridge: &str) -> Vec<String> {
    to_argv(&[
        "-t", "mangle", op, "FORWARD", "-i", bridge, "-p", "tcp", "--tcp-flags", "SYN,RST", "SYN",
        "-j", "TCPMSS", "--clamp-mss-to-pmtu",
    ])
}

/// NAT traffic leaving the build subnet.
fn masquerade_rule(op: &str, network: Ipv4Network) -> Vec<String> {
    let network = network.to_string();
    to_argv(&[
        "-t", "nat", op, "POSTROUTING", "-s", &network, "!", "-d", &network, "-j", "MASQUERADE",
    ])
}

/// Major device number of the device-mapper driver on this host.
pub fn device_mapper_major() -> Result<u32, BackendError> {
    let devices = std::fs::read_to_string("/proc/devices")?;
    parse_device_major(&devices, "device-mapper").ok_or_else(|| {
        BackendError::Failed("cannot determine major device number for device-mapper".to_owned())
    })
}

/// Find a driver's major number in a /proc/devices listing. The driver name
/// must be the whole trailing token of its line.
fn parse_device_major(devices: &str, driver: &str) -> Option<u32> {
    let suffix = format!(" {driver}");
    devices
        .lines()
        .find(|line| line.ends_with(&suffix))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|major| major.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn subnet_math() {
        let net = network("10.10.10.1/24");
        assert_eq!(net.network(), Ipv4Addr::new(10, 10, 10, 0));
        assert_eq!(net.broadcast(), Ipv4Addr::new(10, 10, 10, 255));
        assert_eq!(net.gateway(), Ipv4Addr::new(10, 10, 10, 1));
        assert_eq!(net.to_string(), "10.10.10.1/24");
    }

    #[test]
    fn first_usable_host_skips_network_gateway_broadcast() {
        // Gateway is the first host address, so the container gets .2.
        let net = network("10.10.10.1/24");
        assert_eq!(net.first_usable_host(), Some(Ipv4Addr::new(10, 10, 10, 2)));

        // Gateway elsewhere in the subnet: .1 is free.
        let net = network("192.168.5.7/24");
        assert_eq!(net.first_usable_host(), Some(Ipv4Addr::new(192, 168, 5, 1)));
    }

    #[test]
    fn tiny_subnets_may_have_no_usable_host() {
        // /30 has two host addresses; the gateway takes one, leaving one.
        let net = network("10.0.0.1/30");
        assert_eq!(net.first_usable_host(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        // /31 has none at all.
        let net = network("10.0.0.1/31");
        assert_eq!(net.first_usable_host(), None);
    }

    #[test]
    fn invalid_subnet_strings_are_config_errors() {
        for s in ["10.0.0.1", "10.0.0.1/33", "bogus/24", "10.0.0.1/x"] {
            assert!(s.parse::<Ipv4Network>().is_err(), "{s}");
        }
    }

    #[test]
    fn iptables_rules_reference_the_subnet_as_written() {
        let rule = masquerade_rule("-A", network("10.10.10.1/24"));
        assert_eq!(
            rule,
            to_argv(&[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                "10.10.10.1/24",
                "!",
                "-d",
                "10.10.10.1/24",
                "-j",
                "MASQUERADE",
            ])
        );
        let rule = forward_mss_rule("-D", "buildpenbr0");
        assert_eq!(rule[2], "-D");
        assert_eq!(rule[5], "buildpenbr0");
    }

    #[test]
    fn device_major_requires_trailing_token_match() {
        let devices = "\
Character devices:
  1 mem
 10 misc

Block devices:
  8 sd
253 device-mapper
254 not-device-mapper-really
";
        assert_eq!(parse_device_major(devices, "device-mapper"), Some(253));
        assert_eq!(parse_device_major(devices, "loop"), None);
    }

    #[test]
    fn bridge_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbr0.lock");
        let held = BridgeLock::acquire(&path).unwrap();
        assert!(BridgeLock::acquire(&path).is_err());
        drop(held);
        assert!(BridgeLock::acquire(&path).is_ok());
    }
}
