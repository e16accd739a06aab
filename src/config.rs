use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

use ipnet::Ipv4Net;

use crate::Error;
use crate::Result;

/// Default host-side veth interface name.
pub const DEFAULT_HOST_VETH: &str = "veth0";
/// Default container-side veth interface name.
pub const DEFAULT_CONTAINER_VETH: &str = "ceth0";
/// Default container network in CIDR notation.
pub const DEFAULT_CONTAINER_NETWORK: &str = "172.18.0.0/16";
/// Default host-end address.
pub const DEFAULT_HOST_IP: &str = "172.18.0.1";
/// Default container-end address.
pub const DEFAULT_CONTAINER_IP: &str = "172.18.0.2";
/// Default memory.max, 1 GiB.
pub const DEFAULT_MEMORY_MAX_BYTES: u64 = 1024 * 1024 * 1024;
/// Default cpu.max quota in microseconds.
pub const DEFAULT_CPU_MAX_PERIOD_US: u32 = 100_000;
/// Default cgroup directory for the container.
pub const DEFAULT_CGROUP_PATH: &str = "/sys/fs/cgroup/mocker";
/// Default container root filesystem location.
pub const DEFAULT_CONTAINER_ROOT: &str = "/tmp/container-root";

/// Interface names are limited to IFNAMSIZ-1 bytes.
const MAX_IFNAME_LEN: usize = 15;

const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";

/// Description of a single container run.
///
/// Built once from the command line and read-only afterwards. Every field can
/// be set directly before the first call to [`validate`](Self::validate);
/// after that the runtime treats the value as frozen.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Argv of the in-container process. Never empty.
    pub command: Vec<String>,
    /// Image reference. Recorded for future use; the minimal runtime does not
    /// fetch images.
    pub image_ref: String,
    /// Name of the host end of the veth pair.
    pub host_veth: String,
    /// Name of the container end of the veth pair.
    pub container_veth: String,
    /// IPv4 address of the host end; also the container's default gateway.
    pub host_ip: Ipv4Addr,
    /// IPv4 address of the container end.
    pub container_ip: Ipv4Addr,
    /// Prefix length shared by both addresses.
    pub prefix_len: u8,
    /// Network both addresses must lie in; also the NAT source range.
    pub container_network: Ipv4Net,
    /// Value written to `memory.max`, in bytes.
    pub memory_max_bytes: u64,
    /// Quota written to `cpu.max`, in microseconds per 100 ms period.
    pub cpu_max_period_us: u32,
    /// Cgroup-v2 directory created for this run.
    pub cgroup_path: PathBuf,
    /// Root directory of the container filesystem.
    pub container_root: PathBuf,
}

impl ContainerSpec {
    /// Create a spec for `command` with the default network, limits and
    /// paths.
    pub fn new(image_ref: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            command,
            image_ref: image_ref.into(),
            host_veth: DEFAULT_HOST_VETH.into(),
            container_veth: DEFAULT_CONTAINER_VETH.into(),
            host_ip: Ipv4Addr::new(172, 18, 0, 1),
            container_ip: Ipv4Addr::new(172, 18, 0, 2),
            prefix_len: 16,
            container_network: Ipv4Net::new(Ipv4Addr::new(172, 18, 0, 0), 16)
                .unwrap_or_else(|_| Ipv4Net::default()),
            memory_max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            cpu_max_period_us: DEFAULT_CPU_MAX_PERIOD_US,
            cgroup_path: DEFAULT_CGROUP_PATH.into(),
            container_root: DEFAULT_CONTAINER_ROOT.into(),
        }
    }

    /// Check every invariant the runtime relies on.
    ///
    /// Runs before any side effect; a failure here leaves the system
    /// untouched.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::Config("no command to run".into()));
        }
        validate_ifname(&self.host_veth)?;
        validate_ifname(&self.container_veth)?;
        if self.host_veth == self.container_veth {
            return Err(Error::Config(format!(
                "host and container interfaces must differ, both are {:?}",
                self.host_veth
            )));
        }
        if self.prefix_len > 32 {
            return Err(Error::Config(format!(
                "prefix length {} is out of range",
                self.prefix_len
            )));
        }
        if self.prefix_len != self.container_network.prefix_len() {
            return Err(Error::Config(format!(
                "prefix length {} does not match network {}",
                self.prefix_len, self.container_network
            )));
        }
        for (name, ip) in [("host", self.host_ip), ("container", self.container_ip)] {
            if !self.container_network.contains(&ip) {
                return Err(Error::Config(format!(
                    "{} address {} is outside {}",
                    name, ip, self.container_network
                )));
            }
        }
        if self.host_ip == self.container_ip {
            return Err(Error::Config(format!(
                "host and container addresses must differ, both are {}",
                self.host_ip
            )));
        }
        if self.cpu_max_period_us == 0 {
            return Err(Error::Config("cpu quota must be positive".into()));
        }
        if !self.cgroup_path.starts_with(CGROUP_FS_ROOT) || self.cgroup_path == Path::new(CGROUP_FS_ROOT) {
            return Err(Error::Config(format!(
                "cgroup path {:?} must be a directory under {}",
                self.cgroup_path, CGROUP_FS_ROOT
            )));
        }
        if !self.container_root.is_absolute() || self.container_root == Path::new("/") {
            return Err(Error::Config(format!(
                "container root {:?} must be an absolute path",
                self.container_root
            )));
        }
        Ok(())
    }
}

/// Interface names go on the netlink wire and into `/sys`; restrict them to
/// a letter followed by letters, digits and underscores, at most 15 bytes.
fn validate_ifname(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphabetic()
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= MAX_IFNAME_LEN
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid interface name {:?}", name)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec::new("ubuntu", vec!["/bin/sh".into()])
    }

    #[test]
    fn default_spec_is_valid() {
        spec().validate().unwrap();
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut spec = spec();
        spec.command.clear();
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn overlong_ifname_is_rejected() {
        let mut spec = spec();
        spec.host_veth = "veth0123456789ab".into();
        assert_eq!(spec.host_veth.len(), 16);
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn ifname_charset_is_restricted() {
        for name in ["", "0eth", "veth-0", "veth.0", "et h"] {
            let mut spec = spec();
            spec.container_veth = name.into();
            assert!(
                matches!(spec.validate(), Err(Error::Config(_))),
                "{name:?} should be rejected"
            );
        }
        let mut spec = spec();
        spec.container_veth = "cEth_9".into();
        spec.validate().unwrap();
    }

    #[test]
    fn identical_ifnames_are_rejected() {
        let mut spec = spec();
        spec.container_veth = spec.host_veth.clone();
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn prefix_out_of_range_is_rejected() {
        let mut spec = spec();
        spec.prefix_len = 33;
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn prefix_mismatch_is_rejected() {
        let mut spec = spec();
        spec.prefix_len = 24;
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn address_outside_network_is_rejected() {
        let mut spec = spec();
        spec.container_ip = Ipv4Addr::new(10, 0, 0, 2);
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_cpu_quota_is_rejected() {
        let mut spec = spec();
        spec.cpu_max_period_us = 0;
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn cgroup_path_must_live_under_cgroupfs() {
        for path in ["/tmp/mocker", "/sys/fs/cgroup", "cgroup/mocker"] {
            let mut spec = spec();
            spec.cgroup_path = path.into();
            assert!(
                matches!(spec.validate(), Err(Error::Config(_))),
                "{path:?} should be rejected"
            );
        }
    }

    #[test]
    fn container_root_must_be_absolute() {
        let mut spec = spec();
        spec.container_root = "container-root".into();
        assert!(matches!(spec.validate(), Err(Error::Config(_))));
    }
}
