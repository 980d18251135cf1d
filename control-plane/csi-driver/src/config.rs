use crate::metadata::StaticMetadata;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::{path::PathBuf, time::Duration};

/// Default give-up timeout of the device in use check.
pub const DEFAULT_DEVICE_IN_USE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of concurrent format and mount operations.
pub const DEFAULT_FORMAT_MOUNT_SLOTS: i64 = 1;
/// Default wait for a format and mount slot.
pub const DEFAULT_FORMAT_MOUNT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default sysfs mount.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Node plugin configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeServerConfig {
    /// Check the device has been released when unstaging.
    pub enable_device_in_use_check: bool,
    /// How long to keep failing unstage while the device is in use.
    pub device_in_use_timeout: Duration,
    /// Data cache support is enabled on this cluster.
    pub enable_data_cache: bool,
    /// This node's pool has a data cache configured.
    pub data_cache_enabled_node_pool: bool,
    /// Root of the sysfs tree.
    pub sysfs_root: PathBuf,
    /// Concurrent format and mount operations, 0 or less means unlimited.
    pub format_mount_slots: i64,
    /// Wait for a format and mount slot before proceeding without one.
    pub format_mount_timeout: Duration,
}

impl Default for NodeServerConfig {
    fn default() -> Self {
        Self {
            enable_device_in_use_check: false,
            device_in_use_timeout: DEFAULT_DEVICE_IN_USE_TIMEOUT,
            enable_data_cache: false,
            data_cache_enabled_node_pool: false,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            format_mount_slots: DEFAULT_FORMAT_MOUNT_SLOTS,
            format_mount_timeout: DEFAULT_FORMAT_MOUNT_TIMEOUT,
        }
    }
}

/// The node plugin command line.
pub fn node_args() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Persistent Disk CSI Node Plugin")
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .env("KUBE_NODE_NAME")
                .required(true)
                .help("Name of the instance and of the k8s node"),
        )
        .arg(
            Arg::new("zone")
                .long("zone")
                .env("NODE_ZONE")
                .default_value("")
                .help("Zone of the instance"),
        )
        .arg(
            Arg::new("project")
                .long("project")
                .env("NODE_PROJECT")
                .default_value("")
                .help("Project owning the instance"),
        )
        .arg(
            Arg::new("machine-type")
                .long("machine-type")
                .env("NODE_MACHINE_TYPE")
                .default_value("")
                .help("Machine type of the instance, used for the attach limit"),
        )
        .arg(
            Arg::new("enable-device-in-use-check")
                .long("enable-device-in-use-check")
                .env("ENABLE_DEVICE_IN_USE_CHECK")
                .action(ArgAction::SetTrue)
                .help("Fail unstage until the device is no longer in use"),
        )
        .arg(
            Arg::new("device-in-use-timeout")
                .long("device-in-use-timeout")
                .env("DEVICE_IN_USE_TIMEOUT")
                .default_value("30s")
                .help("Give up waiting for the device to be released after this long"),
        )
        .arg(
            Arg::new("enable-data-cache")
                .long("enable-data-cache")
                .env("ENABLE_DATA_CACHE")
                .action(ArgAction::SetTrue)
                .help("Enable data cache support"),
        )
        .arg(
            Arg::new("data-cache-enabled-node-pool")
                .long("data-cache-enabled-node-pool")
                .env("DATA_CACHE_ENABLED_NODE_POOL")
                .action(ArgAction::SetTrue)
                .help("The node pool of this node has a data cache"),
        )
        .arg(
            Arg::new("sysfs-root")
                .long("sysfs-root")
                .env("SYSFS_ROOT")
                .default_value(DEFAULT_SYSFS_ROOT)
                .help("Root of the sysfs tree"),
        )
        .arg(
            Arg::new("max-concurrent-format-and-mount")
                .long("max-concurrent-format-and-mount")
                .env("MAX_CONCURRENT_FORMAT_AND_MOUNT")
                .value_parser(clap::value_parser!(i64))
                .allow_negative_numbers(true)
                .default_value("1")
                .help("Concurrent format and mount operations, 0 or less means unlimited"),
        )
        .arg(
            Arg::new("format-and-mount-timeout")
                .long("format-and-mount-timeout")
                .env("FORMAT_AND_MOUNT_TIMEOUT")
                .default_value("1m")
                .help("Wait for a format and mount slot at most this long"),
        )
}

fn duration_arg(matches: &ArgMatches, name: &str) -> anyhow::Result<Duration> {
    let value = matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("Missing value for {}", name))?;
    humantime::parse_duration(value)
        .map_err(|error| anyhow::anyhow!("Invalid value for {}, error = {}", name, error))
}

impl TryFrom<&ArgMatches> for NodeServerConfig {
    type Error = anyhow::Error;
    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let sysfs_root = matches
            .get_one::<String>("sysfs-root")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSFS_ROOT));
        if !sysfs_root.is_absolute() {
            anyhow::bail!("Invalid value for sysfs-root, must be absolute: {}", sysfs_root.display());
        }
        Ok(Self {
            enable_device_in_use_check: matches.get_flag("enable-device-in-use-check"),
            device_in_use_timeout: duration_arg(matches, "device-in-use-timeout")?,
            enable_data_cache: matches.get_flag("enable-data-cache"),
            data_cache_enabled_node_pool: matches.get_flag("data-cache-enabled-node-pool"),
            sysfs_root,
            format_mount_slots: matches
                .get_one::<i64>("max-concurrent-format-and-mount")
                .copied()
                .unwrap_or(DEFAULT_FORMAT_MOUNT_SLOTS),
            format_mount_timeout: duration_arg(matches, "format-and-mount-timeout")?,
        })
    }
}

impl TryFrom<&ArgMatches> for StaticMetadata {
    type Error = anyhow::Error;
    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let value = |name: &str| {
            matches
                .get_one::<String>(name)
                .cloned()
                .unwrap_or_default()
        };
        let name = value("node-name");
        if name.is_empty() {
            anyhow::bail!("The node name must not be empty");
        }
        Ok(Self {
            name,
            zone: value("zone"),
            project: value("project"),
            machine_type: value("machine-type"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let matches = node_args()
            .try_get_matches_from(["pd-csi-node", "--node-name", "node-1"])
            .unwrap();
        let config = NodeServerConfig::try_from(&matches).unwrap();
        assert_eq!(config, NodeServerConfig::default());

        let metadata = StaticMetadata::try_from(&matches).unwrap();
        assert_eq!(metadata, StaticMetadata::new("node-1", "", "", ""));
    }

    #[test]
    fn overrides() {
        let matches = node_args()
            .try_get_matches_from([
                "pd-csi-node",
                "--node-name",
                "node-1",
                "--zone",
                "us-central1-c",
                "--project",
                "p1",
                "--machine-type",
                "n2-standard-8",
                "--enable-device-in-use-check",
                "--device-in-use-timeout",
                "2m 30s",
                "--enable-data-cache",
                "--data-cache-enabled-node-pool",
                "--sysfs-root",
                "/tmp/sys",
                "--max-concurrent-format-and-mount",
                "-1",
                "--format-and-mount-timeout",
                "5s",
            ])
            .unwrap();
        let config = NodeServerConfig::try_from(&matches).unwrap();
        assert_eq!(
            config,
            NodeServerConfig {
                enable_device_in_use_check: true,
                device_in_use_timeout: Duration::from_secs(150),
                enable_data_cache: true,
                data_cache_enabled_node_pool: true,
                sysfs_root: PathBuf::from("/tmp/sys"),
                format_mount_slots: -1,
                format_mount_timeout: Duration::from_secs(5),
            }
        );
        let metadata = StaticMetadata::try_from(&matches).unwrap();
        assert_eq!(
            metadata,
            StaticMetadata::new("node-1", "us-central1-c", "p1", "n2-standard-8")
        );
    }

    #[test]
    fn invalid_values() {
        let matches = node_args()
            .try_get_matches_from([
                "pd-csi-node",
                "--node-name",
                "node-1",
                "--device-in-use-timeout",
                "soon",
            ])
            .unwrap();
        assert!(NodeServerConfig::try_from(&matches).is_err());

        let matches = node_args()
            .try_get_matches_from(["pd-csi-node", "--node-name", "n", "--sysfs-root", "sys"])
            .unwrap();
        assert!(NodeServerConfig::try_from(&matches).is_err());
    }
}
