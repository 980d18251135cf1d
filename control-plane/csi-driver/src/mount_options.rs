//! Mount option pipeline.
//!
//! Some tunables are passed by users as pseudo mount flags in the storage class, since there is
//! no other way of handing them through to the node. They must be pulled out of the option list
//! before it reaches the mount syscall, which would otherwise reject them.
use crate::{csi::volume_capability::MountVolume, filesystem::FileSystem};
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::Snafu;

/// `nouuid` mount flag, to allow duplicate fs uuid.
pub const XFS_NO_UUID_FLAG: &str = "nouuid";
/// Read-only mount flag.
pub const READ_ONLY_FLAG: &str = "ro";
/// Skip the journal replay of ext3/ext4 filesystems.
pub const NO_LOAD_FLAG: &str = "noload";

static READ_AHEAD_KB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^read_ahead_kb=(.+)$").expect("valid regex"));
static BTRFS_DATA_RECLAIM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^btrfs-allocation-data-bg_reclaim_threshold=(\d{1,2})$").expect("valid regex")
});
static BTRFS_METADATA_RECLAIM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^btrfs-allocation-metadata-bg_reclaim_threshold=(\d{1,2})$")
        .expect("valid regex")
});

/// Mount option errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display(
        "Invalid read_ahead_kb mount flag {flag}: must be a non-negative integer below 2^63"
    ))]
    InvalidReadAhead { flag: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        tonic::Status::invalid_argument(error.to_string())
    }
}

/// Everything needed to format and mount a filesystem volume, derived from its capability.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MountPlan {
    fs_type: FileSystem,
    options: Vec<String>,
    read_ahead_kb: Option<u64>,
    btrfs_data_reclaim: Option<String>,
    btrfs_metadata_reclaim: Option<String>,
}

impl MountPlan {
    /// Build the plan for the given mount capability.
    pub fn new(mount: &MountVolume) -> Result<Self, Error> {
        let fs_type = FileSystem::from_fs_type(&mount.fs_type);
        let read_ahead_kb = read_ahead_kb(&mount.mount_flags)?;
        let (btrfs_data_reclaim, btrfs_metadata_reclaim) = match fs_type {
            FileSystem::Btrfs => (
                last_capture(&BTRFS_DATA_RECLAIM, &mount.mount_flags),
                last_capture(&BTRFS_METADATA_RECLAIM, &mount.mount_flags),
            ),
            _ => (None, None),
        };
        let options = collect_mount_options(&fs_type, &mount.mount_flags);
        Ok(Self {
            fs_type,
            options,
            read_ahead_kb,
            btrfs_data_reclaim,
            btrfs_metadata_reclaim,
        })
    }
    /// The filesystem to format and mount.
    pub fn fs_type(&self) -> &FileSystem {
        &self.fs_type
    }
    /// The options to hand to the mount syscall.
    pub fn options(&self) -> &[String] {
        &self.options
    }
    /// Add an option, unless it's already present.
    pub fn push_option(&mut self, option: &str) {
        if !self.options.iter().any(|o| o == option) {
            self.options.push(option.to_string());
        }
    }
    /// The requested block device read-ahead, in KiB.
    pub fn read_ahead_kb(&self) -> Option<u64> {
        self.read_ahead_kb
    }
    /// The btrfs sysfs tunables to apply after mounting, as (relative attribute path, value).
    pub fn sysfs_tunables(&self) -> Vec<(&'static str, &str)> {
        let mut tunables = Vec::new();
        if let Some(value) = &self.btrfs_data_reclaim {
            tunables.push(("allocation/data/bg_reclaim_threshold", value.as_str()));
        }
        if let Some(value) = &self.btrfs_metadata_reclaim {
            tunables.push(("allocation/metadata/bg_reclaim_threshold", value.as_str()));
        }
        tunables
    }
}

/// Filter out the pseudo flags and add any filesystem specific defaults.
pub fn collect_mount_options(fs_type: &FileSystem, flags: &[String]) -> Vec<String> {
    let mut options = flags
        .iter()
        .filter(|flag| {
            !READ_AHEAD_KB.is_match(flag)
                && !BTRFS_DATA_RECLAIM.is_match(flag)
                && !BTRFS_METADATA_RECLAIM.is_match(flag)
        })
        .cloned()
        .collect::<Vec<_>>();
    if fs_type == &FileSystem::Xfs && !options.iter().any(|o| o == XFS_NO_UUID_FLAG) {
        options.push(XFS_NO_UUID_FLAG.to_string());
    }
    options
}

/// The first `read_ahead_kb` flag wins.
fn read_ahead_kb(flags: &[String]) -> Result<Option<u64>, Error> {
    let Some((flag, value)) = flags.iter().find_map(|flag| {
        READ_AHEAD_KB
            .captures(flag)
            .and_then(|c| c.get(1))
            .map(|value| (flag, value.as_str()))
    }) else {
        return Ok(None);
    };
    // blockdev takes sectors, so twice the value has to fit
    value
        .parse::<u64>()
        .ok()
        .filter(|kb| kb.checked_mul(2).is_some())
        .map(Some)
        .ok_or_else(|| Error::InvalidReadAhead { flag: flag.clone() })
}

/// The last matching flag wins.
fn last_capture(regex: &Regex, flags: &[String]) -> Option<String> {
    flags
        .iter()
        .filter_map(|flag| regex.captures(flag).and_then(|c| c.get(1)))
        .last()
        .map(|value| value.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(fs_type: &str, flags: &[&str]) -> MountVolume {
        MountVolume {
            fs_type: fs_type.to_string(),
            mount_flags: flags.iter().map(ToString::to_string).collect(),
            volume_mount_group: String::new(),
        }
    }

    #[test]
    fn read_ahead_is_extracted() {
        let plan = MountPlan::new(&mount("ext4", &["read_ahead_kb=128", "noatime"])).unwrap();
        assert_eq!(plan.options(), ["noatime"]);
        assert_eq!(plan.read_ahead_kb(), Some(128));
        assert!(plan.sysfs_tunables().is_empty());

        let plan = MountPlan::new(&mount("", &["read_ahead_kb=0", "read_ahead_kb=64"])).unwrap();
        assert_eq!(plan.fs_type(), &FileSystem::platform_default());
        assert_eq!(plan.read_ahead_kb(), Some(0));
        assert!(plan.options().is_empty());
    }

    #[test]
    fn invalid_read_ahead() {
        for flag in [
            "read_ahead_kb=-1",
            "read_ahead_kb=abc",
            "read_ahead_kb=1.5",
            "read_ahead_kb=9223372036854775808",
            "read_ahead_kb=18446744073709551615",
        ] {
            let error = MountPlan::new(&mount("ext4", &[flag])).unwrap_err();
            assert_eq!(
                tonic::Status::from(error).code(),
                tonic::Code::InvalidArgument,
                "{flag}"
            );
        }
    }

    #[test]
    fn largest_read_ahead() {
        let plan =
            MountPlan::new(&mount("ext4", &["read_ahead_kb=9223372036854775807"])).unwrap();
        assert_eq!(plan.read_ahead_kb(), Some(u64::MAX / 2));
    }

    #[test]
    fn btrfs_tunables() {
        let plan = MountPlan::new(&mount(
            "btrfs",
            &[
                "btrfs-allocation-data-bg_reclaim_threshold=10",
                "btrfs-allocation-data-bg_reclaim_threshold=90",
                "btrfs-allocation-metadata-bg_reclaim_threshold=5",
                "compress=zstd",
            ],
        ))
        .unwrap();
        assert_eq!(plan.options(), ["compress=zstd"]);
        assert_eq!(
            plan.sysfs_tunables(),
            vec![
                ("allocation/data/bg_reclaim_threshold", "90"),
                ("allocation/metadata/bg_reclaim_threshold", "5"),
            ]
        );
    }

    #[test]
    fn btrfs_tunables_only_for_btrfs() {
        let plan = MountPlan::new(&mount(
            "ext4",
            &["btrfs-allocation-data-bg_reclaim_threshold=10"],
        ))
        .unwrap();
        assert!(plan.options().is_empty());
        assert!(plan.sysfs_tunables().is_empty());

        // three digits don't match, so the flag is passed through untouched
        let plan = MountPlan::new(&mount(
            "btrfs",
            &["btrfs-allocation-data-bg_reclaim_threshold=100"],
        ))
        .unwrap();
        assert_eq!(
            plan.options(),
            ["btrfs-allocation-data-bg_reclaim_threshold=100"]
        );
        assert!(plan.sysfs_tunables().is_empty());
    }

    #[test]
    fn xfs_nouuid() {
        let plan = MountPlan::new(&mount("xfs", &["noatime"])).unwrap();
        assert_eq!(plan.options(), ["noatime", XFS_NO_UUID_FLAG]);
        let plan = MountPlan::new(&mount("xfs", &[XFS_NO_UUID_FLAG])).unwrap();
        assert_eq!(plan.options(), [XFS_NO_UUID_FLAG]);
    }

    #[test]
    fn extra_options() {
        let mut plan = MountPlan::new(&mount("ext4", &["noatime"])).unwrap();
        plan.push_option(READ_ONLY_FLAG);
        plan.push_option(READ_ONLY_FLAG);
        plan.push_option(NO_LOAD_FLAG);
        assert_eq!(plan.options(), ["noatime", READ_ONLY_FLAG, NO_LOAD_FLAG]);
    }
}
