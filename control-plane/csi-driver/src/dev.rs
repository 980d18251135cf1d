//! Device level collaborators: locating the attached disk, probing and tuning it.
//!
//! Persistent disks show up under `/dev/disk/by-id` with the disk name in the link name:
//! ```ignore
//!     /dev/disk/by-id/google-pvc-1234            -> ../../sdb
//!     /dev/disk/by-id/google-pvc-1234-part1      -> ../../sdb1
//!     /dev/disk/by-id/scsi-0Google_PersistentDisk_pvc-1234 -> ../../sdb
//! ```
use crate::{
    error::DeviceError,
    filesystem_ops::{ack_command_output, probe_filesystem, FileSystem},
    volume_id::VolumeKey,
};
use nix::ioctl_read;
use std::{
    fmt::Debug,
    fs,
    io::Write,
    os::{fd::AsRawFd, unix::fs::FileTypeExt},
    path::{Path, PathBuf},
};
use tokio::process::Command;
use tracing::{debug, trace};

// Nix macro to issue the BLKGETSIZE64 ioctl.
ioctl_read!(blk_get_size64, 0x12, 114, u64);

/// Default location of the stable device links.
const DISK_BY_ID: &str = "/dev/disk/by-id";

/// Disk resolution, probing and tuning.
#[tonic::async_trait]
pub trait DeviceUtils: Send + Sync + Debug {
    /// Path of the attached device (or partition) backing the given volume.
    async fn device_path(&self, key: &VolumeKey, partition: &str) -> Result<String, DeviceError>;
    /// Resolve all symlinks of the given device path.
    async fn canonicalize(&self, device_path: &str) -> Result<String, DeviceError>;
    /// Whether anything still references the device, for example a mount or a device mapper
    /// holder. `real_path` is the canonical form of `device_path`.
    async fn is_device_in_use(&self, device_path: &str, real_path: &str)
        -> Result<bool, DeviceError>;
    /// Grow the filesystem mounted at `volume_path` to fill the device, returning the device size
    /// in bytes.
    async fn resize(&self, device_path: &str, volume_path: &str) -> Result<u64, DeviceError>;
    /// Set the block device read-ahead.
    async fn set_read_ahead_kb(&self, device_path: &str, read_ahead_kb: u64)
        -> Result<(), DeviceError>;
    /// UUID of the filesystem on the given device or mount path.
    async fn filesystem_uuid(&self, path: &str) -> Result<String, DeviceError>;
    /// Write a raw attribute (eg a sysfs knob).
    async fn write_attribute(&self, path: &Path, value: &str) -> Result<(), DeviceError>;
}

/// Filesystem usage, as reported by statfs.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct FsUsage {
    pub available: i64,
    pub capacity: i64,
    pub used: i64,
    pub inodes_free: i64,
    pub inodes: i64,
    pub inodes_used: i64,
}

/// Volume statistics.
#[tonic::async_trait]
pub trait VolumeStatter: Send + Sync + Debug {
    /// Whether the path is a block device file.
    async fn is_block_device(&self, path: &str) -> Result<bool, DeviceError>;
    /// Size of the block device in bytes.
    async fn block_size_bytes(&self, path: &str) -> Result<i64, DeviceError>;
    /// Usage of the filesystem holding `path`.
    async fn statfs(&self, path: &str) -> Result<FsUsage, DeviceError>;
}

/// Linux implementation of `DeviceUtils`.
#[derive(Debug, Clone)]
pub struct LinuxDeviceUtils {
    by_id: PathBuf,
    sysfs_root: PathBuf,
}

impl LinuxDeviceUtils {
    /// Return a new `Self` using the given sysfs root.
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            by_id: PathBuf::from(DISK_BY_ID),
            sysfs_root: sysfs_root.into(),
        }
    }
    /// Look up the device links in a different directory.
    pub fn with_by_id(mut self, by_id: impl Into<PathBuf>) -> Self {
        self.by_id = by_id.into();
        self
    }

    /// All the link names a disk with this name may show up as.
    fn candidates(&self, name: &str, partition: &str) -> Vec<String> {
        let name = glob::Pattern::escape(name);
        let suffix = if partition.is_empty() {
            String::new()
        } else {
            format!("-part{}", glob::Pattern::escape(partition))
        };
        vec![
            format!("{}/google-{name}{suffix}", self.by_id.display()),
            format!(
                "{}/*Google_PersistentDisk_{name}{suffix}",
                self.by_id.display()
            ),
        ]
    }

    /// Find the first existing device link matching one of the candidate patterns.
    fn find_device_link(&self, name: &str, partition: &str) -> Result<String, DeviceError> {
        for pattern in self.candidates(name, partition) {
            let paths = glob::glob(&pattern)
                .map_err(|error| DeviceError::from(format!("bad pattern {pattern}: {error}")))?;
            if let Some(path) = paths.flatten().next() {
                return Ok(path.to_string_lossy().to_string());
            }
        }
        Err(DeviceError::from(format!(
            "unable to find the device link for disk {name} under {}",
            self.by_id.display()
        )))
    }
}

#[tonic::async_trait]
impl DeviceUtils for LinuxDeviceUtils {
    async fn device_path(&self, key: &VolumeKey, partition: &str) -> Result<String, DeviceError> {
        let path = self.find_device_link(key.name(), partition)?;
        debug!(volume = %key, device = %path, "Found device path");
        Ok(path)
    }

    async fn canonicalize(&self, device_path: &str) -> Result<String, DeviceError> {
        let path = tokio::fs::canonicalize(device_path).await?;
        Ok(path.to_string_lossy().to_string())
    }

    async fn is_device_in_use(
        &self,
        device_path: &str,
        real_path: &str,
    ) -> Result<bool, DeviceError> {
        let mountinfo = tokio::fs::read_to_string("/proc/self/mountinfo").await?;
        if let Some(entry) = mountinfo.lines().find_map(|line| {
            let source = line.split(" - ").nth(1)?.split_whitespace().nth(1)?;
            (source == device_path || source == real_path).then(|| line.to_string())
        }) {
            debug!(device = real_path, mount = %entry, "Device is still mounted");
            return Ok(true);
        }

        let Some(name) = Path::new(real_path).file_name() else {
            return Err(DeviceError::from(format!("invalid device path {real_path}")));
        };
        let holders = self
            .sysfs_root
            .join("class/block")
            .join(name)
            .join("holders");
        match fs::read_dir(&holders) {
            Ok(mut entries) => {
                let held = entries.next().is_some();
                if held {
                    debug!(device = real_path, "Device is still held");
                }
                Ok(held)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(DeviceError::from(error)
                .context(&format!("failed to list {}", holders.display()))),
        }
    }

    async fn resize(&self, device_path: &str, volume_path: &str) -> Result<u64, DeviceError> {
        let fs = probe_filesystem(device_path).await?.ok_or_else(|| {
            DeviceError::from(format!("no filesystem found on device {device_path}"))
        })?;
        FileSystem::from(fs)
            .fs_ops()?
            .expand(device_path, volume_path)
            .await?;
        block_device_size(device_path).await
    }

    async fn set_read_ahead_kb(
        &self,
        device_path: &str,
        read_ahead_kb: u64,
    ) -> Result<(), DeviceError> {
        // blockdev takes the read-ahead in 512-byte sectors
        let sectors = read_ahead_kb.checked_mul(2).ok_or_else(|| {
            DeviceError::from(format!("read ahead of {read_ahead_kb}KiB is out of range"))
        })?;
        let binary = "blockdev";
        let output = Command::new(binary)
            .arg("--setra")
            .arg(sectors.to_string())
            .arg(device_path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary)?;
        Ok(())
    }

    async fn filesystem_uuid(&self, path: &str) -> Result<String, DeviceError> {
        let binary = "blkid";
        let output = Command::new(binary)
            .args(["--match-tag", "UUID", "--output", "value"])
            .arg(path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        let stdout = ack_command_output(output, binary)?;
        let uuid = uuid::Uuid::parse_str(stdout.trim())?;
        Ok(uuid.to_string())
    }

    async fn write_attribute(&self, path: &Path, value: &str) -> Result<(), DeviceError> {
        trace!(path = %path.display(), value, "Writing attribute");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|error| {
                DeviceError::from(error).context(&format!("failed to open {}", path.display()))
            })?;
        file.write_all(value.as_bytes()).map_err(|error| {
            DeviceError::from(error).context(&format!("failed to write {}", path.display()))
        })?;
        Ok(())
    }
}

/// Size of a block device in bytes, via the BLKGETSIZE64 ioctl.
async fn block_device_size(device_path: &str) -> Result<u64, DeviceError> {
    let device_path = device_path.to_string();
    tokio::task::spawn_blocking(move || -> Result<u64, DeviceError> {
        let file = fs::File::open(&device_path)?;
        let mut size = 0u64;
        unsafe { blk_get_size64(file.as_raw_fd(), &mut size) }?;
        Ok(size)
    })
    .await?
}

/// Linux implementation of `VolumeStatter`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxStatter;

#[tonic::async_trait]
impl VolumeStatter for LinuxStatter {
    async fn is_block_device(&self, path: &str) -> Result<bool, DeviceError> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(metadata.file_type().is_block_device())
    }

    async fn block_size_bytes(&self, path: &str) -> Result<i64, DeviceError> {
        let size = block_device_size(path).await?;
        i64::try_from(size).map_err(|_| DeviceError::from(format!("device {path} is too large")))
    }

    async fn statfs(&self, path: &str) -> Result<FsUsage, DeviceError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<FsUsage, DeviceError> {
            let stat = nix::sys::statfs::statfs(path.as_str())?;
            let block_size = stat.block_size() as i64;
            let blocks = stat.blocks() as i64;
            let available = stat.blocks_available() as i64;
            let files = stat.files() as i64;
            let files_free = stat.files_free() as i64;
            Ok(FsUsage {
                available: available * block_size,
                capacity: blocks * block_size,
                used: (blocks - stat.blocks_free() as i64) * block_size,
                inodes_free: files_free,
                inodes: files,
                inodes_used: files - files_free,
            })
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pd-dev-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn device_links() {
        let by_id = scratch_dir();
        fs::write(by_id.join("google-pvc-1"), "").unwrap();
        fs::write(by_id.join("google-pvc-1-part1"), "").unwrap();
        fs::write(by_id.join("scsi-0Google_PersistentDisk_pvc-2"), "").unwrap();
        let utils = LinuxDeviceUtils::new("/sys").with_by_id(&by_id);

        let key = VolumeKey::from_str("projects/p/zones/z/disks/pvc-1").unwrap();
        let path = utils.device_path(&key, "").await.unwrap();
        assert!(path.ends_with("/google-pvc-1"), "{path}");
        let path = utils.device_path(&key, "1").await.unwrap();
        assert!(path.ends_with("/google-pvc-1-part1"), "{path}");

        let key = VolumeKey::from_str("projects/p/zones/z/disks/pvc-2").unwrap();
        let path = utils.device_path(&key, "").await.unwrap();
        assert!(path.ends_with("/scsi-0Google_PersistentDisk_pvc-2"), "{path}");

        let key = VolumeKey::from_str("projects/p/zones/z/disks/pvc-3").unwrap();
        assert!(utils.device_path(&key, "").await.is_err());

        fs::remove_dir_all(by_id).unwrap();
    }

    #[test]
    fn device_links_match_literally() {
        let by_id = scratch_dir();
        fs::write(by_id.join("google-pvc-1"), "").unwrap();
        fs::write(by_id.join("google-pvc-1-part1"), "").unwrap();
        fs::write(by_id.join("scsi-0Google_PersistentDisk_pvc-2"), "").unwrap();
        let utils = LinuxDeviceUtils::new("/sys").with_by_id(&by_id);

        for name in ["pvc-*", "pvc-?", "pvc-[12]", "*"] {
            assert!(utils.find_device_link(name, "").is_err(), "{name}");
        }
        assert!(utils.find_device_link("pvc-1", "*").is_err());
        assert!(utils.find_device_link("pvc-1", "1").is_ok());

        fs::remove_dir_all(by_id).unwrap();
    }

    #[tokio::test]
    async fn read_ahead_out_of_range() {
        let utils = LinuxDeviceUtils::new("/sys");
        let error = utils
            .set_read_ahead_kb("/dev/pd-test-missing", u64::MAX)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("out of range"), "{error}");
    }

    #[tokio::test]
    async fn sysfs_holders() {
        let sysfs = scratch_dir();
        let holders = sysfs.join("class/block/pd-test-dev/holders");
        fs::create_dir_all(&holders).unwrap();
        let utils = LinuxDeviceUtils::new(&sysfs);

        let device = "/dev/pd-test-dev";
        assert!(!utils.is_device_in_use(device, device).await.unwrap());
        fs::write(holders.join("dm-0"), "").unwrap();
        assert!(utils.is_device_in_use(device, device).await.unwrap());

        // unknown devices have no holders
        let device = "/dev/pd-test-missing";
        assert!(!utils.is_device_in_use(device, device).await.unwrap());

        fs::remove_dir_all(sysfs).unwrap();
    }

    #[tokio::test]
    async fn attribute_writes() {
        let dir = scratch_dir();
        let knob = dir.join("bg_reclaim_threshold");
        fs::write(&knob, "0\n").unwrap();

        let utils = LinuxDeviceUtils::new(&dir);
        utils.write_attribute(&knob, "90").await.unwrap();
        assert_eq!(fs::read_to_string(&knob).unwrap(), "90");
        assert!(utils
            .write_attribute(&dir.join("missing/knob"), "1")
            .await
            .is_err());

        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn statter() {
        let dir = scratch_dir();
        let statter = LinuxStatter;
        assert!(!statter.is_block_device(dir.to_str().unwrap()).await.unwrap());
        let usage = statter.statfs(dir.to_str().unwrap()).await.unwrap();
        assert!(usage.capacity > 0);
        assert_eq!(usage.inodes, usage.inodes_free + usage.inodes_used);
        let error = statter.is_block_device("/pd-test/missing").await.unwrap_err();
        assert!(error.is_not_found());
        fs::remove_dir_all(dir).unwrap();
    }
}
