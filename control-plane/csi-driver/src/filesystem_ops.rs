//! This module consists of the various filesystem specific operations utility: creation of the
//! filesystem, growing it to fill its device and probing a device for an existing filesystem.

use crate::{error::DeviceError, filesystem::FileSystem as Fs};
use std::process::Output;
use tokio::process::Command;
use tonic::async_trait;
use tracing::{debug, trace};

/// blkid exit code when the requested tag could not be found.
const BLKID_NOT_FOUND: i32 = 2;

/// ext2/3/4 filesystem types.
pub(crate) struct ExtFs {
    mkfs: &'static str,
}
/// XFS filesystem type.
pub(crate) struct XFs;
/// BTRFS filesystem type.
pub(crate) struct BtrFs;

/// Filesystem type for node ops, wrapper over the parent Filesystem enum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FileSystem(Fs);

impl From<Fs> for FileSystem {
    fn from(value: Fs) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_ref())
    }
}

impl FileSystem {
    /// Convert the top level enumeration to specific filesystem types to access the supported
    /// operations by them.
    pub(crate) fn fs_ops(&self) -> Result<&dyn FileSystemOps, DeviceError> {
        static EXT2FS: ExtFs = ExtFs { mkfs: "mkfs.ext2" };
        static EXT3FS: ExtFs = ExtFs { mkfs: "mkfs.ext3" };
        static EXT4FS: ExtFs = ExtFs { mkfs: "mkfs.ext4" };
        static XFS: XFs = XFs {};
        static BTRFS: BtrFs = BtrFs {};
        match self.0 {
            Fs::Ext2 => Ok(&EXT2FS),
            Fs::Ext3 => Ok(&EXT3FS),
            Fs::Ext4 => Ok(&EXT4FS),
            Fs::Xfs => Ok(&XFS),
            Fs::Btrfs => Ok(&BTRFS),
            _ => Err(DeviceError::from(format!("Unsupported filesystem {self}"))),
        }
    }
}

#[async_trait]
pub(crate) trait FileSystemOps: Send + Sync {
    /// Create the filesystem using its fs util.
    async fn create(&self, device: &str) -> Result<(), DeviceError>;
    /// Grow the filesystem mounted at `path` to fill its device.
    async fn expand(&self, device: &str, path: &str) -> Result<(), DeviceError>;
}

#[async_trait]
impl FileSystemOps for ExtFs {
    async fn create(&self, device: &str) -> Result<(), DeviceError> {
        let binary = self.mkfs;
        let output = Command::new(binary)
            .args(["-F", "-m0"])
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }

    async fn expand(&self, device: &str, _path: &str) -> Result<(), DeviceError> {
        let binary = "resize2fs";
        let output = Command::new(binary)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }
}

#[async_trait]
impl FileSystemOps for XFs {
    async fn create(&self, device: &str) -> Result<(), DeviceError> {
        let binary = "mkfs.xfs";
        let args = match std::env::var("MKFS_XFS_ARGS") {
            Ok(args) => args
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>(),
            _ => vec![],
        };
        let output = Command::new(binary)
            .args(args)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }

    /// xfs can only be grown while mounted, so this works on the mount path.
    async fn expand(&self, _device: &str, path: &str) -> Result<(), DeviceError> {
        let binary = "xfs_growfs";
        let output = Command::new(binary)
            .arg(path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }
}

#[async_trait]
impl FileSystemOps for BtrFs {
    async fn create(&self, device: &str) -> Result<(), DeviceError> {
        let binary = "mkfs.btrfs";
        let output = Command::new(binary)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }

    async fn expand(&self, _device: &str, path: &str) -> Result<(), DeviceError> {
        let binary = "btrfs";
        let output = Command::new(binary)
            .args(["filesystem", "resize", "max"])
            .arg(path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }
}

/// Probe the device for an existing filesystem, None if it has none.
pub(crate) async fn probe_filesystem(device: &str) -> Result<Option<Fs>, DeviceError> {
    let binary = "blkid";
    let output = Command::new(binary)
        .args(["-p", "-s", "TYPE", "-o", "value"])
        .arg(device)
        .output()
        .await
        .map_err(|error| format!("failed to execute {binary}: {error}"))?;
    if output.status.code() == Some(BLKID_NOT_FOUND) {
        debug!(device, "No filesystem found on device");
        return Ok(None);
    }
    let fs_type = ack_command_output(output, binary)?;
    match fs_type.trim() {
        "" => Ok(None),
        fs_type => Ok(Some(Fs::from_fs_type(fs_type))),
    }
}

// Acknowledge the output from Command, returning its stdout.
pub(crate) fn ack_command_output(output: Output, binary: &str) -> Result<String, DeviceError> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    trace!(
        "Output from {} command: {}, status code: {:?}",
        binary,
        stdout,
        output.status.code()
    );

    if output.status.success() {
        return Ok(stdout);
    }

    Err(DeviceError::from(format!(
        "{} command failed: {}",
        binary,
        String::from_utf8_lossy(&output.stderr)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn supported_filesystems() {
        for fs in [Fs::Ext2, Fs::Ext3, Fs::Ext4, Fs::Xfs, Fs::Btrfs] {
            assert!(FileSystem::from(fs).fs_ops().is_ok());
        }
        let error = FileSystem::from(Fs::Ntfs).fs_ops().err().unwrap();
        assert_eq!(error.to_string(), "Unsupported filesystem ntfs");
    }

    #[test]
    fn command_output() {
        let output = Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: b"ext4\n".to_vec(),
            stderr: vec![],
        };
        assert_eq!(ack_command_output(output, "blkid").unwrap(), "ext4\n");

        // exit code 1
        let output = Output {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stdout: vec![],
            stderr: b"bad superblock".to_vec(),
        };
        let error = ack_command_output(output, "resize2fs").unwrap_err();
        assert_eq!(error.to_string(), "resize2fs command failed: bad superblock");
    }
}
