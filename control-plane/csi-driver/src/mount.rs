//! Mounting, unmounting and mount point probing.
use crate::{error::DeviceError, filesystem::FileSystem};
use std::{fmt::Debug, path::Path};

/// Mount primitives used by the node operations.
#[tonic::async_trait]
pub trait Mounter: Send + Sync + Debug {
    /// Format the device with `fs_type` unless it already holds a filesystem, then mount it.
    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &FileSystem,
        options: &[String],
    ) -> Result<(), DeviceError>;
    /// Mount `source` onto `target`. Bind mounts carry `bind` in their options.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DeviceError>;
    /// Unmount whatever is mounted on `target`.
    async fn unmount(&self, target: &str) -> Result<(), DeviceError>;
    /// Whether `path` is a mount point.
    async fn is_mount_point(&self, path: &str) -> Result<bool, DeviceError>;
    /// Unmount `path` if it's mounted and then remove it. A missing path is not an error.
    async fn cleanup_mount_point(&self, path: &str) -> Result<(), DeviceError>;
}

/// Find the mountinfo entry whose mount point is `path`, returning its source.
fn mountinfo_source(mountinfo: &str, path: &Path) -> Option<String> {
    mountinfo.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let mount_point = fields.nth(4)?;
        if Path::new(&unescape(mount_point)) != path {
            return None;
        }
        let source = line.split(" - ").nth(1)?.split_whitespace().nth(1)?;
        Some(source.to_string())
    })
}

/// mountinfo escapes spaces, tabs, newlines and backslashes as octal.
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(target_os = "linux")]
pub use linux::LinuxMounter;

#[cfg(target_os = "linux")]
mod linux {
    use super::{mountinfo_source, Mounter};
    use crate::{
        error::DeviceError,
        filesystem::FileSystem,
        filesystem_ops::{self, probe_filesystem},
        mount_options::READ_ONLY_FLAG,
    };
    use std::{
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
    };
    use sys_mount::{Mount, MountFlags, UnmountFlags};
    use tracing::{debug, info, warn};

    /// Mounter backed by the mount syscalls.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LinuxMounter;

    /// Split mount options into the syscall flags and the filesystem specific data.
    pub(super) fn parse_options(options: &[String]) -> (MountFlags, String) {
        let mut flags = MountFlags::empty();
        let mut data = Vec::new();
        for option in options {
            match option.as_str() {
                "defaults" | "rw" => {}
                "ro" => flags |= MountFlags::RDONLY,
                "bind" => flags |= MountFlags::BIND,
                "rbind" => flags |= MountFlags::BIND | MountFlags::REC,
                "noatime" => flags |= MountFlags::NOATIME,
                "nodiratime" => flags |= MountFlags::NODIRATIME,
                "relatime" => flags |= MountFlags::RELATIME,
                "strictatime" => flags |= MountFlags::STRICTATIME,
                "nodev" => flags |= MountFlags::NODEV,
                "noexec" => flags |= MountFlags::NOEXEC,
                "nosuid" => flags |= MountFlags::NOSUID,
                "sync" => flags |= MountFlags::SYNCHRONOUS,
                "dirsync" => flags |= MountFlags::DIRSYNC,
                other => data.push(other),
            }
        }
        (flags, data.join(","))
    }

    fn mount_blocking(
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DeviceError> {
        let (flags, data) = parse_options(options);
        if flags.contains(MountFlags::BIND) {
            // the bind ignores every other flag, so they're applied by a remount
            Mount::builder()
                .fstype("none")
                .flags(flags & (MountFlags::BIND | MountFlags::REC))
                .mount(source, target)?;
            let remount = flags - MountFlags::REC;
            if remount.bits() != MountFlags::BIND.bits() {
                Mount::builder()
                    .fstype("none")
                    .flags(remount | MountFlags::REMOUNT)
                    .mount(source, target)?;
            }
        } else {
            let mut builder = Mount::builder().fstype(fs_type).flags(flags);
            if !data.is_empty() {
                builder = builder.data(&data);
            }
            builder.mount(source, target)?;
        }
        Ok(())
    }

    fn is_mount_point_blocking(path: &str) -> Result<bool, DeviceError> {
        let path = std::fs::canonicalize(path)?;
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        if mountinfo_source(&mountinfo, &path).is_some() {
            return Ok(true);
        }
        let Some(parent) = path.parent() else {
            // the root is always a mount point
            return Ok(true);
        };
        let dev = std::fs::metadata(&path)?.dev();
        let parent_dev = std::fs::metadata(parent)?.dev();
        Ok(dev != parent_dev)
    }

    fn unmount_blocking(target: &str) -> Result<(), DeviceError> {
        sys_mount::unmount(target, UnmountFlags::empty())
            .map_err(|error| DeviceError::from(error).context(&format!("failed to unmount {target}")))
    }

    fn cleanup_blocking(path: &str) -> Result<(), DeviceError> {
        let path_buf = PathBuf::from(path);
        if !path_buf.exists() {
            debug!(path, "Mount point does not exist, skipping");
            return Ok(());
        }
        if is_mount_point_blocking(path)? {
            unmount_blocking(path)?;
        }
        remove(&path_buf)
    }

    fn remove(path: &Path) -> Result<(), DeviceError> {
        let result = if path.is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(DeviceError::from(error)
                .context(&format!("failed to remove {}", path.display()))),
        }
    }

    async fn blocking<T, F>(f: F) -> Result<T, DeviceError>
    where
        F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await?
    }

    #[tonic::async_trait]
    impl Mounter for LinuxMounter {
        async fn format_and_mount(
            &self,
            source: &str,
            target: &str,
            fs_type: &FileSystem,
            options: &[String],
        ) -> Result<(), DeviceError> {
            let existing = probe_filesystem(source).await?;
            match &existing {
                None if options.iter().any(|o| o == READ_ONLY_FLAG) => {
                    return Err(DeviceError::from(format!(
                        "cannot format the read-only device {source} with {fs_type}"
                    )));
                }
                None => {
                    info!(device = source, fs = %fs_type, "Formatting device");
                    filesystem_ops::FileSystem::from(fs_type.clone())
                        .fs_ops()?
                        .create(source)
                        .await?;
                }
                Some(existing) if existing != fs_type => {
                    warn!(
                        device = source,
                        existing = %existing,
                        requested = %fs_type,
                        "Device is formatted with a different filesystem"
                    );
                }
                Some(_) => {}
            }
            self.mount(source, target, fs_type.as_ref(), options)
                .await
                .map_err(|error| match existing {
                    Some(existing) if &existing != fs_type => error.context(&format!(
                        "device {source} holds {existing} but {fs_type} was requested"
                    )),
                    _ => error,
                })
        }

        async fn mount(
            &self,
            source: &str,
            target: &str,
            fs_type: &str,
            options: &[String],
        ) -> Result<(), DeviceError> {
            debug!(source, target, fs_type, ?options, "Mounting");
            let (source, target, fs_type) =
                (source.to_string(), target.to_string(), fs_type.to_string());
            let options = options.to_vec();
            blocking(move || mount_blocking(&source, &target, &fs_type, &options)).await
        }

        async fn unmount(&self, target: &str) -> Result<(), DeviceError> {
            debug!(target, "Unmounting");
            let target = target.to_string();
            blocking(move || unmount_blocking(&target)).await
        }

        async fn is_mount_point(&self, path: &str) -> Result<bool, DeviceError> {
            let path = path.to_string();
            blocking(move || is_mount_point_blocking(&path)).await
        }

        async fn cleanup_mount_point(&self, path: &str) -> Result<(), DeviceError> {
            let path = path.to_string();
            blocking(move || cleanup_blocking(&path)).await
        }
    }
}
