//! This module consists of the filesystem type definition shared by the node operations.
use strum_macros::EnumString;

/// A type to enumerate used filesystems.
#[derive(EnumString, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum FileSystem {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Ntfs,
    #[strum(default)]
    Unsupported(String),
}

impl FileSystem {
    /// The filesystem used when the volume capability does not name one.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::Ntfs
        } else {
            Self::Ext4
        }
    }
    /// Parse the `fs_type` of a mount capability, an empty value selects the platform default.
    pub fn from_fs_type(fs_type: &str) -> Self {
        if fs_type.is_empty() {
            return Self::platform_default();
        }
        // the default variant swallows anything unknown
        fs_type.parse().unwrap_or_else(|_| Self::Unsupported(fs_type.to_string()))
    }
    /// Journaled ext filesystems try to replay a dirty journal on mount, which cannot be done
    /// on a read-only device.
    pub fn replays_journal(&self) -> bool {
        matches!(self, Self::Ext3 | Self::Ext4)
    }
}

// Implement as ref for the FileSystem.
impl AsRef<str> for FileSystem {
    fn as_ref(&self) -> &str {
        match self {
            FileSystem::Ext2 => "ext2",
            FileSystem::Ext3 => "ext3",
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
            FileSystem::Btrfs => "btrfs",
            FileSystem::Ntfs => "ntfs",
            FileSystem::Unsupported(inner) => inner,
        }
    }
}

// Implement Display for the filesystem
impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
