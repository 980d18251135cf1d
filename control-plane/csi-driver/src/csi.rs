//! CSI node service messages and the `Node` service trait.
//!
//! These mirror the `csi.v1` node service definitions. The transport which
//! (de)serializes them on the CSI socket is owned by the hosting process.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Specify a capability of a volume.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Specifies what API the volume will be accessed using.
    pub access_type: Option<volume_capability::AccessType>,
    /// This is a REQUIRED field.
    pub access_mode: Option<volume_capability::AccessMode>,
}

/// Nested message and enum types in `VolumeCapability`.
pub mod volume_capability {
    use serde::{Deserialize, Serialize};

    /// Indicate that the volume will be accessed via the block device API.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockVolume {}

    /// Indicate that the volume will be accessed via the filesystem API.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MountVolume {
        /// The filesystem type. An empty string is equal to an unspecified field value.
        pub fs_type: String,
        /// The mount options that can be used for the volume.
        pub mount_flags: Vec<String>,
        /// If SP has VOLUME_MOUNT_GROUP node capability and CO provides this field.
        pub volume_mount_group: String,
    }

    /// Specify how a volume can be accessed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AccessMode {
        pub mode: access_mode::Mode,
    }

    /// Nested message and enum types in `AccessMode`.
    pub mod access_mode {
        use serde::{Deserialize, Serialize};

        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
        )]
        #[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
        pub enum Mode {
            #[default]
            Unknown,
            /// Can only be published once as read/write on a single node, at any given time.
            SingleNodeWriter,
            /// Can only be published once as readonly on a single node, at any given time.
            SingleNodeReaderOnly,
            /// Can be published as readonly at multiple nodes simultaneously.
            MultiNodeReaderOnly,
            /// Can be published at multiple nodes simultaneously. Only one of the node can be
            /// used as read/write. The rest will be readonly.
            MultiNodeSingleWriter,
            /// Can be published as read/write at multiple nodes simultaneously.
            MultiNodeMultiWriter,
            /// Can only be published once as read/write at a single workload on a single node.
            SingleNodeSingleWriter,
            /// Can be published as read/write at multiple workloads on a single node.
            SingleNodeMultiWriter,
        }
    }

    /// Specifies what API the volume will be accessed using.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AccessType {
        Block(BlockVolume),
        Mount(MountVolume),
    }
}

/// The capacity of the storage space in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub segments: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub publish_context: HashMap<String, String>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub volume_context: HashMap<String, String>,
}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStageVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUnstageVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub publish_context: HashMap<String, String>,
    pub staging_target_path: String,
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub volume_context: HashMap<String, String>,
}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePublishVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub staging_target_path: String,
}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsResponse {
    pub usage: Vec<VolumeUsage>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
    pub unit: volume_usage::Unit,
}

/// Nested message and enum types in `VolumeUsage`.
pub mod volume_usage {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Unit {
        #[default]
        Unknown,
        Bytes,
        Inodes,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesRequest {}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeServiceCapability>,
}

/// Specifies a capability of the node service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServiceCapability {
    pub r#type: Option<node_service_capability::Type>,
}

/// Nested message and enum types in `NodeServiceCapability`.
pub mod node_service_capability {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Rpc {
        pub r#type: rpc::Type,
    }

    /// Nested message and enum types in `Rpc`.
    pub mod rpc {
        use serde::{Deserialize, Serialize};

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Type {
            Unknown,
            StageUnstageVolume,
            GetVolumeStats,
            ExpandVolume,
            VolumeCondition,
            SingleNodeMultiWriter,
            VolumeMountGroup,
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Type {
        Rpc(Rpc),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetInfoRequest {}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: i64,
    pub accessible_topology: Option<Topology>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub capacity_range: Option<CapacityRange>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
}
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

/// The node service.
pub mod node_server {
    use super::*;
    use tonic::{Request, Response, Status};

    #[tonic::async_trait]
    pub trait Node: Send + Sync + 'static {
        async fn node_stage_volume(
            &self,
            request: Request<NodeStageVolumeRequest>,
        ) -> Result<Response<NodeStageVolumeResponse>, Status>;
        async fn node_unstage_volume(
            &self,
            request: Request<NodeUnstageVolumeRequest>,
        ) -> Result<Response<NodeUnstageVolumeResponse>, Status>;
        async fn node_publish_volume(
            &self,
            request: Request<NodePublishVolumeRequest>,
        ) -> Result<Response<NodePublishVolumeResponse>, Status>;
        async fn node_unpublish_volume(
            &self,
            request: Request<NodeUnpublishVolumeRequest>,
        ) -> Result<Response<NodeUnpublishVolumeResponse>, Status>;
        async fn node_get_volume_stats(
            &self,
            request: Request<NodeGetVolumeStatsRequest>,
        ) -> Result<Response<NodeGetVolumeStatsResponse>, Status>;
        async fn node_expand_volume(
            &self,
            request: Request<NodeExpandVolumeRequest>,
        ) -> Result<Response<NodeExpandVolumeResponse>, Status>;
        async fn node_get_capabilities(
            &self,
            request: Request<NodeGetCapabilitiesRequest>,
        ) -> Result<Response<NodeGetCapabilitiesResponse>, Status>;
        async fn node_get_info(
            &self,
            request: Request<NodeGetInfoRequest>,
        ) -> Result<Response<NodeGetInfoResponse>, Status>;
    }
}
