//! The csi node service: staging, publishing and their reverse, plus stats, expansion and the
//! node info used for registration.
use crate::{
    attach_limit::{self, attach_limit_override, ATTACH_LIMIT_OVERRIDE_LABEL},
    config::NodeServerConfig,
    context::Parameters,
    csi::{
        node_server, node_service_capability,
        volume_capability::{access_mode::Mode, AccessType},
        volume_usage::Unit,
        CapacityRange, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
        NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
        NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
        NodePublishVolumeRequest, NodePublishVolumeResponse, NodeServiceCapability,
        NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
        NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
        Topology, VolumeCapability, VolumeUsage,
    },
    datacache::{DataCache, DataCacheError},
    dev::{DeviceUtils, VolumeStatter},
    device_in_use::{Clock, DeviceCheck, DeviceInUseTracker},
    filesystem::FileSystem,
    format_limiter::FormatMountLimiter,
    k8s::NodeLabels,
    limiter::VolumeLocks,
    metadata::MetadataService,
    mount::Mounter,
    mount_options::{collect_mount_options, MountPlan, NO_LOAD_FLAG, READ_ONLY_FLAG},
    volume_id::{node_id, VolumeKey},
    TOPOLOGY_KEY_ZONE,
};
use std::{collections::HashMap, os::unix::fs::OpenOptionsExt, str::FromStr, sync::Arc};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod fakes;

macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); Status::new(Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); Status::new(Code::$code, message) }};
}

/// Smallest volume which can be provisioned, and the size assumed when expanding without a
/// capacity range.
pub const MINIMUM_VOLUME_SIZE_BYTES: i64 = 1024 * 1024 * 1024;

/// The external collaborators of the node service.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub mounter: Arc<dyn Mounter>,
    pub device_utils: Arc<dyn DeviceUtils>,
    pub statter: Arc<dyn VolumeStatter>,
    pub data_cache: Arc<dyn DataCache>,
    pub metadata: Arc<dyn MetadataService>,
    /// Source of the attach limit override label, if the k8s api is reachable.
    pub node_labels: Option<Arc<dyn NodeLabels>>,
}

/// The Csi Node implementation.
#[derive(Debug)]
pub struct NodeServer {
    config: NodeServerConfig,
    mounter: Arc<dyn Mounter>,
    device_utils: Arc<dyn DeviceUtils>,
    statter: Arc<dyn VolumeStatter>,
    data_cache: Arc<dyn DataCache>,
    metadata: Arc<dyn MetadataService>,
    node_labels: Option<Arc<dyn NodeLabels>>,
    volume_locks: VolumeLocks,
    device_in_use: DeviceInUseTracker,
    format_limiter: FormatMountLimiter,
}

impl NodeServer {
    /// Creates a new node service.
    pub fn new(config: NodeServerConfig, collaborators: Collaborators) -> Self {
        let device_in_use = DeviceInUseTracker::new(config.device_in_use_timeout);
        let format_limiter =
            FormatMountLimiter::new(config.format_mount_slots, config.format_mount_timeout);
        info!(?config, "Node service configuration");
        Self {
            mounter: collaborators.mounter,
            device_utils: collaborators.device_utils,
            statter: collaborators.statter,
            data_cache: collaborators.data_cache,
            metadata: collaborators.metadata,
            node_labels: collaborators.node_labels,
            volume_locks: VolumeLocks::new(),
            device_in_use,
            format_limiter,
            config,
        }
    }
    /// Use the given clock for the device in use give-up timeout.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.device_in_use =
            DeviceInUseTracker::with_clock(self.config.device_in_use_timeout, clock);
        self
    }
    /// The in-flight volume operations.
    pub fn volume_locks(&self) -> &VolumeLocks {
        &self.volume_locks
    }
    /// The device in use tracker.
    pub fn device_in_use(&self) -> &DeviceInUseTracker {
        &self.device_in_use
    }
    /// The format and mount limiter.
    pub fn format_limiter(&self) -> &FormatMountLimiter {
        &self.format_limiter
    }

    /// A failed mount point check counts as not mounted.
    async fn is_volume_path_mounted(&self, path: &str) -> bool {
        match self.mounter.is_mount_point(path).await {
            Ok(mounted) => {
                trace!(path, mounted, "Checked if volume path is mounted");
                mounted
            }
            Err(error) => {
                debug!(path, %error, "Failed to check if volume path is mounted");
                false
            }
        }
    }

    /// Resolve the device path of the given volume id.
    async fn device_path(&self, volume_id: &str, partition: &str) -> Result<String, String> {
        let key = VolumeKey::from_str(volume_id).map_err(|error| error.to_string())?;
        self.device_utils
            .device_path(&key, partition)
            .await
            .map_err(|error| error.to_string())
    }

    /// Put the data cache in front of the device, returning the cached device path.
    async fn setup_data_cache(
        &self,
        request: &NodeStageVolumeRequest,
        device_path: &str,
    ) -> Result<String, Status> {
        let node_id = self.metadata.name();
        if node_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeStageVolume Node ID must be provided"
            ));
        }
        let mode = Parameters::DataCacheMode.value(&request.publish_context);
        let size = Parameters::DataCacheSize.value(&request.publish_context);
        if let Err(error) = self.data_cache.validate_config(mode, size) {
            if self.config.data_cache_enabled_node_pool {
                return Err(failure!(
                    Code::DataLoss,
                    "Error validate configuration for Data Cache: {}",
                    error
                ));
            }
            return Err(failure!(
                Code::InvalidArgument,
                "The Data Cache PVC is scheduled on an incompatible node pool. Please select a node pool with data cache configured: {}",
                error
            ));
        }
        if !self.config.data_cache_enabled_node_pool {
            return Err(failure!(
                Code::InvalidArgument,
                "The Data Cache PVC is scheduled on an incompatible node pool. Please select a node pool with data cache configured"
            ));
        }

        let real_path = match self.device_utils.canonicalize(device_path).await {
            Ok(real_path) => real_path,
            Err(error) => {
                error!(device = device_path, %error, "Failed to resolve the device before setting up the data cache");
                device_path.to_string()
            }
        };
        match self.data_cache.setup(&real_path, request, node_id).await {
            Ok(cached_path) => {
                info!(volume.id = %request.volume_id, device = %cached_path, "Data cache set up");
                Ok(cached_path)
            }
            Err(DataCacheError::InvalidRequest { reason }) => Err(failure!(
                Code::InvalidArgument,
                "Error setting up cache: {}",
                reason
            )),
            Err(error) => Err(failure!(Code::DataLoss, "Error setting up cache: {}", error)),
        }
    }

    /// Format and mount through the format limiter.
    async fn format_and_mount(
        &self,
        device_path: &str,
        staging_path: &str,
        fs_type: &FileSystem,
        options: &[String],
    ) -> Result<(), crate::error::DeviceError> {
        self.format_limiter
            .run(
                self.mounter
                    .format_and_mount(device_path, staging_path, fs_type, options),
            )
            .await
    }

    /// Apply the post-mount tunables of the plan.
    async fn tune_staged_volume(
        &self,
        volume_id: &str,
        device_path: &str,
        staging_path: &str,
        plan: &MountPlan,
        read_only: bool,
    ) -> Result<(), Status> {
        if let Some(read_ahead_kb) = plan.read_ahead_kb() {
            let is_block = self
                .statter
                .is_block_device(device_path)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "failure updating readahead for {} to {}KB: failed to determine whether it is a block device: {}",
                        device_path,
                        read_ahead_kb,
                        error
                    )
                })?;
            if is_block {
                self.device_utils
                    .set_read_ahead_kb(device_path, read_ahead_kb)
                    .await
                    .map_err(|error| {
                        failure!(
                            Code::Internal,
                            "failure updating readahead for {} to {}KB: {}",
                            device_path,
                            read_ahead_kb,
                            error
                        )
                    })?;
                debug!(volume.id = volume_id, device = device_path, read_ahead_kb, "Updated readahead");
            }
        }

        let tunables = plan.sysfs_tunables();
        if read_only || tunables.is_empty() {
            return Ok(());
        }
        let uuid = self
            .device_utils
            .filesystem_uuid(staging_path)
            .await
            .map_err(|error| failure!(Code::Internal, "blkid failed: {}", error))?;
        for (key, value) in tunables {
            let path = self
                .config
                .sysfs_root
                .join("fs/btrfs")
                .join(&uuid)
                .join(key);
            self.device_utils
                .write_attribute(&path, value)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "failed to write {} to {}: {}",
                        value,
                        path.display(),
                        error
                    )
                })?;
            debug!(volume.id = volume_id, key, value, "NodeStageVolume set sysfs value");
        }
        Ok(())
    }

    /// Check whether the volume's device is still referenced by anything.
    async fn check_device_unused(&self, volume_id: &str) -> DeviceCheck {
        let device_path = match self.device_path(volume_id, "").await {
            Ok(device_path) => device_path,
            Err(error) => {
                return DeviceCheck::Ignorable {
                    reason: format!("failed to find device path for volume {volume_id}: {error}"),
                }
            }
        };
        let real_path = match self.device_utils.canonicalize(&device_path).await {
            Ok(real_path) => real_path,
            Err(error) => {
                return DeviceCheck::Ignorable {
                    reason: format!("failed to resolve {device_path}: {error}"),
                }
            }
        };
        match self
            .device_utils
            .is_device_in_use(&device_path, &real_path)
            .await
        {
            Ok(false) => DeviceCheck::Unused,
            Ok(true) => DeviceCheck::Blocking {
                reason: format!("device {device_path} (aka {real_path}) is still in use"),
            },
            // the staging path is already unmounted, so not knowing is not a reason to fail
            Err(error) => DeviceCheck::Ignorable {
                reason: format!(
                    "failed to check if device {device_path} (aka {real_path}) is in use: {error}"
                ),
            },
        }
    }

    /// Undo what's left of a failed publish mount.
    async fn recover_failed_publish(&self, target_path: &str, mount_error: String) -> Status {
        match self.mounter.is_mount_point(target_path).await {
            Err(error) => {
                error!(target_path, %error, "Mount point check failed");
                return failure!(
                    Code::Internal,
                    "NodePublishVolume failed to check whether target path is a mount point: {}",
                    mount_error
                );
            }
            Ok(true) => {
                warn!(
                    target_path,
                    "Although volume mount failed, the target path is mounted already"
                );
                if let Err(error) = self.mounter.unmount(target_path).await {
                    error!(target_path, %error, "Failed to unmount");
                    return failure!(
                        Code::Internal,
                        "NodePublishVolume failed to unmount target path: {}",
                        mount_error
                    );
                }
                match self.mounter.is_mount_point(target_path).await {
                    Err(error) => {
                        error!(target_path, %error, "Mount point check failed");
                        return failure!(
                            Code::Internal,
                            "NodePublishVolume failed to check whether target path is a mount point: {}",
                            mount_error
                        );
                    }
                    Ok(true) => {
                        return failure!(
                            Code::Internal,
                            "NodePublishVolume something is wrong with mounting: {}",
                            mount_error
                        );
                    }
                    Ok(false) => {}
                }
            }
            Ok(false) => {}
        }
        if let Err(error) = remove_path(target_path) {
            error!(target_path, %error, "Failed to remove the target path");
        }
        failure!(
            Code::Internal,
            "NodePublishVolume mount of disk failed: {}",
            mount_error
        )
    }

    /// The attach limit override from the node labels, if any.
    async fn attach_limit_override(&self) -> Option<i64> {
        let node_labels = self.node_labels.as_ref()?;
        let labels = match node_labels.node_labels(self.metadata.name()).await {
            Ok(labels) => labels,
            Err(error) => {
                warn!(%error, "using default value due to err getting {}", ATTACH_LIMIT_OVERRIDE_LABEL);
                return None;
            }
        };
        match attach_limit_override(&labels) {
            Ok(Some(limit)) if limit <= 0 || limit >= 128 => {
                warn!(
                    limit,
                    "using default value due to invalid {}", ATTACH_LIMIT_OVERRIDE_LABEL
                );
                None
            }
            Ok(limit) => limit,
            Err(error) => {
                warn!(%error, "using default value");
                None
            }
        }
    }

    /// Maximum number of volumes which can be attached to this node.
    async fn volume_limits(&self) -> Result<i64, attach_limit::Error> {
        let machine_type = self.metadata.machine_type();
        if attach_limit::is_shared_core(machine_type) {
            return attach_limit::attach_limit(machine_type, None);
        }
        let attach_override = self.attach_limit_override().await;
        attach_limit::attach_limit(machine_type, attach_override)
    }
}

/// Check that the volume capability has a supported access mode and an access type.
fn validate_volume_capability(capability: &VolumeCapability) -> Result<(), String> {
    let Some(access_mode) = &capability.access_mode else {
        return Err(String::from("volume capability must specify an access mode"));
    };
    match access_mode.mode {
        Mode::SingleNodeWriter
        | Mode::SingleNodeReaderOnly
        | Mode::SingleNodeSingleWriter
        | Mode::SingleNodeMultiWriter
        | Mode::MultiNodeReaderOnly
        | Mode::MultiNodeMultiWriter => {}
        mode => return Err(format!("driver does not support access mode: {mode}")),
    }
    access_type(capability).map(|_| ())
}

/// Retrieve the AccessType from VolumeCapability.
fn access_type(capability: &VolumeCapability) -> Result<&AccessType, String> {
    capability.access_type.as_ref().ok_or_else(|| {
        String::from("volume capability must specify either mount or block mode")
    })
}

/// Whether the capability's access mode only allows reading.
fn read_only(capability: &VolumeCapability) -> Result<bool, String> {
    let Some(access_mode) = &capability.access_mode else {
        return Err(String::from("volume capability must specify an access mode"));
    };
    Ok(matches!(
        access_mode.mode,
        Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly
    ))
}

/// The size the volume must be at least after expansion.
fn request_capacity(capacity_range: Option<&CapacityRange>) -> Result<i64, String> {
    let Some(range) = capacity_range else {
        return Ok(MINIMUM_VOLUME_SIZE_BYTES);
    };
    let (required, limit) = (range.required_bytes, range.limit_bytes);
    if limit > 0 && limit < required {
        return Err(format!(
            "limit bytes {limit} is less than required bytes {required}"
        ));
    }
    if limit > 0 && limit < MINIMUM_VOLUME_SIZE_BYTES {
        return Err(format!(
            "limit bytes {limit} is less than minimum volume size: {MINIMUM_VOLUME_SIZE_BYTES}"
        ));
    }
    Ok(required.max(MINIMUM_VOLUME_SIZE_BYTES))
}

/// Create an empty file to bind mount a block device onto.
fn make_file(path: &str) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o750)
        .open(path)
        .map(|_| ())
}

/// Remove a file or an empty directory.
fn remove_path(path: &str) -> std::io::Result<()> {
    if std::path::Path::new(path).is_dir() {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[tonic::async_trait]
impl node_server::Node for NodeServer {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!("node_stage_volume {:?}", request);

        let volume_id = request.volume_id.as_str();
        let staging_path = request.staging_target_path.as_str();
        if volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeStageVolume Volume ID must be provided"
            ));
        }
        if staging_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeStageVolume Staging Target Path must be provided"
            ));
        }
        let Some(capability) = &request.volume_capability else {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeStageVolume Volume Capability must be provided"
            ));
        };

        let _guard = self.volume_locks.try_acquire(volume_id)?;

        validate_volume_capability(capability).map_err(|error| {
            failure!(Code::InvalidArgument, "VolumeCapability is invalid: {}", error)
        })?;
        let read_only = read_only(capability)
            .map_err(|error| failure!(Code::InvalidArgument, "VolumeCapability is invalid: {}", error))?;
        let plan = match access_type(capability) {
            Ok(AccessType::Mount(mount)) => Some(MountPlan::new(mount).map_err(|error| {
                failure!(Code::InvalidArgument, "failure parsing mount flags: {}", error)
            })?),
            _ => None,
        };

        let key = VolumeKey::from_str(volume_id).map_err(|error| {
            failure!(
                Code::InvalidArgument,
                "NodeStageVolume Volume ID is invalid: {}",
                error
            )
        })?;

        let partition = Parameters::partition(&request.volume_context);
        let mut device_path = self
            .device_utils
            .device_path(&key, partition)
            .await
            .map_err(|error| failure!(Code::Internal, "Error when getting device path: {}", error))?;
        info!(
            volume.id = volume_id,
            device = %device_path,
            "Successfully found attached disk {}",
            key.name()
        );

        if self.config.enable_data_cache && Parameters::has_data_cache(&request.publish_context) {
            device_path = self.setup_data_cache(&request, &device_path).await?;
        }

        if self.is_volume_path_mounted(staging_path).await {
            debug!(
                volume.id = volume_id,
                staging_path, "NodeStageVolume succeeded, mount already exists"
            );
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        if let Err(error) = std::fs::create_dir_all(staging_path) {
            return Err(failure!(
                Code::Internal,
                "mkdir failed on disk {} ({})",
                staging_path,
                error
            ));
        }

        let Some(mut plan) = plan else {
            debug!(
                volume.id = volume_id,
                staging_path, "NodeStageVolume succeeded, capability is block so this is a no-op"
            );
            return Ok(Response::new(NodeStageVolumeResponse {}));
        };

        if read_only {
            plan.push_option(READ_ONLY_FLAG);
            debug!(volume.id = volume_id, "Volume is read-only, mounting with extra option ro");
        }

        if let Err(error) = self
            .format_and_mount(&device_path, staging_path, plan.fs_type(), plan.options())
            .await
        {
            // A volume cloned or restored from a snapshot may have a dirty journal, which can't
            // be replayed on a read-only mount.
            if !(read_only && plan.fs_type().replays_journal()) {
                return Err(failure!(
                    Code::Internal,
                    "Failed to format and mount device from ({}) to ({}) with fstype ({}) and options ({:?}): {}",
                    device_path,
                    staging_path,
                    plan.fs_type(),
                    plan.options(),
                    error
                ));
            }
            debug!(
                volume.id = volume_id,
                %error,
                "Failed to mount volume read-only, retry mounting with extra option noload"
            );
            plan.push_option(NO_LOAD_FLAG);
            self.format_and_mount(&device_path, staging_path, plan.fs_type(), plan.options())
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to format and mount device from ({}) to ({}) with fstype ({}) and options ({:?}): {}",
                        device_path,
                        staging_path,
                        plan.fs_type(),
                        plan.options(),
                        error
                    )
                })?;
            // a read-only volume is never resized and the tunables aren't applied to it
            info!(
                volume.id = volume_id,
                staging_path, "NodeStageVolume succeeded with the noload option"
            );
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        if !read_only {
            self.device_utils
                .resize(&device_path, staging_path)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "error when resizing volume {} from device '{}' at path '{}': {}",
                        volume_id,
                        device_path,
                        staging_path,
                        error
                    )
                })?;
        }

        self.tune_staged_volume(volume_id, &device_path, staging_path, &plan, read_only)
            .await?;

        info!(volume.id = volume_id, staging_path, "NodeStageVolume succeeded");
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!("node_unstage_volume {:?}", request);

        let volume_id = request.volume_id.as_str();
        let staging_path = request.staging_target_path.as_str();
        if volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeUnstageVolume Volume ID must be provided"
            ));
        }
        if staging_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeUnstageVolume Staging Target Path must be provided"
            ));
        }

        let _guard = self.volume_locks.try_acquire(volume_id)?;

        if let Err(error) = self.mounter.cleanup_mount_point(staging_path).await {
            return Err(failure!(
                Code::Internal,
                "NodeUnstageVolume failed: {}. Unmounting arguments: {}",
                error,
                staging_path
            ));
        }

        if self.config.enable_device_in_use_check {
            let check = self.check_device_unused(volume_id).await;
            self.device_in_use
                .evaluate(volume_id, check)
                .map_err(|error| failure!(Code::Internal, "{}", error))?;
        }

        if self.config.enable_data_cache && self.config.data_cache_enabled_node_pool {
            let node_id = self.metadata.name();
            if let Err(error) = self.data_cache.teardown(volume_id, node_id).await {
                return Err(failure!(
                    Code::DataLoss,
                    "Failed to cleanup cache for volume {}: {}",
                    volume_id,
                    error
                ));
            }
        }

        info!(volume.id = volume_id, staging_path, "NodeUnstageVolume succeeded");
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!("node_publish_volume {:?}", request);

        let volume_id = request.volume_id.as_str();
        let staging_path = request.staging_target_path.as_str();
        let target_path = request.target_path.as_str();
        if volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodePublishVolume Volume ID must be provided"
            ));
        }
        if staging_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodePublishVolume Staging Target Path must be provided"
            ));
        }
        if target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodePublishVolume Target Path must be provided"
            ));
        }
        let Some(capability) = &request.volume_capability else {
            return Err(failure!(
                Code::InvalidArgument,
                "NodePublishVolume Volume Capability must be provided"
            ));
        };

        let _guard = self.volume_locks.try_acquire(volume_id)?;

        validate_volume_capability(capability).map_err(|error| {
            failure!(Code::InvalidArgument, "VolumeCapability is invalid: {}", error)
        })?;

        if self.is_volume_path_mounted(target_path).await {
            debug!(
                volume.id = volume_id,
                target_path, "NodePublishVolume succeeded, mount already exists"
            );
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        // bind mount so the same disk can be published more than once
        let mut options = vec!["bind".to_string()];
        if request.readonly {
            options.push(READ_ONLY_FLAG.to_string());
        }

        let (source, fs_type) = match access_type(capability) {
            Ok(AccessType::Mount(mount)) => {
                let fs_type = FileSystem::from_fs_type(&mount.fs_type);
                debug!(volume.id = volume_id, fs = %fs_type, "NodePublishVolume with filesystem");
                options.extend(collect_mount_options(&fs_type, &mount.mount_flags));
                if let Err(error) = std::fs::create_dir_all(target_path) {
                    return Err(failure!(
                        Code::Internal,
                        "mkdir failed on disk {} ({})",
                        target_path,
                        error
                    ));
                }
                (staging_path.to_string(), fs_type.to_string())
            }
            Ok(AccessType::Block(_)) => {
                debug!(volume.id = volume_id, "NodePublishVolume with block volume mode");
                let partition = Parameters::partition(&request.volume_context);
                let device_path = self
                    .device_path(volume_id, partition)
                    .await
                    .map_err(|error| {
                        failure!(Code::Internal, "Error when getting device path: {}", error)
                    })?;
                if let Err(error) = make_file(target_path) {
                    if let Err(remove_error) = remove_path(target_path) {
                        return Err(failure!(
                            Code::Internal,
                            "Error removing block file at target path {}: {}, mount error: {}",
                            target_path,
                            remove_error,
                            error
                        ));
                    }
                    return Err(failure!(
                        Code::Internal,
                        "Failed to create block file at target path {}: {}",
                        target_path,
                        error
                    ));
                }
                (device_path, String::new())
            }
            Err(error) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "NodePublishVolume {}",
                    error
                ))
            }
        };

        if let Err(error) = self
            .mounter
            .mount(&source, target_path, &fs_type, &options)
            .await
        {
            error!(target_path, %error, "Mount of disk failed");
            return Err(self
                .recover_failed_publish(target_path, error.to_string())
                .await);
        }

        info!(volume.id = volume_id, target_path, "NodePublishVolume succeeded");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!("node_unpublish_volume {:?}", request);

        let volume_id = request.volume_id.as_str();
        let target_path = request.target_path.as_str();
        if volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeUnpublishVolume Volume ID must be provided"
            ));
        }
        if target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeUnpublishVolume Target Path must be provided"
            ));
        }

        let _guard = self.volume_locks.try_acquire(volume_id)?;

        if let Err(error) = self.mounter.cleanup_mount_point(target_path).await {
            return Err(failure!(
                Code::Internal,
                "Unmount failed: {}. Unmounting arguments: {}",
                error,
                target_path
            ));
        }

        info!(volume.id = volume_id, target_path, "NodeUnpublishVolume succeeded");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let request = request.into_inner();
        trace!("node_get_volume_stats {:?}", request);

        let volume_path = request.volume_path.as_str();
        if request.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeGetVolumeStats volume ID was empty"
            ));
        }
        if volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "NodeGetVolumeStats volume path was empty"
            ));
        }

        if let Err(error) = tokio::fs::symlink_metadata(volume_path).await {
            if error.kind() == std::io::ErrorKind::NotFound {
                return Err(failure!(
                    Code::NotFound,
                    "path {} does not exist",
                    volume_path
                ));
            }
            return Err(failure!(
                Code::Internal,
                "unknown error when stat on {}: {}",
                volume_path,
                error
            ));
        }

        let is_block = self
            .statter
            .is_block_device(volume_path)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "failed to determine whether {} is block device: {}",
                    volume_path,
                    error
                )
            })?;
        if is_block {
            let total = self
                .statter
                .block_size_bytes(volume_path)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "failed to get block capacity on path {}: {}",
                        volume_path,
                        error
                    )
                })?;
            return Ok(Response::new(NodeGetVolumeStatsResponse {
                usage: vec![VolumeUsage {
                    total,
                    unit: Unit::Bytes,
                    ..Default::default()
                }],
            }));
        }

        let usage = self.statter.statfs(volume_path).await.map_err(|error| {
            failure!(
                Code::Internal,
                "failed to get fs info on path {}: {}",
                volume_path,
                error
            )
        })?;
        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: usage.available,
                    total: usage.capacity,
                    used: usage.used,
                    unit: Unit::Bytes,
                },
                VolumeUsage {
                    available: usage.inodes_free,
                    total: usage.inodes,
                    used: usage.inodes_used,
                    unit: Unit::Inodes,
                },
            ],
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        trace!("node_expand_volume {:?}", request);

        let volume_id = request.volume_id.as_str();
        let volume_path = request.volume_path.as_str();
        if volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "volume ID must be provided"
            ));
        }
        let required_bytes = request_capacity(request.capacity_range.as_ref())
            .map_err(|error| failure!(Code::InvalidArgument, "capacity range is invalid: {}", error))?;
        if volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "volume path must be provided"
            ));
        }
        let key = VolumeKey::from_str(volume_id)
            .map_err(|error| failure!(Code::InvalidArgument, "volume ID is invalid: {}", error))?;

        let device_path = self
            .device_utils
            .device_path(&key, "")
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "error when getting device path for {}: {}",
                    volume_id,
                    error
                )
            })?;

        // This is what we return for all success and no-op cases. A bigger device than
        // requested (rounding) is still a success.
        let success_result = Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: required_bytes,
        }));

        if let Some(capability) = &request.volume_capability {
            validate_volume_capability(capability).map_err(|error| {
                failure!(Code::InvalidArgument, "VolumeCapability is invalid: {}", error)
            })?;
            if matches!(access_type(capability), Ok(AccessType::Block(_))) {
                debug!(
                    volume.id = volume_id,
                    "NodeExpandVolume succeeded, capability is block so this is a no-op"
                );
                return success_result;
            }
            let read_only = read_only(capability).map_err(|error| {
                failure!(
                    Code::Internal,
                    "failed to check if capability for volume {} is readonly: {}",
                    volume_id,
                    error
                )
            })?;
            if read_only {
                debug!(
                    volume.id = volume_id,
                    "NodeExpandVolume succeeded, capability access is readonly so this is a no-op"
                );
                return success_result;
            }
        }

        let size_bytes = self
            .device_utils
            .resize(&device_path, volume_path)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "error when resizing volume {} from device '{}' at path '{}': {}",
                    key,
                    device_path,
                    volume_path,
                    error
                )
            })?;
        let size_bytes = i64::try_from(size_bytes).unwrap_or(i64::MAX);
        if size_bytes < required_bytes {
            return Err(failure!(
                Code::Internal,
                "resize requested for {} but after resize volume was size {}",
                required_bytes,
                size_bytes
            ));
        }

        info!(volume = %key, required_bytes, size_bytes, "NodeExpandVolume succeeded");
        success_result
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::ExpandVolume,
            node_service_capability::rpc::Type::GetVolumeStats,
        ];
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: capabilities
                .into_iter()
                .map(|r#type| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc { r#type },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let node_id = node_id(
            self.metadata.project(),
            self.metadata.zone(),
            self.metadata.name(),
        );
        debug!(node.id = %node_id, "NodeGetInfo request");

        let max_volumes_per_node = match self.volume_limits().await {
            Ok(limit) => limit,
            Err(error) => {
                error!(
                    %error,
                    "GetVolumeLimits failed. The error is ignored so that the driver can register"
                );
                error.fallback()
            }
        };

        Ok(Response::new(NodeGetInfoResponse {
            node_id,
            max_volumes_per_node,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(
                    TOPOLOGY_KEY_ZONE.to_string(),
                    self.metadata.zone().to_string(),
                )]),
            }),
        }))
    }
}
