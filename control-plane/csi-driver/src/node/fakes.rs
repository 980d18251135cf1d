//! In-memory collaborators for the node service tests.
use crate::{
    csi::NodeStageVolumeRequest,
    datacache::{DataCache, DataCacheError},
    dev::{DeviceUtils, FsUsage, VolumeStatter},
    error::DeviceError,
    filesystem::FileSystem,
    k8s::NodeLabels,
    mount::Mounter,
    volume_id::VolumeKey,
};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::sync::Notify;

/// A call made to the mounter.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(super) enum MountCall {
    FormatAndMount {
        source: String,
        target: String,
        fs_type: String,
        options: Vec<String>,
    },
    Mount {
        source: String,
        target: String,
        fs_type: String,
        options: Vec<String>,
    },
    Unmount {
        target: String,
    },
}

/// Holds format and mount calls until released.
#[derive(Debug, Default)]
pub(super) struct Gate {
    pub(super) entered: Notify,
    pub(super) release: Notify,
}

#[derive(Debug, Default)]
struct MounterState {
    mounted: HashSet<String>,
    calls: Vec<MountCall>,
    format_failures: usize,
    mount_failure: bool,
    mounted_despite_failure: bool,
    mount_point_error: bool,
}

#[derive(Debug, Default)]
pub(super) struct FakeMounter {
    state: Mutex<MounterState>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeMounter {
    pub(super) fn set_mounted(&self, path: &str) {
        self.state.lock().unwrap().mounted.insert(path.to_string());
    }
    pub(super) fn is_mounted(&self, path: &str) -> bool {
        self.state.lock().unwrap().mounted.contains(path)
    }
    pub(super) fn calls(&self) -> Vec<MountCall> {
        self.state.lock().unwrap().calls.clone()
    }
    pub(super) fn format_and_mount_calls(&self) -> Vec<MountCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, MountCall::FormatAndMount { .. }))
            .collect()
    }
    /// Fail the next `times` format and mount calls.
    pub(super) fn fail_format_and_mount(&self, times: usize) {
        self.state.lock().unwrap().format_failures = times;
    }
    /// Fail every mount, optionally leaving the target mounted anyway.
    pub(super) fn fail_mount(&self, leave_mounted: bool) {
        let mut state = self.state.lock().unwrap();
        state.mount_failure = true;
        state.mounted_despite_failure = leave_mounted;
    }
    pub(super) fn fail_mount_point_check(&self) {
        self.state.lock().unwrap().mount_point_error = true;
    }
    /// Hold every format and mount call until the returned gate is released.
    pub(super) fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[tonic::async_trait]
impl Mounter for FakeMounter {
    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &FileSystem,
        options: &[String],
    ) -> Result<(), DeviceError> {
        self.state.lock().unwrap().calls.push(MountCall::FormatAndMount {
            source: source.to_string(),
            target: target.to_string(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.format_failures > 0 {
            state.format_failures -= 1;
            return Err(DeviceError::new("wrong fs type, bad option, bad superblock"));
        }
        state.mounted.insert(target.to_string());
        Ok(())
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::Mount {
            source: source.to_string(),
            target: target.to_string(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });
        if state.mount_failure {
            if state.mounted_despite_failure {
                state.mounted.insert(target.to_string());
            }
            return Err(DeviceError::new("mount: permission denied"));
        }
        state.mounted.insert(target.to_string());
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MountCall::Unmount {
            target: target.to_string(),
        });
        state.mounted.remove(target);
        Ok(())
    }

    async fn is_mount_point(&self, path: &str) -> Result<bool, DeviceError> {
        let state = self.state.lock().unwrap();
        if state.mount_point_error {
            return Err(DeviceError::new("failed to read mountinfo"));
        }
        Ok(state.mounted.contains(path))
    }

    async fn cleanup_mount_point(&self, path: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.mounted.remove(path) {
            state.calls.push(MountCall::Unmount {
                target: path.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct DeviceState {
    attached: bool,
    canonicalize_error: bool,
    in_use: Result<bool, String>,
    size_bytes: u64,
    resize_error: Option<String>,
    uuid: String,
    resized: Vec<(String, String)>,
    read_ahead: Vec<(String, u64)>,
    attributes: Vec<(PathBuf, String)>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            attached: true,
            canonicalize_error: false,
            in_use: Ok(false),
            size_bytes: 100 * 1024 * 1024 * 1024,
            resize_error: None,
            uuid: "3e6be9de-8139-11d1-9106-a43f08d823a6".to_string(),
            resized: vec![],
            read_ahead: vec![],
            attributes: vec![],
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct FakeDeviceUtils {
    state: Mutex<DeviceState>,
}

impl FakeDeviceUtils {
    pub(super) fn detach(&self) {
        self.state.lock().unwrap().attached = false;
    }
    pub(super) fn fail_canonicalize(&self) {
        self.state.lock().unwrap().canonicalize_error = true;
    }
    pub(super) fn set_in_use(&self, in_use: Result<bool, String>) {
        self.state.lock().unwrap().in_use = in_use;
    }
    pub(super) fn set_size_bytes(&self, size_bytes: u64) {
        self.state.lock().unwrap().size_bytes = size_bytes;
    }
    pub(super) fn fail_resize(&self, reason: &str) {
        self.state.lock().unwrap().resize_error = Some(reason.to_string());
    }
    pub(super) fn resized(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().resized.clone()
    }
    pub(super) fn read_ahead(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().read_ahead.clone()
    }
    pub(super) fn attributes(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().unwrap().attributes.clone()
    }
    pub(super) fn uuid(&self) -> String {
        self.state.lock().unwrap().uuid.clone()
    }
}

#[tonic::async_trait]
impl DeviceUtils for FakeDeviceUtils {
    async fn device_path(&self, key: &VolumeKey, partition: &str) -> Result<String, DeviceError> {
        if !self.state.lock().unwrap().attached {
            return Err(DeviceError::new(&format!(
                "unable to find the device of disk {}",
                key.name()
            )));
        }
        let mut path = format!("/dev/disk/by-id/google-{}", key.name());
        if !partition.is_empty() {
            path.push_str(&format!("-part{partition}"));
        }
        Ok(path)
    }

    async fn canonicalize(&self, device_path: &str) -> Result<String, DeviceError> {
        if self.state.lock().unwrap().canonicalize_error {
            return Err(DeviceError::new(&format!("{device_path}: broken link")));
        }
        Ok("/dev/sdb".to_string())
    }

    async fn is_device_in_use(
        &self,
        _device_path: &str,
        _real_path: &str,
    ) -> Result<bool, DeviceError> {
        self.state
            .lock()
            .unwrap()
            .in_use
            .clone()
            .map_err(|reason| DeviceError::new(&reason))
    }

    async fn resize(&self, device_path: &str, volume_path: &str) -> Result<u64, DeviceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.resize_error {
            return Err(DeviceError::new(reason));
        }
        state
            .resized
            .push((device_path.to_string(), volume_path.to_string()));
        Ok(state.size_bytes)
    }

    async fn set_read_ahead_kb(
        &self,
        device_path: &str,
        read_ahead_kb: u64,
    ) -> Result<(), DeviceError> {
        self.state
            .lock()
            .unwrap()
            .read_ahead
            .push((device_path.to_string(), read_ahead_kb));
        Ok(())
    }

    async fn filesystem_uuid(&self, _path: &str) -> Result<String, DeviceError> {
        Ok(self.uuid())
    }

    async fn write_attribute(&self, path: &Path, value: &str) -> Result<(), DeviceError> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .push((path.to_path_buf(), value.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(super) struct FakeStatter {
    block_devices: Mutex<HashSet<String>>,
}

impl FakeStatter {
    pub(super) const BLOCK_SIZE: i64 = 10 * 1024 * 1024 * 1024;
    pub(super) const USAGE: FsUsage = FsUsage {
        available: 6,
        capacity: 10,
        used: 4,
        inodes_free: 90,
        inodes: 100,
        inodes_used: 10,
    };
    pub(super) fn add_block_device(&self, path: &str) {
        self.block_devices.lock().unwrap().insert(path.to_string());
    }
}

#[tonic::async_trait]
impl VolumeStatter for FakeStatter {
    async fn is_block_device(&self, path: &str) -> Result<bool, DeviceError> {
        Ok(self.block_devices.lock().unwrap().contains(path))
    }
    async fn block_size_bytes(&self, _path: &str) -> Result<i64, DeviceError> {
        Ok(Self::BLOCK_SIZE)
    }
    async fn statfs(&self, _path: &str) -> Result<FsUsage, DeviceError> {
        Ok(Self::USAGE)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    setup_error: Option<DataCacheError>,
    teardown_error: Option<String>,
    setups: Vec<String>,
    teardowns: Vec<String>,
}

#[derive(Debug, Default)]
pub(super) struct FakeDataCache {
    state: Mutex<CacheState>,
}

impl FakeDataCache {
    pub(super) const CACHED_DEVICE: &'static str = "/dev/mapper/cache-vg-main";

    pub(super) fn fail_setup(&self, error: DataCacheError) {
        self.state.lock().unwrap().setup_error = Some(error);
    }
    pub(super) fn fail_teardown(&self, reason: &str) {
        self.state.lock().unwrap().teardown_error = Some(reason.to_string());
    }
    /// Device paths the cache was set up in front of.
    pub(super) fn setups(&self) -> Vec<String> {
        self.state.lock().unwrap().setups.clone()
    }
    pub(super) fn teardowns(&self) -> Vec<String> {
        self.state.lock().unwrap().teardowns.clone()
    }
}

#[tonic::async_trait]
impl DataCache for FakeDataCache {
    async fn setup(
        &self,
        device_path: &str,
        _request: &NodeStageVolumeRequest,
        _node_id: &str,
    ) -> Result<String, DataCacheError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.setup_error.take() {
            return Err(error);
        }
        state.setups.push(device_path.to_string());
        Ok(Self::CACHED_DEVICE.to_string())
    }

    async fn teardown(&self, volume_id: &str, _node_id: &str) -> Result<(), DataCacheError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.teardown_error {
            return Err(DataCacheError::Failed {
                reason: reason.clone(),
            });
        }
        state.teardowns.push(volume_id.to_string());
        Ok(())
    }
}

#[derive(Debug)]
pub(super) struct FakeNodeLabels {
    labels: Mutex<Result<BTreeMap<String, String>, String>>,
}

impl Default for FakeNodeLabels {
    fn default() -> Self {
        Self {
            labels: Mutex::new(Ok(BTreeMap::new())),
        }
    }
}

impl FakeNodeLabels {
    pub(super) fn set_label(&self, key: &str, value: &str) {
        let mut labels = self.labels.lock().unwrap();
        let mut current = labels.clone().unwrap_or_default();
        current.insert(key.to_string(), value.to_string());
        *labels = Ok(current);
    }
    pub(super) fn fail(&self, reason: &str) {
        *self.labels.lock().unwrap() = Err(reason.to_string());
    }
}

#[tonic::async_trait]
impl NodeLabels for FakeNodeLabels {
    async fn node_labels(&self, node_name: &str) -> anyhow::Result<BTreeMap<String, String>> {
        match self.labels.lock().unwrap().clone() {
            Ok(labels) => Ok(labels),
            Err(reason) => anyhow::bail!("Failed to get node: {}. {}", node_name, reason),
        }
    }
}
