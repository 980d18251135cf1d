//! Local SSD data cache in front of a persistent disk.
//!
//! The cache itself (volume groups, cache pools and the device mapper tables) is set up by an
//! external implementation of `DataCache`; the node operations only decide when to call it.
use crate::csi::NodeStageVolumeRequest;
use snafu::Snafu;
use std::fmt::Debug;

/// Valid data cache modes.
pub const DATA_CACHE_MODE_WRITEBACK: &str = "writeback";
pub const DATA_CACHE_MODE_WRITETHROUGH: &str = "writethrough";

/// Data cache errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum DataCacheError {
    /// The request can never succeed as is.
    #[snafu(display("{reason}"))]
    InvalidRequest { reason: String },
    /// Setting up or tearing down the cache failed, possibly half way through.
    #[snafu(display("{reason}"))]
    Failed { reason: String },
}

/// Data cache setup and teardown.
#[tonic::async_trait]
pub trait DataCache: Send + Sync + Debug {
    /// Check the cache mode and size requested in the publish context.
    fn validate_config(&self, mode: &str, size: &str) -> Result<(), DataCacheError> {
        if mode != DATA_CACHE_MODE_WRITEBACK && mode != DATA_CACHE_MODE_WRITETHROUGH {
            return Err(DataCacheError::InvalidRequest {
                reason: format!(
                    "data cache mode {mode:?} is not one of {DATA_CACHE_MODE_WRITEBACK} or {DATA_CACHE_MODE_WRITETHROUGH}"
                ),
            });
        }
        if size.is_empty() {
            return Err(DataCacheError::InvalidRequest {
                reason: "data cache size must be provided".to_string(),
            });
        }
        Ok(())
    }
    /// Put a cache in front of `device_path`, returning the path of the cached device.
    async fn setup(
        &self,
        device_path: &str,
        request: &NodeStageVolumeRequest,
        node_id: &str,
    ) -> Result<String, DataCacheError>;
    /// Tear down the cache of the given volume, if it has one.
    async fn teardown(&self, volume_id: &str, node_id: &str) -> Result<(), DataCacheError>;
}

/// The data cache of nodes which don't have one.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDataCache;

#[tonic::async_trait]
impl DataCache for DisabledDataCache {
    async fn setup(
        &self,
        _device_path: &str,
        request: &NodeStageVolumeRequest,
        _node_id: &str,
    ) -> Result<String, DataCacheError> {
        Err(DataCacheError::InvalidRequest {
            reason: format!(
                "data cache is not available on this node for volume {}",
                request.volume_id
            ),
        })
    }

    async fn teardown(&self, _volume_id: &str, _node_id: &str) -> Result<(), DataCacheError> {
        Ok(())
    }
}
