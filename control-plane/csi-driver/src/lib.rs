/// The topology key carrying the zone of a node.
pub const TOPOLOGY_KEY_ZONE: &str = "topology.gke.io/zone";

/// Volume Parameters parsed from context.
pub use context::Parameters;
/// The node service and its collaborators.
pub use node::{Collaborators, NodeServer};

/// The csi node service definitions.
pub mod csi;

/// Machine type attach limits.
pub mod attach_limit;
/// Node plugin configuration and command line.
pub mod config;
/// The volume contexts.
pub mod context;
/// Local SSD data cache.
pub mod datacache;
/// Device resolution, probing and statistics.
pub mod dev;
/// Device in use tracking for unstage.
pub mod device_in_use;
/// Device level errors.
pub mod error;
/// Filesystem Operations.
pub mod filesystem;
mod filesystem_ops;
/// Format and mount concurrency limiter.
pub mod format_limiter;
/// Kubernetes node labels.
pub mod k8s;
/// Volume concurrency limiter.
pub mod limiter;
/// Instance metadata.
pub mod metadata;
/// Mount primitives.
pub mod mount;
/// Mount option pipeline.
pub mod mount_options;
/// The node plugin exported components.
pub mod node;
/// Volume and node id codec.
pub mod volume_id;
