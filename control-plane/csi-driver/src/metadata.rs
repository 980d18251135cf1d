//! Identity of the instance the node plugin runs on.
use std::fmt::Debug;

/// Instance metadata.
pub trait MetadataService: Send + Sync + Debug {
    /// The instance (and k8s node) name.
    fn name(&self) -> &str;
    /// The zone the instance runs in.
    fn zone(&self) -> &str;
    /// The project owning the instance.
    fn project(&self) -> &str;
    /// The machine type, eg `n2-standard-8`.
    fn machine_type(&self) -> &str;
}

/// Instance metadata provided up front, eg from the command line.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct StaticMetadata {
    pub(crate) name: String,
    pub(crate) zone: String,
    pub(crate) project: String,
    pub(crate) machine_type: String,
}

impl StaticMetadata {
    /// Return a new `Self`.
    pub fn new(name: &str, zone: &str, project: &str, machine_type: &str) -> Self {
        Self {
            name: name.to_string(),
            zone: zone.to_string(),
            project: project.to_string(),
            machine_type: machine_type.to_string(),
        }
    }
}

impl MetadataService for StaticMetadata {
    fn name(&self) -> &str {
        &self.name
    }
    fn zone(&self) -> &str {
        &self.zone
    }
    fn project(&self) -> &str {
        &self.project
    }
    fn machine_type(&self) -> &str {
        &self.machine_type
    }
}
