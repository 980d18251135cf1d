//! Volume and node identifier codec.
//!
//! Volume ids are of the form `projects/{project}/zones/{zone}/disks/{name}` for zonal disks and
//! `projects/{project}/regions/{region}/disks/{name}` for regional disks.
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::Snafu;
use std::{fmt::Display, str::FromStr};

static DISK_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

/// Volume id decoding errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to get id components. Expected projects/{{project}}/zones/{{zone}}/disks/{{name}}, got: {id}"))]
    Malformed { id: String },
    #[snafu(display("Volume id {id} has an unknown location kind: {kind}"))]
    UnknownLocation { id: String, kind: String },
    #[snafu(display("Volume id {id} has an invalid disk name: {name}"))]
    InvalidName { id: String, name: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        tonic::Status::invalid_argument(error.to_string())
    }
}

/// Where a disk lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Location {
    Zone(String),
    Region(String),
}

/// The decoded form of a volume id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeKey {
    project: String,
    location: Location,
    name: String,
}

impl VolumeKey {
    /// The project owning the disk.
    pub fn project(&self) -> &str {
        &self.project
    }
    /// The zone or region of the disk.
    pub fn location(&self) -> &Location {
        &self.location
    }
    /// The disk name, which is also what the guest sees in the device serial.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for VolumeKey {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let parts = id.split('/').collect::<Vec<_>>();
        match parts.as_slice() {
            ["projects", project, kind, location, "disks", name]
                if !project.is_empty() && !location.is_empty() && !name.is_empty() =>
            {
                if !DISK_NAME.is_match(name) {
                    return Err(Error::InvalidName {
                        id: id.to_string(),
                        name: name.to_string(),
                    });
                }
                let location = match *kind {
                    "zones" => Location::Zone(location.to_string()),
                    "regions" => Location::Region(location.to_string()),
                    other => {
                        return Err(Error::UnknownLocation {
                            id: id.to_string(),
                            kind: other.to_string(),
                        })
                    }
                };
                Ok(Self {
                    project: project.to_string(),
                    location,
                    name: name.to_string(),
                })
            }
            _ => Err(Error::Malformed { id: id.to_string() }),
        }
    }
}

impl Display for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Location::Zone(zone) => write!(f, "{{Name: {}, Zone: {}}}", self.name, zone),
            Location::Region(region) => write!(f, "{{Name: {}, Region: {}}}", self.name, region),
        }
    }
}

/// Compose the node id reported to the CO.
pub fn node_id(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{project}/zones/{zone}/instances/{name}")
}
