//! Maximum number of volumes which may be attached to this node.
//!
//! The limit is a function of the machine type (`n1-standard-4`, `c4a-highmem-16`, `e2-small`
//! and so on), optionally overridden by a node label set by the cluster administrator.
use snafu::Snafu;
use std::{collections::BTreeMap, num::ParseIntError};

/// Limit for the shared-core machine types.
pub const VOLUME_LIMIT_SMALL: i64 = 15;
/// Limit for everything else.
pub const VOLUME_LIMIT_BIG: i64 = 127;
/// Limit for the x4 machine family.
pub const X4_HYPERDISK_LIMIT: i64 = 39;
/// Limit for the a4 machine family.
pub const A4_HYPERDISK_LIMIT: i64 = 127;

/// Node label which overrides the machine type limit.
pub const ATTACH_LIMIT_OVERRIDE_LABEL: &str =
    "node-restriction.kubernetes.io/gke-volume-attach-limit-override";

const SHARED_CORE_MACHINE_TYPES: [&str; 5] =
    ["f1-micro", "g1-small", "e2-micro", "e2-small", "e2-medium"];

/// Hyperdisk attach limits per machine family, as (max vCPUs, limit) in ascending vCPU order.
const C4A_HYPERDISK_LIMITS: &[(i64, i64)] = &[
    (1, 7),
    (2, 7),
    (4, 15),
    (8, 23),
    (16, 31),
    (32, 63),
    (48, 63),
    (64, 63),
    (72, 63),
];
const C4_HYPERDISK_LIMITS: &[(i64, i64)] = &[
    (2, 7),
    (4, 15),
    (8, 23),
    (16, 31),
    (32, 49),
    (48, 63),
    (96, 127),
    (192, 127),
    (288, 127),
];
const N4_HYPERDISK_LIMITS: &[(i64, i64)] = &[
    (2, 15),
    (4, 15),
    (8, 23),
    (16, 31),
    (32, 63),
    (64, 63),
    (80, 63),
];
const C4D_HYPERDISK_LIMITS: &[(i64, i64)] = &[
    (2, 7),
    (4, 15),
    (8, 23),
    (16, 31),
    (32, 63),
    (64, 63),
    (96, 63),
    (192, 127),
    (384, 127),
];

/// Machine families whose limit depends on the vCPU count.
const GEN4_FAMILIES: [(&str, &[(i64, i64)]); 4] = [
    ("c4a-", C4A_HYPERDISK_LIMITS),
    ("c4-", C4_HYPERDISK_LIMITS),
    ("n4-", N4_HYPERDISK_LIMITS),
    ("c4d-", C4D_HYPERDISK_LIMITS),
];

/// Attach limit resolution errors.
/// The limit reported alongside any of these is `VOLUME_LIMIT_BIG`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Invalid cpuString {cpus} for machine type: {machine_type}: {source}"))]
    InvalidCpuCount {
        source: ParseIntError,
        cpus: String,
        machine_type: String,
    },
    #[snafu(display("Unconventional machine type: {machine_type}"))]
    Unconventional { machine_type: String },
    #[snafu(display("Invalid attach limit override label value {value}: {source}"))]
    InvalidOverride {
        source: ParseIntError,
        value: String,
    },
}

impl Error {
    /// The limit to use when resolution fails.
    pub fn fallback(&self) -> i64 {
        VOLUME_LIMIT_BIG
    }
}

/// Whether the machine type is one of the shared-core types.
pub fn is_shared_core(machine_type: &str) -> bool {
    SHARED_CORE_MACHINE_TYPES.contains(&machine_type)
}

/// Resolve the attach limit for the given machine type.
/// `attach_override` only applies when it is within (0, 128) and the machine type isn't
/// a shared-core one.
pub fn attach_limit(machine_type: &str, attach_override: Option<i64>) -> Result<i64, Error> {
    if is_shared_core(machine_type) {
        return Ok(VOLUME_LIMIT_SMALL);
    }
    if let Some(limit) = attach_override.filter(|limit| *limit > 0 && *limit < 128) {
        return Ok(limit);
    }

    if let Some((_, table)) = GEN4_FAMILIES
        .iter()
        .find(|(prefix, _)| machine_type.starts_with(prefix))
    {
        let Some(cpus) = machine_type.split('-').nth(2) else {
            return Err(Error::Unconventional {
                machine_type: machine_type.to_string(),
            });
        };
        let cpus = cpus.parse::<i64>().map_err(|source| Error::InvalidCpuCount {
            source,
            cpus: cpus.to_string(),
            machine_type: machine_type.to_string(),
        })?;
        return Ok(hyperdisk_limit(table, cpus));
    }
    if machine_type.starts_with("x4-") {
        return Ok(X4_HYPERDISK_LIMIT);
    }
    if machine_type.starts_with("a4-") {
        return Ok(A4_HYPERDISK_LIMIT);
    }
    Ok(VOLUME_LIMIT_BIG)
}

/// The smallest table entry which can hold `cpus`, or the largest one.
fn hyperdisk_limit(table: &[(i64, i64)], cpus: i64) -> i64 {
    table
        .iter()
        .find(|(max_cpus, _)| cpus <= *max_cpus)
        .or_else(|| table.last())
        .map(|(_, limit)| *limit)
        .unwrap_or(VOLUME_LIMIT_BIG)
}

/// Get the attach limit override from the node labels, if present.
pub fn attach_limit_override(labels: &BTreeMap<String, String>) -> Result<Option<i64>, Error> {
    labels
        .get(ATTACH_LIMIT_OVERRIDE_LABEL)
        .map(|value| {
            value
                .trim()
                .parse::<i64>()
                .map_err(|source| Error::InvalidOverride {
                    source,
                    value: value.to_string(),
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_core_beats_override() {
        for machine_type in SHARED_CORE_MACHINE_TYPES {
            assert_eq!(attach_limit(machine_type, None).unwrap(), VOLUME_LIMIT_SMALL);
            assert_eq!(
                attach_limit(machine_type, Some(50)).unwrap(),
                VOLUME_LIMIT_SMALL
            );
        }
    }

    #[test]
    fn override_range() {
        assert_eq!(attach_limit("n2-standard-8", Some(50)).unwrap(), 50);
        assert_eq!(attach_limit("n2-standard-8", Some(127)).unwrap(), 127);
        assert_eq!(attach_limit("c4a-standard-4", Some(1)).unwrap(), 1);
        for ignored in [0, -3, 128, 1000] {
            assert_eq!(
                attach_limit("n2-standard-8", Some(ignored)).unwrap(),
                VOLUME_LIMIT_BIG
            );
        }
    }

    #[test]
    fn gen4_tables() {
        assert_eq!(attach_limit("c4a-standard-1", None).unwrap(), 7);
        assert_eq!(attach_limit("c4a-highmem-8", None).unwrap(), 23);
        assert_eq!(attach_limit("c4-standard-32", None).unwrap(), 49);
        assert_eq!(attach_limit("c4-standard-96-lssd", None).unwrap(), 127);
        assert_eq!(attach_limit("n4-standard-2", None).unwrap(), 15);
        assert_eq!(attach_limit("n4-highcpu-80", None).unwrap(), 63);
        assert_eq!(attach_limit("c4d-standard-16", None).unwrap(), 31);
        // odd counts use the next bucket up, beyond the table the largest one
        assert_eq!(attach_limit("n4-custom-6", None).unwrap(), 23);
        assert_eq!(attach_limit("n4-custom-800", None).unwrap(), 63);
    }

    #[test]
    fn single_sku_families() {
        assert_eq!(
            attach_limit("x4-megamem-960-metal", None).unwrap(),
            X4_HYPERDISK_LIMIT
        );
        assert_eq!(attach_limit("a4-highgpu-8g", None).unwrap(), A4_HYPERDISK_LIMIT);
        assert_eq!(attach_limit("n1-standard-4", None).unwrap(), VOLUME_LIMIT_BIG);
        assert_eq!(attach_limit("", None).unwrap(), VOLUME_LIMIT_BIG);
    }

    #[test]
    fn malformed_gen4() {
        let error = attach_limit("c4-standard", None).unwrap_err();
        assert!(matches!(error, Error::Unconventional { .. }));
        assert_eq!(error.fallback(), VOLUME_LIMIT_BIG);

        let error = attach_limit("n4-standard-abc", None).unwrap_err();
        assert!(matches!(error, Error::InvalidCpuCount { .. }));
        assert_eq!(error.fallback(), VOLUME_LIMIT_BIG);
    }

    #[test]
    fn override_label() {
        let mut labels = BTreeMap::new();
        assert_eq!(attach_limit_override(&labels).unwrap(), None);
        labels.insert(ATTACH_LIMIT_OVERRIDE_LABEL.to_string(), "33".to_string());
        assert_eq!(attach_limit_override(&labels).unwrap(), Some(33));
        labels.insert(ATTACH_LIMIT_OVERRIDE_LABEL.to_string(), "lots".to_string());
        assert!(attach_limit_override(&labels).is_err());
    }
}
