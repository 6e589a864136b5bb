use facet::Facet;
use std::collections::BTreeMap;

use crate::{ObjectAddress, ObjectLocation};

/// Version written into every persisted snapshot.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One instance inside a snapshot: where it was allocated and where it lives.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub location: String,
    pub address: ObjectAddress,
}

impl From<ObjectLocation> for SnapshotRecord {
    fn from(object: ObjectLocation) -> Self {
        Self {
            location: object.location,
            address: object.address,
        }
    }
}

/// Census of every listed type at one point in time.
///
/// Records keep the order the census reported them in; loading a saved
/// snapshot must give back exactly what was saved.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u32,
    pub types: BTreeMap<String, Vec<SnapshotRecord>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            types: BTreeMap::new(),
        }
    }

    /// Replaces the instance list of `type_name`.
    pub fn insert_type(&mut self, type_name: impl Into<String>, records: Vec<SnapshotRecord>) {
        self.types.insert(type_name.into(), records);
    }

    pub fn push(&mut self, type_name: &str, record: SnapshotRecord) {
        self.types
            .entry(type_name.to_string())
            .or_default()
            .push(record);
    }

    pub fn records(&self, type_name: &str) -> &[SnapshotRecord] {
        self.types.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instance_count(&self, type_name: &str) -> usize {
        self.records(type_name).len()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn total_instances(&self) -> usize {
        self.types.values().map(Vec::len).sum()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-type count change between two snapshots.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TypeDelta {
    pub type_name: String,
    pub prior: i64,
    pub current: i64,
    pub delta: i64,
}

impl TypeDelta {
    pub fn new(type_name: impl Into<String>, prior: i64, current: i64) -> Self {
        Self {
            type_name: type_name.into(),
            prior,
            current,
            delta: current - prior,
        }
    }
}

/// Per-allocation-site count change within one type.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct LocationDelta {
    pub location: String,
    pub prior: i64,
    pub current: i64,
    pub delta: i64,
    /// Instances at this site in the newest snapshot of the pair.
    pub addresses: Vec<ObjectAddress>,
}
