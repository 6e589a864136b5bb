//! Shared data model for heapscope.
//!
//! These types travel in three directions: out of the scripting host through
//! the introspection service, over the wire to the dump tool, and onto disk as
//! snapshot files. They all derive [`Facet`](facet::Facet) so one definition
//! serves every hop.

use std::error::Error;
use std::fmt;

mod address;
mod census;
mod snapshot;

pub use address::ObjectAddress;
pub use census::{ObjectCount, ObjectLocation};
pub use snapshot::{LocationDelta, SNAPSHOT_FORMAT_VERSION, Snapshot, SnapshotRecord, TypeDelta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    EmptyField(&'static str),
    MalformedAddress(String),
    AddressOverflow(String),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::MalformedAddress(raw) => write!(
                f,
                "malformed object address {raw:?}: expected 0x<hex>, objref@0x<hex> or decimal"
            ),
            Self::AddressOverflow(raw) => {
                write!(f, "object address {raw:?} does not fit 64 bits")
            }
        }
    }
}

impl Error for InvariantError {}
