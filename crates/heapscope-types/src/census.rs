use facet::Facet;

use crate::ObjectAddress;

/// Number of live instances of one type at census time.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ObjectCount {
    pub type_name: String,
    pub count: i64,
}

/// One live instance reported by the census.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub type_name: String,
    /// Allocation site label, `file:line` for script-created objects.
    pub location: String,
    pub address: ObjectAddress,
}

