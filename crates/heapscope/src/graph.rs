use heapscope_types::ObjectAddress;
use std::hash::Hash;

/// How a container labels its children in a reference path.
///
/// This is a nominal tag reported by the host, not inferred from the shape of
/// the properties: a record whose keys happen to be `0`, `1`, `2` is still a
/// record and renders `.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Record,
    Sequence,
}

/// Value of one own property, reduced to what the resolver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<N> {
    Null,
    Scalar,
    Object(N),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property<N> {
    pub key: String,
    pub value: Slot<N>,
}

impl<N> Property<N> {
    pub fn new(key: impl Into<String>, value: Slot<N>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Read-only view of a live object graph.
///
/// Node handles compare by identity. Two structurally equal objects are
/// distinct nodes as long as the host allocated them separately.
pub trait ObjectGraph {
    type Node: Copy + Eq + Hash;

    fn address(&self, node: Self::Node) -> ObjectAddress;

    fn kind(&self, node: Self::Node) -> NodeKind;

    /// Own enumerable properties in host iteration order.
    fn properties(&self, node: Self::Node) -> Vec<Property<Self::Node>>;

    fn property(&self, node: Self::Node, key: &str) -> Option<Slot<Self::Node>> {
        self.properties(node)
            .into_iter()
            .find(|property| property.key == key)
            .map(|property| property.value)
    }
}
