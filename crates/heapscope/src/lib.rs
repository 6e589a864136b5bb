//! Runtime side of heapscope.
//!
//! A scripting host implements [`HeapHost`] (census plus graph access), hands
//! it to a [`MemoryService`], and starts the service with its root object.
//! Remote tools can then count and list live objects, force a collection,
//! and ask how a given address is reachable from the root.
//!
//! [`ScriptHeap`] is a small arena heap implementing every capability, used by
//! the demo host and the tests.

pub mod census;
pub mod config;
pub mod graph;
pub mod heap;
pub mod resolver;
pub mod service;

pub use census::{HeapCensus, HeapHost, log_instance_counts, log_instances};
pub use config::ServiceConfig;
pub use graph::{NodeKind, ObjectGraph, Property, Slot};
pub use heap::{HeapError, ObjId, ScriptHeap, SharedHeap, Value};
pub use resolver::{
    PathParseError, PathSegment, ReferencePath, ResolveOutcome, ResolverConfig, StopReason,
    resolve, resolve_with_stats,
};
pub use service::{MemoryHandler, MemoryService, ServiceError};

pub use heapscope_types as types;
pub use heapscope_wire as wire;
