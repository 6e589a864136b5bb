use heapscope_types::{ObjectAddress, ObjectCount, ObjectLocation};
use tracing::info;

use crate::resolver::{ResolveOutcome, ResolverConfig};

/// The host runtime's heap census.
///
/// Unknown types and types with no live instances are answered with an empty
/// listing, never an error.
pub trait HeapCensus: Send + Sync {
    fn object_counts(&self) -> Vec<ObjectCount>;

    fn objects_of_type(&self, type_name: &str) -> Vec<ObjectLocation>;

    /// Runs a full collection before returning.
    fn collect_garbage(&self);
}

/// A census that can also walk its own object graph.
///
/// The host decides how the graph is locked while [`find_path`] runs; the
/// resolver itself only needs a consistent view for the duration of one call.
///
/// [`find_path`]: HeapHost::find_path
pub trait HeapHost: HeapCensus + 'static {
    type Root: Copy + Send + Sync + 'static;

    fn find_path(
        &self,
        root: Self::Root,
        target: ObjectAddress,
        config: &ResolverConfig,
    ) -> ResolveOutcome;
}

/// Logs one line per counted type.
pub fn log_instance_counts<C: HeapCensus + ?Sized>(census: &C) {
    let counts = census.object_counts();
    let total: i64 = counts.iter().map(|count| count.count).sum();
    info!(types = counts.len(), total, "heap census");
    for count in &counts {
        info!(type_name = %count.type_name, count = count.count, "live instances");
    }
}

/// Logs every live instance of `type_name` with its allocation site.
pub fn log_instances<C: HeapCensus + ?Sized>(census: &C, type_name: &str) {
    let objects = census.objects_of_type(type_name);
    info!(%type_name, count = objects.len(), "heap census by type");
    for object in &objects {
        info!(
            %type_name,
            location = %object.location,
            address = %object.address,
            "live instance"
        );
    }
}
