use async_trait::async_trait;
use heapscope_types::{ObjectCount, ObjectLocation, Snapshot, SnapshotRecord};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::client::{ClientError, MemoryProxy};

/// Where a snapshot's census comes from.
#[async_trait]
pub trait CensusSource: Send {
    async fn object_counts(&mut self) -> Result<Vec<ObjectCount>, ClientError>;

    async fn objects_of_type(
        &mut self,
        type_name: &str,
    ) -> Result<Vec<ObjectLocation>, ClientError>;

    async fn collect_garbage(&mut self) -> Result<(), ClientError>;
}

#[async_trait]
impl CensusSource for MemoryProxy {
    async fn object_counts(&mut self) -> Result<Vec<ObjectCount>, ClientError> {
        self.get_objects_counts().await
    }

    async fn objects_of_type(
        &mut self,
        type_name: &str,
    ) -> Result<Vec<ObjectLocation>, ClientError> {
        self.get_objects(type_name).await
    }

    async fn collect_garbage(&mut self) -> Result<(), ClientError> {
        self.run_gc().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Ask the host to collect before taking the census, so the snapshot only
    /// holds objects that are actually retained.
    pub collect_first: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            collect_first: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapReason {
    /// The listing came back empty although the count said otherwise.
    EmptyListing,
    Remote(String),
}

/// A counted type that is missing from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureGap {
    pub type_name: String,
    pub expected: i64,
    pub reason: GapReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub snapshot: Snapshot,
    pub gaps: Vec<CaptureGap>,
}

/// Counts every type, then lists each counted type once, in the order the
/// census reported them.
///
/// A type whose listing fails remotely or comes back empty is recorded as a
/// gap and skipped. Transport failures abort the capture.
pub async fn capture_snapshot<S>(
    source: &mut S,
    options: &CaptureOptions,
) -> Result<CaptureReport, ClientError>
where
    S: CensusSource + ?Sized,
{
    if options.collect_first {
        source.collect_garbage().await?;
    }
    let counts = source.object_counts().await?;

    let mut snapshot = Snapshot::new();
    let mut gaps = Vec::new();
    let mut attempted: HashSet<&str> = HashSet::new();
    for count in &counts {
        if !attempted.insert(count.type_name.as_str()) {
            continue;
        }
        let reason = match source.objects_of_type(&count.type_name).await {
            Ok(objects) if !objects.is_empty() => {
                snapshot.insert_type(
                    count.type_name.clone(),
                    objects.into_iter().map(SnapshotRecord::from).collect(),
                );
                continue;
            }
            Ok(_) => GapReason::EmptyListing,
            Err(ClientError::Remote(message)) => GapReason::Remote(message),
            Err(e) => return Err(e),
        };
        warn!(
            type_name = %count.type_name,
            expected = count.count,
            ?reason,
            "no listing for counted type, skipping"
        );
        gaps.push(CaptureGap {
            type_name: count.type_name.clone(),
            expected: count.count,
            reason,
        });
    }

    info!(
        types = snapshot.types.len(),
        instances = snapshot.total_instances(),
        gaps = gaps.len(),
        "snapshot captured"
    );
    Ok(CaptureReport { snapshot, gaps })
}
