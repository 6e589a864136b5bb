//! Client side of heapscope: talks to a host's introspection service, takes
//! heap snapshots, stores them as JSON files and diffs them by type and by
//! allocation site.

pub mod capture;
pub mod client;
pub mod diff;
pub mod report;
pub mod store;

pub use capture::{
    CaptureGap, CaptureOptions, CaptureReport, CensusSource, GapReason, capture_snapshot,
};
pub use client::{ADDR_ENV, ClientError, DEFAULT_ADDR, MemoryProxy, default_addr};
pub use diff::{Comparison, ComparisonSlot, diff, diff_by_location};
pub use store::{StoreError, load_snapshot, save_snapshot, snapshot_file_name, unix_millis_now};

#[cfg(test)]
mod tests;
