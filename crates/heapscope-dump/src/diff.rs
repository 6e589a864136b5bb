use heapscope_types::{LocationDelta, Snapshot, SnapshotRecord, TypeDelta};
use std::collections::{BTreeSet, HashMap};

/// Per-type count deltas over the union of both snapshots' types, ordered by
/// type name. A type missing on one side counts zero there.
pub fn diff(prior: &Snapshot, current: &Snapshot) -> Vec<TypeDelta> {
    let names: BTreeSet<&str> = prior.type_names().chain(current.type_names()).collect();
    names
        .into_iter()
        .map(|name| {
            TypeDelta::new(
                name,
                prior.instance_count(name) as i64,
                current.instance_count(name) as i64,
            )
        })
        .collect()
}

/// Per-allocation-site deltas within one type.
///
/// Sites are listed in the order they are first seen, prior snapshot first.
/// Each row carries the addresses found at that site in `current`.
pub fn diff_by_location(
    prior: &Snapshot,
    current: &Snapshot,
    type_name: &str,
) -> Vec<LocationDelta> {
    let mut rows = Rows::default();
    for record in prior.records(type_name) {
        rows.row(&record.location).prior += 1;
    }
    for record in current.records(type_name) {
        let row = rows.row(&record.location);
        row.current += 1;
        row.addresses.push(record.address);
    }
    rows.finish()
}

#[derive(Default)]
struct Rows {
    order: Vec<LocationDelta>,
    index: HashMap<String, usize>,
}

impl Rows {
    fn row(&mut self, location: &str) -> &mut LocationDelta {
        let pos = match self.index.get(location) {
            Some(&pos) => pos,
            None => {
                self.index.insert(location.to_string(), self.order.len());
                self.order.push(LocationDelta {
                    location: location.to_string(),
                    prior: 0,
                    current: 0,
                    delta: 0,
                    addresses: Vec::new(),
                });
                self.order.len() - 1
            }
        };
        &mut self.order[pos]
    }

    fn finish(mut self) -> Vec<LocationDelta> {
        for row in &mut self.order {
            row.delta = row.current - row.prior;
        }
        self.order
    }
}

fn initial_only_locations(records: &[SnapshotRecord]) -> Vec<LocationDelta> {
    let mut rows = Rows::default();
    for record in records {
        let row = rows.row(&record.location);
        row.prior += 1;
        row.addresses.push(record.address);
    }
    // Nothing to compare against yet: no delta.
    rows.order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonSlot {
    Initial,
    Current,
}

/// The pair of snapshots being compared: a baseline and a later capture.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    initial: Option<Snapshot>,
    current: Option<Snapshot>,
}

impl Comparison {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial(&self) -> Option<&Snapshot> {
        self.initial.as_ref()
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    pub fn set_initial(&mut self, snapshot: Snapshot) {
        self.initial = Some(snapshot);
    }

    pub fn set_current(&mut self, snapshot: Snapshot) {
        self.current = Some(snapshot);
    }

    /// The first snapshot becomes the baseline; every later one replaces the
    /// current side.
    pub fn set_auto(&mut self, snapshot: Snapshot) -> ComparisonSlot {
        if self.initial.is_none() {
            self.initial = Some(snapshot);
            ComparisonSlot::Initial
        } else {
            self.current = Some(snapshot);
            ComparisonSlot::Current
        }
    }

    /// Per-type rows. With only a baseline loaded the rows show its counts
    /// with zero current and zero delta.
    pub fn type_rows(&self) -> Vec<TypeDelta> {
        match (&self.initial, &self.current) {
            (Some(initial), None) => initial
                .types
                .iter()
                .map(|(name, records)| TypeDelta {
                    type_name: name.clone(),
                    prior: records.len() as i64,
                    current: 0,
                    delta: 0,
                })
                .collect(),
            (initial, Some(current)) => {
                let empty = Snapshot::new();
                diff(initial.as_ref().unwrap_or(&empty), current)
            }
            (None, None) => Vec::new(),
        }
    }

    pub fn location_rows(&self, type_name: &str) -> Vec<LocationDelta> {
        match (&self.initial, &self.current) {
            (Some(initial), None) => initial_only_locations(initial.records(type_name)),
            (initial, Some(current)) => {
                let empty = Snapshot::new();
                diff_by_location(initial.as_ref().unwrap_or(&empty), current, type_name)
            }
            (None, None) => Vec::new(),
        }
    }
}
