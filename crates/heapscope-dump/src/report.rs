use heapscope_types::{LocationDelta, ObjectCount, ObjectLocation, TypeDelta};
use std::fmt::Write as _;

use crate::capture::{CaptureGap, GapReason};

pub fn counts_table(counts: &[ObjectCount]) -> String {
    let mut rows: Vec<&ObjectCount> = counts.iter().collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.type_name.cmp(&b.type_name)));
    let mut out = String::new();
    for count in rows {
        let _ = writeln!(out, "{:>10}  {}", count.count, count.type_name);
    }
    out
}

pub fn objects_table(objects: &[ObjectLocation]) -> String {
    let mut out = String::new();
    for object in objects {
        let _ = writeln!(out, "{:<18}  {}", object.address.to_string(), object.location);
    }
    out
}

pub fn type_delta_table(rows: &[TypeDelta]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>10} {:>10} {:>10}  type", "prior", "current", "delta");
    for row in rows {
        let _ = writeln!(
            out,
            "{:>10} {:>10} {:>+10}  {}",
            row.prior, row.current, row.delta, row.type_name
        );
    }
    out
}

/// Location rows, each followed by the addresses seen there.
pub fn location_delta_table(rows: &[LocationDelta]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>10} {:>10} {:>10}  location",
        "prior", "current", "delta"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:>10} {:>10} {:>+10}  {}",
            row.prior, row.current, row.delta, row.location
        );
        for address in &row.addresses {
            let _ = writeln!(out, "{:>34}{address}", "");
        }
    }
    out
}

pub fn gaps_list(gaps: &[CaptureGap]) -> String {
    let mut out = String::new();
    for gap in gaps {
        let reason = match &gap.reason {
            GapReason::EmptyListing => "empty listing".to_string(),
            GapReason::Remote(message) => message.clone(),
        };
        let _ = writeln!(
            out,
            "skipped {} ({} counted): {reason}",
            gap.type_name, gap.expected
        );
    }
    out
}
