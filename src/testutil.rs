//! Shared test fixtures and helpers.
//!
//! Reusable constructors for domain types used across multiple test modules.

use crate::types::{
    EntityValues, OvertakeCounts, Snapshot, SourceId, TireCliffReading, UndercutReading,
};

/// `OvertakeCounts` from `(driver, count)` pairs.
pub(crate) fn overtake_counts(entries: &[(&str, u32)]) -> OvertakeCounts {
    entries.iter().map(|&(d, c)| (d.to_string(), c.into())).collect()
}

/// `TireCliffReading` with an empty simulated vector.
pub(crate) fn tire(matches_found: u32, max_similarity: f64, risk_detected: bool) -> TireCliffReading {
    TireCliffReading {
        matches_found,
        max_similarity,
        risk_detected,
        simulated_vector: Vec::new(),
    }
}

/// `UndercutReading` with an empty simulated vector.
pub(crate) fn pit(total_matches: u32, relevant_matches: u32) -> UndercutReading {
    UndercutReading {
        total_matches,
        relevant_matches,
        simulated_vector: Vec::new(),
    }
}

pub(crate) fn overtake_snapshot(entries: &[(&str, u32)], revision: u64) -> Snapshot {
    Snapshot {
        entities: EntityValues::Overtake(overtake_counts(entries)),
        revision,
    }
}

/// A representative snapshot of `source` at `revision`.
pub(crate) fn snapshot(source: SourceId, revision: u64) -> Snapshot {
    let entities = match source {
        SourceId::Overtake => EntityValues::Overtake(overtake_counts(&[("VER", 3)])),
        SourceId::TireCliff => EntityValues::TireCliff(tire(30, 0.91, true)),
        SourceId::Undercut => EntityValues::Undercut(pit(10, 4)),
    };
    Snapshot { entities, revision }
}

// ---------------------------------------------------------------------------
// Shared JSON fixtures (wire format of the three streams)
// ---------------------------------------------------------------------------

pub(crate) const OVERTAKE_JSON: &str = r#"{"VER":4,"HAM":0,"LEC":2,"ALO":0,"NOR":1,"refresh_count":20}"#;

pub(crate) const TIRE_CLIFF_JSON: &str = r#"{"MY_CAR":{"matches_found":30,"max_similarity":0.912,"risk_detected":true,"simulated_vector":[0.88,0.47,0.74,0.71,0.12,0.79,0.33]},"refresh_count":10}"#;

pub(crate) const UNDERCUT_JSON: &str = r#"{"MY_CAR":{"total_matches":10,"relevant_matches":6,"simulated_vector":[0.9,0.21,0.41,0.32,0.18,0.29,0.15,0.52,0.01]},"refresh_count":9}"#;
