//! Core domain types for race telemetry snapshots.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved field carrying the source revision on every inbound message.
pub const REVISION_FIELD: &str = "refresh_count";

/// Entity key of the car the strategy is computed for.
pub const MY_CAR: &str = "MY_CAR";

/// Number of telemetry sources. Sizes per-source arrays.
pub const SOURCE_COUNT: usize = 3;

/// Identity of one telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Overtake,
    TireCliff,
    Undercut,
}

impl SourceId {
    pub const ALL: [SourceId; SOURCE_COUNT] =
        [SourceId::Overtake, SourceId::TireCliff, SourceId::Undercut];

    /// Slot of this source in per-source arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            SourceId::Overtake => 0,
            SourceId::TireCliff => 1,
            SourceId::Undercut => 2,
        }
    }

    /// Stable name used as log field, metric label and cache key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SourceId::Overtake => "overtake",
            SourceId::TireCliff => "tire_cliff",
            SourceId::Undercut => "undercut",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overtake likelihood per driver code. Only positive counts are kept, in the
/// numeric form they arrived in.
pub type OvertakeCounts = BTreeMap<String, serde_json::Number>;

/// Tire cliff risk for [`MY_CAR`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TireCliffReading {
    pub matches_found: u32,
    pub max_similarity: f64,
    pub risk_detected: bool,
    #[serde(default)]
    pub simulated_vector: Vec<f64>,
}

/// Undercut pit-stop risk for [`MY_CAR`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndercutReading {
    pub total_matches: u32,
    pub relevant_matches: u32,
    #[serde(default)]
    pub simulated_vector: Vec<f64>,
}

/// Entity map of one source after projection.
///
/// Serializes untagged: the overtake map as `{"VER": 3}`, the single-car
/// readings as their flat object. This is both the cache row format and the
/// strategy request format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityValues {
    Overtake(OvertakeCounts),
    TireCliff(TireCliffReading),
    Undercut(UndercutReading),
}

impl EntityValues {
    #[must_use]
    pub fn source(&self) -> SourceId {
        match self {
            EntityValues::Overtake(_) => SourceId::Overtake,
            EntityValues::TireCliff(_) => SourceId::TireCliff,
            EntityValues::Undercut(_) => SourceId::Undercut,
        }
    }

    /// Parse a serialized entity map back into the shape of `source`.
    pub fn from_json(source: SourceId, json: &str) -> serde_json::Result<Self> {
        Ok(match source {
            SourceId::Overtake => EntityValues::Overtake(serde_json::from_str(json)?),
            SourceId::TireCliff => EntityValues::TireCliff(serde_json::from_str(json)?),
            SourceId::Undercut => EntityValues::Undercut(serde_json::from_str(json)?),
        })
    }
}

/// One decoded update from a source. Immutable; the next snapshot from the
/// same source supersedes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub entities: EntityValues,
    /// Source-local update counter. Synchronization only, not identity.
    pub revision: u64,
}

impl Snapshot {
    #[must_use]
    pub fn source(&self) -> SourceId {
        self.entities.source()
    }
}

/// Body of the outbound strategy request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedPayload {
    pub overtake_data: OvertakeCounts,
    pub tire_data: TireCliffReading,
    pub pit_data: UndercutReading,
}

impl CombinedPayload {
    /// Bundle the latest snapshot of every source. `None` until all three
    /// have delivered.
    #[must_use]
    pub fn assemble(latest: &[Option<Snapshot>; SOURCE_COUNT]) -> Option<Self> {
        let [Some(overtake), Some(tire), Some(pit)] = latest else {
            return None;
        };
        match (&overtake.entities, &tire.entities, &pit.entities) {
            (
                EntityValues::Overtake(overtake_data),
                EntityValues::TireCliff(tire_data),
                EntityValues::Undercut(pit_data),
            ) => Some(Self {
                overtake_data: overtake_data.clone(),
                tire_data: tire_data.clone(),
                pit_data: pit_data.clone(),
            }),
            _ => None,
        }
    }
}

/// Current strategy text. Replaced wholesale by every successful computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub text: String,
    /// Dispatch generation that produced this text.
    pub generation: u64,
}
