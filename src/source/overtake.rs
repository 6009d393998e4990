//! Overtake likelihood stream.
//!
//! Multi-entity: one count per driver code. Only positive numeric counts
//! reach the display; zero, negative, null or otherwise non-numeric entries
//! carry no information and are dropped without failing the frame.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::types::{EntityValues, OvertakeCounts, SourceId};

use super::SourceKind;

pub struct Overtake;

impl SourceKind for Overtake {
    const ID: SourceId = SourceId::Overtake;

    fn project(&self, fields: Map<String, Value>) -> Result<EntityValues, DecodeError> {
        let counts: OvertakeCounts = fields
            .into_iter()
            .filter_map(|(driver, value)| match value {
                Value::Number(n) if n.as_f64().is_some_and(|c| c > 0.0) => Some((driver, n)),
                _ => None,
            })
            .collect();
        Ok(EntityValues::Overtake(counts))
    }
}
