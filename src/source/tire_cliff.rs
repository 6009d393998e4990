//! Tire cliff risk stream. Only the `MY_CAR` entry is forwarded.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::types::{EntityValues, SourceId};

use super::{SourceKind, project_my_car};

pub struct TireCliff;

impl SourceKind for TireCliff {
    const ID: SourceId = SourceId::TireCliff;

    fn project(&self, fields: Map<String, Value>) -> Result<EntityValues, DecodeError> {
        project_my_car(fields).map(EntityValues::TireCliff)
    }
}
