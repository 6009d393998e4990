//! Undercut pit-stop risk stream. Only the `MY_CAR` entry is forwarded.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::types::{EntityValues, SourceId};

use super::{SourceKind, project_my_car};

pub struct Undercut;

impl SourceKind for Undercut {
    const ID: SourceId = SourceId::Undercut;

    fn project(&self, fields: Map<String, Value>) -> Result<EntityValues, DecodeError> {
        project_my_car(fields).map(EntityValues::Undercut)
    }
}
