use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed attribution record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The persisted answer to "how did this visitor arrive".
///
/// Keys are tracked identifiers plus the referrer key. A missing key means the
/// value is unknown; an empty string is an observed, explicit non-value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub parameters: BTreeMap<String, String>,
}

impl AttributionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.parameters.get(identifier).map(String::as_str)
    }

    pub fn with(mut self, identifier: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(identifier.into(), value.into());
        self
    }

    pub fn serialize(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(raw)?)
    }
}
