use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameMessage {
    /// Host to frame: the current attribution parameters.
    UtmPopulate {
        source: String,
        data: BTreeMap<String, String>,
        timestamp: u64,
    },
    /// Frame to host: the frame's listener is installed.
    UtmReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Frame to host: a form inside the frame was submitted.
    UtmFormSubmit {
        #[serde(rename = "formData")]
        form_data: JsonValue,
    },
}

impl FrameMessage {
    pub fn populate(source: &str, data: BTreeMap<String, String>, timestamp: u64) -> Self {
        FrameMessage::UtmPopulate {
            source: source.to_string(),
            data,
            timestamp,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Interpret an inbound message. Anything that is not an object with a
    /// known `type` yields `None`.
    pub fn from_json(data: &JsonValue) -> Option<Self> {
        if !data.is_object() {
            return None;
        }
        serde_json::from_value(data.clone()).ok()
    }
}

/// `formData` entries a frame reported, in key order. Non-string values are
/// rendered as JSON text.
pub fn form_data_entries(form_data: &JsonValue) -> Option<Vec<(String, String)>> {
    let object = form_data.as_object()?;
    Some(
        object
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
    )
}
