use std::cell::RefCell;

use serde_json::{json, Map, Value as JsonValue};

/// Where a submission was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOrigin {
    Local,
    /// Reported by a frame the host page could not inspect.
    CrossOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingEvent {
    /// One submitted field, pushed as `{name: value}`.
    Field { name: String, value: String },
    /// Closes a run of field events belonging to the same submission.
    Submission {
        event_id: String,
        origin: SubmissionOrigin,
    },
}

impl TrackingEvent {
    pub fn to_json(&self) -> JsonValue {
        match self {
            TrackingEvent::Field { name, value } => {
                let mut entry = Map::new();
                entry.insert(name.clone(), JsonValue::String(value.clone()));
                JsonValue::Object(entry)
            }
            TrackingEvent::Submission {
                event_id,
                origin: SubmissionOrigin::Local,
            } => json!({ "event_id": event_id }),
            TrackingEvent::Submission {
                event_id,
                origin: SubmissionOrigin::CrossOrigin,
            } => json!({ "event_id": event_id, "source": "cross_origin_iframe" }),
        }
    }
}

/// Append-only analytics destination. The tracker never reads it back.
pub trait EventSink {
    fn push(&self, event: TrackingEvent);
}

/// In-process `dataLayer`: an ordered list of JSON entries.
#[derive(Debug, Default)]
pub struct DataLayer {
    entries: RefCell<Vec<JsonValue>>,
}

impl DataLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JsonValue> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl EventSink for DataLayer {
    fn push(&self, event: TrackingEvent) {
        self.entries.borrow_mut().push(event.to_json());
    }
}
