use tracing::{trace, warn};

use crate::attribution::AttributionRecord;
use crate::config::TrackerConfig;
use crate::dom::document::set_attribute;
use crate::dom::Document;

/// Write the record into every input whose name contains a lead parameter.
///
/// Parameters are visited in configured order, so when one field matches
/// several identifiers the last one wins. Failures are logged per field.
pub fn populate_fields(document: &Document, record: &AttributionRecord, config: &TrackerConfig) {
    for identifier in config.lead_parameters() {
        let value = record
            .get(identifier)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| config.empty_value_for(identifier));
        let selector = format!("input[name*='{identifier}']");

        let fields = match document.select(&selector) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(target: "forms", parameter = identifier, error = %err, "failed to populate field");
                continue;
            }
        };
        for field in &fields {
            if let Err(err) = set_attribute(field, "value", value) {
                warn!(target: "forms", parameter = identifier, error = %err, "failed to populate field");
            }
        }
        trace!(target: "forms", parameter = identifier, fields = fields.len(), "populated");
    }
}
