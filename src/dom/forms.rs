use kuchiki::traits::*;
use kuchiki::{NodeRef, Selectors};

use super::document::{attribute, has_attribute, is_element_named, select_within};

const CONTROLS: &str = "input, select, textarea, button";
const NON_DATA_INPUTS: &[&str] = &["submit", "button", "reset", "image", "file"];

/// Listed controls of `form`, in document order.
pub fn controls(form: &NodeRef) -> Vec<NodeRef> {
    select_within(form, CONTROLS).unwrap_or_default()
}

fn input_type(node: &NodeRef) -> String {
    attribute(node, "type")
        .map(|t| t.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "text".to_string())
}

fn option_value(option: &NodeRef) -> String {
    attribute(option, "value").unwrap_or_else(|| option.text_contents().trim().to_string())
}

/// The control's current value, as `element.value` reports it.
pub fn control_value(node: &NodeRef) -> String {
    if is_element_named(node, "select") {
        let options = select_within(node, "option").unwrap_or_default();
        return options
            .iter()
            .find(|o| has_attribute(o, "selected"))
            .or_else(|| options.first())
            .map(option_value)
            .unwrap_or_default();
    }
    if is_element_named(node, "textarea") {
        return attribute(node, "value").unwrap_or_else(|| node.text_contents());
    }
    match input_type(node).as_str() {
        "checkbox" | "radio" => attribute(node, "value").unwrap_or_else(|| "on".to_string()),
        _ => attribute(node, "value").unwrap_or_default(),
    }
}

/// Name/value pairs the form would submit, following FormData's inclusion
/// rules: named, enabled controls; buttons and file inputs skipped; checkable
/// inputs only when checked; every selected option of a multi-select.
pub fn form_data(form: &NodeRef) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for control in controls(form) {
        let Some(name) = attribute(&control, "name").filter(|n| !n.is_empty()) else {
            continue;
        };
        if has_attribute(&control, "disabled") || is_element_named(&control, "button") {
            continue;
        }

        if is_element_named(&control, "select") && has_attribute(&control, "multiple") {
            for option in select_within(&control, "option").unwrap_or_default() {
                if has_attribute(&option, "selected") {
                    entries.push((name.clone(), option_value(&option)));
                }
            }
            continue;
        }

        if is_element_named(&control, "input") {
            let kind = input_type(&control);
            if NON_DATA_INPUTS.contains(&kind.as_str()) {
                continue;
            }
            if (kind == "checkbox" || kind == "radio") && !has_attribute(&control, "checked") {
                continue;
            }
        }

        entries.push((name, control_value(&control)));
    }
    entries
}

fn inside_hidden_region(node: &NodeRef, hidden: &Selectors) -> bool {
    node.inclusive_ancestors()
        .elements()
        .any(|element| hidden.matches(&element))
}

/// True when some `required` control outside the hidden regions is blank
/// after trimming.
pub fn has_empty_required_field(form: &NodeRef, hidden: &Selectors) -> bool {
    controls(form).iter().any(|control| {
        has_attribute(control, "required")
            && !inside_hidden_region(control, hidden)
            && control_value(control).trim().is_empty()
    })
}
