use std::cell::RefCell;
use std::rc::{Rc, Weak};

use kuchiki::{Node, NodeRef, Selectors};
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, TrackerConfig};
use crate::dom::document::has_class;
use crate::dom::forms::{form_data, has_empty_required_field};
use crate::dom::{Document, EventLoop, SubmitEvent};

use super::sink::{EventSink, SubmissionOrigin, TrackingEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Record the submission; the native submission stays cancelled.
    TrackOnly,
    /// Record the submission, then submit the form programmatically.
    ForceSubmit,
}

/// Strip a numbered-question prefix: `q12_email` becomes `email`.
pub fn normalize_field_name(name: &str) -> &str {
    let Some(rest) = name.strip_prefix('q') else {
        return name;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return name;
    }
    match rest[digits..].strip_prefix('_') {
        Some(real_name) => real_name,
        None => name,
    }
}

/// Normalize names and collapse repeats. A repeated name keeps its first
/// position and its last value.
pub fn normalize_fields(entries: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        let name = normalize_field_name(&name).to_string();
        match fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => fields.push((name, value)),
        }
    }
    fields
}

/// The normalized field set of `form`, or `None` when a visible required
/// field is blank.
pub fn extract_submission(form: &NodeRef, hidden: &Selectors) -> Option<Vec<(String, String)>> {
    if has_empty_required_field(form, hidden) {
        return None;
    }
    Some(normalize_fields(form_data(form)))
}

struct InterceptorInner {
    sink: Rc<dyn EventSink>,
    event_loop: EventLoop,
    hidden: Selectors,
    force_submit_class: String,
    attached: RefCell<Vec<Weak<Node>>>,
}

/// Turns form submissions into dataLayer events.
///
/// Cloning yields another handle to the same interceptor; each form is
/// wired at most once across all handles.
#[derive(Clone)]
pub struct SubmissionInterceptor {
    inner: Rc<InterceptorInner>,
}

impl SubmissionInterceptor {
    pub fn new(
        config: &TrackerConfig,
        sink: Rc<dyn EventSink>,
        event_loop: EventLoop,
    ) -> Result<Self, ConfigError> {
        let hidden = Selectors::compile(&config.hidden_field_selector)
            .map_err(|()| ConfigError::HiddenSelector(config.hidden_field_selector.clone()))?;
        Ok(Self {
            inner: Rc::new(InterceptorInner {
                sink,
                event_loop,
                hidden,
                force_submit_class: config.force_submit_form_class.clone(),
                attached: RefCell::new(Vec::new()),
            }),
        })
    }

    pub fn is_attached(&self, form: &NodeRef) -> bool {
        let target = Rc::as_ptr(&form.0);
        self.inner
            .attached
            .borrow()
            .iter()
            .any(|f| f.as_ptr() == target)
    }

    /// Wire a submit listener onto `form`. Returns false if it was already
    /// intercepted.
    pub fn attach(&self, document: &Document, form: &NodeRef, mode: SubmitMode) -> bool {
        if self.is_attached(form) {
            return false;
        }
        {
            let mut attached = self.inner.attached.borrow_mut();
            attached.retain(|f| f.strong_count() > 0);
            attached.push(Rc::downgrade(&form.0));
        }

        let weak = Rc::downgrade(&self.inner);
        document.add_submit_listener(
            form,
            Rc::new(move |event: &mut SubmitEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_submit(event, mode);
                }
            }),
        );
        trace!(target: "forms", ?mode, "form intercepted");
        true
    }

    /// Intercept every form in `document`, choosing force-submit mode for
    /// forms carrying the configured class. Returns how many were newly wired.
    pub fn attach_all(&self, document: &Document) -> usize {
        let forms = match document.select("form") {
            Ok(forms) => forms,
            Err(err) => {
                warn!(target: "forms", error = %err, "failed to process document forms");
                return 0;
            }
        };
        forms
            .iter()
            .filter(|form| self.attach(document, form, self.mode_for(form)))
            .count()
    }

    fn mode_for(&self, form: &NodeRef) -> SubmitMode {
        if has_class(form, &self.inner.force_submit_class) {
            SubmitMode::ForceSubmit
        } else {
            SubmitMode::TrackOnly
        }
    }
}

impl InterceptorInner {
    fn handle_submit(&self, event: &mut SubmitEvent, mode: SubmitMode) {
        event.prevent_default();

        let Some(fields) = extract_submission(&event.form, &self.hidden) else {
            debug!(target: "forms", "required field empty, submission dropped");
            return;
        };

        let field_count = fields.len();
        for (name, value) in fields {
            self.sink.push(TrackingEvent::Field { name, value });
        }
        let event_id = self.event_loop.wall_clock_ms().to_string();
        debug!(target: "forms", %event_id, fields = field_count, "submission tracked");
        self.sink.push(TrackingEvent::Submission {
            event_id,
            origin: SubmissionOrigin::Local,
        });

        if mode == SubmitMode::ForceSubmit {
            event.document.submit_form(&event.form);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::sink::DataLayer;
    use serde_json::json;
    use url::Url;

    fn setup(html: &str) -> (Document, Rc<DataLayer>, SubmissionInterceptor) {
        let doc = Document::parse(html, Url::parse("https://shop.example/").unwrap(), "");
        let layer = Rc::new(DataLayer::new());
        let interceptor = SubmissionInterceptor::new(
            &TrackerConfig::default(),
            layer.clone(),
            EventLoop::with_epoch(1_700_000_000_000),
        )
        .unwrap();
        (doc, layer, interceptor)
    }

    #[test]
    fn numbered_question_prefix_is_stripped() {
        assert_eq!(normalize_field_name("q3_email"), "email");
        assert_eq!(normalize_field_name("q12_first_name"), "first_name");
        assert_eq!(normalize_field_name("q_email"), "q_email");
        assert_eq!(normalize_field_name("q3email"), "q3email");
        assert_eq!(normalize_field_name("question"), "question");
        assert_eq!(normalize_field_name("q7_"), "");
    }

    #[test]
    fn repeated_names_keep_first_position_last_value() {
        let fields = normalize_fields(vec![
            ("q1_email".into(), "old@x.example".into()),
            ("name".into(), "Ann".into()),
            ("email".into(), "new@x.example".into()),
        ]);
        assert_eq!(
            fields,
            vec![
                ("email".to_string(), "new@x.example".to_string()),
                ("name".to_string(), "Ann".to_string()),
            ]
        );
    }

    #[test]
    fn tracked_submission_emits_fields_then_event_id() {
        let (doc, layer, interceptor) = setup(
            r#"<form><input name="q4_email" value="a@b.c"><input name="utm_source" value="google"></form>"#,
        );
        assert_eq!(interceptor.attach_all(&doc), 1);
        let form = doc.select_first("form").unwrap().unwrap();

        assert!(!doc.dispatch_submit(&form));
        assert_eq!(
            layer.entries(),
            vec![
                json!({"email": "a@b.c"}),
                json!({"utm_source": "google"}),
                json!({"event_id": "1700000000000"}),
            ]
        );
        assert!(doc.submissions().is_empty());
    }

    #[test]
    fn empty_required_field_blocks_everything() {
        let (doc, layer, interceptor) =
            setup(r#"<form class="jotform-form"><input name="email" required></form>"#);
        interceptor.attach_all(&doc);
        let form = doc.select_first("form").unwrap().unwrap();
        assert!(!doc.dispatch_submit(&form));
        assert!(layer.is_empty());
        assert!(doc.submissions().is_empty());
    }

    #[test]
    fn force_submit_forms_are_submitted_after_tracking() {
        let (doc, layer, interceptor) = setup(
            r#"<form class="jotform-form" action="/submit"><input name="email" value="a@b.c"></form>"#,
        );
        interceptor.attach_all(&doc);
        let form = doc.select_first("form").unwrap().unwrap();
        doc.dispatch_submit(&form);
        assert_eq!(layer.len(), 2);
        let submissions = doc.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].action.as_deref(), Some("/submit"));
    }

    #[test]
    fn forms_are_wired_once() {
        let (doc, layer, interceptor) = setup(r#"<form><input name="a" value="1"></form>"#);
        assert_eq!(interceptor.attach_all(&doc), 1);
        assert_eq!(interceptor.clone().attach_all(&doc), 0);
        let form = doc.select_first("form").unwrap().unwrap();
        doc.dispatch_submit(&form);
        assert_eq!(layer.len(), 2);
    }
}
