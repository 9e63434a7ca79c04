use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use kuchiki::{Node, NodeRef, Selectors};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, trace, warn};

use crate::attribution::AttributionRecord;
use crate::config::{ConfigError, TrackerConfig};
use crate::dom::{Document, ListenerId, MessageEvent, MessagePort, SubmitEvent, Window};

use super::interceptor::extract_submission;
use super::populate::populate_fields;
use super::protocol::FrameMessage;

struct AgentInner {
    document: Document,
    window: Window,
    parent: Window,
    config: TrackerConfig,
    hidden: Selectors,
    received: RefCell<Option<AttributionRecord>>,
    listener: Cell<Option<ListenerId>>,
    forms: RefCell<Vec<Weak<Node>>>,
}

pub struct FrameAgent {
    inner: Rc<AgentInner>,
}

impl FrameAgent {
    /// Listen for `utm_populate`, forward form submissions and announce
    /// readiness to `parent`.
    pub fn start(
        document: Document,
        window: Window,
        parent: Window,
        config: TrackerConfig,
    ) -> Result<Self, ConfigError> {
        let hidden = Selectors::compile(&config.hidden_field_selector)
            .map_err(|()| ConfigError::HiddenSelector(config.hidden_field_selector.clone()))?;
        let inner = Rc::new(AgentInner {
            document,
            window,
            parent,
            config,
            hidden,
            received: RefCell::new(None),
            listener: Cell::new(None),
            forms: RefCell::new(Vec::new()),
        });

        let weak = Rc::downgrade(&inner);
        let listener = inner
            .window
            .add_message_listener(Rc::new(move |event: &MessageEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_message(event);
                }
            }));
        inner.listener.set(Some(listener));

        inner.forward_forms();
        inner.announce();
        Ok(Self { inner })
    }

    /// The parameters most recently received from the host page.
    pub fn received(&self) -> Option<AttributionRecord> {
        self.inner.received.borrow().clone()
    }

    /// Pick up forms added since `start`.
    pub fn refresh_forms(&self) -> usize {
        self.inner.forward_forms()
    }

    pub fn shutdown(&self) {
        if let Some(id) = self.inner.listener.take() {
            self.inner.window.remove_message_listener(id);
        }
    }
}

impl AgentInner {
    fn announce(&self) {
        let ready = FrameMessage::UtmReady {
            source: Some(self.config.message_source.clone()),
        };
        if let Err(err) =
            self.parent
                .post_message_from(ready.to_json(), "*", Some(self.window.port()))
        {
            debug!(target: "messages", error = %err, "utm_ready not delivered");
        }
    }

    fn on_message(&self, event: &MessageEvent) {
        let Some(FrameMessage::UtmPopulate { source, data, .. }) =
            FrameMessage::from_json(&event.data)
        else {
            return;
        };
        if source != self.config.message_source {
            trace!(target: "messages", %source, "utm_populate from unknown source");
            return;
        }
        let record = AttributionRecord { parameters: data };
        populate_fields(&self.document, &record, &self.config);
        debug!(target: "messages", "frame populated from host message");
        *self.received.borrow_mut() = Some(record);
    }

    fn forward_forms(self: &Rc<Self>) -> usize {
        let forms = match self.document.select("form") {
            Ok(forms) => forms,
            Err(err) => {
                warn!(target: "forms", error = %err, "failed to process frame forms");
                return 0;
            }
        };
        let mut wired = 0;
        for form in forms {
            let target = Rc::as_ptr(&form.0);
            {
                let mut known = self.forms.borrow_mut();
                if known.iter().any(|f| f.as_ptr() == target) {
                    continue;
                }
                known.push(Rc::downgrade(&form.0));
            }
            let weak = Rc::downgrade(self);
            self.document.add_submit_listener(
                &form,
                Rc::new(move |event: &mut SubmitEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.forward_submission(&event.form);
                    }
                }),
            );
            wired += 1;
        }
        wired
    }

    /// Report the submission upward. The native submission is left alone.
    fn forward_submission(&self, form: &NodeRef) {
        let Some(fields) = extract_submission(form, &self.hidden) else {
            return;
        };
        let form_data: Map<String, JsonValue> = fields
            .into_iter()
            .map(|(name, value)| (name, JsonValue::String(value)))
            .collect();
        let message = FrameMessage::UtmFormSubmit {
            form_data: JsonValue::Object(form_data),
        };
        if let Err(err) = self.parent.post_message(message.to_json(), "*") {
            debug!(target: "messages", error = %err, "utm_form_submit not delivered");
        }
    }
}
