use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::dom::{EventLoop, ListenerId, MessageEvent, MessagePort, Window};

use super::frame_sync::FrameSync;
use super::protocol::{form_data_entries, FrameMessage};
use super::sink::{EventSink, SubmissionOrigin, TrackingEvent};

/// The engine currently answering `utm_ready`, shared with the tracker that
/// replaces it on re-initialization.
pub type ActiveSync = Rc<RefCell<Option<FrameSync>>>;

/// Host-page listener for messages coming up from embedded frames.
pub struct HostMessageHandler {
    message_source: String,
    sink: Rc<dyn EventSink>,
    event_loop: EventLoop,
    active: ActiveSync,
}

impl HostMessageHandler {
    pub fn new(
        message_source: impl Into<String>,
        sink: Rc<dyn EventSink>,
        event_loop: EventLoop,
        active: ActiveSync,
    ) -> Rc<Self> {
        Rc::new(Self {
            message_source: message_source.into(),
            sink,
            event_loop,
            active,
        })
    }

    /// Register on `window`. The window only holds a weak reference, so the
    /// handler stops answering once the caller drops it.
    pub fn install(self: &Rc<Self>, window: &Window) -> ListenerId {
        let weak = Rc::downgrade(self);
        window.add_message_listener(Rc::new(move |event: &MessageEvent| {
            if let Some(handler) = weak.upgrade() {
                handler.handle(event);
            }
        }))
    }

    pub fn handle(&self, event: &MessageEvent) {
        match FrameMessage::from_json(&event.data) {
            Some(FrameMessage::UtmReady { .. }) => self.answer_ready(event),
            Some(FrameMessage::UtmFormSubmit { form_data }) => {
                let Some(fields) = form_data_entries(&form_data) else {
                    debug!(target: "messages", "utm_form_submit without a formData object");
                    return;
                };
                for (name, value) in fields {
                    self.sink.push(TrackingEvent::Field { name, value });
                }
                self.sink.push(TrackingEvent::Submission {
                    event_id: self.event_loop.wall_clock_ms().to_string(),
                    origin: SubmissionOrigin::CrossOrigin,
                });
                debug!(target: "messages", "cross-origin submission tracked");
            }
            Some(FrameMessage::UtmPopulate { .. }) | None => {
                trace!(target: "messages", "ignoring message");
            }
        }
    }

    fn answer_ready(&self, event: &MessageEvent) {
        let parameters = match self.active.borrow().as_ref() {
            Some(sync) => sync.record().parameters.clone(),
            None => {
                debug!(target: "messages", "utm_ready before tracking started");
                return;
            }
        };
        let Some(source) = &event.source else {
            debug!(target: "messages", "utm_ready without a source window");
            return;
        };
        let reply = FrameMessage::populate(
            &self.message_source,
            parameters,
            self.event_loop.wall_clock_ms(),
        );
        if let Err(err) = source.post_message(reply.to_json(), "*") {
            warn!(target: "messages", error = %err, "failed to answer utm_ready");
        }
    }
}
