use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::trace;
use url::Url;

use super::timers::EventLoop;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("target window is closed")]
    Closed,
    #[error("target origin '{target}' does not match window origin '{actual}'")]
    OriginMismatch { target: String, actual: String },
}

/// Anything a message can be posted to, such as a frame's content window.
pub trait MessagePort {
    fn post_message(&self, data: JsonValue, target_origin: &str) -> Result<(), DeliveryError>;
}

#[derive(Clone)]
pub struct MessageEvent {
    pub data: JsonValue,
    /// Window that posted the message, when known. Replies go here.
    pub source: Option<Rc<dyn MessagePort>>,
}

pub type MessageListener = Rc<dyn Fn(&MessageEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct WindowState {
    origin: String,
    closed: Cell<bool>,
    next_listener: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, MessageListener)>>,
    event_loop: EventLoop,
}

/// A browsing context's global object, reduced to the message-passing
/// surface. Delivery is asynchronous: posted messages are queued on the
/// event loop and reach listeners on a later turn.
#[derive(Clone)]
pub struct Window {
    state: Rc<WindowState>,
}

impl Window {
    pub fn new(url: &Url, event_loop: EventLoop) -> Self {
        Self {
            state: Rc::new(WindowState {
                origin: url.origin().ascii_serialization(),
                closed: Cell::new(false),
                next_listener: Cell::new(1),
                listeners: RefCell::new(Vec::new()),
                event_loop,
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.state.origin
    }

    pub fn close(&self) {
        self.state.closed.set(true);
    }

    pub fn add_message_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.state.next_listener.get());
        self.state.next_listener.set(id.0 + 1);
        self.state.listeners.borrow_mut().push((id, listener));
        id
    }

    pub fn remove_message_listener(&self, id: ListenerId) {
        self.state.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.state.listeners.borrow().len()
    }

    /// Post `data` to this window on behalf of `source`.
    pub fn post_message_from(
        &self,
        data: JsonValue,
        target_origin: &str,
        source: Option<Rc<dyn MessagePort>>,
    ) -> Result<(), DeliveryError> {
        if self.state.closed.get() {
            return Err(DeliveryError::Closed);
        }
        if target_origin != "*" && target_origin != self.state.origin {
            return Err(DeliveryError::OriginMismatch {
                target: target_origin.to_string(),
                actual: self.state.origin.clone(),
            });
        }

        let target: Weak<WindowState> = Rc::downgrade(&self.state);
        self.state.event_loop.set_timeout(Duration::ZERO, move || {
            if let Some(state) = target.upgrade() {
                Window { state }.dispatch(MessageEvent { data, source });
            }
        });
        Ok(())
    }

    /// This window viewed as a message target.
    pub fn port(&self) -> Rc<dyn MessagePort> {
        Rc::new(self.clone())
    }

    fn dispatch(&self, event: MessageEvent) {
        if self.state.closed.get() {
            return;
        }
        let listeners: Vec<MessageListener> = self
            .state
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        trace!(target: "messages", origin = %self.state.origin, listeners = listeners.len(), "delivering message");
        for listener in listeners {
            listener(&event);
        }
    }
}

impl MessagePort for Window {
    fn post_message(&self, data: JsonValue, target_origin: &str) -> Result<(), DeliveryError> {
        self.post_message_from(data, target_origin, None)
    }
}
