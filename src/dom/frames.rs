use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use kuchiki::{Node, NodeRef};
use tracing::trace;

use super::document::Document;
use super::window::{MessagePort, Window};

/// Result of asking whether an iframe's content can be inspected right now.
#[derive(Debug, Clone)]
pub enum Reachability {
    /// Same-origin content whose document reports interactive or complete.
    Ready(Document),
    /// Nothing inspectable yet; the frame may still be loading.
    NotYetReady,
    /// Access is refused by the same-origin policy.
    Denied,
}

pub type LoadListener = Rc<dyn Fn()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadListenerId(u64);

/// The platform's view of iframe contents.
pub trait FrameHost {
    fn probe(&self, iframe: &NodeRef) -> Reachability;
    fn content_window(&self, iframe: &NodeRef) -> Option<Rc<dyn MessagePort>>;
    /// Call `listener` every time the iframe fires `load`.
    fn on_load(&self, iframe: &NodeRef, listener: LoadListener) -> LoadListenerId;
    fn remove_load_listener(&self, iframe: &NodeRef, id: LoadListenerId);
}

enum FrameContent {
    Blank,
    SameOrigin { document: Document, window: Window },
    CrossOrigin { window: Window },
}

struct FrameSlot {
    element: Weak<Node>,
    content: FrameContent,
    load_listeners: Vec<(LoadListenerId, LoadListener)>,
}

/// In-memory frame host. Slots are keyed by iframe element identity and hold
/// the element weakly, so a removed iframe takes its slot with it on the
/// next lookup.
#[derive(Default)]
pub struct FrameRegistry {
    slots: RefCell<HashMap<usize, FrameSlot>>,
    next_listener: Cell<u64>,
}

fn element_key(iframe: &NodeRef) -> usize {
    Rc::as_ptr(&iframe.0) as usize
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<R>(&self, iframe: &NodeRef, f: impl FnOnce(&mut FrameSlot) -> R) -> R {
        let mut slots = self.slots.borrow_mut();
        slots.retain(|_, slot| slot.element.strong_count() > 0);
        let slot = slots.entry(element_key(iframe)).or_insert_with(|| FrameSlot {
            element: Rc::downgrade(&iframe.0),
            content: FrameContent::Blank,
            load_listeners: Vec::new(),
        });
        f(slot)
    }

    /// Navigate `iframe` to a same-origin document. Does not fire `load`.
    pub fn load_same_origin(&self, iframe: &NodeRef, document: Document, window: Window) {
        self.with_slot(iframe, |slot| {
            slot.content = FrameContent::SameOrigin { document, window }
        });
    }

    /// Navigate `iframe` to a document the host page may only message.
    pub fn load_cross_origin(&self, iframe: &NodeRef, window: Window) {
        self.with_slot(iframe, |slot| {
            slot.content = FrameContent::CrossOrigin { window }
        });
    }

    /// Fire the iframe's `load` event.
    pub fn dispatch_load(&self, iframe: &NodeRef) {
        let listeners: Vec<LoadListener> = self.with_slot(iframe, |slot| {
            slot.load_listeners
                .iter()
                .map(|(_, listener)| Rc::clone(listener))
                .collect()
        });
        trace!(target: "frames", listeners = listeners.len(), "dispatching iframe load");
        for listener in listeners {
            listener();
        }
    }

    pub fn load_listener_count(&self, iframe: &NodeRef) -> usize {
        self.with_slot(iframe, |slot| slot.load_listeners.len())
    }

    pub fn frame_count(&self) -> usize {
        let mut slots = self.slots.borrow_mut();
        slots.retain(|_, slot| slot.element.strong_count() > 0);
        slots.len()
    }
}

impl FrameHost for FrameRegistry {
    fn probe(&self, iframe: &NodeRef) -> Reachability {
        self.with_slot(iframe, |slot| match &slot.content {
            FrameContent::Blank => Reachability::NotYetReady,
            FrameContent::SameOrigin { document, .. } if document.ready_state().is_ready() => {
                Reachability::Ready(document.clone())
            }
            FrameContent::SameOrigin { .. } => Reachability::NotYetReady,
            FrameContent::CrossOrigin { .. } => Reachability::Denied,
        })
    }

    fn content_window(&self, iframe: &NodeRef) -> Option<Rc<dyn MessagePort>> {
        self.with_slot(iframe, |slot| match &slot.content {
            FrameContent::Blank => None,
            FrameContent::SameOrigin { window, .. } | FrameContent::CrossOrigin { window } => {
                Some(window.port())
            }
        })
    }

    fn on_load(&self, iframe: &NodeRef, listener: LoadListener) -> LoadListenerId {
        let id = LoadListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.with_slot(iframe, |slot| slot.load_listeners.push((id, listener)));
        id
    }

    fn remove_load_listener(&self, iframe: &NodeRef, id: LoadListenerId) {
        self.with_slot(iframe, |slot| slot.load_listeners.retain(|(lid, _)| *lid != id));
    }
}
