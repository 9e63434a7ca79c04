use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use kuchiki::{Node, NodeRef};
use tracing::{debug, trace, warn};

use crate::attribution::AttributionRecord;
use crate::config::TrackerConfig;
use crate::dom::document::{attribute, has_attribute, is_element_named, select_within};
use crate::dom::{
    Document, EventLoop, FrameHost, LoadListenerId, MessagePort, Reachability, Subscription,
    TimerId,
};

use super::interceptor::SubmissionInterceptor;
use super::populate::populate_fields;
use super::protocol::FrameMessage;

const OPAQUE_SCHEMES: &[&str] = &["data:", "blob:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IframeState {
    Unprocessed,
    AwaitingReady,
    /// Terminal. Direct access was refused; only messaging was attempted.
    Inaccessible,
    /// Terminal.
    Populated,
}

impl IframeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IframeState::Inaccessible | IframeState::Populated)
    }
}

struct TrackedFrame {
    element: Weak<Node>,
    state: IframeState,
    attempts: u32,
    poll_timer: Option<TimerId>,
    load_listener: Option<LoadListenerId>,
}

type FrameKey = usize;

fn frame_key(iframe: &NodeRef) -> FrameKey {
    Rc::as_ptr(&iframe.0) as usize
}

/// Platform-independent reasons an iframe can never be inspected.
fn is_opaque(iframe: &NodeRef) -> bool {
    let src = attribute(iframe, "src").unwrap_or_default();
    let src = src.trim_start();
    OPAQUE_SCHEMES.iter().any(|scheme| {
        src.get(..scheme.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .unwrap_or(false)
    }) || has_attribute(iframe, "sandbox")
}

struct SyncInner {
    record: AttributionRecord,
    config: TrackerConfig,
    frames: Rc<dyn FrameHost>,
    interceptor: SubmissionInterceptor,
    event_loop: EventLoop,
    iframes: RefCell<HashMap<FrameKey, TrackedFrame>>,
    pending_added: RefCell<Vec<NodeRef>>,
    debounce_timer: Cell<Option<TimerId>>,
    observed: RefCell<Vec<Document>>,
    subscriptions: RefCell<Vec<Subscription>>,
    torn_down: Cell<bool>,
}

/// Drives every iframe it sees through
/// `Unprocessed -> AwaitingReady -> {Populated | Inaccessible}`.
/// Dropping the last handle without calling
/// `teardown` leaves observers registered but inert.
#[derive(Clone)]
pub struct FrameSync {
    inner: Rc<SyncInner>,
}

impl FrameSync {
    /// Start observing `document` and process the iframes it already holds.
    pub fn start(
        document: &Document,
        record: AttributionRecord,
        config: TrackerConfig,
        frames: Rc<dyn FrameHost>,
        interceptor: SubmissionInterceptor,
        event_loop: EventLoop,
    ) -> Self {
        let inner = Rc::new(SyncInner {
            record,
            config,
            frames,
            interceptor,
            event_loop,
            iframes: RefCell::new(HashMap::new()),
            pending_added: RefCell::new(Vec::new()),
            debounce_timer: Cell::new(None),
            observed: RefCell::new(Vec::new()),
            subscriptions: RefCell::new(Vec::new()),
            torn_down: Cell::new(false),
        });
        inner.observe(document);
        inner.scan(document.root());
        Self { inner }
    }

    pub fn record(&self) -> &AttributionRecord {
        &self.inner.record
    }

    pub fn state_of(&self, iframe: &NodeRef) -> IframeState {
        self.inner
            .iframes
            .borrow()
            .get(&frame_key(iframe))
            .map(|tracked| tracked.state)
            .unwrap_or(IframeState::Unprocessed)
    }

    /// Poll attempts made so far for `iframe`.
    pub fn attempts(&self, iframe: &NodeRef) -> u32 {
        self.inner
            .iframes
            .borrow()
            .get(&frame_key(iframe))
            .map(|tracked| tracked.attempts)
            .unwrap_or(0)
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.iframes.borrow().len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.get()
    }

    /// Stop observing and cancel every pending timer. Safe to call twice.
    pub fn teardown(&self) {
        let inner = &self.inner;
        if inner.torn_down.replace(true) {
            return;
        }
        if let Some(timer) = inner.debounce_timer.take() {
            inner.event_loop.clear_timeout(timer);
        }
        inner.pending_added.borrow_mut().clear();
        for subscription in inner.subscriptions.borrow_mut().drain(..) {
            subscription.unsubscribe();
        }
        inner.observed.borrow_mut().clear();
        for tracked in inner.iframes.borrow_mut().values_mut() {
            if let Some(timer) = tracked.poll_timer.take() {
                inner.event_loop.clear_timeout(timer);
            }
            if let (Some(id), Some(node)) = (tracked.load_listener.take(), tracked.element.upgrade()) {
                inner.frames.remove_load_listener(&NodeRef(node), id);
            }
        }
        debug!(target: "frames", "frame sync torn down");
    }
}

enum Readiness {
    Ready(Document),
    NotYetReady,
    Inaccessible,
}

impl SyncInner {
    fn readiness(&self, iframe: &NodeRef) -> Readiness {
        if is_opaque(iframe) {
            return Readiness::Inaccessible;
        }
        match self.frames.probe(iframe) {
            Reachability::Ready(document) => Readiness::Ready(document),
            Reachability::NotYetReady => Readiness::NotYetReady,
            Reachability::Denied => Readiness::Inaccessible,
        }
    }

    fn observe(self: &Rc<Self>, document: &Document) {
        if self.observed.borrow().iter().any(|d| d.same_document(document)) {
            return;
        }
        let weak = Rc::downgrade(self);
        let subscription = document.on_element_added(
            |_| true,
            move |node| {
                if let Some(inner) = weak.upgrade() {
                    inner.element_added(node);
                }
            },
        );
        self.observed.borrow_mut().push(document.clone());
        self.subscriptions.borrow_mut().push(subscription);
    }

    fn element_added(self: &Rc<Self>, node: &NodeRef) {
        if self.torn_down.get() {
            return;
        }
        self.pending_added.borrow_mut().push(node.clone());
        if let Some(timer) = self.debounce_timer.take() {
            self.event_loop.clear_timeout(timer);
        }
        let weak = Rc::downgrade(self);
        let timer = self
            .event_loop
            .set_timeout(self.config.frames.debounce(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_added();
                }
            });
        self.debounce_timer.set(Some(timer));
    }

    fn flush_added(self: &Rc<Self>) {
        self.debounce_timer.set(None);
        if self.torn_down.get() {
            return;
        }
        let added = std::mem::take(&mut *self.pending_added.borrow_mut());
        trace!(target: "frames", elements = added.len(), "processing added elements");
        for node in &added {
            if is_element_named(node, "iframe") {
                self.process_iframe(node);
            } else {
                self.scan(node);
            }
        }
    }

    fn scan(self: &Rc<Self>, root: &NodeRef) {
        match select_within(root, "iframe") {
            Ok(iframes) => {
                for iframe in &iframes {
                    self.process_iframe(iframe);
                }
            }
            Err(err) => warn!(target: "frames", error = %err, "failed to scan for iframes"),
        }
    }

    fn set_state(&self, key: FrameKey, state: IframeState) {
        if let Some(tracked) = self.iframes.borrow_mut().get_mut(&key) {
            tracked.state = state;
            if state.is_terminal() {
                if let Some(timer) = tracked.poll_timer.take() {
                    self.event_loop.clear_timeout(timer);
                }
            }
        }
    }

    fn state(&self, key: FrameKey) -> Option<IframeState> {
        self.iframes.borrow().get(&key).map(|tracked| tracked.state)
    }

    fn process_iframe(self: &Rc<Self>, iframe: &NodeRef) {
        if self.torn_down.get() {
            return;
        }
        let key = frame_key(iframe);
        {
            let mut iframes = self.iframes.borrow_mut();
            if iframes.contains_key(&key) {
                return;
            }
            iframes.retain(|_, tracked| tracked.element.strong_count() > 0);
            iframes.insert(
                key,
                TrackedFrame {
                    element: Rc::downgrade(&iframe.0),
                    state: IframeState::Unprocessed,
                    attempts: 0,
                    poll_timer: None,
                    load_listener: None,
                },
            );
        }

        match self.readiness(iframe) {
            Readiness::Ready(document) => self.populate(iframe, &document),
            Readiness::Inaccessible => self.mark_inaccessible(iframe),
            Readiness::NotYetReady => self.await_ready(iframe),
        }
    }

    fn await_ready(self: &Rc<Self>, iframe: &NodeRef) {
        let key = frame_key(iframe);
        self.set_state(key, IframeState::AwaitingReady);
        trace!(target: "frames", src = ?attribute(iframe, "src"), "iframe awaiting readiness");

        let weak = Rc::downgrade(self);
        let element = Rc::downgrade(&iframe.0);
        let listener = self.frames.on_load(
            iframe,
            Rc::new(move || {
                if let (Some(inner), Some(node)) = (weak.upgrade(), element.upgrade()) {
                    inner.frame_loaded(&NodeRef(node));
                }
            }),
        );
        if let Some(tracked) = self.iframes.borrow_mut().get_mut(&key) {
            tracked.load_listener = Some(listener);
        }

        self.schedule_poll(key, self.config.frames.initial_poll_delay());
    }

    fn schedule_poll(self: &Rc<Self>, key: FrameKey, delay: std::time::Duration) {
        let weak = Rc::downgrade(self);
        let timer = self.event_loop.set_timeout(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.poll(key);
            }
        });
        if let Some(tracked) = self.iframes.borrow_mut().get_mut(&key) {
            tracked.poll_timer = Some(timer);
        }
    }

    fn poll(self: &Rc<Self>, key: FrameKey) {
        if self.torn_down.get() {
            return;
        }
        let (element, attempts) = {
            let mut iframes = self.iframes.borrow_mut();
            let Some(tracked) = iframes.get_mut(&key) else {
                return;
            };
            tracked.poll_timer = None;
            if tracked.state != IframeState::AwaitingReady {
                return;
            }
            tracked.attempts += 1;
            (tracked.element.upgrade(), tracked.attempts)
        };
        let Some(node) = element else {
            self.iframes.borrow_mut().remove(&key);
            return;
        };
        let iframe = NodeRef(node);

        match self.readiness(&iframe) {
            Readiness::Ready(document) => self.populate(&iframe, &document),
            Readiness::Inaccessible => self.mark_inaccessible(&iframe),
            Readiness::NotYetReady if attempts < self.config.frames.max_poll_attempts => {
                self.schedule_poll(key, self.config.frames.poll_interval());
            }
            Readiness::NotYetReady => {
                debug!(target: "frames", attempts, "iframe never became ready, polling abandoned");
            }
        }
    }

    fn frame_loaded(self: &Rc<Self>, iframe: &NodeRef) {
        if self.torn_down.get() {
            return;
        }
        if self.state(frame_key(iframe)) != Some(IframeState::AwaitingReady) {
            return;
        }
        match self.readiness(iframe) {
            Readiness::Ready(document) => self.populate(iframe, &document),
            Readiness::Inaccessible => self.mark_inaccessible(iframe),
            Readiness::NotYetReady => {}
        }
    }

    fn populate(self: &Rc<Self>, iframe: &NodeRef, document: &Document) {
        let key = frame_key(iframe);
        if self.state(key) == Some(IframeState::Populated) {
            return;
        }
        self.set_state(key, IframeState::Populated);

        populate_fields(document, &self.record, &self.config);
        let forms = self.interceptor.attach_all(document);
        debug!(target: "frames", url = %document.url(), forms, "iframe populated");

        self.observe(document);
        self.scan(document.root());
    }

    fn mark_inaccessible(&self, iframe: &NodeRef) {
        self.set_state(frame_key(iframe), IframeState::Inaccessible);
        let Some(window) = self.frames.content_window(iframe) else {
            debug!(target: "frames", "inaccessible iframe has no window to message");
            return;
        };
        let message = FrameMessage::populate(
            &self.config.message_source,
            self.record.parameters.clone(),
            self.event_loop.wall_clock_ms(),
        );
        match window.post_message(message.to_json(), "*") {
            Ok(()) => debug!(target: "frames", "utm_populate posted to inaccessible iframe"),
            Err(err) => debug!(target: "frames", error = %err, "utm_populate not delivered"),
        }
    }
}
