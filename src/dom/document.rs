use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use kuchiki::traits::*;
use kuchiki::{parse_html, Node, NodeRef};
use tracing::debug;
use url::Url;

use super::forms;
use super::DomError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

impl ReadyState {
    pub fn is_ready(self) -> bool {
        matches!(self, ReadyState::Interactive | ReadyState::Complete)
    }
}

type AddedCallback = Rc<dyn Fn(&NodeRef)>;
type AddedPredicate = Rc<dyn Fn(&NodeRef) -> bool>;
pub type SubmitListener = Rc<dyn Fn(&mut SubmitEvent)>;

struct Observer {
    id: u64,
    predicate: AddedPredicate,
    callback: AddedCallback,
}

struct FormListener {
    form: Weak<Node>,
    listener: SubmitListener,
}

/// A form that actually left the page, with the data it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSubmission {
    pub action: Option<String>,
    pub fields: Vec<(String, String)>,
}

struct DocumentInner {
    root: NodeRef,
    url: Url,
    referrer: String,
    ready_state: Cell<ReadyState>,
    next_observer: Cell<u64>,
    observers: RefCell<Vec<Observer>>,
    submit_listeners: RefCell<Vec<FormListener>>,
    submissions: RefCell<Vec<NativeSubmission>>,
}

/// An HTML document with the handful of live behaviours the tracker relies
/// on: element-added notifications, submit events and native submissions.
///
/// Cloning yields another handle to the same document.
#[derive(Clone)]
pub struct Document {
    inner: Rc<DocumentInner>,
}

/// Submit event handed to listeners. Listeners may cancel the native
/// submission with `prevent_default`.
pub struct SubmitEvent {
    pub document: Document,
    pub form: NodeRef,
    default_prevented: bool,
}

impl SubmitEvent {
    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }
}

/// Handle returned by `on_element_added`; dropping it keeps the observer.
#[derive(Debug)]
pub struct Subscription {
    document: Weak<DocumentInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.document.upgrade() {
            inner.observers.borrow_mut().retain(|o| o.id != self.id);
        }
    }
}

impl std::fmt::Debug for DocumentInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("url", &self.url.as_str())
            .field("ready_state", &self.ready_state.get())
            .finish()
    }
}

impl Document {
    pub fn parse(html: &str, url: Url, referrer: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(DocumentInner {
                root: parse_html().one(html),
                url,
                referrer: referrer.into(),
                ready_state: Cell::new(ReadyState::Complete),
                next_observer: Cell::new(1),
                observers: RefCell::new(Vec::new()),
                submit_listeners: RefCell::new(Vec::new()),
                submissions: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn referrer(&self) -> &str {
        &self.inner.referrer
    }

    pub fn root(&self) -> &NodeRef {
        &self.inner.root
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.ready_state.get()
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.inner.ready_state.set(state);
    }

    pub fn same_document(&self, other: &Document) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// All elements matching `selector`, in document order.
    pub fn select(&self, selector: &str) -> Result<Vec<NodeRef>, DomError> {
        select_within(&self.inner.root, selector)
    }

    pub fn select_first(&self, selector: &str) -> Result<Option<NodeRef>, DomError> {
        Ok(self.select(selector)?.into_iter().next())
    }

    pub fn body(&self) -> NodeRef {
        self.select_first("body")
            .ok()
            .flatten()
            .unwrap_or_else(|| self.inner.root.clone())
    }

    /// Parse `html` and append the resulting nodes under `parent`, then tell
    /// observers about each appended element.
    pub fn append_html(&self, parent: &NodeRef, html: &str) -> Vec<NodeRef> {
        let fragment = parse_html().one(format!("<body>{html}</body>"));
        let Some(body) = select_within(&fragment, "body").ok().and_then(|b| b.into_iter().next())
        else {
            return Vec::new();
        };
        let added: Vec<NodeRef> = body.children().collect();
        for node in &added {
            parent.append(node.clone());
        }
        for node in added.iter().filter(|n| n.as_element().is_some()) {
            self.notify_added(node);
        }
        added
    }

    pub fn on_element_added<P, F>(&self, predicate: P, callback: F) -> Subscription
    where
        P: Fn(&NodeRef) -> bool + 'static,
        F: Fn(&NodeRef) + 'static,
    {
        let id = self.inner.next_observer.get();
        self.inner.next_observer.set(id + 1);
        self.inner.observers.borrow_mut().push(Observer {
            id,
            predicate: Rc::new(predicate),
            callback: Rc::new(callback),
        });
        Subscription {
            document: Rc::downgrade(&self.inner),
            id,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    fn notify_added(&self, node: &NodeRef) {
        let observers: Vec<(AddedPredicate, AddedCallback)> = self
            .inner
            .observers
            .borrow()
            .iter()
            .map(|o| (Rc::clone(&o.predicate), Rc::clone(&o.callback)))
            .collect();
        for (predicate, callback) in observers {
            if predicate(node) {
                callback(node);
            }
        }
    }

    pub fn add_submit_listener(&self, form: &NodeRef, listener: SubmitListener) {
        let mut listeners = self.inner.submit_listeners.borrow_mut();
        listeners.retain(|l| l.form.strong_count() > 0);
        listeners.push(FormListener {
            form: Rc::downgrade(&form.0),
            listener,
        });
    }

    /// Fire a submit event at `form` as a user submission would. The form is
    /// submitted natively unless a listener prevents it.
    pub fn dispatch_submit(&self, form: &NodeRef) -> bool {
        let target = Rc::as_ptr(&form.0);
        let listeners: Vec<SubmitListener> = self
            .inner
            .submit_listeners
            .borrow()
            .iter()
            .filter(|l| l.form.as_ptr() == target)
            .map(|l| Rc::clone(&l.listener))
            .collect();

        let mut event = SubmitEvent {
            document: self.clone(),
            form: form.clone(),
            default_prevented: false,
        };
        for listener in listeners {
            listener(&mut event);
        }

        if event.default_prevented {
            debug!(target: "forms", "native submission prevented");
            false
        } else {
            self.submit_form(form);
            true
        }
    }

    /// Programmatic `form.submit()`: no submit event, straight to the network.
    pub fn submit_form(&self, form: &NodeRef) {
        let action = form
            .as_element()
            .and_then(|el| el.attributes.borrow().get("action").map(str::to_string));
        self.inner.submissions.borrow_mut().push(NativeSubmission {
            action,
            fields: forms::form_data(form),
        });
    }

    pub fn submissions(&self) -> Vec<NativeSubmission> {
        self.inner.submissions.borrow().clone()
    }

    pub fn to_html(&self) -> String {
        self.inner.root.to_string()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.inner, f)
    }
}

pub fn select_within(node: &NodeRef, selector: &str) -> Result<Vec<NodeRef>, DomError> {
    let matches = node
        .select(selector)
        .map_err(|()| DomError::Selector(selector.to_string()))?;
    Ok(matches.map(|el| el.as_node().clone()).collect())
}

pub fn is_element_named(node: &NodeRef, tag: &str) -> bool {
    node.as_element()
        .map(|el| {
            let name: &str = &el.name.local;
            name.eq_ignore_ascii_case(tag)
        })
        .unwrap_or(false)
}

pub fn attribute(node: &NodeRef, name: &str) -> Option<String> {
    node.as_element()
        .and_then(|el| el.attributes.borrow().get(name).map(str::to_string))
}

pub fn has_attribute(node: &NodeRef, name: &str) -> bool {
    node.as_element()
        .map(|el| el.attributes.borrow().contains(name))
        .unwrap_or(false)
}

pub fn set_attribute(node: &NodeRef, name: &str, value: &str) -> Result<(), DomError> {
    let element = node.as_element().ok_or(DomError::NotAnElement)?;
    element
        .attributes
        .borrow_mut()
        .insert(name, value.to_string());
    Ok(())
}

pub fn has_class(node: &NodeRef, class: &str) -> bool {
    attribute(node, "class")
        .map(|classes| classes.split_ascii_whitespace().any(|c| c == class))
        .unwrap_or(false)
}
