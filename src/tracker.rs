use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::attribution::{decide, external_referrer, Action, AttributionRecord, Decision, UrlParams};
use crate::config::{ConfigError, TrackerConfig};
use crate::dom::{Document, EventLoop, FrameHost, ListenerId, Window};
use crate::storage::{AttributionStore, CookieStore, StoreError};
use crate::tracking::{
    populate_fields, ActiveSync, EventSink, FrameSync, HostMessageHandler, SubmissionInterceptor,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("attribution store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("invalid tracker configuration: {0}")]
    Config(#[from] ConfigError),
}

/// The page the tracker runs in.
#[derive(Clone)]
pub struct PageContext {
    pub document: Document,
    pub window: Window,
    pub frames: Rc<dyn FrameHost>,
}

pub struct LeadTracker {
    config: TrackerConfig,
    page: PageContext,
    store: AttributionStore,
    event_loop: EventLoop,
    interceptor: SubmissionInterceptor,
    active: ActiveSync,
    // Held so the window's weak listener stays live.
    _handler: Rc<HostMessageHandler>,
    listener: ListenerId,
    decision: Decision,
}

impl LeadTracker {
    /// Run the initialization pass. Fails only when configuration is invalid
    /// or the cookie store cannot be read; in that case nothing is tracked.
    pub fn initialize(
        config: TrackerConfig,
        page: PageContext,
        cookies: Rc<dyn CookieStore>,
        sink: Rc<dyn EventSink>,
        event_loop: EventLoop,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        let store = AttributionStore::new(cookies, &config);
        let existing = load_existing(&store)?;

        let interceptor = SubmissionInterceptor::new(&config, Rc::clone(&sink), event_loop.clone())?;
        let active: ActiveSync = Rc::new(RefCell::new(None));
        let handler = HostMessageHandler::new(
            config.message_source.clone(),
            sink,
            event_loop.clone(),
            Rc::clone(&active),
        );
        let listener = handler.install(&page.window);

        let decision = run_pass(&config, &page, &store, existing.as_ref(), &interceptor, &event_loop, &active);
        info!(target: "attribution", action = ?decision.action, url = %page.document.url(), "lead tracking initialized");

        Ok(Self {
            config,
            page,
            store,
            event_loop,
            interceptor,
            active,
            _handler: handler,
            listener,
            decision,
        })
    }

    /// Re-read the store and repeat the pass, replacing the running frame
    /// synchronization.
    pub fn reinitialize(&mut self) -> Result<&Decision, TrackerError> {
        let existing = load_existing(&self.store)?;
        self.decision = run_pass(
            &self.config,
            &self.page,
            &self.store,
            existing.as_ref(),
            &self.interceptor,
            &self.event_loop,
            &self.active,
        );
        Ok(&self.decision)
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn record(&self) -> &AttributionRecord {
        &self.decision.record
    }

    pub fn frame_sync(&self) -> Option<FrameSync> {
        self.active.borrow().clone()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Tear down frame synchronization and stop answering frame messages.
    pub fn shutdown(&self) {
        if let Some(sync) = self.active.borrow_mut().take() {
            sync.teardown();
        }
        self.page.window.remove_message_listener(self.listener);
        debug!(target: "attribution", "lead tracking shut down");
    }
}

fn load_existing(store: &AttributionStore) -> Result<Option<AttributionRecord>, TrackerError> {
    store.load().map_err(|err| {
        error!(target: "storage", error = %err, "cookie store unavailable, lead tracking disabled");
        TrackerError::StoreUnavailable(err)
    })
}

fn run_pass(
    config: &TrackerConfig,
    page: &PageContext,
    store: &AttributionStore,
    existing: Option<&AttributionRecord>,
    interceptor: &SubmissionInterceptor,
    event_loop: &EventLoop,
    active: &ActiveSync,
) -> Decision {
    let document = &page.document;
    let params = UrlParams::extract(document.url(), &config.tracked_parameters);
    let referrer = external_referrer(document.referrer(), document.url(), &config.empty_referrer_value);
    let decision = decide(&params, existing, referrer, config);
    debug!(
        target: "attribution",
        action = ?decision.action,
        url_params = params.len(),
        had_record = existing.is_some(),
        external_referrer = referrer.is_some(),
        "attribution decided"
    );

    let written = match decision.action {
        Action::Create => store.create(&decision.record),
        Action::Replace => store.replace(&decision.record),
        Action::Keep => Ok(()),
    };
    if let Err(err) = written {
        warn!(target: "storage", error = %err, "failed to persist attribution record");
    }

    populate_fields(document, &decision.record, config);

    if let Some(previous) = active.borrow_mut().take() {
        previous.teardown();
    }
    let sync = FrameSync::start(
        document,
        decision.record.clone(),
        config.clone(),
        Rc::clone(&page.frames),
        interceptor.clone(),
        event_loop.clone(),
    );
    *active.borrow_mut() = Some(sync);

    interceptor.attach_all(document);
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::FrameRegistry;
    use crate::storage::MemoryCookieJar;
    use crate::tracking::DataLayer;
    use url::Url;

    fn page(url: &str, referrer: &str, html: &str, event_loop: &EventLoop) -> PageContext {
        let url = Url::parse(url).unwrap();
        PageContext {
            document: Document::parse(html, url.clone(), referrer),
            window: Window::new(&url, event_loop.clone()),
            frames: Rc::new(FrameRegistry::new()),
        }
    }

    #[test]
    fn unavailable_store_disables_tracking() {
        let event_loop = EventLoop::with_epoch(0);
        let page = page("https://shop.example/?utm_source=google", "", "", &event_loop);
        let window = page.window.clone();
        let result = LeadTracker::initialize(
            TrackerConfig::default(),
            page,
            Rc::new(MemoryCookieJar::unavailable()),
            Rc::new(DataLayer::new()),
            event_loop,
        );
        assert!(matches!(result, Err(TrackerError::StoreUnavailable(_))));
        assert_eq!(window.listener_count(), 0);
    }

    #[test]
    fn reinitialize_replaces_frame_sync() {
        let event_loop = EventLoop::with_epoch(0);
        let page = page(
            "https://shop.example/?utm_source=google",
            "",
            "<iframe src='/slow'></iframe>",
            &event_loop,
        );
        let mut tracker = LeadTracker::initialize(
            TrackerConfig::default(),
            page,
            Rc::new(MemoryCookieJar::new()),
            Rc::new(DataLayer::new()),
            event_loop.clone(),
        )
        .unwrap();
        let first = tracker.frame_sync().unwrap();
        assert_eq!(tracker.decision().action, Action::Create);

        let decision = tracker.reinitialize().unwrap();
        assert_eq!(decision.action, Action::Replace);
        assert!(first.is_torn_down());
        assert!(!tracker.frame_sync().unwrap().is_torn_down());

        tracker.shutdown();
        tracker.shutdown();
        assert!(tracker.frame_sync().is_none());
        assert!(!event_loop.has_pending());
    }
}
