use std::rc::Rc;
use std::time::Duration;

use kuchiki::NodeRef;
use lead_tracker::dom::document::attribute;
use lead_tracker::{
    DataLayer, Document, EventLoop, FrameRegistry, IframeState, LeadTracker, MemoryCookieJar,
    PageContext, ReadyState, TrackerConfig, Window,
};
use serde_json::json;
use url::Url;

const HOST: &str = "https://shop.example/?utm_source=google";

struct Page {
    event_loop: EventLoop,
    document: Document,
    frames: Rc<FrameRegistry>,
    sink: Rc<DataLayer>,
}

impl Page {
    fn new(html: &str) -> Self {
        let event_loop = EventLoop::with_epoch(1_700_000_000_000);
        Self {
            document: Document::parse(html, Url::parse(HOST).unwrap(), ""),
            event_loop,
            frames: Rc::new(FrameRegistry::new()),
            sink: Rc::new(DataLayer::new()),
        }
    }

    fn iframe(&self, selector: &str) -> NodeRef {
        self.document
            .select_first(selector)
            .unwrap()
            .expect("iframe present")
    }

    /// Give `iframe` a same-origin document in the given ready state.
    fn load_frame(&self, iframe: &NodeRef, html: &str, state: ReadyState) -> Document {
        let url = Url::parse("https://shop.example/embedded").unwrap();
        let document = Document::parse(html, url.clone(), HOST);
        document.set_ready_state(state);
        self.frames.load_same_origin(
            iframe,
            document.clone(),
            Window::new(&url, self.event_loop.clone()),
        );
        document
    }

    fn start(&self) -> LeadTracker {
        LeadTracker::initialize(
            TrackerConfig::default(),
            PageContext {
                document: self.document.clone(),
                window: Window::new(self.document.url(), self.event_loop.clone()),
                frames: self.frames.clone(),
            },
            Rc::new(MemoryCookieJar::new()),
            self.sink.clone(),
            self.event_loop.clone(),
        )
        .expect("tracker initializes")
    }
}

fn value(document: &Document, selector: &str) -> Option<String> {
    let node = document.select_first(selector).unwrap().expect("element present");
    attribute(&node, "value")
}

#[test]
fn data_iframe_is_inaccessible_without_retries() {
    let page = Page::new(r#"<body><iframe src="data:text/html,<form><input name='utm_source'></form>"></iframe></body>"#);
    let tracker = page.start();
    let sync = tracker.frame_sync().unwrap();
    let iframe = page.iframe("iframe");

    assert_eq!(sync.state_of(&iframe), IframeState::Inaccessible);
    assert!(!page.event_loop.has_pending());
    assert_eq!(page.event_loop.run_until_idle(), 0);
    assert_eq!(sync.attempts(&iframe), 0);
}

#[test]
fn ready_same_origin_iframe_is_populated_immediately() {
    let page = Page::new(r#"<body><iframe id="f" src="/embedded"></iframe></body>"#);
    let frame = page.load_frame(
        &page.iframe("#f"),
        r#"<form><input name="utm_source"><input name="http_referer"></form>"#,
        ReadyState::Interactive,
    );
    let tracker = page.start();

    assert_eq!(
        tracker.frame_sync().unwrap().state_of(&page.iframe("#f")),
        IframeState::Populated
    );
    assert_eq!(value(&frame, "input[name='utm_source']").as_deref(), Some("google"));
    assert_eq!(value(&frame, "input[name='http_referer']").as_deref(), Some("empty"));
}

#[test]
fn polling_picks_up_a_frame_that_becomes_ready() {
    let page = Page::new(r#"<body><iframe id="f" src="/embedded"></iframe></body>"#);
    let frame = page.load_frame(&page.iframe("#f"), r#"<input name="utm_source">"#, ReadyState::Loading);
    let tracker = page.start();
    let sync = tracker.frame_sync().unwrap();
    let iframe = page.iframe("#f");
    assert_eq!(sync.state_of(&iframe), IframeState::AwaitingReady);

    page.event_loop.advance(Duration::from_millis(250));
    assert_eq!(sync.attempts(&iframe), 3);
    frame.set_ready_state(ReadyState::Complete);
    page.event_loop.advance(Duration::from_millis(100));

    assert_eq!(sync.state_of(&iframe), IframeState::Populated);
    assert_eq!(sync.attempts(&iframe), 4);
    assert_eq!(value(&frame, "input").as_deref(), Some("google"));
    assert!(!page.event_loop.has_pending());
}

#[test]
fn polling_gives_up_after_the_attempt_limit() {
    let page = Page::new(r#"<body><iframe id="f" src="/never"></iframe></body>"#);
    let tracker = page.start();
    let sync = tracker.frame_sync().unwrap();
    let iframe = page.iframe("#f");

    page.event_loop.run_until_idle();
    assert_eq!(sync.attempts(&iframe), 50);
    assert_eq!(sync.state_of(&iframe), IframeState::AwaitingReady);
    assert_eq!(page.event_loop.now(), Duration::from_millis(50 + 49 * 100));
    assert!(!page.event_loop.has_pending());

    // A late load event is still honoured.
    let frame = page.load_frame(&iframe, r#"<input name="utm_source">"#, ReadyState::Complete);
    page.frames.dispatch_load(&iframe);
    assert_eq!(sync.state_of(&iframe), IframeState::Populated);
    assert_eq!(value(&frame, "input").as_deref(), Some("google"));
}

#[test]
fn injected_iframes_are_debounced_into_one_pass() {
    let page = Page::new(r#"<body><div id="slot"></div></body>"#);
    let tracker = page.start();
    let sync = tracker.frame_sync().unwrap();
    let slot = page.document.select_first("#slot").unwrap().unwrap();

    let first = page.document.append_html(&slot, r#"<iframe id="a" src="/a"></iframe>"#);
    page.load_frame(&first[0], "<p></p>", ReadyState::Complete);
    page.event_loop.advance(Duration::from_millis(60));

    let second = page
        .document
        .append_html(&slot, r#"<div><iframe id="b" src="/b"></iframe></div>"#);
    let nested = page.iframe("#b");
    page.load_frame(&nested, "<p></p>", ReadyState::Complete);
    page.event_loop.advance(Duration::from_millis(60));

    // The second addition restarted the window; nothing has been examined yet.
    assert_eq!(sync.tracked_count(), 0);
    assert_eq!(second.len(), 1);

    page.event_loop.advance(Duration::from_millis(50));
    assert_eq!(sync.tracked_count(), 2);
    assert_eq!(sync.state_of(&page.iframe("#a")), IframeState::Populated);
    assert_eq!(sync.state_of(&nested), IframeState::Populated);
}

#[test]
fn nested_frames_are_followed_and_observed() {
    let page = Page::new(r#"<body><iframe id="outer" src="/outer"></iframe></body>"#);
    let outer = page.load_frame(
        &page.iframe("#outer"),
        r#"<body><iframe id="inner" src="/inner"></iframe></body>"#,
        ReadyState::Complete,
    );
    let inner_iframe = outer.select_first("#inner").unwrap().unwrap();
    let inner = page.load_frame(&inner_iframe, r#"<input name="utm_source">"#, ReadyState::Complete);

    let tracker = page.start();
    let sync = tracker.frame_sync().unwrap();
    assert_eq!(sync.state_of(&inner_iframe), IframeState::Populated);
    assert_eq!(value(&inner, "input").as_deref(), Some("google"));

    // An iframe injected into the outer frame later is found too.
    let body = outer.body();
    let added = outer.append_html(&body, r#"<iframe id="late" src="/late"></iframe>"#);
    let late = page.load_frame(&added[0], r#"<input name="utm_source">"#, ReadyState::Complete);
    page.event_loop.advance(Duration::from_millis(100));
    assert_eq!(sync.state_of(&added[0]), IframeState::Populated);
    assert_eq!(value(&late, "input").as_deref(), Some("google"));
}

#[test]
fn force_submit_forms_inside_frames_are_submitted() {
    let page = Page::new(r#"<body><iframe id="f" src="/embedded"></iframe></body>"#);
    let frame = page.load_frame(
        &page.iframe("#f"),
        r#"<form class="jotform-form" action="/jot"><input name="q3_email" value="a@b.c"><input name="utm_source"></form>"#,
        ReadyState::Complete,
    );
    let _tracker = page.start();

    let form = frame.select_first("form").unwrap().unwrap();
    assert!(!frame.dispatch_submit(&form));
    assert_eq!(
        page.sink.entries(),
        vec![
            json!({"email": "a@b.c"}),
            json!({"utm_source": "google"}),
            json!({"event_id": "1700000000000"}),
        ]
    );
    let submissions = frame.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].action.as_deref(), Some("/jot"));
}

#[test]
fn teardown_is_idempotent_and_stops_discovery() {
    let page = Page::new(r#"<body><iframe src="/slow"></iframe><div id="slot"></div></body>"#);
    let tracker = page.start();
    let sync = tracker.frame_sync().unwrap();
    assert!(page.event_loop.has_pending());

    tracker.shutdown();
    sync.teardown();
    assert!(sync.is_torn_down());
    assert!(!page.event_loop.has_pending());

    let slot = page.document.select_first("#slot").unwrap().unwrap();
    page.document
        .append_html(&slot, r#"<iframe src="/late"></iframe>"#);
    assert_eq!(page.event_loop.run_until_idle(), 0);
    assert_eq!(sync.tracked_count(), 1);
}

#[test]
fn reinitializing_does_not_pile_up_load_listeners() {
    let page = Page::new(r#"<body><iframe id="f" src="/slow"></iframe></body>"#);
    let mut tracker = page.start();
    let iframe = page.iframe("#f");
    assert_eq!(page.frames.load_listener_count(&iframe), 1);

    tracker.reinitialize().unwrap();
    tracker.reinitialize().unwrap();
    assert_eq!(page.frames.load_listener_count(&iframe), 1);

    tracker.shutdown();
    assert_eq!(page.frames.load_listener_count(&iframe), 0);
}
