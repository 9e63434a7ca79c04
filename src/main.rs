use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use lead_tracker::{
    DataLayer, Document, EventLoop, FrameRegistry, LeadTracker, PageContext, SqliteCookieJar,
    TrackerConfig, Window,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<body>
    <form id="lead" action="/lead">
        <input name="email" type="email" required>
        <div class="always-hidden">
            <input name="gclid" type="hidden">
            <input name="fbclid" type="hidden">
            <input name="utm_source" type="hidden">
            <input name="utm_medium" type="hidden">
            <input name="utm_campaign" type="hidden">
            <input name="http_referer" type="hidden">
        </div>
    </form>
</body>
</html>"#;

fn usage() -> ! {
    eprintln!("usage: lead-tracker <page-url> [referrer] [html-file]");
    std::process::exit(2);
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(raw_url) = args.next() else { usage() };
    let referrer = args.next().unwrap_or_default();
    let html_path = args.next().map(PathBuf::from);

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to build runtime")?;

    let url = Url::parse(&raw_url).with_context(|| format!("invalid page url '{raw_url}'"))?;
    let html = match &html_path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => DEFAULT_PAGE.to_string(),
    };

    let config_path = std::env::var("LEAD_TRACKER_CONFIG").ok().map(PathBuf::from);
    let config = TrackerConfig::load(config_path).unwrap_or_else(|err| {
        warn!("Failed to load tracker configuration: {err}. Using defaults.");
        TrackerConfig::default()
    });
    let cookies = Rc::new(SqliteCookieJar::open().context("failed to open cookie jar")?);

    let event_loop = EventLoop::new();
    let sink = Rc::new(DataLayer::new());
    let document = Document::parse(&html, url.clone(), referrer);
    let page = PageContext {
        document: document.clone(),
        window: Window::new(&url, event_loop.clone()),
        frames: Rc::new(FrameRegistry::new()),
    };

    let tracker = LeadTracker::initialize(config, page, cookies, sink.clone(), event_loop.clone())?;
    rt.block_on(drain(&event_loop));
    tracker.shutdown();

    info!("run complete");
    println!("{}", serde_json::to_string_pretty(tracker.record())?);
    println!("{}", document.to_html());
    for entry in sink.entries() {
        println!("{entry}");
    }
    Ok(())
}

/// Sleep through the loop's timers in real time until nothing is left.
async fn drain(event_loop: &EventLoop) {
    while let Some(deadline) = event_loop.next_deadline() {
        let wait = deadline.saturating_sub(event_loop.now());
        tokio::time::sleep(wait).await;
        event_loop.advance(wait);
    }
}
