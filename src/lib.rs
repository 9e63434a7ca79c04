// Library exports for the binary and integration tests

pub mod attribution;
pub mod config;
pub mod dom;
pub mod storage;
pub mod tracker;
pub mod tracking;

// Re-export commonly used types for tests
pub use attribution::{decide, Action, AttributionRecord, Decision, UrlParams};
pub use config::{ConfigError, FrameSyncSettings, TrackerConfig};
pub use dom::{Document, EventLoop, FrameRegistry, ReadyState, Window};
pub use storage::{AttributionStore, CookieStore, MemoryCookieJar, SqliteCookieJar, StoreError};
pub use tracker::{LeadTracker, PageContext, TrackerError};
pub use tracking::{DataLayer, EventSink, FrameAgent, FrameSync, IframeState, TrackingEvent};
