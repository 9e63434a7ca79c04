//! The slice of a browser page the tracker talks to: parsed documents,
//! iframe contents, window messaging and a deterministic timer loop.

pub mod document;
pub mod forms;
pub mod frames;
pub mod timers;
pub mod window;

use thiserror::Error;

pub use document::{Document, NativeSubmission, ReadyState, SubmitEvent, SubmitListener, Subscription};
pub use frames::{FrameHost, FrameRegistry, LoadListener, LoadListenerId, Reachability};
pub use timers::{EventLoop, TimerId};
pub use window::{DeliveryError, ListenerId, MessageEvent, MessageListener, MessagePort, Window};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("node is not an element")]
    NotAnElement,
}
