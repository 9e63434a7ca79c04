//! Everything that acts on pages: field population, submission tracking,
//! frame synchronization and the cross-frame message protocol.

pub mod agent;
pub mod frame_sync;
pub mod interceptor;
pub mod messages;
pub mod populate;
pub mod protocol;
pub mod sink;

pub use agent::FrameAgent;
pub use frame_sync::{FrameSync, IframeState};
pub use interceptor::{SubmissionInterceptor, SubmitMode};
pub use messages::{ActiveSync, HostMessageHandler};
pub use populate::populate_fields;
pub use protocol::FrameMessage;
pub use sink::{DataLayer, EventSink, SubmissionOrigin, TrackingEvent};
