pub mod decision;
pub mod params;
pub mod record;
pub mod referrer;

pub use decision::{decide, Action, Decision};
pub use params::UrlParams;
pub use record::{AttributionRecord, RecordError};
pub use referrer::{classify_referrer, external_referrer, ReferrerKind};
