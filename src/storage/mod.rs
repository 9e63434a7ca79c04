//! Persistence for the attribution record.
//!
//! `CookieStore` is the key-value boundary (a per-document cookie jar in a
//! browser); `AttributionStore` layers the record codec and the
//! create/replace discipline on top of it.

pub mod memory;
pub mod sqlite;

use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::attribution::AttributionRecord;
use crate::config::TrackerConfig;

pub use memory::MemoryCookieJar;
pub use sqlite::SqliteCookieJar;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cookie store is unavailable")]
    Unavailable,
    #[error("cookie store backend error: {0}")]
    Backend(String),
    #[error("failed to encode record: {0}")]
    Encode(#[from] crate::attribution::RecordError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CookieOptions {
    /// `None` makes a session cookie.
    pub max_age: Option<Duration>,
}

impl CookieOptions {
    pub fn session() -> Self {
        Self { max_age: None }
    }

    pub fn days(days: u32) -> Self {
        Self {
            max_age: Some(Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
        }
    }
}

pub trait CookieStore {
    fn get(&self, name: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, name: &str, value: &str, options: &CookieOptions) -> Result<(), StoreError>;
    fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// Reads and writes the single named attribution record.
#[derive(Clone)]
pub struct AttributionStore {
    cookies: Rc<dyn CookieStore>,
    name: String,
    options: CookieOptions,
}

impl AttributionStore {
    pub fn new(cookies: Rc<dyn CookieStore>, config: &TrackerConfig) -> Self {
        let options = config
            .cookie_expiry_days
            .map(CookieOptions::days)
            .unwrap_or_else(CookieOptions::session);
        Self {
            cookies,
            name: config.cookie_name.clone(),
            options,
        }
    }

    /// Load the stored record. A value that does not parse is treated as if
    /// no record existed; only a failing backend is reported.
    pub fn load(&self) -> Result<Option<AttributionRecord>, StoreError> {
        let Some(raw) = self.cookies.get(&self.name)? else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        match AttributionRecord::parse(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(target: "storage", cookie = %self.name, error = %err, "ignoring malformed attribution cookie");
                Ok(None)
            }
        }
    }

    pub fn create(&self, record: &AttributionRecord) -> Result<(), StoreError> {
        let value = record.serialize()?;
        self.cookies.set(&self.name, &value, &self.options)?;
        debug!(target: "storage", cookie = %self.name, "attribution record written");
        Ok(())
    }

    /// Remove the old record, then write the new one. If the write fails the
    /// previous value is put back.
    pub fn replace(&self, record: &AttributionRecord) -> Result<(), StoreError> {
        let value = record.serialize()?;
        let previous = self.cookies.get(&self.name)?;
        self.cookies.remove(&self.name)?;
        if let Err(err) = self.cookies.set(&self.name, &value, &self.options) {
            if let Some(previous) = previous {
                if let Err(restore) = self.cookies.set(&self.name, &previous, &self.options) {
                    warn!(target: "storage", cookie = %self.name, error = %restore, "failed to restore previous attribution record");
                }
            }
            return Err(err);
        }
        debug!(target: "storage", cookie = %self.name, "attribution record replaced");
        Ok(())
    }
}
