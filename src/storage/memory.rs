use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::SystemTime;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::warn;

use super::{CookieOptions, CookieStore, StoreError};

/// Characters that cannot appear raw in a cookie value.
const COOKIE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\')
    .add(b'%')
    .add(b'=');

#[derive(Debug, Clone)]
struct CookieEntry {
    encoded: String,
    options: CookieOptions,
    expires_at: Option<SystemTime>,
}

impl CookieEntry {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// A per-document cookie jar with `document.cookie` semantics: values are
/// percent-encoded on write and decoded on read, and expired cookies vanish.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    entries: RefCell<BTreeMap<String, CookieEntry>>,
    unavailable: Cell<bool>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// A jar whose every operation fails, as when cookie access is blocked.
    pub fn unavailable() -> Self {
        let jar = Self::default();
        jar.unavailable.set(true);
        jar
    }

    /// Seed the jar from a `Cookie`/`document.cookie` string such as
    /// `Lead=%7B%7D; theme=dark`. Values are kept in their encoded form.
    pub fn from_cookie_header(header: &str) -> Self {
        let jar = Self::default();
        {
            let mut entries = jar.entries.borrow_mut();
            for pair in header.split(';') {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                entries.insert(
                    name.to_string(),
                    CookieEntry {
                        encoded: value.trim().to_string(),
                        options: CookieOptions::session(),
                        expires_at: None,
                    },
                );
            }
        }
        jar
    }

    /// Render the live cookies the way `document.cookie` would.
    pub fn cookie_header(&self) -> String {
        let now = SystemTime::now();
        self.entries
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(name, entry)| format!("{name}={}", entry.encoded))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn options_for(&self, name: &str) -> Option<CookieOptions> {
        self.entries.borrow().get(name).map(|entry| entry.options)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.get() {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl CookieStore for MemoryCookieJar {
    fn get(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(name).filter(|e| e.is_live(SystemTime::now())) else {
            return Ok(None);
        };
        // An undecodable value reads as no cookie at all.
        match percent_decode_str(&entry.encoded).decode_utf8() {
            Ok(decoded) => Ok(Some(decoded.into_owned())),
            Err(err) => {
                warn!(target: "storage", cookie = name, error = %err, "ignoring undecodable cookie value");
                Ok(None)
            }
        }
    }

    fn set(&self, name: &str, value: &str, options: &CookieOptions) -> Result<(), StoreError> {
        self.ensure_available()?;
        let expires_at = options.max_age.map(|age| SystemTime::now() + age);
        self.entries.borrow_mut().insert(
            name.to_string(),
            CookieEntry {
                encoded: utf8_percent_encode(value, COOKIE_VALUE).to_string(),
                options: *options,
                expires_at,
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.entries.borrow_mut().remove(name);
        Ok(())
    }
}
