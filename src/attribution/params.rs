use std::collections::BTreeMap;

use url::Url;

/// Tracked identifiers observed on the current location's query string.
///
/// Only identifiers in the TrackedSet are kept. A parameter that appears
/// without a value (`?utm_campaign` or `?utm_campaign=`) is present with an
/// empty string, which is distinct from a parameter that never appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParams {
    values: BTreeMap<String, String>,
}

impl UrlParams {
    pub fn extract(url: &Url, tracked: &[String]) -> Self {
        let mut values = BTreeMap::new();
        // Later duplicates win, matching how a query string collapses into an object.
        for (key, value) in url.query_pairs() {
            if tracked.iter().any(|param| param.as_str() == key) {
                values.insert(key.into_owned(), value.into_owned());
            }
        }
        Self { values }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.values.get(identifier).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}
