use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferrerKind {
    /// No referrer, or the stored empty marker.
    Missing,
    Internal,
    External,
}

/// Decide whether `referrer` points away from the page at `current`.
///
/// Sites are compared by host name. A referrer that cannot be parsed is
/// treated as external so that an unusual source is never silently dropped.
pub fn classify_referrer(referrer: &str, current: &Url, empty_marker: &str) -> ReferrerKind {
    let referrer = referrer.trim();
    if referrer.is_empty() || referrer == empty_marker {
        return ReferrerKind::Missing;
    }

    match Url::parse(referrer) {
        Ok(parsed) if parsed.host_str() == current.host_str() => ReferrerKind::Internal,
        _ => ReferrerKind::External,
    }
}

/// The referrer string worth recording, if any.
pub fn external_referrer<'a>(referrer: &'a str, current: &Url, empty_marker: &str) -> Option<&'a str> {
    match classify_referrer(referrer, current, empty_marker) {
        ReferrerKind::External => Some(referrer.trim()),
        _ => None,
    }
}
