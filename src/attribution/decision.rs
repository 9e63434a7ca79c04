use crate::config::TrackerConfig;

use super::params::UrlParams;
use super::record::AttributionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No record was stored; write `record`.
    Create,
    /// Delete the stored record and write `record` in its place.
    Replace,
    /// The stored record already equals `record`; nothing to write.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub record: AttributionRecord,
}

/// Pure: never touches storage. The caller applies the returned action.
pub fn decide(
    params: &UrlParams,
    existing: Option<&AttributionRecord>,
    external_referrer: Option<&str>,
    config: &TrackerConfig,
) -> Decision {
    let Some(existing) = existing else {
        // First visit, with or without campaign parameters.
        return Decision {
            action: Action::Create,
            record: build_record(
                config,
                |param| params.get(param),
                external_referrer,
                None,
            ),
        };
    };

    let stored_referrer = existing.get(&config.referrer_key);
    let record = if params.is_empty() {
        // Internal navigation: keep the stored identifiers untouched.
        build_record(
            config,
            |param| existing.get(param),
            external_referrer,
            stored_referrer,
        )
    } else {
        // Whether or not the identifiers match, the record is rebuilt from
        // the URL; on a match this reproduces the stored identifiers.
        if !identifiers_match(params, existing, config) {
            tracing::debug!(target: "attribution", "campaign identifiers changed");
        }
        build_record(
            config,
            |param| params.get(param),
            external_referrer,
            stored_referrer,
        )
    };

    let action = if config.skip_unchanged_writes && &record == existing {
        Action::Keep
    } else {
        Action::Replace
    };

    Decision { action, record }
}

/// Every tracked identifier equal, with "absent" and "empty" kept distinct.
pub fn identifiers_match(
    params: &UrlParams,
    existing: &AttributionRecord,
    config: &TrackerConfig,
) -> bool {
    config
        .tracked_parameters
        .iter()
        .all(|param| params.get(param) == existing.get(param))
}

fn build_record<'a, F>(
    config: &TrackerConfig,
    lookup: F,
    external_referrer: Option<&str>,
    fallback_referrer: Option<&str>,
) -> AttributionRecord
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut record = AttributionRecord::new();
    for param in &config.tracked_parameters {
        if let Some(value) = lookup(param) {
            record.parameters.insert(param.clone(), value.to_string());
        }
    }

    let referrer = external_referrer
        .or(fallback_referrer.filter(|value| !value.is_empty()))
        .unwrap_or(config.empty_referrer_value.as_str());
    record
        .parameters
        .insert(config.referrer_key.clone(), referrer.to_string());
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOGLE: &str = "https://www.google.com/";

    fn config() -> TrackerConfig {
        TrackerConfig::default()
    }

    fn stored(pairs: &[(&str, &str)]) -> AttributionRecord {
        pairs
            .iter()
            .fold(AttributionRecord::new(), |record, (k, v)| record.with(*k, *v))
    }

    #[test]
    fn first_visit_without_params_captures_external_referrer() {
        let decision = decide(&UrlParams::default(), None, Some(GOOGLE), &config());
        assert_eq!(decision.action, Action::Create);
        assert_eq!(decision.record, stored(&[("http_referer", GOOGLE)]));
    }

    #[test]
    fn first_visit_without_referrer_stores_empty_marker() {
        let decision = decide(&UrlParams::default(), None, None, &config());
        assert_eq!(decision.action, Action::Create);
        assert_eq!(decision.record, stored(&[("http_referer", "empty")]));
    }

    #[test]
    fn first_visit_with_params_captures_them() {
        let params = UrlParams::from_pairs([("utm_source", "google"), ("utm_campaign", "fall")]);
        let decision = decide(&params, None, Some(GOOGLE), &config());
        assert_eq!(decision.action, Action::Create);
        assert_eq!(
            decision.record,
            stored(&[
                ("utm_source", "google"),
                ("utm_campaign", "fall"),
                ("http_referer", GOOGLE)
            ])
        );
    }

    #[test]
    fn matching_params_refresh_referrer_only_when_external() {
        let existing = stored(&[("utm_source", "google"), ("http_referer", GOOGLE)]);
        let params = UrlParams::from_pairs([("utm_source", "google")]);

        let internal = decide(&params, Some(&existing), None, &config());
        assert_eq!(internal.action, Action::Replace);
        assert_eq!(internal.record, existing);

        let external = decide(&params, Some(&existing), Some("https://bing.com/"), &config());
        assert_eq!(external.action, Action::Replace);
        assert_eq!(
            external.record.get("http_referer"),
            Some("https://bing.com/")
        );
        assert_eq!(external.record.get("utm_source"), Some("google"));
    }

    #[test]
    fn mismatch_replaces_and_reuses_old_referrer() {
        let existing = stored(&[("utm_source", "google"), ("http_referer", GOOGLE)]);
        let params = UrlParams::from_pairs([("utm_source", "bing")]);
        let decision = decide(&params, Some(&existing), None, &config());
        assert_eq!(decision.action, Action::Replace);
        assert_eq!(
            decision.record,
            stored(&[("utm_source", "bing"), ("http_referer", GOOGLE)])
        );
    }

    #[test]
    fn mismatch_drops_identifiers_missing_from_url() {
        let existing = stored(&[
            ("utm_source", "google"),
            ("utm_medium", "cpc"),
            ("http_referer", GOOGLE),
        ]);
        let params = UrlParams::from_pairs([("utm_source", "bing")]);
        let decision = decide(&params, Some(&existing), None, &config());
        assert_eq!(decision.record.get("utm_medium"), None);
    }

    #[test]
    fn empty_string_and_absent_do_not_match() {
        let existing = stored(&[("utm_source", "google"), ("http_referer", "empty")]);
        let params = UrlParams::from_pairs([("utm_source", "google"), ("utm_campaign", "")]);
        assert!(!identifiers_match(&params, &existing, &config()));
        let decision = decide(&params, Some(&existing), None, &config());
        assert_eq!(decision.record.get("utm_campaign"), Some(""));
    }

    #[test]
    fn no_params_keeps_stored_identifiers() {
        let existing = stored(&[
            ("gclid", "abc"),
            ("utm_source", "google"),
            ("http_referer", GOOGLE),
        ]);
        let decision = decide(&UrlParams::default(), Some(&existing), None, &config());
        assert_eq!(decision.action, Action::Replace);
        assert_eq!(decision.record, existing);

        let refreshed = decide(
            &UrlParams::default(),
            Some(&existing),
            Some("https://news.example/"),
            &config(),
        );
        assert_eq!(refreshed.record.get("gclid"), Some("abc"));
        assert_eq!(
            refreshed.record.get("http_referer"),
            Some("https://news.example/")
        );
    }

    #[test]
    fn external_referrer_is_never_erased_without_new_external() {
        let existing = stored(&[("utm_source", "google"), ("http_referer", GOOGLE)]);
        let cases = [
            UrlParams::default(),
            UrlParams::from_pairs([("utm_source", "google")]),
            UrlParams::from_pairs([("utm_source", "bing")]),
            UrlParams::from_pairs([("gclid", "")]),
        ];
        for params in &cases {
            let decision = decide(params, Some(&existing), None, &config());
            assert_eq!(decision.record.get("http_referer"), Some(GOOGLE));
        }
    }

    #[test]
    fn decide_then_apply_twice_is_idempotent() {
        let params = UrlParams::from_pairs([("utm_source", "google"), ("utm_campaign", "fall")]);
        let first = decide(&params, None, Some(GOOGLE), &config());
        let second = decide(&params, Some(&first.record), None, &config());
        assert_eq!(second.record, first.record);
        let third = decide(&params, Some(&second.record), Some(GOOGLE), &config());
        assert_eq!(third.record, first.record);
    }

    #[test]
    fn unchanged_refresh_can_be_skipped() {
        let config = TrackerConfig {
            skip_unchanged_writes: true,
            ..TrackerConfig::default()
        };
        let existing = stored(&[("utm_source", "google"), ("http_referer", GOOGLE)]);
        let params = UrlParams::from_pairs([("utm_source", "google")]);
        assert_eq!(
            decide(&params, Some(&existing), None, &config).action,
            Action::Keep
        );
        assert_eq!(
            decide(&params, Some(&existing), Some("https://bing.com/"), &config).action,
            Action::Replace
        );
    }
}
