//! HTTP Classifier (spec.md §4.E).
//!
//! Runs once a flow's DPI driver reports an HTTP request: normalizes the
//! URL, checks it against `url_domains`, and decides whether the flow
//! should be redirected, RST'd, or left alone. Mirrors the two matching
//! shapes `worker.cpp` supports against one Aho–Corasick table: whole
//! domain entries and full-URL entries, each independently exact or
//! substring.

use crate::config::{AddParamType, Configuration, EntryType};
use crate::dpi::HttpRequestInfo;
use crate::stats::ThreadStats;

/// What the worker should do to the flow after classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpVerdict {
    /// No match; keep forwarding the flow untouched.
    Pass,
    /// Matched; redirect the client to the configured landing page.
    Redirect,
    /// Matched, but redirects are disabled (or the request has no URL to
    /// redirect with) — send a RST instead.
    Reset,
}

/// `url::Url`-based normalization of the raw request URL, gated by
/// `url_normalization` — mirrors `worker.cpp`'s optional call into its own
/// normalizer before matching rather than always normalizing. On parse
/// failure, falls back to the raw URL and logs at debug (spec.md §4.E
/// step 1 / §7 "parser soft error").
fn normalize_url(raw: &str, normalize: bool) -> String {
    if !normalize {
        return raw.to_string();
    }
    match url::Url::parse(raw) {
        Ok(parsed) => parsed.as_str().to_string(),
        Err(err) => {
            tracing::debug!(%err, url = raw, "URI normalization failed, using raw URL");
            raw.to_string()
        }
    }
}

/// Lowercase the host portion and strip a trailing dot before the first
/// `/`, in place — `worker.cpp`'s index-based host massage (it operates
/// on byte offsets into the raw `"http://host/path"` string rather than
/// re-parsing it): index 7 is just past `http://`; the host search for a
/// path separator starts at index 10 (the shortest possible host is one
/// character, so nothing before index 10 can be the first `/` after the
/// scheme). Host lowering only applies when normalization did *not*
/// already run — `worker.cpp` treats normalization and `lower_host` as
/// alternatives, not a pipeline.
fn massage_host(uri: &mut String, url_normalization: bool, lower_host: bool, remove_dot: bool) {
    if uri.len() <= 10 {
        return;
    }
    let Some(slash_pos) = uri[10..].find('/').map(|i| i + 10) else {
        return;
    };
    if !url_normalization && lower_host {
        let lowered = uri[7..slash_pos].to_ascii_lowercase();
        uri.replace_range(7..slash_pos, &lowered);
    }
    if remove_dot && uri.as_bytes()[slash_pos - 1] == b'.' {
        uri.remove(slash_pos - 1);
    }
}

/// Build the redirect target's extra query data per `add_p_type`:
/// `ID → "id=<lineno>"`, `URL → "url=<full url>"`, `NONE → ""`.
fn build_add_param(kind: AddParamType, lineno: u32, full_url: &str) -> String {
    match kind {
        AddParamType::None => String::new(),
        AddParamType::Id => format!("id={lineno}"),
        AddParamType::Url => format!("url={full_url}"),
    }
}

/// Classify one HTTP request against the shared configuration, bumping
/// `stats` along the way. `req` must have a non-`None` `url` — callers
/// should not invoke this otherwise.
///
/// Returns `(verdict, flow_block, extra_param)`. Per spec.md §9 open
/// question 2, a plain domain-entry match does *not* set `flow.block`
/// (only a full-URL-entry match does) — preserved verbatim from the
/// source rather than unified, since the asymmetry may be load-bearing
/// for some other caller this module's spec does not describe.
pub fn classify(config: &Configuration, stats: &mut ThreadStats, req: &HttpRequestInfo) -> (HttpVerdict, bool, String) {
    let Some(raw_url) = req.url.as_deref() else {
        return (HttpVerdict::Pass, false, String::new());
    };
    if raw_url.len() <= 7 {
        return (HttpVerdict::Pass, false, String::new());
    }

    let url_normalization = config.flags.url_normalization();
    let mut uri = normalize_url(raw_url, url_normalization);
    massage_host(&mut uri, url_normalization, config.flags.lower_host(), config.flags.remove_dot());

    if uri.len() <= 7 {
        return (HttpVerdict::Pass, false, String::new());
    }

    let Ok(guard) = config.url_domains.try_lock() else {
        return (HttpVerdict::Pass, false, String::new());
    };
    let Some(matcher) = guard.as_ref() else {
        return (HttpVerdict::Pass, false, String::new());
    };

    // Search only `uri[7..]` — "skip http://" per worker.cpp.
    let search = &uri[7..];
    let match_url_exactly = config.flags.match_url_exactly();
    let mut hit: Option<(EntryType, u32)> = None;

    for m in matcher.matcher.find_iter(search) {
        let meta = match matcher.meta.get(&(m.pattern().as_u32())) {
            Some(meta) => meta,
            None => continue,
        };
        let full_len = m.end() - m.start() == search.len();
        let accept = if full_len {
            true
        } else {
            let r = m.start();
            match meta.entry_type {
                // Per-pattern exact-match flag rejects any non-full hit
                // outright; otherwise a partial hit only survives if it's
                // anchored right after a `.` (or at the very start of the
                // searched string, where there's no preceding char to check).
                EntryType::Domain => {
                    !(meta.exact_match || (r > 0 && search.as_bytes()[r - 1] != b'.'))
                }
                // The URL branch uses the *global* `match_url_exactly` flag,
                // not the per-pattern one — worker.cpp never consults
                // `it->second.match_exactly` in this branch.
                EntryType::Url => {
                    !(match_url_exactly || (r > 0 && search.as_bytes()[r - 1] != b'.'))
                }
            }
        };
        if accept {
            hit = Some((meta.entry_type, meta.lineno));
            break;
        }
    }
    drop(guard);

    let Some((entry_type, lineno)) = hit else {
        return (HttpVerdict::Pass, false, String::new());
    };

    let flow_block = match entry_type {
        EntryType::Domain => {
            stats.matched_domains += 1;
            false
        }
        EntryType::Url => {
            stats.matched_urls += 1;
            true
        }
    };

    if !config.flags.http_redirect() {
        return (HttpVerdict::Reset, flow_block, String::new());
    }

    match entry_type {
        EntryType::Domain => stats.redirected_domains += 1,
        EntryType::Url => stats.redirected_urls += 1,
    }

    let extra_param = build_add_param(config.flags.add_p_type(), lineno, &uri);
    (HttpVerdict::Redirect, flow_block, extra_param)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntryType, UrlDomainMatcher, UrlPatternMeta};

    fn config_with_entries(entries: Vec<(&str, UrlPatternMeta)>) -> Configuration {
        let config = Configuration::new();
        let owned: Vec<(String, UrlPatternMeta)> =
            entries.into_iter().map(|(p, m)| (p.to_string(), m)).collect();
        *config.url_domains.lock().unwrap() = Some(UrlDomainMatcher::new(&owned).unwrap());
        config.flags.set_http_redirect(true);
        config
    }

    #[test]
    fn domain_match_redirects_but_does_not_block() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: false, lineno: 1 },
        )]);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://bad.example/path".to_string()) };
        let (verdict, block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Redirect);
        assert!(!block);
        assert_eq!(stats.matched_domains, 1);
        assert_eq!(stats.redirected_domains, 1);
    }

    #[test]
    fn url_match_redirects_and_blocks() {
        // URL entries are matched against `uri[7..]` ("skip http://"), so
        // the pattern itself carries no scheme.
        let config = config_with_entries(vec![(
            "bad.example/specific",
            UrlPatternMeta { entry_type: EntryType::Url, exact_match: false, lineno: 2 },
        )]);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://bad.example/specific".to_string()) };
        let (verdict, block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Redirect);
        assert!(block);
        assert_eq!(stats.matched_urls, 1);
    }

    #[test]
    fn no_redirect_flag_sends_reset_instead() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: false, lineno: 1 },
        )]);
        config.flags.set_http_redirect(false);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://bad.example/path".to_string()) };
        let (verdict, _, _) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Reset);
        // `sended_rst` is only incremented once the worker's `emit_rst`
        // actually emits the order, not here — classify() only decides the
        // verdict.
        assert_eq!(stats.sended_rst, 0);
    }

    #[test]
    fn no_match_passes_through() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: false, lineno: 1 },
        )]);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://good.example/path".to_string()) };
        let (verdict, block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Pass);
        assert!(!block);
    }

    #[test]
    fn add_param_id_carries_matched_lineno() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: false, lineno: 42 },
        )]);
        config.flags.set_add_p_type(crate::config::AddParamType::Id);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://bad.example/path".to_string()) };
        let (_, _, extra) = classify(&config, &mut stats, &req);
        assert_eq!(extra, "id=42");
    }

    #[test]
    fn domain_partial_hit_without_dot_boundary_is_rejected() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: false, lineno: 1 },
        )]);
        let mut stats = ThreadStats::new();
        // "bad.example" occurs inside "xbad.example" with no '.' right before it.
        let req = HttpRequestInfo { method: None, url: Some("http://xbad.example/path".to_string()) };
        let (verdict, _block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Pass);
        assert_eq!(stats.matched_domains, 0);
    }

    #[test]
    fn domain_partial_hit_with_dot_boundary_is_accepted() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: false, lineno: 1 },
        )]);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://x.bad.example/path".to_string()) };
        let (verdict, _block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Redirect);
        assert_eq!(stats.matched_domains, 1);
    }

    #[test]
    fn domain_exact_match_rejects_subdomain_hit() {
        let config = config_with_entries(vec![(
            "bad.example",
            UrlPatternMeta { entry_type: EntryType::Domain, exact_match: true, lineno: 1 },
        )]);
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: Some("http://x.bad.example/path".to_string()) };
        let (verdict, _block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Pass);
        assert_eq!(stats.matched_domains, 0);
    }

    #[test]
    fn match_url_exactly_flag_rejects_partial_url_hit_even_when_pattern_is_not_exact() {
        let config = config_with_entries(vec![(
            "bad.example/specific",
            UrlPatternMeta { entry_type: EntryType::Url, exact_match: false, lineno: 2 },
        )]);
        config.flags.set_match_url_exactly(true);
        let mut stats = ThreadStats::new();
        let req =
            HttpRequestInfo { method: None, url: Some("http://bad.example/specific/more".to_string()) };
        let (verdict, _block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Pass);
        assert_eq!(stats.matched_urls, 0);
    }

    #[test]
    fn missing_url_passes_through() {
        let config = Configuration::new();
        let mut stats = ThreadStats::new();
        let req = HttpRequestInfo { method: None, url: None };
        let (verdict, block, _extra) = classify(&config, &mut stats, &req);
        assert_eq!(verdict, HttpVerdict::Pass);
        assert!(!block);
    }
}
