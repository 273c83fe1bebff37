//! Pages every browser refuses to script, whatever the injection method.

use bundle_store::any_pattern_matches;
use url::Url;

const RESTRICTED_SCHEMES: &[&str] = &[
    "about",
    "chrome",
    "chrome-extension",
    "chrome-search",
    "chrome-untrusted",
    "devtools",
    "edge",
    "moz-extension",
    "view-source",
];

/// `(host, path prefix)` of extension galleries.
const GALLERIES: &[(&str, &str)] = &[
    ("chromewebstore.google.com", "/"),
    ("chrome.google.com", "/webstore"),
    ("microsoftedge.microsoft.com", "/addons"),
    ("addons.mozilla.org", "/"),
];

pub fn is_known_restricted(url: &str, extra_patterns: &[String]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if RESTRICTED_SCHEMES.contains(&parsed.scheme()) {
        return true;
    }
    let host = parsed.host_str().unwrap_or_default();
    if GALLERIES
        .iter()
        .any(|(gallery, prefix)| host == *gallery && parsed.path().starts_with(prefix))
    {
        return true;
    }
    any_pattern_matches(extra_patterns, url)
}
