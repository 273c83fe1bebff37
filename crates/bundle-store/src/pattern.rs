//! Content-script match patterns (`<all_urls>`, `*://*/*`, `https://*.example.com/app*`).

use url::Url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchPattern {
    raw: String,
    kind: PatternKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PatternKind {
    AllUrls,
    Parts {
        scheme: String,
        host: HostPattern,
        path: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum HostPattern {
    Any,
    Subdomains(String),
    Exact(String),
}

const WILDCARD_SCHEMES: &[&str] = &["http", "https"];
const ALL_URLS_SCHEMES: &[&str] = &["http", "https", "file", "ftp", "ws", "wss"];

impl MatchPattern {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed == "<all_urls>" {
            return Some(Self {
                raw: trimmed.to_string(),
                kind: PatternKind::AllUrls,
            });
        }
        let (scheme, rest) = trimmed.split_once("://")?;
        if scheme != "*" && !ALL_URLS_SCHEMES.contains(&scheme) {
            return None;
        }
        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => return None,
        };
        let host = if scheme == "file" {
            HostPattern::Any
        } else if host == "*" {
            HostPattern::Any
        } else if let Some(suffix) = host.strip_prefix("*.") {
            HostPattern::Subdomains(suffix.to_ascii_lowercase())
        } else if host.is_empty() || host.contains('*') {
            return None;
        } else {
            HostPattern::Exact(host.to_ascii_lowercase())
        };
        Some(Self {
            raw: trimmed.to_string(),
            kind: PatternKind::Parts {
                scheme: scheme.to_string(),
                host,
                path: path.to_string(),
            },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match &self.kind {
            PatternKind::AllUrls => ALL_URLS_SCHEMES.contains(&parsed.scheme()),
            PatternKind::Parts { scheme, host, path } => {
                let scheme_ok = if scheme == "*" {
                    WILDCARD_SCHEMES.contains(&parsed.scheme())
                } else {
                    scheme == parsed.scheme()
                };
                if !scheme_ok {
                    return false;
                }
                let page_host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
                let host_ok = match host {
                    HostPattern::Any => true,
                    HostPattern::Exact(expected) => &page_host == expected,
                    HostPattern::Subdomains(suffix) => {
                        &page_host == suffix || page_host.ends_with(&format!(".{suffix}"))
                    }
                };
                if !host_ok {
                    return false;
                }
                let mut page_path = parsed.path().to_string();
                if let Some(query) = parsed.query() {
                    page_path.push('?');
                    page_path.push_str(query);
                }
                glob_match(path, &page_path)
            }
        }
    }
}

/// True when any of `patterns` matches `url`. Unparseable patterns never match.
pub fn any_pattern_matches(patterns: &[String], url: &str) -> bool {
    patterns
        .iter()
        .filter_map(|raw| MatchPattern::parse(raw))
        .any(|pattern| pattern.matches(url))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while t < text.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(star_idx) = star {
            p = star_idx + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
