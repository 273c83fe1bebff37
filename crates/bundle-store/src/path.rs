//! Logical path normalization for bundle files.

/// Normalizes a bundle-relative path.
///
/// Backslashes become `/`, leading `./` and `/` disappear, `.` and empty segments are
/// dropped and `..` pops a segment without ever escaping the bundle root.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Resolves `reference` relative to the directory holding `base`.
///
/// Returns `None` for references that point outside the bundle (absolute URLs, protocol
/// relative URLs, data/blob/javascript URIs, fragments).
pub fn resolve_relative(base: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') || reference.starts_with("//") {
        return None;
    }
    if has_scheme(reference) {
        return None;
    }
    let without_query = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    if without_query.starts_with('/') {
        return Some(normalize_path(without_query));
    }
    let dir = match normalize_path(base).rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    };
    if dir.is_empty() {
        Some(normalize_path(without_query))
    } else {
        Some(normalize_path(&format!("{dir}/{without_query}")))
    }
}

fn has_scheme(reference: &str) -> bool {
    match reference.find(':') {
        Some(idx) => {
            let scheme = &reference[..idx];
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_markers() {
        assert_eq!(normalize_path("./popup.html"), "popup.html");
        assert_eq!(normalize_path("/popup.html"), "popup.html");
        assert_eq!(normalize_path(".//./js//app.js"), "js/app.js");
        assert_eq!(normalize_path("js\\content.js"), "js/content.js");
    }

    #[test]
    fn parent_segments_never_escape_root() {
        assert_eq!(normalize_path("a/b/../c.js"), "a/c.js");
        assert_eq!(normalize_path("../../c.js"), "c.js");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn resolves_relative_to_document_dir() {
        assert_eq!(
            resolve_relative("ui/popup.html", "popup.js"),
            Some("ui/popup.js".into())
        );
        assert_eq!(
            resolve_relative("ui/popup.html", "../shared/util.js?v=2"),
            Some("shared/util.js".into())
        );
        assert_eq!(
            resolve_relative("ui/popup.html", "/root.js"),
            Some("root.js".into())
        );
        assert_eq!(resolve_relative("popup.html", "https://cdn.test/x.js"), None);
        assert_eq!(resolve_relative("popup.html", "//cdn.test/x.js"), None);
        assert_eq!(resolve_relative("popup.html", "data:text/plain,hi"), None);
    }
}
