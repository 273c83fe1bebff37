//! Popup document rendering: the mountable HTML for the popup context.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::path::resolve_relative;
use crate::{BundleError, MountedBundle};

static SCRIPT_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").expect("script tag regex")
});
static SRC_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bsrc\s*=\s*["']([^"']+)["']"#).expect("src attr regex"));
static REF_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(src|href)(\s*=\s*)(["'])([^"']*)(["'])"#).expect("ref attr regex")
});

/// Rendered popup, ready to be mounted by the popup context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PopupDocument {
    pub path: String,
    /// HTML with bundle references rewritten to resource-handle URLs.
    pub html: String,
    /// External scripts in document order, as normalized bundle paths.
    pub scripts: Vec<String>,
    /// Inline `<script>` bodies are not executed (extension pages forbid them).
    pub skipped_inline_scripts: usize,
    /// References to files the bundle does not contain.
    pub unresolved: Vec<String>,
}

/// Renders the popup declared by the mounted manifest, if any.
pub fn render_popup(bundle: &MountedBundle) -> Result<Option<PopupDocument>, BundleError> {
    let Some(path) = bundle.manifest().popup_path() else {
        return Ok(None);
    };
    let source = bundle
        .file(&path)
        .ok_or_else(|| BundleError::MissingFile(path.clone()))?;

    let mut scripts = Vec::new();
    let mut unresolved = Vec::new();
    let mut skipped_inline_scripts = 0usize;

    for caps in SCRIPT_TAG.captures_iter(&source.content) {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match SRC_ATTR.captures(attrs) {
            Some(src) => {
                let reference = &src[1];
                match resolve_relative(&path, reference) {
                    Some(resolved) if bundle.file(&resolved).is_some() => scripts.push(resolved),
                    Some(resolved) => unresolved.push(resolved),
                    None => debug!(target: "bundle-store", reference, "skipping external script"),
                }
            }
            None => {
                let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
                if !body.is_empty() {
                    skipped_inline_scripts += 1;
                }
            }
        }
    }

    let html = REF_ATTR
        .replace_all(&source.content, |caps: &Captures<'_>| {
            let reference = &caps[4];
            match resolve_relative(&path, reference)
                .and_then(|resolved| bundle.handle(&resolved))
            {
                Some(handle) => format!(
                    "{}{}{}{}{}",
                    &caps[1], &caps[2], &caps[3], handle.url, &caps[5]
                ),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    Ok(Some(PopupDocument {
        path,
        html,
        scripts,
        skipped_inline_scripts,
        unresolved,
    }))
}
