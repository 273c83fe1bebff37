//! Shared primitives for the extension preview runtime bridge.
//!
//! Every crate in the workspace speaks in these identifiers, context/world/strategy enums and
//! error codes so that frames crossing a context boundary carry the same vocabulary on both
//! sides.

pub mod error;
pub mod events;
pub mod host;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{ErrorCode, HostError};
pub use events::{event_sink, EventSink, LogLevel, PreviewEvent};
pub use host::{HostPlatform, InjectionRequest, PageMessage, PageMessageKind};

/// One mounted bundle generation. Never reused across mounts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GenerationId(pub Uuid);

impl GenerationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of a simulated execution context instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlation id pairing a request (or delivery) with its response frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-assigned identifier of a live page (a CDP target id for the Chromium host).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A foreign page the bridge can inject into.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PageTarget {
    pub id: TargetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PageTarget {
    pub fn new(id: impl Into<String>, url: Option<String>) -> Self {
        Self {
            id: TargetId(id.into()),
            url,
            title: None,
        }
    }

    pub fn url_or_blank(&self) -> &str {
        self.url.as_deref().unwrap_or("about:blank")
    }
}

/// Simulated execution contexts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Popup,
    Background,
    Page,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Popup => "popup",
            ContextKind::Background => "background",
            ContextKind::Page => "page",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isolation tier a foreign page offers for injected code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionWorld {
    Main,
    Isolated,
}

impl ExecutionWorld {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionWorld::Main => "main",
            ExecutionWorld::Isolated => "isolated",
        }
    }

    /// Accepts both the lowercase wire form and the `MAIN`/`ISOLATED` form used by
    /// `scripting.executeScript`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "main" => Some(ExecutionWorld::Main),
            "isolated" => Some(ExecutionWorld::Isolated),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ways of getting code to run inside a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionStrategy {
    FunctionEval,
    ScriptElement,
    BlobScript,
}

impl InjectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionStrategy::FunctionEval => "function-eval",
            InjectionStrategy::ScriptElement => "script-element",
            InjectionStrategy::BlobScript => "blob-script",
        }
    }
}

impl fmt::Display for InjectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_use_wire_spelling() {
        assert_eq!(
            serde_json::to_value(InjectionStrategy::ScriptElement).unwrap(),
            serde_json::json!("script-element")
        );
        assert_eq!(
            serde_json::to_value(ExecutionWorld::Isolated).unwrap(),
            serde_json::json!("isolated")
        );
        assert_eq!(
            serde_json::to_value(ContextKind::Background).unwrap(),
            serde_json::json!("background")
        );
    }

    #[test]
    fn world_parse_accepts_upper_case() {
        assert_eq!(ExecutionWorld::parse("MAIN"), Some(ExecutionWorld::Main));
        assert_eq!(
            ExecutionWorld::parse("isolated"),
            Some(ExecutionWorld::Isolated)
        );
        assert_eq!(ExecutionWorld::parse("user"), None);
    }
}
