use std::time::Duration;

use url::Url;

use crate::error::{AdapterError, AdapterErrorKind};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A running Chromium reached through its DevTools browser websocket.
#[derive(Clone, Debug)]
pub struct CdpConfig {
    websocket_url: Url,
    command_timeout: Duration,
}

impl CdpConfig {
    /// Accepts only `ws://` or `wss://` endpoints.
    pub fn attach(websocket_url: impl AsRef<str>) -> Result<Self, AdapterError> {
        let raw = websocket_url.as_ref();
        let parsed = Url::parse(raw).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("invalid websocket url {raw}: {err}"))
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("expected a ws:// or wss:// url, got {raw}")));
        }
        Ok(Self {
            websocket_url: parsed,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn websocket_url(&self) -> &str {
        self.websocket_url.as_str()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_accepts_devtools_websockets_only() {
        let cfg = CdpConfig::attach("ws://127.0.0.1:9222/devtools/browser/abc").unwrap();
        assert_eq!(cfg.websocket_url(), "ws://127.0.0.1:9222/devtools/browser/abc");
        assert_eq!(cfg.command_timeout(), Duration::from_secs(30));
        assert!(CdpConfig::attach("wss://remote.example/devtools/browser/1").is_ok());

        let err = CdpConfig::attach("http://127.0.0.1:9222").unwrap_err();
        assert!(err.hint.unwrap().contains("ws://"));
        assert!(CdpConfig::attach("not a url").is_err());
    }

    #[test]
    fn command_timeout_is_adjustable() {
        let cfg = CdpConfig::attach("ws://localhost:1/devtools/browser/x")
            .unwrap()
            .with_command_timeout(Duration::from_millis(250));
        assert_eq!(cfg.command_timeout(), Duration::from_millis(250));
    }
}
