//! The popup context: the rendered popup document and the scripts it loads.

use std::sync::Arc;

use bundle_store::{render_popup, MountedBundle, PopupDocument};
use capability_shim::{CapabilityShim, ContextRuntime, PreviewSession, ScriptEngine, ScriptError};
use preview_core_types::{ContextKind, LogLevel, PreviewEvent};
use rpc_broker::{BrokerConfig, ChannelEnd};
use tracing::{debug, warn};

use crate::errors::PreviewError;

pub struct PopupContext {
    runtime: ContextRuntime,
    bundle: MountedBundle,
    document: Arc<PopupDocument>,
}

impl PopupContext {
    /// Renders the popup `bundle` declares and builds its context on `end`.
    /// Returns `Ok(None)` when the bundle has no popup.
    pub fn start(
        end: ChannelEnd,
        session: &PreviewSession,
        bundle: MountedBundle,
        config: BrokerConfig,
    ) -> Result<Option<Self>, PreviewError> {
        let Some(document) = render_popup(&bundle)? else {
            debug!(generation = %bundle.generation(), "no popup declared");
            return Ok(None);
        };
        if document.skipped_inline_scripts > 0 {
            session.publish(PreviewEvent::Log {
                context: ContextKind::Popup,
                level: LogLevel::Warn,
                message: format!(
                    "{} inline script(s) in {} were not run; extension pages only load script files",
                    document.skipped_inline_scripts, document.path
                ),
            });
        }
        for missing in &document.unresolved {
            warn!(path = %missing, "popup references a file the bundle does not contain");
        }
        let runtime = ContextRuntime::start(
            ContextKind::Popup,
            end,
            session,
            bundle.clone(),
            config,
            None,
        );
        Ok(Some(Self {
            runtime,
            bundle,
            document: Arc::new(document),
        }))
    }

    /// Runs the document's scripts in order. A failing script does not stop the ones after it.
    pub async fn run_scripts(&self, engine: &dyn ScriptEngine) -> Vec<ScriptError> {
        let mut failures = Vec::new();
        for path in &self.document.scripts {
            let Some(file) = self.bundle.file(path) else {
                continue;
            };
            if let Err(err) = self
                .runtime
                .run_script(engine, file, Some(self.document.clone()))
                .await
            {
                failures.push(err);
            }
            if self.runtime.is_stopped() {
                break;
            }
        }
        failures
    }

    pub fn document(&self) -> &Arc<PopupDocument> {
        &self.document
    }

    pub fn shim(&self) -> &CapabilityShim {
        self.runtime.shim()
    }

    pub fn runtime(&self) -> &ContextRuntime {
        &self.runtime
    }

    pub fn teardown(&self) {
        self.runtime.teardown();
    }
}
