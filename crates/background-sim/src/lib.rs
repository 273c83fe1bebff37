//! Background simulation context.
//!
//! When a bundle declares a background script the preview runs it once in its own context,
//! on its own broker channel, then fires `runtime.onInstalled` before any message is let
//! through. Deliveries that arrive earlier wait on the installed gate.

use std::sync::atomic::{AtomicBool, Ordering};

use bundle_store::MountedBundle;
use capability_shim::{
    CapabilityShim, ContextRuntime, EventKind, PreviewSession, ScriptEngine, ScriptError,
};
use parking_lot::Mutex;
use preview_core_types::{ContextKind, ErrorCode, PreviewEvent};
use rpc_broker::{BrokerConfig, ChannelEnd};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackgroundError {
    #[error("background script {0} is declared but not in the bundle")]
    MissingScript(String),
}

impl BackgroundError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BackgroundError::MissingScript(_) => ErrorCode::InvalidBundle,
        }
    }
}

/// A running background context.
pub struct BackgroundContext {
    path: String,
    runtime: ContextRuntime,
    gate: Mutex<Option<watch::Sender<bool>>>,
    installed: AtomicBool,
    script_error: Option<ScriptError>,
}

impl BackgroundContext {
    /// Path of the background script `bundle` declares, if any.
    pub fn declared_script(bundle: &MountedBundle) -> Option<String> {
        bundle.entry_surfaces().background.clone()
    }

    /// Starts the background context on `end`.
    ///
    /// Returns `Ok(None)` when the bundle declares no background. The script runs to the end
    /// of its top-level body; a failing script is reported as a context error and the context
    /// still comes up. Resolves once `onInstalled` has fired and deliveries are open.
    pub async fn start(
        end: ChannelEnd,
        session: &PreviewSession,
        bundle: MountedBundle,
        config: BrokerConfig,
        engine: &dyn ScriptEngine,
    ) -> Result<Option<Self>, BackgroundError> {
        let Some(path) = Self::declared_script(&bundle) else {
            debug!(target: "background-sim", generation = %bundle.generation(), "no background declared");
            return Ok(None);
        };
        let Some(file) = bundle.file(&path).cloned() else {
            return Err(BackgroundError::MissingScript(path));
        };

        let (gate, opened) = watch::channel(false);
        let runtime = ContextRuntime::start(
            ContextKind::Background,
            end,
            session,
            bundle,
            config,
            Some(opened),
        );
        let script_error = runtime.run_script(engine, &file, None).await.err();
        let context = Self {
            path,
            runtime,
            gate: Mutex::new(Some(gate)),
            installed: AtomicBool::new(false),
            script_error,
        };
        context.fire_installed();
        context.open_gate();
        Ok(Some(context))
    }

    /// Emits `runtime.onInstalled` with `{reason: "install"}`. Only the first call fires.
    fn fire_installed(&self) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let shim = self.runtime.shim();
        let listeners = shim
            .listeners()
            .emit(EventKind::Installed, json!({"reason": "install"}));
        let session = shim.session();
        session.publish(PreviewEvent::InstalledFired {
            generation: session.generation(),
        });
        info!(target: "background-sim", path = %self.path, listeners, "installed fired");
        true
    }

    fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.send_replace(true);
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn shim(&self) -> &CapabilityShim {
        self.runtime.shim()
    }

    pub fn runtime(&self) -> &ContextRuntime {
        &self.runtime
    }

    /// Error the script raised while running its top-level body.
    pub fn script_error(&self) -> Option<&ScriptError> {
        self.script_error.as_ref()
    }

    pub fn installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.gate
            .lock()
            .as_ref()
            .map(|gate| *gate.borrow())
            .unwrap_or(false)
    }

    /// Stops the context. Deliveries still waiting on the gate fail as disconnected.
    pub fn teardown(&self) {
        self.gate.lock().take();
        self.runtime.teardown();
    }
}

impl Drop for BackgroundContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
