//! Script execution seam for popup and background contexts.

use std::sync::Arc;

use async_trait::async_trait;
use bundle_store::{normalize_path, BundleFile, PopupDocument};
use dashmap::DashMap;
use futures::future::BoxFuture;
use preview_core_types::ContextKind;
use thiserror::Error;

use crate::CapabilityShim;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("no program registered for {0}")]
    NoProgram(String),
    #[error("script {path} failed: {message}")]
    Failed { path: String, message: String },
}

impl ScriptError {
    pub fn failed(path: &str, message: impl Into<String>) -> Self {
        ScriptError::Failed {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// What a running script can reach: its context's capabilities and, for the popup, the
/// mounted document.
#[derive(Clone)]
pub struct ScriptScope {
    pub context: ContextKind,
    pub shim: CapabilityShim,
    pub document: Option<Arc<PopupDocument>>,
}

#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Runs `file` once to completion of its top-level body.
    async fn execute(&self, scope: ScriptScope, file: &BundleFile) -> Result<(), ScriptError>;
}

pub type ScriptProgram =
    Arc<dyn Fn(ScriptScope) -> BoxFuture<'static, Result<(), ScriptError>> + Send + Sync>;

/// Engine backed by Rust programs registered per bundle path.
#[derive(Default)]
pub struct NativeScriptEngine {
    programs: DashMap<String, ScriptProgram>,
}

impl NativeScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, path: &str, program: F) -> &Self
    where
        F: Fn(ScriptScope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ScriptError>> + Send + 'static,
    {
        let program: ScriptProgram = Arc::new(
            move |scope: ScriptScope| -> BoxFuture<'static, Result<(), ScriptError>> {
                Box::pin(program(scope))
            },
        );
        self.programs.insert(normalize_path(path), program);
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.programs.contains_key(&normalize_path(path))
    }
}

#[async_trait]
impl ScriptEngine for NativeScriptEngine {
    async fn execute(&self, scope: ScriptScope, file: &BundleFile) -> Result<(), ScriptError> {
        let program = self
            .programs
            .get(&normalize_path(&file.path))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ScriptError::NoProgram(file.path.clone()))?;
        program(scope).await
    }
}
