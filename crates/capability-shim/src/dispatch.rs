//! Tagged dispatch table mapping `{capability, method}` to a local handler or the broker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{CapabilityShim, ShimError};

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CapabilityKey {
    pub capability: String,
    pub method: String,
}

impl CapabilityKey {
    pub fn new(capability: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.capability, self.method)
    }
}

pub type LocalHandler =
    Arc<dyn Fn(CapabilityShim, Value) -> BoxFuture<'static, Result<Value, ShimError>> + Send + Sync>;

#[derive(Clone)]
pub enum Dispatch {
    /// Served inside the calling context.
    Local(LocalHandler),
    /// One outbound broker request per call.
    Forwarded,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Local(_) => f.write_str("Local"),
            Dispatch::Forwarded => f.write_str("Forwarded"),
        }
    }
}

#[derive(Clone, Default)]
pub struct DispatchTable {
    entries: HashMap<CapabilityKey, Dispatch>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every capability the preview supports.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        crate::builtins::install(&mut table);
        table
    }

    pub fn local<F, Fut>(&mut self, capability: &str, method: &str, handler: F) -> &mut Self
    where
        F: Fn(CapabilityShim, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ShimError>> + Send + 'static,
    {
        let handler: LocalHandler = Arc::new(
            move |shim: CapabilityShim, args: Value| -> BoxFuture<'static, Result<Value, ShimError>> {
                Box::pin(handler(shim, args))
            },
        );
        self.entries
            .insert(CapabilityKey::new(capability, method), Dispatch::Local(handler));
        self
    }

    pub fn forwarded(&mut self, capability: &str, method: &str) -> &mut Self {
        self.entries
            .insert(CapabilityKey::new(capability, method), Dispatch::Forwarded);
        self
    }

    pub fn lookup(&self, capability: &str, method: &str) -> Option<&Dispatch> {
        self.entries.get(&CapabilityKey::new(capability, method))
    }

    pub fn is_forwarded(&self, capability: &str, method: &str) -> bool {
        matches!(self.lookup(capability, method), Some(Dispatch::Forwarded))
    }

    pub fn keys(&self) -> Vec<CapabilityKey> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
