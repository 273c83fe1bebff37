//! Session-scoped key/value storage shared by every simulated context.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::ShimError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Local,
    Sync,
    Session,
}

impl StorageArea {
    pub const ALL: [StorageArea; 3] = [StorageArea::Local, StorageArea::Sync, StorageArea::Session];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Local => "local",
            StorageArea::Sync => "sync",
            StorageArea::Session => "session",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(StorageArea::Local),
            "sync" => Some(StorageArea::Sync),
            "session" => Some(StorageArea::Session),
            _ => None,
        }
    }

    /// Capability namespace, e.g. `storage.local`.
    pub fn capability(&self) -> String {
        format!("storage.{}", self.as_str())
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read shapes accepted by `get`.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageQuery {
    All,
    Keys(Vec<String>),
    Defaults(Map<String, Value>),
}

impl StorageQuery {
    pub fn from_arg(arg: &Value) -> Result<Self, ShimError> {
        match arg {
            Value::Null => Ok(StorageQuery::All),
            Value::String(key) => Ok(StorageQuery::Keys(vec![key.clone()])),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(key) => Ok(key.clone()),
                    other => Err(ShimError::invalid_args(
                        "storage.get",
                        format!("keys must be strings, got {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(StorageQuery::Keys),
            Value::Object(defaults) => Ok(StorageQuery::Defaults(defaults.clone())),
            other => Err(ShimError::invalid_args(
                "storage.get",
                format!("unsupported query {other}"),
            )),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// `{key: {oldValue, newValue}}` for one committed write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(pub BTreeMap<String, StorageChange>);

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&StorageChange> {
        self.0.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Receives committed change sets. Called synchronously by the writer.
pub trait ChangeSink: Send + Sync {
    fn storage_changed(&self, area: StorageArea, changes: &ChangeSet);
}

/// In-memory storage for one preview session.
///
/// Writes commit under a single mutex, then fan out to every live sink before returning.
#[derive(Default)]
pub struct SessionStorage {
    areas: Mutex<HashMap<StorageArea, Map<String, Value>>>,
    sinks: RwLock<Vec<Weak<dyn ChangeSink>>>,
}

impl SessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a change sink. Only a weak reference is kept.
    pub fn subscribe(&self, sink: &Arc<dyn ChangeSink>) {
        let mut sinks = self.sinks.write();
        sinks.retain(|existing| existing.strong_count() > 0);
        sinks.push(Arc::downgrade(sink));
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks
            .read()
            .iter()
            .filter(|sink| sink.strong_count() > 0)
            .count()
    }

    pub fn get(&self, area: StorageArea, query: &StorageQuery) -> Map<String, Value> {
        let areas = self.areas.lock();
        let empty = Map::new();
        let store = areas.get(&area).unwrap_or(&empty);
        match query {
            StorageQuery::All => store.clone(),
            StorageQuery::Keys(keys) => keys
                .iter()
                .filter_map(|key| store.get(key).map(|value| (key.clone(), value.clone())))
                .collect(),
            StorageQuery::Defaults(defaults) => defaults
                .iter()
                .map(|(key, default)| {
                    let value = store.get(key).unwrap_or(default).clone();
                    (key.clone(), value)
                })
                .collect(),
        }
    }

    pub fn set(&self, area: StorageArea, items: Map<String, Value>) -> ChangeSet {
        let changes = {
            let mut areas = self.areas.lock();
            let store = areas.entry(area).or_default();
            let mut changes = BTreeMap::new();
            for (key, value) in items {
                let old = store.insert(key.clone(), value.clone());
                if old.as_ref() != Some(&value) {
                    changes.insert(
                        key,
                        StorageChange {
                            old_value: old,
                            new_value: Some(value),
                        },
                    );
                }
            }
            ChangeSet(changes)
        };
        self.notify(area, &changes);
        changes
    }

    pub fn remove(&self, area: StorageArea, keys: &[String]) -> ChangeSet {
        let changes = {
            let mut areas = self.areas.lock();
            let store = areas.entry(area).or_default();
            let mut changes = BTreeMap::new();
            for key in keys {
                if let Some(old) = store.remove(key) {
                    changes.insert(
                        key.clone(),
                        StorageChange {
                            old_value: Some(old),
                            new_value: None,
                        },
                    );
                }
            }
            ChangeSet(changes)
        };
        self.notify(area, &changes);
        changes
    }

    pub fn clear(&self, area: StorageArea) -> ChangeSet {
        let changes = {
            let mut areas = self.areas.lock();
            let drained = areas.remove(&area).unwrap_or_default();
            ChangeSet(
                drained
                    .into_iter()
                    .map(|(key, old)| {
                        (
                            key,
                            StorageChange {
                                old_value: Some(old),
                                new_value: None,
                            },
                        )
                    })
                    .collect(),
            )
        };
        self.notify(area, &changes);
        changes
    }

    fn notify(&self, area: StorageArea, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let sinks: Vec<Arc<dyn ChangeSink>> =
            self.sinks.read().iter().filter_map(Weak::upgrade).collect();
        trace!(
            target: "capability-shim",
            %area,
            keys = changes.len(),
            sinks = sinks.len(),
            "fanning out storage change"
        );
        for sink in sinks {
            sink.storage_changed(area, changes);
        }
    }
}
