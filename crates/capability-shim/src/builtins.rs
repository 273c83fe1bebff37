//! Capabilities served inside the calling context, plus the forwarded set.

use preview_core_types::{ErrorCode, PreviewEvent};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::alarms::AlarmCreateInfo;
use crate::dispatch::DispatchTable;
use crate::storage::{StorageArea, StorageQuery};
use crate::{CapabilityShim, ShimError};

/// Calls that always travel through the broker to the privileged executor.
pub const FORWARDED: &[(&str, &str)] = &[
    ("tabs", "query"),
    ("tabs", "sendMessage"),
    ("scripting", "executeScript"),
    ("runtime", "sendMessage"),
];

/// Positional argument `index`, `null` when absent.
pub fn arg(args: &Value, index: usize) -> Value {
    match args {
        Value::Array(items) => items.get(index).cloned().unwrap_or(Value::Null),
        Value::Null => Value::Null,
        single if index == 0 => single.clone(),
        _ => Value::Null,
    }
}

fn object_arg(args: &Value, index: usize, call: &str) -> Result<Map<String, Value>, ShimError> {
    match arg(args, index) {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ShimError::invalid_args(
            call,
            format!("expected an object, got {other}"),
        )),
    }
}

fn string_list(value: Value, call: &str) -> Result<Vec<String>, ShimError> {
    match value {
        Value::String(key) => Ok(vec![key]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(key) => Ok(key),
                other => Err(ShimError::invalid_args(
                    call,
                    format!("expected a string, got {other}"),
                )),
            })
            .collect(),
        other => Err(ShimError::invalid_args(
            call,
            format!("expected a string or list of strings, got {other}"),
        )),
    }
}

pub fn install(table: &mut DispatchTable) {
    for area in StorageArea::ALL {
        install_storage(table, area);
    }
    install_runtime(table);
    install_alarms(table);
    install_notifications(table);
    for namespace in ["action", "browserAction"] {
        install_action(table, namespace);
    }
    for (capability, method) in FORWARDED {
        table.forwarded(capability, method);
    }
}

fn install_storage(table: &mut DispatchTable, area: StorageArea) {
    let capability = area.capability();
    table
        .local(&capability, "get", move |shim: CapabilityShim, args| async move {
            let query = StorageQuery::from_arg(&arg(&args, 0))?;
            Ok(Value::Object(shim.session().storage().get(area, &query)))
        })
        .local(&capability, "set", move |shim: CapabilityShim, args| async move {
            let items = object_arg(&args, 0, "storage.set")?;
            shim.session().storage().set(area, items);
            Ok(Value::Null)
        })
        .local(&capability, "remove", move |shim: CapabilityShim, args| async move {
            let keys = string_list(arg(&args, 0), "storage.remove")?;
            shim.session().storage().remove(area, &keys);
            Ok(Value::Null)
        })
        .local(&capability, "clear", move |shim: CapabilityShim, _args| async move {
            shim.session().storage().clear(area);
            Ok(Value::Null)
        });
}

fn install_runtime(table: &mut DispatchTable) {
    table
        .local("runtime", "getURL", |shim: CapabilityShim, args| async move {
            let path = match arg(&args, 0) {
                Value::String(path) => path,
                other => {
                    return Err(ShimError::invalid_args(
                        "runtime.getURL",
                        format!("expected a path, got {other}"),
                    ))
                }
            };
            shim.bundle()
                .handle(&path)
                .map(|handle| Value::String(handle.url))
                .ok_or_else(|| ShimError::Failed {
                    code: ErrorCode::CapabilityUnavailable,
                    message: format!("bundle has no file at {path}"),
                })
        })
        .local("runtime", "getManifest", |shim: CapabilityShim, _args| async move {
            serde_json::to_value(shim.bundle().manifest()).map_err(|err| ShimError::Failed {
                code: ErrorCode::Internal,
                message: err.to_string(),
            })
        })
        .local("runtime", "id", |shim: CapabilityShim, _args| async move {
            Ok(Value::String(shim.extension_id().to_string()))
        });
}

fn install_alarms(table: &mut DispatchTable) {
    table
        .local("alarms", "create", |shim: CapabilityShim, args| async move {
            let (name, info) = match arg(&args, 0) {
                Value::String(name) => (name, arg(&args, 1)),
                info => (String::new(), info),
            };
            let info: AlarmCreateInfo = serde_json::from_value(info)
                .map_err(|err| ShimError::invalid_args("alarms.create", err.to_string()))?;
            shim.alarms().create(&name, info)?;
            Ok(Value::Null)
        })
        .local("alarms", "get", |shim: CapabilityShim, args| async move {
            let name = arg(&args, 0).as_str().unwrap_or_default().to_string();
            Ok(shim
                .alarms()
                .get(&name)
                .and_then(|alarm| serde_json::to_value(alarm).ok())
                .unwrap_or(Value::Null))
        })
        .local("alarms", "getAll", |shim: CapabilityShim, _args| async move {
            Ok(serde_json::to_value(shim.alarms().get_all()).unwrap_or_else(|_| json!([])))
        })
        .local("alarms", "clear", |shim: CapabilityShim, args| async move {
            let name = arg(&args, 0).as_str().unwrap_or_default().to_string();
            Ok(Value::Bool(shim.alarms().clear(&name)))
        })
        .local("alarms", "clearAll", |shim: CapabilityShim, _args| async move {
            Ok(Value::Bool(shim.alarms().clear_all()))
        });
}

fn install_notifications(table: &mut DispatchTable) {
    table
        .local("notifications", "create", |shim: CapabilityShim, args| async move {
            let (id, options) = match arg(&args, 0) {
                Value::String(id) if !id.is_empty() => (id, object_arg(&args, 1, "notifications.create")?),
                Value::String(_) => (
                    Uuid::new_v4().to_string(),
                    object_arg(&args, 1, "notifications.create")?,
                ),
                _ => (
                    Uuid::new_v4().to_string(),
                    object_arg(&args, 0, "notifications.create")?,
                ),
            };
            let title = options
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let message = options
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            shim.notifications()
                .lock()
                .insert(id.clone(), Value::Object(options));
            shim.publish(PreviewEvent::NotificationShown {
                context: shim.context(),
                id: id.clone(),
                title,
                message,
            });
            Ok(Value::String(id))
        })
        .local("notifications", "clear", |shim: CapabilityShim, args| async move {
            let id = arg(&args, 0).as_str().unwrap_or_default().to_string();
            Ok(Value::Bool(shim.notifications().lock().remove(&id).is_some()))
        })
        .local("notifications", "getAll", |shim: CapabilityShim, _args| async move {
            let all: Map<String, Value> = shim
                .notifications()
                .lock()
                .keys()
                .map(|id| (id.clone(), Value::Bool(true)))
                .collect();
            Ok(Value::Object(all))
        });
}

fn install_action(table: &mut DispatchTable, namespace: &'static str) {
    table
        .local(namespace, "setBadgeText", |shim: CapabilityShim, args| async move {
            let details = object_arg(&args, 0, "action.setBadgeText")?;
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            shim.badge().lock().text = text.clone();
            shim.publish(PreviewEvent::BadgeUpdated {
                context: shim.context(),
                text,
            });
            Ok(Value::Null)
        })
        .local(namespace, "getBadgeText", |shim: CapabilityShim, _args| async move {
            Ok(Value::String(shim.badge().lock().text.clone()))
        })
        .local(
            namespace,
            "setBadgeBackgroundColor",
            |shim: CapabilityShim, args| async move {
                let details = object_arg(&args, 0, "action.setBadgeBackgroundColor")?;
                shim.badge().lock().color = details.get("color").cloned();
                Ok(Value::Null)
            },
        )
        .local(
            namespace,
            "getBadgeBackgroundColor",
            |shim: CapabilityShim, _args| async move {
                Ok(shim.badge().lock().color.clone().unwrap_or(Value::Null))
            },
        );
}
