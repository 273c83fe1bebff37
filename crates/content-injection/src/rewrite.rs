//! Source rewriting applied once per injection, before any strategy runs.
//!
//! The prepared source installs a page-side message shim (`globalThis.__previewBridge`)
//! scoped to the bundle generation, hands the user code a minimal `chrome`/`browser` object
//! bound to that shim, and finally records an acknowledgement under a per-injection nonce so
//! strategies can verify the code really ran.

use bundle_store::{normalize_path, BundleError, MountedBundle};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the page binding page-side code posts messages through.
pub const BRIDGE_BINDING: &str = "__previewBridgeSend";

const PRELUDE: &str = r#"(function () {
  var generation = __GENERATION__;
  var existing = globalThis.__previewBridge;
  if (existing && existing.generation === generation) { return; }
  var listeners = [];
  var pending = {};
  var seq = 0;
  function post(kind, payload) {
    var binding = globalThis[__BINDING__];
    var replyId = generation + ":" + (++seq);
    return new Promise(function (resolve, reject) {
      if (typeof binding !== "function") {
        reject(new Error("preview bridge is not connected"));
        return;
      }
      pending[replyId] = { resolve: resolve, reject: reject };
      binding(JSON.stringify({ replyId: replyId, kind: kind, payload: payload === undefined ? null : payload }));
    });
  }
  globalThis.__previewBridge = {
    generation: generation,
    addListener: function (fn) { if (listeners.indexOf(fn) < 0) { listeners.push(fn); } },
    removeListener: function (fn) { var i = listeners.indexOf(fn); if (i >= 0) { listeners.splice(i, 1); } },
    hasListener: function (fn) { return listeners.indexOf(fn) >= 0; },
    hasListeners: function () { return listeners.length > 0; },
    dispatch: function (message, sender) {
      return new Promise(function (resolve, reject) {
        if (!listeners.length) {
          reject(new Error("Could not establish connection. Receiving end does not exist."));
          return;
        }
        var settled = false;
        var waiting = false;
        function respond(value) {
          if (settled) { return; }
          settled = true;
          resolve(value === undefined ? null : value);
        }
        var snapshot = listeners.slice();
        for (var i = 0; i < snapshot.length; i++) {
          var out;
          try { out = snapshot[i](message, sender || {}, respond); } catch (err) { console.error(err); continue; }
          if (out === true) { waiting = true; }
          else if (out && typeof out.then === "function") { waiting = true; out.then(respond, function () { respond(null); }); }
          else if (out !== undefined) { respond(out); }
        }
        if (!waiting) { respond(null); }
      });
    },
    settle: function (replyId, ok, value) {
      var entry = pending[replyId];
      if (!entry) { return false; }
      delete pending[replyId];
      if (ok) { entry.resolve(value); } else { entry.reject(new Error(String(value))); }
      return true;
    },
    post: post
  };
})();
"#;

const SHIM: &str = r#"(function (bridge) {
  var urls = __URLS__;
  function withCallback(promise, callback) {
    if (typeof callback !== "function") { return promise; }
    promise.then(function (value) { callback(value); }, function () { callback(undefined); });
  }
  var area = {
    get: function (keys, callback) { return withCallback(bridge.post("storage_get", keys === undefined ? null : keys), callback); },
    set: function (items, callback) { return withCallback(bridge.post("storage_set", items), callback); }
  };
  var shim = {
    runtime: {
      id: __EXTENSION_ID__,
      onMessage: { addListener: bridge.addListener, removeListener: bridge.removeListener, hasListener: bridge.hasListener, hasListeners: bridge.hasListeners },
      sendMessage: function (message, callback) { return withCallback(bridge.post("runtime_message", message), callback); },
      getURL: function (path) { var key = String(path).replace(/^(\.\/|\/)+/, ""); return urls[key] || path; }
    },
    storage: { local: area }
  };
  (function (chrome, browser) {
__FILES__
  }).call(globalThis, shim, shim);
})(globalThis.__previewBridge);
globalThis.__previewBridgeAcks = globalThis.__previewBridgeAcks || {};
globalThis.__previewBridgeAcks[__NONCE__] = true;
"#;

/// Content-script source ready for any injection strategy.
#[derive(Clone, Debug)]
pub struct PreparedScript {
    pub source: String,
    /// Acknowledgement key the source sets once it has run.
    pub nonce: String,
    pub files: Vec<String>,
}

impl PreparedScript {
    /// JS expression that is `true` once this script has run in the evaluating world.
    pub fn verify_expression(&self) -> String {
        format!(
            "!!(globalThis.__previewBridgeAcks && globalThis.__previewBridgeAcks[{}] === true)",
            js_string(&self.nonce)
        )
    }
}

pub(crate) fn js_string(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| "\"\"".to_string())
}

/// Builds the injectable source for `files` of the mounted bundle.
///
/// Each file runs inside its own `try` so one failing file does not stop the next.
pub fn prepare_content_script(
    bundle: &MountedBundle,
    extension_id: &str,
    files: &[String],
) -> Result<PreparedScript, BundleError> {
    let mut bodies = String::new();
    let mut resolved = Vec::with_capacity(files.len());
    for raw in files {
        let path = normalize_path(raw);
        let file = bundle
            .file(&path)
            .ok_or_else(|| BundleError::MissingFile(path.clone()))?;
        bodies.push_str(&format!(
            "    try {{\n{}\n    }} catch (err) {{ console.error({}, err); }}\n",
            file.content,
            js_string(&format!("[preview] {path} failed:"))
        ));
        resolved.push(path);
    }

    let urls: Map<String, Value> = bundle
        .files()
        .iter()
        .filter_map(|file| {
            bundle
                .handle(&file.path)
                .map(|handle| (file.path.clone(), Value::String(handle.url)))
        })
        .collect();
    let nonce = Uuid::new_v4().simple().to_string();
    let generation = bundle.generation().to_string();

    let prelude = PRELUDE
        .replace("__GENERATION__", &js_string(&generation))
        .replace("__BINDING__", &js_string(BRIDGE_BINDING));
    let shim = SHIM
        .replace("__URLS__", &Value::Object(urls).to_string())
        .replace("__EXTENSION_ID__", &js_string(extension_id))
        .replace("__NONCE__", &js_string(&nonce));
    let source = format!("{prelude}{}", shim.replacen("__FILES__", &bodies, 1));

    Ok(PreparedScript {
        source,
        nonce,
        files: resolved,
    })
}
