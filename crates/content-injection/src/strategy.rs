//! Per-strategy wrappers. Every wrapper evaluates to `true` (or a promise of `true`) only when
//! the prepared script actually ran.

use preview_core_types::InjectionStrategy;

use crate::rewrite::{js_string, PreparedScript};

pub fn wrap(strategy: InjectionStrategy, script: &PreparedScript) -> String {
    let source = js_string(&script.source);
    let verify = script.verify_expression();
    match strategy {
        InjectionStrategy::FunctionEval => format!(
            "(function () {{\n  try {{ new Function({source})(); }} catch (err) {{ return false; }}\n  return {verify};\n}})()"
        ),
        InjectionStrategy::ScriptElement => format!(
            "(function () {{\n  try {{\n    var el = document.createElement('script');\n    el.textContent = {source};\n    (document.head || document.documentElement).appendChild(el);\n    el.remove();\n  }} catch (err) {{ return false; }}\n  return {verify};\n}})()"
        ),
        InjectionStrategy::BlobScript => format!(
            "new Promise(function (resolve) {{\n  try {{\n    var url = URL.createObjectURL(new Blob([{source}], {{ type: 'text/javascript' }}));\n    var el = document.createElement('script');\n    el.src = url;\n    el.onload = function () {{ URL.revokeObjectURL(url); el.remove(); resolve({verify}); }};\n    el.onerror = function () {{ URL.revokeObjectURL(url); el.remove(); resolve(false); }};\n    (document.head || document.documentElement).appendChild(el);\n  }} catch (err) {{ resolve(false); }}\n}})"
        ),
    }
}
