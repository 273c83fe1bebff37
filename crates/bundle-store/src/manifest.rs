//! Manifest model and entry-surface validation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::path::normalize_path;
use crate::BundleError;

/// Popup declaration in either `action` or `browser_action` form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDecl {
    #[serde(default)]
    pub default_popup: Option<String>,
    #[serde(default)]
    pub default_title: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScriptDecl {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default, alias = "js")]
    pub files: Vec<String>,
    #[serde(default)]
    pub run_at: Option<String>,
    #[serde(default)]
    pub all_frames: bool,
}

impl ContentScriptDecl {
    pub fn is_declared(&self) -> bool {
        !self.matches.is_empty() && !self.files.is_empty()
    }

    pub fn normalized_files(&self) -> Vec<String> {
        self.files.iter().map(|f| normalize_path(f)).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundDecl {
    #[serde(default, alias = "service_worker")]
    pub file: Option<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
}

/// Structured manifest. Unknown keys are tolerated; only entry surfaces are interpreted.
///
/// Descriptive fields never reject a manifest: a value of an unexpected type is read as text
/// where that makes sense and dropped otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient_version")]
    pub manifest_version: Option<u32>,
    #[serde(default)]
    pub popup: Option<String>,
    #[serde(default)]
    pub action: Option<ActionDecl>,
    #[serde(default)]
    pub browser_action: Option<ActionDecl>,
    #[serde(default, rename = "contentScript", alias = "content_script")]
    pub content_script: Option<ContentScriptDecl>,
    #[serde(default)]
    pub content_scripts: Vec<ContentScriptDecl>,
    #[serde(default)]
    pub background: Option<BackgroundDecl>,
    #[serde(default, deserialize_with = "lenient_text_list")]
    pub permissions: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text_list")]
    pub host_permissions: Vec<String>,
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(scalar_text(Value::deserialize(deserializer)?))
}

fn lenient_version<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_text_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).into_iter().collect(),
    })
}

/// Which entry surfaces a manifest declares.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySurfaces {
    pub popup: Option<String>,
    pub content_scripts: Vec<ContentScriptDecl>,
    pub background: Option<String>,
}

impl EntrySurfaces {
    pub fn is_empty(&self) -> bool {
        self.popup.is_none() && self.content_scripts.is_empty() && self.background.is_none()
    }
}

impl Manifest {
    /// Parses a manifest, trying JSON first and YAML second.
    pub fn parse(raw: &str) -> Result<Self, BundleError> {
        match serde_json::from_str::<Manifest>(raw) {
            Ok(manifest) => Ok(manifest),
            Err(json_err) => serde_yaml::from_str::<Manifest>(raw).map_err(|yaml_err| {
                BundleError::InvalidBundle(format!(
                    "manifest is not structured data (json error: {json_err}; yaml error: {yaml_err})"
                ))
            }),
        }
    }

    pub fn popup_path(&self) -> Option<String> {
        self.popup
            .as_deref()
            .or_else(|| {
                self.action
                    .as_ref()
                    .and_then(|a| a.default_popup.as_deref())
            })
            .or_else(|| {
                self.browser_action
                    .as_ref()
                    .and_then(|a| a.default_popup.as_deref())
            })
            .map(normalize_path)
            .filter(|p| !p.is_empty())
    }

    pub fn content_script_decls(&self) -> Vec<ContentScriptDecl> {
        self.content_script
            .iter()
            .chain(self.content_scripts.iter())
            .filter(|decl| decl.is_declared())
            .cloned()
            .collect()
    }

    pub fn background_path(&self) -> Option<String> {
        let background = self.background.as_ref()?;
        background
            .file
            .as_deref()
            .or_else(|| background.scripts.first().map(String::as_str))
            .map(normalize_path)
            .filter(|p| !p.is_empty())
    }

    pub fn entry_surfaces(&self) -> EntrySurfaces {
        EntrySurfaces {
            popup: self.popup_path(),
            content_scripts: self.content_script_decls(),
            background: self.background_path(),
        }
    }

    pub fn validate(&self) -> Result<EntrySurfaces, BundleError> {
        let surfaces = self.entry_surfaces();
        if surfaces.is_empty() {
            return Err(BundleError::InvalidBundle(
                "manifest declares no popup, content script or background entry".into(),
            ));
        }
        Ok(surfaces)
    }
}
