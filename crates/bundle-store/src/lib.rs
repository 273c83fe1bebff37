//! Bundle store for generated extension source.
//!
//! The store holds at most one live mount. Mounting normalizes the file set, validates the
//! manifest and allocates one revocable [`ResourceHandle`] per file; tearing down (or mounting
//! the next generation) revokes every handle of the previous mount.

pub mod document;
pub mod manifest;
pub mod path;
pub mod pattern;

pub use document::{render_popup, PopupDocument};
pub use manifest::{ActionDecl, BackgroundDecl, ContentScriptDecl, EntrySurfaces, Manifest};
pub use path::{normalize_path, resolve_relative};
pub use pattern::{any_pattern_matches, MatchPattern};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use preview_core_types::GenerationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),
    #[error("bundle file not found: {0}")]
    MissingFile(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: String,
    pub content: String,
}

impl BundleFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Inbound bundle contract from the validation pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BundleInput {
    pub manifest: BundleFile,
    pub files: Vec<BundleFile>,
}

impl BundleInput {
    /// Splits a flat file list into manifest and files. The last `manifest.json` wins.
    pub fn from_files(files: Vec<BundleFile>) -> Result<Self, BundleError> {
        let mut manifest = None;
        let mut rest = Vec::with_capacity(files.len());
        for file in files {
            if normalize_path(&file.path) == MANIFEST_FILE {
                manifest = Some(file);
            } else {
                rest.push(file);
            }
        }
        let manifest = manifest
            .ok_or_else(|| BundleError::InvalidBundle("bundle has no manifest file".into()))?;
        Ok(Self {
            manifest,
            files: rest,
        })
    }
}

/// Opaque, revocable reference to one file of one generation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub url: String,
    pub path: String,
    pub generation: GenerationId,
}

struct MountState {
    generation: GenerationId,
    manifest: Manifest,
    surfaces: EntrySurfaces,
    manifest_path: String,
    files: Vec<BundleFile>,
    index: HashMap<String, usize>,
    handles: HashMap<String, ResourceHandle>,
    by_url: HashMap<String, String>,
    revoked: AtomicBool,
}

/// Snapshot of a mounted generation shared with the contexts built from it.
#[derive(Clone)]
pub struct MountedBundle {
    state: Arc<MountState>,
}

impl std::fmt::Debug for MountedBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedBundle")
            .field("generation", &self.state.generation)
            .field("files", &self.state.files.len())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl MountedBundle {
    fn build(input: BundleInput) -> Result<Self, BundleError> {
        let manifest_path = match normalize_path(&input.manifest.path) {
            p if p.is_empty() => MANIFEST_FILE.to_string(),
            p => p,
        };
        let manifest = Manifest::parse(&input.manifest.content)?;
        let surfaces = manifest.validate()?;
        let generation = GenerationId::new();

        let mut files: Vec<BundleFile> = Vec::with_capacity(input.files.len() + 1);
        let mut index: HashMap<String, usize> = HashMap::new();
        let designated = BundleFile::new(manifest_path.clone(), input.manifest.content);
        for file in input.files.into_iter().chain(std::iter::once(designated)) {
            let path = normalize_path(&file.path);
            if path.is_empty() {
                warn!(target: "bundle-store", raw = %file.path, "skipping file with empty path");
                continue;
            }
            match index.get(&path) {
                Some(&slot) => {
                    debug!(target: "bundle-store", %path, "replacing duplicate bundle entry");
                    files[slot].content = file.content;
                }
                None => {
                    index.insert(path.clone(), files.len());
                    files.push(BundleFile::new(path, file.content));
                }
            }
        }

        let mut handles = HashMap::with_capacity(files.len());
        let mut by_url = HashMap::with_capacity(files.len());
        for file in &files {
            let handle = ResourceHandle {
                url: format!("blob:preview/{generation}/{}", Uuid::new_v4().simple()),
                path: file.path.clone(),
                generation,
            };
            by_url.insert(handle.url.clone(), file.path.clone());
            handles.insert(file.path.clone(), handle);
        }

        Ok(Self {
            state: Arc::new(MountState {
                generation,
                manifest,
                surfaces,
                manifest_path,
                files,
                index,
                handles,
                by_url,
                revoked: AtomicBool::new(false),
            }),
        })
    }

    pub fn generation(&self) -> GenerationId {
        self.state.generation
    }

    pub fn manifest(&self) -> &Manifest {
        &self.state.manifest
    }

    pub fn manifest_path(&self) -> &str {
        &self.state.manifest_path
    }

    pub fn entry_surfaces(&self) -> &EntrySurfaces {
        &self.state.surfaces
    }

    pub fn files(&self) -> &[BundleFile] {
        &self.state.files
    }

    pub fn file(&self, path: &str) -> Option<&BundleFile> {
        let path = normalize_path(path);
        self.state
            .index
            .get(&path)
            .map(|&slot| &self.state.files[slot])
    }

    /// Handle for `path`, or `None` once this generation has been revoked.
    pub fn handle(&self, path: &str) -> Option<ResourceHandle> {
        if self.is_revoked() {
            return None;
        }
        self.state.handles.get(&normalize_path(path)).cloned()
    }

    pub fn handle_count(&self) -> usize {
        self.state.handles.len()
    }

    pub fn is_revoked(&self) -> bool {
        self.state.revoked.load(Ordering::SeqCst)
    }

    fn path_for_url(&self, url: &str) -> Option<&str> {
        self.state.by_url.get(url).map(String::as_str)
    }

    fn revoke(&self) -> usize {
        if self.state.revoked.swap(true, Ordering::SeqCst) {
            0
        } else {
            self.state.handles.len()
        }
    }
}

/// Owner of the live mount and its resource handles.
#[derive(Default)]
pub struct BundleStore {
    current: RwLock<Option<MountedBundle>>,
}

impl BundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and mounts `input`, revoking the previous mount first.
    ///
    /// An invalid bundle is rejected before anything is revoked or allocated.
    pub fn mount(&self, input: BundleInput) -> Result<MountedBundle, BundleError> {
        let mounted = MountedBundle::build(input)?;
        let mut guard = self.current.write();
        if let Some(previous) = guard.take() {
            let revoked = previous.revoke();
            debug!(
                target: "bundle-store",
                generation = %previous.generation(),
                revoked,
                "revoked previous mount"
            );
        }
        info!(
            target: "bundle-store",
            generation = %mounted.generation(),
            files = mounted.files().len(),
            "bundle mounted"
        );
        *guard = Some(mounted.clone());
        Ok(mounted)
    }

    pub fn current(&self) -> Option<MountedBundle> {
        self.current.read().clone()
    }

    pub fn resolve(&self, path: &str) -> Option<String> {
        let guard = self.current.read();
        let mounted = guard.as_ref()?;
        mounted.file(path).map(|f| f.content.clone())
    }

    pub fn resolve_handle(&self, path: &str) -> Option<ResourceHandle> {
        let guard = self.current.read();
        guard.as_ref()?.handle(path)
    }

    /// Loads the content behind a handle. Handles of revoked generations never resolve.
    pub fn open(&self, handle: &ResourceHandle) -> Option<String> {
        self.open_url(&handle.url)
    }

    pub fn open_url(&self, url: &str) -> Option<String> {
        let guard = self.current.read();
        let mounted = guard.as_ref()?;
        if mounted.is_revoked() {
            return None;
        }
        let path = mounted.path_for_url(url)?;
        mounted.file(path).map(|f| f.content.clone())
    }

    /// Revokes every handle of the live mount. Returns the number of revoked handles.
    pub fn teardown(&self) -> usize {
        let previous = self.current.write().take();
        match previous {
            Some(mounted) => {
                let revoked = mounted.revoke();
                info!(
                    target: "bundle-store",
                    generation = %mounted.generation(),
                    revoked,
                    "bundle torn down"
                );
                revoked
            }
            None => 0,
        }
    }
}
