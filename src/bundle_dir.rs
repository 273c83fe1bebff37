//! Reads a bundle from a directory on disk.

use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use bundle_store::{BundleFile, BundleInput};
use tokio::fs;
use tracing::debug;

use crate::errors::PreviewError;

/// Collects every UTF-8 file under `root` into a bundle whose paths are relative to `root`.
/// `manifest.json` at the root becomes the manifest. Non-text files are skipped.
pub async fn load_bundle_dir(root: &Path) -> Result<BundleInput, PreviewError> {
    let mut files = Vec::new();
    collect(root, root, &mut files).await?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(BundleInput::from_files(files)?)
}

#[async_recursion]
async fn collect(root: &Path, dir: &Path, files: &mut Vec<BundleFile>) -> Result<(), PreviewError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|err| PreviewError::io(dir, err))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| PreviewError::io(dir, err))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|err| PreviewError::io(&path, err))?;
        if file_type.is_dir() {
            collect(root, &path, files).await?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|err| PreviewError::io(&path, err))?;
        match String::from_utf8(bytes) {
            Ok(content) => files.push(BundleFile::new(relative(root, &path), content)),
            Err(_) => debug!(path = %path.display(), "skipping non-text bundle file"),
        }
    }
    Ok(())
}

fn relative(root: &Path, path: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
