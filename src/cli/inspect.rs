use std::path::PathBuf;

use anyhow::{Context, Result};
use bundle_store::{render_popup, BundleStore, ContentScriptDecl, PopupDocument};
use clap::Args;
use extension_preview::load_bundle_dir;
use preview_core_types::GenerationId;
use serde::Serialize;

use super::output::{emit_structured, OutputFormat};

#[derive(Args, Clone, Debug)]
pub struct InspectArgs {
    /// Directory containing manifest.json and the bundle files
    pub dir: PathBuf,
}

#[derive(Serialize)]
struct InspectReport {
    generation: GenerationId,
    name: Option<String>,
    popup: Option<String>,
    background: Option<String>,
    content_scripts: Vec<ContentScriptDecl>,
    files: Vec<FileEntry>,
    document: Option<PopupDocument>,
}

#[derive(Serialize)]
struct FileEntry {
    path: String,
    bytes: usize,
    url: Option<String>,
}

pub async fn cmd_inspect(args: InspectArgs, format: OutputFormat) -> Result<()> {
    let input = load_bundle_dir(&args.dir)
        .await
        .with_context(|| format!("Failed to read bundle from {}", args.dir.display()))?;
    let store = BundleStore::new();
    let mounted = store.mount(input).context("Bundle rejected")?;
    let surfaces = mounted.entry_surfaces();
    let report = InspectReport {
        generation: mounted.generation(),
        name: mounted.manifest().name.clone(),
        popup: surfaces.popup.clone(),
        background: surfaces.background.clone(),
        content_scripts: surfaces.content_scripts.clone(),
        files: mounted
            .files()
            .iter()
            .map(|file| FileEntry {
                path: file.path.clone(),
                bytes: file.content.len(),
                url: mounted.handle(&file.path).map(|handle| handle.url),
            })
            .collect(),
        document: render_popup(&mounted).context("Popup could not be rendered")?,
    };
    store.teardown();

    if emit_structured(format, &report)? {
        return Ok(());
    }

    println!(
        "Bundle {} (generation {})",
        report.name.as_deref().unwrap_or("<unnamed>"),
        report.generation
    );
    println!("Entry surfaces:");
    println!("- Popup: {}", report.popup.as_deref().unwrap_or("(none)"));
    println!(
        "- Background: {}",
        report.background.as_deref().unwrap_or("(none)")
    );
    if report.content_scripts.is_empty() {
        println!("- Content scripts: (none)");
    } else {
        println!("- Content scripts:");
        for decl in &report.content_scripts {
            println!(
                "  - {} -> {}",
                decl.matches.join(", "),
                decl.normalized_files().join(", ")
            );
        }
    }
    println!();
    println!("Files ({}):", report.files.len());
    for file in &report.files {
        println!(
            "- {} ({} bytes) {}",
            file.path,
            file.bytes,
            file.url.as_deref().unwrap_or("")
        );
    }
    if let Some(document) = &report.document {
        println!();
        println!("Popup document {}:", document.path);
        println!("- Scripts: {}", document.scripts.join(", "));
        if document.skipped_inline_scripts > 0 {
            println!(
                "- Inline scripts not run: {}",
                document.skipped_inline_scripts
            );
        }
        for missing in &document.unresolved {
            println!("- Missing reference: {missing}");
        }
    }
    Ok(())
}
