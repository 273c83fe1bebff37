use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bundle_store::BundleStore;
use capability_shim::PreviewSession;
use cdp_adapter::{CdpConfig, CdpTransport, ChromiumTransport};
use clap::Args;
use content_injection::InjectionAttempt;
use extension_preview::{load_bundle_dir, spawn_event_logger, PreviewConfig};
use preview_core_types::{event_sink, PageTarget};
use privileged_executor::{CdpPageHost, ExecError, PrivilegedExecutor};
use serde::Serialize;
use tracing::info;

use super::output::{emit_structured, OutputFormat};

#[derive(Args, Clone, Debug)]
pub struct InjectArgs {
    /// Directory containing manifest.json and the bundle files
    pub dir: PathBuf,

    /// DevTools websocket of a running Chromium (ws://127.0.0.1:9222/devtools/browser/...)
    #[arg(long)]
    pub ws_url: String,
}

#[derive(Serialize)]
struct InjectOutcome {
    target: PageTarget,
    files: Vec<String>,
    injected: bool,
    attempts: Vec<InjectionAttempt>,
    message: Option<String>,
}

pub async fn cmd_inject(args: InjectArgs, config: PreviewConfig, format: OutputFormat) -> Result<()> {
    let input = load_bundle_dir(&args.dir)
        .await
        .with_context(|| format!("Failed to read bundle from {}", args.dir.display()))?;
    let store = BundleStore::new();
    let bundle = store.mount(input).context("Bundle rejected")?;
    if bundle.entry_surfaces().content_scripts.is_empty() {
        bail!("The bundle declares no content scripts");
    }

    let cdp = CdpConfig::attach(args.ws_url.clone()).context("Invalid --ws-url")?;
    let transport: Arc<dyn CdpTransport> = Arc::new(ChromiumTransport::new(cdp));
    let host = CdpPageHost::connect(transport.clone())
        .await
        .with_context(|| format!("Failed to connect to {}", args.ws_url))?;
    info!(ws_url = %args.ws_url, "connected to browser");

    let (events, _) = event_sink(config.event_capacity);
    let logger = spawn_event_logger(events.subscribe());
    let session = PreviewSession::new(bundle.generation(), events);
    let executor = PrivilegedExecutor::new(
        Arc::new(host),
        bundle,
        session.clone(),
        config.executor_config(),
    );

    let outcome = run_injection(&executor).await;

    executor.shutdown();
    session.close();
    store.teardown();
    transport.shutdown().await;
    logger.abort();

    let outcome = outcome?;
    if emit_structured(format, &outcome)? {
        return Ok(());
    }
    println!(
        "Page: {} ({})",
        outcome.target.url_or_blank(),
        outcome.target.id
    );
    println!("Content scripts: {}", outcome.files.join(", "));
    println!("Attempts:");
    for (index, attempt) in outcome.attempts.iter().enumerate() {
        println!(
            "  {}. {}/{} {:?} after {}ms: {}",
            index + 1,
            attempt.world,
            attempt.strategy,
            attempt.outcome,
            attempt.elapsed_ms,
            attempt.detail
        );
    }
    if let Some(message) = &outcome.message {
        println!();
        println!("{message}");
    }
    Ok(())
}

async fn run_injection(executor: &PrivilegedExecutor) -> Result<InjectOutcome> {
    let target = executor
        .find_active_target()
        .await
        .context("No page to inject into")?;
    let files = executor.content_script_files(target.url_or_blank());
    if files.is_empty() {
        bail!(
            "No content script declaration matches {}",
            target.url_or_blank()
        );
    }
    match executor.inject_files(&target, &files).await {
        Ok(report) => Ok(InjectOutcome {
            target,
            files,
            injected: true,
            attempts: report.attempts,
            message: None,
        }),
        Err(ExecError::InjectionBlocked(blocked)) => Ok(InjectOutcome {
            target,
            files,
            injected: false,
            message: Some(blocked.user_message()),
            attempts: blocked.attempts,
        }),
        Err(err) => Err(err).context("Injection failed"),
    }
}
