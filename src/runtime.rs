//! Mounts a bundle as a live preview and tears it down again.
//!
//! One [`PreviewRuntime`] holds at most one mounted generation. Mounting a new bundle first
//! stops everything the previous one started: contexts, channels, pending calls, listeners,
//! alarms and resource handles.

use std::sync::Arc;

use background_sim::BackgroundContext;
use bundle_store::{BundleInput, BundleStore, MountedBundle, PopupDocument};
use capability_shim::{PreviewSession, ScriptEngine};
use preview_core_types::{
    event_sink, ContextKind, EventSink, GenerationId, HostPlatform, PageTarget, PreviewEvent,
};
use privileged_executor::{ExecError, PrivilegedExecutor};
use rpc_broker::channel_pair;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::PreviewConfig;
use crate::errors::PreviewError;
use crate::popup::PopupContext;

/// What a mount brought up.
#[derive(Clone, Debug, Serialize)]
pub struct MountReport {
    pub generation: GenerationId,
    pub popup: Option<PopupDocument>,
    pub background: bool,
    /// Page the declared content scripts are being injected into.
    pub content_target: Option<PageTarget>,
    /// Errors raised by popup and background scripts or their missing entry files. They do not
    /// fail the mount.
    pub script_errors: Vec<String>,
}

/// Handles into the mounted generation.
#[derive(Clone)]
pub struct ActivePreview {
    pub bundle: MountedBundle,
    pub session: PreviewSession,
    pub executor: PrivilegedExecutor,
    pub popup: Option<Arc<PopupContext>>,
    pub background: Option<Arc<BackgroundContext>>,
}

impl ActivePreview {
    pub fn generation(&self) -> GenerationId {
        self.bundle.generation()
    }

    fn stop(&self) {
        if let Some(popup) = &self.popup {
            popup.teardown();
        }
        if let Some(background) = &self.background {
            background.teardown();
        }
        self.executor.shutdown();
        self.session.close();
    }
}

/// Who revokes the handles of a generation being stopped.
#[derive(Clone, Copy)]
enum Revocation {
    Teardown,
    /// `BundleStore::mount` already revoked them when the next bundle went live.
    ReplacedByMount,
}

pub struct PreviewRuntime {
    config: PreviewConfig,
    host: Arc<dyn HostPlatform>,
    engine: Arc<dyn ScriptEngine>,
    store: BundleStore,
    events: EventSink,
    active: Mutex<Option<ActivePreview>>,
}

impl PreviewRuntime {
    pub fn new(
        config: PreviewConfig,
        host: Arc<dyn HostPlatform>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Self {
        let (events, _) = event_sink(config.event_capacity);
        Self {
            config,
            host,
            engine,
            store: BundleStore::new(),
            events,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Telemetry of every generation mounted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PreviewEvent> {
        self.events.subscribe()
    }

    pub async fn active(&self) -> Option<ActivePreview> {
        self.active.lock().await.clone()
    }

    /// Mounts `input` as the new preview.
    ///
    /// Only an invalid bundle fails the mount, and it leaves the live generation untouched.
    /// A declared popup or background file that is missing, script errors, and an unreachable
    /// page are published as events; the rest of the preview still comes up. Missing entry
    /// files also land in [`MountReport::script_errors`].
    /// Content scripts go to `active_page`, or to the host's active page when `None`.
    pub async fn mount(
        &self,
        input: BundleInput,
        active_page: Option<PageTarget>,
    ) -> Result<MountReport, PreviewError> {
        let mut active = self.active.lock().await;
        // The store rejects an invalid bundle before revoking the live one.
        let bundle = self.store.mount(input)?;
        if let Some(previous) = active.take() {
            self.stop_generation(previous, Revocation::ReplacedByMount);
        }

        let generation = bundle.generation();
        let session = PreviewSession::new(generation, self.events.clone());
        session.publish(PreviewEvent::BundleMounted {
            generation,
            files: bundle.files().len(),
            handles: bundle.handle_count(),
        });

        let executor = PrivilegedExecutor::new(
            self.host.clone(),
            bundle.clone(),
            session.clone(),
            self.config.executor_config(),
        );
        executor.start_page_inbox();
        let mut script_errors = Vec::new();

        let (privileged, context) = channel_pair();
        let popup =
            match PopupContext::start(context, &session, bundle.clone(), self.config.broker.clone()) {
                Ok(Some(popup)) => {
                    executor.attach_context(ContextKind::Popup, privileged);
                    Some(Arc::new(popup))
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(%generation, %err, "popup context not started");
                    session.publish(PreviewEvent::ContextError {
                        generation,
                        context: ContextKind::Popup,
                        message: err.to_string(),
                    });
                    script_errors.push(err.to_string());
                    None
                }
            };

        let background = if BackgroundContext::declared_script(&bundle).is_some() {
            let (privileged, context) = channel_pair();
            executor.attach_context(ContextKind::Background, privileged);
            match BackgroundContext::start(
                context,
                &session,
                bundle.clone(),
                self.config.broker.clone(),
                self.engine.as_ref(),
            )
            .await
            {
                Ok(Some(background)) => {
                    if let Some(err) = background.script_error() {
                        script_errors.push(err.to_string());
                    }
                    Some(Arc::new(background))
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(%generation, %err, "background context not started");
                    executor.detach_context(ContextKind::Background);
                    session.publish(PreviewEvent::ContextError {
                        generation,
                        context: ContextKind::Background,
                        message: err.to_string(),
                    });
                    script_errors.push(err.to_string());
                    None
                }
            }
        } else {
            None
        };

        let content_target = self.start_content_scripts(&executor, active_page).await;

        if let Some(popup) = &popup {
            script_errors.extend(
                popup
                    .run_scripts(self.engine.as_ref())
                    .await
                    .into_iter()
                    .map(|err| err.to_string()),
            );
        }

        let report = MountReport {
            generation,
            popup: popup.as_ref().map(|popup| popup.document().as_ref().clone()),
            background: background.is_some(),
            content_target,
            script_errors,
        };
        info!(
            %generation,
            popup = report.popup.is_some(),
            background = report.background,
            content = report.content_target.is_some(),
            "preview mounted"
        );
        *active = Some(ActivePreview {
            bundle,
            session,
            executor,
            popup,
            background,
        });
        Ok(report)
    }

    async fn start_content_scripts(
        &self,
        executor: &PrivilegedExecutor,
        active_page: Option<PageTarget>,
    ) -> Option<PageTarget> {
        if executor.bundle().entry_surfaces().content_scripts.is_empty() {
            return None;
        }
        let target = match active_page {
            Some(target) => target,
            None => match executor.find_active_target().await {
                Ok(target) => target,
                Err(ExecError::NoActiveTarget) => {
                    debug!("no active page for content scripts");
                    return None;
                }
                Err(err) => {
                    warn!(%err, "could not look up the active page");
                    return None;
                }
            },
        };
        executor
            .spawn_content_injection(target.clone())
            .then_some(target)
    }

    /// Stops the mounted preview. Returns `false` when nothing was mounted.
    pub async fn teardown(&self) -> bool {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => {
                self.stop_generation(previous, Revocation::Teardown);
                true
            }
            None => false,
        }
    }

    fn stop_generation(&self, previous: ActivePreview, revocation: Revocation) {
        let generation = previous.generation();
        previous.stop();
        let revoked = match revocation {
            Revocation::Teardown => self.store.teardown(),
            Revocation::ReplacedByMount => previous.bundle.handle_count(),
        };
        let _ = self.events.send(PreviewEvent::BundleTornDown {
            generation,
            revoked,
        });
        info!(%generation, revoked, "preview torn down");
    }
}
