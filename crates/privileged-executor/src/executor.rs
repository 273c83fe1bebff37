use std::sync::Arc;

use bundle_store::{any_pattern_matches, MountedBundle};
use capability_shim::builtins::arg;
use capability_shim::{DeliveryEnvelope, MessageSender, PreviewSession, StorageArea, StorageQuery};
use content_injection::{prepare_content_script, ContentInjector, InjectionReport};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use preview_core_types::{
    ContextKind, ErrorCode, ExecutionWorld, HostError, HostPlatform, InjectionRequest,
    InjectionStrategy, PageMessage, PageMessageKind, PageTarget,
};
use rpc_broker::{ChannelEnd, RpcEndpoint, RpcError, RpcRequest};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gate::{InjectionGates, InjectionState};
use crate::link::ContextLink;
use crate::tabs::TabDirectory;
use crate::{ExecError, ExecutorConfig, StorageBackend};

pub(crate) struct ExecInner {
    host: Arc<dyn HostPlatform>,
    injector: ContentInjector,
    bundle: MountedBundle,
    session: PreviewSession,
    config: ExecutorConfig,
    links: DashMap<ContextKind, RpcEndpoint>,
    gates: InjectionGates,
    tabs: TabDirectory,
    alive: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Serves forwarded calls for every context of one mounted generation.
#[derive(Clone)]
pub struct PrivilegedExecutor {
    inner: Arc<ExecInner>,
}

impl PrivilegedExecutor {
    pub fn new(
        host: Arc<dyn HostPlatform>,
        bundle: MountedBundle,
        session: PreviewSession,
        config: ExecutorConfig,
    ) -> Self {
        let injector = ContentInjector::new(
            host.clone(),
            config.injection.clone(),
            session.events().clone(),
        );
        let alive = session.child_token();
        Self {
            inner: Arc::new(ExecInner {
                host,
                injector,
                bundle,
                session,
                config,
                links: DashMap::new(),
                gates: InjectionGates::new(),
                tabs: TabDirectory::new(),
                alive,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ExecInner>) -> Self {
        Self { inner }
    }

    pub fn host(&self) -> &Arc<dyn HostPlatform> {
        &self.inner.host
    }

    pub fn bundle(&self) -> &MountedBundle {
        &self.inner.bundle
    }

    pub fn session(&self) -> &PreviewSession {
        &self.inner.session
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn tabs(&self) -> &TabDirectory {
        &self.inner.tabs
    }

    pub fn gates(&self) -> &InjectionGates {
        &self.inner.gates
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.alive.is_cancelled()
    }

    /// The active page, registered in the tab directory.
    pub async fn find_active_target(&self) -> Result<PageTarget, ExecError> {
        let target = self
            .inner
            .host
            .find_active_target()
            .await?
            .ok_or(ExecError::NoActiveTarget)?;
        self.inner.tabs.register(&target);
        Ok(target)
    }

    fn backend_for(&self, area: StorageArea) -> StorageBackend {
        match area {
            StorageArea::Session => StorageBackend::Session,
            _ => self.inner.config.storage,
        }
    }

    pub async fn read_storage(
        &self,
        area: StorageArea,
        query: &StorageQuery,
    ) -> Result<Map<String, Value>, ExecError> {
        match self.backend_for(area) {
            StorageBackend::Session => Ok(self.inner.session.storage().get(area, query)),
            StorageBackend::Host => {
                let keys = match query {
                    StorageQuery::All => None,
                    StorageQuery::Keys(keys) => Some(keys.clone()),
                    StorageQuery::Defaults(defaults) => Some(defaults.keys().cloned().collect()),
                };
                let mut found = self.inner.host.read_storage(keys).await?;
                if let StorageQuery::Defaults(defaults) = query {
                    for (key, default) in defaults {
                        found.entry(key.clone()).or_insert_with(|| default.clone());
                    }
                }
                Ok(found)
            }
        }
    }

    pub async fn write_storage(
        &self,
        area: StorageArea,
        entries: Map<String, Value>,
    ) -> Result<(), ExecError> {
        match self.backend_for(area) {
            StorageBackend::Session => {
                let changes = self.inner.session.storage().set(area, entries);
                debug!(target: "privileged-executor", area = %area, changed = changes.len(), "storage written");
                Ok(())
            }
            StorageBackend::Host => Ok(self.inner.host.write_storage(entries).await?),
        }
    }

    /// Evaluates `code` in `world` of `target` and returns its completion value.
    pub async fn inject_code(
        &self,
        target: &PageTarget,
        code: &str,
        world: ExecutionWorld,
    ) -> Result<Value, ExecError> {
        let timeout = self.inner.injector.policy().attempt_timeout();
        let request = InjectionRequest {
            target,
            world,
            strategy: InjectionStrategy::FunctionEval,
            code,
        };
        match tokio::time::timeout(timeout, self.inner.host.inject_code(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExecError::Host(HostError::new(
                ErrorCode::RpcTimeout,
                format!("code evaluation timed out after {}ms", timeout.as_millis()),
            ))),
        }
    }

    /// Hands `payload` to the page-side message shim of `target` once its content script
    /// has settled.
    pub async fn relay_to_foreign_context(
        &self,
        target: &PageTarget,
        payload: Value,
    ) -> Result<Value, ExecError> {
        if self.inner.gates.state(&target.id).is_none() {
            return Err(ExecError::NoReceiver);
        }
        let started = Instant::now();
        let state = self
            .inner
            .gates
            .settled(&target.id, self.inner.config.broker.call_timeout())
            .await;
        match state {
            Some(InjectionState::Ready(world)) => {
                Ok(self.inner.host.relay_to_page(target, world, payload).await?)
            }
            Some(InjectionState::Blocked(reason)) => Err(ExecError::Host(HostError::new(
                ErrorCode::InjectionBlocked,
                reason,
            ))),
            Some(InjectionState::Pending) => Err(ExecError::NoReceiver),
            None => Err(ExecError::Rpc(RpcError::Timeout {
                label: "tabs.sendMessage".to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })),
        }
    }

    /// Content-script files declared for `url`, in declaration order, each once.
    pub fn content_script_files(&self, url: &str) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for decl in &self.inner.bundle.entry_surfaces().content_scripts {
            if !any_pattern_matches(&decl.matches, url) {
                continue;
            }
            for file in decl.normalized_files() {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
        files
    }

    /// Runs the layered injector for `files` and records the outcome for `target`.
    pub async fn inject_files(
        &self,
        target: &PageTarget,
        files: &[String],
    ) -> Result<InjectionReport, ExecError> {
        let previous = self.inner.gates.state(&target.id);
        if previous.is_none() {
            self.inner.gates.set(&target.id, InjectionState::Pending);
        }
        let prepared = match prepare_content_script(
            &self.inner.bundle,
            self.inner.session.extension_id(),
            files,
        ) {
            Ok(prepared) => prepared,
            Err(err) => {
                if previous.is_none() {
                    self.inner
                        .gates
                        .set(&target.id, InjectionState::Blocked(err.to_string()));
                }
                return Err(err.into());
            }
        };
        match self.inner.injector.inject(target, &prepared).await {
            Ok(report) => {
                self.inner
                    .gates
                    .set(&target.id, InjectionState::Ready(report.world));
                Ok(report)
            }
            Err(blocked) => {
                if !matches!(previous, Some(InjectionState::Ready(_))) {
                    self.inner
                        .gates
                        .set(&target.id, InjectionState::Blocked(blocked.user_message()));
                }
                Err(ExecError::InjectionBlocked(Box::new(blocked)))
            }
        }
    }

    /// Injects the declared content scripts matching `target` in the background. Messages to
    /// the target wait for the outcome. Returns `false` when nothing matches the page.
    pub fn spawn_content_injection(&self, target: PageTarget) -> bool {
        let files = self.content_script_files(target.url_or_blank());
        if files.is_empty() {
            debug!(target: "privileged-executor", page = %target.id, url = %target.url_or_blank(), "no content script matches page");
            return false;
        }
        self.inner.tabs.register(&target);
        self.inner.gates.set(&target.id, InjectionState::Pending);
        let executor = self.clone();
        let alive = self.inner.alive.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = alive.cancelled() => {}
                outcome = executor.inject_files(&target, &files) => {
                    if let Err(err) = outcome {
                        warn!(target: "privileged-executor", page = %target.id, %err, "content script injection failed");
                    }
                }
            }
        });
        self.track_task(task);
        true
    }

    /// Delivers a runtime message to every attached context other than `origin`.
    ///
    /// The first non-null reply wins. A null reply from a context with listeners resolves to
    /// `null`; with no listening context at all the call fails with
    /// [`ExecError::NoReceiver`].
    pub async fn deliver_runtime_message(
        &self,
        origin: ContextKind,
        message: Value,
        sender: MessageSender,
    ) -> Result<Value, ExecError> {
        let receivers: Vec<(ContextKind, RpcEndpoint)> = self
            .inner
            .links
            .iter()
            .filter(|entry| *entry.key() != origin)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        if receivers.is_empty() {
            return Err(ExecError::NoReceiver);
        }
        let envelope = serde_json::to_value(DeliveryEnvelope { message, sender })
            .map_err(|err| ExecError::invalid_args("runtime.sendMessage", err.to_string()))?;

        let mut inflight: FuturesUnordered<_> = receivers
            .into_iter()
            .map(|(kind, endpoint)| {
                let envelope = envelope.clone();
                async move { (kind, endpoint.deliver(envelope).await) }
            })
            .collect();

        let mut answered = false;
        let mut failure: Option<RpcError> = None;
        while let Some((kind, outcome)) = inflight.next().await {
            match outcome {
                Ok(Value::Null) => answered = true,
                Ok(value) => {
                    debug!(target: "privileged-executor", from = %origin, to = %kind, "runtime message answered");
                    return Ok(value);
                }
                Err(RpcError::Remote(remote))
                    if remote.code_or_internal() == ErrorCode::CapabilityUnavailable =>
                {
                    debug!(target: "privileged-executor", to = %kind, "no message listeners");
                }
                Err(err) => {
                    warn!(target: "privileged-executor", to = %kind, %err, "runtime message delivery failed");
                    failure.get_or_insert(err);
                }
            }
        }
        if answered {
            Ok(Value::Null)
        } else if let Some(err) = failure {
            Err(err.into())
        } else {
            Err(ExecError::NoReceiver)
        }
    }

    /// Serves one forwarded call from `origin`.
    pub async fn handle_call(
        &self,
        origin: ContextKind,
        request: RpcRequest,
    ) -> Result<Value, ExecError> {
        if !self.is_alive() {
            return Err(ExecError::Stopped);
        }
        let RpcRequest {
            capability,
            method,
            args,
            ..
        } = request;
        match (capability.as_str(), method.as_str()) {
            ("tabs", "query") => self.tabs_query().await,
            ("tabs", "sendMessage") => self.tabs_send_message(origin, &args).await,
            ("scripting", "executeScript") => self.execute_script(&args).await,
            ("runtime", "sendMessage") => {
                let message = self.runtime_message_arg(&args);
                let sender = MessageSender::context(origin).with_id(self.inner.session.extension_id());
                self.deliver_runtime_message(origin, message, sender).await
            }
            (namespace, method) if namespace.starts_with("storage.") => {
                self.serve_storage(namespace, method, &args).await
            }
            (namespace, method) => Err(ExecError::unsupported(namespace, method)),
        }
    }

    async fn tabs_query(&self) -> Result<Value, ExecError> {
        match self.find_active_target().await {
            Ok(target) => {
                let id = self.inner.tabs.register(&target);
                Ok(Value::Array(vec![self.inner.tabs.describe(id, &target, true)]))
            }
            Err(ExecError::NoActiveTarget) => Ok(Value::Array(Vec::new())),
            Err(err) => Err(err),
        }
    }

    async fn tabs_send_message(&self, origin: ContextKind, args: &Value) -> Result<Value, ExecError> {
        let tab_id = arg(args, 0)
            .as_u64()
            .ok_or_else(|| ExecError::invalid_args("tabs.sendMessage", "tabId must be a number"))?;
        let target = self
            .inner
            .tabs
            .lookup(tab_id)
            .ok_or(ExecError::NoSuchTab(tab_id))?;
        let sender = MessageSender::context(origin).with_id(self.inner.session.extension_id());
        self.relay_to_foreign_context(&target, json!({"message": arg(args, 1), "sender": sender}))
            .await
    }

    async fn execute_script(&self, args: &Value) -> Result<Value, ExecError> {
        const CALL: &str = "scripting.executeScript";
        let details = match arg(args, 0) {
            Value::Object(details) => details,
            other => {
                return Err(ExecError::invalid_args(
                    CALL,
                    format!("expected an injection object, got {other}"),
                ))
            }
        };
        let tab_id = details
            .get("target")
            .and_then(|target| target.get("tabId"))
            .and_then(Value::as_u64)
            .ok_or_else(|| ExecError::invalid_args(CALL, "target.tabId is required"))?;
        let target = self
            .inner
            .tabs
            .lookup(tab_id)
            .ok_or(ExecError::NoSuchTab(tab_id))?;

        if let Some(files) = details.get("files") {
            let files = files
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|files| !files.is_empty())
                .ok_or_else(|| ExecError::invalid_args(CALL, "files must be a non-empty list"))?;
            self.inject_files(&target, &files).await?;
            return Ok(json!([{"frameId": 0, "result": null}]));
        }

        let func = details
            .get("func")
            .or_else(|| details.get("function"))
            .and_then(Value::as_str)
            .ok_or_else(|| ExecError::invalid_args(CALL, "either files or func is required"))?;
        let world = details
            .get("world")
            .and_then(Value::as_str)
            .and_then(ExecutionWorld::parse)
            .unwrap_or(ExecutionWorld::Isolated);
        let call_args = details.get("args").cloned().unwrap_or_else(|| json!([]));
        let code = format!("({func}).apply(null, {call_args})");
        let result = self.inject_code(&target, &code, world).await?;
        Ok(json!([{"frameId": 0, "result": result}]))
    }

    /// `runtime.sendMessage(message)` or `runtime.sendMessage(extensionId, message)`.
    fn runtime_message_arg(&self, args: &Value) -> Value {
        let first = arg(args, 0);
        let second = arg(args, 1);
        match &first {
            Value::String(id) if id == self.inner.session.extension_id() && !second.is_null() => {
                second
            }
            _ => first,
        }
    }

    async fn serve_storage(
        &self,
        namespace: &str,
        method: &str,
        args: &Value,
    ) -> Result<Value, ExecError> {
        let area = namespace
            .strip_prefix("storage.")
            .and_then(StorageArea::parse)
            .ok_or_else(|| ExecError::unsupported(namespace, method))?;
        match method {
            "get" => {
                let query = StorageQuery::from_arg(&arg(args, 0))
                    .map_err(|err| ExecError::invalid_args("storage.get", err.to_string()))?;
                Ok(Value::Object(self.read_storage(area, &query).await?))
            }
            "set" => {
                let items = match arg(args, 0) {
                    Value::Object(items) => items,
                    other => {
                        return Err(ExecError::invalid_args(
                            "storage.set",
                            format!("expected an object, got {other}"),
                        ))
                    }
                };
                self.write_storage(area, items).await?;
                Ok(Value::Null)
            }
            "remove" | "clear" if self.backend_for(area) == StorageBackend::Host => {
                Err(ExecError::unsupported(namespace, method))
            }
            "remove" => {
                let keys: Vec<String> = match arg(args, 0) {
                    Value::String(key) => vec![key],
                    Value::Array(items) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                };
                self.inner.session.storage().remove(area, &keys);
                Ok(Value::Null)
            }
            "clear" => {
                self.inner.session.storage().clear(area);
                Ok(Value::Null)
            }
            _ => Err(ExecError::unsupported(namespace, method)),
        }
    }

    /// Connects a simulated context. Replaces (and shuts down) an earlier link of the same kind.
    pub fn attach_context(&self, kind: ContextKind, end: ChannelEnd) -> RpcEndpoint {
        let handler = Arc::new(ContextLink::new(kind, Arc::downgrade(&self.inner)));
        let endpoint = RpcEndpoint::spawn(
            format!("executor:{kind}"),
            end,
            handler,
            self.inner.config.broker.clone(),
        );
        if let Some(previous) = self.inner.links.insert(kind, endpoint.clone()) {
            previous.shutdown();
        }
        info!(target: "privileged-executor", context = %kind, "context attached");
        endpoint
    }

    /// Disconnects a context, returning the number of pending deliveries rejected.
    pub fn detach_context(&self, kind: ContextKind) -> Option<usize> {
        self.inner
            .links
            .remove(&kind)
            .map(|(_, endpoint)| endpoint.shutdown())
    }

    pub fn attached(&self) -> Vec<ContextKind> {
        self.inner.links.iter().map(|entry| *entry.key()).collect()
    }

    /// Serves messages posted by injected page-side code until the host closes its page
    /// channel or the executor shuts down.
    pub fn start_page_inbox(&self) {
        let weak = Arc::downgrade(&self.inner);
        let host = self.inner.host.clone();
        let alive = self.inner.alive.clone();
        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = alive.cancelled() => break,
                    message = host.next_page_message() => message,
                };
                let Some(message) = message else {
                    debug!(target: "privileged-executor", "page channel closed");
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let executor = PrivilegedExecutor::from_inner(inner);
                tokio::spawn(async move { executor.serve_page_message(message).await });
            }
        });
        self.track_task(task);
    }

    pub async fn serve_page_message(&self, message: PageMessage) {
        let outcome = match message.kind {
            PageMessageKind::RuntimeMessage => {
                let tab_id = self.inner.tabs.register(&message.target);
                let sender = MessageSender::context(ContextKind::Page)
                    .with_id(self.inner.session.extension_id())
                    .with_tab(self.inner.tabs.describe(tab_id, &message.target, true))
                    .with_url(message.target.url_or_blank());
                self.deliver_runtime_message(ContextKind::Page, message.payload.clone(), sender)
                    .await
            }
            PageMessageKind::StorageGet => match StorageQuery::from_arg(&message.payload) {
                Ok(query) => self
                    .read_storage(StorageArea::Local, &query)
                    .await
                    .map(Value::Object),
                Err(err) => Err(ExecError::invalid_args("storage.get", err.to_string())),
            },
            PageMessageKind::StorageSet => match &message.payload {
                Value::Object(items) => self
                    .write_storage(StorageArea::Local, items.clone())
                    .await
                    .map(|_| Value::Null),
                other => Err(ExecError::invalid_args(
                    "storage.set",
                    format!("expected an object, got {other}"),
                )),
            },
        };
        let reply = outcome.map_err(|err| err.to_string());
        if let Err(err) = self.inner.host.reply_to_page(&message, reply).await {
            warn!(
                target: "privileged-executor",
                page = %message.target.id,
                reply_id = %message.reply_id,
                %err,
                "could not answer page message"
            );
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|running| !running.is_finished());
        tasks.push(task);
    }

    /// Background tasks (injections, page inbox) that have not finished yet.
    pub fn running_tasks(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|running| !running.is_finished());
        tasks.len()
    }

    /// Detaches every context, forgets injection state and stops background work.
    pub fn shutdown(&self) -> usize {
        if self.inner.alive.is_cancelled() && self.inner.links.is_empty() {
            return 0;
        }
        self.inner.alive.cancel();
        let mut rejected = 0;
        for entry in self.inner.links.iter() {
            rejected += entry.value().shutdown();
        }
        self.inner.links.clear();
        self.inner.gates.clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(target: "privileged-executor", rejected, "executor shut down");
        rejected
    }
}
