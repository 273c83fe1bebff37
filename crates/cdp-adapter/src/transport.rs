use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 512;

/// Raw protocol event, with the flattened session it arrived on.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;

    async fn shutdown(&self) {}
}

/// Attaches to a running Chromium. The websocket is opened lazily and reopened after the
/// connection drops.
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Mutex<Option<Arc<Link>>>,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        Self {
            cfg,
            link: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CdpConfig {
        &self.cfg
    }

    async fn link(&self) -> Result<Arc<Link>, AdapterError> {
        let mut slot = self.link.lock().await;
        match slot.as_ref() {
            Some(link) if link.is_open() => return Ok(link.clone()),
            Some(_) => debug!(target: "cdp-transport", "devtools connection dropped, reattaching"),
            None => {}
        }
        let link = Arc::new(Link::open(self.cfg.websocket_url()).await?);
        *slot = Some(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        self.send_command(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            json!({ "discover": true }),
        )
        .await
        .map(|_| ())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let link = self.link.lock().await.clone()?;
        let event = link.events.lock().await.recv().await;
        event
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let link = self.link().await?;
        let (reply, response) = oneshot::channel();
        link.commands
            .send(Outgoing {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| AdapterError::io("devtools connection closed"))?;

        match tokio::time::timeout(self.cfg.command_timeout(), response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::io(format!("{method} dropped without a reply"))),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("{method} timed out"))
                .retriable(true)),
        }
    }

    async fn shutdown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close();
        }
    }
}

struct Outgoing {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, AdapterError>>,
}

type Pending = HashMap<CallId, oneshot::Sender<Result<Value, AdapterError>>>;

/// One live websocket and the task pumping it.
struct Link {
    commands: mpsc::Sender<Outgoing>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    pump: JoinHandle<()>,
    open: Arc<AtomicBool>,
}

impl Link {
    async fn open(ws_url: &str) -> Result<Self, AdapterError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| {
                AdapterError::io(format!("cannot reach {ws_url}: {err}")).retriable(true)
            })?;

        let (commands, outgoing) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let open = Arc::new(AtomicBool::new(true));
        let flag = open.clone();
        let pump = tokio::spawn(async move {
            if let Err(err) = drive(conn, outgoing, event_tx).await {
                warn!(target: "cdp-transport", %err, "devtools connection failed");
            }
            flag.store(false, Ordering::Release);
        });

        info!(target: "cdp-transport", url = %ws_url, "attached to browser");
        Ok(Self {
            commands,
            events: Mutex::new(events),
            pump,
            open,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.pump.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(
    mut conn: Connection<CdpEventMessage>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let mut pending: Pending = HashMap::new();
    loop {
        tokio::select! {
            Some(out) = outgoing.recv() => submit(&mut conn, out, &mut pending),
            incoming = conn.next() => match incoming {
                Some(Ok(Message::Response(resp))) => {
                    if let Some(reply) = pending.remove(&resp.id) {
                        let _ = reply.send(into_result(resp));
                    }
                }
                Some(Ok(Message::Event(event))) => match decode_event(event) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            debug!(target: "cdp-transport", "event receiver gone");
                        }
                    }
                    Err(err) => warn!(target: "cdp-transport", %err, "undecodable event"),
                },
                Some(Err(err)) => {
                    let err = from_cdp_error(err);
                    fail_pending(&mut pending, &err);
                    return Err(err);
                }
                None => {
                    fail_pending(&mut pending, &AdapterError::io("devtools connection closed"));
                    return Ok(());
                }
            },
        }
    }
}

fn submit(conn: &mut Connection<CdpEventMessage>, out: Outgoing, pending: &mut Pending) {
    let session = match out.target {
        CommandTarget::Browser => None,
        CommandTarget::Session(id) => Some(SessionId::from(id)),
    };
    let method: MethodId = out.method.clone().into();
    match conn.submit_command(method, session, out.params) {
        Ok(call) => {
            pending.insert(call, out.reply);
        }
        Err(err) => {
            let _ = out
                .reply
                .send(Err(AdapterError::io(format!("cannot send {}: {err}", out.method))));
        }
    }
}

fn fail_pending(pending: &mut Pending, err: &AdapterError) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(err.clone()));
    }
}

fn decode_event(event: CdpEventMessage) -> Result<TransportEvent, AdapterError> {
    let raw: CdpJsonEventMessage = event
        .try_into()
        .map_err(|err| AdapterError::internal(format!("cannot decode event: {err}")))?;
    Ok(TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    })
}

fn into_result(resp: Response) -> Result<Value, AdapterError> {
    if let Some(result) = resp.result {
        return Ok(result);
    }
    match resp.error {
        Some(error) => Err(protocol_error(error.code, &error.message)),
        None => Err(AdapterError::internal("response carried neither result nor error")),
    }
}

// Chromium reports unknown targets and sessions as invalid params (-32602).
fn protocol_error(code: i64, message: &str) -> AdapterError {
    let lower = message.to_ascii_lowercase();
    let kind = if code == -32602 && (lower.contains("target") || lower.contains("session")) {
        AdapterErrorKind::TargetNotFound
    } else {
        AdapterErrorKind::Internal
    };
    AdapterError::new(kind).with_hint(format!("protocol error {code}: {message}"))
}

fn from_cdp_error(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::Timeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::Serde(_) => AdapterError::internal(hint),
        _ => AdapterError::io(hint).retriable(true),
    }
}
