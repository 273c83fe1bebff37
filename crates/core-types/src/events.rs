//! Telemetry events surfaced to the collaborator UI.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    ContextKind, ErrorCode, ExecutionWorld, GenerationId, InjectionStrategy, TargetId,
};

/// Broadcast sender every component publishes on.
pub type EventSink = broadcast::Sender<PreviewEvent>;

pub fn event_sink(capacity: usize) -> (EventSink, broadcast::Receiver<PreviewEvent>) {
    broadcast::channel(capacity.max(1))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PreviewEvent {
    BundleMounted {
        generation: GenerationId,
        files: usize,
        handles: usize,
    },
    BundleTornDown {
        generation: GenerationId,
        revoked: usize,
    },
    ContextStarted {
        generation: GenerationId,
        context: ContextKind,
    },
    ContextStopped {
        generation: GenerationId,
        context: ContextKind,
    },
    ContextError {
        generation: GenerationId,
        context: ContextKind,
        message: String,
    },
    InstalledFired {
        generation: GenerationId,
    },
    CapabilityFailed {
        context: ContextKind,
        capability: String,
        method: String,
        code: ErrorCode,
        message: String,
    },
    InjectionAttempted {
        target: TargetId,
        strategy: InjectionStrategy,
        world: ExecutionWorld,
        success: bool,
        detail: String,
    },
    InjectionSucceeded {
        target: TargetId,
        strategy: InjectionStrategy,
        world: ExecutionWorld,
    },
    InjectionBlocked {
        target: TargetId,
        attempts: usize,
        known_restricted: bool,
        explanation: String,
    },
    NotificationShown {
        context: ContextKind,
        id: String,
        title: String,
        message: String,
    },
    BadgeUpdated {
        context: ContextKind,
        text: String,
    },
    Log {
        context: ContextKind,
        level: LogLevel,
        message: String,
    },
}

impl PreviewEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PreviewEvent::BundleMounted { .. } => "bundle_mounted",
            PreviewEvent::BundleTornDown { .. } => "bundle_torn_down",
            PreviewEvent::ContextStarted { .. } => "context_started",
            PreviewEvent::ContextStopped { .. } => "context_stopped",
            PreviewEvent::ContextError { .. } => "context_error",
            PreviewEvent::InstalledFired { .. } => "installed_fired",
            PreviewEvent::CapabilityFailed { .. } => "capability_failed",
            PreviewEvent::InjectionAttempted { .. } => "injection_attempted",
            PreviewEvent::InjectionSucceeded { .. } => "injection_succeeded",
            PreviewEvent::InjectionBlocked { .. } => "injection_blocked",
            PreviewEvent::NotificationShown { .. } => "notification_shown",
            PreviewEvent::BadgeUpdated { .. } => "badge_updated",
            PreviewEvent::Log { .. } => "log",
        }
    }
}
