//! Layered content-script injection into a live foreign page.
//!
//! Content-restriction policies of arbitrary pages are unknowable up front, so the injector
//! walks a fixed ladder of `(world, strategy)` steps, verifying each attempt, and stops at the
//! first one that provably ran the code. Every attempt is recorded and published.

pub mod policy;
pub mod report;
pub mod restricted;
pub mod rewrite;
pub mod strategy;

pub use policy::{InjectionPolicy, InjectionStep};
pub use report::{AttemptOutcome, InjectionAttempt, InjectionBlocked, InjectionReport};
pub use restricted::is_known_restricted;
pub use rewrite::{prepare_content_script, PreparedScript, BRIDGE_BINDING};

use std::sync::Arc;

use preview_core_types::{
    EventSink, HostPlatform, InjectionRequest, PageTarget, PreviewEvent,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct ContentInjector {
    host: Arc<dyn HostPlatform>,
    policy: InjectionPolicy,
    events: EventSink,
}

impl ContentInjector {
    pub fn new(host: Arc<dyn HostPlatform>, policy: InjectionPolicy, events: EventSink) -> Self {
        Self {
            host,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &InjectionPolicy {
        &self.policy
    }

    /// Runs the injection ladder for `script` against `target`.
    pub async fn inject(
        &self,
        target: &PageTarget,
        script: &PreparedScript,
    ) -> Result<InjectionReport, InjectionBlocked> {
        let mut attempts = Vec::with_capacity(self.policy.steps.len());
        for step in &self.policy.steps {
            let attempt = self.attempt(target, script, *step).await;
            let success = attempt.succeeded();
            let _ = self.events.send(PreviewEvent::InjectionAttempted {
                target: target.id.clone(),
                strategy: attempt.strategy,
                world: attempt.world,
                success,
                detail: attempt.detail.clone(),
            });
            attempts.push(attempt);
            if success {
                info!(
                    target: "content-injection",
                    page = %target.id,
                    world = %step.world,
                    strategy = %step.strategy,
                    attempts = attempts.len(),
                    "content script injected"
                );
                let _ = self.events.send(PreviewEvent::InjectionSucceeded {
                    target: target.id.clone(),
                    strategy: step.strategy,
                    world: step.world,
                });
                return Ok(InjectionReport {
                    target: target.clone(),
                    world: step.world,
                    strategy: step.strategy,
                    attempts,
                });
            }
        }

        let known_restricted =
            is_known_restricted(target.url_or_blank(), &self.policy.restricted_patterns);
        let blocked = InjectionBlocked::new(target.clone(), attempts, known_restricted);
        warn!(
            target: "content-injection",
            page = %target.id,
            url = %target.url_or_blank(),
            attempts = blocked.attempts.len(),
            known_restricted,
            "injection blocked"
        );
        let _ = self.events.send(PreviewEvent::InjectionBlocked {
            target: target.id.clone(),
            attempts: blocked.attempts.len(),
            known_restricted,
            explanation: blocked.explanation.clone(),
        });
        Err(blocked)
    }

    async fn attempt(
        &self,
        target: &PageTarget,
        script: &PreparedScript,
        step: InjectionStep,
    ) -> InjectionAttempt {
        let code = strategy::wrap(step.strategy, script);
        let request = InjectionRequest {
            target,
            world: step.world,
            strategy: step.strategy,
            code: &code,
        };
        let started = Instant::now();
        let timeout = self.policy.attempt_timeout();
        let (outcome, detail) = match tokio::time::timeout(timeout, self.host.inject_code(request)).await
        {
            Ok(Ok(Value::Bool(true))) => (AttemptOutcome::Success, "verified".to_string()),
            Ok(Ok(other)) => (
                AttemptOutcome::Failure,
                format!("code did not run (verification returned {other})"),
            ),
            Ok(Err(err)) => (AttemptOutcome::Failure, err.message),
            Err(_) => (
                AttemptOutcome::Failure,
                format!("timed out after {}ms", timeout.as_millis()),
            ),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            target: "content-injection",
            page = %target.id,
            world = %step.world,
            strategy = %step.strategy,
            ?outcome,
            %detail,
            elapsed_ms,
            "injection attempt"
        );
        InjectionAttempt {
            strategy: step.strategy,
            world: step.world,
            outcome,
            detail,
            elapsed_ms,
        }
    }
}
