use preview_core_types::{ExecutionWorld, InjectionStrategy, PageTarget};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionAttempt {
    pub strategy: InjectionStrategy,
    pub world: ExecutionWorld,
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub elapsed_ms: u64,
}

impl InjectionAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }

    pub fn describe(&self) -> String {
        format!("{}/{}: {}", self.world, self.strategy, self.detail)
    }
}

/// A successful injection and the attempts it took.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InjectionReport {
    pub target: PageTarget,
    pub world: ExecutionWorld,
    pub strategy: InjectionStrategy,
    pub attempts: Vec<InjectionAttempt>,
}

/// Every strategy failed for this target.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{explanation}")]
pub struct InjectionBlocked {
    pub target: PageTarget,
    pub attempts: Vec<InjectionAttempt>,
    pub known_restricted: bool,
    pub explanation: String,
}

impl InjectionBlocked {
    pub fn new(target: PageTarget, attempts: Vec<InjectionAttempt>, known_restricted: bool) -> Self {
        let url = target.url_or_blank().to_string();
        let explanation = if known_restricted {
            format!(
                "{url} is a protected browser page; extensions are never allowed to run scripts there."
            )
        } else {
            format!(
                "{url} blocked every injection method; its content security policy most likely forbids injected scripts."
            )
        };
        Self {
            target,
            attempts,
            known_restricted,
            explanation,
        }
    }

    /// Inline explanation for the preview UI, including the attempt history.
    pub fn user_message(&self) -> String {
        let tried = self
            .attempts
            .iter()
            .map(InjectionAttempt::describe)
            .collect::<Vec<_>>()
            .join("; ");
        let fallback = if self.known_restricted {
            "Open a regular web page and rebuild the preview."
        } else {
            "Try the installed extension instead: download the bundle and load it unpacked to test on this page."
        };
        format!("{} Tried: {tried}. {fallback}", self.explanation)
    }
}
