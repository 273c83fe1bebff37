use std::time::Duration;

use preview_core_types::{ExecutionWorld, InjectionStrategy};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionStep {
    pub world: ExecutionWorld,
    pub strategy: InjectionStrategy,
}

impl InjectionStep {
    pub const fn new(world: ExecutionWorld, strategy: InjectionStrategy) -> Self {
        Self { world, strategy }
    }

    /// main/function-eval, main/script-element, main/blob-script, isolated/function-eval.
    pub fn default_order() -> Vec<InjectionStep> {
        vec![
            InjectionStep::new(ExecutionWorld::Main, InjectionStrategy::FunctionEval),
            InjectionStep::new(ExecutionWorld::Main, InjectionStrategy::ScriptElement),
            InjectionStep::new(ExecutionWorld::Main, InjectionStrategy::BlobScript),
            InjectionStep::new(ExecutionWorld::Isolated, InjectionStrategy::FunctionEval),
        ]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InjectionPolicy {
    #[serde(default = "InjectionStep::default_order")]
    pub steps: Vec<InjectionStep>,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Match patterns treated as restricted in addition to the built-in list.
    #[serde(default)]
    pub restricted_patterns: Vec<String>,
}

fn default_attempt_timeout_ms() -> u64 {
    5_000
}

impl Default for InjectionPolicy {
    fn default() -> Self {
        Self {
            steps: InjectionStep::default_order(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            restricted_patterns: Vec::new(),
        }
    }
}

impl InjectionPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}
