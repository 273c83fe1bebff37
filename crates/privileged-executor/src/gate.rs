//! Per-target injection state. Messages for a tab wait until its content script settles.

use std::time::Duration;

use dashmap::DashMap;
use preview_core_types::{ExecutionWorld, TargetId};
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectionState {
    Pending,
    /// Injected; the page-side message shim lives in this world.
    Ready(ExecutionWorld),
    Blocked(String),
}

#[derive(Default)]
pub struct InjectionGates {
    gates: DashMap<TargetId, watch::Sender<InjectionState>>,
}

impl InjectionGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, target: &TargetId, state: InjectionState) {
        match self.gates.get(target) {
            Some(gate) => {
                gate.send_replace(state);
            }
            None => {
                let (tx, _rx) = watch::channel(state);
                self.gates.insert(target.clone(), tx);
            }
        }
    }

    pub fn state(&self, target: &TargetId) -> Option<InjectionState> {
        self.gates.get(target).map(|gate| gate.borrow().clone())
    }

    /// Waits until the target leaves `Pending`. `None` when nothing was ever injected into
    /// the target or `timeout` elapsed first.
    pub async fn settled(&self, target: &TargetId, timeout: Duration) -> Option<InjectionState> {
        let mut rx = self.gates.get(target).map(|gate| gate.subscribe())?;
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state != InjectionState::Pending)
                .await
                .map(|state| state.clone())
                .ok()
        })
        .await;
        waited.ok().flatten()
    }

    pub fn clear(&self) -> usize {
        let count = self.gates.len();
        self.gates.clear();
        count
    }
}
