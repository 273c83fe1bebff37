use std::sync::Arc;

use preview_core_types::{EventSink, GenerationId, PreviewEvent};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::storage::SessionStorage;

struct SessionInner {
    generation: GenerationId,
    extension_id: String,
    storage: Arc<SessionStorage>,
    events: EventSink,
    alive: CancellationToken,
}

/// State shared by every context of one mounted generation. Passed explicitly, never global.
#[derive(Clone)]
pub struct PreviewSession {
    inner: Arc<SessionInner>,
}

impl PreviewSession {
    pub fn new(generation: GenerationId, events: EventSink) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                generation,
                extension_id: format!("preview-{generation}"),
                storage: Arc::new(SessionStorage::new()),
                events,
                alive: CancellationToken::new(),
            }),
        }
    }

    pub fn generation(&self) -> GenerationId {
        self.inner.generation
    }

    pub fn extension_id(&self) -> &str {
        &self.inner.extension_id
    }

    pub fn storage(&self) -> &Arc<SessionStorage> {
        &self.inner.storage
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    pub fn publish(&self, event: PreviewEvent) {
        let name = event.name();
        if self.inner.events.send(event).is_err() {
            trace!(target: "capability-shim", event = name, "no event subscribers");
        }
    }

    /// Token cancelled when the session ends; contexts derive child tokens from it.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.alive.child_token()
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.alive.is_cancelled()
    }

    pub fn close(&self) {
        self.inner.alive.cancel();
    }
}
