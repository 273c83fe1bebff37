//! Numeric tab ids handed to simulated contexts, mapped to host targets.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use preview_core_types::{PageTarget, TargetId};
use serde_json::{json, Value};

pub struct TabDirectory {
    next: AtomicU64,
    by_id: DashMap<u64, PageTarget>,
    by_target: DashMap<TargetId, u64>,
}

impl Default for TabDirectory {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            by_id: DashMap::new(),
            by_target: DashMap::new(),
        }
    }
}

impl TabDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tab id for `target`, allocating one the first time the target is seen.
    /// Url and title are refreshed on every call.
    pub fn register(&self, target: &PageTarget) -> u64 {
        let id = *self
            .by_target
            .entry(target.id.clone())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::SeqCst));
        self.by_id.insert(id, target.clone());
        id
    }

    pub fn lookup(&self, id: u64) -> Option<PageTarget> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    pub fn id_of(&self, target: &TargetId) -> Option<u64> {
        self.by_target.get(target).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The `tabs.Tab` shape returned to extension code.
    pub fn describe(&self, id: u64, target: &PageTarget, active: bool) -> Value {
        json!({
            "id": id,
            "windowId": 1,
            "active": active,
            "url": target.url,
            "title": target.title,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_per_target() {
        let tabs = TabDirectory::new();
        let a = PageTarget::new("A", Some("https://a.test/".into()));
        let b = PageTarget::new("B", None);
        assert_eq!(tabs.register(&a), 1);
        assert_eq!(tabs.register(&b), 2);

        let moved = PageTarget::new("A", Some("https://a.test/next".into()));
        assert_eq!(tabs.register(&moved), 1);
        assert_eq!(tabs.lookup(1).unwrap().url.as_deref(), Some("https://a.test/next"));
        assert_eq!(tabs.id_of(&TargetId("B".into())), Some(2));
        assert!(tabs.lookup(3).is_none());
        assert_eq!(tabs.len(), 2);
    }
}
