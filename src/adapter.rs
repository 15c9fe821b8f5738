//! §4.F Store Adapter contract: the engine's view of the host application.
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use troparcel_crdt::PhotoChecksum;

#[derive(Clone, Debug)]
pub struct ItemSummary {
    pub local_id: String,
    pub photo_checksums: BTreeSet<PhotoChecksum>,
}

#[derive(Clone, Debug, Default)]
pub struct SelectionItem {
    pub key: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// `selectionMeta`: property/text pairs scoped to this selection.
    pub meta: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default)]
pub struct TranscriptionItem {
    pub key: String,
    pub text: String,
    pub selection: Option<String>,
}

/// An ontology entry the host exposes for `templates` push (§3.2, optional).
#[derive(Clone, Debug, Default)]
pub struct TemplateItem {
    pub uri: String,
    pub label: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default)]
pub struct Item {
    pub local_id: String,
    pub photo_checksums: BTreeSet<PhotoChecksum>,
    pub metadata: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub notes: Vec<(String, String)>,
    pub selections: Vec<SelectionItem>,
    /// `selectionNotes`, keyed by the selection they annotate.
    pub selection_notes: Vec<(String, String)>,
    pub transcriptions: Vec<TranscriptionItem>,
    pub list_memberships: Vec<String>,
}

/// A host-native write intent. The adapter is free to interpret the
/// payload however its own action-dispatch mechanism requires; the engine
/// only ever constructs and dispatches these, never inspects host state
/// directly.
#[derive(Clone, Debug)]
pub enum Action {
    SetMetadata { local_id: String, property: String, text: String },
    UpsertNote { local_id: String, key: String, html: String },
    RetractNote { local_id: String, key: String },
    UpsertSelection { local_id: String, key: String, x: i32, y: i32, w: i32, h: i32 },
    SetSelectionMeta { local_id: String, selection_key: String, property: String, text: String },
    UpsertSelectionNote { local_id: String, selection_key: String, html: String },
    RetractSelectionNote { local_id: String, selection_key: String },
    UpsertTranscription { local_id: String, key: String, text: String, selection: Option<String> },
    RetractTranscription { local_id: String, key: String },
    SetTag { local_id: String, name: String, active: bool },
    SetListMembership { local_id: String, list_key: String, member: bool },
}

pub trait StoreAdapter: Send + Sync {
    fn list_items(&self) -> anyhow::Result<Vec<ItemSummary>>;
    fn read_item(&self, local_id: &str) -> anyhow::Result<Item>;
    fn list_tags(&self) -> anyhow::Result<Vec<String>>;
    fn list_lists(&self) -> anyhow::Result<Vec<String>>;
    fn list_templates(&self) -> anyhow::Result<Vec<TemplateItem>>;

    fn dispatch(&self, action: Action) -> anyhow::Result<()>;

    /// Dispatch with local-change detection gated off for the duration of
    /// the call (§4.F). Implementations must ensure `subscribe` callbacks
    /// are not fired while this executes.
    fn dispatch_suppressed(&self, action: Action) -> anyhow::Result<()>;

    /// Registers `callback` to fire on any relevant host state change.
    /// Returns an unsubscribe handle.
    fn subscribe(&self, callback: Arc<dyn Fn() + Send + Sync>) -> Unsubscribe;

    fn suppress_changes(&self) -> SuppressGuard;
}

pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn call(self) {
        (self.0)()
    }
}

/// A refcounted, nestable suppression guard: `suppress_changes` may be
/// called re-entrantly (engine push and apply cycles can overlap in
/// corner cases), and suppression only lifts once every guard has been
/// dropped (§4.F: "nested safely (refcount, not boolean)").
#[derive(Clone, Default)]
pub struct SuppressCounter(Arc<Mutex<u32>>);

impl SuppressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suppressed(&self) -> bool {
        *self.0.lock() > 0
    }

    pub fn enter(&self) -> SuppressGuard {
        *self.0.lock() += 1;
        SuppressGuard { counter: self.0.clone() }
    }
}

pub struct SuppressGuard {
    counter: Arc<Mutex<u32>>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        let mut count = self.counter.lock();
        *count = count.saturating_sub(1);
    }
}

/// An in-memory double used in engine tests (§9: plain composition,
/// no cyclic owner graph — this holds its own state and nothing else
/// points back into it except via the typed `Action`/callback API).
pub mod memory {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Inner {
        items: HashMap<String, Item>,
        callbacks: Vec<(u64, Arc<dyn Fn() + Send + Sync>)>,
        next_callback_id: u64,
        dispatched: Vec<Action>,
    }

    #[derive(Clone)]
    pub struct MemoryAdapter {
        inner: Arc<Mutex<Inner>>,
        suppress: SuppressCounter,
    }

    impl Default for MemoryAdapter {
        fn default() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Inner::default())),
                suppress: SuppressCounter::new(),
            }
        }
    }

    impl MemoryAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_item(&self, item: Item) {
            self.inner.lock().items.insert(item.local_id.clone(), item);
        }

        pub fn notify(&self) {
            if self.suppress.is_suppressed() {
                return;
            }
            let callbacks: Vec<_> = self.inner.lock().callbacks.iter().map(|(_, f)| f.clone()).collect();
            for callback in callbacks {
                callback();
            }
        }

        pub fn dispatched_actions(&self) -> Vec<Action> {
            self.inner.lock().dispatched.clone()
        }
    }

    impl StoreAdapter for MemoryAdapter {
        fn list_items(&self) -> anyhow::Result<Vec<ItemSummary>> {
            Ok(self
                .inner
                .lock()
                .items
                .values()
                .map(|i| ItemSummary {
                    local_id: i.local_id.clone(),
                    photo_checksums: i.photo_checksums.clone(),
                })
                .collect())
        }

        fn read_item(&self, local_id: &str) -> anyhow::Result<Item> {
            self.inner
                .lock()
                .items
                .get(local_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such item: {}", local_id))
        }

        fn list_tags(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }

        fn list_lists(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }

        fn list_templates(&self) -> anyhow::Result<Vec<TemplateItem>> {
            Ok(vec![])
        }

        fn dispatch(&self, action: Action) -> anyhow::Result<()> {
            self.inner.lock().dispatched.push(action);
            self.notify();
            Ok(())
        }

        fn dispatch_suppressed(&self, action: Action) -> anyhow::Result<()> {
            let _guard = self.suppress.enter();
            self.inner.lock().dispatched.push(action);
            Ok(())
        }

        fn subscribe(&self, callback: Arc<dyn Fn() + Send + Sync>) -> Unsubscribe {
            let mut inner = self.inner.lock();
            let id = inner.next_callback_id;
            inner.next_callback_id += 1;
            inner.callbacks.push((id, callback));
            let weak = self.inner.clone();
            Unsubscribe(Box::new(move || {
                weak.lock().callbacks.retain(|(cid, _)| *cid != id);
            }))
        }

        fn suppress_changes(&self) -> SuppressGuard {
            self.suppress.enter()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryAdapter;
    use super::*;

    #[test]
    fn suppress_changes_nests_via_refcount() {
        let counter = SuppressCounter::new();
        let outer = counter.enter();
        assert!(counter.is_suppressed());
        let inner = counter.enter();
        drop(inner);
        assert!(counter.is_suppressed(), "still held by outer guard");
        drop(outer);
        assert!(!counter.is_suppressed());
    }

    #[test]
    fn dispatch_suppressed_does_not_fire_subscribers() {
        let adapter = MemoryAdapter::new();
        let fired = Arc::new(Mutex::new(false));
        let fired2 = fired.clone();
        let _unsub = adapter.subscribe(Arc::new(move || *fired2.lock() = true));

        adapter
            .dispatch_suppressed(Action::SetTag {
                local_id: "1".into(),
                name: "x".into(),
                active: true,
            })
            .unwrap();
        assert!(!*fired.lock());

        adapter
            .dispatch(Action::SetTag {
                local_id: "1".into(),
                name: "x".into(),
                active: true,
            })
            .unwrap();
        assert!(*fired.lock());
    }
}
