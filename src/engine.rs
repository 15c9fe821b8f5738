//! §4.G Sync Engine: push/apply orchestration, feedback-loop prevention,
//! debounce and safety-net.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use troparcel_crdt::doc::{
    ListNodeValue, ListValue, MetadataValue, NoteValue, SelectionValue, TagValue, TemplateValue,
    TranscriptionValue,
};
use troparcel_crdt::id::fuzzy_match;
use troparcel_crdt::lww::LwwMap;
use troparcel_crdt::orset::OrSet;
use troparcel_crdt::{Author, ItemBucket, ItemId, PhotoChecksum, PushSeq, ReplicatedDoc};

use crate::adapter::{Action, ItemSummary, StoreAdapter, SuppressCounter};
use crate::backup::{BackupEntry, BackupJournal, ValidationOutcome, Validator, ValidatorConfig};
use crate::config::EngineConfig;
use crate::sanitize::sanitize;
use crate::vault::Vault;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineState {
    Idle,
    WaitingForHost,
    Connecting,
    Ready,
    Syncing,
    Stopped,
}

/// Origin tag on a unit of work, replacing a bare re-entrancy boolean with
/// a tagged sum (§9 DESIGN NOTES).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Origin {
    Local,
    Remote,
    Attribution,
}

struct Shared {
    state: SyncMutex<EngineState>,
    doc: SyncMutex<ReplicatedDoc>,
    applying_remote: SyncMutex<bool>,
}

/// The per-peer synchronization engine. Owns the vault, backup journal,
/// suppression counter and document outright; nothing it owns holds a
/// reference back to the engine itself (§9: composition, not cyclic
/// owner graphs).
pub struct SyncEngine<A: StoreAdapter> {
    config: EngineConfig,
    adapter: Arc<A>,
    vault: Arc<AsyncMutex<Vault>>,
    backups: BackupJournal,
    validator: Validator,
    shared: Arc<Shared>,
    write_lock: Arc<AsyncMutex<()>>,
    suppress: SuppressCounter,
    safety_net_handle: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<A: StoreAdapter + 'static> SyncEngine<A> {
    pub fn new(config: EngineConfig, adapter: Arc<A>) -> Self {
        let vault = Vault::load(config.vault_path());
        let backups = BackupJournal::new(config.backups_dir(), config.max_backups);
        let validator = Validator::new(ValidatorConfig {
            max_note_size: config.max_note_size,
            max_metadata_size: config.max_metadata_size,
        });
        Self {
            suppress: SuppressCounter::new(),
            config,
            adapter,
            vault: Arc::new(AsyncMutex::new(vault)),
            backups,
            validator,
            shared: Arc::new(Shared {
                state: SyncMutex::new(EngineState::Idle),
                doc: SyncMutex::new(ReplicatedDoc::new(1)),
                applying_remote: SyncMutex::new(false),
            }),
            write_lock: Arc::new(AsyncMutex::new(())),
            safety_net_handle: SyncMutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    /// A diagnostics snapshot surfaced to the host's status UI (§7: "a
    /// short status surface").
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            room: self.config.room.clone(),
        }
    }

    fn transition(&self, to: EngineState) {
        let mut state = self.shared.state.lock();
        debug!(from = ?*state, to = ?to, "engine state transition");
        *state = to;
    }

    pub async fn start(self: &Arc<Self>) {
        if self.state() != EngineState::Idle {
            return;
        }
        self.transition(EngineState::WaitingForHost);
        self.transition(EngineState::Connecting);
        self.transition(EngineState::Ready);

        let engine = self.clone();
        let _unsub = self.adapter.subscribe(Arc::new(move || {
            engine.on_local_change();
        }));

        if let Some(interval) = self.config.safety_net_interval {
            if interval > Duration::ZERO {
                let engine = self.clone();
                let handle = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                    loop {
                        ticker.tick().await;
                        if engine.state() == EngineState::Stopped {
                            return;
                        }
                        engine.push().await;
                    }
                });
                *self.safety_net_handle.lock() = Some(handle);
            }
        }
    }

    /// Safeguard 1 (§4.G "Feedback loop prevention"): ignore change events
    /// entirely while a remote apply is in flight.
    fn on_local_change(self: &Arc<Self>) {
        if *self.shared.applying_remote.lock() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.config.debounce).await;
            engine.push().await;
        });
    }

    /// §4.G push cycle: diffs every local item's sub-collections against
    /// what this peer has already pushed, writes the changed fields into
    /// the shared document, and tombstones (or dismisses) keys this peer
    /// authored but has since removed locally.
    pub async fn push(self: &Arc<Self>) {
        if self.state() == EngineState::Stopped {
            return;
        }
        let _permit = self.write_lock.lock().await;
        self.transition(EngineState::Syncing);

        let items = match self.adapter.list_items() {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "push: failed to list items");
                self.transition(EngineState::Ready);
                return;
            }
        };

        let mut vault = self.vault.lock().await;
        let mut doc = self.shared.doc.lock();
        let author = Author::from(self.config.user_id.as_str());
        let now = now_unix_secs();

        for summary in items {
            let checksums: Vec<PhotoChecksum> = summary.photo_checksums.into_iter().collect();
            let Some(identity) = troparcel_crdt::compute_item_identity(&checksums) else {
                continue;
            };
            let Ok(item) = self.adapter.read_item(&summary.local_id) else {
                continue;
            };
            let identity_key = identity.to_string();

            // metadata: not authored, open to whichever write has the
            // higher (pushSeq, author).
            for (property, text) in &item.metadata {
                if troparcel_crdt::doc::is_local_only_property(property) {
                    continue;
                }
                let hash = content_hash(text);
                if !vault.has_local_edit(&identity_key, property, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                doc.get_or_create_item_bucket(identity).metadata.write(
                    property.clone(),
                    author.clone(),
                    push_seq,
                    MetadataValue {
                        text: text.clone(),
                        kind: "string".into(),
                        lang: None,
                    },
                );
                vault.mark_field_pushed(&identity_key, property, hash);
            }

            // notes (authored)
            let note_keys: HashSet<&str> = item.notes.iter().map(|(k, _)| k.as_str()).collect();
            for (key, html) in &item.notes {
                let field = format!("note:{key}");
                let hash = content_hash(html);
                if !vault.has_local_edit(&identity_key, &field, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                doc.get_or_create_item_bucket(identity).notes.write(
                    key.clone(),
                    author.clone(),
                    push_seq,
                    NoteValue {
                        html: html.clone(),
                        text: String::new(),
                        lang: None,
                        photo: None,
                        selection: None,
                    },
                );
                vault.mark_field_pushed(&identity_key, &field, hash);
                vault.record_original_author(key, &self.config.user_id);
            }
            {
                let bucket = doc.get_or_create_item_bucket(identity);
                detect_authored_deletions(&mut bucket.notes, &mut vault, &identity_key, "note:", &note_keys, &author, now);
            }

            // selections (authored) and their selectionMeta (not authored)
            let selection_keys: HashSet<&str> = item.selections.iter().map(|s| s.key.as_str()).collect();
            for sel in &item.selections {
                let field = format!("selection:{}", sel.key);
                let content = format!("{}:{}:{}:{}", sel.x, sel.y, sel.w, sel.h);
                let hash = content_hash(&content);
                if vault.has_local_edit(&identity_key, &field, &hash) {
                    let push_seq = PushSeq(vault.next_push_seq());
                    doc.get_or_create_item_bucket(identity).selections.write(
                        sel.key.clone(),
                        author.clone(),
                        push_seq,
                        SelectionValue {
                            x: sel.x,
                            y: sel.y,
                            w: sel.w,
                            h: sel.h,
                            angle: 0,
                            photo: None,
                        },
                    );
                    vault.mark_field_pushed(&identity_key, &field, hash);
                    vault.record_original_author(&sel.key, &self.config.user_id);
                }
                for (property, text) in &sel.meta {
                    let meta_field = format!("selection_meta:{}:{}", sel.key, property);
                    let hash = content_hash(text);
                    if !vault.has_local_edit(&identity_key, &meta_field, &hash) {
                        continue;
                    }
                    let push_seq = PushSeq(vault.next_push_seq());
                    doc.get_or_create_item_bucket(identity)
                        .selection_meta
                        .entry(sel.key.clone())
                        .or_default()
                        .write(
                            property.clone(),
                            author.clone(),
                            push_seq,
                            MetadataValue {
                                text: text.clone(),
                                kind: "string".into(),
                                lang: None,
                            },
                        );
                    vault.mark_field_pushed(&identity_key, &meta_field, hash);
                }
            }
            {
                let bucket = doc.get_or_create_item_bucket(identity);
                detect_authored_deletions(&mut bucket.selections, &mut vault, &identity_key, "selection:", &selection_keys, &author, now);
            }

            // selectionNotes (authored)
            let selection_note_keys: HashSet<&str> = item.selection_notes.iter().map(|(k, _)| k.as_str()).collect();
            for (sel_key, html) in &item.selection_notes {
                let field = format!("selection_note:{sel_key}");
                let hash = content_hash(html);
                if !vault.has_local_edit(&identity_key, &field, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                doc.get_or_create_item_bucket(identity).selection_notes.write(
                    sel_key.clone(),
                    author.clone(),
                    push_seq,
                    NoteValue {
                        html: html.clone(),
                        text: String::new(),
                        lang: None,
                        photo: None,
                        selection: Some(sel_key.clone()),
                    },
                );
                vault.mark_field_pushed(&identity_key, &field, hash);
                vault.record_original_author(sel_key, &self.config.user_id);
            }
            {
                let bucket = doc.get_or_create_item_bucket(identity);
                detect_authored_deletions(
                    &mut bucket.selection_notes,
                    &mut vault,
                    &identity_key,
                    "selection_note:",
                    &selection_note_keys,
                    &author,
                    now,
                );
            }

            // transcriptions (authored)
            let transcription_keys: HashSet<&str> = item.transcriptions.iter().map(|t| t.key.as_str()).collect();
            for t in &item.transcriptions {
                let field = format!("transcription:{}", t.key);
                let hash = content_hash(&t.text);
                if !vault.has_local_edit(&identity_key, &field, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                doc.get_or_create_item_bucket(identity).transcriptions.write(
                    t.key.clone(),
                    author.clone(),
                    push_seq,
                    TranscriptionValue {
                        text: t.text.clone(),
                        data: None,
                        photo: None,
                        selection: t.selection.clone(),
                    },
                );
                vault.mark_field_pushed(&identity_key, &field, hash);
                vault.record_original_author(&t.key, &self.config.user_id);
            }
            {
                let bucket = doc.get_or_create_item_bucket(identity);
                detect_authored_deletions(
                    &mut bucket.transcriptions,
                    &mut vault,
                    &identity_key,
                    "transcription:",
                    &transcription_keys,
                    &author,
                    now,
                );
            }

            // tags (open removal: an OrSet carries no ownership guard)
            let tag_keys: HashSet<&str> = item
                .tags
                .iter()
                .filter(|t| !troparcel_crdt::doc::is_local_only_tag(t))
                .map(|s| s.as_str())
                .collect();
            for tag in &item.tags {
                if troparcel_crdt::doc::is_local_only_tag(tag) {
                    continue;
                }
                let field = format!("tag:{tag}");
                let hash = content_hash(tag);
                if !vault.has_local_edit(&identity_key, &field, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                let bucket = doc.get_or_create_item_bucket(identity);
                let entry = bucket.tags.entry(tag.clone()).or_default();
                if !entry.is_active() {
                    entry.add(
                        author.clone(),
                        push_seq,
                        TagValue {
                            name: tag.clone(),
                            color: None,
                        },
                    );
                }
                vault.mark_field_pushed(&identity_key, &field, hash);
            }
            {
                let bucket = doc.get_or_create_item_bucket(identity);
                detect_open_deletions(&mut bucket.tags, &vault, &identity_key, "tag:", &tag_keys);
            }

            // list membership (open removal)
            let list_keys: HashSet<&str> = item.list_memberships.iter().map(|s| s.as_str()).collect();
            for list_name in &item.list_memberships {
                let field = format!("list:{list_name}");
                let hash = content_hash(list_name);
                if !vault.has_local_edit(&identity_key, &field, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                let bucket = doc.get_or_create_item_bucket(identity);
                let entry = bucket.lists.entry(list_name.clone()).or_default();
                if !entry.is_active() {
                    entry.add(
                        author.clone(),
                        push_seq,
                        ListValue {
                            name: list_name.clone(),
                            member: true,
                        },
                    );
                }
                vault.mark_field_pushed(&identity_key, &field, hash);
            }
            {
                let bucket = doc.get_or_create_item_bucket(identity);
                detect_open_deletions(&mut bucket.lists, &vault, &identity_key, "list:", &list_keys);
            }
        }

        // §3.2: `templates`/`listHierarchy` are document-level and optional;
        // diff-suppressed the same way per-item fields are, via a
        // vault-tracked hash rather than per-item `pushed_field_hashes`.
        if let Ok(templates) = self.adapter.list_templates() {
            for t in templates {
                let hash = content_hash(&format!("{}\u{1}{}", t.label, t.kind));
                if vault.has_pushed_template(&t.uri, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                doc.templates.write(
                    t.uri.clone(),
                    author.clone(),
                    push_seq,
                    TemplateValue {
                        label: t.label.clone(),
                        kind: t.kind.clone(),
                    },
                );
                vault.mark_template_pushed(&t.uri, hash);
            }
        }
        if let Ok(lists) = self.adapter.list_lists() {
            for name in lists {
                let hash = content_hash(&name);
                if vault.has_pushed_list(&name, &hash) {
                    continue;
                }
                let push_seq = PushSeq(vault.next_push_seq());
                doc.list_hierarchy.write(
                    name.clone(),
                    author.clone(),
                    push_seq,
                    ListNodeValue {
                        name: name.clone(),
                        parent: None,
                    },
                );
                vault.mark_list_pushed(&name, hash);
            }
        }

        drop(doc);
        drop(vault);

        self.flush_vault().await;
        self.transition(EngineState::Ready);
    }

    /// §4.G apply cycle. `remote_doc` is the peer/relay state just decoded
    /// off the transport.
    pub async fn apply_remote(self: &Arc<Self>, remote: ReplicatedDoc) {
        if self.state() == EngineState::Stopped {
            return;
        }
        let _permit = self.write_lock.lock().await;
        self.transition(EngineState::Syncing);
        *self.shared.applying_remote.lock() = true; // safeguard 1
        let _suppress_guard = self.adapter.suppress_changes(); // safeguard 2

        let result = self.apply_remote_locked(remote).await;
        if let Err(err) = result {
            warn!(error = %err, "apply cycle failed");
        }

        *self.shared.applying_remote.lock() = false;
        self.transition(EngineState::Ready);
    }

    async fn apply_remote_locked(&self, remote: ReplicatedDoc) -> anyhow::Result<()> {
        let mut vault = self.vault.lock().await;
        let mut doc = self.shared.doc.lock();

        // §4.A identity resolution: exact match against a local item's
        // identity hash first, falling back to a photoMetadata-derived
        // checksum set for a fuzzy match, and only then to the opaque
        // identity hash itself (used verbatim as a local id the adapter
        // won't recognise, which is the best we can do for an item this
        // peer has never seen).
        let locals = self.adapter.list_items().unwrap_or_default();
        let mut identity_to_local: HashMap<ItemId, String> = HashMap::new();
        for summary in &locals {
            let checksums: Vec<PhotoChecksum> = summary.photo_checksums.iter().cloned().collect();
            if let Some(local_identity) = troparcel_crdt::compute_item_identity(&checksums) {
                identity_to_local.insert(local_identity, summary.local_id.clone());
            }
        }
        let resolved: Vec<(ItemId, String)> = remote
            .annotations
            .iter()
            .map(|(identity, bucket)| (*identity, resolve_local_id(identity, bucket, &identity_to_local, &locals)))
            .collect();

        let now = now_iso8601();
        if !resolved.is_empty() {
            let mut items_snapshot = serde_json::Map::new();
            for (identity, local_id) in &resolved {
                let snapshot = self
                    .adapter
                    .read_item(local_id)
                    .ok()
                    .map(|item| {
                        serde_json::json!({
                            "local_id": item.local_id,
                            "metadata": item.metadata,
                            "tags": item.tags,
                            "notes": item.notes,
                        })
                    })
                    .unwrap_or(serde_json::Value::Null);
                items_snapshot.insert(identity.to_string(), snapshot);
            }
            self.backups.write(
                &now,
                0,
                &BackupEntry {
                    timestamp: now.clone(),
                    identities: resolved.iter().map(|(id, _)| id.to_string()).collect(),
                    snapshot: serde_json::json!({
                        "schema_version": remote.schema_version,
                        "items": serde_json::Value::Object(items_snapshot),
                    }),
                },
            )?;
        }

        for (identity, local_id) in &resolved {
            let bucket = remote
                .annotations
                .get(identity)
                .expect("resolved local_id is only produced from remote.annotations entries");
            let identity_str = identity.to_string();
            let local_item = self.adapter.read_item(local_id).ok();

            let active_before = bucket.metadata.iter_active().count()
                + bucket.notes.iter_active().count()
                + bucket.selections.iter_active().count()
                + bucket.selection_notes.iter_active().count()
                + bucket.transcriptions.iter_active().count();
            let tombstoned_in_batch = bucket.metadata.iter_all().filter(|(_, e)| !e.is_active()).count()
                + bucket.notes.iter_all().filter(|(_, e)| !e.is_active()).count()
                + bucket.selections.iter_all().filter(|(_, e)| !e.is_active()).count()
                + bucket.selection_notes.iter_all().filter(|(_, e)| !e.is_active()).count()
                + bucket.transcriptions.iter_all().filter(|(_, e)| !e.is_active()).count();
            self.validator.check_tombstone_flood(&identity_str, active_before, tombstoned_in_batch);

            // metadata
            for (property, entry) in bucket.metadata.iter_all() {
                let kind_key = format!("metadata:{property}");
                if vault.is_dismissed(&kind_key, entry.push_seq.0) {
                    continue;
                }
                let remote_is_deleted = !entry.is_active();
                let remote_text = if remote_is_deleted { String::new() } else { entry.value.text.clone() };
                let local_text = local_item
                    .as_ref()
                    .and_then(|it| it.metadata.iter().find(|(p, _)| p == property))
                    .map(|(_, t)| t.clone())
                    .unwrap_or_default();
                if !remote_is_deleted && vault.has_local_edit(&identity_str, property, &content_hash(&local_text)) {
                    // local has an edit pending its own push; don't clobber it.
                    continue;
                }
                if self.validator.check_metadata_text(&remote_text) != ValidationOutcome::Accept {
                    continue;
                }
                if !self.validator.should_overwrite(local_text.is_empty(), remote_is_deleted, remote_text.is_empty()) {
                    continue;
                }
                self.adapter
                    .dispatch_suppressed(Action::SetMetadata {
                        local_id: local_id.clone(),
                        property: property.clone(),
                        text: remote_text,
                    })
                    .ok();
            }

            // notes
            for (key, entry) in bucket.notes.iter_all() {
                let kind_key = format!("note:{key}");
                if vault.is_dismissed(&kind_key, entry.push_seq.0) {
                    continue;
                }
                if !entry.is_active() {
                    self.adapter
                        .dispatch_suppressed(Action::RetractNote {
                            local_id: local_id.clone(),
                            key: key.clone(),
                        })
                        .ok();
                    continue;
                }
                if self.validator.check_note_html(&entry.value.html) != ValidationOutcome::Accept {
                    continue;
                }
                let sanitised = sanitize(&entry.value.html);
                let outcome = self.adapter.dispatch_suppressed(Action::UpsertNote {
                    local_id: local_id.clone(),
                    key: key.clone(),
                    html: sanitised,
                });
                if outcome.is_err() {
                    if vault.record_apply_failure(key) {
                        warn!(key, "note apply permanently failed after retries");
                    }
                } else {
                    vault.mark_applied_note(key);
                    vault.record_original_author(key, &entry.author.0);
                }
            }

            // selections
            for (key, entry) in bucket.selections.iter_active() {
                let kind_key = format!("selection:{key}");
                if vault.is_dismissed(&kind_key, entry.push_seq.0) {
                    continue;
                }
                let outcome = self.adapter.dispatch_suppressed(Action::UpsertSelection {
                    local_id: local_id.clone(),
                    key: key.clone(),
                    x: entry.value.x,
                    y: entry.value.y,
                    w: entry.value.w,
                    h: entry.value.h,
                });
                if outcome.is_ok() {
                    vault.mark_applied_selection(key);
                    vault.record_original_author(key, &entry.author.0);
                }
            }

            // selectionMeta (not authored)
            for (selection_key, meta_map) in &bucket.selection_meta {
                for (property, entry) in meta_map.iter_active() {
                    let kind_key = format!("selection_meta:{selection_key}:{property}");
                    if vault.is_dismissed(&kind_key, entry.push_seq.0) {
                        continue;
                    }
                    self.adapter
                        .dispatch_suppressed(Action::SetSelectionMeta {
                            local_id: local_id.clone(),
                            selection_key: selection_key.clone(),
                            property: property.clone(),
                            text: entry.value.text.clone(),
                        })
                        .ok();
                }
            }

            // selectionNotes
            for (key, entry) in bucket.selection_notes.iter_all() {
                let kind_key = format!("selection_note:{key}");
                if vault.is_dismissed(&kind_key, entry.push_seq.0) {
                    continue;
                }
                if !entry.is_active() {
                    self.adapter
                        .dispatch_suppressed(Action::RetractSelectionNote {
                            local_id: local_id.clone(),
                            selection_key: key.clone(),
                        })
                        .ok();
                    continue;
                }
                if self.validator.check_note_html(&entry.value.html) != ValidationOutcome::Accept {
                    continue;
                }
                let sanitised = sanitize(&entry.value.html);
                let outcome = self.adapter.dispatch_suppressed(Action::UpsertSelectionNote {
                    local_id: local_id.clone(),
                    selection_key: key.clone(),
                    html: sanitised,
                });
                if outcome.is_ok() {
                    vault.record_original_author(key, &entry.author.0);
                }
            }

            // transcriptions
            for (key, entry) in bucket.transcriptions.iter_all() {
                let kind_key = format!("transcription:{key}");
                if vault.is_dismissed(&kind_key, entry.push_seq.0) {
                    continue;
                }
                if !entry.is_active() {
                    self.adapter
                        .dispatch_suppressed(Action::RetractTranscription {
                            local_id: local_id.clone(),
                            key: key.clone(),
                        })
                        .ok();
                    continue;
                }
                let local_key = vault
                    .transcription_ids_mut()
                    .local_id_for(key)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| key.clone());
                let outcome = self.adapter.dispatch_suppressed(Action::UpsertTranscription {
                    local_id: local_id.clone(),
                    key: local_key.clone(),
                    text: entry.value.text.clone(),
                    selection: entry.value.selection.clone(),
                });
                if outcome.is_ok() {
                    vault.mark_applied_transcription(key);
                    vault.record_original_author(key, &entry.author.0);
                    vault.transcription_ids_mut().insert(key.clone(), local_key);
                }
            }

            // tags
            for (name, tag_set) in &bucket.tags {
                if let Some(tag) = tag_set.value() {
                    self.adapter
                        .dispatch_suppressed(Action::SetTag {
                            local_id: local_id.clone(),
                            name: tag.name.clone(),
                            active: tag_set.is_active(),
                        })
                        .ok();
                }
                let _ = name;
            }

            // list membership
            for (name, list_set) in &bucket.lists {
                let member = list_set.is_active();
                let local_key = vault
                    .list_ids_mut()
                    .local_id_for(name)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| name.clone());
                self.adapter
                    .dispatch_suppressed(Action::SetListMembership {
                        local_id: local_id.clone(),
                        list_key: local_key.clone(),
                        member,
                    })
                    .ok();
                vault.list_ids_mut().insert(name.clone(), local_key);
            }
        }

        doc.merge(&remote);
        Ok(())
    }

    async fn flush_vault(&self) {
        let vault = self.vault.lock().await;
        if let Err(err) = vault.flush() {
            warn!(error = %err, "vault flush failed, keeping in-memory state");
        }
    }

    /// §4.G / §5: `stop()` is idempotent and safe in any state, including
    /// before `start()` completes.
    pub async fn stop(self: &Arc<Self>) {
        if self.state() == EngineState::Stopped {
            return;
        }
        if let Some(handle) = self.safety_net_handle.lock().take() {
            handle.abort();
        }
        let _permit = self.write_lock.lock().await;
        self.flush_vault().await;
        self.transition(EngineState::Stopped);
        info!(room = %self.config.room, "engine stopped");
    }
}

#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub state: EngineState,
    pub room: String,
}

/// Resolves a remote `ItemId` to a local item id: exact identity-hash
/// match first, then a fuzzy checksum match using whatever `photoMetadata`
/// keys the remote bucket carries (the only checksum signal available for
/// an item that never had photo-level metadata pushed), then the identity
/// hash itself as a last resort.
fn resolve_local_id(identity: &ItemId, bucket: &ItemBucket, identity_to_local: &HashMap<ItemId, String>, locals: &[ItemSummary]) -> String {
    if let Some(local_id) = identity_to_local.get(identity) {
        return local_id.clone();
    }
    let remote_checksums: BTreeSet<PhotoChecksum> = bucket.photo_metadata.keys().map(|s| PhotoChecksum::from(s.as_str())).collect();
    if !remote_checksums.is_empty() {
        let candidates = locals.iter().map(|s| (s.local_id.clone(), &s.photo_checksums));
        if let Some(local_id) = fuzzy_match(&remote_checksums, candidates) {
            return local_id;
        }
    }
    identity.to_string()
}

/// The previously-pushed field keys under `prefix` for `identity_key` that
/// are no longer present in `current_keys` — candidates for a local
/// deletion this push cycle should reconcile.
fn local_deletion_candidates(vault: &Vault, identity_key: &str, prefix: &str, current_keys: &HashSet<&str>) -> Vec<String> {
    vault
        .state()
        .pushed_field_hashes
        .get(identity_key)
        .map(|fields| {
            fields
                .keys()
                .filter_map(|field| field.strip_prefix(prefix))
                .filter(|key| !current_keys.contains(key))
                .map(|key| key.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// §4.G local-deletion handling for the four authored sub-collections
/// (notes, selections, selectionNotes, transcriptions): a key this peer
/// previously pushed but no longer has locally is tombstoned if this peer
/// still owns the live entry, or dismissed (without touching the CRDT, so
/// the next push from the real owner isn't raced) if ownership has since
/// moved to another author.
fn detect_authored_deletions<V: Clone + Default>(
    map: &mut LwwMap<String, V>,
    vault: &mut Vault,
    identity_key: &str,
    prefix: &str,
    current_keys: &HashSet<&str>,
    author: &Author,
    now: i64,
) {
    for key in local_deletion_candidates(vault, identity_key, prefix, current_keys) {
        let entry_info = map.get(&key).filter(|e| e.is_active()).map(|e| (e.author.clone(), e.push_seq.0));
        if let Some((entry_author, entry_push_seq)) = entry_info {
            if &entry_author == author {
                let push_seq = PushSeq(vault.next_push_seq());
                map.tombstone(key.clone(), author.clone(), push_seq, now);
            } else {
                vault.dismiss_key(&format!("{prefix}{key}"), entry_push_seq);
            }
        }
    }
}

/// Open-removal counterpart for `tags`/`lists`: an `OrSet` carries no
/// author guard, so a local removal just tombstones every currently
/// active tag regardless of who added it (§3.3).
fn detect_open_deletions<V: Clone>(sets: &mut BTreeMap<String, OrSet<V>>, vault: &Vault, identity_key: &str, prefix: &str, current_keys: &HashSet<&str>) {
    let stale = local_deletion_candidates(vault, identity_key, prefix, current_keys);
    for key in stale {
        if let Some(set) = sets.get_mut(&key) {
            if set.is_active() {
                set.remove_all_active();
            }
        }
    }
}

fn content_hash(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

fn now_iso8601() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    // A monotonically sortable stand-in for a calendar timestamp; callers
    // only rely on lexicographic ordering for journal rotation, not on the
    // literal rendering.
    format!("{:020}", secs)
}

fn now_unix_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::adapter::Item;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.user_id = "alice".into();
        config.data_dir = std::env::temp_dir().join(format!("troparcel-test-{}", uuid_like()));
        config
    }

    fn uuid_like() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent() {
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = Arc::new(SyncEngine::new(test_config(), adapter));
        engine.start().await;
        assert_eq!(engine.state(), EngineState::Ready);
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.stop().await; // idempotent
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn push_writes_metadata_into_doc() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.insert_item(Item {
            local_id: "local-1".into(),
            photo_checksums: [PhotoChecksum::from("aaa")].into_iter().collect(),
            metadata: vec![("dc:title".into(), "Foo".into())],
            ..Default::default()
        });
        let engine = Arc::new(SyncEngine::new(test_config(), adapter));
        engine.start().await;
        engine.push().await;

        let identity = troparcel_crdt::compute_item_identity(&[PhotoChecksum::from("aaa")]).unwrap();
        let doc = engine.shared.doc.lock();
        assert_eq!(
            doc.item_bucket(&identity).unwrap().metadata.get(&"dc:title".to_string()).unwrap().value.text,
            "Foo"
        );
        drop(doc);
        engine.stop().await;
    }

    #[tokio::test]
    async fn push_covers_selections_transcriptions_and_lists() {
        let adapter = Arc::new(MemoryAdapter::new());
        let checksum = PhotoChecksum::from("aaa");
        adapter.insert_item(Item {
            local_id: "local-1".into(),
            photo_checksums: [checksum.clone()].into_iter().collect(),
            selections: vec![crate::adapter::SelectionItem {
                key: "s_1".into(),
                x: 1,
                y: 2,
                w: 3,
                h: 4,
                meta: vec![("dc:creator".into(), "Alice".into())],
            }],
            transcriptions: vec![crate::adapter::TranscriptionItem {
                key: "t_1".into(),
                text: "hello".into(),
                selection: Some("s_1".into()),
            }],
            list_memberships: vec!["favorites".into()],
            ..Default::default()
        });
        let engine = Arc::new(SyncEngine::new(test_config(), adapter));
        engine.start().await;
        engine.push().await;

        let identity = troparcel_crdt::compute_item_identity(&[checksum]).unwrap();
        let doc = engine.shared.doc.lock();
        let bucket = doc.item_bucket(&identity).unwrap();
        assert_eq!(bucket.selections.get(&"s_1".to_string()).unwrap().value.w, 3);
        assert_eq!(
            bucket
                .selection_meta
                .get("s_1")
                .unwrap()
                .get(&"dc:creator".to_string())
                .unwrap()
                .value
                .text,
            "Alice"
        );
        assert_eq!(bucket.transcriptions.get(&"t_1".to_string()).unwrap().value.text, "hello");
        assert!(bucket.lists.get("favorites").unwrap().is_active());
        drop(doc);
        engine.stop().await;
    }

    #[tokio::test]
    async fn push_tombstones_a_note_removed_locally_by_its_own_author() {
        let adapter = Arc::new(MemoryAdapter::new());
        let checksum = PhotoChecksum::from("aaa");
        adapter.insert_item(Item {
            local_id: "local-1".into(),
            photo_checksums: [checksum.clone()].into_iter().collect(),
            notes: vec![("n_1".into(), "<p>hi</p>".into())],
            ..Default::default()
        });
        let engine = Arc::new(SyncEngine::new(test_config(), adapter.clone()));
        engine.start().await;
        engine.push().await;

        // The host removes the note locally; the next push should tombstone
        // it, since this peer (alice) is the entry's own author.
        adapter.insert_item(Item {
            local_id: "local-1".into(),
            photo_checksums: [checksum.clone()].into_iter().collect(),
            ..Default::default()
        });
        engine.push().await;

        let identity = troparcel_crdt::compute_item_identity(&[checksum]).unwrap();
        let doc = engine.shared.doc.lock();
        assert!(!doc.item_bucket(&identity).unwrap().notes.get(&"n_1".to_string()).unwrap().is_active());
        drop(doc);
        engine.stop().await;
    }

    #[tokio::test]
    async fn apply_remote_does_not_trigger_a_push() {
        // P4: applying a remote update produces zero outbound updates.
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = Arc::new(SyncEngine::new(test_config(), adapter.clone()));
        engine.start().await;

        let mut remote = ReplicatedDoc::new(1);
        let identity = troparcel_crdt::compute_item_identity(&[PhotoChecksum::from("zzz")]).unwrap();
        remote.get_or_create_item_bucket(identity).notes.write(
            "n_1".into(),
            Author::from("bob"),
            PushSeq(1),
            NoteValue {
                html: "<p>hi</p>".into(),
                text: "hi".into(),
                lang: None,
                photo: None,
                selection: None,
            },
        );
        engine.apply_remote(remote).await;

        // The memory adapter only records a change notification via
        // `notify()`, which `dispatch_suppressed` never calls.
        assert!(adapter.dispatched_actions().iter().any(|a| matches!(a, Action::UpsertNote { .. })));
        engine.stop().await;
    }

    #[tokio::test]
    async fn apply_remote_resolves_via_fuzzy_checksum_match() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.insert_item(Item {
            local_id: "local-1".into(),
            photo_checksums: [PhotoChecksum::from("a"), PhotoChecksum::from("b")].into_iter().collect(),
            ..Default::default()
        });
        let engine = Arc::new(SyncEngine::new(test_config(), adapter.clone()));
        engine.start().await;

        // The remote item's identity is over {a} alone, so it won't match
        // local-1's identity hash (over {a, b}) exactly. Its photoMetadata
        // carries "a" as a checksum key, giving the fuzzy matcher a signal:
        // jaccard({a}, {a, b}) = 0.5, right at the threshold.
        let mut remote = ReplicatedDoc::new(1);
        let remote_identity = troparcel_crdt::compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let bucket = remote.get_or_create_item_bucket(remote_identity);
        bucket.photo_metadata.entry("a".into()).or_default().write(
            "dc:title".into(),
            Author::from("bob"),
            PushSeq(1),
            MetadataValue {
                text: "Foo".into(),
                kind: "string".into(),
                lang: None,
            },
        );
        bucket.notes.write(
            "n_1".into(),
            Author::from("bob"),
            PushSeq(2),
            NoteValue {
                html: "<p>hi</p>".into(),
                text: "hi".into(),
                lang: None,
                photo: None,
                selection: None,
            },
        );
        engine.apply_remote(remote).await;

        let dispatched = adapter.dispatched_actions();
        assert!(dispatched
            .iter()
            .any(|a| matches!(a, Action::UpsertNote { local_id, .. } if local_id == "local-1")));
        engine.stop().await;
    }
}
