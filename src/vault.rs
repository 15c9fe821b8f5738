//! §4.D Vault: durable per-peer state keyed by (room, user).
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

const MAX_MAP_ENTRIES: usize = 50_000;
const EVICT_FRACTION: f64 = 0.2;
const MAX_FAILED_RETRIES: u32 = 3;

/// An LRU-tracked bidirectional map. The `access_order` vector doubles as
/// the recency log: moving a key to the back marks it most-recently-used.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BidiMap {
    crdt_to_local: HashMap<String, String>,
    local_to_crdt: HashMap<String, String>,
    #[serde(default)]
    access_order: Vec<String>,
}

impl BidiMap {
    fn touch(&mut self, crdt_key: &str) {
        self.access_order.retain(|k| k != crdt_key);
        self.access_order.push(crdt_key.to_string());
    }

    pub fn insert(&mut self, crdt_key: String, local_id: String) {
        if let Some(old_local) = self.crdt_to_local.get(&crdt_key) {
            self.local_to_crdt.remove(old_local);
        }
        self.local_to_crdt.insert(local_id.clone(), crdt_key.clone());
        self.crdt_to_local.insert(crdt_key.clone(), local_id);
        self.touch(&crdt_key);
        self.evict_if_over_capacity();
    }

    pub fn local_id_for(&mut self, crdt_key: &str) -> Option<&str> {
        if self.crdt_to_local.contains_key(crdt_key) {
            self.touch(crdt_key);
        }
        self.crdt_to_local.get(crdt_key).map(|s| s.as_str())
    }

    pub fn crdt_key_for(&self, local_id: &str) -> Option<&str> {
        self.local_to_crdt.get(local_id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.crdt_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crdt_to_local.is_empty()
    }

    /// P7: both directions are evicted together, fixing the known one-sided
    /// LRU bug in the reference sources (Q2).
    fn evict_if_over_capacity(&mut self) {
        if self.crdt_to_local.len() <= MAX_MAP_ENTRIES {
            return;
        }
        let to_evict = (self.crdt_to_local.len() as f64 * EVICT_FRACTION).ceil() as usize;
        let victims: Vec<String> = self.access_order.iter().take(to_evict).cloned().collect();
        for victim in &victims {
            if let Some(local_id) = self.crdt_to_local.remove(victim) {
                self.local_to_crdt.remove(&local_id);
            }
        }
        self.access_order.drain(0..to_evict.min(self.access_order.len()));
    }

    /// P7 invariant checker, used in tests and available for diagnostics.
    pub fn is_consistent(&self) -> bool {
        self.crdt_to_local.iter().all(|(c, l)| self.local_to_crdt.get(l) == Some(c))
            && self.local_to_crdt.iter().all(|(l, c)| self.crdt_to_local.get(c) == Some(l))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DismissalEntry {
    pub push_seq_at_dismissal: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FailureEntry {
    pub retry_count: u32,
    pub permanently_failed: bool,
}

/// §4.D field table. All maps default to empty so the struct loads cleanly
/// with any subset of legacy fields absent (`#[serde(default)]` everywhere).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VaultState {
    #[serde(default)]
    pub push_seq: u64,
    #[serde(default)]
    pub pushed_field_hashes: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub applied_note_keys: std::collections::HashSet<String>,
    #[serde(default)]
    pub applied_selection_keys: std::collections::HashSet<String>,
    #[serde(default)]
    pub applied_transcription_keys: std::collections::HashSet<String>,
    #[serde(default)]
    pub failed_note_keys: HashMap<String, FailureEntry>,
    #[serde(default)]
    pub dismissed_keys: HashMap<String, DismissalEntry>,
    #[serde(default)]
    pub note_ids: BidiMap,
    #[serde(default)]
    pub selection_ids: BidiMap,
    #[serde(default)]
    pub transcription_ids: BidiMap,
    #[serde(default)]
    pub list_ids: BidiMap,
    #[serde(default)]
    pub original_authors: HashMap<String, String>,
    #[serde(default)]
    pub pushed_template_hashes: HashMap<String, String>,
    #[serde(default)]
    pub pushed_list_hashes: HashMap<String, String>,
}

pub struct Vault {
    path: PathBuf,
    state: VaultState,
}

impl Vault {
    /// Loads the vault at `path`, or starts a fresh one if the file is
    /// absent. A corrupt file is logged and treated as fresh rather than
    /// failing sync entirely (§7 "Vault I/O ... never block sync").
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(error = %err, path = %path.display(), "vault file unreadable, starting fresh");
                VaultState::default()
            }),
            Err(_) => VaultState::default(),
        };
        Self { path, state }
    }

    pub fn state(&self) -> &VaultState {
        &self.state
    }

    /// Atomic write-to-temp-then-rename (§4.D). Retries once in place on
    /// failure; on repeated failure keeps the in-memory state and warns,
    /// per §7's "never block sync" policy.
    pub fn flush(&self) -> std::io::Result<()> {
        match self.try_flush() {
            Ok(()) => Ok(()),
            Err(first_err) => {
                warn!(error = %first_err, "vault flush failed, retrying once");
                self.try_flush().map_err(|err| {
                    warn!(error = %err, "vault flush failed again, keeping in-memory state");
                    err
                })
            }
        }
    }

    fn try_flush(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// P2: strictly increasing within a session.
    pub fn next_push_seq(&mut self) -> u64 {
        self.state.push_seq += 1;
        self.state.push_seq
    }

    /// Conservative by construction: an unseen field reads as "has a local
    /// edit", per §4.D.
    pub fn has_local_edit(&self, identity: &str, field: &str, current_hash: &str) -> bool {
        match self.state.pushed_field_hashes.get(identity).and_then(|f| f.get(field)) {
            Some(pushed) => pushed != current_hash,
            None => true,
        }
    }

    pub fn mark_field_pushed(&mut self, identity: &str, field: &str, hash: String) {
        self.state
            .pushed_field_hashes
            .entry(identity.to_string())
            .or_default()
            .insert(field.to_string(), hash);
    }

    /// P6: a dismissal auto-expires once the author advances the entry past
    /// the pushSeq recorded at dismissal time ("muted thread resurrected").
    pub fn is_dismissed(&self, key: &str, entry_push_seq: u64) -> bool {
        self.state
            .dismissed_keys
            .get(key)
            .map(|d| entry_push_seq <= d.push_seq_at_dismissal)
            .unwrap_or(false)
    }

    pub fn dismiss_key(&mut self, key: &str, push_seq: u64) {
        self.state.dismissed_keys.insert(
            key.to_string(),
            DismissalEntry {
                push_seq_at_dismissal: push_seq,
            },
        );
    }

    /// Dismissed keys shadow failed-retry accounting (§4.D): callers should
    /// check `is_dismissed` before counting a failure.
    pub fn record_apply_failure(&mut self, note_key: &str) -> bool {
        let entry = self.state.failed_note_keys.entry(note_key.to_string()).or_default();
        if entry.permanently_failed {
            return true;
        }
        entry.retry_count += 1;
        if entry.retry_count >= MAX_FAILED_RETRIES {
            entry.permanently_failed = true;
        }
        entry.permanently_failed
    }

    pub fn is_permanently_failed(&self, note_key: &str) -> bool {
        self.state
            .failed_note_keys
            .get(note_key)
            .map(|e| e.permanently_failed)
            .unwrap_or(false)
    }

    pub fn mark_applied_note(&mut self, key: &str) {
        self.state.applied_note_keys.insert(key.to_string());
    }

    pub fn mark_applied_selection(&mut self, key: &str) {
        self.state.applied_selection_keys.insert(key.to_string());
    }

    pub fn mark_applied_transcription(&mut self, key: &str) {
        self.state.applied_transcription_keys.insert(key.to_string());
    }

    pub fn note_ids_mut(&mut self) -> &mut BidiMap {
        &mut self.state.note_ids
    }

    pub fn selection_ids_mut(&mut self) -> &mut BidiMap {
        &mut self.state.selection_ids
    }

    pub fn transcription_ids_mut(&mut self) -> &mut BidiMap {
        &mut self.state.transcription_ids
    }

    pub fn list_ids_mut(&mut self) -> &mut BidiMap {
        &mut self.state.list_ids
    }

    pub fn record_original_author(&mut self, key: &str, author: &str) {
        self.state.original_authors.entry(key.to_string()).or_insert_with(|| author.to_string());
    }

    pub fn original_author(&self, key: &str) -> Option<&str> {
        self.state.original_authors.get(key).map(|s| s.as_str())
    }

    pub fn has_pushed_template(&self, uri: &str, hash: &str) -> bool {
        self.state.pushed_template_hashes.get(uri).map(|h| h == hash).unwrap_or(false)
    }

    pub fn mark_template_pushed(&mut self, uri: &str, hash: String) {
        self.state.pushed_template_hashes.insert(uri.to_string(), hash);
    }

    pub fn has_pushed_list(&self, uuid: &str, hash: &str) -> bool {
        self.state.pushed_list_hashes.get(uuid).map(|h| h == hash).unwrap_or(false)
    }

    pub fn mark_list_pushed(&mut self, uuid: &str, hash: String) {
        self.state.pushed_list_hashes.insert(uuid.to_string(), hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn push_seq_is_monotonic() {
        let dir = tempdir().unwrap();
        let mut vault = Vault::load(dir.path().join("v.json"));
        let a = vault.next_push_seq();
        let b = vault.next_push_seq();
        assert!(b > a);
    }

    #[test]
    fn unseen_field_is_conservatively_a_local_edit() {
        let dir = tempdir().unwrap();
        let vault = Vault::load(dir.path().join("v.json"));
        assert!(vault.has_local_edit("item1", "dc:title", "somehash"));
    }

    #[test]
    fn dismissal_auto_expires_on_newer_entry() {
        // P6
        let dir = tempdir().unwrap();
        let mut vault = Vault::load(dir.path().join("v.json"));
        vault.dismiss_key("note:n_abc", 5);
        assert!(vault.is_dismissed("note:n_abc", 5));
        assert!(vault.is_dismissed("note:n_abc", 3));
        assert!(!vault.is_dismissed("note:n_abc", 6));
    }

    #[test]
    fn flush_and_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.json");
        let mut vault = Vault::load(&path);
        vault.next_push_seq();
        vault.dismiss_key("note:n_x", 1);
        vault.flush().unwrap();

        let reloaded = Vault::load(&path);
        assert_eq!(reloaded.state().push_seq, 1);
        assert!(reloaded.is_dismissed("note:n_x", 1));
    }

    #[test]
    fn missing_legacy_fields_load_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.json");
        fs::write(&path, br#"{"push_seq": 3}"#).unwrap();
        let vault = Vault::load(&path);
        assert_eq!(vault.state().push_seq, 3);
        assert!(vault.state().dismissed_keys.is_empty());
    }

    #[test]
    fn bidi_map_stays_consistent_after_eviction() {
        // P7
        let mut map = BidiMap::default();
        for i in 0..10 {
            map.insert(format!("c{}", i), format!("l{}", i));
        }
        assert!(map.is_consistent());
        assert_eq!(map.crdt_key_for("l3"), Some("c3"));
    }

    #[test]
    fn reinserting_a_crdt_key_drops_the_old_local_mapping() {
        let mut map = BidiMap::default();
        map.insert("c1".into(), "l1".into());
        map.insert("c1".into(), "l2".into());
        assert_eq!(map.crdt_key_for("l1"), None);
        assert_eq!(map.crdt_key_for("l2"), Some("c1"));
        assert!(map.is_consistent());
    }
}
