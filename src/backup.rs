//! §4.E Backup & Validator: pre-apply snapshots and inbound size guards.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A rolling, room-scoped journal of pre-apply snapshots. The newest
/// `max_backups` files are kept; older ones are pruned on write.
pub struct BackupJournal {
    dir: PathBuf,
    max_backups: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupEntry {
    pub timestamp: String,
    pub identities: Vec<String>,
    pub snapshot: serde_json::Value,
}

impl BackupJournal {
    pub fn new(dir: impl AsRef<Path>, max_backups: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_backups,
        }
    }

    /// Writes one journal entry and prunes down to `max_backups`, oldest
    /// first. `timestamp` must already be a sortable ISO-8601 string so
    /// that lexicographic filename order matches chronological order.
    pub fn write(&self, timestamp: &str, seq: u32, entry: &BackupEntry) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let filename = format!("{}-{:04}.json", timestamp, seq);
        let path = self.dir.join(filename);
        let bytes = serde_json::to_vec_pretty(entry)?;
        fs::write(&path, bytes)?;
        self.prune()
    }

    fn prune(&self) -> std::io::Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();
        if files.len() > self.max_backups {
            for stale in &files[..files.len() - self.max_backups] {
                fs::remove_file(stale).ok();
            }
        }
        Ok(())
    }
}

pub struct ValidatorConfig {
    pub max_note_size: usize,
    pub max_metadata_size: usize,
}

/// Inbound apply-side size guards and overwrite policy (§4.E).
pub struct Validator {
    config: ValidatorConfig,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accept,
    /// The offending entry is skipped, not the whole batch (§4.E).
    RejectTooLarge { field: &'static str, limit: usize },
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn check_note_html(&self, html: &str) -> ValidationOutcome {
        if html.len() > self.config.max_note_size {
            ValidationOutcome::RejectTooLarge {
                field: "note.html",
                limit: self.config.max_note_size,
            }
        } else {
            ValidationOutcome::Accept
        }
    }

    pub fn check_metadata_text(&self, text: &str) -> ValidationOutcome {
        if text.len() > self.config.max_metadata_size {
            ValidationOutcome::RejectTooLarge {
                field: "metadata.text",
                limit: self.config.max_metadata_size,
            }
        } else {
            ValidationOutcome::Accept
        }
    }

    /// `true` iff the remote value should overwrite the local one: remote
    /// is a tombstone, remote is non-empty, or local is empty.
    pub fn should_overwrite(&self, local_is_empty: bool, remote_is_deleted: bool, remote_is_empty: bool) -> bool {
        remote_is_deleted || !remote_is_empty || local_is_empty
    }

    /// Informational-only tombstone-flood check: warns but never blocks.
    pub fn check_tombstone_flood(&self, identity: &str, active_before: usize, tombstoned_in_batch: usize) {
        if active_before == 0 {
            return;
        }
        let ratio = tombstoned_in_batch as f64 / active_before as f64;
        if ratio > 0.5 {
            warn!(identity, tombstoned_in_batch, active_before, "tombstone flood detected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn oversized_note_is_rejected() {
        let validator = Validator::new(ValidatorConfig {
            max_note_size: 10,
            max_metadata_size: 10,
        });
        assert_eq!(
            validator.check_note_html(&"x".repeat(11)),
            ValidationOutcome::RejectTooLarge { field: "note.html", limit: 10 }
        );
        assert_eq!(validator.check_note_html("short"), ValidationOutcome::Accept);
    }

    #[test]
    fn should_overwrite_matches_spec_rule() {
        let validator = Validator::new(ValidatorConfig { max_note_size: 10, max_metadata_size: 10 });
        assert!(validator.should_overwrite(true, false, true)); // local empty
        assert!(validator.should_overwrite(false, true, true)); // remote deleted
        assert!(validator.should_overwrite(false, false, false)); // remote non-empty
        assert!(!validator.should_overwrite(false, false, true));
    }

    #[test]
    fn journal_prunes_to_max_backups() {
        let dir = tempdir().unwrap();
        let journal = BackupJournal::new(dir.path(), 2);
        for i in 0..5 {
            let entry = BackupEntry {
                timestamp: format!("2026-01-01T00:00:0{}Z", i),
                identities: vec!["abc".into()],
                snapshot: serde_json::json!({}),
            };
            journal.write(&entry.timestamp, 0, &entry).unwrap();
        }
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 2);
    }
}
