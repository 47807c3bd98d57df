use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::AssetIdentity;
use crate::error::MlhubError;

pub const LEDGER_DIR_NAME: &str = "mlhub_stac_assets.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// One persisted worklist row: an asset that should exist locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity: AssetIdentity,
    pub url: String,
    /// Destination path, relative to the dataset output directory.
    pub save_path: String,
    pub remote_size: Option<u64>,
    pub state: EntryState,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
}

/// Persistent download-state index for one dataset's output directory.
///
/// The store is a resumability aid: it survives process restarts and may be
/// deleted after a successful run without affecting downloaded files. The
/// `try_claim` compare-and-swap is the only concurrency gate workers share.
pub struct AssetLedger {
    db: sled::Db,
}

impl AssetLedger {
    /// Open (or create) the ledger under `dataset_dir`. Entries left
    /// `InProgress` by an interrupted run are swept back to `Pending`;
    /// their partial files remain valid resume points.
    pub fn open(dataset_dir: &Path) -> Result<Self, MlhubError> {
        let db = sled::open(dataset_dir.join(LEDGER_DIR_NAME))?;
        let ledger = Self { db };
        ledger.recover_interrupted()?;
        Ok(ledger)
    }

    fn recover_interrupted(&self) -> Result<(), MlhubError> {
        let mut recovered = 0usize;
        for item in self.db.iter() {
            let (key, value) = item?;
            let mut entry: LedgerEntry = postcard::from_bytes(&value)?;
            if entry.state == EntryState::InProgress {
                entry.state = EntryState::Pending;
                self.db.insert(key, postcard::to_allocvec(&entry)?)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            debug!(recovered, "reset interrupted ledger entries to pending");
        }
        Ok(())
    }

    /// Insert or refresh an entry; idempotent.
    ///
    /// An existing entry for the same identity and url keeps its state, so
    /// `Complete` and `Failed` survive across runs. A different url under
    /// the same identity is treated as a distinct asset and stored under a
    /// hash-disambiguated key and destination.
    pub fn upsert(
        &self,
        identity: AssetIdentity,
        url: &str,
        save_path: &str,
        remote_size: Option<u64>,
    ) -> Result<String, MlhubError> {
        let mut key = identity.ledger_key();
        let mut save_path = save_path.to_string();
        if let Some(existing) = self.get(&key)? {
            if existing.url == url {
                return Ok(key);
            }
            let suffix = short_hash(url);
            key = format!("{key}#{suffix}");
            save_path = disambiguate_path(&save_path, &suffix);
            if self.get(&key)?.is_some() {
                return Ok(key);
            }
        }
        let entry = LedgerEntry {
            identity,
            url: url.to_string(),
            save_path,
            remote_size,
            state: EntryState::Pending,
            error: None,
        };
        self.db.insert(key.as_bytes(), postcard::to_allocvec(&entry)?)?;
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Result<Option<LedgerEntry>, MlhubError> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    /// Atomic `Pending -> InProgress` transition. Returns `false` when the
    /// entry is unknown, already claimed, or terminal. Loser of a race
    /// always observes `false`.
    pub fn try_claim(&self, key: &str) -> Result<bool, MlhubError> {
        loop {
            let Some(current) = self.db.get(key.as_bytes())? else {
                return Ok(false);
            };
            let entry: LedgerEntry = postcard::from_bytes(&current)?;
            if entry.state != EntryState::Pending {
                return Ok(false);
            }
            let mut claimed = entry;
            claimed.state = EntryState::InProgress;
            let new_value = postcard::to_allocvec(&claimed)?;
            match self
                .db
                .compare_and_swap(key.as_bytes(), Some(current), Some(new_value))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    pub fn mark_complete(&self, key: &str) -> Result<(), MlhubError> {
        self.update(key, |entry| {
            entry.state = EntryState::Complete;
            entry.error = None;
        })
    }

    pub fn mark_failed(&self, key: &str, error: &str) -> Result<(), MlhubError> {
        self.update(key, |entry| {
            entry.state = EntryState::Failed;
            entry.error = Some(error.to_string());
        })
    }

    pub fn set_remote_size(&self, key: &str, remote_size: u64) -> Result<(), MlhubError> {
        self.update(key, |entry| {
            entry.remote_size = Some(remote_size);
        })
    }

    /// Reset every `Failed` entry to `Pending` so a later run retries it.
    pub fn reset_failed(&self) -> Result<usize, MlhubError> {
        let mut reset = 0usize;
        for item in self.db.iter() {
            let (key, value) = item?;
            let mut entry: LedgerEntry = postcard::from_bytes(&value)?;
            if entry.state == EntryState::Failed {
                entry.state = EntryState::Pending;
                entry.error = None;
                self.db.insert(key, postcard::to_allocvec(&entry)?)?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    pub fn pending_keys(&self) -> Result<Vec<String>, MlhubError> {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            let entry: LedgerEntry = postcard::from_bytes(&value)?;
            if entry.state == EntryState::Pending {
                keys.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(keys)
    }

    pub fn entries(&self) -> Result<Vec<(String, LedgerEntry)>, MlhubError> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            entries.push((
                String::from_utf8_lossy(&key).into_owned(),
                postcard::from_bytes(&value)?,
            ));
        }
        Ok(entries)
    }

    pub fn counts(&self) -> Result<LedgerCounts, MlhubError> {
        let mut counts = LedgerCounts::default();
        for item in self.db.iter() {
            let (_, value) = item?;
            let entry: LedgerEntry = postcard::from_bytes(&value)?;
            match entry.state {
                EntryState::Pending => counts.pending += 1,
                EntryState::InProgress => counts.in_progress += 1,
                EntryState::Complete => counts.complete += 1,
                EntryState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    pub fn flush(&self) -> Result<(), MlhubError> {
        self.db.flush()?;
        Ok(())
    }

    fn update<F>(&self, key: &str, mutate: F) -> Result<(), MlhubError>
    where
        F: Fn(&mut LedgerEntry),
    {
        loop {
            let Some(current) = self.db.get(key.as_bytes())? else {
                return Err(MlhubError::Ledger(format!("unknown ledger entry: {key}")));
            };
            let mut entry: LedgerEntry = postcard::from_bytes(&current)?;
            mutate(&mut entry);
            let new_value = postcard::to_allocvec(&entry)?;
            match self
                .db
                .compare_and_swap(key.as_bytes(), Some(current), Some(new_value))?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }
}

/// Stable FNV-1a hash, shortened. Used to disambiguate divergent hrefs that
/// collide on one ledger identity; must not change across runs.
pub fn short_hash(value: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in value.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{:08x}", (hash >> 32) as u32 ^ hash as u32)
}

fn disambiguate_path(path: &str, suffix: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{stem}-{suffix}.{ext}")
        }
        _ => format!("{path}-{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(item: Option<&str>, key: &str) -> AssetIdentity {
        AssetIdentity {
            collection_id: "source".to_string(),
            item_id: item.map(|value| value.to_string()),
            asset_key: key.to_string(),
        }
    }

    fn open_ledger() -> (tempfile::TempDir, AssetLedger) {
        let temp = tempfile::tempdir().unwrap();
        let ledger = AssetLedger::open(temp.path()).unwrap();
        (temp, ledger)
    }

    #[test]
    fn upsert_is_idempotent() {
        let (_temp, ledger) = open_ledger();
        let key = ledger
            .upsert(identity(Some("t1"), "B02"), "https://x/b02.tif", "source/t1/B02.tif", None)
            .unwrap();
        ledger.mark_complete(&key).unwrap();

        let again = ledger
            .upsert(identity(Some("t1"), "B02"), "https://x/b02.tif", "source/t1/B02.tif", None)
            .unwrap();
        assert_eq!(key, again);
        let entry = ledger.get(&key).unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Complete);
    }

    #[test]
    fn divergent_href_gets_its_own_entry() {
        let (_temp, ledger) = open_ledger();
        let first = ledger
            .upsert(identity(Some("t1"), "B02"), "https://x/a.tif", "source/t1/B02.tif", None)
            .unwrap();
        let second = ledger
            .upsert(identity(Some("t1"), "B02"), "https://x/b.tif", "source/t1/B02.tif", None)
            .unwrap();
        assert_ne!(first, second);

        let entry = ledger.get(&second).unwrap().unwrap();
        assert_ne!(entry.save_path, "source/t1/B02.tif");
        assert!(entry.save_path.ends_with(".tif"));
        assert_eq!(ledger.counts().unwrap().pending, 2);
    }

    #[test]
    fn claim_is_single_winner() {
        let (_temp, ledger) = open_ledger();
        let key = ledger
            .upsert(identity(Some("t1"), "B02"), "https://x/a.tif", "source/t1/B02.tif", None)
            .unwrap();
        assert!(ledger.try_claim(&key).unwrap());
        assert!(!ledger.try_claim(&key).unwrap());

        ledger.mark_complete(&key).unwrap();
        assert!(!ledger.try_claim(&key).unwrap());
        assert!(!ledger.try_claim("source/none/B02").unwrap());
    }

    #[test]
    fn failed_entries_reset_to_pending() {
        let (_temp, ledger) = open_ledger();
        let key = ledger
            .upsert(identity(Some("t1"), "B02"), "https://x/a.tif", "source/t1/B02.tif", None)
            .unwrap();
        assert!(ledger.try_claim(&key).unwrap());
        ledger.mark_failed(&key, "404 not found").unwrap();

        let entry = ledger.get(&key).unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(entry.error.as_deref(), Some("404 not found"));

        assert_eq!(ledger.reset_failed().unwrap(), 1);
        assert_eq!(ledger.pending_keys().unwrap(), vec![key]);
    }

    #[test]
    fn interrupted_claims_recover_on_open() {
        let temp = tempfile::tempdir().unwrap();
        {
            let ledger = AssetLedger::open(temp.path()).unwrap();
            let key = ledger
                .upsert(identity(Some("t1"), "B02"), "https://x/a.tif", "source/t1/B02.tif", None)
                .unwrap();
            assert!(ledger.try_claim(&key).unwrap());
            ledger.flush().unwrap();
        }
        let reopened = AssetLedger::open(temp.path()).unwrap();
        assert_eq!(reopened.counts().unwrap().pending, 1);
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("https://x/a.tif"), short_hash("https://x/a.tif"));
        assert_ne!(short_hash("https://x/a.tif"), short_hash("https://x/b.tif"));
    }
}
