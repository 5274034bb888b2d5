//! JSON file storage implementation.
//!
//! Stores each document as a JSON file under the storage root and keeps a
//! small per-document meta marker (version + updated_at).
//!
//! A commit stages every document and meta file next to its target, records
//! the staged renames in a journal, then renames them into place. A failure
//! before the journal lands discards the staged files, so nothing is applied.
//! A journal left behind by a failed roll-forward is replayed on open, before
//! the next commit, and by any read that finds it.
//!
//! Commits hold an exclusive advisory lock on `.lock` (reads hold it shared),
//! so separate processes over the same root serialize as well.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use studyphase_core::{
    PatientId, PatientPhaseProgress, PhaseConfig, PhaseId, ProgressKey, StudyId, VisitFolder,
};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Precondition, Result, Storage, StorageError, Transaction, Versioned, Write};

const PHASES: &str = "phases";
const PROGRESS: &str = "progress";
const FOLDERS: &str = "folders";
const STUDIES: &str = "studies";
const JOURNAL: &str = "journal.json";
const LOCK: &str = ".lock";

/// Staged renames of one transaction, applied in order.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    renames: Vec<(PathBuf, PathBuf)>,
}

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
    gate: RwLock<()>,
}

impl JsonStorage {
    /// Create storage, creating the data and meta directories as needed and
    /// finishing any interrupted commit.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        for kind in [PHASES, PROGRESS, FOLDERS, STUDIES] {
            fs::create_dir_all(root.join(kind)).await?;
            fs::create_dir_all(root.join("meta").join(kind)).await?;
        }

        let storage = Self {
            root,
            gate: RwLock::new(()),
        };
        {
            let _lock = storage.lock_file(true).await?;
            storage.recover().await?;
        }
        Ok(storage)
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }

    fn meta_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join("meta").join(kind).join(format!("{}.meta.json", id))
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL)
    }

    fn locate(write: &Write) -> Result<(&'static str, String)> {
        match write {
            Write::PhaseConfig(c) => Ok((PHASES, file_id(c.id.as_str())?)),
            Write::Progress(p) => Ok((PROGRESS, progress_file_id(&p.key())?)),
            Write::Folder(f) => Ok((FOLDERS, progress_file_id(&f.key())?)),
            Write::StudyRevision(s) => Ok((STUDIES, file_id(s.as_str())?)),
        }
    }

    /// Take the advisory store lock. Released when the returned file drops.
    async fn lock_file(&self, exclusive: bool) -> Result<std::fs::File> {
        let path = self.root.join(LOCK);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            if exclusive {
                file.lock_exclusive()?;
            } else {
                FileExt::lock_shared(&file)?;
            }
            Ok(file)
        })
        .await
        .map_err(|e| StorageError::Other(format!("Lock task failed: {}", e)))??;
        Ok(file)
    }

    /// Roll a leftover journal forward. Caller holds the exclusive lock.
    async fn recover(&self) -> Result<()> {
        let Some(journal) = read_json::<Journal>(&self.journal_path()).await? else {
            return Ok(());
        };
        warn!(renames = journal.renames.len(), "Replaying interrupted commit");
        self.apply(&journal).await
    }

    /// Replay a leftover journal before reading.
    async fn settle(&self) -> Result<()> {
        if !fs::try_exists(self.journal_path()).await? {
            return Ok(());
        }
        let _write = self.gate.write().await;
        let _lock = self.lock_file(true).await?;
        self.recover().await
    }

    /// Rename staged files into place, then drop the journal.
    async fn apply(&self, journal: &Journal) -> Result<()> {
        for (staged, target) in &journal.renames {
            match fs::rename(staged, target).await {
                Ok(()) => {}
                // Already moved by an earlier, interrupted roll-forward.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        fs::remove_file(self.journal_path()).await?;
        Ok(())
    }

    /// Check every guard and return the version each write will land at.
    async fn check_guards(&self, tx: &Transaction) -> Result<Vec<u64>> {
        let mut next: HashMap<(&'static str, String), u64> = HashMap::new();
        let mut versions = Vec::with_capacity(tx.len());

        for (write, guard) in tx.writes() {
            let (kind, id) = Self::locate(write)?;
            let current = match next.get(&(kind, id.clone())) {
                Some(v) => Some(*v),
                None if fs::try_exists(self.doc_path(kind, &id)).await? => {
                    Some(self.read_version(kind, &id).await?)
                }
                None => None,
            };
            guard.check(current, &write.describe())?;

            let version = current.unwrap_or(0) + 1;
            next.insert((kind, id), version);
            versions.push(version);
        }
        Ok(versions)
    }

    /// Write every document and meta file beside its target, then the journal.
    async fn stage(
        &self,
        tx: &Transaction,
        versions: &[u64],
        journal: &mut Journal,
    ) -> Result<()> {
        let now = chrono::Utc::now();
        for (index, ((write, _), version)) in tx.writes().iter().zip(versions).enumerate() {
            let (kind, id) = Self::locate(write)?;
            let json = match write {
                Write::PhaseConfig(c) => serde_json::to_string_pretty(c)?,
                Write::Progress(p) => serde_json::to_string_pretty(p)?,
                Write::Folder(f) => serde_json::to_string_pretty(f)?,
                Write::StudyRevision(s) => {
                    serde_json::to_string_pretty(&serde_json::json!({ "study_id": s }))?
                }
            };
            let meta = serde_json::json!({"version": version, "updated_at": now});

            for (target, bytes) in [
                (self.doc_path(kind, &id), json),
                (self.meta_path(kind, &id), serde_json::to_string_pretty(&meta)?),
            ] {
                let staged = staged_path(&target, index);
                fs::write(&staged, bytes.as_bytes()).await?;
                journal.renames.push((staged, target));
            }
        }
        // The journal landing is the commit point.
        write_atomic(&self.journal_path(), &serde_json::to_vec(&*journal)?).await
    }

    /// Read the per-object version, 0 when the object was never written.
    async fn read_version(&self, kind: &str, id: &str) -> Result<u64> {
        match fs::read_to_string(self.meta_path(kind, id)).await {
            Ok(s) => {
                let json: serde_json::Value = serde_json::from_str(&s)?;
                Ok(json.get("version").and_then(|v| v.as_u64()).unwrap_or(0))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_versioned<T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Option<Versioned<T>>> {
        let Some(value) = read_json::<T>(&self.doc_path(kind, id)).await? else {
            return Ok(None);
        };
        let version = self.read_version(kind, id).await?;
        Ok(Some(Versioned::new(version, value)))
    }

    async fn list_versioned<T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
    ) -> Result<Vec<Versioned<T>>> {
        let mut items = Vec::new();
        let mut rd = fs::read_dir(self.root.join(kind)).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(item) = self.read_versioned(kind, id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn load_phase_config(&self, id: &PhaseId) -> Result<Option<Versioned<PhaseConfig>>> {
        self.settle().await?;
        let _read = self.gate.read().await;
        let _lock = self.lock_file(false).await?;
        self.read_versioned(PHASES, &file_id(id.as_str())?).await
    }

    async fn list_phase_configs(&self, study_id: &StudyId) -> Result<Vec<Versioned<PhaseConfig>>> {
        self.settle().await?;
        let _read = self.gate.read().await;
        let _lock = self.lock_file(false).await?;
        let mut configs: Vec<Versioned<PhaseConfig>> = self
            .list_versioned(PHASES)
            .await?
            .into_iter()
            .filter(|c: &Versioned<PhaseConfig>| &c.value.study_id == study_id)
            .collect();
        configs.sort_by_key(|c| c.value.order);
        Ok(configs)
    }

    async fn study_revision(&self, study_id: &StudyId) -> Result<Option<u64>> {
        self.settle().await?;
        let _read = self.gate.read().await;
        let _lock = self.lock_file(false).await?;
        let id = file_id(study_id.as_str())?;
        if !fs::try_exists(self.doc_path(STUDIES, &id)).await? {
            return Ok(None);
        }
        Ok(Some(self.read_version(STUDIES, &id).await?))
    }

    async fn load_progress(
        &self,
        key: &ProgressKey,
    ) -> Result<Option<Versioned<PatientPhaseProgress>>> {
        self.settle().await?;
        let _read = self.gate.read().await;
        let _lock = self.lock_file(false).await?;
        self.read_versioned(PROGRESS, &progress_file_id(key)?).await
    }

    async fn list_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<Versioned<PatientPhaseProgress>>> {
        self.settle().await?;
        let _read = self.gate.read().await;
        let _lock = self.lock_file(false).await?;
        let mut records: Vec<Versioned<PatientPhaseProgress>> = self
            .list_versioned(PROGRESS)
            .await?
            .into_iter()
            .filter(|p: &Versioned<PatientPhaseProgress>| {
                &p.value.patient_id == patient_id && &p.value.study_id == study_id
            })
            .collect();
        records.sort_by_key(|p| p.value.phase_order);
        Ok(records)
    }

    async fn load_folder(&self, key: &ProgressKey) -> Result<Option<VisitFolder>> {
        self.settle().await?;
        let _read = self.gate.read().await;
        let _lock = self.lock_file(false).await?;
        read_json(&self.doc_path(FOLDERS, &progress_file_id(key)?)).await
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let _write = self.gate.write().await;
        let _lock = self.lock_file(true).await?;
        self.recover().await?;

        let versions = self.check_guards(&tx).await?;

        let mut journal = Journal::default();
        if let Err(e) = self.stage(&tx, &versions, &mut journal).await {
            discard(&journal).await;
            return Err(e);
        }

        self.apply(&journal).await?;
        debug!(writes = tx.len(), root = %self.root.display(), "Committed transaction");
        Ok(())
    }
}

/// Remove staged files of a transaction that never reached its journal.
async fn discard(journal: &Journal) {
    for (staged, _) in &journal.renames {
        if let Err(e) = fs::remove_file(staged).await {
            debug!(path = %staged.display(), error = %e, "Could not remove staged file");
        }
    }
}

fn staged_path(target: &Path, index: usize) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", index));
    target.with_file_name(name)
}

/// Reject ids that would escape the storage directory.
fn file_id(id: &str) -> Result<String> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(StorageError::Other(format!("Invalid document id: {:?}", id)));
    }
    Ok(id.to_string())
}

fn progress_file_id(key: &ProgressKey) -> Result<String> {
    Ok(format!(
        "{}--{}",
        file_id(key.patient_id.as_str())?,
        file_id(key.phase_id.as_str())?
    ))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
