//! In-memory storage implementation.
//!
//! Keeps every document in process memory behind one `RwLock`, so a commit is
//! observed by readers entirely or not at all. Used by tests and by embedders
//! that persist elsewhere.

use std::collections::HashMap;
use async_trait::async_trait;
use studyphase_core::{
    PatientId, PatientPhaseProgress, PhaseConfig, PhaseId, ProgressKey, StudyId, VisitFolder,
};
use tokio::sync::RwLock;
use tracing::debug;

use super::{Precondition, Result, Storage, Transaction, Versioned, Write};

#[derive(Default)]
struct State {
    phases: HashMap<PhaseId, Versioned<PhaseConfig>>,
    progress: HashMap<ProgressKey, Versioned<PatientPhaseProgress>>,
    folders: HashMap<ProgressKey, Versioned<VisitFolder>>,
    studies: HashMap<StudyId, u64>,
}

impl State {
    fn current_version(&self, write: &Write) -> Option<u64> {
        match write {
            Write::PhaseConfig(c) => self.phases.get(&c.id).map(|v| v.version),
            Write::Progress(p) => self.progress.get(&p.key()).map(|v| v.version),
            Write::Folder(f) => self.folders.get(&f.key()).map(|v| v.version),
            Write::StudyRevision(s) => self.studies.get(s).copied(),
        }
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::PhaseConfig(c) => {
                let version = self.phases.get(&c.id).map_or(0, |v| v.version) + 1;
                self.phases.insert(c.id.clone(), Versioned::new(version, c));
            }
            Write::Progress(p) => {
                let key = p.key();
                let version = self.progress.get(&key).map_or(0, |v| v.version) + 1;
                self.progress.insert(key, Versioned::new(version, p));
            }
            Write::Folder(f) => {
                let key = f.key();
                let version = self.folders.get(&key).map_or(0, |v| v.version) + 1;
                self.folders.insert(key, Versioned::new(version, f));
            }
            Write::StudyRevision(s) => {
                *self.studies.entry(s).or_insert(0) += 1;
            }
        }
    }
}

/// Process-local storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_phase_config(&self, id: &PhaseId) -> Result<Option<Versioned<PhaseConfig>>> {
        Ok(self.state.read().await.phases.get(id).cloned())
    }

    async fn list_phase_configs(&self, study_id: &StudyId) -> Result<Vec<Versioned<PhaseConfig>>> {
        let state = self.state.read().await;
        let mut configs: Vec<_> = state
            .phases
            .values()
            .filter(|c| &c.value.study_id == study_id)
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.value.order);
        Ok(configs)
    }

    async fn study_revision(&self, study_id: &StudyId) -> Result<Option<u64>> {
        Ok(self.state.read().await.studies.get(study_id).copied())
    }

    async fn load_progress(
        &self,
        key: &ProgressKey,
    ) -> Result<Option<Versioned<PatientPhaseProgress>>> {
        Ok(self.state.read().await.progress.get(key).cloned())
    }

    async fn list_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<Versioned<PatientPhaseProgress>>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .progress
            .values()
            .filter(|p| &p.value.patient_id == patient_id && &p.value.study_id == study_id)
            .cloned()
            .collect();
        records.sort_by_key(|p| p.value.phase_order);
        Ok(records)
    }

    async fn load_folder(&self, key: &ProgressKey) -> Result<Option<VisitFolder>> {
        Ok(self
            .state
            .read()
            .await
            .folders
            .get(key)
            .map(|f| f.value.clone()))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let mut state = self.state.write().await;

        for (write, guard) in tx.writes() {
            guard.check(state.current_version(write), &write.describe())?;
        }

        let count = tx.len();
        for (write, _) in tx.into_writes() {
            state.apply(write);
        }
        debug!(writes = count, "Committed transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;
    use chrono::Utc;
    use studyphase_core::TemplateAssignment;

    fn phase(id: &str, order: i32) -> PhaseConfig {
        let now = Utc::now();
        PhaseConfig {
            id: PhaseId::from(id),
            study_id: StudyId::from("study"),
            name: id.to_string(),
            code: id.to_uppercase(),
            order,
            template_assignments: vec![TemplateAssignment::required("t1", "T1")],
            window_start_days: None,
            window_end_days: None,
            allow_skip: false,
            allow_parallel: false,
            transition_rules: Vec::new(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_phase_configs_listed_by_order() {
        let storage = MemoryStorage::new();
        storage
            .commit(
                Transaction::new()
                    .put_phase_config(phase("fu", 3), Precondition::Absent)
                    .put_phase_config(phase("scr", 1), Precondition::Absent)
                    .put_phase_config(phase("tx", 2), Precondition::Absent),
            )
            .await
            .unwrap();

        let listed = storage.list_phase_configs(&StudyId::from("study")).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.value.id.as_str()).collect();
        assert_eq!(ids, vec!["scr", "tx", "fu"]);
        assert!(listed.iter().all(|c| c.version == 1));
    }

    #[tokio::test]
    async fn test_failed_precondition_applies_nothing() {
        let storage = MemoryStorage::new();
        let config = phase("scr", 1);
        let progress = PatientPhaseProgress::new(PatientId::from("p1"), &config, Utc::now());

        storage
            .commit(Transaction::new().put_phase_config(config.clone(), Precondition::Absent))
            .await
            .unwrap();

        // The second write conflicts, so the progress write must not land either.
        let result = storage
            .commit(
                Transaction::new()
                    .put_progress(progress.clone(), Precondition::Absent)
                    .put_phase_config(config, Precondition::Absent),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert!(storage.load_progress(&progress.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_versions_increment() {
        let storage = MemoryStorage::new();
        let config = phase("scr", 1);
        let progress = PatientPhaseProgress::new(PatientId::from("p1"), &config, Utc::now());
        let key = progress.key();

        storage
            .commit(Transaction::new().put_progress(progress.clone(), Precondition::Absent))
            .await
            .unwrap();
        storage
            .commit(Transaction::new().put_progress(progress.clone(), Precondition::Version(1)))
            .await
            .unwrap();

        let loaded = storage.load_progress(&key).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);

        let stale = storage
            .commit(Transaction::new().put_progress(progress, Precondition::Version(1)))
            .await;
        assert!(matches!(stale, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_study_revision_guards_phase_set() {
        let storage = MemoryStorage::new();
        let study = StudyId::from("study");
        assert_eq!(storage.study_revision(&study).await.unwrap(), None);

        storage
            .commit(Transaction::new().touch_study(study.clone(), Precondition::Absent))
            .await
            .unwrap();
        storage
            .commit(Transaction::new().touch_study(study.clone(), Precondition::Version(1)))
            .await
            .unwrap();
        assert_eq!(storage.study_revision(&study).await.unwrap(), Some(2));

        let stale = storage
            .commit(
                Transaction::new()
                    .touch_study(study.clone(), Precondition::Version(1))
                    .put_phase_config(phase("scr", 1), Precondition::Absent),
            )
            .await;
        assert!(matches!(stale, Err(StorageError::Conflict(_))));
        assert!(storage.load_phase_config(&PhaseId::from("scr")).await.unwrap().is_none());
    }
}
