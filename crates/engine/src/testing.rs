//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use studyphase_core::{
    PatientId, PatientPhaseProgress, PhaseConfig, PhaseId, ProgressKey, StudyId,
    TemplateAssignment, VisitFolder,
};
use studyphase_progress::PhaseBootstrapper;
use studyphase_storage::{
    MemoryStorage, Precondition, Result, Storage, StorageError, Transaction, Versioned,
};

/// Screening phase with two required forms and one optional form.
pub fn screening() -> PhaseConfig {
    let now = Utc::now();
    PhaseConfig {
        id: PhaseId::from("scr"),
        study_id: StudyId::from("study-1"),
        name: "Screening".to_string(),
        code: "SCR".to_string(),
        order: 1,
        template_assignments: vec![
            TemplateAssignment::required("consent", "Informed consent"),
            TemplateAssignment::required("demographics", "Demographics"),
            TemplateAssignment::optional("diary", "Diet diary"),
        ],
        window_start_days: None,
        window_end_days: None,
        allow_skip: true,
        allow_parallel: false,
        transition_rules: Vec::new(),
        active: true,
        created_at: now,
        updated_at: now,
    }
}

/// Memory store that can fail or slow down commits.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    failures: AtomicUsize,
    delay_ms: AtomicUsize,
}

impl FlakyStorage {
    /// Fail the next `n` commits with an I/O error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Sleep before every commit.
    pub fn delay_commits(&self, ms: usize) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn load_phase_config(&self, id: &PhaseId) -> Result<Option<Versioned<PhaseConfig>>> {
        self.inner.load_phase_config(id).await
    }

    async fn list_phase_configs(&self, study_id: &StudyId) -> Result<Vec<Versioned<PhaseConfig>>> {
        self.inner.list_phase_configs(study_id).await
    }

    async fn study_revision(&self, study_id: &StudyId) -> Result<Option<u64>> {
        self.inner.study_revision(study_id).await
    }

    async fn load_progress(
        &self,
        key: &ProgressKey,
    ) -> Result<Option<Versioned<PatientPhaseProgress>>> {
        self.inner.load_progress(key).await
    }

    async fn list_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<Versioned<PatientPhaseProgress>>> {
        self.inner.list_progress(patient_id, study_id).await
    }

    async fn load_folder(&self, key: &ProgressKey) -> Result<Option<VisitFolder>> {
        self.inner.load_folder(key).await
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store unavailable",
            )));
        }
        self.inner.commit(tx).await
    }
}

/// A flaky store holding the screening phase and bootstrapped patients.
pub async fn bootstrapped(patients: &[&str]) -> Arc<FlakyStorage> {
    let storage = Arc::new(FlakyStorage::default());
    storage
        .commit(Transaction::new().put_phase_config(screening(), Precondition::Absent))
        .await
        .expect("seed phase");

    let bootstrapper = PhaseBootstrapper::new(storage.clone());
    for patient in patients {
        bootstrapper
            .bootstrap_patient(&PatientId::from(*patient), &StudyId::from("study-1"))
            .await
            .expect("bootstrap patient");
    }
    storage
}
