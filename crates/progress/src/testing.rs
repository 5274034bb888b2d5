//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use chrono::Utc;
use studyphase_core::{
    PatientId, PatientPhaseProgress, PhaseConfig, PhaseConfigInput, PhaseId, ProgressKey,
    StudyId, TemplateAssignment, TemplateId, VisitFolder,
};
use studyphase_storage::{
    MemoryStorage, Precondition, Storage, StorageError, Transaction, Versioned,
};

/// Screening phase with two required forms and one optional form.
pub fn scenario_config() -> PhaseConfig {
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

/// Same shape as `scenario_config`, as creation input.
pub fn scenario_input(code: &str, order: i32) -> PhaseConfigInput {
    PhaseConfigInput::new(code, code, order)
        .with_assignment(TemplateAssignment::required("consent", "Informed consent"))
        .with_assignment(TemplateAssignment::required("demographics", "Demographics"))
        .with_assignment(TemplateAssignment::optional("diary", "Diet diary"))
}

/// Mark a template complete and recount.
pub fn complete(progress: &mut PatientPhaseProgress, template: &str) {
    if let Some(status) = progress
        .form_completion_status
        .get_mut(&TemplateId::from(template))
    {
        status.is_completed = true;
    }
    progress.recount();
}

/// Memory store seeded with phase configs.
pub async fn memory_with(configs: Vec<PhaseConfig>) -> MemoryStorage {
    let storage = MemoryStorage::new();
    let mut tx = Transaction::new();
    for config in configs {
        tx = tx.put_phase_config(config, Precondition::Absent);
    }
    storage.commit(tx).await.expect("seed storage");
    storage
}

/// In-memory store seeded with phase configs.
pub async fn storage_with(configs: Vec<PhaseConfig>) -> Arc<dyn Storage> {
    Arc::new(memory_with(configs).await)
}

/// Memory store whose next commits conflict, fail, or lose a race.
pub struct ScriptedStorage {
    inner: MemoryStorage,
    conflicts: AtomicUsize,
    failures: AtomicUsize,
    interleaved: Mutex<Option<Transaction>>,
}

impl ScriptedStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            interleaved: Mutex::new(None),
        }
    }

    /// Fail the next `n` commits with a conflict.
    pub fn conflict_next(self, n: usize) -> Self {
        self.conflicts.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` commits with an I/O error.
    pub fn fail_next(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Commit `tx` right before the next commit, as a concurrent writer would.
    pub fn interleave(self, tx: Transaction) -> Self {
        *self.interleaved.lock().unwrap() = Some(tx);
        self
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Storage for ScriptedStorage {
    async fn load_phase_config(
        &self,
        id: &PhaseId,
    ) -> studyphase_storage::Result<Option<Versioned<PhaseConfig>>> {
        self.inner.load_phase_config(id).await
    }

    async fn list_phase_configs(
        &self,
        study_id: &StudyId,
    ) -> studyphase_storage::Result<Vec<Versioned<PhaseConfig>>> {
        self.inner.list_phase_configs(study_id).await
    }

    async fn study_revision(&self, study_id: &StudyId) -> studyphase_storage::Result<Option<u64>> {
        self.inner.study_revision(study_id).await
    }

    async fn load_progress(
        &self,
        key: &ProgressKey,
    ) -> studyphase_storage::Result<Option<Versioned<PatientPhaseProgress>>> {
        self.inner.load_progress(key).await
    }

    async fn list_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> studyphase_storage::Result<Vec<Versioned<PatientPhaseProgress>>> {
        self.inner.list_progress(patient_id, study_id).await
    }

    async fn load_folder(
        &self,
        key: &ProgressKey,
    ) -> studyphase_storage::Result<Option<VisitFolder>> {
        self.inner.load_folder(key).await
    }

    async fn commit(&self, tx: Transaction) -> studyphase_storage::Result<()> {
        let interleaved = self.interleaved.lock().unwrap().take();
        if let Some(other) = interleaved {
            self.inner.commit(other).await?;
        }
        if take_one(&self.failures) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unavailable",
            )));
        }
        if take_one(&self.conflicts) {
            return Err(StorageError::Conflict("contended".to_string()));
        }
        self.inner.commit(tx).await
    }
}
