//! Patient bootstrap.
//!
//! Materializes one progress record and one folder projection per active
//! phase when a patient enters a study. All records of a bootstrap land in a
//! single transaction.

use std::collections::HashSet;
use std::sync::Arc;
use studyphase_core::{PatientId, PatientPhaseProgress, PhaseConfig, StudyId, Time};
use studyphase_storage::{Precondition, Storage, Transaction};
use tracing::{debug, info, warn};

use crate::catalog::TemplateCatalog;
use crate::clock::{Clock, SystemClock};
use crate::error::{ProgressError, Result};
use crate::folder::FolderProjector;
use crate::transition::basic_gate;

/// Attempts before a contended bootstrap gives up.
const MAX_BOOTSTRAP_ATTEMPTS: usize = 3;

/// Creates per-patient progress for a study's phases.
#[derive(Clone)]
pub struct PhaseBootstrapper {
    storage: Arc<dyn Storage>,
    catalog: Option<Arc<dyn TemplateCatalog>>,
    projector: FolderProjector,
    clock: Arc<dyn Clock>,
}

impl PhaseBootstrapper {
    /// Create a bootstrapper without catalog validation.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            catalog: None,
            projector: FolderProjector::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Validate template references against a catalog.
    pub fn with_catalog(mut self, catalog: Arc<dyn TemplateCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bootstrap a patient into a study.
    ///
    /// Only active phases without an existing record are created, so calling
    /// this again for a bootstrapped patient changes nothing. Returns every
    /// record the patient has in the study, ordered by phase order.
    pub async fn bootstrap_patient(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<PatientPhaseProgress>> {
        let configs = self.storage.list_phase_configs(study_id).await?;
        if configs.is_empty() {
            return Err(ProgressError::NotFound(format!("study {}", study_id)));
        }
        let phases: Vec<PhaseConfig> = configs
            .into_iter()
            .map(|c| c.value)
            .filter(|c| c.active && !c.template_assignments.is_empty())
            .collect();

        self.validate_templates(&phases).await?;

        let mut last_conflict = String::new();
        for attempt in 1..=MAX_BOOTSTRAP_ATTEMPTS {
            let existing = self.storage.list_progress(patient_id, study_id).await?;
            let tracked: HashSet<_> = existing.iter().map(|r| r.value.phase_id.clone()).collect();

            let now = self.clock.now();
            let created: Vec<PatientPhaseProgress> = phases
                .iter()
                .filter(|c| !tracked.contains(&c.id))
                .map(|c| seed(patient_id, c, now))
                .collect();

            if created.is_empty() {
                debug!(patient = %patient_id, study = %study_id, "Patient already bootstrapped");
                return Ok(existing.into_iter().map(|r| r.value).collect());
            }

            let tx = created.iter().fold(Transaction::new(), |tx, record| {
                tx.put_progress(record.clone(), Precondition::Absent)
                    .put_folder(self.projector.resync(record))
            });

            match self.storage.commit(tx).await.map_err(ProgressError::from) {
                Ok(()) => {
                    info!(
                        patient = %patient_id,
                        study = %study_id,
                        created = created.len(),
                        "Bootstrapped patient phases"
                    );
                    let mut records: Vec<_> = existing
                        .into_iter()
                        .map(|r| r.value)
                        .chain(created)
                        .collect();
                    records.sort_by_key(|r| r.phase_order);
                    return Ok(records);
                }
                Err(ProgressError::Conflict(msg)) => {
                    warn!(
                        patient = %patient_id,
                        attempt,
                        "Concurrent bootstrap detected, retrying"
                    );
                    last_conflict = msg;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProgressError::Conflict(format!(
            "bootstrap of {} in {} kept conflicting: {}",
            patient_id, study_id, last_conflict
        )))
    }

    async fn validate_templates(&self, phases: &[PhaseConfig]) -> Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };

        let mut checked = HashSet::new();
        for assignment in phases.iter().flat_map(|p| &p.template_assignments) {
            if !checked.insert(&assignment.template_id) {
                continue;
            }
            match catalog.get_template(&assignment.template_id).await? {
                Some(meta) if meta.active => {}
                Some(_) => {
                    return Err(ProgressError::Validation(format!(
                        "Template {} is inactive",
                        assignment.template_id
                    )))
                }
                None => {
                    return Err(ProgressError::Validation(format!(
                        "Template {} is not in the catalog",
                        assignment.template_id
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Fresh record with its initial blocking reasons.
fn seed(patient_id: &PatientId, config: &PhaseConfig, now: Time) -> PatientPhaseProgress {
    let mut record = PatientPhaseProgress::new(patient_id.clone(), config, now);
    record.blocking_reasons = match basic_gate(&record) {
        Some(reason) => vec![reason],
        None => vec!["Phase has not started".to_string()],
    };
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::testing::{memory_with, scenario_config, storage_with, ScriptedStorage};
    use chrono::Utc;
    use studyphase_core::{
        PhaseId, ProgressKey, ProgressStatus, TemplateAssignment, TemplateId, TemplateMeta,
    };

    fn treatment() -> PhaseConfig {
        let mut config = scenario_config();
        config.id = PhaseId::from("tx");
        config.code = "TX".to_string();
        config.order = 2;
        config.template_assignments = vec![TemplateAssignment::required("dosing", "Dosing log")];
        config
    }

    #[tokio::test]
    async fn test_bootstrap_creates_records_and_folders() {
        let storage = storage_with(vec![treatment(), scenario_config()]).await;
        let records = PhaseBootstrapper::new(storage.clone())
            .bootstrap_patient(&PatientId::from("p1"), &StudyId::from("study-1"))
            .await
            .unwrap();

        let phases: Vec<_> = records.iter().map(|r| r.phase_id.as_str()).collect();
        assert_eq!(phases, vec!["scr", "tx"]);

        let scr = &records[0];
        assert_eq!(scr.status, ProgressStatus::NotStarted);
        assert_eq!(scr.total_templates, 3);
        assert_eq!(scr.required_templates, 2);
        assert_eq!(scr.completed_templates, 0);
        assert!(!scr.can_progress);
        assert_eq!(scr.blocking_reasons.len(), 1);

        let folder = storage.load_folder(&scr.key()).await.unwrap().unwrap();
        assert!(!folder.can_progress_to_next_phase);
        assert_eq!(
            folder.blocking_template_ids,
            vec![TemplateId::from("consent"), TemplateId::from("demographics")]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let storage = storage_with(vec![scenario_config()]).await;
        let bootstrapper = PhaseBootstrapper::new(storage.clone());
        let patient = PatientId::from("p1");
        let study = StudyId::from("study-1");

        let first = bootstrapper.bootstrap_patient(&patient, &study).await.unwrap();
        let second = bootstrapper.bootstrap_patient(&patient, &study).await.unwrap();
        assert_eq!(first, second);

        let stored = storage.load_progress(&first[0].key()).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_adds_new_phases_only() {
        let storage = storage_with(vec![scenario_config()]).await;
        let bootstrapper = PhaseBootstrapper::new(storage.clone());
        let patient = PatientId::from("p1");
        let study = StudyId::from("study-1");
        bootstrapper.bootstrap_patient(&patient, &study).await.unwrap();

        storage
            .commit(Transaction::new().put_phase_config(treatment(), Precondition::Absent))
            .await
            .unwrap();
        let records = bootstrapper.bootstrap_patient(&patient, &study).await.unwrap();
        assert_eq!(records.len(), 2);

        let scr = storage.load_progress(&records[0].key()).await.unwrap().unwrap();
        assert_eq!(scr.version, 1);
    }

    #[tokio::test]
    async fn test_inactive_and_empty_phases_skipped() {
        let mut inactive = treatment();
        inactive.active = false;
        let mut empty = treatment();
        empty.id = PhaseId::from("fu");
        empty.order = 3;
        empty.template_assignments.clear();

        let storage = storage_with(vec![scenario_config(), inactive, empty]).await;
        let records = PhaseBootstrapper::new(storage)
            .bootstrap_patient(&PatientId::from("p1"), &StudyId::from("study-1"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].phase_id, PhaseId::from("scr"));
    }

    #[tokio::test]
    async fn test_unknown_study_not_found() {
        let storage = storage_with(Vec::new()).await;
        let result = PhaseBootstrapper::new(storage)
            .bootstrap_patient(&PatientId::from("p1"), &StudyId::from("nope"))
            .await;
        assert!(matches!(result, Err(ProgressError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_catalog_rejects_unknown_template_and_writes_nothing() {
        let storage = storage_with(vec![scenario_config(), treatment()]).await;
        let catalog: StaticCatalog = ["consent", "demographics", "diary"]
            .into_iter()
            .map(|id| TemplateMeta::new(id, id))
            .collect();

        let patient = PatientId::from("p1");
        let study = StudyId::from("study-1");
        let result = PhaseBootstrapper::new(storage.clone())
            .with_catalog(Arc::new(catalog))
            .bootstrap_patient(&patient, &study)
            .await;

        assert!(matches!(result, Err(ProgressError::Validation(_))));
        assert!(storage.list_progress(&patient, &study).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_race_returns_winner_records() {
        let patient = PatientId::from("p1");
        let study = StudyId::from("study-1");

        // Another bootstrap lands between our listing and our commit.
        let winner = seed(&patient, &scenario_config(), Utc::now());
        let storage: Arc<dyn Storage> = Arc::new(
            ScriptedStorage::new(memory_with(vec![scenario_config()]).await).interleave(
                Transaction::new()
                    .put_progress(winner.clone(), Precondition::Absent)
                    .put_folder(FolderProjector::new().resync(&winner)),
            ),
        );

        let records = PhaseBootstrapper::new(storage.clone())
            .bootstrap_patient(&patient, &study)
            .await
            .unwrap();
        assert_eq!(records, vec![winner.clone()]);

        let stored = storage.list_progress(&patient, &study).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].version, 1);
        assert_eq!(stored[0].value, winner);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_attempts() {
        let inner = memory_with(vec![scenario_config()]).await;
        let storage: Arc<dyn Storage> =
            Arc::new(ScriptedStorage::new(inner).conflict_next(MAX_BOOTSTRAP_ATTEMPTS));

        let patient = PatientId::from("p1");
        let study = StudyId::from("study-1");
        let result = PhaseBootstrapper::new(storage.clone())
            .bootstrap_patient(&patient, &study)
            .await;

        assert!(matches!(result, Err(ProgressError::Conflict(_))));
        assert!(storage.list_progress(&patient, &study).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_retried_within_attempts() {
        let inner = memory_with(vec![scenario_config(), treatment()]).await;
        let storage: Arc<dyn Storage> = Arc::new(
            ScriptedStorage::new(inner).conflict_next(MAX_BOOTSTRAP_ATTEMPTS - 1),
        );

        let records = PhaseBootstrapper::new(storage)
            .bootstrap_patient(&PatientId::from("p1"), &StudyId::from("study-1"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let inner = memory_with(vec![scenario_config(), treatment()]).await;
        let storage: Arc<dyn Storage> = Arc::new(ScriptedStorage::new(inner).fail_next(1));

        let patient = PatientId::from("p1");
        let study = StudyId::from("study-1");
        let result = PhaseBootstrapper::new(storage.clone())
            .bootstrap_patient(&patient, &study)
            .await;

        assert!(matches!(result, Err(ProgressError::Dependency(_))));
        assert!(storage.list_progress(&patient, &study).await.unwrap().is_empty());
        let key = ProgressKey::new(patient, PhaseId::from("scr"));
        assert!(storage.load_folder(&key).await.unwrap().is_none());
    }
}
