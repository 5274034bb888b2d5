//! Folder projection.

use std::sync::Arc;
use studyphase_core::{PatientId, PatientPhaseProgress, StudyId, VisitFolder};
use studyphase_storage::{Precondition, Storage, StorageError, Transaction};
use tracing::{debug, info};

use crate::error::Result;

/// Derives [`VisitFolder`] views from progress records.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderProjector;

impl FolderProjector {
    /// Create a projector.
    pub fn new() -> Self {
        Self
    }

    /// Project a progress record. Pure; persisting is up to the caller.
    pub fn resync(&self, progress: &PatientPhaseProgress) -> VisitFolder {
        VisitFolder {
            patient_id: progress.patient_id.clone(),
            phase_id: progress.phase_id.clone(),
            completion_percentage: progress.progress_percentage,
            completed_template_ids: progress.completed_template_ids(),
            can_progress_to_next_phase: progress.can_progress,
            blocking_template_ids: progress.blocking_template_ids(),
            status: progress.status,
        }
    }

    /// Regenerate every folder of a patient in a study from committed progress.
    ///
    /// Each folder is written together with a version check on its record; a
    /// record that changed meanwhile already had its folder resynced by the
    /// writer, so it is left alone.
    pub async fn rebuild(
        &self,
        storage: &Arc<dyn Storage>,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<VisitFolder>> {
        let records = storage.list_progress(patient_id, study_id).await?;
        let mut folders = Vec::with_capacity(records.len());

        for record in records {
            let folder = self.resync(&record.value);
            let tx = Transaction::new()
                .put_progress(record.value.clone(), Precondition::Version(record.version))
                .put_folder(folder.clone());
            match storage.commit(tx).await {
                Ok(()) => folders.push(folder),
                Err(StorageError::Conflict(_)) => {
                    debug!(
                        key = %record.value.key(),
                        "Record changed during rebuild; keeping writer's folder"
                    );
                    if let Some(current) = storage.load_folder(&record.value.key()).await? {
                        folders.push(current);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            patient = %patient_id,
            study = %study_id,
            folders = folders.len(),
            "Rebuilt visit folders"
        );
        Ok(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{complete, scenario_config, storage_with};
    use chrono::Utc;
    use studyphase_core::{ProgressStatus, TemplateId};

    #[test]
    fn test_resync_projects_fields() {
        let config = scenario_config();
        let mut progress = PatientPhaseProgress::new(PatientId::from("p1"), &config, Utc::now());
        complete(&mut progress, "consent");
        complete(&mut progress, "diary");
        progress.status = ProgressStatus::InProgress;

        let folder = FolderProjector::new().resync(&progress);
        assert_eq!(folder.completion_percentage, 67);
        assert_eq!(
            folder.completed_template_ids,
            vec![TemplateId::from("consent"), TemplateId::from("diary")]
        );
        assert_eq!(folder.blocking_template_ids, vec![TemplateId::from("demographics")]);
        assert!(!folder.can_progress_to_next_phase);
        assert_eq!(folder.status, ProgressStatus::InProgress);
    }

    #[tokio::test]
    async fn test_rebuild_restores_missing_folders() {
        let config = scenario_config();
        let storage = storage_with(vec![config.clone()]).await;
        let mut progress = PatientPhaseProgress::new(PatientId::from("p1"), &config, Utc::now());
        complete(&mut progress, "consent");
        storage
            .commit(Transaction::new().put_progress(progress.clone(), Precondition::Absent))
            .await
            .unwrap();
        assert!(storage.load_folder(&progress.key()).await.unwrap().is_none());

        let folders = FolderProjector::new()
            .rebuild(&storage, &PatientId::from("p1"), &config.study_id)
            .await
            .unwrap();

        assert_eq!(folders.len(), 1);
        let stored = storage.load_folder(&progress.key()).await.unwrap().unwrap();
        assert_eq!(stored, folders[0]);
        assert_eq!(stored.completed_template_ids, vec![TemplateId::from("consent")]);
    }
}
