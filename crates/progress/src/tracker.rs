//! Progress tracking service.
//!
//! The state machine of a patient's phase: completion events and
//! administrative actions mutate a record, after which counts, status and the
//! transition decision are re-derived and the record is committed together
//! with its folder projection.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use studyphase_core::{
    FormCompletion, PatientId, PatientPhaseProgress, PhaseApproval, PhaseConfig, PhaseId,
    ProgressKey, ProgressStatus, StudyId, TemplateId, Time, VisitFolder,
};
use studyphase_storage::{Precondition, Storage, StorageError, Transaction};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ProgressError, Result};
use crate::folder::FolderProjector;
use crate::transition::{elapsed_days, TransitionDecision, TransitionEvaluator};

/// Tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Transparent retries of a conflicting commit before surfacing `Conflict`
    pub max_conflict_retries: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
        }
    }
}

/// Result of applying a change to a progress record.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    /// The record as committed (or as found, when unchanged)
    pub progress: PatientPhaseProgress,

    /// Whether anything was written
    pub changed: bool,
}

/// Applies completion events and administrative actions to progress records.
#[derive(Clone)]
pub struct ProgressTracker {
    storage: Arc<dyn Storage>,
    evaluator: TransitionEvaluator,
    projector: FolderProjector,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl ProgressTracker {
    /// Create a tracker with default evaluator, clock and config.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            evaluator: TransitionEvaluator::new(),
            projector: FolderProjector::new(),
            clock: Arc::new(SystemClock),
            config: TrackerConfig::default(),
        }
    }

    /// Set the transition evaluator.
    pub fn with_evaluator(mut self, evaluator: TransitionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Set the clock used for timestamps and date-based rules.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Record that a template was completed (or reopened).
    ///
    /// A change that matches the current state is a no-op, so redelivered
    /// events never double count.
    pub async fn apply_completion(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
        template_id: &TemplateId,
        completed: bool,
        form_instance_id: Option<String>,
    ) -> Result<CompletionOutcome> {
        let key = ProgressKey::new(patient_id.clone(), phase_id.clone());
        let outcome = self
            .update_record(&key, "completion", |record, _, now| {
                let Some(status) = record.form_completion_status.get_mut(template_id) else {
                    return Err(ProgressError::NotFound(format!(
                        "template {} in phase {}",
                        template_id, phase_id
                    )));
                };
                if status.is_completed == completed {
                    return Ok(false);
                }
                mark(status, completed, form_instance_id.clone(), now);

                if record.status == ProgressStatus::Skipped {
                    info!(key = %record.key(), "Completion resumed a skipped phase");
                    record.status = ProgressStatus::NotStarted;
                    record.skipped_date = None;
                    record.skipped_reason = None;
                }
                Ok(true)
            })
            .await?;

        if !outcome.changed {
            debug!(
                patient = %patient_id,
                phase = %phase_id,
                template = %template_id,
                "Duplicate completion ignored"
            );
        }
        Ok(outcome)
    }

    /// Skip a phase. Rejected unless the phase allows skipping.
    pub async fn skip_phase(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
        reason: &str,
    ) -> Result<CompletionOutcome> {
        if reason.trim().is_empty() {
            return Err(ProgressError::Validation(
                "A reason is required to skip a phase".to_string(),
            ));
        }
        let key = ProgressKey::new(patient_id.clone(), phase_id.clone());
        self.update_record(&key, "skip", |record, config, now| {
            if !config.allow_skip {
                return Err(ProgressError::Validation(format!(
                    "Phase {} cannot be skipped",
                    config.code
                )));
            }
            if record.status == ProgressStatus::Skipped {
                return Ok(false);
            }
            record.status = ProgressStatus::Skipped;
            record.skipped_date = Some(now);
            record.skipped_reason = Some(reason.to_string());
            Ok(true)
        })
        .await
    }

    /// Lock a phase; completions are still recorded but the status holds.
    pub async fn lock_phase(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<CompletionOutcome> {
        let key = ProgressKey::new(patient_id.clone(), phase_id.clone());
        self.update_record(&key, "lock", |record, _, _| {
            if record.status == ProgressStatus::Locked {
                return Ok(false);
            }
            record.status = ProgressStatus::Locked;
            record.skipped_date = None;
            record.skipped_reason = None;
            Ok(true)
        })
        .await
    }

    /// Unlock a phase and re-derive its status from the counts.
    pub async fn unlock_phase(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<CompletionOutcome> {
        let key = ProgressKey::new(patient_id.clone(), phase_id.clone());
        self.update_record(&key, "unlock", |record, _, _| {
            if record.status != ProgressStatus::Locked {
                return Ok(false);
            }
            record.status = ProgressStatus::NotStarted;
            Ok(true)
        })
        .await
    }

    /// Record an approval for leaving a phase. One approval per role.
    pub async fn record_approval(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
        role: &str,
        approved_by: &str,
    ) -> Result<CompletionOutcome> {
        if role.trim().is_empty() || approved_by.trim().is_empty() {
            return Err(ProgressError::Validation(
                "Approval needs a role and an approver".to_string(),
            ));
        }
        let key = ProgressKey::new(patient_id.clone(), phase_id.clone());
        self.update_record(&key, "approval", |record, _, now| {
            if record.approvals.iter().any(|a| a.role == role) {
                return Ok(false);
            }
            record.approvals.push(PhaseApproval {
                role: role.to_string(),
                approved_by: approved_by.to_string(),
                approved_at: now,
            });
            Ok(true)
        })
        .await
    }

    /// Evaluate the transition decision at the current time.
    ///
    /// Date-based rules move with the clock, so this may differ from the
    /// decision stored on the record.
    pub async fn evaluate(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<TransitionDecision> {
        let key = ProgressKey::new(patient_id.clone(), phase_id.clone());
        let record = self.get_record(&key).await?;
        let config = self.load_config(phase_id).await?;
        Ok(self
            .evaluator
            .can_advance_at(&record, &config, self.clock.now())
            .await)
    }

    /// All of a patient's records in a study, ordered by phase order.
    pub async fn get_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<PatientPhaseProgress>> {
        let records = self.storage.list_progress(patient_id, study_id).await?;
        if records.is_empty() {
            return Err(ProgressError::NotFound(format!(
                "progress of patient {} in study {}",
                patient_id, study_id
            )));
        }
        Ok(records.into_iter().map(|r| r.value).collect())
    }

    /// One progress record.
    pub async fn get_record(&self, key: &ProgressKey) -> Result<PatientPhaseProgress> {
        self.storage
            .load_progress(key)
            .await?
            .map(|r| r.value)
            .ok_or_else(|| ProgressError::NotFound(format!("progress {}", key)))
    }

    /// The folder projection of a record.
    pub async fn get_folder(&self, key: &ProgressKey) -> Result<VisitFolder> {
        self.storage
            .load_folder(key)
            .await?
            .ok_or_else(|| ProgressError::NotFound(format!("folder {}", key)))
    }

    /// Incomplete templates whose due offset has passed since the phase started.
    pub fn overdue_templates(
        progress: &PatientPhaseProgress,
        config: &PhaseConfig,
        now: Time,
    ) -> Vec<TemplateId> {
        if progress.status == ProgressStatus::Skipped {
            return Vec::new();
        }
        let Some(started) = progress.started_date else {
            return Vec::new();
        };
        let elapsed = elapsed_days(started, now);

        config
            .template_assignments
            .iter()
            .filter(|a| matches!(a.due_after_days, Some(due) if elapsed > due))
            .filter(|a| !progress.is_template_completed(&a.template_id))
            .map(|a| a.template_id.clone())
            .collect()
    }

    /// Load, mutate, re-derive and commit a record with its folder.
    ///
    /// `mutate` returns `Ok(false)` when the record needs no change. A commit
    /// that loses the version race is retried against the fresh record.
    async fn update_record<F>(
        &self,
        key: &ProgressKey,
        action: &str,
        mut mutate: F,
    ) -> Result<CompletionOutcome>
    where
        F: FnMut(&mut PatientPhaseProgress, &PhaseConfig, Time) -> Result<bool> + Send,
    {
        let attempts = self.config.max_conflict_retries + 1;
        let mut last_conflict = String::new();

        for attempt in 1..=attempts {
            let current = self
                .storage
                .load_progress(key)
                .await?
                .ok_or_else(|| ProgressError::NotFound(format!("progress {}", key)))?;
            let config = self.load_config(&key.phase_id).await?;
            let now = self.clock.now();

            let mut record = current.value.clone();
            if !mutate(&mut record, &config, now)? {
                return Ok(CompletionOutcome {
                    progress: current.value,
                    changed: false,
                });
            }
            self.refresh(&mut record, &config, now).await;

            let tx = Transaction::new()
                .put_progress(record.clone(), Precondition::Version(current.version))
                .put_folder(self.projector.resync(&record));

            match self.storage.commit(tx).await {
                Ok(()) => {
                    info!(
                        key = %key,
                        action,
                        status = %record.status,
                        completed = record.completed_templates,
                        total = record.total_templates,
                        can_progress = record.can_progress,
                        "Progress updated"
                    );
                    return Ok(CompletionOutcome {
                        progress: record,
                        changed: true,
                    });
                }
                Err(StorageError::Conflict(msg)) => {
                    warn!(key = %key, action, attempt, "Progress commit conflicted, retrying");
                    last_conflict = msg;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProgressError::Conflict(format!(
            "{} on {} failed after {} attempts: {}",
            action, key, attempts, last_conflict
        )))
    }

    /// Re-derive counts, status and the transition decision.
    async fn refresh(&self, record: &mut PatientPhaseProgress, config: &PhaseConfig, now: Time) {
        record.recount();
        derive_status(record, now);
        let decision = self.evaluator.can_advance_at(record, config, now).await;
        record.can_progress = decision.can_advance;
        record.blocking_reasons = decision.reasons;
        record.updated_at = now;
    }

    async fn load_config(&self, phase_id: &PhaseId) -> Result<PhaseConfig> {
        self.storage
            .load_phase_config(phase_id)
            .await?
            .map(|c| c.value)
            .ok_or_else(|| ProgressError::NotFound(format!("phase {}", phase_id)))
    }
}

fn mark(status: &mut FormCompletion, completed: bool, form_instance_id: Option<String>, now: Time) {
    status.is_completed = completed;
    if completed {
        status.completed_date = Some(now);
        status.form_instance_id = form_instance_id;
    } else {
        status.completed_date = None;
        status.form_instance_id = None;
    }
}

/// Derive status from counts. Locked and skipped are left alone.
pub fn derive_status(record: &mut PatientPhaseProgress, now: Time) {
    if record.completed_templates > 0 && record.started_date.is_none() {
        record.started_date = Some(now);
    }
    if record.status.is_administrative() {
        return;
    }

    if record.completed_templates == 0 {
        record.status = ProgressStatus::NotStarted;
        record.completed_date = None;
    } else if record.completed_templates == record.total_templates {
        record.status = ProgressStatus::Completed;
        record.completed_date.get_or_insert(now);
    } else {
        record.status = ProgressStatus::InProgress;
        record.completed_date = None;
    }
}
