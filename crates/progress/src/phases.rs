//! Phase configuration store.

use std::collections::HashSet;
use std::sync::Arc;
use studyphase_core::{
    PhaseConfig, PhaseConfigInput, PhaseId, PhasePatch, StudyId, TemplateAssignment,
    TransitionCondition, TransitionRule,
};
use studyphase_storage::{Precondition, Storage, Transaction};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{ProgressError, Result};

/// CRUD over a study's ordered phase definitions.
#[derive(Clone)]
pub struct PhaseConfigStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl PhaseConfigStore {
    /// Create a store over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create phases for a study in one atomic write.
    ///
    /// Orders must be unique among the new phases and the study's active phases.
    /// The commit is guarded on the study's phase-set revision, so a concurrent
    /// edit of the same study fails with `Conflict` instead of reusing an order.
    pub async fn create_phases(
        &self,
        study_id: &StudyId,
        inputs: Vec<PhaseConfigInput>,
    ) -> Result<Vec<PhaseConfig>> {
        if inputs.is_empty() {
            return Err(ProgressError::Validation(
                "At least one phase is required".to_string(),
            ));
        }

        let revision = self.storage.study_revision(study_id).await?;
        let existing = self.storage.list_phase_configs(study_id).await?;
        let mut taken: HashSet<i32> = existing
            .iter()
            .filter(|c| c.value.active)
            .map(|c| c.value.order)
            .collect();

        let now = self.clock.now();
        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            if !taken.insert(input.order) {
                return Err(ProgressError::Validation(format!(
                    "Phase order {} is already used in study {}",
                    input.order, study_id
                )));
            }

            let id = PhaseId::generate();
            let config = PhaseConfig {
                transition_rules: scope_rules(&id, input.transition_rules),
                id,
                study_id: study_id.clone(),
                name: input.name,
                code: input.code,
                order: input.order,
                template_assignments: input.template_assignments,
                window_start_days: input.window_start_days,
                window_end_days: input.window_end_days,
                allow_skip: input.allow_skip,
                allow_parallel: input.allow_parallel,
                active: true,
                created_at: now,
                updated_at: now,
            };
            validate_config(&config)?;
            created.push(config);
        }

        let tx = created.iter().fold(
            Transaction::new().touch_study(study_id.clone(), revision_guard(revision)),
            |tx, c| tx.put_phase_config(c.clone(), Precondition::Absent),
        );
        self.storage.commit(tx).await?;

        created.sort_by_key(|c| c.order);
        info!(study = %study_id, phases = created.len(), "Created study phases");
        Ok(created)
    }

    /// Active phases of a study, ordered by `order`.
    pub async fn get_phases(&self, study_id: &StudyId) -> Result<Vec<PhaseConfig>> {
        let phases = self.get_all_phases(study_id).await?;
        Ok(phases.into_iter().filter(|c| c.active).collect())
    }

    /// All phases of a study including soft-invalidated ones.
    pub async fn get_all_phases(&self, study_id: &StudyId) -> Result<Vec<PhaseConfig>> {
        let phases = self.storage.list_phase_configs(study_id).await?;
        if phases.is_empty() {
            return Err(ProgressError::NotFound(format!("study {}", study_id)));
        }
        Ok(phases.into_iter().map(|c| c.value).collect())
    }

    /// Load one phase.
    pub async fn get_phase(&self, id: &PhaseId) -> Result<PhaseConfig> {
        self.storage
            .load_phase_config(id)
            .await?
            .map(|c| c.value)
            .ok_or_else(|| ProgressError::NotFound(format!("phase {}", id)))
    }

    /// Apply a partial update to a phase.
    ///
    /// Existing progress records keep the template counts they were
    /// bootstrapped with.
    pub async fn update_phase(&self, id: &PhaseId, patch: PhasePatch) -> Result<PhaseConfig> {
        let current = self
            .storage
            .load_phase_config(id)
            .await?
            .ok_or_else(|| ProgressError::NotFound(format!("phase {}", id)))?;

        let reorders = patch.order.is_some();
        let mut config = current.value;
        if let Some(name) = patch.name {
            config.name = name;
        }
        if let Some(code) = patch.code {
            config.code = code;
        }
        if let Some(order) = patch.order {
            config.order = order;
        }
        if let Some(assignments) = patch.template_assignments {
            config.template_assignments = assignments;
        }
        if let Some(days) = patch.window_start_days {
            config.window_start_days = Some(days);
        }
        if let Some(days) = patch.window_end_days {
            config.window_end_days = Some(days);
        }
        if let Some(allow) = patch.allow_skip {
            config.allow_skip = allow;
        }
        if let Some(allow) = patch.allow_parallel {
            config.allow_parallel = allow;
        }
        if let Some(rules) = patch.transition_rules {
            config.transition_rules = scope_rules(&config.id, rules);
        }
        validate_config(&config)?;

        let mut tx = Transaction::new();
        if config.active {
            let revision = self.storage.study_revision(&config.study_id).await?;
            let siblings = self.storage.list_phase_configs(&config.study_id).await?;
            let taken = siblings.iter().any(|s| {
                s.value.active && s.value.id != config.id && s.value.order == config.order
            });
            if taken {
                return Err(ProgressError::Validation(format!(
                    "Phase order {} is already used in study {}",
                    config.order, config.study_id
                )));
            }
            if reorders {
                tx = tx.touch_study(config.study_id.clone(), revision_guard(revision));
            }
        }

        config.updated_at = self.clock.now();
        self.storage
            .commit(tx.put_phase_config(config.clone(), Precondition::Version(current.version)))
            .await?;

        info!(phase = %config.id, "Updated phase config");
        Ok(config)
    }

    /// Soft-invalidate a phase. It stays readable but is never bootstrapped again.
    pub async fn deactivate_phase(&self, id: &PhaseId) -> Result<PhaseConfig> {
        let current = self
            .storage
            .load_phase_config(id)
            .await?
            .ok_or_else(|| ProgressError::NotFound(format!("phase {}", id)))?;
        if !current.value.active {
            return Ok(current.value);
        }

        let mut config = current.value;
        config.active = false;
        config.updated_at = self.clock.now();
        self.storage
            .commit(
                Transaction::new()
                    .put_phase_config(config.clone(), Precondition::Version(current.version)),
            )
            .await?;

        info!(phase = %config.id, "Deactivated phase config");
        Ok(config)
    }
}

fn revision_guard(revision: Option<u64>) -> Precondition {
    revision.map_or(Precondition::Absent, Precondition::Version)
}

fn scope_rules(id: &PhaseId, rules: Vec<TransitionRule>) -> Vec<TransitionRule> {
    rules
        .into_iter()
        .map(|mut r| {
            r.from_phase = id.clone();
            r
        })
        .collect()
}

/// Check a phase config's invariants.
pub fn validate_config(config: &PhaseConfig) -> Result<()> {
    let fail = |msg: String| {
        Err(ProgressError::Validation(format!("Phase '{}': {}", config.name, msg)))
    };

    if config.name.trim().is_empty() {
        return Err(ProgressError::Validation("Phase name cannot be empty".to_string()));
    }
    if config.code.trim().is_empty() {
        return fail("code cannot be empty".to_string());
    }
    if config.template_assignments.is_empty() {
        return fail("at least one template assignment is required".to_string());
    }

    let mut seen = HashSet::new();
    for TemplateAssignment {
        template_id,
        due_after_days,
        ..
    } in &config.template_assignments
    {
        if !seen.insert(template_id) {
            return fail(format!("template {} is assigned more than once", template_id));
        }
        if matches!(due_after_days, Some(d) if *d < 0) {
            return fail(format!("template {} has a negative due offset", template_id));
        }
    }

    if let (Some(start), Some(end)) = (config.window_start_days, config.window_end_days) {
        if start > end {
            return fail(format!("window starts after it ends ({} > {})", start, end));
        }
    }

    for rule in &config.transition_rules {
        if rule.to_phase.as_ref() == Some(&config.id) {
            return fail("a transition rule cannot target its own phase".to_string());
        }
        for condition in &rule.conditions {
            match condition {
                TransitionCondition::SpecificFormsCompleted { form_ids } => {
                    let unknown = form_ids.iter().find(|id| config.assignment(id).is_none());
                    if let Some(unknown) = unknown {
                        return fail(format!(
                            "transition rule references unassigned template {}",
                            unknown
                        ));
                    }
                }
                TransitionCondition::DateBased {
                    days_after_enrollment,
                } if *days_after_enrollment < 0 => {
                    return fail("date-based condition cannot use negative days".to_string());
                }
                _ => {}
            }
        }
    }

    Ok(())
}
