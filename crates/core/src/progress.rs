//! Per-patient phase progress - the aggregate the engine owns.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::id::{PatientId, PhaseId, ProgressKey, StudyId, TemplateId};
use crate::phase::PhaseConfig;
use crate::Time;

/// Progress of one patient through one phase.
///
/// Counts and derived fields are recomputed from `form_completion_status`
/// on every change; they are never mutated independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientPhaseProgress {
    /// Patient
    pub patient_id: PatientId,

    /// Study
    pub study_id: StudyId,

    /// Phase
    pub phase_id: PhaseId,

    /// Phase order at bootstrap time, for listing
    pub phase_order: i32,

    /// Lifecycle status
    pub status: ProgressStatus,

    /// Assigned templates at bootstrap time
    pub total_templates: usize,

    /// Required templates at bootstrap time
    pub required_templates: usize,

    /// Completed templates
    pub completed_templates: usize,

    /// Completed required templates
    pub completed_required_templates: usize,

    /// Completion state per template
    pub form_completion_status: BTreeMap<TemplateId, FormCompletion>,

    /// Rounded completion percentage
    pub progress_percentage: u8,

    /// Whether the patient may move on
    pub can_progress: bool,

    /// Why the patient may not move on
    pub blocking_reasons: Vec<String>,

    /// Approvals recorded against this phase
    #[serde(default)]
    pub approvals: Vec<PhaseApproval>,

    /// First completion time
    pub started_date: Option<Time>,

    /// Time all templates were complete
    pub completed_date: Option<Time>,

    /// Time the phase was skipped
    pub skipped_date: Option<Time>,

    /// Why the phase was skipped
    pub skipped_reason: Option<String>,

    /// Last modified at
    pub updated_at: Time,
}

impl PatientPhaseProgress {
    /// Fresh, not-started progress for a phase.
    pub fn new(patient_id: PatientId, config: &PhaseConfig, now: Time) -> Self {
        let form_completion_status = config
            .template_assignments
            .iter()
            .map(|a| {
                (
                    a.template_id.clone(),
                    FormCompletion {
                        is_completed: false,
                        is_required: a.is_required,
                        completed_date: None,
                        form_instance_id: None,
                    },
                )
            })
            .collect();

        Self {
            patient_id,
            study_id: config.study_id.clone(),
            phase_id: config.id.clone(),
            phase_order: config.order,
            status: ProgressStatus::NotStarted,
            total_templates: config.total_templates(),
            required_templates: config.required_templates(),
            completed_templates: 0,
            completed_required_templates: 0,
            form_completion_status,
            progress_percentage: percentage(0, config.total_templates()),
            can_progress: false,
            blocking_reasons: Vec::new(),
            approvals: Vec::new(),
            started_date: None,
            completed_date: None,
            skipped_date: None,
            skipped_reason: None,
            updated_at: now,
        }
    }

    /// Storage key of this record.
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.patient_id.clone(), self.phase_id.clone())
    }

    /// Recompute counts and percentage from `form_completion_status`.
    pub fn recount(&mut self) {
        self.completed_templates = self
            .form_completion_status
            .values()
            .filter(|s| s.is_completed)
            .count();
        self.completed_required_templates = self
            .form_completion_status
            .values()
            .filter(|s| s.is_completed && s.is_required)
            .count();
        self.progress_percentage = percentage(self.completed_templates, self.total_templates);
    }

    /// Templates that are complete.
    pub fn completed_template_ids(&self) -> Vec<TemplateId> {
        self.form_completion_status
            .iter()
            .filter(|(_, s)| s.is_completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Required templates that are still incomplete.
    pub fn blocking_template_ids(&self) -> Vec<TemplateId> {
        self.form_completion_status
            .iter()
            .filter(|(_, s)| s.is_required && !s.is_completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether a template is marked complete.
    pub fn is_template_completed(&self, template_id: &TemplateId) -> bool {
        self.form_completion_status
            .get(template_id)
            .map_or(false, |s| s.is_completed)
    }

    /// Whether the counters respect their ordering invariant.
    pub fn counts_consistent(&self) -> bool {
        self.completed_required_templates <= self.required_templates
            && self.required_templates <= self.total_templates
            && self.completed_templates <= self.total_templates
    }
}

/// `round(100 * completed / total)`, or 100 for an empty phase.
pub fn percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed as f64 * 100.0) / total as f64).round().min(100.0) as u8
}

/// Status of a phase for a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// No template completed yet
    NotStarted,
    /// Some templates completed
    InProgress,
    /// Every template completed
    Completed,
    /// Held by an administrator
    Locked,
    /// Skipped by an administrator
    Skipped,
}

impl ProgressStatus {
    /// Whether the status is set only by an administrative action.
    pub fn is_administrative(&self) -> bool {
        matches!(self, ProgressStatus::Locked | ProgressStatus::Skipped)
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Locked => "locked",
            ProgressStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion state of one template within a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormCompletion {
    /// Whether the form is complete
    pub is_completed: bool,

    /// Whether the template is required
    pub is_required: bool,

    /// When it was completed
    pub completed_date: Option<Time>,

    /// Form instance that completed it
    pub form_instance_id: Option<String>,
}

/// An approval recorded for leaving a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseApproval {
    /// Role of the approver
    pub role: String,

    /// Who approved
    pub approved_by: String,

    /// When
    pub approved_at: Time,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::TemplateAssignment;
    use chrono::Utc;

    fn config() -> PhaseConfig {
        let now = Utc::now();
        PhaseConfig {
            id: PhaseId::from("tx"),
            study_id: StudyId::from("s1"),
            name: "Treatment".to_string(),
            code: "TX".to_string(),
            order: 2,
            template_assignments: vec![
                TemplateAssignment::required("a", "A"),
                TemplateAssignment::required("b", "B"),
                TemplateAssignment::optional("c", "C"),
            ],
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

    #[test]
    fn test_new_progress_is_seeded() {
        let p = PatientPhaseProgress::new(PatientId::from("p"), &config(), Utc::now());
        assert_eq!(p.status, ProgressStatus::NotStarted);
        assert_eq!(p.total_templates, 3);
        assert_eq!(p.required_templates, 2);
        assert_eq!(p.form_completion_status.len(), 3);
        assert_eq!(p.progress_percentage, 0);
        assert!(p.form_completion_status.values().all(|s| !s.is_completed));
        assert_eq!(p.blocking_template_ids().len(), 2);
    }

    #[test]
    fn test_recount() {
        let mut p = PatientPhaseProgress::new(PatientId::from("p"), &config(), Utc::now());
        p.form_completion_status.get_mut(&TemplateId::from("a")).unwrap().is_completed = true;
        p.form_completion_status.get_mut(&TemplateId::from("c")).unwrap().is_completed = true;
        p.recount();

        assert_eq!(p.completed_templates, 2);
        assert_eq!(p.completed_required_templates, 1);
        assert_eq!(p.progress_percentage, 67);
        assert!(p.counts_consistent());
        assert_eq!(p.blocking_template_ids(), vec![TemplateId::from("b")]);
    }

    #[test]
    fn test_percentage_rounding() {
        assert_eq!(percentage(0, 0), 100);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(1, 8), 13);
        assert_eq!(percentage(3, 3), 100);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ProgressStatus::NotStarted).unwrap();
        assert_eq!(json, "\"not_started\"");
        assert!(ProgressStatus::Skipped.is_administrative());
        assert!(!ProgressStatus::InProgress.is_administrative());
    }
}
