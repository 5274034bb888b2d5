//! Phase configuration - the ordered stages of a study.

use serde::{Deserialize, Serialize};
use crate::id::{PhaseId, StudyId, TemplateId};
use crate::transition::TransitionRule;
use crate::Time;

/// A phase is an ordered stage of a study with assigned form templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Unique identifier
    pub id: PhaseId,

    /// Owning study
    pub study_id: StudyId,

    /// Display name (e.g. "Screening")
    pub name: String,

    /// Short code (e.g. "SCR")
    pub code: String,

    /// Position in the default sequence, strictly increasing within a study
    pub order: i32,

    /// Templates that make up the phase's work
    pub template_assignments: Vec<TemplateAssignment>,

    /// Days after enrollment when the phase window opens
    pub window_start_days: Option<i64>,

    /// Days after enrollment when the phase window closes
    pub window_end_days: Option<i64>,

    /// Whether administrators may skip the phase
    pub allow_skip: bool,

    /// Whether the phase may run alongside its neighbours
    pub allow_parallel: bool,

    /// Rules gating the move out of this phase
    pub transition_rules: Vec<TransitionRule>,

    /// Soft-invalidation flag; inactive phases are never bootstrapped
    #[serde(default = "default_active")]
    pub active: bool,

    /// Created at
    pub created_at: Time,

    /// Last modified at
    pub updated_at: Time,
}

fn default_active() -> bool {
    true
}

impl PhaseConfig {
    /// Number of assigned templates.
    pub fn total_templates(&self) -> usize {
        self.template_assignments.len()
    }

    /// Number of required templates.
    pub fn required_templates(&self) -> usize {
        self.template_assignments.iter().filter(|a| a.is_required).count()
    }

    /// Ids of the required templates, in assignment order.
    pub fn required_template_ids(&self) -> Vec<TemplateId> {
        self.template_assignments
            .iter()
            .filter(|a| a.is_required)
            .map(|a| a.template_id.clone())
            .collect()
    }

    /// Find the assignment for a template.
    pub fn assignment(&self, template_id: &TemplateId) -> Option<&TemplateAssignment> {
        self.template_assignments
            .iter()
            .find(|a| &a.template_id == template_id)
    }

    /// Rules whose source is this phase.
    pub fn outgoing_rules(&self) -> impl Iterator<Item = &TransitionRule> {
        self.transition_rules
            .iter()
            .filter(move |r| r.from_phase == self.id)
    }

    /// Scheduling window relative to an enrollment time.
    ///
    /// Returns `None` when the phase defines neither bound.
    pub fn window(&self, enrolled_at: Time) -> Option<PhaseWindow> {
        if self.window_start_days.is_none() && self.window_end_days.is_none() {
            return None;
        }
        Some(PhaseWindow {
            opens_at: self
                .window_start_days
                .map(|d| enrolled_at + chrono::Duration::days(d)),
            closes_at: self
                .window_end_days
                .map(|d| enrolled_at + chrono::Duration::days(d)),
        })
    }
}

/// A template assigned to a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAssignment {
    /// Template id, unique within the phase
    pub template_id: TemplateId,

    /// Template display name
    pub template_name: String,

    /// Whether completion is needed to leave the phase
    pub is_required: bool,

    /// Days after the phase starts by which the form is due
    #[serde(default)]
    pub due_after_days: Option<i64>,

    /// Free-form grouping
    #[serde(default)]
    pub category: Option<String>,
}

impl TemplateAssignment {
    /// Create a required assignment.
    pub fn required(template_id: impl Into<TemplateId>, name: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            template_name: name.into(),
            is_required: true,
            due_after_days: None,
            category: None,
        }
    }

    /// Create an optional assignment.
    pub fn optional(template_id: impl Into<TemplateId>, name: impl Into<String>) -> Self {
        Self {
            is_required: false,
            ..Self::required(template_id, name)
        }
    }

    /// Set the due offset.
    pub fn due_after(mut self, days: i64) -> Self {
        self.due_after_days = Some(days);
        self
    }
}

/// Input for creating a phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfigInput {
    /// Display name
    pub name: String,

    /// Short code
    pub code: String,

    /// Sequence position
    pub order: i32,

    /// Assigned templates
    pub template_assignments: Vec<TemplateAssignment>,

    /// Window open offset in days
    pub window_start_days: Option<i64>,

    /// Window close offset in days
    pub window_end_days: Option<i64>,

    /// Skippable
    pub allow_skip: bool,

    /// Parallelizable
    pub allow_parallel: bool,

    /// Outgoing rules; `from_phase` is overwritten with the new phase id
    pub transition_rules: Vec<TransitionRule>,
}

impl PhaseConfigInput {
    /// Create an input with name, code and order.
    pub fn new(name: impl Into<String>, code: impl Into<String>, order: i32) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            order,
            ..Default::default()
        }
    }

    /// Add a template assignment.
    pub fn with_assignment(mut self, assignment: TemplateAssignment) -> Self {
        self.template_assignments.push(assignment);
        self
    }

    /// Add a transition rule.
    pub fn with_rule(mut self, rule: TransitionRule) -> Self {
        self.transition_rules.push(rule);
        self
    }

    /// Allow administrators to skip the phase.
    pub fn skippable(mut self) -> Self {
        self.allow_skip = true;
        self
    }
}

/// Partial update of a phase. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePatch {
    pub name: Option<String>,
    pub code: Option<String>,
    pub order: Option<i32>,
    pub template_assignments: Option<Vec<TemplateAssignment>>,
    pub window_start_days: Option<i64>,
    pub window_end_days: Option<i64>,
    pub allow_skip: Option<bool>,
    pub allow_parallel: Option<bool>,
    pub transition_rules: Option<Vec<TransitionRule>>,
}

/// Scheduling window of a phase for one patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseWindow {
    /// Earliest natural start
    pub opens_at: Option<Time>,

    /// Latest natural end
    pub closes_at: Option<Time>,
}

impl PhaseWindow {
    /// Whether `at` falls inside the window. Missing bounds are open.
    pub fn contains(&self, at: Time) -> bool {
        self.opens_at.map_or(true, |o| at >= o) && self.closes_at.map_or(true, |c| at <= c)
    }
}
