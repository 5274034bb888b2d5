//! Completion events - the facts the engine consumes.

use serde::{Deserialize, Serialize};
use crate::id::{PatientId, PhaseId, ProgressKey, TemplateId};
use crate::Time;

/// A form instance for a template was completed (or reopened).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCompletionEvent {
    /// Patient
    pub patient_id: PatientId,

    /// Phase
    pub phase_id: PhaseId,

    /// Template
    pub template_id: TemplateId,

    /// `true` when completed, `false` when reopened
    pub completed: bool,

    /// Form instance behind the change
    #[serde(default)]
    pub form_instance_id: Option<String>,

    /// When it happened upstream
    pub occurred_at: Time,
}

impl TemplateCompletionEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        patient_id: impl Into<PatientId>,
        phase_id: impl Into<PhaseId>,
        template_id: impl Into<TemplateId>,
        completed: bool,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            phase_id: phase_id.into(),
            template_id: template_id.into(),
            completed,
            form_instance_id: None,
            occurred_at: chrono::Utc::now(),
        }
    }

    /// Attach the form instance id.
    pub fn with_form_instance(mut self, id: impl Into<String>) -> Self {
        self.form_instance_id = Some(id.into());
        self
    }

    /// Serialization key of this event.
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.patient_id.clone(), self.phase_id.clone())
    }
}
