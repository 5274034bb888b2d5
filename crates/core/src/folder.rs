//! Visit folder - the read-optimized view of a progress record.

use serde::{Deserialize, Serialize};
use crate::id::{PatientId, PhaseId, ProgressKey, TemplateId};
use crate::progress::ProgressStatus;

/// Denormalized progress for downstream consumers.
///
/// Always rebuilt from a [`crate::PatientPhaseProgress`]; never edited by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitFolder {
    /// Patient
    pub patient_id: PatientId,

    /// Phase
    pub phase_id: PhaseId,

    /// Rounded completion percentage
    pub completion_percentage: u8,

    /// Templates already complete
    pub completed_template_ids: Vec<TemplateId>,

    /// Whether the patient may move on
    pub can_progress_to_next_phase: bool,

    /// Required templates still missing
    pub blocking_template_ids: Vec<TemplateId>,

    /// Status of the underlying record
    pub status: ProgressStatus,
}

impl VisitFolder {
    /// Storage key of this folder.
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.patient_id.clone(), self.phase_id.clone())
    }
}
