//! Study-phase core data models.
//!
//! This crate defines the typed schema shared by the progression engine:
//! phase configuration, per-patient progress, transition rules and the
//! folder projection.

#![warn(missing_docs)]

mod id;
mod phase;
mod transition;
mod progress;
mod folder;
mod event;
mod template;

pub use id::{PatientId, PhaseId, ProgressKey, StudyId, TemplateId};
pub use phase::{PhaseConfig, PhaseConfigInput, PhasePatch, PhaseWindow, TemplateAssignment};
pub use transition::{TransitionCondition, TransitionRule};
pub use progress::{
    percentage, FormCompletion, PatientPhaseProgress, PhaseApproval, ProgressStatus,
};
pub use folder::VisitFolder;
pub use event::TemplateCompletionEvent;
pub use template::TemplateMeta;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
