//! Study-phase progression (Layer 3)
//!
//! Phase configuration, patient bootstrap, the progress state machine,
//! transition rules and folder projection.

#![warn(missing_docs)]

pub mod error;
pub mod clock;
pub mod catalog;
pub mod custom;
pub mod phases;
pub mod bootstrap;
pub mod tracker;
pub mod transition;
pub mod folder;

#[cfg(test)]
mod testing;

pub use error::{ProgressError, Result};
pub use clock::{Clock, ManualClock, SystemClock};
pub use catalog::{StaticCatalog, TemplateCatalog};
pub use custom::{CustomConditionEvaluator, FnConditionEvaluator};
pub use phases::{validate_config, PhaseConfigStore};
pub use bootstrap::PhaseBootstrapper;
pub use tracker::{derive_status, CompletionOutcome, ProgressTracker, TrackerConfig};
pub use transition::{basic_gate, elapsed_days, TransitionDecision, TransitionEvaluator};
pub use folder::FolderProjector;
