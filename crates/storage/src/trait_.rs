//! Storage trait abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use studyphase_core::{
    PatientId, PatientPhaseProgress, PhaseConfig, PhaseId, ProgressKey, StudyId, VisitFolder,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A transaction precondition did not hold
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// A stored document with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Incremented on every write; the first write is version 1
    pub version: u64,

    /// Document body
    pub value: T,
}

impl<T> Versioned<T> {
    /// Wrap a value.
    pub fn new(version: u64, value: T) -> Self {
        Self { version, value }
    }

    /// Drop the version.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Optimistic guard on a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The document must not exist yet
    Absent,
    /// The document must be at exactly this version
    Version(u64),
    /// Unconditional
    Any,
}

impl Precondition {
    /// Check the guard against the current version (`None` when absent).
    pub fn check(&self, current: Option<u64>, what: &str) -> Result<()> {
        match (self, current) {
            (Precondition::Any, _) => Ok(()),
            (Precondition::Absent, None) => Ok(()),
            (Precondition::Absent, Some(v)) => Err(StorageError::Conflict(format!(
                "{} already exists (version {})",
                what, v
            ))),
            (Precondition::Version(expected), Some(v)) if *expected == v => Ok(()),
            (Precondition::Version(expected), current) => Err(StorageError::Conflict(format!(
                "{} expected version {}, found {}",
                what,
                expected,
                current.map_or("none".to_string(), |v| v.to_string())
            ))),
        }
    }
}

/// One document write.
#[derive(Debug, Clone)]
pub enum Write {
    /// Put a phase config
    PhaseConfig(PhaseConfig),
    /// Put a progress record
    Progress(PatientPhaseProgress),
    /// Put a folder projection
    Folder(VisitFolder),
    /// Bump the revision of a study's phase set
    StudyRevision(StudyId),
}

impl Write {
    /// Human-readable document name for conflict messages.
    pub fn describe(&self) -> String {
        match self {
            Write::PhaseConfig(c) => format!("phase config {}", c.id),
            Write::Progress(p) => format!("progress {}", p.key()),
            Write::Folder(f) => format!("folder {}", f.key()),
            Write::StudyRevision(s) => format!("phase set of study {}", s),
        }
    }
}

/// A set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    writes: Vec<(Write, Precondition)>,
}

impl Transaction {
    /// Create an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a phase config.
    pub fn put_phase_config(mut self, config: PhaseConfig, guard: Precondition) -> Self {
        self.writes.push((Write::PhaseConfig(config), guard));
        self
    }

    /// Put a progress record.
    pub fn put_progress(mut self, record: PatientPhaseProgress, guard: Precondition) -> Self {
        self.writes.push((Write::Progress(record), guard));
        self
    }

    /// Put a folder projection. Folders are derived, so the write is unconditional.
    pub fn put_folder(mut self, folder: VisitFolder) -> Self {
        self.writes.push((Write::Folder(folder), Precondition::Any));
        self
    }

    /// Bump a study's phase-set revision. Writers that check order
    /// uniqueness guard on it so concurrent phase edits conflict.
    pub fn touch_study(mut self, study_id: StudyId, guard: Precondition) -> Self {
        self.writes.push((Write::StudyRevision(study_id), guard));
        self
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The writes in order.
    pub fn writes(&self) -> &[(Write, Precondition)] {
        &self.writes
    }

    /// Consume into writes.
    pub fn into_writes(self) -> Vec<(Write, Precondition)> {
        self.writes
    }
}

/// Transactional document store backing the engine.
///
/// Reads return the last committed state. `commit` checks every precondition
/// and applies every write, or applies nothing.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Phase configs ===

    /// Load a phase config by ID.
    async fn load_phase_config(&self, id: &PhaseId) -> Result<Option<Versioned<PhaseConfig>>>;

    /// List a study's phase configs ordered by `order`.
    async fn list_phase_configs(&self, study_id: &StudyId) -> Result<Vec<Versioned<PhaseConfig>>>;

    /// Current revision of a study's phase set, `None` before the first bump.
    async fn study_revision(&self, study_id: &StudyId) -> Result<Option<u64>>;

    // === Progress records ===

    /// Load a progress record.
    async fn load_progress(
        &self,
        key: &ProgressKey,
    ) -> Result<Option<Versioned<PatientPhaseProgress>>>;

    /// List a patient's progress records in a study, ordered by phase order.
    async fn list_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<Versioned<PatientPhaseProgress>>>;

    // === Folder projections ===

    /// Load a folder projection.
    async fn load_folder(&self, key: &ProgressKey) -> Result<Option<VisitFolder>>;

    // === Transaction support ===

    /// Apply a transaction atomically.
    async fn commit(&self, tx: Transaction) -> Result<()>;
}
