//! Identifiers for study-phase entities.
//!
//! Patients, studies and templates are identified by the surrounding
//! application, so their ids are opaque strings. Phase config ids are minted
//! here as ULIDs when a study administrator creates phases.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of an enrolled patient.
    PatientId
);

string_id!(
    /// Identifier of a clinical study.
    StudyId
);

string_id!(
    /// Identifier of a form template.
    TemplateId
);

string_id!(
    /// Identifier of a phase configuration.
    PhaseId
);

impl PhaseId {
    /// Mint a fresh phase id.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }
}

/// Identity of a progress record and its folder projection.
///
/// Completion events are serialized per key; records for different keys are
/// fully independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    /// Patient the record belongs to
    pub patient_id: PatientId,

    /// Phase the record tracks
    pub phase_id: PhaseId,
}

impl ProgressKey {
    /// Create a key.
    pub fn new(patient_id: PatientId, phase_id: PhaseId) -> Self {
        Self {
            patient_id,
            phase_id,
        }
    }
}

impl std::fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.patient_id, self.phase_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids_serialize_transparently() {
        let id = PatientId::new("pat-001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"pat-001\"");

        let back: PatientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_generated_phase_ids_are_unique() {
        let a = PhaseId::generate();
        let b = PhaseId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }

    #[test]
    fn test_progress_key_display() {
        let key = ProgressKey::new(PatientId::from("p1"), PhaseId::from("scr"));
        assert_eq!(key.to_string(), "p1/scr");
    }
}
