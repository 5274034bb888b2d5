//! Transition rules gating movement between phases.

use serde::{Deserialize, Serialize};
use crate::id::{PhaseId, TemplateId};

/// A set of conditions that must all hold before a patient may leave a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Phase the rule gates
    pub from_phase: PhaseId,

    /// Target phase; `None` means the next phase by order
    #[serde(default)]
    pub to_phase: Option<PhaseId>,

    /// Conditions, all of which must hold
    pub conditions: Vec<TransitionCondition>,

    /// Whether a recorded approval is needed
    #[serde(default)]
    pub requires_approval: bool,

    /// Roles allowed to approve; empty means any role
    #[serde(default)]
    pub approval_roles: Vec<String>,
}

impl TransitionRule {
    /// Create a rule with no conditions.
    pub fn new(from_phase: PhaseId) -> Self {
        Self {
            from_phase,
            to_phase: None,
            conditions: Vec::new(),
            requires_approval: false,
            approval_roles: Vec::new(),
        }
    }

    /// Add a condition.
    pub fn with_condition(mut self, condition: TransitionCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Require approval from one of the given roles.
    pub fn with_approval<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_approval = true;
        self.approval_roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// A single transition condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionCondition {
    /// Every required template is complete
    AllRequiredFormsCompleted,

    /// Every listed template is complete
    SpecificFormsCompleted {
        /// Templates that must be complete
        form_ids: Vec<TemplateId>,
    },

    /// Enough whole days have passed since the phase started
    DateBased {
        /// Minimum elapsed days
        days_after_enrollment: i64,
    },

    /// Opaque expression handed to an injected evaluator
    Custom {
        /// Expression text
        expression: String,
    },
}

impl TransitionCondition {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionCondition::AllRequiredFormsCompleted => "all_required_forms_completed",
            TransitionCondition::SpecificFormsCompleted { .. } => "specific_forms_completed",
            TransitionCondition::DateBased { .. } => "date_based",
            TransitionCondition::Custom { .. } => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_tagged_json() {
        let c = TransitionCondition::DateBased {
            days_after_enrollment: 7,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "date_based");
        assert_eq!(json["days_after_enrollment"], 7);

        let parsed: TransitionCondition =
            serde_json::from_str(r#"{"type":"specific_forms_completed","form_ids":["a","b"]}"#)
                .unwrap();
        assert_eq!(
            parsed,
            TransitionCondition::SpecificFormsCompleted {
                form_ids: vec![TemplateId::from("a"), TemplateId::from("b")],
            }
        );
    }

    #[test]
    fn test_rule_builder() {
        let rule = TransitionRule::new(PhaseId::from("scr"))
            .with_condition(TransitionCondition::AllRequiredFormsCompleted)
            .with_approval(["investigator"]);

        assert!(rule.requires_approval);
        assert_eq!(rule.approval_roles, vec!["investigator".to_string()]);
        assert_eq!(rule.conditions.len(), 1);
        assert_eq!(rule.conditions[0].kind(), "all_required_forms_completed");
    }
}
