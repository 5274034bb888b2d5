//! Transition evaluation.
//!
//! Decides whether a patient may leave a phase and explains why not:
//! - Basic gate: every required form complete (always checked first)
//! - Rule conditions: specific forms, elapsed days, custom expressions
//! - Approval requirements on rules

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use studyphase_core::{
    PatientPhaseProgress, PhaseConfig, ProgressStatus, Time, TransitionCondition, TransitionRule,
};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::custom::CustomConditionEvaluator;

/// Outcome of a transition evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDecision {
    /// Whether the patient may advance
    pub can_advance: bool,

    /// Human-readable reasons, empty when `can_advance`
    pub reasons: Vec<String>,
}

impl TransitionDecision {
    /// A decision that allows advancing.
    pub fn allowed() -> Self {
        Self {
            can_advance: true,
            reasons: Vec::new(),
        }
    }

    /// A decision built from accumulated reasons.
    pub fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            can_advance: reasons.is_empty(),
            reasons,
        }
    }
}

/// Evaluates transition rules against progress snapshots.
#[derive(Clone)]
pub struct TransitionEvaluator {
    custom: Option<Arc<dyn CustomConditionEvaluator>>,
    clock: Arc<dyn Clock>,
}

impl Default for TransitionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionEvaluator {
    /// Create an evaluator using the wall clock and no custom evaluator.
    pub fn new() -> Self {
        Self {
            custom: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the custom-condition evaluator.
    pub fn with_custom_evaluator(mut self, custom: Arc<dyn CustomConditionEvaluator>) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluate at the current time.
    pub async fn can_advance(
        &self,
        progress: &PatientPhaseProgress,
        config: &PhaseConfig,
    ) -> TransitionDecision {
        self.can_advance_at(progress, config, self.clock.now()).await
    }

    /// Evaluate at a given time.
    pub async fn can_advance_at(
        &self,
        progress: &PatientPhaseProgress,
        config: &PhaseConfig,
        now: Time,
    ) -> TransitionDecision {
        match progress.status {
            ProgressStatus::Skipped => return TransitionDecision::allowed(),
            ProgressStatus::Locked => {
                return TransitionDecision::from_reasons(vec![
                    "Phase is locked by an administrator".to_string(),
                ])
            }
            _ => {}
        }

        // The basic gate is always blocking, so nothing else is worth reporting.
        if let Some(reason) = basic_gate(progress) {
            return TransitionDecision::from_reasons(vec![reason]);
        }

        let mut reasons = Vec::new();
        for rule in config
            .outgoing_rules()
            .filter(|r| r.from_phase == progress.phase_id)
        {
            for condition in &rule.conditions {
                if let Some(reason) = self.check_condition(condition, progress, now).await {
                    debug!(
                        condition = condition.kind(),
                        reason = %reason,
                        "Rule condition not met"
                    );
                    reasons.push(reason);
                }
            }
            if let Some(reason) = check_approval(rule, progress) {
                reasons.push(reason);
            }
        }

        if !reasons.is_empty() {
            debug!(
                patient = %progress.patient_id,
                phase = %progress.phase_id,
                blocked_by = reasons.len(),
                "Transition blocked by rules"
            );
        }
        TransitionDecision::from_reasons(reasons)
    }

    async fn check_condition(
        &self,
        condition: &TransitionCondition,
        progress: &PatientPhaseProgress,
        now: Time,
    ) -> Option<String> {
        match condition {
            TransitionCondition::AllRequiredFormsCompleted => basic_gate(progress),

            TransitionCondition::SpecificFormsCompleted { form_ids } => {
                let missing: Vec<&str> = form_ids
                    .iter()
                    .filter(|id| !progress.is_template_completed(id))
                    .map(|id| id.as_str())
                    .collect();
                if missing.is_empty() {
                    None
                } else {
                    Some(format!("Forms not yet completed: {}", missing.join(", ")))
                }
            }

            TransitionCondition::DateBased {
                days_after_enrollment,
            } => {
                // A phase that has not started is already held by the basic gate.
                let started = progress.started_date?;
                let elapsed = elapsed_days(started, now);
                if elapsed >= *days_after_enrollment {
                    None
                } else {
                    let remaining = days_after_enrollment - elapsed;
                    Some(format!(
                        "Requires {} day(s) after phase start; {} day(s) remaining",
                        days_after_enrollment, remaining
                    ))
                }
            }

            TransitionCondition::Custom { expression } => {
                let Some(custom) = &self.custom else {
                    debug!(
                        expression = %expression,
                        "No custom evaluator configured; condition treated as met"
                    );
                    return None;
                };
                match custom.evaluate(expression, progress).await {
                    Ok(true) => None,
                    Ok(false) => Some(format!("Custom condition not met: {}", expression)),
                    Err(e) => {
                        warn!(
                            expression = %expression,
                            error = %e,
                            "Custom condition evaluation failed"
                        );
                        Some(format!(
                            "Custom condition '{}' could not be evaluated: {}",
                            expression, e
                        ))
                    }
                }
            }
        }
    }
}

/// The always-on gate: every required template complete.
pub fn basic_gate(progress: &PatientPhaseProgress) -> Option<String> {
    if progress.completed_required_templates >= progress.required_templates {
        return None;
    }
    let missing = progress.required_templates - progress.completed_required_templates;
    Some(format!(
        "{} required form(s) incomplete ({} of {} completed)",
        missing, progress.completed_required_templates, progress.required_templates
    ))
}

fn check_approval(rule: &TransitionRule, progress: &PatientPhaseProgress) -> Option<String> {
    if !rule.requires_approval {
        return None;
    }
    let approved = progress.approvals.iter().any(|a| {
        rule.approval_roles.is_empty() || rule.approval_roles.iter().any(|r| r == &a.role)
    });
    if approved {
        None
    } else if rule.approval_roles.is_empty() {
        Some("Awaiting approval".to_string())
    } else {
        Some(format!(
            "Awaiting approval from: {}",
            rule.approval_roles.join(", ")
        ))
    }
}

/// Whole days between two instants, floored.
pub fn elapsed_days(from: Time, to: Time) -> i64 {
    (to - from).num_seconds().div_euclid(86_400)
}
