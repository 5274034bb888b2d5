//! Plug-in point for `Custom` transition conditions.

use async_trait::async_trait;
use studyphase_core::PatientPhaseProgress;

/// Evaluates opaque `Custom` condition expressions.
///
/// An `Err` is reported as an unmet condition carrying the message.
#[async_trait]
pub trait CustomConditionEvaluator: Send + Sync {
    /// Decide whether `expression` holds for the progress snapshot.
    async fn evaluate(
        &self,
        expression: &str,
        progress: &PatientPhaseProgress,
    ) -> std::result::Result<bool, String>;
}

/// Evaluator built from a plain function.
pub struct FnConditionEvaluator<F>(pub F);

#[async_trait]
impl<F> CustomConditionEvaluator for FnConditionEvaluator<F>
where
    F: Fn(&str, &PatientPhaseProgress) -> std::result::Result<bool, String> + Send + Sync,
{
    async fn evaluate(
        &self,
        expression: &str,
        progress: &PatientPhaseProgress,
    ) -> std::result::Result<bool, String> {
        (self.0)(expression, progress)
    }
}
