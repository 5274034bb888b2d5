//! The engine facade - the surface the surrounding application calls.
//!
//! ```text
//! PhaseConfigStore → PhaseBootstrapper → EventIngress → ProgressTracker
//!                                                     → TransitionEvaluator
//!                                                     → FolderProjector
//! ```

use std::sync::Arc;
use studyphase_core::{
    PatientId, PatientPhaseProgress, PhaseConfig, PhaseConfigInput, PhaseId, PhasePatch,
    ProgressKey, StudyId, TemplateCompletionEvent, TemplateId, VisitFolder,
};
use studyphase_progress::{
    Clock, CompletionOutcome, CustomConditionEvaluator, FolderProjector, PhaseBootstrapper,
    PhaseConfigStore, ProgressTracker, Result, SystemClock, TemplateCatalog, TransitionDecision,
    TransitionEvaluator,
};
use studyphase_storage::Storage;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::ingress::{CompletionTicket, DeadLetterSink, EventIngress, IngressError, LogDeadLetter};
use crate::source::EventSource;

/// Builds a [`PhaseEngine`] from its collaborators.
pub struct PhaseEngineBuilder {
    storage: Arc<dyn Storage>,
    catalog: Option<Arc<dyn TemplateCatalog>>,
    custom: Option<Arc<dyn CustomConditionEvaluator>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    dead_letter: Arc<dyn DeadLetterSink>,
}

impl PhaseEngineBuilder {
    /// Validate template references at bootstrap.
    pub fn with_catalog(mut self, catalog: Arc<dyn TemplateCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Evaluate `Custom` transition conditions.
    pub fn with_custom_evaluator(mut self, custom: Arc<dyn CustomConditionEvaluator>) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set where exhausted events are reported.
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = sink;
        self
    }

    /// Wire the engine.
    pub fn build(self) -> PhaseEngine {
        let mut evaluator = TransitionEvaluator::new().with_clock(self.clock.clone());
        if let Some(custom) = self.custom {
            evaluator = evaluator.with_custom_evaluator(custom);
        }

        let tracker = ProgressTracker::new(self.storage.clone())
            .with_evaluator(evaluator)
            .with_clock(self.clock.clone())
            .with_config(self.config.tracker.clone());

        let mut bootstrapper =
            PhaseBootstrapper::new(self.storage.clone()).with_clock(self.clock.clone());
        if let Some(catalog) = self.catalog {
            bootstrapper = bootstrapper.with_catalog(catalog);
        }

        let ingress =
            EventIngress::new(tracker.clone(), self.config.ingress.clone(), self.dead_letter);

        PhaseEngine {
            phases: PhaseConfigStore::new(self.storage.clone()).with_clock(self.clock),
            bootstrapper,
            tracker,
            projector: FolderProjector::new(),
            ingress,
            storage: self.storage,
        }
    }
}

/// The study-phase progression engine.
#[derive(Clone)]
pub struct PhaseEngine {
    phases: PhaseConfigStore,
    bootstrapper: PhaseBootstrapper,
    tracker: ProgressTracker,
    projector: FolderProjector,
    ingress: EventIngress,
    storage: Arc<dyn Storage>,
}

impl PhaseEngine {
    /// Start building an engine over a store.
    pub fn builder(storage: Arc<dyn Storage>) -> PhaseEngineBuilder {
        PhaseEngineBuilder {
            storage,
            catalog: None,
            custom: None,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            dead_letter: Arc::new(LogDeadLetter),
        }
    }

    /// Engine with default collaborators.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::builder(storage).build()
    }

    // === Phase configuration ===

    /// Define phases for a study.
    pub async fn create_phases(
        &self,
        study_id: &StudyId,
        inputs: Vec<PhaseConfigInput>,
    ) -> Result<Vec<PhaseConfig>> {
        self.phases.create_phases(study_id, inputs).await
    }

    /// Active phases of a study by order.
    pub async fn get_phases(&self, study_id: &StudyId) -> Result<Vec<PhaseConfig>> {
        self.phases.get_phases(study_id).await
    }

    /// Update a phase.
    pub async fn update_phase(&self, id: &PhaseId, patch: PhasePatch) -> Result<PhaseConfig> {
        self.phases.update_phase(id, patch).await
    }

    /// Soft-invalidate a phase.
    pub async fn deactivate_phase(&self, id: &PhaseId) -> Result<PhaseConfig> {
        self.phases.deactivate_phase(id).await
    }

    /// The phase configuration store.
    pub fn phases(&self) -> &PhaseConfigStore {
        &self.phases
    }

    // === Patient progress ===

    /// Materialize a patient's progress in a study.
    pub async fn bootstrap_patient(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<PatientPhaseProgress>> {
        self.bootstrapper.bootstrap_patient(patient_id, study_id).await
    }

    /// Queue a completion. Accepted is not applied; wait on the ticket for that.
    pub fn submit_completion(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
        template_id: &TemplateId,
        completed: bool,
        form_instance_id: Option<String>,
    ) -> std::result::Result<CompletionTicket, IngressError> {
        let event = TemplateCompletionEvent::new(
            patient_id.clone(),
            phase_id.clone(),
            template_id.clone(),
            completed,
        );
        let event = match form_instance_id {
            Some(id) => event.with_form_instance(id),
            None => event,
        };
        self.submit(event)
    }

    /// Queue a completion event.
    pub fn submit(
        &self,
        event: TemplateCompletionEvent,
    ) -> std::result::Result<CompletionTicket, IngressError> {
        self.ingress.submit(event)
    }

    /// A patient's progress in a study, ordered by phase.
    pub async fn get_progress(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<PatientPhaseProgress>> {
        self.tracker.get_progress(patient_id, study_id).await
    }

    /// The folder projection of a patient's phase.
    pub async fn get_folder(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<VisitFolder> {
        self.tracker
            .get_folder(&ProgressKey::new(patient_id.clone(), phase_id.clone()))
            .await
    }

    /// Whether a patient may leave a phase now, and why not.
    pub async fn evaluate_transition(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<TransitionDecision> {
        self.tracker.evaluate(patient_id, phase_id).await
    }

    /// Regenerate a patient's folders from committed progress.
    pub async fn rebuild_folders(
        &self,
        patient_id: &PatientId,
        study_id: &StudyId,
    ) -> Result<Vec<VisitFolder>> {
        self.projector.rebuild(&self.storage, patient_id, study_id).await
    }

    // === Administrative actions ===

    /// Skip a phase for a patient.
    pub async fn skip_phase(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
        reason: &str,
    ) -> Result<CompletionOutcome> {
        self.tracker.skip_phase(patient_id, phase_id, reason).await
    }

    /// Lock a phase for a patient.
    pub async fn lock_phase(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<CompletionOutcome> {
        self.tracker.lock_phase(patient_id, phase_id).await
    }

    /// Unlock a phase for a patient.
    pub async fn unlock_phase(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
    ) -> Result<CompletionOutcome> {
        self.tracker.unlock_phase(patient_id, phase_id).await
    }

    /// Record an approval for leaving a phase.
    pub async fn record_approval(
        &self,
        patient_id: &PatientId,
        phase_id: &PhaseId,
        role: &str,
        approved_by: &str,
    ) -> Result<CompletionOutcome> {
        self.tracker
            .record_approval(patient_id, phase_id, role, approved_by)
            .await
    }

    /// The progress tracker.
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    // === Event flow ===

    /// Feed every event of a source into the ingress until the source ends.
    ///
    /// Returns the number of events accepted. Tickets are not kept; outcomes
    /// are visible through logs, the dead-letter sink and the stored records.
    pub async fn run_source<E: EventSource>(
        &self,
        mut source: E,
    ) -> std::result::Result<usize, IngressError> {
        let mut accepted = 0;
        while let Some(event) = source.next_event().await {
            match self.ingress.submit(event) {
                Ok(_) => accepted += 1,
                Err(IngressError::Closed) => {
                    warn!(accepted, "Ingress closed while draining event source");
                    return Err(IngressError::Closed);
                }
                Err(e) => return Err(e),
            }
        }
        info!(accepted, "Event source exhausted");
        Ok(accepted)
    }

    /// The event ingress.
    pub fn ingress(&self) -> &EventIngress {
        &self.ingress
    }

    /// Stop accepting events and wait for queued ones to settle.
    pub async fn shutdown(&self) {
        self.ingress.shutdown().await;
    }
}
