//! Event ingress.
//!
//! Completion events are routed to one serial worker per progress key, so
//! events for the same patient and phase are applied strictly in arrival
//! order while different keys run in parallel under a shared concurrency
//! limit. Transient failures are retried with exponential backoff; events
//! that still fail are handed to a dead-letter sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use studyphase_core::{PatientPhaseProgress, ProgressKey, TemplateCompletionEvent};
use studyphase_progress::{ProgressError, ProgressTracker};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::IngressConfig;

/// Errors returned when submitting events.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// The ingress was shut down
    #[error("Event ingress is shut down")]
    Closed,

    /// Processing failed
    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// What became of a submitted event.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketOutcome {
    /// The event changed the record
    Applied(PatientPhaseProgress),

    /// The event matched the current state
    Unchanged(PatientPhaseProgress),

    /// The event targets something that does not exist and was discarded
    Dropped(String),

    /// Retries were exhausted and the event was reported as dead
    DeadLettered(String),

    /// Still queued or running; it will be processed regardless
    Pending,
}

impl TicketOutcome {
    /// Whether processing has finished.
    pub fn is_settled(&self) -> bool {
        !matches!(self, TicketOutcome::Pending)
    }
}

/// Handle to a submitted event.
#[derive(Debug)]
pub struct CompletionTicket {
    key: ProgressKey,
    rx: Option<oneshot::Receiver<TicketOutcome>>,
    outcome: Option<TicketOutcome>,
}

impl CompletionTicket {
    /// Key the event was queued under.
    pub fn key(&self) -> &ProgressKey {
        &self.key
    }

    /// Wait up to `timeout` for the event to settle.
    ///
    /// A timeout returns `Pending` and leaves the event queued; the ticket can
    /// be waited on again.
    pub async fn wait(&mut self, timeout: Duration) -> TicketOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(rx) = self.rx.as_mut() else {
            return TicketOutcome::Pending;
        };

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => TicketOutcome::Dropped("worker stopped before reporting".to_string()),
            Err(_) => return TicketOutcome::Pending,
        };
        self.rx = None;
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// An event that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The event
    pub event: TemplateCompletionEvent,

    /// Last error
    pub error: ProgressError,

    /// Attempts made
    pub attempts: u32,
}

/// Receives events whose retries were exhausted.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Report a dead event.
    async fn report(&self, letter: DeadLetter);
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetter;

#[async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn report(&self, letter: DeadLetter) {
        error!(
            patient = %letter.event.patient_id,
            phase = %letter.event.phase_id,
            template = %letter.event.template_id,
            occurred_at = %letter.event.occurred_at,
            attempts = letter.attempts,
            error = %letter.error,
            "Completion event dead-lettered"
        );
    }
}

/// Sink that keeps dead events in memory for inspection.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    letters: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported events, oldest first.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn report(&self, letter: DeadLetter) {
        LogDeadLetter.report(letter.clone()).await;
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
    }
}

struct Envelope {
    event: TemplateCompletionEvent,
    reply: oneshot::Sender<TicketOutcome>,
}

type Queues = HashMap<ProgressKey, mpsc::UnboundedSender<Envelope>>;

struct Inner {
    tracker: ProgressTracker,
    config: IngressConfig,
    dead_letter: Arc<dyn DeadLetterSink>,
    permits: Semaphore,
    queues: Mutex<Queues>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Serializes completion events per progress key.
#[derive(Clone)]
pub struct EventIngress {
    inner: Arc<Inner>,
}

impl EventIngress {
    /// Create an ingress feeding the given tracker.
    pub fn new(
        tracker: ProgressTracker,
        config: IngressConfig,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            inner: Arc::new(Inner {
                tracker,
                config,
                dead_letter,
                permits,
                queues: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Queue an event. Returns once the event is accepted, not applied.
    pub fn submit(&self, event: TemplateCompletionEvent) -> Result<CompletionTicket, IngressError> {
        let inner = &self.inner;
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if inner.closed.load(Ordering::SeqCst) {
            inner.finish_one();
            return Err(IngressError::Closed);
        }

        let key = event.key();
        let (reply, rx) = oneshot::channel();
        let mut envelope = Envelope { event, reply };

        let mut queues = inner.lock_queues();
        if let Some(queue) = queues.get(&key) {
            match queue.send(envelope) {
                Ok(()) => return Ok(ticket(key, rx)),
                // The worker is gone without deregistering; replace it.
                Err(mpsc::error::SendError(returned)) => envelope = returned,
            }
        }

        let (queue, events) = mpsc::unbounded_channel();
        if queue.send(envelope).is_err() {
            inner.finish_one();
            return Err(IngressError::Closed);
        }
        queues.insert(key.clone(), queue);
        drop(queues);

        debug!(key = %key, "Starting key worker");
        tokio::spawn(run_worker(self.inner.clone(), key.clone(), events));
        Ok(ticket(key, rx))
    }

    /// Events accepted but not yet settled.
    pub fn pending(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Keys that currently have a worker.
    pub fn active_workers(&self) -> usize {
        self.inner.lock_queues().len()
    }

    /// Whether `shutdown` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting events and wait until every queued event has settled.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        info!(pending = self.pending(), "Shutting down event ingress");

        loop {
            let drained = inner.drained.notified();
            if inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }

        // Dropping the senders lets idle workers exit.
        inner.lock_queues().clear();
        info!("Event ingress drained");
    }
}

fn ticket(key: ProgressKey, rx: oneshot::Receiver<TicketOutcome>) -> CompletionTicket {
    CompletionTicket {
        key,
        rx: Some(rx),
        outcome: None,
    }
}

impl Inner {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn process(&self, envelope: Envelope) {
        let outcome = {
            let _permit = self.permits.acquire().await.ok();
            self.apply_with_retry(&envelope.event).await
        };
        if envelope.reply.send(outcome).is_err() {
            debug!("Ticket dropped before the event settled");
        }
        self.finish_one();
    }

    async fn apply_with_retry(&self, event: &TemplateCompletionEvent) -> TicketOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .tracker
                .apply_completion(
                    &event.patient_id,
                    &event.phase_id,
                    &event.template_id,
                    event.completed,
                    event.form_instance_id.clone(),
                )
                .await;

            match result {
                Ok(outcome) if outcome.changed => return TicketOutcome::Applied(outcome.progress),
                Ok(outcome) => return TicketOutcome::Unchanged(outcome.progress),
                Err(e) if e.is_drop() => {
                    warn!(
                        patient = %event.patient_id,
                        phase = %event.phase_id,
                        template = %event.template_id,
                        occurred_at = %event.occurred_at,
                        error = %e,
                        "Dropping completion event"
                    );
                    return TicketOutcome::Dropped(e.to_string());
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        patient = %event.patient_id,
                        phase = %event.phase_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Completion failed, will retry after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.dead_letter
                        .report(DeadLetter {
                            event: event.clone(),
                            error: e,
                            attempts: attempt,
                        })
                        .await;
                    return TicketOutcome::DeadLettered(message);
                }
            }
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    key: ProgressKey,
    mut events: mpsc::UnboundedReceiver<Envelope>,
) {
    let idle = inner.config.idle_timeout();
    loop {
        let envelope = match tokio::time::timeout(idle, events.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_) => {
                // Checked under the map lock so a concurrent submit either
                // lands in this queue or starts a fresh worker.
                let mut queues = inner.lock_queues();
                match events.try_recv() {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        queues.remove(&key);
                        break;
                    }
                }
            }
        };
        inner.process(envelope).await;
    }
    debug!(key = %key, "Key worker stopped");
}
