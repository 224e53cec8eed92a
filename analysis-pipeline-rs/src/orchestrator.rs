// analysis-pipeline-rs/src/orchestrator.rs
//
// Coordinates the pipeline under a bounded worker pool. Callers only enqueue
// and await; all network I/O happens on the workers. Backpressure is a
// bounded queue: once workers and queue are full, submit fails fast with
// `Overloaded` instead of buffering without bound.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use llm_client::{
    cancel_pair, CancelSignal, CancelToken, LlmBackend, LlmClient, LlmError, ModelReply,
};

use crate::cache::{FingerprintCache, Lookup, Ticket};
use crate::config::AnalystConfig;
use crate::error::{AnalysisError, AnalysisFailure};
use crate::finding::AnalysisResult;
use crate::normalizer::{normalize, NormalizeLimits};
use crate::parser;
use crate::prompt::{self, AnalysisProfile, PromptBudget};
use crate::session::SessionMemory;
use crate::transaction::{Fingerprint, Transaction};

/// Scheduling stays FIFO; priority is carried for diagnostics and as the
/// hook for a future interactive lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    Interactive,
}

/// One admitted submission, alive until its result is delivered or the
/// request is cancelled.
#[derive(Debug)]
pub struct AnalysisRequest {
    pub transaction: Transaction,
    pub fingerprint: Fingerprint,
    pub profile: AnalysisProfile,
    pub submitted_at: DateTime<Utc>,
    pub priority: Priority,
}

struct Job {
    request: AnalysisRequest,
    ticket: Ticket,
    cancel: CancelToken,
}

/// Caller-side view of one submission. `result` suspends until the terminal
/// value is available; `cancel` (via the orchestrator) detaches a subscriber
/// or aborts the owning request.
pub struct AnalysisHandle {
    id: Uuid,
    fingerprint: Fingerprint,
    submitted_at: DateTime<Utc>,
    rx: watch::Receiver<Option<Arc<AnalysisResult>>>,
    cancel_signal: CancelSignal,
    cancel_token: CancelToken,
}

impl AnalysisHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    fn new(
        fingerprint: Fingerprint,
        submitted_at: DateTime<Utc>,
        rx: watch::Receiver<Option<Arc<AnalysisResult>>>,
    ) -> (Self, CancelToken) {
        let (cancel_signal, cancel_token) = cancel_pair();
        let token = cancel_token.clone();
        (
            Self {
                id: Uuid::new_v4(),
                fingerprint,
                submitted_at,
                rx,
                cancel_signal,
                cancel_token,
            },
            token,
        )
    }

    fn ready(
        fingerprint: Fingerprint,
        submitted_at: DateTime<Utc>,
        result: Arc<AnalysisResult>,
    ) -> Self {
        let (_tx, rx) = watch::channel(Some(result));
        let (handle, _token) = Self::new(fingerprint, submitted_at, rx);
        handle
    }
}

/// State shared with the worker pool.
struct WorkerCtx {
    cache: FingerprintCache,
    session: SessionMemory,
    backend: Arc<dyn LlmBackend>,
    limits: NormalizeLimits,
    budget: PromptBudget,
}

/// The pipeline front door.
pub struct AnalysisOrchestrator {
    ctx: Arc<WorkerCtx>,
    queue_tx: mpsc::Sender<Job>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl AnalysisOrchestrator {
    /// Builds the orchestrator around an injected backend and spawns the
    /// worker pool.
    pub fn new(
        config: AnalystConfig,
        backend: Arc<dyn LlmBackend>,
    ) -> Result<Self, AnalysisError> {
        config.validate()?;
        if !backend.is_configured() {
            if let Some(issue) = backend.comms_issue() {
                warn!(%issue, "LLM backend is not fully configured");
            }
        }

        let ctx = Arc::new(WorkerCtx {
            cache: FingerprintCache::new(config.cache_capacity),
            session: SessionMemory::new(config.session_insights),
            backend,
            limits: NormalizeLimits {
                max_body_bytes: config.max_body_bytes,
                ..NormalizeLimits::default()
            },
            budget: PromptBudget {
                max_prompt_bytes: config.max_prompt_bytes,
                ..PromptBudget::default()
            },
        });

        let (queue_tx, queue_rx) = mpsc::channel::<Job>(config.queue_depth);
        let queue_rx = Arc::new(AsyncMutex::new(queue_rx));
        let workers = (0..config.workers)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let queue_rx = Arc::clone(&queue_rx);
                tokio::spawn(run_worker(worker_id, ctx, queue_rx))
            })
            .collect();

        info!(workers = config.workers, queue_depth = config.queue_depth, "analysis pipeline started");
        Ok(Self {
            ctx,
            queue_tx,
            workers,
        })
    }

    /// Convenience constructor wiring the HTTP LLM client from the config.
    pub fn with_http_backend(config: AnalystConfig) -> Result<Self, AnalysisError> {
        let client = LlmClient::new(config.llm_settings())
            .map_err(|e| AnalysisError::InvalidConfig(e.to_string()))?;
        Self::new(config, Arc::new(client))
    }

    /// Submits a transaction for analysis. Fails fast with `Overloaded` when
    /// workers and queue are saturated; duplicate fingerprints never consume
    /// a worker slot.
    pub fn submit(
        &self,
        transaction: Transaction,
        profile: AnalysisProfile,
    ) -> Result<AnalysisHandle, AnalysisError> {
        self.submit_with_priority(transaction, profile, Priority::Normal)
    }

    pub fn submit_with_priority(
        &self,
        transaction: Transaction,
        profile: AnalysisProfile,
        priority: Priority,
    ) -> Result<AnalysisHandle, AnalysisError> {
        let submitted_at = Utc::now();
        let fingerprint = transaction.fingerprint();

        match self.ctx.cache.lookup_or_reserve(fingerprint) {
            Lookup::Hit(result) => {
                debug!(fingerprint = %fingerprint.short_hex(), "cache hit");
                Ok(AnalysisHandle::ready(fingerprint, submitted_at, result))
            }
            Lookup::Pending(waiter) => {
                debug!(
                    fingerprint = %fingerprint.short_hex(),
                    "joining in-flight analysis"
                );
                let (handle, _token) =
                    AnalysisHandle::new(fingerprint, submitted_at, waiter.into_receiver());
                Ok(handle)
            }
            Lookup::Reserved(ticket) => {
                let rx = ticket.subscribe();
                let (handle, token) = AnalysisHandle::new(fingerprint, submitted_at, rx);
                let job = Job {
                    request: AnalysisRequest {
                        transaction,
                        fingerprint,
                        profile,
                        submitted_at,
                        priority,
                    },
                    ticket,
                    cancel: token,
                };
                match self.queue_tx.try_send(job) {
                    Ok(()) => {
                        debug!(
                            fingerprint = %fingerprint.short_hex(),
                            handle = %handle.id,
                            ?priority,
                            "analysis queued"
                        );
                        Ok(handle)
                    }
                    Err(mpsc::error::TrySendError::Full(job)) => {
                        // Dropping the job releases the reservation so a
                        // later submission can try again.
                        warn!(
                            fingerprint = %fingerprint.short_hex(),
                            "analysis queue full, rejecting submission"
                        );
                        drop(job);
                        Err(AnalysisError::Overloaded)
                    }
                    Err(mpsc::error::TrySendError::Closed(job)) => {
                        drop(job);
                        Err(AnalysisError::ShutDown)
                    }
                }
            }
        }
    }

    /// Suspends until the submission reaches a terminal state. Always yields
    /// a value; failures arrive as `Failed` results, never as panics or
    /// errors across this boundary.
    pub async fn result(&self, handle: &mut AnalysisHandle) -> Arc<AnalysisResult> {
        loop {
            if let Some(result) = handle.rx.borrow_and_update().clone() {
                return result;
            }
            if handle.cancel_token.is_cancelled() {
                return Arc::new(AnalysisResult::cancelled(
                    handle.fingerprint,
                    handle.submitted_at,
                ));
            }
            tokio::select! {
                _ = handle.cancel_token.cancelled() => {
                    return Arc::new(AnalysisResult::cancelled(
                        handle.fingerprint,
                        handle.submitted_at,
                    ));
                }
                changed = handle.rx.changed() => {
                    if changed.is_err() {
                        return Arc::new(AnalysisResult::failed(
                            handle.fingerprint,
                            "analysis abandoned before completion".to_string(),
                            String::new(),
                            handle.submitted_at,
                        ));
                    }
                }
            }
        }
    }

    /// Cancels a submission. A queued request is discarded before any LLM
    /// call; an in-flight request has its client call aborted and the
    /// reservation released with a `Cancelled` result so waiters never
    /// starve. Cancelling a subscriber handle only detaches that handle.
    pub fn cancel(&self, handle: &AnalysisHandle) {
        debug!(handle = %handle.id, fingerprint = %handle.fingerprint.short_hex(), "cancel requested");
        handle.cancel_signal.cancel();
    }

    /// Session memory of recent findings, shared with prompts.
    pub fn session(&self) -> &SessionMemory {
        &self.ctx.session
    }

    /// Drains the pool: no new submissions are accepted and workers stop
    /// after the queue empties.
    pub async fn shutdown(self) {
        drop(self.queue_tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "analysis worker ended abnormally");
            }
        }
        info!("analysis pipeline stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<WorkerCtx>,
    queue_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
) {
    debug!(worker_id, "analysis worker started");
    loop {
        let job = {
            let mut rx = queue_rx.lock().await;
            rx.recv().await
        };
        match job {
            Some(job) => process_job(&ctx, job).await,
            None => break,
        }
    }
    debug!(worker_id, "analysis worker stopped");
}

async fn process_job(ctx: &WorkerCtx, job: Job) {
    let Job {
        request,
        ticket,
        cancel,
    } = job;
    let fingerprint = request.fingerprint;

    // Cancelled while queued: release the reservation without any LLM call.
    if cancel.is_cancelled() {
        debug!(fingerprint = %fingerprint.short_hex(), "dropping cancelled queued request");
        ctx.cache.fail(
            ticket,
            Arc::new(AnalysisResult::cancelled(fingerprint, request.submitted_at)),
        );
        return;
    }

    let normalized = normalize(&request.transaction, &ctx.limits);
    if normalized.request_body_skipped || normalized.response_body_skipped {
        debug!(
            fingerprint = %fingerprint.short_hex(),
            "non-text content replaced with placeholder"
        );
    }

    let built = prompt::build(
        &normalized,
        request.profile,
        &ctx.session.formatted(),
        &ctx.budget,
    );
    if built.truncated {
        warn!(
            fingerprint = %fingerprint.short_hex(),
            "prompt evidence truncated to fit size budget"
        );
    }

    match ctx.backend.send(&built.prompt, cancel).await {
        Ok(reply) => publish_reply(ctx, ticket, &request, reply),
        Err(LlmError::Cancelled) => {
            debug!(fingerprint = %fingerprint.short_hex(), "in-flight analysis cancelled");
            ctx.cache.fail(
                ticket,
                Arc::new(AnalysisResult::cancelled(fingerprint, request.submitted_at)),
            );
        }
        Err(err) => {
            let failure = AnalysisFailure::Llm(err);
            error!(fingerprint = %fingerprint.short_hex(), %failure, "analysis failed");
            ctx.cache.fail(
                ticket,
                Arc::new(AnalysisResult::failed(
                    fingerprint,
                    failure.to_string(),
                    String::new(),
                    request.submitted_at,
                )),
            );
        }
    }
}

fn publish_reply(ctx: &WorkerCtx, ticket: Ticket, request: &AnalysisRequest, reply: ModelReply) {
    let fingerprint = request.fingerprint;
    match parser::parse(&reply) {
        Ok(parsed) => {
            let result = Arc::new(AnalysisResult::succeeded(
                fingerprint,
                parsed.findings,
                reply.text,
                request.submitted_at,
            ));
            info!(
                fingerprint = %fingerprint.short_hex(),
                findings = result.findings.len(),
                clean = result.no_issues_found,
                "analysis completed"
            );
            ctx.session
                .record_insight(&request.transaction.url, &result.summary());
            ctx.cache.complete(ticket, result);
        }
        Err(parse_err) => {
            let failure = AnalysisFailure::ParseFailure(parse_err.to_string());
            warn!(fingerprint = %fingerprint.short_hex(), %failure, "model reply rejected");
            ctx.cache.fail(
                ticket,
                Arc::new(AnalysisResult::failed(
                    fingerprint,
                    failure.to_string(),
                    reply.text,
                    request.submitted_at,
                )),
            );
        }
    }
}
