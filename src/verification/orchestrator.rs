//! VerificationOrchestrator: fans prescriptions out over a worker pool.
//!
//! Small runs (or turbo mode off) stay on the calling thread. Larger runs
//! are split into contiguous chunks, one per worker; workers log through a
//! bounded channel that is drained once every chunk has reported.
//!
//! A transient failure inside a chunk earns one retry after a resource
//! hint. The retry resumes at the prescription that failed, so finished
//! prescriptions are neither redone nor counted twice.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use super::checker::PerDocumentChecker;
use super::config::OrchestratorConfig;
use super::error::VerificationError;
use super::observability::{self, ChannelLogger, LogLevel, LogRecord, TracingLogger};
use super::scan_index::ScanIndex;
use super::tapes::reconcile_tapes;
use super::traits::{Metrics, PrescriptionSource, RunLogger};
use super::types::*;

/// Cancellation flag shared with the caller, checked between prescriptions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════
// Chunk execution
// ═══════════════════════════════════════════

#[derive(Debug, Default)]
struct ChunkOutput {
    outcomes: Vec<PrescriptionOutcome>,
    failures: Vec<FatalFailure>,
    retried: bool,
}

/// Everything a worker needs; cloned into each thread.
#[derive(Clone)]
struct WorkerContext {
    checker: Arc<PerDocumentChecker>,
    source: Arc<dyn PrescriptionSource>,
    metrics: Arc<dyn Metrics>,
    logger: Arc<dyn RunLogger>,
    cancel: CancelToken,
    shutdown: Arc<AtomicBool>,
}

impl WorkerContext {
    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.shutdown.load(Ordering::Relaxed)
    }

    fn check_one(&self, id: &PrescriptionId) -> Result<PrescriptionOutcome, VerificationError> {
        let prescription = self.source.load(id)?;
        self.checker.check_prescription(prescription, self.logger.as_ref())
    }

    fn run_chunk(&self, index: usize, ids: &[PrescriptionId]) -> Result<ChunkOutput, VerificationError> {
        let mut output = ChunkOutput::default();
        let mut position = 0;

        while let Some(id) = ids.get(position) {
            if self.stopped() {
                return Err(VerificationError::Cancelled);
            }
            match self.check_one(id) {
                Ok(outcome) => output.outcomes.push(outcome),
                Err(e) if e.is_transient() => {
                    if output.retried {
                        return Err(VerificationError::ChunkFailed {
                            chunk: index,
                            reason: e.to_string(),
                        });
                    }
                    output.retried = true;
                    self.logger.log(
                        LogRecord::new(LogLevel::Warn, "Transient failure, retrying chunk once")
                            .for_prescription(id)
                            .field("chunk", index)
                            .field("error", &e),
                    );
                    self.checker.release_resources();
                    self.metrics.chunk_retried(index);
                    continue;
                }
                Err(VerificationError::Cancelled) => return Err(VerificationError::Cancelled),
                Err(e) => {
                    self.logger.log(
                        LogRecord::new(LogLevel::Error, "Prescription could not be checked")
                            .for_prescription(id)
                            .field("error", &e),
                    );
                    output.failures.push(FatalFailure {
                        prescription: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            self.metrics.prescription_checked(id);
            position += 1;
        }
        Ok(output)
    }

    /// `run_chunk` with a panic reported as `WorkerPanicked`.
    fn run_chunk_guarded(
        &self,
        index: usize,
        ids: &[PrescriptionId],
    ) -> Result<ChunkOutput, VerificationError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.run_chunk(index, ids)))
            .unwrap_or(Err(VerificationError::WorkerPanicked(index)))
    }
}

// ═══════════════════════════════════════════
// Worker pool
// ═══════════════════════════════════════════

struct Job {
    index: usize,
    ids: Vec<PrescriptionId>,
}

type ChunkResult = (usize, Result<ChunkOutput, VerificationError>);

/// Threads pulling chunks from a shared queue.
///
/// Dropping the pool stops it: workers finish their current prescription,
/// threads are joined, then the stop sentinel goes onto the log channel.
struct WorkerPool {
    jobs: Option<Sender<Job>>,
    shutdown: Arc<AtomicBool>,
    logger: ChannelLogger,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(workers: usize, context: WorkerContext, logger: ChannelLogger) -> (Self, Receiver<ChunkResult>) {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<ChunkResult>();
        let shutdown = Arc::clone(&context.shutdown);

        let handles = (0..workers)
            .map(|worker| {
                let context = context.clone();
                let jobs = Arc::clone(&job_rx);
                let results = result_tx.clone();
                thread::spawn(move || worker_loop(worker, &context, &jobs, &results))
            })
            .collect();

        let pool = Self {
            jobs: Some(job_tx),
            shutdown,
            logger,
            handles,
        };
        (pool, result_rx)
    }

    fn submit(&self, job: Job) -> Result<(), VerificationError> {
        self.jobs
            .as_ref()
            .ok_or(VerificationError::PoolDisconnected)?
            .send(job)
            .map_err(|_| VerificationError::PoolDisconnected)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.jobs.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked outside a chunk");
            }
        }
        if !self.logger.stop() {
            tracing::debug!("Log channel full, drain ends at the last record");
        }
    }
}

fn worker_loop(
    worker: usize,
    context: &WorkerContext,
    jobs: &Mutex<Receiver<Job>>,
    results: &Sender<ChunkResult>,
) {
    loop {
        let next = match jobs.lock() {
            Ok(queue) => queue.recv(),
            Err(_) => break,
        };
        let Ok(job) = next else {
            break;
        };
        tracing::debug!(worker, chunk = job.index, size = job.ids.len(), "Chunk started");
        let result = context.run_chunk_guarded(job.index, &job.ids);
        if results.send((job.index, result)).is_err() {
            break;
        }
    }
}

// ═══════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════

pub struct VerificationOrchestrator {
    checker: Arc<PerDocumentChecker>,
    source: Arc<dyn PrescriptionSource>,
    config: OrchestratorConfig,
    cancel: CancelToken,
}

impl VerificationOrchestrator {
    pub fn new(
        checker: PerDocumentChecker,
        source: Box<dyn PrescriptionSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            checker: Arc::new(checker),
            source: Arc::from(source),
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Handle that cancels the current or next run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Worker count for a run of `n` prescriptions; 1 means sequential.
    pub fn worker_count(&self, n: usize) -> usize {
        if !self.config.turbo_mode || n < self.config.sequential_threshold || n == 0 {
            return 1;
        }
        let available = thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
        available.min(self.config.max_threads).max(1)
    }

    /// Check every prescription in `ids`.
    ///
    /// Per-prescription metadata failures end up in `RunOutcome::failures`;
    /// a chunk that fails twice, a worker panic or cancellation abort the run.
    pub fn run(
        &self,
        ids: &BTreeSet<PrescriptionId>,
        scan_index: Option<&ScanIndex>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<RunOutcome, VerificationError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        let ids: Vec<PrescriptionId> = ids
            .iter()
            .filter(|id| {
                if id.is_unrecognised() {
                    tracing::debug!(prescription = %id, "Skipping unrecognised barcode");
                }
                !id.is_unrecognised()
            })
            .cloned()
            .collect();

        let workers = self.worker_count(ids.len());
        tracing::info!(
            run_id = %run_id,
            prescriptions = ids.len(),
            workers,
            "Verification run started"
        );

        let outputs = if workers > 1 {
            self.run_parallel(&ids, workers, &metrics)?
        } else {
            self.run_sequential(&ids, &metrics)?
        };

        let retried_chunks = outputs.iter().filter(|o| o.retried).count() as u32;
        let mut records = BTreeMap::new();
        let mut pages = Vec::new();
        let mut failures = Vec::new();
        for output in outputs {
            for outcome in output.outcomes {
                pages.extend(outcome.pages);
                records.insert(outcome.prescription.id, outcome.prescription.executions);
            }
            failures.extend(output.failures);
        }

        let mut pages = dedupe_pages(pages);
        if let Some(index) = scan_index {
            for page in pages.iter_mut().filter(|p| !p.file_name.is_empty()) {
                page.stack_number = index.stack_number(&page.file_name);
            }
        }
        reconcile_tapes(&mut pages, &expected_tapes(&records));

        let duration_ms = start.elapsed().as_millis() as u64;
        let progress = metrics.progress();
        tracing::info!(
            run_id = %run_id,
            prescriptions = records.len(),
            pages = pages.len(),
            failures = failures.len(),
            retried_chunks,
            duration_ms,
            "Verification run completed"
        );

        Ok(RunOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records,
            pages,
            failures,
            progress,
            retried_chunks,
            duration_ms,
        })
    }

    fn context(&self, metrics: &Arc<dyn Metrics>, logger: Arc<dyn RunLogger>) -> WorkerContext {
        WorkerContext {
            checker: Arc::clone(&self.checker),
            source: Arc::clone(&self.source),
            metrics: Arc::clone(metrics),
            logger,
            cancel: self.cancel.clone(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn run_sequential(
        &self,
        ids: &[PrescriptionId],
        metrics: &Arc<dyn Metrics>,
    ) -> Result<Vec<ChunkOutput>, VerificationError> {
        let context = self.context(metrics, Arc::new(TracingLogger));
        Ok(vec![context.run_chunk_guarded(0, ids)?])
    }

    fn run_parallel(
        &self,
        ids: &[PrescriptionId],
        workers: usize,
        metrics: &Arc<dyn Metrics>,
    ) -> Result<Vec<ChunkOutput>, VerificationError> {
        let chunk_size = ids.len().div_ceil(workers);
        let chunks: Vec<Vec<PrescriptionId>> = ids.chunks(chunk_size).map(<[_]>::to_vec).collect();
        let (logger, log_rx) = ChannelLogger::bounded(self.config.log_channel_capacity);
        let context = self.context(metrics, Arc::new(logger.clone()));

        let collected = {
            let (pool, results) = WorkerPool::start(workers.min(chunks.len()), context, logger);
            collect_chunks(&pool, &results, chunks)
        };

        for record in observability::drain(&log_rx) {
            record.emit();
        }
        collected
    }
}

/// Submit every chunk and wait for all of them, in chunk order.
fn collect_chunks(
    pool: &WorkerPool,
    results: &Receiver<ChunkResult>,
    chunks: Vec<Vec<PrescriptionId>>,
) -> Result<Vec<ChunkOutput>, VerificationError> {
    let total = chunks.len();
    for (index, ids) in chunks.into_iter().enumerate() {
        pool.submit(Job { index, ids })?;
    }

    let mut outputs: Vec<Option<ChunkOutput>> = (0..total).map(|_| None).collect();
    for _ in 0..total {
        let (index, result) = results
            .recv()
            .map_err(|_| VerificationError::PoolDisconnected)?;
        let output = result?;
        tracing::debug!(chunk = index, checked = output.outcomes.len(), "Chunk finished");
        if let Some(slot) = outputs.get_mut(index) {
            *slot = Some(output);
        }
    }
    Ok(outputs.into_iter().flatten().collect())
}

/// Keep the first row per page key, ordered by prescription id.
fn dedupe_pages(pages: Vec<PageCheckResult>) -> Vec<PageCheckResult> {
    let mut seen = HashSet::new();
    let mut unique: Vec<PageCheckResult> =
        pages.into_iter().filter(|p| seen.insert(p.key())).collect();
    unique.sort_by(|a, b| a.prescription.cmp(&b.prescription));
    unique
}

/// Registry tape codes per (prescription, execution). Executions without
/// expected codes keep the checker's coupon verdict.
fn expected_tapes(
    records: &BTreeMap<PrescriptionId, BTreeMap<ExecutionDigits, DocumentRecord>>,
) -> HashMap<(PrescriptionId, ExecutionDigits), Vec<String>> {
    records
        .iter()
        .flat_map(|(id, executions)| {
            executions
                .values()
                .filter(|r| !r.expected_tapes.is_empty())
                .map(move |r| ((id.clone(), r.execution.clone()), r.expected_tapes.clone()))
        })
        .collect()
}
