use crate::{
    error::JobFailure,
    executor::ConversionExecutor,
    job::{CancelToken, ConversionJob, ConversionResult, FinalStatus},
    util::now_rfc3339,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub needs_review: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean final score over succeeded jobs only.
    pub average_quality_score: Option<f64>,
    /// Set when the failed fraction exceeds the configured threshold.
    pub escalate: bool,
    /// Input positions of jobs that are `Failed` or `NeedsReview`.
    pub attention: Vec<usize>,
    pub started_at: String,
    pub finished_at: String,
    /// One result per input job, in input order.
    pub per_job_results: Vec<ConversionResult>,
}

impl BatchReport {
    pub fn from_results(
        per_job_results: Vec<ConversionResult>,
        escalate_failure_ratio: f64,
        started_at: String,
    ) -> Self {
        let total = per_job_results.len();
        let count = |pred: fn(FinalStatus) -> bool| {
            per_job_results
                .iter()
                .filter(|r| pred(r.final_status))
                .count()
        };
        let succeeded = count(|s| s.is_success());
        let needs_review = count(|s| s == FinalStatus::NeedsReview);
        let failed = count(|s| s == FinalStatus::Failed);
        let cancelled = count(|s| s == FinalStatus::Cancelled);

        let scores: Vec<f64> = per_job_results
            .iter()
            .filter(|r| r.final_status.is_success())
            .filter_map(|r| r.final_quality_score)
            .collect();
        let average_quality_score =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);

        let escalate = total > 0 && failed as f64 / total as f64 > escalate_failure_ratio;
        let attention = per_job_results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.final_status.needs_attention())
            .map(|(i, _)| i)
            .collect();

        Self {
            total,
            succeeded,
            needs_review,
            failed,
            cancelled,
            average_quality_score,
            escalate,
            attention,
            started_at,
            finished_at: now_rfc3339(),
            per_job_results,
        }
    }
}

/// Admission check run before a job is handed to the executor; `Err` carries
/// the reason the job is rejected.
pub type InputCheck<'a> = Box<dyn Fn(&ConversionJob) -> Result<(), String> + Send + Sync + 'a>;

/// Runs jobs over a bounded pool of executor workers.
pub struct BatchOrchestrator<'a> {
    executor: ConversionExecutor<'a>,
    escalate_failure_ratio: f64,
    input_check: Option<InputCheck<'a>>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(executor: ConversionExecutor<'a>, escalate_failure_ratio: f64) -> Self {
        Self {
            executor,
            escalate_failure_ratio,
            input_check: None,
        }
    }

    /// Jobs failing `check` are reported `Failed` with
    /// [`JobFailure::InvalidInput`] and never reach a converter.
    pub fn with_input_check(mut self, check: InputCheck<'a>) -> Self {
        self.input_check = Some(check);
        self
    }

    fn rejection(&self, job: &ConversionJob) -> Option<String> {
        self.input_check.as_ref().and_then(|check| check(job).err())
    }

    pub fn run_batch(
        &self,
        jobs: Vec<ConversionJob>,
        max_concurrency: usize,
        cancel: &CancelToken,
    ) -> BatchReport {
        let started_at = now_rfc3339();
        let total = jobs.len();
        let worker_count = max_concurrency.max(1).min(total.max(1));
        info!("batch start jobs={total} workers={worker_count}");

        let (job_tx, job_rx) = unbounded::<(usize, ConversionJob)>();
        let (result_tx, result_rx) = unbounded::<(usize, ConversionResult)>();
        for item in jobs.iter().cloned().enumerate() {
            // The receiver outlives this loop, so sending cannot fail.
            let _ = job_tx.send(item);
        }
        drop(job_tx);

        let mut slots: Vec<Option<ConversionResult>> = (0..total).map(|_| None).collect();
        std::thread::scope(|scope| {
            for worker_id in 0..worker_count {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || self.run_worker(worker_id, job_rx, result_tx, cancel));
            }
            drop(result_tx);

            // Single aggregator: workers never touch the report directly.
            for (idx, result) in result_rx.iter() {
                debug!("batch job {idx} finished: {:?}", result.final_status);
                slots[idx] = Some(result);
            }
        });

        let per_job_results: Vec<ConversionResult> = slots
            .into_iter()
            .zip(jobs)
            .enumerate()
            .map(|(idx, (slot, job))| {
                slot.unwrap_or_else(|| {
                    error!("batch job {idx} produced no result; marking failed");
                    ConversionResult::aborted(
                        job.batch_id(idx),
                        job,
                        "worker stopped before reporting a result",
                    )
                })
            })
            .collect();

        let report =
            BatchReport::from_results(per_job_results, self.escalate_failure_ratio, started_at);
        info!(
            "batch done total={} succeeded={} needs_review={} failed={} cancelled={} avg={:?}",
            report.total,
            report.succeeded,
            report.needs_review,
            report.failed,
            report.cancelled,
            report.average_quality_score
        );
        if report.escalate {
            warn!(
                "failed fraction {}/{} exceeds {}; escalating",
                report.failed, report.total, self.escalate_failure_ratio
            );
        }
        report
    }

    fn run_worker(
        &self,
        worker_id: usize,
        job_rx: Receiver<(usize, ConversionJob)>,
        result_tx: Sender<(usize, ConversionResult)>,
        cancel: &CancelToken,
    ) {
        debug!("worker {worker_id} started");
        for (idx, job) in job_rx.iter() {
            let job_id = job.batch_id(idx);
            let result = if cancel.is_cancelled() {
                ConversionResult::cancelled(job_id, job)
            } else if let Some(reason) = self.rejection(&job) {
                warn!("batch job {idx} rejected: {reason}");
                ConversionResult::failed(job_id, job, JobFailure::InvalidInput { reason })
            } else {
                let fallback = (job_id.clone(), job.clone());
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    self.executor.execute_as(job_id, job, cancel)
                }))
                .unwrap_or_else(|_| {
                    error!("worker {worker_id} panicked on job {idx}");
                    ConversionResult::aborted(fallback.0, fallback.1, "executor panicked")
                })
            };
            if result_tx.send((idx, result)).is_err() {
                error!("worker {worker_id} failed to send result for job {idx}");
                break;
            }
        }
        debug!("worker {worker_id} stopped");
    }
}
