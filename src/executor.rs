use crate::{
    catalog::{ConversionMethod, MethodCatalog},
    config::Config,
    converter::ConvertRequest,
    detect::{FormatDetector, FormatProfile},
    error::{ConvertError, JobFailure},
    job::{
        AttemptOutcome, CancelToken, ConversionAttempt, ConversionJob, ConversionResult,
        FinalStatus,
    },
    util::now_rfc3339,
    validate::Scorer,
};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Method id recorded for the synthetic attempt of a failed detection.
pub const DETECT_ATTEMPT_ID: &str = "detect";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub quality_floor: f64,
    pub attempt_timeout: Option<Duration>,
    pub out_dir: PathBuf,
    pub discard_rejected: bool,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            quality_floor: cfg.jobs.quality_floor,
            attempt_timeout: (cfg.execution.attempt_timeout_seconds > 0)
                .then(|| Duration::from_secs(cfg.execution.attempt_timeout_seconds)),
            out_dir: PathBuf::from(&cfg.execution.out_dir),
            discard_rejected: cfg.output.discard_rejected,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Cascade states. `Succeeded` and `Exhausted` are terminal.
#[derive(Debug)]
enum CascadeState {
    Detecting,
    MethodsListed(FormatProfile),
    Attempting,
    Validating(usize),
    Retrying,
    Succeeded(usize),
    Exhausted,
}

/// Drives one job through detection, method selection, conversion and validation.
pub struct ConversionExecutor<'a> {
    detector: &'a FormatDetector,
    catalog: &'a MethodCatalog,
    scorer: &'a dyn Scorer,
    settings: ExecutorSettings,
}

impl<'a> ConversionExecutor<'a> {
    pub fn new(
        detector: &'a FormatDetector,
        catalog: &'a MethodCatalog,
        scorer: &'a dyn Scorer,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            detector,
            catalog,
            scorer,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn execute(&self, job: ConversionJob, cancel: &CancelToken) -> ConversionResult {
        let job_id = job.id();
        self.execute_as(job_id, job, cancel)
    }

    /// Runs `job` under `job_id`, which also names its directory below `out_dir`.
    /// Concurrent executions must use distinct ids.
    pub fn execute_as(
        &self,
        job_id: String,
        job: ConversionJob,
        cancel: &CancelToken,
    ) -> ConversionResult {
        info!(
            "job {job_id} start source={} target={} min_quality={}",
            job.source_path.display(),
            job.target_format,
            job.min_quality_score
        );
        let mut cascade = Cascade {
            job_dir: self.settings.out_dir.join(&job_id),
            job_id,
            job,
            profile: None,
            queue: VecDeque::new(),
            attempts: Vec::new(),
            best: None,
            failure: None,
            cancelled: false,
            unavailable: BTreeSet::new(),
        };

        let mut state = CascadeState::Detecting;
        loop {
            debug!(job = %cascade.job_id, ?state, "cascade step");
            state = match state {
                CascadeState::Detecting => self.detect(&mut cascade),
                CascadeState::MethodsListed(profile) => self.list_methods(&mut cascade, profile),
                CascadeState::Attempting => self.attempt(&mut cascade, cancel),
                CascadeState::Validating(idx) => self.validate(&mut cascade, idx),
                CascadeState::Retrying => {
                    if cascade.queue.is_empty() {
                        CascadeState::Exhausted
                    } else if cancel.is_cancelled() {
                        cascade.cancelled = true;
                        CascadeState::Exhausted
                    } else {
                        CascadeState::Attempting
                    }
                }
                CascadeState::Succeeded(idx) => return self.finish_succeeded(cascade, idx),
                CascadeState::Exhausted => return self.finish_exhausted(cascade),
            };
        }
    }

    fn detect(&self, c: &mut Cascade) -> CascadeState {
        let started_at = now_rfc3339();
        let started = Instant::now();
        match self
            .detector
            .detect(&c.job.source_path, c.job.source_format.as_deref())
        {
            Ok(profile) => CascadeState::MethodsListed(profile),
            Err(e) => {
                warn!("job {} detection failed: {e}", c.job_id);
                c.attempts.push(ConversionAttempt {
                    method_id: DETECT_ATTEMPT_ID.to_string(),
                    started_at,
                    finished_at: now_rfc3339(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    outcome: AttemptOutcome::Failure {
                        reason: e.to_string(),
                    },
                    output_path: None,
                    quality: None,
                    warnings: Vec::new(),
                });
                c.failure = Some(JobFailure::Detection {
                    reason: e.to_string(),
                });
                CascadeState::Exhausted
            }
        }
    }

    fn list_methods(&self, c: &mut Cascade, profile: FormatProfile) -> CascadeState {
        let from = profile.detected_format;
        let to = c.job.target_format;
        c.queue = self
            .catalog
            .candidates(from, to, &profile.structural_features)
            .into();
        info!(
            "job {} detected {from} (confidence {:.1}) features={:?} candidates={}",
            c.job_id,
            profile.confidence,
            profile.structural_features,
            c.queue.len()
        );
        c.profile = Some(profile);
        if c.queue.is_empty() {
            warn!("job {} has no eligible method for {from} -> {to}", c.job_id);
            c.failure = Some(JobFailure::NoEligibleMethod { from, to });
            return CascadeState::Exhausted;
        }
        CascadeState::Attempting
    }

    fn attempt(&self, c: &mut Cascade, cancel: &CancelToken) -> CascadeState {
        if cancel.is_cancelled() {
            c.cancelled = true;
            return CascadeState::Exhausted;
        }
        let Some(method) = c.queue.pop_front() else {
            return CascadeState::Exhausted;
        };
        if c.unavailable.contains(method.invoke.name()) {
            warn!(
                "job {} skipping {}: converter '{}' is unavailable",
                c.job_id,
                method.id,
                method.invoke.name()
            );
            return CascadeState::Retrying;
        }
        let Some(profile) = c.profile.as_ref() else {
            return CascadeState::Exhausted;
        };

        let started_at = now_rfc3339();
        let started = Instant::now();
        let output = c.job_dir.join(output_file_name(&c.job.source_path, &method));
        let result = match std::fs::create_dir_all(&c.job_dir) {
            Ok(()) => {
                let req = ConvertRequest {
                    source: &c.job.source_path,
                    source_format: profile.detected_format,
                    target_format: c.job.target_format,
                    options: &c.job.options,
                    out_dir: &c.job_dir,
                    output,
                    timeout: self.settings.attempt_timeout,
                };
                info!("job {} attempt {} (rank {})", c.job_id, method.id, method.rank);
                method.invoke.convert(&req)
            }
            Err(e) => Err(ConvertError::Failed(format!(
                "create {}: {e}",
                c.job_dir.display()
            ))),
        };
        let elapsed = started.elapsed();

        // A converter that overran its budget is treated as timed out.
        let result = match result {
            Ok(out) if self.settings.attempt_timeout.is_some_and(|t| elapsed > t) => {
                remove_output(&out.path);
                Err(ConvertError::Timeout)
            }
            other => other,
        };

        let mut attempt = ConversionAttempt {
            method_id: method.id.clone(),
            started_at,
            finished_at: now_rfc3339(),
            duration_ms: elapsed.as_millis() as u64,
            outcome: AttemptOutcome::Success,
            output_path: None,
            quality: None,
            warnings: Vec::new(),
        };

        match result {
            Ok(out) => {
                attempt.output_path = Some(out.path);
                attempt.warnings = out.warnings;
                c.attempts.push(attempt);
                CascadeState::Validating(c.attempts.len() - 1)
            }
            Err(e) => {
                warn!("job {} method {} failed: {e}", c.job_id, method.id);
                attempt.outcome = match &e {
                    ConvertError::Timeout => AttemptOutcome::Timeout,
                    other => AttemptOutcome::Failure {
                        reason: other.to_string(),
                    },
                };
                if let ConvertError::Unavailable(_) = e {
                    c.unavailable.insert(method.invoke.name().to_string());
                }
                c.attempts.push(attempt);
                CascadeState::Retrying
            }
        }
    }

    fn validate(&self, c: &mut Cascade, idx: usize) -> CascadeState {
        let Some(output) = c.attempts[idx].output_path.clone() else {
            return CascadeState::Retrying;
        };
        let source_format = match c.profile.as_ref() {
            Some(p) => p.detected_format,
            None => return CascadeState::Exhausted,
        };
        let method_id = c.attempts[idx].method_id.clone();

        let report = match self.scorer.score(
            &c.job.source_path,
            &output,
            source_format,
            c.job.target_format,
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!("job {} method {method_id} output could not be scored: {e}", c.job_id);
                c.attempts[idx].outcome = AttemptOutcome::Failure {
                    reason: format!("validation failed: {e}"),
                };
                self.discard(c, idx);
                return CascadeState::Retrying;
            }
        };
        let score = report.score;
        c.attempts[idx].quality = Some(report);

        if score >= c.job.min_quality_score {
            info!("job {} method {method_id} scored {score}", c.job_id);
            return CascadeState::Succeeded(idx);
        }

        if score >= self.settings.quality_floor {
            info!(
                "job {} method {method_id} scored {score}, below requested {}",
                c.job_id, c.job.min_quality_score
            );
            let better = c
                .best
                .and_then(|b| c.attempts[b].quality_score())
                .is_none_or(|best| score > best);
            if better {
                if let Some(prev) = c.best.replace(idx) {
                    self.discard(c, prev);
                }
            } else {
                self.discard(c, idx);
            }
        } else {
            warn!(
                "job {} method {method_id} scored {score}, below quality floor {}",
                c.job_id, self.settings.quality_floor
            );
            self.discard(c, idx);
        }
        CascadeState::Retrying
    }

    fn finish_succeeded(&self, mut c: Cascade, idx: usize) -> ConversionResult {
        if let Some(prev) = c.best.take() {
            self.discard(&mut c, prev);
        }
        let attempt = &c.attempts[idx];
        let final_status = if attempt.warnings.is_empty() {
            FinalStatus::Completed
        } else {
            FinalStatus::CompletedWithWarnings
        };
        let final_quality_score = attempt.quality_score();
        let output_path = attempt.output_path.clone();
        info!(
            "job {} {:?} via {} score={:?} attempts={}",
            c.job_id,
            final_status,
            attempt.method_id,
            final_quality_score,
            c.attempts.len()
        );
        c.into_result(final_status, final_quality_score, output_path, None)
    }

    fn finish_exhausted(&self, c: Cascade) -> ConversionResult {
        if let Some(failure) = c.failure.clone() {
            return c.into_result(FinalStatus::Failed, None, None, Some(failure));
        }
        if let Some(best) = c.best {
            let score = c.attempts[best].quality_score();
            let output = c.attempts[best].output_path.clone();
            warn!(
                "job {} needs review: best score {:?} from {}",
                c.job_id, score, c.attempts[best].method_id
            );
            return c.into_result(FinalStatus::NeedsReview, score, output, None);
        }
        if c.cancelled {
            info!("job {} cancelled after {} attempts", c.job_id, c.attempts.len());
            return c.into_result(FinalStatus::Cancelled, None, None, Some(JobFailure::Cancelled));
        }
        let attempts = c.attempts.len();
        warn!("job {} failed after {attempts} attempts", c.job_id);
        c.into_result(
            FinalStatus::Failed,
            None,
            None,
            Some(JobFailure::Exhausted { attempts }),
        )
    }

    /// Drops an attempt's output from consideration, deleting it when configured.
    fn discard(&self, c: &mut Cascade, idx: usize) {
        if !self.settings.discard_rejected {
            return;
        }
        if let Some(path) = c.attempts[idx].output_path.take() {
            remove_output(&path);
        }
    }
}

struct Cascade {
    job_id: String,
    job: ConversionJob,
    job_dir: PathBuf,
    profile: Option<FormatProfile>,
    queue: VecDeque<ConversionMethod>,
    attempts: Vec<ConversionAttempt>,
    /// Best attempt scoring between the floor and the job's minimum.
    best: Option<usize>,
    failure: Option<JobFailure>,
    cancelled: bool,
    unavailable: BTreeSet<String>,
}

impl Cascade {
    fn into_result(
        self,
        final_status: FinalStatus,
        final_quality_score: Option<f64>,
        output_path: Option<PathBuf>,
        failure: Option<JobFailure>,
    ) -> ConversionResult {
        ConversionResult {
            job_id: self.job_id,
            job: self.job,
            profile: self.profile,
            attempts: self.attempts,
            final_status,
            final_quality_score,
            output_path,
            failure,
        }
    }
}

fn output_file_name(source: &Path, method: &ConversionMethod) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let method_id: String = method
        .id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '-' })
        .collect();
    format!("{stem}.{method_id}.{}", method.target_format.extension())
}

fn remove_output(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove rejected output {}: {e}", path.display());
        }
    }
}
