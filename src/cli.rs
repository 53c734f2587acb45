use crate::{
    batch::BatchOrchestrator,
    catalog::MethodCatalog,
    config::{Config, check_quality_score},
    converter::CommandConverter,
    detect::FormatDetector,
    executor::{ConversionExecutor, ExecutorSettings},
    format::Format,
    job::{CancelToken, ConversionJob, ConversionResult},
    util::{ensure_dir, looks_like_url},
    validate::{QualityValidator, Scorer},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "morph-check")]
#[command(about = "Format conversion orchestrator (detection + method cascade + fidelity scoring)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./morph-check.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that every configured converter program can be found.
    Doctor {},
    /// Print the format profile of a file.
    Detect {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        hint: Option<String>,
    },
    /// List eligible methods for a format pair, optionally filtered by a file's features.
    Methods {
        #[arg(long)]
        from: Format,
        #[arg(long)]
        to: Format,
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Score an existing output against its source.
    Score {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        from: Option<Format>,
        #[arg(long)]
        to: Option<Format>,
    },
    Convert {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        to: Format,
        /// Source format hint.
        #[arg(long)]
        from: Option<String>,
        #[arg(long, value_parser = parse_quality)]
        min_quality: Option<f64>,
        /// Converter option as KEY=VALUE; repeatable.
        #[arg(long = "opt", value_parser = parse_option)]
        options: Vec<(String, String)>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    Batch {
        /// TOML manifest with `[[jobs]]` entries.
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        max_concurrency: Option<usize>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn parse_quality(raw: &str) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    check_quality_score("min quality", value).map_err(|e| e.to_string())?;
    Ok(value)
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let mut cfg = Config::load(&cfg_path)?;

    let out_override = match &args.cmd {
        Command::Convert { out_dir, .. } | Command::Batch { out_dir, .. } => out_dir.clone(),
        _ => None,
    };
    if let Some(out) = out_override {
        cfg.execution.out_dir = out.display().to_string();
    }

    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    info!("config {}", cfg_path.display());

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Detect { input, hint } => detect(&cfg, input, hint.as_deref()),
        Command::Methods { from, to, input } => methods(&cfg, *from, *to, input.as_deref()),
        Command::Score {
            source,
            output,
            from,
            to,
        } => score(&cfg, source, output, *from, *to),
        Command::Convert {
            input,
            to,
            from,
            min_quality,
            options,
            ..
        } => {
            let mut job = ConversionJob::new(input, *to)
                .with_min_quality(min_quality.unwrap_or(cfg.jobs.min_quality_score));
            if let Some(hint) = from {
                job = job.with_hint(hint);
            }
            for (k, v) in options {
                job = job.with_option(k, v);
            }
            convert(&cfg, job)
        }
        Command::Batch {
            manifest,
            max_concurrency,
            ..
        } => batch(&cfg, manifest, *max_concurrency),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = user {
        return Ok(p.to_path_buf());
    }
    let default = PathBuf::from("morph-check.toml");
    if default.exists() {
        Ok(default)
    } else {
        Ok(PathBuf::from("morph-check.example.toml"))
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.execution.out_dir).join("morph-check.log"))
}

/// Components shared by every job; the executor borrows them.
struct Runtime {
    detector: FormatDetector,
    catalog: MethodCatalog,
    validator: QualityValidator,
    settings: ExecutorSettings,
}

impl Runtime {
    fn new(cfg: &Config) -> Result<Self> {
        let catalog = MethodCatalog::from_config(cfg).with_context(|| "building method catalog")?;
        Ok(Self {
            detector: FormatDetector::new(&cfg.limits),
            catalog,
            validator: QualityValidator::new(&cfg.quality.weights, &cfg.limits),
            settings: ExecutorSettings::from_config(cfg),
        })
    }

    fn executor(&self) -> ConversionExecutor<'_> {
        ConversionExecutor::new(
            &self.detector,
            &self.catalog,
            &self.validator,
            self.settings.clone(),
        )
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    let mut converters = BTreeMap::new();
    for (name, def) in &cfg.converters {
        let c = CommandConverter::new(name, def);
        let found = c.locate();
        if found.is_none() {
            warn!("converter '{name}' program not found: {}", c.program().display());
        }
        converters.insert(
            name.clone(),
            serde_json::json!({
                "program": c.program(),
                "found": found,
            }),
        );
    }
    let catalog = match MethodCatalog::from_config(cfg) {
        Ok(c) => serde_json::json!({
            "ok": true,
            "methods": c.len(),
            "pairs": c.pairs().iter().map(|(f, t)| format!("{f}->{t}")).collect::<Vec<_>>(),
        }),
        Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
    };
    print_json(&serde_json::json!({
        "converters": converters,
        "catalog": catalog,
    }))
}

fn detect(cfg: &Config, input: &Path, hint: Option<&str>) -> Result<()> {
    validate_input(cfg, input)?;
    let detector = FormatDetector::new(&cfg.limits);
    let profile = detector.detect(input, hint)?;
    print_json(&serde_json::json!({
        "input": input,
        "profile": profile,
        "signals_disagree": profile.signals_disagree(),
    }))
}

fn methods(cfg: &Config, from: Format, to: Format, input: Option<&Path>) -> Result<()> {
    let catalog = MethodCatalog::from_config(cfg)?;
    let features = match input {
        Some(path) => {
            validate_input(cfg, path)?;
            FormatDetector::new(&cfg.limits)
                .detect(path, Some(from.as_str()))?
                .structural_features
        }
        None => Default::default(),
    };
    let candidates = catalog.candidates(from, to, &features);
    print_json(&serde_json::json!({
        "from": from,
        "to": to,
        "features": features,
        "candidates": candidates,
    }))
}

fn score(
    cfg: &Config,
    source: &Path,
    output: &Path,
    from: Option<Format>,
    to: Option<Format>,
) -> Result<()> {
    let detector = FormatDetector::new(&cfg.limits);
    let from = match from {
        Some(f) => f,
        None => detector.detect(source, None)?.detected_format,
    };
    let to = match to {
        Some(f) => f,
        None => detector.detect(output, None)?.detected_format,
    };
    let validator = QualityValidator::new(&cfg.quality.weights, &cfg.limits);
    let report = validator.score(source, output, from, to)?;
    print_json(&report)
}

fn convert(cfg: &Config, job: ConversionJob) -> Result<()> {
    validate_input(cfg, &job.source_path)?;
    let runtime = Runtime::new(cfg)?;
    dump_effective_config(cfg)?;

    let result = runtime.executor().execute(job, &CancelToken::new());
    if cfg.output.write_report_json {
        let dir = PathBuf::from(&cfg.execution.out_dir).join(&result.job_id);
        ensure_dir(&dir)?;
        write_json(&dir.join(&cfg.output.report_filename), &result)?;
    }
    if cfg.global.print_summary {
        print_json(&result)?;
    }
    if !result.final_status.is_success() {
        warn!("job {} finished as {:?}", result.job_id, result.final_status);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    max_concurrency: Option<usize>,
    #[serde(default)]
    jobs: Vec<ManifestJob>,
}

#[derive(Debug, Deserialize)]
struct ManifestJob {
    source_path: PathBuf,
    #[serde(default)]
    source_format: Option<String>,
    target_format: Format,
    #[serde(default)]
    min_quality_score: Option<f64>,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

/// Reads a batch manifest. Relative source paths resolve against the manifest's
/// directory; returns the manifest's own concurrency override with the jobs.
pub fn load_manifest(cfg: &Config, path: &Path) -> Result<(Option<usize>, Vec<ConversionJob>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest: {}", path.display()))?;
    let manifest: Manifest = toml::from_str(&raw).with_context(|| "parsing manifest TOML")?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut jobs = Vec::with_capacity(manifest.jobs.len());
    for (idx, j) in manifest.jobs.into_iter().enumerate() {
        let min_quality_score = j.min_quality_score.unwrap_or(cfg.jobs.min_quality_score);
        check_quality_score(&format!("jobs[{idx}].min_quality_score"), min_quality_score)
            .with_context(|| format!("invalid manifest: {}", path.display()))?;
        let source = if j.source_path.is_absolute() {
            j.source_path
        } else {
            base.join(j.source_path)
        };
        jobs.push(ConversionJob {
            source_path: source,
            source_format: j.source_format,
            target_format: j.target_format,
            min_quality_score,
            options: j.options,
        });
    }
    Ok((manifest.max_concurrency, jobs))
}

fn batch(cfg: &Config, manifest: &Path, max_concurrency: Option<usize>) -> Result<()> {
    let (manifest_concurrency, jobs) = load_manifest(cfg, manifest)?;
    let max_concurrency = max_concurrency
        .or(manifest_concurrency)
        .unwrap_or(cfg.batch.max_concurrency);

    let runtime = Runtime::new(cfg)?;
    dump_effective_config(cfg)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("interrupt received; finishing in-flight attempts");
        handler_token.cancel();
    }) {
        warn!("could not install Ctrl-C handler: {e}");
    }

    // Invalid inputs still get a per-job result.
    let orchestrator = BatchOrchestrator::new(runtime.executor(), cfg.batch.escalate_failure_ratio)
        .with_input_check(Box::new(|job: &ConversionJob| {
            validate_input(cfg, &job.source_path).map_err(|e| format!("{e:#}"))
        }));
    let report = orchestrator.run_batch(jobs, max_concurrency, &cancel);

    if cfg.output.write_report_json {
        let dir = PathBuf::from(&cfg.execution.out_dir);
        ensure_dir(&dir)?;
        write_json(&dir.join(&cfg.output.batch_report_filename), &report)?;
    }
    if cfg.global.print_summary {
        let attention: Vec<_> = report
            .attention
            .iter()
            .map(|&i| summarize(i, &report.per_job_results[i]))
            .collect();
        print_json(&serde_json::json!({
            "total": report.total,
            "succeeded": report.succeeded,
            "needs_review": report.needs_review,
            "failed": report.failed,
            "cancelled": report.cancelled,
            "average_quality_score": report.average_quality_score,
            "escalate": report.escalate,
            "attention": attention,
        }))?;
    }
    Ok(())
}

fn summarize(index: usize, r: &ConversionResult) -> serde_json::Value {
    serde_json::json!({
        "index": index,
        "source": r.job.source_path,
        "status": r.final_status,
        "score": r.final_quality_score,
        "failure": r.failure.as_ref().map(|f| f.to_string()),
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn dump_effective_config(cfg: &Config) -> Result<()> {
    if !cfg.debug.dump_effective_config {
        return Ok(());
    }
    let dir = PathBuf::from(&cfg.execution.out_dir);
    ensure_dir(&dir)?;
    let raw = toml::to_string(cfg).unwrap_or_default();
    std::fs::write(dir.join("effective-config.toml"), raw)?;
    Ok(())
}

fn validate_input(cfg: &Config, input: &Path) -> Result<()> {
    let input_str = input.display().to_string();

    if cfg.security.reject_url_inputs && looks_like_url(&input_str) {
        return Err(anyhow!("URL inputs are disabled: {input_str}"));
    }

    if !input.exists() {
        return Err(anyhow!("input does not exist: {}", input.display()));
    }

    Ok(())
}
