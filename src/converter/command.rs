use super::{ConvertOutput, ConvertRequest, Converter};
use crate::{config::ConverterDef, error::ConvertError};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs an external program. Arguments are templates:
/// `{input}`, `{output}`, `{out_dir}`, `{target}`, `{stem}`, and `{opt:KEY}` or
/// `{opt:KEY=default}` for job options. An argument whose option is absent and
/// has no default is dropped.
///
/// Tools that cannot be told where to write may leave `<out_dir>/<stem>.<ext>`
/// instead; that file is moved to the requested output path.
pub struct CommandConverter {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandConverter {
    pub fn new(name: &str, def: &ConverterDef) -> Self {
        Self {
            name: name.to_string(),
            program: expand_tilde(&def.program),
            args: def.args.clone(),
            env: def.env.clone(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Resolves the program to an executable, searching `PATH` when it is a bare name.
    pub fn locate(&self) -> Option<PathBuf> {
        which::which(&self.program).ok()
    }

    fn render_args(&self, req: &ConvertRequest<'_>) -> Vec<String> {
        let stem = req
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let mut out = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let mut rendered = arg
                .replace("{input}", &req.source.display().to_string())
                .replace("{output}", &req.output.display().to_string())
                .replace("{out_dir}", &req.out_dir.display().to_string())
                .replace("{target}", req.target_format.as_str())
                .replace("{stem}", &stem);
            match render_options(&rendered, req.options) {
                Some(r) => rendered = r,
                None => continue,
            }
            out.push(rendered);
        }
        out
    }
}

/// Substitutes `{opt:KEY}` placeholders; `None` when a required option is missing.
fn render_options(arg: &str, options: &BTreeMap<String, String>) -> Option<String> {
    let mut s = arg.to_string();
    while let Some(start) = s.find("{opt:") {
        let end = start + s[start..].find('}')?;
        let spec = &s[start + 5..end];
        let (key, default) = match spec.split_once('=') {
            Some((k, d)) => (k, Some(d)),
            None => (spec, None),
        };
        let value = options.get(key).map(String::as_str).or(default)?.to_string();
        s.replace_range(start..=end, &value);
    }
    Some(s)
}

impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn convert(&self, req: &ConvertRequest<'_>) -> Result<ConvertOutput, ConvertError> {
        let args = self.render_args(req);
        debug!(
            "exec {} {:?} timeout={:?}",
            self.program.display(),
            args,
            req.timeout
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        // Lead a process group so a timeout takes down whatever the tool spawned.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ConvertError::Unavailable(format!("{} not found", self.program.display()))
            }
            std::io::ErrorKind::PermissionDenied => ConvertError::Unavailable(format!(
                "{} is not executable",
                self.program.display()
            )),
            _ => ConvertError::Failed(format!("spawning {}: {e}", self.program.display())),
        })?;

        let result = match wait_with_timeout(&mut child, req.timeout) {
            Ok(Some(out)) if out.status.success() => {
                if adopt_tool_named_output(req) {
                    Ok(ConvertOutput {
                        path: req.output.clone(),
                        warnings: warnings_from_stderr(&out.stderr),
                    })
                } else {
                    Err(ConvertError::Failed(format!(
                        "{} exited successfully but wrote no output at {}",
                        self.name,
                        req.output.display()
                    )))
                }
            }
            Ok(Some(out)) => Err(ConvertError::Failed(format!(
                "{} exited with {}: {}",
                self.name,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Ok(None) => Err(ConvertError::Timeout),
            Err(e) => Err(ConvertError::Failed(format!("{}: {e}", self.name))),
        };

        if result.is_err() && req.output.exists() {
            if let Err(e) = std::fs::remove_file(&req.output) {
                warn!("failed to remove partial output {}: {e}", req.output.display());
            }
        }
        result
    }
}

/// Some tools pick their own file name (`<out_dir>/<stem>.<ext>`); move it to the
/// requested output path. Returns whether the requested output now exists.
fn adopt_tool_named_output(req: &ConvertRequest<'_>) -> bool {
    if req.output.exists() {
        return true;
    }
    let Some(stem) = req.source.file_stem() else {
        return false;
    };
    let produced = req
        .out_dir
        .join(format!("{}.{}", stem.to_string_lossy(), req.target_format.extension()));
    if !produced.is_file() || produced == req.source {
        return false;
    }
    match std::fs::rename(&produced, &req.output) {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to move {} to {}: {e}", produced.display(), req.output.display());
            false
        }
    }
}

fn warnings_from_stderr(stderr: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|l| l.to_ascii_lowercase().contains("warn"))
        .map(str::to_string)
        .collect()
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

struct ProcessOutput {
    status: ExitStatus,
    stderr: Vec<u8>,
}

/// How long to keep draining pipes after the tool is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Waits for the child, killing its process group once `timeout` elapses.
/// `Ok(None)` means it was killed.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ProcessOutput>> {
    // Drain pipes while waiting so a chatty tool can't block on a full buffer.
    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    let start = Instant::now();
    let status = loop {
        let polled = match child.try_wait() {
            Ok(polled) => polled,
            Err(e) => {
                kill_process_group(child);
                return Err(e);
            }
        };
        if let Some(status) = polled {
            break status;
        }
        if timeout.is_some_and(|t| start.elapsed() > t) {
            warn!("converter process timed out after {:?}", timeout);
            kill_process_group(child);
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    // A tool that daemonized a helper may leave the pipes open past its own exit.
    let deadline = Instant::now() + READER_GRACE;
    let _ = stdout_rx.recv_deadline(deadline);
    let stderr = stderr_rx.recv_deadline(deadline).unwrap_or_default();
    Ok(Some(ProcessOutput { status, stderr }))
}

/// Reads a pipe to the end on a helper thread; the bytes arrive on the channel.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> crossbeam_channel::Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) with a negative pid only signals the child's process group.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}
