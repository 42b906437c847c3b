use crate::error::ProcessError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(target_os = "windows")]
const FFMPEG_NAME: &str = "ffmpeg.exe";
#[cfg(target_os = "windows")]
const FFPROBE_NAME: &str = "ffprobe.exe";
#[cfg(target_os = "windows")]
const GIFSICLE_NAME: &str = "gifsicle.exe";

#[cfg(not(target_os = "windows"))]
const FFMPEG_NAME: &str = "ffmpeg";
#[cfg(not(target_os = "windows"))]
const FFPROBE_NAME: &str = "ffprobe";
#[cfg(not(target_os = "windows"))]
const GIFSICLE_NAME: &str = "gifsicle";

// Keep the tail of stderr only; ffmpeg can log a lot on long clips.
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

/// Locations of the external encoders, resolved once at start-up and
/// handed to everything that spawns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutablePaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub gifsicle: PathBuf,
}

impl ExecutablePaths {
    /// `resource_dir` is the bundled-resources directory of a packaged app.
    pub fn resolve(resource_dir: Option<&Path>) -> Self {
        Self {
            ffmpeg: find_binary("GIFBATCH_FFMPEG", FFMPEG_NAME, resource_dir),
            ffprobe: find_binary("GIFBATCH_FFPROBE", FFPROBE_NAME, resource_dir),
            gifsicle: find_binary("GIFBATCH_GIFSICLE", GIFSICLE_NAME, resource_dir),
        }
    }

    /// Bare program names, left to the OS to look up.
    pub fn from_path() -> Self {
        Self {
            ffmpeg: PathBuf::from(FFMPEG_NAME),
            ffprobe: PathBuf::from(FFPROBE_NAME),
            gifsicle: PathBuf::from(GIFSICLE_NAME),
        }
    }

    /// Runs each tool's version query and returns the ones that could not
    /// be executed.
    pub async fn check<R: ProcessRunner>(&self, runner: &R) -> Vec<PathBuf> {
        let probes = [
            (&self.ffmpeg, "-version"),
            (&self.ffprobe, "-version"),
            (&self.gifsicle, "--version"),
        ];

        let mut missing = Vec::new();
        for (program, flag) in probes {
            let invocation = Invocation::new(program.clone(), [flag]);
            match runner.output(&invocation).await {
                Ok(output) if output.success() => {
                    debug!(program = %program.display(), "found encoder");
                }
                Ok(output) => {
                    warn!(program = %program.display(), code = ?output.code, "version check failed");
                    missing.push(program.clone());
                }
                Err(e) => {
                    warn!(program = %program.display(), error = %e, "version check failed");
                    missing.push(program.clone());
                }
            }
        }
        missing
    }
}

fn find_binary(env_var: &str, name: &str, resource_dir: Option<&Path>) -> PathBuf {
    // 1. Explicit override
    if let Some(path) = std::env::var_os(env_var) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    // 2. Development path: target/<profile>/../../ffmpeg/<name>
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(target_dir) = exe_path.parent() {
            let dev_path = target_dir.join("..").join("..").join("ffmpeg").join(name);
            if dev_path.exists() {
                return dev_path.canonicalize().unwrap_or(dev_path);
            }
        }
    }

    // 3. Bundled resources
    if let Some(resource_path) = resource_dir {
        let bundled = resource_path.join("ffmpeg").join(name);
        if bundled.exists() {
            return bundled;
        }
    }

    // 4. System PATH
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

/// One external program run: executable plus argument array. Never goes
/// through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// None when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs. The tokio implementation is used in the app;
/// tests script their own.
pub trait ProcessRunner: Send + Sync {
    /// Runs `invocation` to completion, calling `on_stderr_line` for every
    /// line of diagnostic output as it arrives (both `\n` and `\r` end a
    /// line). Cancelling `cancel` kills the child right away and yields
    /// `ProcessError::Cancelled`.
    fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
        on_stderr_line: &mut (dyn FnMut(&str) + Send),
    ) -> impl Future<Output = Result<ProcessOutput, ProcessError>> + Send;

    /// Short-lived, uncancellable run with output captured.
    fn output(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<ProcessOutput, ProcessError>> + Send {
        async move {
            let cancel = CancellationToken::new();
            self.run(invocation, &cancel, &mut |_line: &str| {}).await
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
        on_stderr_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ProcessOutput, ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        debug!(
            program = %invocation.program.display(),
            args = ?invocation.args,
            "spawning"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // stdout is drained on its own task so a chatty child can't block on a full pipe
        let stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stdout) = stdout {
                let mut bytes = Vec::new();
                if stdout.read_to_end(&mut bytes).await.is_ok() {
                    text = String::from_utf8_lossy(&bytes).into_owned();
                }
            }
            text
        });

        let stderr_text = match child.stderr.take() {
            Some(stderr) => {
                let pumped = tokio::select! {
                    text = pump_lines(stderr, on_stderr_line) => Some(text),
                    _ = cancel.cancelled() => None,
                };
                match pumped {
                    Some(text) => text,
                    None => {
                        kill(&mut child).await;
                        stdout_task.abort();
                        return Err(ProcessError::Cancelled);
                    }
                }
            }
            None => String::new(),
        };

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = status else {
            kill(&mut child).await;
            stdout_task.abort();
            return Err(ProcessError::Cancelled);
        };
        let status = status?;
        let stdout_text = stdout_task.await.unwrap_or_default();

        debug!(
            program = %invocation.program.display(),
            code = ?status.code(),
            "process exited"
        );

        Ok(ProcessOutput {
            code: status.code(),
            stdout: stdout_text,
            stderr: stderr_text,
        })
    }
}

async fn kill(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "could not kill child process");
    }
}

/// Reads `reader` to EOF, splitting on `\n` and `\r` (ffmpeg rewrites its
/// stats line with carriage returns). Returns the captured text, bounded
/// to the most recent `STDERR_CAPTURE_LIMIT` bytes.
pub(crate) async fn pump_lines<R>(mut reader: R, on_line: &mut (dyn FnMut(&str) + Send)) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    let mut flush = |pending: &mut Vec<u8>, captured: &mut String| {
        if pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        on_line(&line);
        captured.push_str(&line);
        captured.push('\n');
        if captured.len() > STDERR_CAPTURE_LIMIT {
            let mut cut = captured.len() - STDERR_CAPTURE_LIMIT;
            while !captured.is_char_boundary(cut) {
                cut += 1;
            }
            captured.drain(..cut);
        }
    };

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                flush(&mut pending, &mut captured);
            } else {
                pending.push(byte);
            }
        }
    }
    flush(&mut pending, &mut captured);

    captured
}
