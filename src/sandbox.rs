//! Script execution sandbox
//!
//! The resolved script is written to a fresh temporary file and the
//! interpreter is pointed at that file. Script text is never spliced into a
//! command line. The file is owner-only on Unix. It is zeroed and removed on
//! every exit path, because it may contain credentials.
//!
//! The child runs with a null stdin and piped stdout/stderr, drained on
//! background threads so a chatty script cannot block on a full pipe. The
//! wait is bounded by a mandatory timeout and by the run's cancellation
//! token. Either one terminates the child's whole process group. Once the
//! script exits, output left in the pipes is read for a short grace period
//! only, so a daemon it started cannot hold the run open.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::TempPath;

use crate::error::{ProvisionError, Result};
use crate::platform::Interpreter;
#[cfg(unix)]
use crate::process_guard::CommandProcessGroup;
use crate::process_guard::{self, CancelToken};

/// Default upper bound on script run time.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a terminated script gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to keep reading output after the script itself has exited.
///
/// Background processes it started may hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// ScriptFile - RAII wrapper for the temporary script
// ============================================================================

/// Temporary file holding a resolved script.
///
/// Created with a unique name and, on Unix, mode 0600. On drop the content
/// is overwritten with zeros and the file is deleted, even when the run
/// fails or panics.
#[derive(Debug)]
pub struct ScriptFile {
    path: Option<TempPath>,
    size: usize,
}

impl ScriptFile {
    /// Write `contents` to a new temporary file ending in `extension`.
    pub fn create(contents: &str, extension: &str) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(".provision-")
            .suffix(extension)
            .rand_bytes(12)
            .tempfile()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;

        let path = file.into_temp_path();
        tracing::debug!("ScriptFile created: {:?} ({} bytes)", &*path, contents.len());

        Ok(Self {
            path: Some(path),
            size: contents.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn secure_wipe(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        if let Ok(mut file) = OpenOptions::new().write(true).open(&path) {
            let zeros = vec![0u8; self.size];
            let _ = file.write_all(&zeros);
            let _ = file.sync_all();
        }

        let wiped = PathBuf::from(&*path);
        if let Err(e) = path.close() {
            tracing::warn!(path = %wiped.display(), "Failed to remove script file: {}", e);
        } else {
            tracing::debug!(path = %wiped.display(), "ScriptFile securely wiped");
        }
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        self.secure_wipe();
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Output of a script that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    /// None if terminated by signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub elapsed_ms: u64,
}

/// Runs resolved scripts under one interpreter.
#[derive(Debug, Clone)]
pub struct Sandbox {
    interpreter: Interpreter,
    timeout: Duration,
    env: Vec<(String, String)>,
    cancel: CancelToken,
}

impl Sandbox {
    pub fn new(interpreter: Interpreter, timeout: Duration) -> Self {
        Self {
            interpreter,
            timeout,
            env: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Add an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run `script` and wait for it, the timeout, or cancellation.
    ///
    /// # Errors
    ///
    /// - `Filesystem` if the temporary script file cannot be written
    /// - `ScriptExecution` if the interpreter cannot start or the script
    ///   exits unsuccessfully
    /// - `ScriptTimeout` if the timeout elapses
    /// - `Cancelled` if the cancellation token fires
    pub fn run(&self, script: &str) -> Result<ScriptOutput> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        let file = ScriptFile::create(script, self.interpreter.kind().script_extension())
            .map_err(|e| {
                ProvisionError::filesystem(
                    std::env::temp_dir(),
                    format!("cannot write temporary script file: {}", e),
                )
            })?;

        let mut command = Command::new(self.interpreter.program());
        command
            .args(self.interpreter.args_for(file.path()))
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.in_new_process_group();

        tracing::info!(
            interpreter = %self.interpreter,
            timeout_secs = self.timeout.as_secs(),
            env = ?self.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            "Running script"
        );

        let mut child = command.spawn().map_err(|e| ProvisionError::ScriptExecution {
            exit_code: None,
            stdout: String::new(),
            stderr: format!("failed to start {}: {}", self.interpreter, e),
        })?;

        let (tx, rx) = mpsc::channel();
        spawn_reader(child.stdout.take(), Stream::Stdout, tx.clone());
        spawn_reader(child.stderr.take(), Stream::Stderr, tx);
        let mut captured = Captured::default();

        let start = Instant::now();
        let outcome = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Wait::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    process_guard::terminate(&mut child, TERMINATE_GRACE);
                    break Wait::Lost(e);
                }
            }
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancellation requested, terminating script");
                process_guard::terminate(&mut child, TERMINATE_GRACE);
                break Wait::Cancelled;
            }
            if start.elapsed() >= self.timeout {
                tracing::warn!("Script exceeded {}s, terminating", self.timeout.as_secs());
                process_guard::terminate(&mut child, TERMINATE_GRACE);
                break Wait::TimedOut;
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => captured.push(chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
            }
        };
        drop(file);

        let elapsed = start.elapsed();
        // A terminated group closes its pipes promptly. A clean exit only
        // gets what is left of the timeout, with a floor for the last writes.
        let grace = match outcome {
            Wait::Exited(_) => self
                .timeout
                .saturating_sub(elapsed)
                .clamp(POLL_INTERVAL * 5, OUTPUT_DRAIN_GRACE),
            _ => OUTPUT_DRAIN_GRACE,
        };
        if !captured.drain(&rx, Instant::now() + grace, &self.cancel) {
            tracing::warn!(
                "Script exited but background processes still hold its output; not waiting for them"
            );
        }
        let (stdout, stderr) = captured.into_strings();

        match outcome {
            Wait::Exited(status) if status.success() => {
                tracing::info!("Script executed successfully in {:?}", elapsed);
                Ok(ScriptOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    success: true,
                    elapsed_ms: elapsed.as_millis() as u64,
                })
            }
            Wait::Exited(status) => {
                tracing::info!("Script failed with exit code {:?}", status.code());
                Err(ProvisionError::ScriptExecution {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                })
            }
            Wait::Lost(e) => Err(ProvisionError::ScriptExecution {
                exit_code: None,
                stdout,
                stderr: format!("{}lost track of script process: {}", stderr, e),
            }),
            Wait::TimedOut => Err(ProvisionError::ScriptTimeout {
                timeout: self.timeout,
                stdout,
                stderr,
            }),
            Wait::Cancelled => Err(ProvisionError::Cancelled),
        }
    }
}

enum Wait {
    Exited(ExitStatus),
    Lost(io::Error),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type Chunk = (Stream, Vec<u8>);

/// Forward `pipe` to `tx` in chunks until EOF.
///
/// The thread is detached. If a background process keeps the pipe open it
/// lives until that process closes it.
fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream, tx: Sender<Chunk>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Captured {
    fn push(&mut self, (stream, bytes): Chunk) {
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(&bytes),
            Stream::Stderr => self.stderr.extend_from_slice(&bytes),
        }
    }

    /// Collect output until both pipes close, `deadline` passes, or the
    /// run is cancelled. Returns whether both pipes reached EOF.
    fn drain(&mut self, rx: &Receiver<Chunk>, deadline: Instant, cancel: &CancelToken) -> bool {
        loop {
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);
            match rx.recv_timeout(wait) {
                Ok(chunk) => self.push(chunk),
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline || cancel.is_cancelled() {
                        return false;
                    }
                }
            }
        }
    }

    fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}
