//! One external compiler child process and its framed protocol.
//!
//! A worker is idle (no pid, no streams) or running (pid plus buffered
//! streams on its stdin and stdout, with a drain thread forwarding its stderr
//! to the log). It moves between the two states only through [`start`] and
//! [`stop`]; no intermediate state is observable from outside.
//!
//! [`start`]: ExternCompiler::start
//! [`stop`]: ExternCompiler::stop

use std::io::{BufRead, BufReader, BufWriter};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::config::{CompilerOptions, ConfigBuilder, ConfigRegistry};
use crate::error::{CompilerError, Result};
use crate::launcher::{ChildPipes, Launcher};
use crate::md5::Md5;
use crate::pipe::{Pipe, PipeFd, PIPE_BUFFER_SIZE};
use crate::signals::analyze_wait_status;

/// How long the stop path waits for a terminated worker before letting the
/// OS reap it.
const STOP_WAIT_BUDGET: Duration = Duration::from_secs(2);

type Input = FrameWriter<BufWriter<PipeFd>>;
type Output = FrameReader<BufReader<PipeFd>>;

/// Handle to one long-lived compiler subprocess.
pub struct ExternCompiler {
    pid: Option<Pid>,
    input: Option<Input>,
    output: Option<Output>,
    version: String,
    compilations: u64,
    options: Arc<CompilerOptions>,
    registry: Arc<dyn ConfigRegistry>,
    launcher: Arc<Launcher>,
}

impl ExternCompiler {
    /// Create an idle worker; the child is spawned lazily on first use.
    pub fn new(
        options: Arc<CompilerOptions>,
        registry: Arc<dyn ConfigRegistry>,
        launcher: Arc<Launcher>,
    ) -> Self {
        Self {
            pid: None,
            input: None,
            output: None,
            version: String::new(),
            compilations: 0,
            options,
            registry,
            launcher,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Pid of the running child, if any.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The worker's version string, starting the child if needed.
    pub fn version(&mut self) -> Result<String> {
        if !self.is_running() {
            self.start()?;
        }
        Ok(self.version.clone())
    }

    /// Compile one source file, returning the raw artifact bytes.
    ///
    /// A `Transport` error means the worker has stopped itself and the caller
    /// may retry on the (lazily restarted) worker; a `Compile` error means
    /// the worker is healthy and the source was rejected.
    pub fn compile(&mut self, filename: &str, md5: &Md5, code: &[u8]) -> Result<Vec<u8>> {
        if self.options.reset_threshold > 0 && self.compilations > self.options.reset_threshold {
            self.stop();
        }

        let result = self.compile_once(filename, md5, code);
        if let Err(CompilerError::Transport(message)) = &result {
            self.stop();
            if self.options.verbose_errors {
                error!("ExternCompiler Error: {message}");
            }
        }
        result
    }

    fn compile_once(&mut self, filename: &str, md5: &Md5, code: &[u8]) -> Result<Vec<u8>> {
        if !self.is_running() {
            self.start()?;
        }
        self.compilations += 1;
        self.write_program(filename, md5, code)?;
        self.read_program()
    }

    /// Spawn the child and run the startup protocol: version line from the
    /// child, one reserved newline back, then the two config frames.
    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let stdin = Self::open_pipe()?;
        let stdout = Self::open_pipe()?;
        let stderr = Self::open_pipe()?;

        let spawned = {
            let delegate = self.launcher.delegate();
            delegate.proc_open(
                &self.options.command,
                ChildPipes {
                    stdin: stdin.read,
                    stdout: stdout.write,
                    stderr: stderr.write,
                },
                None,
                &[],
            )
        };
        let pid = match spawned {
            Ok(pid) => pid,
            Err(e) => {
                let message = format!(
                    "unable to start external compiler with command: {} ({e})",
                    self.options.command
                );
                error!("{message}");
                return Err(CompilerError::BadCompiler(message));
            }
        };

        self.pid = Some(pid);
        self.input = Some(FrameWriter::new(BufWriter::with_capacity(
            PIPE_BUFFER_SIZE,
            PipeFd::new(stdin.write),
        )));
        self.output = Some(FrameReader::new(BufReader::with_capacity(
            PIPE_BUFFER_SIZE,
            PipeFd::new(stdout.read),
        )));
        spawn_stderr_drain(pid, PipeFd::new(stderr.read));

        // The very first thing the child says is one JSON line carrying its
        // version string.
        match self.read_version() {
            Ok(version) => self.version = version,
            Err(e) => {
                self.stop();
                return Err(CompilerError::BadCompiler(format!(
                    "couldn't read version message from external compiler: {e}"
                )));
            }
        }

        // The child swallows the first byte it reads from stdin; reserve that
        // byte so frame boundaries line up.
        if let Err(e) = self.input()?.write_raw(b"\n") {
            self.stop();
            return Err(CompilerError::BadCompiler(format!(
                "couldn't write initial newline: {e}"
            )));
        }

        self.write_configs()
    }

    /// Stop the child: SIGTERM, bounded wait, close streams, reset counters.
    ///
    /// Wait failures are logged and otherwise ignored; the OS reaps the child
    /// eventually. The stderr drain exits on its own once the child's stderr
    /// reaches EOF.
    pub fn stop(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };

        self.compilations = 0;

        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            warn!(pid = pid.as_raw(), "ExternCompiler: kill failed: {e}");
        }

        let waited = {
            let delegate = self.launcher.delegate();
            delegate.waitpid(pid, STOP_WAIT_BUDGET)
        };
        match waited {
            Ok(status) => {
                let reason = analyze_wait_status(status);
                if !reason.is_clean() {
                    warn!(pid = pid.as_raw(), "ExternCompiler: {reason}");
                }
            }
            Err(e) => {
                warn!(
                    pid = pid.as_raw(),
                    "ExternCompiler: unable to wait for compiler process: {e}"
                );
            }
        }

        self.input = None;
        self.output = None;
        self.pid = None;
    }

    /// Forget the child without signaling it.
    ///
    /// Called in forked children, where the inherited pid belongs to a
    /// process the pre-fork parent still owns.
    pub fn detach_from_process(&mut self) {
        self.pid = None;
    }

    fn open_pipe() -> Result<Pipe> {
        Pipe::new().map_err(|e| CompilerError::Transport(format!("unable to open pipe: {e}")))
    }

    fn input(&mut self) -> Result<&mut Input> {
        self.input
            .as_mut()
            .ok_or_else(|| CompilerError::Transport("compiler stdin is not open".into()))
    }

    fn output(&mut self) -> Result<&mut Output> {
        self.output
            .as_mut()
            .ok_or_else(|| CompilerError::Transport("compiler stdout is not open".into()))
    }

    fn read_version(&mut self) -> Result<String> {
        let line = self.output()?.read_line()?;
        let header: Value = serde_json::from_str(&line)
            .map_err(|e| CompilerError::Transport(format!("malformed version message: {e}")))?;
        match header.get("version").and_then(Value::as_str) {
            Some(version) => Ok(version.to_string()),
            None => Err(CompilerError::Transport(
                "version message carries no version field".into(),
            )),
        }
    }

    /// Push the two config frames. The payloads are rebuilt from the registry
    /// on every start, so a recycled worker sees current host settings.
    fn write_configs(&mut self) -> Result<()> {
        let bound = if self.options.inherit_config {
            self.registry.globals_as_json()
        } else {
            String::new()
        };
        let misc = if self.options.inherit_config {
            ConfigBuilder::new()
                .add_field("hhvm.include_roots", self.registry.include_roots())
                .into_string()
        } else {
            String::new()
        };

        let mut header = json!({ "type": "config" });
        self.input()?.write_message(&mut header, bound.as_bytes())?;
        self.input()?.write_message(&mut header, misc.as_bytes())?;
        Ok(())
    }

    fn write_program(&mut self, filename: &str, md5: &Md5, code: &[u8]) -> Result<()> {
        let mut header = json!({
            "type": "code",
            "md5": md5.to_string(),
            "file": filename,
            "is_systemlib": crate::unit::in_systemlib_phase(),
        });
        self.input()?.write_message(&mut header, code)
    }

    fn read_program(&mut self) -> Result<Vec<u8>> {
        let line = self.output()?.read_line()?;
        let header: Value = serde_json::from_str(&line)
            .map_err(|e| CompilerError::Compile(format!("malformed compiler response: {e}")))?;
        let bytes = header.get("bytes").and_then(Value::as_u64).unwrap_or(0) as usize;

        match header.get("type").and_then(Value::as_str).unwrap_or("") {
            "hhas" => self.output()?.read_bytes(bytes),
            // The pipe is still good; the compiler just couldn't build this
            // file.
            "error" => Err(CompilerError::Compile(
                header
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("[no 'error' field]")
                    .to_string(),
            )),
            unknown => Err(CompilerError::Compile(format!(
                "unknown message type, {unknown}"
            ))),
        }
    }
}

impl Drop for ExternCompiler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward the child's stderr to the log, one line at a time.
///
/// The thread is detached; it exits when the child's stderr reaches EOF,
/// which happens when the child dies. Forked children never see it, since
/// fork copies no threads.
fn spawn_stderr_drain(pid: Pid, stderr: PipeFd) {
    std::thread::Builder::new()
        .name(format!("hackc-stderr-{}", pid.as_raw()))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = line.trim_end();
                        if !text.is_empty() {
                            error!("[external compiler {}]: {text}", pid.as_raw());
                        }
                    }
                    Err(e) => {
                        debug!(
                            "ceasing to log stderr from external compiler ({}): {e}",
                            pid.as_raw()
                        );
                        break;
                    }
                }
            }
        })
        .ok(); // Stderr forwarding is best-effort
}
