//! Running external tools with a leash on how much they can do.

use crate::errors::{ProcessExecution, ProcessFailure};
use failure::{Error, ResultExt};
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const REDACTED: &str = "XXXXXXXXXX";

/// A command to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
    redacted: Vec<usize>,
    dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl Invocation {
    pub fn new<S: Into<String>>(program: S) -> Invocation {
        Invocation {
            program: program.into(),
            args: Vec::new(),
            redacted: Vec::new(),
            dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Invocation {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// An argument which must never show up in logs or error messages.
    pub fn secret_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Invocation {
        self.redacted.push(self.args.len());
        self.arg(arg)
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Invocation {
        self.dir = Some(dir.into());
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Invocation
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Invocation
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.as_path())
    }

    /// The command as it would be typed in a shell, with secrets blanked
    /// out.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();

        for (i, arg) in self.args.iter().enumerate() {
            line.push(' ');
            if self.redacted.contains(&i) {
                line.push_str(REDACTED);
            } else {
                line.push_str(&arg.to_string_lossy());
            }
        }

        line
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|&(ref k, ref v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = self.dir {
            cmd.current_dir(dir);
        }

        cmd
    }
}

/// What a finished command left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Something which can run external tools.
pub trait ProcessRunner: Send + Sync {
    /// Run the command to completion, regardless of its exit status.
    fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, Error>;

    /// Run the command, treating a non-zero exit status as an error.
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, Error> {
        let output = self.execute(invocation)?;

        if output.status.success() {
            Ok(output)
        } else {
            debug!(
                "stderr for failed command {:?}: {:?}",
                invocation.command_line(),
                output.stderr
            );

            Err(ProcessExecution {
                command: invocation.command_line(),
                failure: ProcessFailure::Exited {
                    code: output.status.code(),
                    stderr: output.stderr,
                },
            }
            .into())
        }
    }
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for Arc<R> {
    fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, Error> {
        (**self).execute(invocation)
    }
}

/// Runs commands, killing them if they produce too much output or take too
/// long.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Watcher {
    pub max_bytes: Option<u64>,
    pub max_seconds: Option<u64>,
}

impl Watcher {
    pub fn new(max_bytes: Option<u64>, max_seconds: Option<u64>) -> Watcher {
        Watcher {
            max_bytes,
            max_seconds,
        }
    }

    fn exceeded(&self, started: Instant, bytes: u64) -> Option<ProcessFailure> {
        if let Some(limit) = self.max_bytes {
            if bytes > limit {
                return Some(ProcessFailure::TooManyBytes { limit });
            }
        }

        if let Some(limit) = self.max_seconds {
            if started.elapsed() > Duration::from_secs(limit) {
                return Some(ProcessFailure::TimedOut { limit });
            }
        }

        None
    }

    fn wait(&self, child: &mut Child, bytes: &AtomicU64) -> Result<Result<ExitStatus, ProcessFailure>, Error> {
        let started = Instant::now();

        loop {
            if let Some(status) = child.try_wait().context("Unable to wait for the child process")? {
                return Ok(Ok(status));
            }

            if let Some(failure) = self.exceeded(started, bytes.load(Ordering::SeqCst)) {
                return Ok(Err(failure));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ProcessRunner for Watcher {
    fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, Error> {
        trace!(
            "Running command: {:?} in {:?}",
            invocation.command_line(),
            invocation.working_dir()
        );

        let mut child = invocation
            .to_command()
            .spawn()
            .with_context(|_| format!("Unable to run {:?}", invocation.program()))?;

        let bytes = Arc::new(AtomicU64::new(0));
        let cap = self.max_bytes.unwrap_or(u64::max_value());
        let stdout = drain(child.stdout.take(), Arc::clone(&bytes), cap);
        let stderr = drain(child.stderr.take(), Arc::clone(&bytes), cap);

        let status = match self.wait(&mut child, &bytes)? {
            Ok(status) => status,
            Err(failure) => {
                warn!("Killing {:?}: {:?}", invocation.command_line(), failure);
                let _ = child.kill();
                let _ = child.wait();

                // Grandchildren may still be holding the pipes open, so the
                // readers are left to finish on their own.
                return Err(ProcessExecution {
                    command: invocation.command_line(),
                    failure,
                }
                .into());
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        trace!("Exit Status: {}", status);

        if let Some(limit) = self.max_bytes {
            if bytes.load(Ordering::SeqCst) > limit {
                return Err(ProcessExecution {
                    command: invocation.command_line(),
                    failure: ProcessFailure::TooManyBytes { limit },
                }
                .into());
            }
        }

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        })
    }
}

/// Read everything from a pipe on a background thread, counting every byte
/// but only keeping up to `cap` of them.
fn drain<R>(source: Option<R>, counter: Arc<AtomicU64>, cap: u64) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let mut source = match source {
            Some(s) => s,
            None => return buffer,
        };
        let mut chunk = [0; 8 * 1024];

        loop {
            match source.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    counter.fetch_add(n as u64, Ordering::SeqCst);
                    if (buffer.len() as u64) < cap {
                        buffer.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }

        buffer
    })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    let raw = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&raw).into_owned()
}
