use super::{style_arguments, Corruptor, FuzzStyle, MutatorArgs, MAX_BUFFER_SIZE};
use crate::error::MutatorError;
use crate::logger::{self, BreadcrumbFlags};
use crossbeam_channel::RecvTimeoutError;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const REAP_POLL: Duration = Duration::from_millis(5);

/// Corruptor backed by an external executable: full input on stdin,
/// output read from stdout up to `MAX_BUFFER_SIZE` bytes.
///
/// Every invocation is bounded by `timeout`. The child is killed and
/// reaped on every exit path, spawn failures included.
#[derive(Clone, Debug)]
pub struct ExternalMutator {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalMutator {
    pub fn new(program: impl Into<PathBuf>, style: FuzzStyle, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: style_arguments(style),
            timeout,
        }
    }

    /// Explicit argument list, capped like the style-derived one.
    pub fn with_args<I, S>(program: impl Into<PathBuf>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut capped = MutatorArgs::default();
        for arg in args {
            capped.push(arg);
        }
        Self {
            program: program.into(),
            args: capped.into_inner(),
            timeout,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Corruptor for ExternalMutator {
    fn corrupt(&self, input: &[u8]) -> Result<Vec<u8>, MutatorError> {
        let deadline = Instant::now() + self.timeout;
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(MutatorError::Spawn)?;
        let mut guard = ChildGuard { child: Some(child) };

        let stdin = guard
            .child_mut()
            .and_then(|child| child.stdin.take())
            .ok_or_else(|| MutatorError::Pipe(missing_pipe("stdin")))?;
        let stdout = guard
            .child_mut()
            .and_then(|child| child.stdout.take())
            .ok_or_else(|| MutatorError::Pipe(missing_pipe("stdout")))?;

        // Writing and reading happen on their own threads so a mutator
        // that emits output before draining stdin cannot deadlock us.
        let payload = input.to_vec();
        let writer = thread::Builder::new()
            .name("mutator-stdin".into())
            .spawn(move || {
                let mut stdin = stdin;
                stdin.write_all(&payload)
                // stdin drops here, closing the pipe
            })
            .map_err(MutatorError::Pipe)?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::Builder::new()
            .name("mutator-stdout".into())
            .spawn(move || {
                let mut output = Vec::new();
                let result = stdout
                    .take(MAX_BUFFER_SIZE as u64)
                    .read_to_end(&mut output)
                    .map(|_| output);
                let _ = tx.send(result);
            })
            .map_err(MutatorError::Pipe)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let output = match rx.recv_timeout(remaining) {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => return Err(MutatorError::Pipe(error)),
            Err(RecvTimeoutError::Timeout) => return Err(MutatorError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(MutatorError::Pipe(missing_pipe("stdout reader")))
            }
        };

        if output.len() >= MAX_BUFFER_SIZE {
            // Still writing past the cap; nothing more will be read.
            guard.kill();
        }
        guard.reap(deadline)?;

        match writer.join() {
            Ok(Err(error)) if error.kind() != io::ErrorKind::BrokenPipe => {
                logger::breadcrumb(
                    BreadcrumbFlags::MUTATOR,
                    format!("mutator stdin write failed: {error}"),
                );
            }
            _ => {}
        }

        if output.is_empty() {
            return Err(MutatorError::Empty);
        }
        Ok(output)
    }
}

fn missing_pipe(which: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("{which} unavailable"))
}

/// Owns the mutator child until it has been reaped.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }

    /// Waits for the child until `deadline`, then kills it.
    fn reap(&mut self, deadline: Instant) -> Result<(), MutatorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    return child.wait().map(|_| ()).map_err(MutatorError::Wait);
                }
                Ok(None) => thread::sleep(REAP_POLL),
                Err(error) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(MutatorError::Wait(error));
                }
            }
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
