//! The hypervisor child process.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::pid_t;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, Span, debug, info, warn};

use crate::error::{Error, Result};

/// Executable and arguments produced by a command builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

type KillRequest = oneshot::Sender<io::Result<()>>;

/// Handle used to signal the running hypervisor.
///
/// The child itself lives in the waiter task, so a kill can never reach a
/// pid that has already been reaped.
#[derive(Debug)]
pub struct HypervisorProcess {
    pid: pid_t,
    kill_tx: mpsc::Sender<KillRequest>,
    kills: AtomicUsize,
    span: Span,
}

/// Resolves once the hypervisor has exited and been reaped.
#[derive(Debug)]
pub struct ExitWatch {
    rx: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl HypervisorProcess {
    /// Starts `command`. Its stdout and stderr are logged line by line at
    /// debug level until the pipes close.
    pub fn spawn(command: &HypervisorCommand, span: Span) -> Result<(Self, ExitWatch)> {
        debug!(parent: &span, program = %command.program.display(), args = ?command.args, "spawning hypervisor");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::LaunchFailed {
                program: command.program.clone(),
                source,
            })?;

        let pid = child
            .id()
            .and_then(|id| pid_t::try_from(id).ok())
            .ok_or_else(|| Error::LaunchFailed {
                program: command.program.clone(),
                source: io::Error::other("process exited before its pid was read"),
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(stdout, "qemu[stdout]").instrument(span.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(stderr, "qemu[stderr]").instrument(span.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = mpsc::channel::<KillRequest>(1);
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(reply) = kill_rx.recv() => {
                        let _ = reply.send(child.start_kill());
                    }
                }
            };
            let _ = tx.send(status);
        });

        let process = Self {
            pid,
            kill_tx,
            kills: AtomicUsize::new(0),
            span,
        };
        Ok((process, ExitWatch { rx }))
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// Sends SIGKILL unless the process has already been reaped.
    pub async fn kill(&self) -> io::Result<()> {
        info!(parent: &self.span, pid = self.pid, "killing hypervisor");
        self.kills.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.kill_tx.send(reply_tx).await.is_err() {
            return Err(already_exited());
        }
        reply_rx.await.unwrap_or_else(|_| Err(already_exited()))
    }

    /// Number of kill requests made through this handle.
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::Relaxed)
    }
}

impl ExitWatch {
    /// Waits for exit. Must not be polled again once it has returned.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        match (&mut self.rx).await {
            Ok(status) => status,
            Err(_) => Err(io::Error::other("hypervisor waiter task stopped")),
        }
    }
}

/// Maps a wait result to the agent's return value.
pub fn exit_result(status: io::Result<ExitStatus>) -> Result<()> {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::HypervisorExited { status }),
        Err(source) => Err(Error::HypervisorWait { source }),
    }
}

fn already_exited() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "hypervisor has already exited")
}

/// Logs output until EOF. The pipe stays open on bad bytes or read errors,
/// otherwise the hypervisor would die of SIGPIPE on its next write.
async fn log_lines<R: AsyncRead + Unpin>(reader: R, header: &'static str) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                debug!("{header}: {}", line.trim_end());
            }
            Err(err) => {
                warn!(error = %err, "{header}: read failed, discarding further output");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                return;
            }
        }
    }
}
