//! Cooperative power-down with escalation to SIGKILL.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tracing::{Span, debug, info, warn};

use crate::core::hypervisor::{ExitWatch, HypervisorProcess, exit_result};
use crate::core::instance::{Instance, remove_if_exists};
use crate::core::qmp::QmpClient;
use crate::error::Result;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub const QMP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    Forced,
}

impl ShutdownOutcome {
    pub fn describe(self) -> &'static str {
        match self {
            ShutdownOutcome::Graceful => "graceful",
            ShutdownOutcome::Forced => "forced",
        }
    }
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug)]
pub enum ShutdownState {
    Cooperative,
    WaitExit,
    Forced,
    Exited(io::Result<ExitStatus>),
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    /// The hypervisor's own exit result.
    pub result: Result<()>,
}

pub struct ShutdownProtocol {
    qmp_socket: PathBuf,
    pid_file: PathBuf,
    timeout: Duration,
    connect_timeout: Duration,
    span: Span,
}

impl ShutdownProtocol {
    pub fn new(instance: &Instance, span: Span) -> Self {
        Self {
            qmp_socket: instance.qmp_socket(),
            pid_file: instance.pid_file(),
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connect_timeout: QMP_CONNECT_TIMEOUT,
            span,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Drives the state machine until the process has exited.
    pub async fn run(&self, process: &HypervisorProcess, exit: &mut ExitWatch) -> ShutdownReport {
        let mut outcome = ShutdownOutcome::Graceful;
        let mut state = ShutdownState::Cooperative;
        loop {
            debug!(parent: &self.span, state = ?state, "shutdown step");
            state = match state {
                ShutdownState::Cooperative => self.cooperative().await,
                ShutdownState::WaitExit => self.wait_exit(exit).await,
                ShutdownState::Forced => {
                    outcome = ShutdownOutcome::Forced;
                    self.force(process, exit).await
                }
                ShutdownState::Exited(status) => {
                    info!(parent: &self.span, outcome = %outcome, "hypervisor stopped");
                    return ShutdownReport {
                        outcome,
                        result: exit_result(status),
                    };
                }
            };
        }
    }

    async fn cooperative(&self) -> ShutdownState {
        info!(parent: &self.span, "Shutting down the VM");
        let sent = match QmpClient::connect(&self.qmp_socket, self.connect_timeout).await {
            Ok(mut client) => client.system_powerdown().await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => ShutdownState::WaitExit,
            Err(err) => {
                warn!(parent: &self.span, error = %err, socket = %self.qmp_socket.display(), "failed to send system_powerdown");
                ShutdownState::Forced
            }
        }
    }

    async fn wait_exit(&self, exit: &mut ExitWatch) -> ShutdownState {
        info!(parent: &self.span, timeout = ?self.timeout, "Waiting for the guest to power off");
        match tokio::time::timeout(self.timeout, exit.wait()).await {
            Ok(status) => ShutdownState::Exited(status),
            Err(_) => {
                warn!(parent: &self.span, timeout = ?self.timeout, "guest did not power off in time");
                ShutdownState::Forced
            }
        }
    }

    async fn force(&self, process: &HypervisorProcess, exit: &mut ExitWatch) -> ShutdownState {
        if let Err(err) = process.kill().await {
            warn!(parent: &self.span, pid = process.pid(), error = %err, "failed to kill hypervisor");
        }
        let status = exit.wait().await;
        if let Err(err) = remove_if_exists(&self.pid_file) {
            warn!(parent: &self.span, path = %self.pid_file.display(), error = %err, "failed to remove pid file");
        }
        ShutdownState::Exited(status)
    }
}
