//! The host agent: owns one hypervisor process from launch to shutdown.
//!
//! [`HostAgent::run`] spawns QEMU, reports `booting`, then runs the startup
//! routine in the background while it waits for an interrupt, cancellation or
//! the hypervisor's own exit. Collaborators default to the real SSH, QEMU and
//! guest agent implementations and can be swapped with the `with_*` builders.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hostagent_api::{Event, Status};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, info_span, warn};

use crate::config::VmConfig;
use crate::core::guest::{GuestConnector, UnixGuestConnector, remote_socket_path};
use crate::core::hypervisor::{HypervisorProcess, exit_result};
use crate::core::instance::Instance;
use crate::core::mounts::{MountProvisioner, ReverseSshfs, setup_mounts};
use crate::core::portfwd::PortForwarder;
use crate::core::qemu::{CommandBuilder, QemuCmdline};
use crate::core::reporter::Reporter;
use crate::core::requirements::{
    DEFAULT_RETRIES, DEFAULT_RETRY_INTERVAL, RequirementGate, RequirementKind,
    essential_requirements, optional_requirements,
};
use crate::core::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownProtocol};
use crate::core::teardown::{FnTeardown, TeardownStack};
use crate::core::transport::{SshTransport, Transport};
use crate::core::watcher::{DEFAULT_WATCH_INTERVAL, GuestWatcher};
use crate::error::{Error, Result};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// How long the guest gets to power off before it is killed.
    pub shutdown_timeout: Duration,
    pub watch_interval: Duration,
    pub requirement_retries: usize,
    pub requirement_interval: Duration,
    /// Upper bound on waiting for a background task to stop.
    pub join_timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            requirement_retries: DEFAULT_RETRIES,
            requirement_interval: DEFAULT_RETRY_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

pub struct HostAgent {
    instance: Instance,
    config: VmConfig,
    reporter: Arc<dyn Reporter>,
    interrupt: mpsc::Receiver<()>,
    transport: Option<Arc<dyn Transport>>,
    guest: Arc<dyn GuestConnector>,
    mounts: Option<Arc<dyn MountProvisioner>>,
    command_builder: Option<Arc<dyn CommandBuilder>>,
    options: AgentOptions,
    span: Span,
}

impl HostAgent {
    /// `interrupt` requests a graceful shutdown each time a value arrives.
    pub fn new(
        instance: Instance,
        config: VmConfig,
        reporter: Arc<dyn Reporter>,
        interrupt: mpsc::Receiver<()>,
    ) -> Self {
        let span = info_span!("hostagent", instance = %instance.name());
        Self {
            instance,
            config,
            reporter,
            interrupt,
            transport: None,
            guest: Arc::new(UnixGuestConnector),
            mounts: None,
            command_builder: None,
            options: AgentOptions::default(),
            span,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_guest_connector(mut self, guest: Arc<dyn GuestConnector>) -> Self {
        self.guest = guest;
        self
    }

    pub fn with_mounts(mut self, mounts: Arc<dyn MountProvisioner>) -> Self {
        self.mounts = Some(mounts);
        self
    }

    pub fn with_command_builder(mut self, builder: Arc<dyn CommandBuilder>) -> Self {
        self.command_builder = Some(builder);
        self
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Runs the instance until it stops. A terminal `aborted` event is
    /// emitted on every return path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let status = Arc::new(StatusEmitter::new(Arc::clone(&self.reporter)));
        let result = self.run_inner(&status, &cancel).await;
        if let Err(err) = &result {
            error!(parent: &self.span, error = %err, "host agent stopped with an error");
        }
        status.aborted();
        result
    }

    async fn run_inner(&mut self, status: &Arc<StatusEmitter>, cancel: &CancellationToken) -> Result<()> {
        let builder = match &self.command_builder {
            Some(builder) => Arc::clone(builder),
            None => Arc::new(QemuCmdline::new(self.span.clone())),
        };
        let command = builder.build(&self.instance, &self.config)?;

        let port = u16::try_from(self.config.ssh.local_port).map_err(|_| Error::InvalidSshPort {
            port: self.config.ssh.local_port,
        })?;

        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => Arc::new(SshTransport::new(
                &self.instance,
                &self.config.ssh,
                port,
                self.span.clone(),
            )),
        };
        transport.reset_known_hosts().await?;

        self.instance.clear_runtime_artifacts()?;
        info!(
            parent: &self.span,
            "Starting QEMU (hint: to watch the boot progress, see {})",
            self.instance.serial_log().display()
        );
        let (process, mut exit) = HypervisorProcess::spawn(&command, self.span.clone())?;
        status.booting(port);

        let mounts = match self.mounts.take() {
            Some(mounts) => mounts,
            None => Arc::new(ReverseSshfs::new(Arc::clone(&transport), self.span.clone())),
        };
        let startup_cancel = cancel.child_token();
        let routine = StartupRoutine {
            instance: self.instance.clone(),
            config: self.config.clone(),
            transport,
            guest: Arc::clone(&self.guest),
            mounts,
            status: Arc::clone(status),
            options: self.options.clone(),
            port,
            span: self.span.clone(),
        };
        let startup = tokio::spawn(routine.run(startup_cancel.clone()));

        let stop = tokio::select! {
            Some(()) = self.interrupt.recv() => Stop::Interrupted,
            _ = cancel.cancelled() => Stop::Cancelled,
            exit_status = exit.wait() => Stop::Exited(exit_status),
        };

        match stop {
            Stop::Exited(exit_status) => {
                info!(parent: &self.span, status = ?exit_status, "QEMU has exited");
                startup_cancel.cancel();
                if let Some(startup) = self.join("startup routine", startup).await {
                    if let Some(watcher) = startup.watcher {
                        self.join("guest agent watcher", watcher).await;
                    }
                    debug!(parent: &self.span, pending = startup.teardown.len(), "skipping teardown after hypervisor exit");
                }
                exit_result(exit_status)
            }
            Stop::Interrupted | Stop::Cancelled => {
                if matches!(stop, Stop::Interrupted) {
                    info!(parent: &self.span, "Received an interrupt, shutting down the VM");
                } else {
                    info!(parent: &self.span, "Cancelled, shutting down the VM");
                }
                startup_cancel.cancel();
                match self.join("startup routine", startup).await {
                    Some(startup) => {
                        if let Some(watcher) = startup.watcher {
                            self.join("guest agent watcher", watcher).await;
                        }
                        if let Err(errors) = startup.teardown.run_all(&self.span).await {
                            let err = Error::Multiple(errors);
                            warn!(parent: &self.span, error = %err, "teardown finished with errors");
                        }
                    }
                    None => warn!(parent: &self.span, "startup routine was lost, resources were not torn down"),
                }

                let report = ShutdownProtocol::new(&self.instance, self.span.clone())
                    .with_timeout(self.options.shutdown_timeout)
                    .run(&process, &mut exit)
                    .await;
                info!(parent: &self.span, outcome = %report.outcome, "shutdown complete");
                report.result
            }
        }
    }

    /// Waits for `handle` up to the join timeout, aborting it past that.
    async fn join<T>(&self, what: &str, handle: JoinHandle<T>) -> Option<T> {
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.options.join_timeout, handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                warn!(parent: &self.span, error = %err, "{what} failed");
                None
            }
            Err(_) => {
                warn!(parent: &self.span, timeout = ?self.options.join_timeout, "{what} did not stop in time");
                abort.abort();
                None
            }
        }
    }
}

enum Stop {
    Interrupted,
    Cancelled,
    Exited(std::io::Result<std::process::ExitStatus>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Idle,
    Booting,
    Running,
    Aborted,
}

/// Emits statuses in lifecycle order only: booting, running, aborted.
struct StatusEmitter {
    reporter: Arc<dyn Reporter>,
    phase: Mutex<Phase>,
}

impl StatusEmitter {
    fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            phase: Mutex::new(Phase::Idle),
        }
    }

    fn booting(&self, ssh_local_port: u16) {
        self.advance(Phase::Booting, Status::booting(ssh_local_port));
    }

    fn running(&self, ssh_local_port: u16, errors: Vec<String>) {
        self.advance(
            Phase::Running,
            Status {
                running: true,
                degraded: !errors.is_empty(),
                errors,
                ssh_local_port,
                ..Status::default()
            },
        );
    }

    fn aborted(&self) {
        self.advance(Phase::Aborted, Status::aborted());
    }

    /// Reports `status` unless a later phase was already reported.
    fn advance(&self, next: Phase, status: Status) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase >= next {
            return;
        }
        *phase = next;
        self.reporter.report(Event::new(status));
    }
}

/// What the startup routine hands back to the main loop.
struct Startup {
    teardown: TeardownStack,
    watcher: Option<JoinHandle<()>>,
}

struct StartupRoutine {
    instance: Instance,
    config: VmConfig,
    transport: Arc<dyn Transport>,
    guest: Arc<dyn GuestConnector>,
    mounts: Arc<dyn MountProvisioner>,
    status: Arc<StatusEmitter>,
    options: AgentOptions,
    port: u16,
    span: Span,
}

impl StartupRoutine {
    async fn run(self, cancel: CancellationToken) -> Startup {
        let mut startup = Startup {
            teardown: TeardownStack::new(),
            watcher: None,
        };
        let mut errors = Vec::new();

        let transport = Arc::clone(&self.transport);
        let span = self.span.clone();
        startup.teardown.register(Box::new(FnTeardown::new("exit ssh master", move || async move {
            if let Err(err) = transport.exit_master().await {
                warn!(parent: &span, error = %err, "failed to exit the SSH master");
            }
            Ok(())
        })));

        let gate = RequirementGate::new(Arc::clone(&self.transport), self.span.clone())
            .with_retries(self.options.requirement_retries, self.options.requirement_interval);

        let essential = gate
            .wait(RequirementKind::Essential, &essential_requirements(&self.config), &cancel)
            .await;
        if cancel.is_cancelled() {
            return startup;
        }
        if let Err(err) = essential {
            error!(parent: &self.span, error = %err, "essential requirements were not satisfied");
            errors.push(err.to_string());
        }

        let (mounted, mount_errors) =
            setup_mounts(&*self.mounts, &self.config.mounts, &self.span).await;
        for mount in mounted {
            startup.teardown.register(mount);
        }
        if let Err(err) = mount_errors.into_result() {
            errors.push(err.to_string());
        }
        if cancel.is_cancelled() {
            return startup;
        }

        let forwarder = PortForwarder::new(
            Arc::clone(&self.transport),
            self.port,
            self.config.port_forwards.clone(),
            self.span.clone(),
        );
        let watcher = GuestWatcher::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.guest),
            forwarder,
            self.instance.guest_agent_socket(),
            remote_socket_path(),
            self.span.clone(),
        )
        .with_interval(self.options.watch_interval);
        startup.watcher = Some(tokio::spawn(watcher.run(cancel.clone())));

        let optional = gate
            .wait(RequirementKind::Optional, &optional_requirements(&self.config), &cancel)
            .await;
        if cancel.is_cancelled() {
            return startup;
        }
        if let Err(err) = optional {
            warn!(parent: &self.span, error = %err, "optional requirements were not satisfied");
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            info!(parent: &self.span, "READY. Run `ssh -p {} 127.0.0.1` to open the shell", self.port);
        } else {
            warn!(parent: &self.span, errors = errors.len(), "instance is running in a degraded state");
        }
        self.status.running(self.port, errors);
        startup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Status>>);

    impl Reporter for Collect {
        fn report(&self, event: Event) {
            self.0.lock().unwrap().push(event.status);
        }
    }

    #[test]
    fn running_after_aborted_is_dropped() {
        let collect = Arc::new(Collect::default());
        let status = StatusEmitter::new(collect.clone());

        status.booting(60022);
        status.aborted();
        status.running(60022, Vec::new());
        status.aborted();

        let statuses = collect.0.lock().unwrap();
        assert_eq!(*statuses, vec![Status::booting(60022), Status::aborted()]);
    }

    #[test]
    fn stage_errors_mark_the_instance_degraded() {
        let collect = Arc::new(Collect::default());
        let status = StatusEmitter::new(collect.clone());

        status.booting(2222);
        status.running(2222, vec!["no sshfs".to_string()]);

        let statuses = collect.0.lock().unwrap();
        assert_eq!(
            statuses[1],
            Status {
                running: true,
                degraded: true,
                errors: vec!["no sshfs".to_string()],
                ssh_local_port: 2222,
                ..Status::default()
            }
        );
    }
}
