//! Keeps the guest agent socket forwarded and consumes its event stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use crate::core::guest::{CONNECT_TIMEOUT, GuestConnector};
use crate::core::instance::remove_if_exists;
use crate::core::portfwd::PortForwarder;
use crate::core::transport::{Endpoint, Forward, ForwardVerb, Transport};
use crate::error::{Error, Result};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    /// The local socket was unreachable and a forward was requested.
    Forwarding,
    Connected,
    Disconnected { reason: String },
    Stopped,
}

/// What a single connection attempt did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reachable: bool,
    pub forward_attempted: bool,
    pub forward_ok: bool,
}

pub struct GuestWatcher {
    transport: Arc<dyn Transport>,
    connector: Arc<dyn GuestConnector>,
    forwarder: PortForwarder,
    local: PathBuf,
    remote: PathBuf,
    interval: Duration,
    probe_timeout: Duration,
    state: watch::Sender<WatcherState>,
    span: Span,
}

impl GuestWatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        connector: Arc<dyn GuestConnector>,
        forwarder: PortForwarder,
        local: PathBuf,
        remote: PathBuf,
        span: Span,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Starting);
        Self {
            transport,
            connector,
            forwarder,
            local,
            remote,
            interval: DEFAULT_WATCH_INTERVAL,
            probe_timeout: CONNECT_TIMEOUT,
            state,
            span,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bounds the reachability check, including the `info` round trip.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    fn forward(&self) -> Forward {
        Forward::local(
            Endpoint::Unix(self.local.clone()),
            Endpoint::Unix(self.remote.clone()),
        )
    }

    fn publish(&self, state: WatcherState) {
        self.state.send_replace(state);
    }

    /// Reconnects every interval until `cancel` fires, then removes the
    /// forward and the local socket.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.run_cycle(&cancel) => {
                    debug!(parent: &self.span, ?report, "guest agent cycle finished");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        self.stop().await;
    }

    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport {
            reachable: self.probe().await,
            ..CycleReport::default()
        };

        if !report.reachable {
            if let Err(err) = remove_if_exists(&self.local) {
                warn!(parent: &self.span, error = %err, "failed to remove stale guest agent socket");
            }
            self.publish(WatcherState::Forwarding);
            report.forward_attempted = true;
            match self.transport.forward(&self.forward(), ForwardVerb::Forward).await {
                Ok(()) => report.forward_ok = true,
                Err(err) => {
                    warn!(parent: &self.span, error = %err, "failed to forward the guest agent socket")
                }
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return report,
            outcome = self.process_events() => outcome,
        };
        if let Err(err) = outcome {
            info!(parent: &self.span, reason = %err, "guest agent disconnected");
            self.publish(WatcherState::Disconnected {
                reason: err.to_string(),
            });
        }
        report
    }

    async fn probe(&self) -> bool {
        let check = async {
            let mut session = self.connector.connect(&self.local).await?;
            session.info().await
        };
        match tokio::time::timeout(self.probe_timeout, check).await {
            Ok(result) => result.is_ok(),
            Err(_) => {
                debug!(parent: &self.span, "guest agent did not answer in time");
                false
            }
        }
    }

    /// Returns only when the stream breaks; a clean close is also an error.
    async fn process_events(&self) -> Result<()> {
        let mut session = self.connector.connect(&self.local).await?;
        let info = session.info().await?;
        debug!(parent: &self.span, ?info, "guest agent info");
        session.subscribe().await?;
        self.publish(WatcherState::Connected);

        while let Some(event) = session.next_event().await? {
            debug!(parent: &self.span, ?event, "guest agent event");
            for message in &event.errors {
                warn!(parent: &self.span, "guest agent: {message}");
            }
            self.forwarder.on_event(&event).await;
        }
        Err(Error::GuestAgent {
            message: "event stream closed".to_string(),
        })
    }

    async fn stop(&self) {
        debug!(parent: &self.span, "stopping the guest agent watcher");
        if let Err(err) = self.transport.forward(&self.forward(), ForwardVerb::Cancel).await {
            warn!(parent: &self.span, error = %err, "failed to cancel the guest agent forward");
        }
        if let Err(err) = remove_if_exists(&self.local) {
            warn!(parent: &self.span, error = %err, "failed to remove the guest agent socket");
        }
        self.publish(WatcherState::Stopped);
    }
}
