//! Startup preconditions checked inside the guest.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Span, info, warn};

use crate::config::VmConfig;
use crate::core::guest::GUEST_AGENT_SOCKET_NAME;
use crate::core::transport::Transport;
use crate::error::{Error, ErrorList, Result};

pub const DEFAULT_RETRIES: usize = 60;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Essential,
    Optional,
}

impl fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementKind::Essential => f.write_str("essential"),
            RequirementKind::Optional => f.write_str("optional"),
        }
    }
}

/// A shell script that exits zero once the condition holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub description: String,
    pub script: String,
    pub debug_hint: String,
}

impl Requirement {
    fn new(description: &str, script: &str, debug_hint: &str) -> Self {
        Self {
            description: description.to_string(),
            script: script.to_string(),
            debug_hint: debug_hint.to_string(),
        }
    }
}

pub fn essential_requirements(config: &VmConfig) -> Vec<Requirement> {
    let mut requirements = vec![Requirement::new(
        "ssh",
        "#!/bin/bash\ntrue\n",
        "Failed to SSH into the guest. Make sure that the `ssh.local_port` setting is not used by \
         other processes on the host. If any private key under ~/.ssh is protected with a \
         passphrase, you need to have ssh-agent running.",
    )];
    if !config.mounts.is_empty() {
        requirements.push(Requirement::new(
            "sshfs binary to be installed",
            "#!/bin/bash\nset -eux -o pipefail\nif ! timeout 30s bash -c \"until command -v sshfs; do sleep 3; done\"; then\n\techo >&2 \"sshfs is not installed yet\"\n\texit 1\nfi\n",
            "The sshfs binary was not installed in the guest. Make sure that you are using an \
             officially supported image. Also see \"/var/log/cloud-init-output.log\" in the guest.",
        ));
        requirements.push(Requirement::new(
            "/etc/fuse.conf to contain \"user_allow_other\"",
            "#!/bin/bash\nset -eux -o pipefail\nif ! timeout 30s bash -c \"until grep -q ^user_allow_other /etc/fuse.conf; do sleep 3; done\"; then\n\techo >&2 \"/etc/fuse.conf is not updated to contain \\\"user_allow_other\\\"\"\n\texit 1\nfi\n",
            "Append \"user_allow_other\" to /etc/fuse.conf in the guest.",
        ));
    }
    let guest_agent_script = format!(
        "#!/bin/bash\nset -eux -o pipefail\nsock=\"/run/user/$(id -u)/{GUEST_AGENT_SOCKET_NAME}\"\nif ! timeout 30s bash -c \"until [ -S \\\"${{sock}}\\\" ]; do sleep 3; done\"; then\n\techo >&2 \"guest agent is not running\"\n\texit 1\nfi\n"
    );
    requirements.push(Requirement::new(
        "the guest agent to be running",
        &guest_agent_script,
        "The guest agent seems not running. Check the cloud-init output in the guest.",
    ));
    requirements
}

/// User-declared probes. Their failure only degrades the instance.
pub fn optional_requirements(config: &VmConfig) -> Vec<Requirement> {
    config
        .probes
        .iter()
        .map(|probe| Requirement {
            description: probe.description.clone(),
            script: probe.script.clone(),
            debug_hint: probe.hint.clone(),
        })
        .collect()
}

pub struct RequirementGate {
    transport: Arc<dyn Transport>,
    retries: usize,
    interval: Duration,
    span: Span,
}

impl RequirementGate {
    pub fn new(transport: Arc<dyn Transport>, span: Span) -> Self {
        Self {
            transport,
            retries: DEFAULT_RETRIES,
            interval: DEFAULT_RETRY_INTERVAL,
            span,
        }
    }

    pub fn with_retries(mut self, retries: usize, interval: Duration) -> Self {
        self.retries = retries.max(1);
        self.interval = interval;
        self
    }

    /// Waits for every requirement in turn. All failures are collected.
    pub async fn wait(
        &self,
        kind: RequirementKind,
        requirements: &[Requirement],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut errors = ErrorList::new();
        let total = requirements.len();
        for (idx, requirement) in requirements.iter().enumerate() {
            info!(
                parent: &self.span,
                "Waiting for the {kind} requirement {} of {total}: {:?}",
                idx + 1,
                requirement.description
            );
            match self.wait_for(requirement, cancel).await {
                Ok(()) => info!(
                    parent: &self.span,
                    "The {kind} requirement {} of {total} is satisfied",
                    idx + 1
                ),
                Err(Error::Cancelled) => {
                    errors.push(Error::Cancelled);
                    break;
                }
                Err(err) => {
                    warn!(parent: &self.span, error = %err, "{kind} requirement failed");
                    errors.push(err);
                }
            }
        }
        errors.into_result()
    }

    async fn wait_for(&self, requirement: &Requirement, cancel: &CancellationToken) -> Result<()> {
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = self.transport.run_script(&requirement.script) => outcome,
            };
            let err = match outcome {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };
            attempt += 1;
            if attempt >= self.retries {
                return Err(Error::Requirement {
                    description: requirement.description.clone(),
                    hint: requirement.debug_hint.clone(),
                    source: Box::new(err),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::testing::RecordingTransport;

    fn requirement(description: &str) -> Requirement {
        Requirement::new(description, description, "check the guest")
    }

    fn gate(transport: &Arc<RecordingTransport>, retries: usize) -> RequirementGate {
        RequirementGate::new(transport.clone(), Span::none())
            .with_retries(retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_script("ssh", 2);

        gate(&transport, 3)
            .wait(
                RequirementKind::Essential,
                &[requirement("ssh")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(transport.scripts().len(), 3);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_script("a", usize::MAX);
        transport.fail_script("c", usize::MAX);

        let err = gate(&transport, 2)
            .wait(
                RequirementKind::Optional,
                &[requirement("a"), requirement("b"), requirement("c")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let Error::Multiple(list) = err else {
            panic!("expected aggregated errors");
        };
        let descriptions: Vec<String> = list
            .iter()
            .map(|err| match err {
                Error::Requirement { description, .. } => description.clone(),
                other => panic!("unexpected error: {other:?}"),
            })
            .collect();
        assert_eq!(descriptions, vec!["a", "c"]);
        assert_eq!(transport.scripts(), vec!["a", "a", "b", "c", "c"]);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_script("ssh", usize::MAX);
        let cancel = CancellationToken::new();
        let gate = RequirementGate::new(transport.clone(), Span::none())
            .with_retries(1000, Duration::from_secs(60));

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.wait(RequirementKind::Essential, &[requirement("ssh")], &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn mount_requirements_are_added_only_with_mounts() {
        let mut config = crate::config::test_config();
        let names: Vec<_> = essential_requirements(&config)
            .into_iter()
            .map(|r| r.description)
            .collect();
        assert_eq!(names, vec!["ssh", "the guest agent to be running"]);

        config.mounts.push(crate::config::MountConfig {
            location: "/tmp".into(),
            writable: false,
        });
        assert_eq!(essential_requirements(&config).len(), 4);
    }

    #[test]
    fn guest_agent_check_waits_for_the_forwarded_socket() {
        let config = crate::config::test_config();
        let requirement = essential_requirements(&config).pop().unwrap();
        assert_eq!(requirement.description, "the guest agent to be running");
        assert!(requirement.script.contains(&format!("$(id -u)/{GUEST_AGENT_SOCKET_NAME}\"")));
        assert!(requirement.script.contains("[ -S \\\"${sock}\\\" ]"));
    }
}
