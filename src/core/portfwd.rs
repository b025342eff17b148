//! Mirrors guest listening ports onto the host.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use hostagent_api::guest::{Event, IpPort};
use tracing::{Span, info, warn};

use crate::config::PortForwardRule;
use crate::core::transport::{Endpoint, Forward, ForwardVerb, Transport};

/// Lowest guest port forwarded when no rule matches.
pub const UNPRIVILEGED_PORT_START: u16 = 1024;
const GUEST_SSH_PORT: u16 = 22;

pub struct PortForwarder {
    transport: Arc<dyn Transport>,
    ssh_local_port: u16,
    rules: Vec<PortForwardRule>,
    span: Span,
}

impl PortForwarder {
    pub fn new(
        transport: Arc<dyn Transport>,
        ssh_local_port: u16,
        rules: Vec<PortForwardRule>,
        span: Span,
    ) -> Self {
        Self {
            transport,
            ssh_local_port,
            rules,
            span,
        }
    }

    /// Applies the port changes carried by `event`. Failures are logged.
    pub async fn on_event(&self, event: &Event) {
        for guest in &event.local_ports_removed {
            let Some(forward) = self.forward_for(guest) else {
                continue;
            };
            info!(parent: &self.span, guest = %forward.remote, host = %forward.local, "Stopping forwarding TCP");
            if let Err(err) = self.transport.forward(&forward, ForwardVerb::Cancel).await {
                warn!(parent: &self.span, error = %err, guest = %forward.remote, "failed to stop forwarding TCP port");
            }
        }
        for guest in &event.local_ports_added {
            let Some(forward) = self.forward_for(guest) else {
                continue;
            };
            info!(parent: &self.span, guest = %forward.remote, host = %forward.local, "Forwarding TCP");
            if let Err(err) = self.transport.forward(&forward, ForwardVerb::Forward).await {
                warn!(parent: &self.span, error = %err, guest = %forward.remote, "failed to set up forwarding TCP port");
            }
        }
    }

    /// Host forward for a guest listener, or `None` when it must not be
    /// exposed.
    pub fn forward_for(&self, guest: &IpPort) -> Option<Forward> {
        if guest.port == GUEST_SSH_PORT || !(guest.ip.is_loopback() || guest.ip.is_unspecified()) {
            return None;
        }

        let (host_ip, host_port) = match self
            .rules
            .iter()
            .find(|rule| in_range(guest.port, rule.guest_port_range))
        {
            Some(rule) if rule.ignore => return None,
            Some(rule) => (
                rule.host_ip,
                rule.host_port_range.0 + (guest.port - rule.guest_port_range.0),
            ),
            None if guest.port >= UNPRIVILEGED_PORT_START => {
                (IpAddr::V4(Ipv4Addr::LOCALHOST), guest.port)
            }
            None => return None,
        };
        if host_port == self.ssh_local_port {
            return None;
        }

        let guest_ip = if guest.ip.is_unspecified() {
            match guest.ip {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            }
        } else {
            guest.ip
        };

        Some(Forward::local(
            Endpoint::Tcp {
                ip: host_ip,
                port: host_port,
            },
            Endpoint::Tcp {
                ip: guest_ip,
                port: guest.port,
            },
        ))
    }
}

fn in_range(port: u16, (lo, hi): (u16, u16)) -> bool {
    lo <= port && port <= hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::testing::RecordingTransport;

    fn ip_port(ip: &str, port: u16) -> IpPort {
        IpPort {
            ip: ip.parse().unwrap(),
            port,
        }
    }

    fn forwarder(rules: Vec<PortForwardRule>) -> (PortForwarder, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let forwarder = PortForwarder::new(transport.clone(), 60022, rules, Span::none());
        (forwarder, transport)
    }

    #[test]
    fn default_policy_forwards_unprivileged_loopback_ports() {
        let (forwarder, _) = forwarder(Vec::new());

        let forward = forwarder.forward_for(&ip_port("0.0.0.0", 8080)).unwrap();
        assert_eq!(forward.local.to_string(), "127.0.0.1:8080");
        assert_eq!(forward.remote.to_string(), "127.0.0.1:8080");

        assert!(forwarder.forward_for(&ip_port("0.0.0.0", 80)).is_none());
        assert!(forwarder.forward_for(&ip_port("0.0.0.0", 22)).is_none());
        assert!(forwarder.forward_for(&ip_port("192.168.5.15", 8080)).is_none());
        assert!(forwarder.forward_for(&ip_port("0.0.0.0", 60022)).is_none());
    }

    #[test]
    fn rules_remap_and_ignore_ports() {
        let (forwarder, _) = forwarder(vec![
            PortForwardRule {
                guest_port_range: (5432, 5432),
                host_port_range: (5432, 5432),
                host_ip: "127.0.0.1".parse().unwrap(),
                ignore: true,
            },
            PortForwardRule {
                guest_port_range: (80, 89),
                host_port_range: (8080, 8089),
                host_ip: "0.0.0.0".parse().unwrap(),
                ignore: false,
            },
        ]);

        assert!(forwarder.forward_for(&ip_port("127.0.0.1", 5432)).is_none());
        let forward = forwarder.forward_for(&ip_port("::", 83)).unwrap();
        assert_eq!(forward.local.to_string(), "0.0.0.0:8083");
        assert_eq!(forward.remote.to_string(), "[::1]:83");
    }

    #[tokio::test]
    async fn events_cancel_removed_ports_before_adding_new_ones() {
        let (forwarder, transport) = forwarder(Vec::new());
        let event = Event {
            local_ports_added: vec![ip_port("0.0.0.0", 3000), ip_port("0.0.0.0", 53)],
            local_ports_removed: vec![ip_port("127.0.0.1", 8080)],
            ..Event::default()
        };

        forwarder.on_event(&event).await;

        let calls = transport.forwards();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, ForwardVerb::Cancel);
        assert_eq!(calls[0].0.remote.to_string(), "127.0.0.1:8080");
        assert_eq!(calls[1].1, ForwardVerb::Forward);
        assert_eq!(calls[1].0.remote.to_string(), "127.0.0.1:3000");
    }
}
