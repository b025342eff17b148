//! Wire types shared between the host agent and the processes that observe it.
//!
//! The host agent writes one [`Event`] per line to its stdout. The guest agent
//! types under [`guest`] describe the control channel that is forwarded from the
//! VM to the host.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod guest;

/// Snapshot of the instance lifecycle as reported to the observer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "is_false")]
    pub running: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub aborted: bool,
    /// Stage failures in the order they were observed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ssh_local_port: u16,
}

impl Status {
    /// Status reported while the hypervisor is booting.
    pub fn booting(ssh_local_port: u16) -> Self {
        Self {
            ssh_local_port,
            ..Self::default()
        }
    }

    /// Terminal status. No further events follow it.
    pub fn aborted() -> Self {
        Self {
            aborted: true,
            ..Self::default()
        }
    }
}

/// One line of the event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Emission time. Filled in by the reporter when left unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub time: Option<OffsetDateTime>,
    #[serde(default)]
    pub status: Status,
}

impl Event {
    pub fn new(status: Status) -> Self {
        Self { time: None, status }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn booting_status_only_carries_the_port() {
        let line = serde_json::to_string(&Event::new(Status::booting(60022))).unwrap();
        assert_eq!(line, r#"{"status":{"sshLocalPort":60022}}"#);
    }

    #[test]
    fn degraded_status_lists_errors_in_order() {
        let event = Event {
            time: Some(datetime!(2024-05-01 12:00:00 UTC)),
            status: Status {
                running: true,
                degraded: true,
                errors: vec!["first".into(), "second".into()],
                ssh_local_port: 60022,
                ..Status::default()
            },
        };
        let line = serde_json::to_string(&event).unwrap();
        assert_eq!(
            line,
            r#"{"time":"2024-05-01T12:00:00Z","status":{"running":true,"degraded":true,"errors":["first","second"],"sshLocalPort":60022}}"#
        );
    }

    #[test]
    fn aborted_event_parses_without_optional_fields() {
        let event: Event = serde_json::from_str(r#"{"status":{"aborted":true}}"#).unwrap();
        assert_eq!(event.status, Status::aborted());
        assert!(event.time.is_none());
    }
}
