//! Messages exchanged with the guest agent over its forwarded unix socket.
//!
//! The channel carries newline-delimited JSON. The host writes a [`Request`]
//! and reads either a single [`Info`] or a stream of [`Event`]s until the
//! connection closes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Request {
    Info,
    Events,
}

/// A listening TCP socket inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    #[serde(default)]
    pub local_ports: Vec<IpPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_added: Vec<IpPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_removed: Vec<IpPort>,
    /// Errors the guest agent hit while collecting the event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}
