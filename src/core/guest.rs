//! Client side of the guest agent channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hostagent_api::guest::{Event, Info, Request};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Error, Result};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// File name of the guest agent socket under the guest's `/run/user/<uid>`.
pub const GUEST_AGENT_SOCKET_NAME: &str = "hostagent-guestagent.sock";

/// Path of the guest agent socket inside the guest. The guest user shares the
/// host user's uid.
pub fn remote_socket_path() -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/run/user/{uid}/{GUEST_AGENT_SOCKET_NAME}"))
}

#[async_trait]
pub trait GuestConnector: Send + Sync {
    async fn connect(&self, socket: &Path) -> Result<Box<dyn GuestSession>>;
}

#[async_trait]
pub trait GuestSession: Send {
    async fn info(&mut self) -> Result<Info>;

    /// Switches the session to event streaming.
    async fn subscribe(&mut self) -> Result<()>;

    /// Next event, or `None` once the guest closes the stream.
    async fn next_event(&mut self) -> Result<Option<Event>>;
}

/// Speaks newline-delimited JSON over a unix socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixGuestConnector;

#[async_trait]
impl GuestConnector for UnixGuestConnector {
    async fn connect(&self, socket: &Path) -> Result<Box<dyn GuestSession>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket))
            .await
            .map_err(|_| guest_error(format!("timed out connecting to {}", socket.display())))?
            .map_err(|err| guest_error(format!("failed to connect to {}: {err}", socket.display())))?;
        let (reader, writer) = stream.into_split();
        Ok(Box::new(UnixGuestSession {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }))
    }
}

struct UnixGuestSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl UnixGuestSession {
    async fn send(&mut self, request: Request) -> Result<()> {
        let mut payload = serde_json::to_vec(&request)
            .map_err(|err| guest_error(format!("failed to encode request: {err}")))?;
        payload.push(b'\n');
        self.writer
            .write_all(&payload)
            .await
            .map_err(|err| guest_error(format!("failed to send request: {err}")))
    }

    async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .await
                .map_err(|err| guest_error(format!("failed to read from guest agent: {err}")))?;
            if read == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&self.line)
                .map(Some)
                .map_err(|err| guest_error(format!("malformed message from guest agent: {err}")));
        }
    }
}

#[async_trait]
impl GuestSession for UnixGuestSession {
    async fn info(&mut self) -> Result<Info> {
        self.send(Request::Info).await?;
        self.read()
            .await?
            .ok_or_else(|| guest_error("connection closed before info response"))
    }

    async fn subscribe(&mut self) -> Result<()> {
        self.send(Request::Events).await
    }

    async fn next_event(&mut self) -> Result<Option<Event>> {
        self.read().await
    }
}

fn guest_error(message: impl Into<String>) -> Error {
    Error::GuestAgent {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn info_and_events_round_trip_over_the_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("ga.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"method":"info"}"#);
            writer
                .write_all(b"{\"localPorts\":[{\"ip\":\"127.0.0.1\",\"port\":22}]}\n")
                .await
                .unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"method":"events"}"#);
            writer
                .write_all(b"{\"localPortsAdded\":[{\"ip\":\"0.0.0.0\",\"port\":8080}]}\n\n")
                .await
                .unwrap();
        });

        let mut session = UnixGuestConnector.connect(&socket).await.unwrap();
        let info = session.info().await.unwrap();
        assert_eq!(info.local_ports[0].port, 22);

        session.subscribe().await.unwrap();
        let event = session.next_event().await.unwrap().unwrap();
        assert_eq!(event.local_ports_added[0].port, 8080);

        server.await.unwrap();
        assert!(session.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connecting_to_a_missing_socket_fails() {
        let dir = tempdir().unwrap();
        let result = UnixGuestConnector.connect(&dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(Error::GuestAgent { .. })));
    }

    #[test]
    fn remote_socket_lives_under_the_user_runtime_dir() {
        let path = remote_socket_path();
        assert!(path.starts_with("/run/user"));
        assert!(path.ends_with(GUEST_AGENT_SOCKET_NAME));
    }
}
