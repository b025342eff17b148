//! Minimal QMP client used to ask the guest to power off.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::Error;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum QmpError {
    /// Nothing is listening on the socket.
    Unavailable,
    Io(io::Error),
    Protocol(String),
}

impl std::fmt::Display for QmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QmpError::Unavailable => write!(f, "socket unavailable"),
            QmpError::Io(err) => write!(f, "{err}"),
            QmpError::Protocol(reason) => write!(f, "{reason}"),
        }
    }
}

impl From<QmpError> for Error {
    fn from(err: QmpError) -> Self {
        Error::Qmp {
            message: err.to_string(),
        }
    }
}

pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connects and completes capability negotiation.
    pub async fn connect(socket: &Path, timeout: Duration) -> Result<Self, QmpError> {
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(socket)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(map_connect_error(err)),
            Err(_) => {
                return Err(QmpError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out connecting to {}", socket.display()),
                )));
            }
        };
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::Protocol(format!(
                "Unexpected QMP greeting from {}",
                socket.display()
            )));
        }
        client.execute("qmp_capabilities").await?;
        Ok(client)
    }

    pub async fn system_powerdown(&mut self) -> Result<(), QmpError> {
        self.execute("system_powerdown").await
    }

    async fn execute(&mut self, command: &str) -> Result<(), QmpError> {
        let mut data = serde_json::to_vec(&json!({ "execute": command }))
            .map_err(|err| QmpError::Protocol(err.to_string()))?;
        data.push(b'\n');
        self.writer.write_all(&data).await.map_err(QmpError::Io)?;
        self.wait_for_ok().await
    }

    async fn read_message(&mut self) -> Result<Value, QmpError> {
        let mut line = String::new();
        let bytes = tokio::time::timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| QmpError::Protocol("QMP reply timed out.".to_string()))?
            .map_err(QmpError::Io)?;
        if bytes == 0 {
            return Err(QmpError::Protocol(
                "QMP connection closed unexpectedly.".to_string(),
            ));
        }
        serde_json::from_str(&line).map_err(|err| QmpError::Protocol(err.to_string()))
    }

    async fn wait_for_ok(&mut self) -> Result<(), QmpError> {
        loop {
            let message = self.read_message().await?;
            if message.get("return").is_some() {
                return Ok(());
            }
            if let Some(err) = message.get("error") {
                return Err(QmpError::Protocol(format!("QMP error response: {err}")));
            }
            // Asynchronous events are skipped.
        }
    }
}

fn map_connect_error(err: io::Error) -> QmpError {
    match err.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied => QmpError::Unavailable,
        _ => QmpError::Io(err),
    }
}
