use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Configuration at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration at {path} is invalid:\n{message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("Instance `{name}` does not exist (looked in {dir}).")]
    InstanceNotFound { name: String, dir: PathBuf },
    #[error("Unable to locate the instance home directory: set HOSTAGENT_HOME or HOME.")]
    HomeUnavailable,
    #[error("Unsupported architecture `{arch}`.")]
    UnsupportedArch { arch: String },
    #[error("Unable to find `{name}` in PATH.")]
    ExecutableNotFound { name: String },
    #[error("Could not find firmware for {exe}{hint}")]
    FirmwareNotFound { exe: PathBuf, hint: &'static str },
    #[error("invalid ssh local port {port}")]
    InvalidSshPort { port: i64 },
    #[error("Failed to reset known host keys with `{command}`: {message}")]
    HostKeyReset { command: String, message: String },
    #[error("Failed to launch {program}: {source}")]
    LaunchFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run `{command}`: {message}")]
    Transport { command: String, message: String },
    #[error("guest agent: {message}")]
    GuestAgent { message: String },
    #[error("failed to satisfy the requirement {description:?}: {source}; hint: {hint}")]
    Requirement {
        description: String,
        hint: String,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to mount {location}: {message}")]
    Mount { location: PathBuf, message: String },
    #[error("QMP: {message}")]
    Qmp { message: String },
    #[error("hypervisor exited with {status}")]
    HypervisorExited { status: ExitStatus },
    #[error("Failed to wait for the hypervisor: {source}")]
    HypervisorWait {
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Multiple(ErrorList),
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::ReadConfig { .. } => ExitCode::from(74),
            Self::ParseConfig { .. } => ExitCode::from(65),
            Self::InvalidConfig { .. } => ExitCode::from(65),
            Self::InvalidSshPort { .. } => ExitCode::from(65),
            Self::InstanceNotFound { .. } => ExitCode::from(66),
            Self::HomeUnavailable => ExitCode::from(78),
            Self::UnsupportedArch { .. } => ExitCode::from(69),
            Self::ExecutableNotFound { .. } => ExitCode::from(69),
            Self::FirmwareNotFound { .. } => ExitCode::from(69),
            Self::HostKeyReset { .. } => ExitCode::from(76),
            Self::Transport { .. } => ExitCode::from(76),
            Self::GuestAgent { .. } => ExitCode::from(76),
            Self::Requirement { .. } => ExitCode::from(75),
            Self::Mount { .. } => ExitCode::from(75),
            Self::Qmp { .. } => ExitCode::from(76),
            Self::LaunchFailed { .. } => ExitCode::from(71),
            Self::HypervisorExited { status } => status
                .code()
                .and_then(|code| u8::try_from(code).ok())
                .filter(|code| *code != 0)
                .map(ExitCode::from)
                .unwrap_or(ExitCode::from(70)),
            Self::HypervisorWait { .. } => ExitCode::from(71),
            Self::Io { .. } => ExitCode::from(74),
            Self::Cancelled => ExitCode::from(130),
            Self::Multiple(_) => ExitCode::from(70),
        }
    }
}

/// Ordered collection of failures. Lists combine by concatenation; nothing is
/// deduplicated.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `error`. A nested list is flattened into this one.
    pub fn push(&mut self, error: Error) {
        match error {
            Error::Multiple(list) => self.0.extend(list.0),
            other => self.0.push(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    /// `Ok(())` when empty, the lone error when there is exactly one, and
    /// [`Error::Multiple`] otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl From<Vec<Error>> for ErrorList {
    fn from(errors: Vec<Error>) -> Self {
        let mut list = Self::new();
        for error in errors {
            list.push(error);
        }
        list
    }
}

impl IntoIterator for ErrorList {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no errors"),
            [single] => write!(f, "{single}"),
            errors => {
                write!(f, "{} errors occurred:", errors.len())?;
                for error in errors {
                    write!(f, "\n\t* {error}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn guest(message: &str) -> Error {
        Error::GuestAgent {
            message: message.to_string(),
        }
    }

    #[test]
    fn nested_lists_are_concatenated_in_order() {
        let mut inner = ErrorList::new();
        inner.push(guest("b"));
        inner.push(guest("c"));

        let mut outer = ErrorList::new();
        outer.push(guest("a"));
        outer.push(Error::Multiple(inner));
        outer.push(guest("a"));

        let messages: Vec<String> = outer.iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            vec![
                "guest agent: a",
                "guest agent: b",
                "guest agent: c",
                "guest agent: a"
            ]
        );
    }

    #[test]
    fn display_lists_every_error() {
        let list = ErrorList::from(vec![guest("first"), guest("second")]);
        assert_eq!(
            list.to_string(),
            "2 errors occurred:\n\t* guest agent: first\n\t* guest agent: second"
        );
    }

    #[test]
    fn single_error_is_returned_unwrapped() {
        let err = ErrorList::from(vec![Error::Cancelled]).into_result().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn exit_codes_follow_sysexits_and_hypervisor_status() {
        let err = Error::InvalidSshPort { port: -1 };
        assert_eq!(err.exit_code(), ExitCode::from(65));

        let err = Error::HypervisorExited {
            status: ExitStatus::from_raw(3 << 8),
        };
        assert_eq!(err.exit_code(), ExitCode::from(3));

        let err = Error::HypervisorExited {
            status: ExitStatus::from_raw(libc::SIGKILL),
        };
        assert_eq!(err.exit_code(), ExitCode::from(70));
    }
}
