//! Control channel to the guest, implemented on top of the OpenSSH client.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{Span, debug};

use crate::config::SshConfig;
use crate::core::instance::Instance;
use crate::error::{Error, Result};

pub const SSH_HOST: &str = "127.0.0.1";

/// One side of a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { ip: IpAddr, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp {
                ip: IpAddr::V6(ip),
                port,
            } => write!(f, "[{ip}]:{port}"),
            Endpoint::Tcp {
                ip: IpAddr::V4(ip),
                port,
            } => write!(f, "{ip}:{port}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host listens, guest connects (`-L`).
    Local,
    /// Guest listens, host connects (`-R`).
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardVerb {
    Forward,
    Cancel,
}

impl ForwardVerb {
    fn as_str(self) -> &'static str {
        match self {
            ForwardVerb::Forward => "forward",
            ForwardVerb::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub direction: Direction,
}

impl Forward {
    pub fn local(local: Endpoint, remote: Endpoint) -> Self {
        Self {
            local,
            remote,
            direction: Direction::Local,
        }
    }
}

/// Operations the agent performs against the guest's SSH endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Drops stale host keys for the forwarded SSH port.
    async fn reset_known_hosts(&self) -> Result<()>;

    /// Adds or cancels a forward on the control master.
    async fn forward(&self, forward: &Forward, verb: ForwardVerb) -> Result<()>;

    async fn exit_master(&self) -> Result<()>;

    /// Runs `script` with bash inside the guest and returns its stdout.
    async fn run_script(&self, script: &str) -> Result<String>;

    /// A command that runs `args` in the guest over the control master.
    fn remote_command(&self, args: &[String]) -> Command;
}

pub struct SshTransport {
    ssh: PathBuf,
    keygen: PathBuf,
    args: Vec<String>,
    port: u16,
    span: Span,
}

impl SshTransport {
    pub fn new(instance: &Instance, config: &SshConfig, port: u16, span: Span) -> Self {
        Self {
            ssh: PathBuf::from("ssh"),
            keygen: PathBuf::from("ssh-keygen"),
            args: ssh_args(instance, config),
            port,
            span,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.ssh);
        command.args(&self.args).kill_on_drop(true);
        command
    }

    fn forward_args(&self, forward: &Forward, verb: ForwardVerb) -> Vec<String> {
        let flag = match forward.direction {
            Direction::Local => "-L",
            Direction::Reverse => "-R",
        };
        vec![
            "-T".to_string(),
            "-O".to_string(),
            verb.as_str().to_string(),
            flag.to_string(),
            format!("{}:{}", forward.local, forward.remote),
            "-N".to_string(),
            "-f".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            SSH_HOST.to_string(),
            "--".to_string(),
        ]
    }

    async fn run(&self, mut command: Command, stdin: Option<&str>) -> Result<Output> {
        let rendered = render(&command);
        debug!(parent: &self.span, command = %rendered, "running ssh");
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| Error::Transport {
            command: rendered.clone(),
            message: err.to_string(),
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|err| Error::Transport {
                    command: rendered.clone(),
                    message: err.to_string(),
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| Error::Transport {
                command: rendered.clone(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::Transport {
                command: rendered,
                message: failure_message(&output),
            })
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn reset_known_hosts(&self) -> Result<()> {
        for host in [SSH_HOST, "localhost"] {
            let mut command = Command::new(&self.keygen);
            command.arg("-R").arg(format!("[{host}]:{}", self.port));
            let rendered = render(&command);
            let output = command
                .output()
                .await
                .map_err(|err| Error::HostKeyReset {
                    command: rendered.clone(),
                    message: err.to_string(),
                })?;
            // ssh-keygen exits non-zero when there is no known_hosts file yet.
            if !output.status.success() && !missing_known_hosts(&output) {
                return Err(Error::HostKeyReset {
                    command: rendered,
                    message: failure_message(&output),
                });
            }
        }
        Ok(())
    }

    async fn forward(&self, forward: &Forward, verb: ForwardVerb) -> Result<()> {
        let mut command = self.command();
        command.args(self.forward_args(forward, verb));
        self.run(command, None).await.map(|_| ())
    }

    async fn exit_master(&self) -> Result<()> {
        let mut command = self.command();
        command
            .args(["-O", "exit", "-p"])
            .arg(self.port.to_string())
            .arg(SSH_HOST);
        self.run(command, None).await.map(|_| ())
    }

    async fn run_script(&self, script: &str) -> Result<String> {
        let mut command = self.command();
        command
            .arg("-p")
            .arg(self.port.to_string())
            .arg(SSH_HOST)
            .args(["--", "/bin/bash"]);
        let output = self.run(command, Some(script)).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn remote_command(&self, args: &[String]) -> Command {
        let mut command = self.command();
        command
            .arg("-p")
            .arg(self.port.to_string())
            .arg(SSH_HOST)
            .arg("--")
            .args(args);
        command
    }
}

/// Options shared by every ssh invocation for `instance`.
pub fn ssh_args(instance: &Instance, config: &SshConfig) -> Vec<String> {
    let mut args = Vec::new();
    for identity in identity_files(config) {
        args.push("-o".to_string());
        args.push(format!("IdentityFile=\"{}\"", identity.display()));
    }
    let user = config
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .filter(|user| !user.is_empty());
    if let Some(user) = user {
        args.push("-o".to_string());
        args.push(format!("User={user}"));
    }
    let options = [
        "StrictHostKeyChecking=no".to_string(),
        "NoHostAuthenticationForLocalhost=yes".to_string(),
        "GSSAPIAuthentication=no".to_string(),
        "PreferredAuthentications=publickey".to_string(),
        "Compression=no".to_string(),
        "BatchMode=yes".to_string(),
        "ControlMaster=auto".to_string(),
        format!(
            "ControlPath=\"{}\"",
            instance.ssh_control_socket().display()
        ),
        "ControlPersist=5m".to_string(),
    ];
    for option in options {
        args.push("-o".to_string());
        args.push(option);
    }
    args
}

fn identity_files(config: &SshConfig) -> Vec<PathBuf> {
    if let Some(identity) = &config.identity_file {
        return vec![identity.clone()];
    }
    let Some(home) = std::env::var_os("HOME") else {
        return Vec::new();
    };
    let ssh_dir = Path::new(&home).join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

fn missing_known_hosts(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr).contains("No such file or directory")
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    format!("{} ({detail:?})", output.status)
}

fn render(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory transport that records every call.
    #[derive(Default)]
    pub struct RecordingTransport {
        forwards: Mutex<Vec<(Forward, ForwardVerb)>>,
        scripts: Mutex<Vec<String>>,
        remaining_failures: Mutex<HashMap<String, usize>>,
        pub fail_forwards: AtomicBool,
        pub master_exits: AtomicUsize,
    }

    impl RecordingTransport {
        /// Makes `script` fail `times` times before it succeeds.
        pub fn fail_script(&self, script: &str, times: usize) {
            self.remaining_failures
                .lock()
                .unwrap()
                .insert(script.to_string(), times);
        }

        pub fn forwards(&self) -> Vec<(Forward, ForwardVerb)> {
            self.forwards.lock().unwrap().clone()
        }

        pub fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn reset_known_hosts(&self) -> Result<()> {
            Ok(())
        }

        async fn forward(&self, forward: &Forward, verb: ForwardVerb) -> Result<()> {
            self.forwards.lock().unwrap().push((forward.clone(), verb));
            if self.fail_forwards.load(Ordering::SeqCst) {
                return Err(Error::Transport {
                    command: "ssh -O forward".to_string(),
                    message: "control master unavailable".to_string(),
                });
            }
            Ok(())
        }

        async fn exit_master(&self) -> Result<()> {
            self.master_exits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_script(&self, script: &str) -> Result<String> {
            self.scripts.lock().unwrap().push(script.to_string());
            let mut failures = self.remaining_failures.lock().unwrap();
            match failures.get_mut(script) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(Error::Transport {
                        command: "ssh -- /bin/bash".to_string(),
                        message: "exit status: 1".to_string(),
                    })
                }
                _ => Ok(String::new()),
            }
        }

        fn remote_command(&self, args: &[String]) -> Command {
            let mut command = Command::new("true");
            command.args(args);
            command
        }
    }
}
