//! Host directories shared into the guest with reverse sshfs.
//!
//! A local `sftp-server` is wired to a remote `sshfs -o slave` session: the
//! guest mounts the directory at the same path, and every file operation
//! travels back over the SSH control master.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{Span, debug, info, warn};

use crate::config::MountConfig;
use crate::core::host::find_executable;
use crate::core::teardown::Teardown;
use crate::core::transport::Transport;
use crate::error::{Error, ErrorList, Result};

const SFTP_SERVER_CANDIDATES: &[&str] = &[
    "/usr/libexec/sftp-server",
    "/usr/lib/openssh/sftp-server",
    "/usr/lib/ssh/sftp-server",
    "/usr/libexec/openssh/sftp-server",
];

#[async_trait]
pub trait MountProvisioner: Send + Sync {
    /// Mounts one host directory and returns the action that undoes it.
    async fn mount(&self, mount: &MountConfig) -> Result<Box<dyn Teardown>>;
}

/// Mounts every entry, keeping going past failures.
pub async fn setup_mounts(
    provisioner: &dyn MountProvisioner,
    mounts: &[MountConfig],
    span: &Span,
) -> (Vec<Box<dyn Teardown>>, ErrorList) {
    let mut mounted = Vec::with_capacity(mounts.len());
    let mut errors = ErrorList::new();
    for mount in mounts {
        info!(parent: span, location = %mount.location.display(), writable = mount.writable, "Mounting");
        match provisioner.mount(mount).await {
            Ok(teardown) => mounted.push(teardown),
            Err(err) => {
                warn!(parent: span, location = %mount.location.display(), error = %err, "failed to mount");
                errors.push(err);
            }
        }
    }
    (mounted, errors)
}

pub struct ReverseSshfs {
    transport: Arc<dyn Transport>,
    sftp_server: Option<PathBuf>,
    span: Span,
}

impl ReverseSshfs {
    pub fn new(transport: Arc<dyn Transport>, span: Span) -> Self {
        Self {
            transport,
            sftp_server: find_executable(SFTP_SERVER_CANDIDATES),
            span,
        }
    }

    pub fn with_sftp_server(mut self, path: impl Into<PathBuf>) -> Self {
        self.sftp_server = Some(path.into());
        self
    }
}

#[async_trait]
impl MountProvisioner for ReverseSshfs {
    async fn mount(&self, mount: &MountConfig) -> Result<Box<dyn Teardown>> {
        let location = mount.location.clone();
        let mount_error = |message: String| Error::Mount {
            location: location.clone(),
            message,
        };
        let sftp_server = self
            .sftp_server
            .clone()
            .ok_or_else(|| mount_error("sftp-server not found on the host".to_string()))?;

        let quoted = shell_quote(&location);
        self.transport
            .run_script(&format!(
                "#!/bin/bash\nset -eu\nmkdir -p {quoted} 2>/dev/null || sudo mkdir -p {quoted}\n"
            ))
            .await
            .map_err(|err| mount_error(format!("failed to create the mount point: {err}")))?;

        let mut sftp = Command::new(&sftp_server);
        if !mount.writable {
            sftp.arg("-R");
        }
        let mut sftp = sftp
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| mount_error(format!("failed to start {}: {err}", sftp_server.display())))?;

        let remote = location.display().to_string();
        let mut options = vec![
            "sshfs".to_string(),
            format!(":{remote}"),
            remote.clone(),
            "-o".to_string(),
            "slave".to_string(),
            "-o".to_string(),
            "allow_other".to_string(),
        ];
        if !mount.writable {
            options.extend(["-o".to_string(), "ro".to_string()]);
        }
        let mut ssh = self
            .transport
            .remote_command(&options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| mount_error(format!("failed to start sshfs session: {err}")))?;

        let pumps = match (
            sftp.stdout.take(),
            sftp.stdin.take(),
            ssh.stdout.take(),
            ssh.stdin.take(),
        ) {
            (Some(mut sftp_out), Some(mut sftp_in), Some(mut ssh_out), Some(mut ssh_in)) => vec![
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut sftp_out, &mut ssh_in).await;
                }),
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut ssh_out, &mut sftp_in).await;
                }),
            ],
            _ => return Err(mount_error("child pipes were not captured".to_string())),
        };
        debug!(parent: &self.span, location = %location.display(), "sshfs session started");

        Ok(Box::new(ReverseMount {
            name: format!("unmount {}", location.display()),
            location,
            transport: Arc::clone(&self.transport),
            sftp,
            ssh,
            pumps,
            span: self.span.clone(),
        }))
    }
}

/// Live reverse sshfs mount.
pub struct ReverseMount {
    name: String,
    location: PathBuf,
    transport: Arc<dyn Transport>,
    sftp: Child,
    ssh: Child,
    pumps: Vec<JoinHandle<()>>,
    span: Span,
}

#[async_trait]
impl Teardown for ReverseMount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let ReverseMount {
            location,
            transport,
            mut sftp,
            mut ssh,
            pumps,
            span,
            ..
        } = *self;
        info!(parent: &span, location = %location.display(), "Unmounting");

        let mut errors = ErrorList::new();
        let quoted = shell_quote(&location);
        if let Err(err) = transport
            .run_script(&format!("#!/bin/bash\nfusermount -u {quoted}\n"))
            .await
        {
            errors.push(Error::Mount {
                location: location.clone(),
                message: format!("failed to unmount: {err}"),
            });
        }
        for child in [&mut ssh, &mut sftp] {
            if let Err(err) = child.kill().await {
                debug!(parent: &span, error = %err, "child already gone");
            }
        }
        for pump in pumps {
            pump.abort();
        }
        errors.into_result()
    }
}

/// Single-quotes `path` for a POSIX shell.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::teardown::FnTeardown;
    use crate::core::transport::testing::RecordingTransport;
    use std::sync::Mutex;

    struct FlakyProvisioner {
        mounted: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl MountProvisioner for FlakyProvisioner {
        async fn mount(&self, mount: &MountConfig) -> Result<Box<dyn Teardown>> {
            if mount.location.ends_with("broken") {
                return Err(Error::Mount {
                    location: mount.location.clone(),
                    message: "no sshfs".to_string(),
                });
            }
            self.mounted.lock().unwrap().push(mount.location.clone());
            Ok(Box::new(FnTeardown::new("noop", || async { Ok(()) })))
        }
    }

    fn mount(location: &str) -> MountConfig {
        MountConfig {
            location: PathBuf::from(location),
            writable: false,
        }
    }

    #[tokio::test]
    async fn setup_continues_after_a_failed_mount() {
        let provisioner = FlakyProvisioner {
            mounted: Mutex::new(Vec::new()),
        };
        let (mounted, errors) = setup_mounts(
            &provisioner,
            &[mount("/a"), mount("/broken"), mount("/c")],
            &Span::none(),
        )
        .await;

        assert_eq!(mounted.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            *provisioner.mounted.lock().unwrap(),
            vec![PathBuf::from("/a"), PathBuf::from("/c")]
        );
    }

    #[tokio::test]
    async fn reverse_sshfs_creates_the_mount_point_and_unmounts() {
        let transport = Arc::new(RecordingTransport::default());
        let provisioner = ReverseSshfs::new(transport.clone(), Span::none()).with_sftp_server("cat");

        let teardown = provisioner.mount(&mount("/home/dev/it's here")).await.unwrap();
        assert_eq!(teardown.name(), "unmount /home/dev/it's here");
        teardown.run().await.unwrap();

        let scripts = transport.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains(r"mkdir -p '/home/dev/it'\''s here'"));
        assert!(scripts[1].contains(r"fusermount -u '/home/dev/it'\''s here'"));
    }

    #[tokio::test]
    async fn missing_sftp_server_is_a_mount_error() {
        let transport = Arc::new(RecordingTransport::default());
        let mut provisioner = ReverseSshfs::new(transport, Span::none());
        provisioner.sftp_server = None;

        let err = provisioner.mount(&mount("/data")).await.err().unwrap();
        assert!(matches!(err, Error::Mount { .. }));
    }
}
