//! Instance directory layout.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const HOME_ENV: &str = "HOSTAGENT_HOME";
pub const CONFIG_FILE: &str = "instance.toml";

/// One VM instance and the directory that holds its runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    name: String,
    dir: PathBuf,
}

impl Instance {
    /// Resolves `name` under `home`, `$HOSTAGENT_HOME`, or `~/.hostagent`, in that
    /// order. The directory must already exist.
    pub fn open(name: &str, home: Option<&Path>) -> Result<Self> {
        let root = match home {
            Some(home) => home.to_path_buf(),
            None => default_home()?,
        };
        let dir = root.join(name);
        if !dir.is_dir() {
            return Err(Error::InstanceNotFound {
                name: name.to_string(),
                dir,
            });
        }
        Ok(Self::at(name, dir))
    }

    pub fn at(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.dir.join("qmp.sock")
    }

    /// Host end of the forwarded guest agent socket.
    pub fn guest_agent_socket(&self) -> PathBuf {
        self.dir.join("ga.sock")
    }

    pub fn serial_socket(&self) -> PathBuf {
        self.dir.join("serial.sock")
    }

    pub fn serial_log(&self) -> PathBuf {
        self.dir.join("serial.log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    pub fn ssh_control_socket(&self) -> PathBuf {
        self.dir.join("ssh.sock")
    }

    pub fn diff_disk(&self) -> PathBuf {
        self.dir.join("diffdisk")
    }

    pub fn cidata(&self) -> PathBuf {
        self.dir.join("cidata.iso")
    }

    /// Removes sockets, logs and the pid file left behind by a previous run.
    pub fn clear_runtime_artifacts(&self) -> Result<()> {
        for path in [
            self.serial_socket(),
            self.serial_log(),
            self.qmp_socket(),
            self.pid_file(),
        ] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

fn default_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(|home| PathBuf::from(home).join(".hostagent"))
        .ok_or(Error::HomeUnavailable)
}

/// Deletes `path`, treating a missing file as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io(format!("failed to remove {}", path.display()), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_prefers_the_environment_override() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("default")).unwrap();
        temp_env::with_var(HOME_ENV, Some(root.path()), || {
            let instance = Instance::open("default", None).unwrap();
            assert_eq!(instance.dir(), root.path().join("default"));
            assert_eq!(instance.qmp_socket(), root.path().join("default/qmp.sock"));
        });
    }

    #[test]
    fn open_falls_back_to_home() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join(".hostagent/dev")).unwrap();
        temp_env::with_vars(
            [(HOME_ENV, None), ("HOME", Some(root.path().as_os_str()))],
            || {
                let instance = Instance::open("dev", None).unwrap();
                assert_eq!(instance.dir(), root.path().join(".hostagent/dev"));
            },
        );
    }

    #[test]
    fn missing_instance_is_reported() {
        let root = tempdir().unwrap();
        let err = Instance::open("ghost", Some(root.path())).unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn clearing_artifacts_tolerates_missing_files() {
        let root = tempdir().unwrap();
        let instance = Instance::at("vm", root.path());
        fs::write(instance.pid_file(), "123").unwrap();
        fs::write(instance.serial_log(), "boot").unwrap();

        instance.clear_runtime_artifacts().unwrap();

        assert!(!instance.pid_file().exists());
        assert!(!instance.serial_log().exists());
        assert!(root.path().exists());
    }
}
