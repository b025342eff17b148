use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

pub const DEFAULT_SSH_LOCAL_PORT: i64 = 60022;
pub const DEFAULT_CPUS: u32 = 4;
pub const DEFAULT_MEMORY: &str = "4 GiB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "x86_64" | "amd64" => Some(Self::X86_64),
            "aarch64" | "arm64" => Some(Self::Aarch64),
            _ => None,
        }
    }

    /// Architecture of the machine this process runs on.
    pub fn host() -> Option<Self> {
        Self::parse(std::env::consts::ARCH)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub file_path: PathBuf,
    pub arch: Arch,
    pub cpus: u32,
    pub memory: MemorySpec,
    pub mounts: Vec<MountConfig>,
    pub ssh: SshConfig,
    pub firmware: FirmwareConfig,
    pub video: VideoConfig,
    pub port_forwards: Vec<PortForwardRule>,
    pub probes: Vec<ProbeConfig>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MemorySpec {
    original: String,
    bytes: u64,
}

impl MemorySpec {
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn mebibytes(&self) -> u64 {
        self.bytes >> 20
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub location: PathBuf,
    pub writable: bool,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Host port forwarded to the guest's sshd. Range-checked when the agent
    /// starts, not here.
    pub local_port: i64,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_SSH_LOCAL_PORT,
            user: None,
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FirmwareConfig {
    pub legacy_bios: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VideoConfig {
    pub display: Option<String>,
}

/// Maps a range of guest ports onto host ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRule {
    pub guest_port_range: (u16, u16),
    pub host_port_range: (u16, u16),
    pub host_ip: std::net::IpAddr,
    pub ignore: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub description: String,
    pub script: String,
    pub hint: String,
}

pub fn load_vm_config(path: &Path) -> Result<VmConfig, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let value: toml::Value = toml::from_str(&contents).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let mut warnings = detect_unknown_fields(&value);

    let raw = RawConfig::deserialize(value).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    raw.into_validated(path, &mut warnings)
}

fn invalid_config(path: &Path, message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn detect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let allowed_root = [
        "arch",
        "cpus",
        "memory",
        "mounts",
        "ssh",
        "firmware",
        "video",
        "port_forwards",
        "probes",
    ];

    let toml::Value::Table(table) = value else {
        return warnings;
    };
    warn_table(table, &allowed_root, "root", &mut warnings);

    let tables: [(&str, &[&str]); 3] = [
        ("ssh", &["local_port", "user", "identity_file"]),
        ("firmware", &["legacy_bios"]),
        ("video", &["display"]),
    ];
    for (key, allowed) in tables {
        match table.get(key) {
            Some(toml::Value::Table(inner)) => {
                warn_table(inner, allowed, &format!("[{key}]"), &mut warnings)
            }
            Some(_) => warnings.push(format!("Expected [{key}] to be a table.")),
            None => {}
        }
    }

    let arrays: [(&str, &[&str]); 3] = [
        ("mounts", &["location", "writable"]),
        (
            "port_forwards",
            &["guest_port_range", "host_port_range", "host_ip", "ignore"],
        ),
        ("probes", &["description", "script", "hint"]),
    ];
    for (key, allowed) in arrays {
        match table.get(key) {
            Some(toml::Value::Array(entries)) => {
                for (idx, entry) in entries.iter().enumerate() {
                    if let toml::Value::Table(inner) = entry {
                        warn_table(inner, allowed, &format!("[[{key}]] #{idx}"), &mut warnings);
                    } else {
                        warnings.push(format!("[[{key}]] entry #{idx} must be a table."));
                    }
                }
            }
            Some(_) => warnings.push(format!("`{key}` must be an array of tables.")),
            None => {}
        }
    }

    warnings
}

fn warn_table(
    table: &toml::map::Map<String, toml::Value>,
    allowed: &[&str],
    context: &str,
    warnings: &mut Vec<String>,
) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            warnings.push(format!(
                "Unknown field `{key}` at {context}; this value will be ignored."
            ));
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    arch: Option<String>,
    cpus: Option<u32>,
    memory: Option<String>,
    #[serde(default)]
    mounts: Vec<RawMount>,
    #[serde(default)]
    ssh: RawSsh,
    #[serde(default)]
    firmware: RawFirmware,
    #[serde(default)]
    video: RawVideo,
    #[serde(default)]
    port_forwards: Vec<RawPortForward>,
    #[serde(default)]
    probes: Vec<RawProbe>,
}

#[derive(Debug, Deserialize)]
struct RawMount {
    location: Option<String>,
    #[serde(default)]
    writable: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RawSsh {
    local_port: Option<i64>,
    user: Option<String>,
    identity_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawFirmware {
    #[serde(default)]
    legacy_bios: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RawVideo {
    display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPortForward {
    guest_port_range: Option<[u16; 2]>,
    host_port_range: Option<[u16; 2]>,
    host_ip: Option<String>,
    #[serde(default)]
    ignore: bool,
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    description: Option<String>,
    script: Option<String>,
    hint: Option<String>,
}

impl RawConfig {
    fn into_validated(self, path: &Path, warnings: &mut Vec<String>) -> Result<VmConfig, Error> {
        let arch = match self.arch.as_deref() {
            Some(value) => Arch::parse(value).ok_or_else(|| {
                invalid_config(
                    path,
                    format!("Unsupported `arch` value `{value}`. Supported values: x86_64, aarch64."),
                )
            })?,
            None => Arch::host().ok_or_else(|| Error::UnsupportedArch {
                arch: std::env::consts::ARCH.to_string(),
            })?,
        };

        let cpus = self.cpus.unwrap_or(DEFAULT_CPUS);
        if cpus == 0 {
            return Err(invalid_config(
                path,
                "`cpus` must be at least 1. Example: `cpus = 4`.",
            ));
        }

        let memory = self.memory.unwrap_or_else(|| DEFAULT_MEMORY.to_string());
        let memory = parse_memory(&memory).map_err(|msg| {
            invalid_config(
                path,
                format!(
                    "Invalid memory specification `{memory}`: {msg}. \
                     Example values: `4096 MiB`, `4 GiB`."
                ),
            )
        })?;

        let mut mounts = Vec::with_capacity(self.mounts.len());
        for (idx, mount) in self.mounts.into_iter().enumerate() {
            let location = mount.location.ok_or_else(|| {
                invalid_config(
                    path,
                    format!("[[mounts]] #{idx} is missing required field `location`."),
                )
            })?;
            let location = expand_home(&location);
            if !location.is_absolute() {
                return Err(invalid_config(
                    path,
                    format!(
                        "[[mounts]] #{idx} location `{}` must be absolute or start with `~`.",
                        location.display()
                    ),
                ));
            }
            if mounts
                .iter()
                .any(|existing: &MountConfig| existing.location == location)
            {
                warnings.push(format!(
                    "Mount location `{}` is declared more than once.",
                    location.display()
                ));
            }
            mounts.push(MountConfig {
                location,
                writable: mount.writable,
            });
        }

        let ssh = SshConfig {
            local_port: self.ssh.local_port.unwrap_or(DEFAULT_SSH_LOCAL_PORT),
            user: self.ssh.user,
            identity_file: self.ssh.identity_file.as_deref().map(expand_home),
        };

        let mut port_forwards = Vec::with_capacity(self.port_forwards.len());
        for (idx, rule) in self.port_forwards.into_iter().enumerate() {
            let guest = rule.guest_port_range.ok_or_else(|| {
                invalid_config(
                    path,
                    format!(
                        "[[port_forwards]] #{idx} is missing `guest_port_range`. Example: `guest_port_range = [8000, 8999]`."
                    ),
                )
            })?;
            let host = rule.host_port_range.unwrap_or(guest);
            if guest[0] == 0 || guest[0] > guest[1] || host[0] == 0 || host[0] > host[1] {
                return Err(invalid_config(
                    path,
                    format!("[[port_forwards]] #{idx} must use ascending ranges between 1 and 65535."),
                ));
            }
            if guest[1] - guest[0] != host[1] - host[0] {
                return Err(invalid_config(
                    path,
                    format!("[[port_forwards]] #{idx} guest and host ranges must have the same length."),
                ));
            }
            let host_ip = match rule.host_ip.as_deref() {
                Some(ip) => ip.parse().map_err(|_| {
                    invalid_config(
                        path,
                        format!("[[port_forwards]] #{idx} has invalid `host_ip` `{ip}`."),
                    )
                })?,
                None => std::net::IpAddr::from([127, 0, 0, 1]),
            };
            port_forwards.push(PortForwardRule {
                guest_port_range: (guest[0], guest[1]),
                host_port_range: (host[0], host[1]),
                host_ip,
                ignore: rule.ignore,
            });
        }

        let total = self.probes.len();
        let mut probes = Vec::with_capacity(total);
        for (idx, probe) in self.probes.into_iter().enumerate() {
            let script = probe.script.ok_or_else(|| {
                invalid_config(
                    path,
                    format!("[[probes]] #{idx} is missing required field `script`."),
                )
            })?;
            probes.push(ProbeConfig {
                description: probe
                    .description
                    .unwrap_or_else(|| format!("user probe {}/{total}", idx + 1)),
                script,
                hint: probe.hint.unwrap_or_default(),
            });
        }

        Ok(VmConfig {
            file_path: path.to_path_buf(),
            arch,
            cpus,
            memory,
            mounts,
            ssh,
            firmware: FirmwareConfig {
                legacy_bios: self.firmware.legacy_bios,
            },
            video: VideoConfig {
                display: self.video.display,
            },
            port_forwards,
            probes,
            warnings: warnings.clone(),
        })
    }
}

/// Expands a leading `~` against `$HOME`.
pub fn expand_home(input: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (input.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(&rest[1..]),
        _ => PathBuf::from(input),
    }
}

fn parse_memory(input: &str) -> Result<MemorySpec, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("memory value cannot be empty".to_string());
    }

    let mut parts = trimmed.split_whitespace();
    let amount = parts
        .next()
        .ok_or_else(|| "memory value is missing numeric component".to_string())?;
    let unit = parts.next();
    if parts.next().is_some() {
        return Err("memory value contains unexpected extra tokens".to_string());
    }

    let amount_value: f64 = amount.parse().map_err(|_| {
        format!("could not parse `{amount}` as a number; try values like `4096 MiB` or `4 GiB`")
    })?;
    if !amount_value.is_finite() || amount_value <= 0.0 {
        return Err("memory value must be a positive number".to_string());
    }

    let multiplier = match unit.map(|u| u.to_ascii_lowercase()) {
        Some(ref u) if u == "mib" || u == "mb" => 1024.0 * 1024.0,
        Some(ref u) if u == "gib" || u == "gb" => 1024.0 * 1024.0 * 1024.0,
        Some(ref u) if u == "kib" || u == "kb" => 1024.0,
        Some(ref u) if u == "b" || u == "bytes" => 1.0,
        Some(ref u) => {
            return Err(format!(
                "unsupported memory unit `{u}`; supported units are B, KiB, MiB, GiB."
            ));
        }
        None => 1024.0 * 1024.0,
    };
    let scaled = amount_value * multiplier;
    if scaled >= u64::MAX as f64 {
        return Err(format!("memory value `{trimmed}` is too large"));
    }
    let bytes = scaled as u64;

    Ok(MemorySpec {
        original: trimmed.to_string(),
        bytes,
    })
}

#[cfg(test)]
pub(crate) fn test_config() -> VmConfig {
    VmConfig {
        file_path: PathBuf::from("instance.toml"),
        arch: Arch::X86_64,
        cpus: 2,
        memory: MemorySpec {
            original: "2 GiB".to_string(),
            bytes: 2 << 30,
        },
        mounts: Vec::new(),
        ssh: SshConfig::default(),
        firmware: FirmwareConfig::default(),
        video: VideoConfig::default(),
        port_forwards: Vec::new(),
        probes: Vec::new(),
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_apply_when_only_arch_is_set() {
        let file = write_config("arch = \"x86_64\"\n");
        let config = load_vm_config(file.path()).unwrap();
        assert_eq!(config.arch, Arch::X86_64);
        assert_eq!(config.cpus, DEFAULT_CPUS);
        assert_eq!(config.memory.mebibytes(), 4096);
        assert_eq!(config.ssh.local_port, DEFAULT_SSH_LOCAL_PORT);
        assert!(config.mounts.is_empty());
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn unknown_fields_produce_warnings() {
        let file = write_config(
            r#"
arch = "aarch64"
colour = "blue"

[ssh]
local_port = 2222
agent = true
"#,
        );
        let config = load_vm_config(file.path()).unwrap();
        assert_eq!(config.ssh.local_port, 2222);
        assert_eq!(config.warnings.len(), 2);
        assert!(config.warnings[0].contains("`colour`"));
        assert!(config.warnings[1].contains("[ssh]"));
    }

    #[test]
    fn negative_ssh_port_is_kept_for_the_agent_to_reject() {
        let file = write_config("arch = \"x86_64\"\n[ssh]\nlocal_port = -1\n");
        let config = load_vm_config(file.path()).unwrap();
        assert_eq!(config.ssh.local_port, -1);
    }

    #[test]
    fn mounts_expand_home() {
        temp_env::with_var("HOME", Some("/home/tester"), || {
            let file = write_config(
                "arch = \"x86_64\"\n[[mounts]]\nlocation = \"~\"\n[[mounts]]\nlocation = \"/tmp/data\"\nwritable = true\n",
            );
            let config = load_vm_config(file.path()).unwrap();
            assert_eq!(
                config.mounts,
                vec![
                    MountConfig {
                        location: PathBuf::from("/home/tester"),
                        writable: false,
                    },
                    MountConfig {
                        location: PathBuf::from("/tmp/data"),
                        writable: true,
                    },
                ]
            );
        });
    }

    #[test]
    fn relative_mount_is_rejected() {
        let file = write_config("arch = \"x86_64\"\n[[mounts]]\nlocation = \"data\"\n");
        let err = load_vm_config(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn port_forward_ranges_must_match() {
        let file = write_config(
            "arch = \"x86_64\"\n[[port_forwards]]\nguest_port_range = [8000, 8010]\nhost_port_range = [9000, 9001]\n",
        );
        let err = load_vm_config(file.path()).unwrap_err();
        match err {
            Error::InvalidConfig { message, .. } => assert!(message.contains("same length")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn probes_get_numbered_descriptions() {
        let file = write_config(
            "arch = \"x86_64\"\n[[probes]]\nscript = \"true\"\n[[probes]]\nscript = \"false\"\ndescription = \"docker\"\n",
        );
        let config = load_vm_config(file.path()).unwrap();
        assert_eq!(config.probes[0].description, "user probe 1/2");
        assert_eq!(config.probes[1].description, "docker");
    }

    #[test]
    fn parse_memory_handles_units() {
        assert_eq!(parse_memory("2 GiB").unwrap().bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512").unwrap().mebibytes(), 512);
        assert!(parse_memory("2 TB").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn parse_memory_rejects_non_finite_amounts() {
        assert!(parse_memory("nan").is_err());
        assert!(parse_memory("inf GiB").is_err());
        assert!(parse_memory("-inf").is_err());
        assert!(parse_memory("1e300 GiB").is_err());
    }
}
