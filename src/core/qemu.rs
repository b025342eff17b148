//! QEMU command-line construction.

use std::path::{Path, PathBuf};

use tracing::{Span, debug, warn};

use crate::config::{Arch, VmConfig};
use crate::core::host::{find_executable, host_threads};
use crate::core::hypervisor::HypervisorCommand;
use crate::core::instance::Instance;
use crate::error::{Error, Result};

/// Slirp network shared by every instance; each QEMU has its own stack.
const USER_NETWORK: &str = "192.168.5.0/24";
const SERIAL_CHARDEV: &str = "char-serial";
const QMP_CHARDEV: &str = "char-qmp";

pub trait CommandBuilder: Send + Sync {
    fn build(&self, instance: &Instance, config: &VmConfig) -> Result<HypervisorCommand>;
}

pub struct QemuCmdline {
    span: Span,
}

impl QemuCmdline {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

impl CommandBuilder for QemuCmdline {
    fn build(&self, instance: &Instance, config: &VmConfig) -> Result<HypervisorCommand> {
        let exe_name = format!("qemu-system-{}", config.arch);
        let program = find_executable(&[exe_name.as_str()])
            .ok_or(Error::ExecutableNotFound { name: exe_name })?;

        let mut args = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        let accel = accelerator(config.arch);
        match config.arch {
            Arch::X86_64 => {
                push(&["-cpu", "Haswell-v4"]);
                push(&["-machine", &format!("q35,accel={accel}")]);
            }
            Arch::Aarch64 => {
                push(&["-cpu", "cortex-a72"]);
                push(&["-machine", &format!("virt,accel={accel},highmem=off")]);
            }
        }

        let threads = host_threads();
        if threads > 0 && config.cpus as usize > threads {
            warn!(parent: &self.span, cpus = config.cpus, host_threads = threads, "requested vCPUs exceed host threads");
        }
        push(&[
            "-smp",
            &format!("{cpus},sockets=1,cores={cpus},threads=1", cpus = config.cpus),
        ]);
        push(&["-m", &config.memory.mebibytes().to_string()]);

        if !config.firmware.legacy_bios {
            let firmware = find_firmware(&program, config.arch, &self.span)?;
            push(&[
                "-drive",
                &format!("if=pflash,format=raw,readonly,file={}", firmware.display()),
            ]);
        } else if config.arch != Arch::X86_64 {
            warn!(parent: &self.span, arch = %config.arch, "`firmware.legacy_bios` is not supported for this architecture, ignoring");
        }
        push(&["-boot", "order=c,splash-time=0,menu=on"]);

        push(&[
            "-drive",
            &format!("file={},if=virtio", instance.diff_disk().display()),
        ]);
        push(&["-cdrom", &instance.cidata().display().to_string()]);

        push(&["-net", "nic,model=virtio"]);
        push(&[
            "-net",
            &format!(
                "user,net={USER_NETWORK},hostfwd=tcp:127.0.0.1:{}-:22",
                config.ssh.local_port
            ),
        ]);
        push(&["-device", "virtio-rng-pci"]);

        if let Some(display) = &config.video.display {
            push(&["-display", display.as_str()]);
        }
        match config.arch {
            Arch::X86_64 => {
                push(&["-device", "virtio-vga"]);
                push(&["-device", "virtio-keyboard-pci"]);
                push(&["-device", "virtio-mouse-pci"]);
            }
            // no virtio-vga on aarch64
            Arch::Aarch64 => {
                push(&["-vga", "none", "-device", "ramfb"]);
                push(&["-device", "usb-ehci"]);
                push(&["-device", "usb-kbd"]);
                push(&["-device", "usb-mouse"]);
            }
        }
        push(&["-parallel", "none"]);

        push(&[
            "-chardev",
            &format!(
                "socket,id={SERIAL_CHARDEV},path={},server,nowait,logfile={}",
                instance.serial_socket().display(),
                instance.serial_log().display()
            ),
        ]);
        push(&["-serial", &format!("chardev:{SERIAL_CHARDEV}")]);

        push(&[
            "-chardev",
            &format!(
                "socket,id={QMP_CHARDEV},path={},server,nowait",
                instance.qmp_socket().display()
            ),
        ]);
        push(&["-qmp", &format!("chardev:{QMP_CHARDEV}")]);

        push(&["-name", &format!("hostagent-{}", instance.name())]);
        push(&["-pidfile", &instance.pid_file().display().to_string()]);

        Ok(HypervisorCommand { program, args })
    }
}

fn accelerator(arch: Arch) -> &'static str {
    if Arch::host() != Some(arch) {
        return "tcg";
    }
    if cfg!(target_os = "macos") {
        "hvf"
    } else if cfg!(target_os = "linux") {
        "kvm"
    } else {
        "tcg"
    }
}

fn find_firmware(qemu: &Path, arch: Arch, span: &Span) -> Result<PathBuf> {
    // <prefix>/bin/qemu-system-* -> <prefix>/share/qemu
    let prefix = qemu.parent().and_then(Path::parent);
    let mut candidates: Vec<PathBuf> = prefix
        .map(|prefix| prefix.join(format!("share/qemu/edk2-{arch}-code.fd")))
        .into_iter()
        .collect();
    candidates.push(PathBuf::from(match arch {
        Arch::X86_64 => "/usr/share/OVMF/OVMF_CODE.fd",
        Arch::Aarch64 => "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    }));
    debug!(parent: span, candidates = ?candidates, "firmware candidates");

    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| Error::FirmwareNotFound {
            exe: qemu.to_path_buf(),
            hint: match arch {
                Arch::X86_64 => " (hint: try setting `firmware.legacy_bios` to `true`)",
                Arch::Aarch64 => "",
            },
        })
}
