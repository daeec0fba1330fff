//! QEMU integration: boots the staged ESP directory under OVMF with either
//! an Intel or an AMD processor model, serial on stdio.

use crate::{DynError, TestVm};
use std::{fmt, path::Path, process::Command};

pub(crate) struct Qemu {
    pub(crate) cpu: Cpu,
}

#[derive(Clone, Copy)]
pub(crate) enum Cpu {
    Intel,
    Amd,
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cpu::Intel => write!(f, "Intel"),
            Cpu::Amd => write!(f, "AMD"),
        }
    }
}

impl Cpu {
    fn model(self) -> &'static str {
        match self {
            // vmx/svm must be exposed to the guest for the nested launch.
            Cpu::Intel => "Skylake-Client,vmx=on",
            Cpu::Amd => "EPYC,svm=on",
        }
    }
}

impl TestVm for Qemu {
    fn run(&self, esp_dir: &Path) -> Result<(), DynError> {
        let firmware = find_ovmf().ok_or("OVMF firmware not found; install the ovmf package")?;
        println!("starting QEMU with a {} processor model", self.cpu);

        let status = Command::new(qemu_binary())
            .args([
                "-machine",
                "q35",
                "-cpu",
                self.cpu.model(),
                "-smp",
                "2",
                "-m",
                "512",
                "-nographic",
                "-serial",
                "mon:stdio",
                "-drive",
                &format!("if=pflash,format=raw,readonly=on,file={firmware}"),
                "-drive",
                &format!("format=raw,file=fat:rw:{}", esp_dir.display()),
                "-net",
                "none",
            ])
            .status()?;
        if !status.success() {
            Err("qemu exited with an error")?;
        }
        Ok(())
    }
}

fn qemu_binary() -> &'static str {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "windows")] {
            r"C:\Program Files\qemu\qemu-system-x86_64.exe"
        } else {
            "qemu-system-x86_64"
        }
    }
}

/// Looks for an OVMF code image in the usual distribution locations.
fn find_ovmf() -> Option<String> {
    const CANDIDATES: &[&str] = &[
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/ovmf/OVMF.fd",
        "/usr/share/edk2/x64/OVMF_CODE.fd",
        "/usr/share/qemu/OVMF.fd",
    ];
    CANDIDATES
        .iter()
        .find(|path| Path::new(path).exists())
        .map(|path| (*path).to_string())
}
