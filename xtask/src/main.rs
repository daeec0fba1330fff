//! A build and test assist program. To show the usage, run
//!
//! ```shell
//! cargo xtask
//! ```

#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use qemu::{Cpu, Qemu};
use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

mod qemu;

type DynError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(author, about, long_about = None)]
struct Cli {
    /// Build the hypervisor with the release profile
    #[arg(short, long)]
    release: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a QEMU VM with an Intel processor model (VT-x)
    QemuIntel,
    /// Start a QEMU VM with an AMD processor model (AMD-V)
    QemuAmd,
    /// Build the hypervisor and stage the EFI system partition directory
    Stage,
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::QemuIntel => start_vm(&Qemu { cpu: Cpu::Intel }, cli.release),
        Commands::QemuAmd => start_vm(&Qemu { cpu: Cpu::Amd }, cli.release),
        Commands::Stage => stage_esp(cli.release).map(|_path| ()),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(-1);
    }
}

trait TestVm {
    fn run(&self, esp_dir: &Path) -> Result<(), DynError>;
}

fn start_vm<T: TestVm>(vm: &T, release: bool) -> Result<(), DynError> {
    let esp_dir = stage_esp(release)?;
    // Let Ctrl+C reach the emulator cleanly.
    ctrlc::set_handler(|| ())?;
    vm.run(&esp_dir)
}

/// Builds the hypervisor and lays out an ESP directory tree with the
/// image as the default boot application.
fn stage_esp(release: bool) -> Result<PathBuf, DynError> {
    build_hypervisor(release)?;

    let esp_dir = project_root_dir().join("target/esp");
    let boot_dir = esp_dir.join("EFI/BOOT");
    fs::create_dir_all(&boot_dir)?;
    let efi = output_dir(release).join("stonevisor.efi");
    let _ = fs::copy(&efi, boot_dir.join("BOOTX64.EFI"))?;
    println!("staged {} into {}", efi.display(), esp_dir.display());
    Ok(esp_dir)
}

fn build_hypervisor(release: bool) -> Result<(), DynError> {
    // Building stonevisor only is important because we are running xtask,
    // which cannot be overwritten while running.
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut command = Command::new(cargo);
    let _ = command.args(["build", "--package", "stonevisor"]);
    if release {
        let _ = command.arg("--release");
    }
    let ok = command.current_dir(project_root_dir()).status()?.success();
    if !ok {
        Err("cargo build failed")?;
    }
    Ok(())
}

fn project_root_dir() -> PathBuf {
    // Get the path to the xtask directory and resolve its parent directory.
    let root_dir = Path::new(&env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(1)
        .unwrap()
        .to_path_buf();
    fs::canonicalize(root_dir).unwrap()
}

fn output_dir(release: bool) -> PathBuf {
    let mut out_dir = project_root_dir();
    out_dir.extend(&["target", "x86_64-unknown-uefi"]);
    out_dir.extend(if release { &["release"] } else { &["debug"] });
    fs::canonicalize(&out_dir).unwrap()
}

#[cfg(test)]
mod tests {
    use crate::project_root_dir;

    #[test]
    fn test_project_root_dir() {
        let root = project_root_dir();
        assert!(root.join("xtask").is_dir());
    }
}
