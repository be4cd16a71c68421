// runner/src/main.rs
//
// Wraps a built kernel ELF (and optional init ramdisk) into a bootable disk
// image and launches QEMU with the serial console on stdio.
//
//   lumen-runner <kernel-elf> [init-elf] [--bios]

use std::path::{Path, PathBuf};
use std::process::{exit, Command};

use ovmf_prebuilt::{Arch, FileType, Prebuilt, Source};

struct Args {
    kernel: PathBuf,
    ramdisk: Option<PathBuf>,
    uefi: bool,
}

fn parse_args() -> Option<Args> {
    let mut kernel = None;
    let mut ramdisk = None;
    let mut uefi = true;
    for arg in std::env::args().skip(1) {
        if arg == "--bios" {
            uefi = false;
        } else if kernel.is_none() {
            kernel = Some(PathBuf::from(arg));
        } else if ramdisk.is_none() {
            ramdisk = Some(PathBuf::from(arg));
        } else {
            return None;
        }
    }
    Some(Args { kernel: kernel?, ramdisk, uefi })
}

fn build_image(args: &Args) -> Result<PathBuf, String> {
    let out_dir = args.kernel.parent().unwrap_or(Path::new("."));
    let image = if args.uefi {
        let path = out_dir.join("lumen-uefi.img");
        let mut boot = bootloader::UefiBoot::new(&args.kernel);
        if let Some(rd) = &args.ramdisk {
            boot.set_ramdisk(rd);
        }
        boot.create_disk_image(&path).map_err(|e| e.to_string())?;
        path
    } else {
        let path = out_dir.join("lumen-bios.img");
        let mut boot = bootloader::BiosBoot::new(&args.kernel);
        if let Some(rd) = &args.ramdisk {
            boot.set_ramdisk(rd);
        }
        boot.create_disk_image(&path).map_err(|e| e.to_string())?;
        path
    };
    Ok(image)
}

fn main() {
    let Some(args) = parse_args() else {
        eprintln!("usage: lumen-runner <kernel-elf> [init-elf] [--bios]");
        exit(2);
    };

    let image = match build_image(&args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to build disk image: {}", e);
            exit(1);
        }
    };

    let mut cmd = Command::new("qemu-system-x86_64");
    if args.uefi {
        let prebuilt = match Prebuilt::fetch(Source::LATEST, "target/ovmf") {
            Ok(p) => p,
            Err(e) => {
                eprintln!("failed to fetch OVMF: {}", e);
                exit(1);
            }
        };
        let code = prebuilt.get_file(Arch::X64, FileType::Code);
        let vars = prebuilt.get_file(Arch::X64, FileType::Vars);
        cmd.arg("-drive")
            .arg(format!("if=pflash,format=raw,readonly=on,file={}", code.display()));
        cmd.arg("-drive")
            .arg(format!("if=pflash,format=raw,file={}", vars.display()));
    }
    cmd.arg("-drive").arg(format!("format=raw,file={}", image.display()));

    cmd.arg("-m").arg("256M");
    cmd.arg("-serial").arg("stdio");
    cmd.arg("-device").arg("isa-debug-exit,iobase=0xf4,iosize=0x04");

    let status = match cmd.status() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to launch qemu: {}", e);
            exit(1);
        }
    };
    exit(status.code().unwrap_or(1));
}
