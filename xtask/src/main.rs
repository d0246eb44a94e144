//! Build-orchestration binary: builds the `kernel` binary for the bare-metal target, objcopies
//! it to a raw binary, and drops it where `bootloader-loader`'s `build.rs` expects to find it
//! to embed as the image it loads and jumps into.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

type DynError = Box<dyn std::error::Error>;

const TARGET: &str = "armv7a-none-eabi";

fn main() -> Result<(), DynError> {
    let mut args = env::args();
    match args.nth(1).as_deref() {
        Some("build-kernel") => {
            let is_debug = matches!(args.next().as_deref(), Some("debug"));
            build_kernel(is_debug)?;
            Ok(())
        }
        Some("qemu") => {
            let is_debug = matches!(args.next().as_deref(), Some("debug"));
            let image = build_kernel(is_debug)?;
            let mut qemu = Command::new("qemu-system-arm");
            qemu.args(["-serial", "stdio", "-M", "raspi1ap", "-display", "none", "-kernel"]);
            qemu.arg(&image);
            if !qemu.status()?.success() {
                return Err("qemu failed".into());
            }
            Ok(())
        }
        Some(unknown) => Err(format!("Unknown command: {unknown}").into()),
        None => {
            println!(
                "Available commands:\n\
                 build-kernel [debug]  build the kernel binary and objcopy it to raw binary\n\
                 qemu [debug]          build and boot the kernel under QEMU"
            );
            Ok(())
        }
    }
}

fn project_root() -> PathBuf {
    Path::new(&env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root should exist")
        .to_path_buf()
}

/// Builds the `kernel` binary for `TARGET`, objcopies it into a raw binary, and returns the raw
/// binary's path.
fn build_kernel(is_debug: bool) -> Result<PathBuf, DynError> {
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let root = project_root();

    let mut command = Command::new(&cargo);
    command
        .current_dir(&root)
        .args(["build", "--package", "kernel", "--bin", "kernel", "--target", TARGET]);
    if !is_debug {
        command.arg("--release");
    }
    if !command.status()?.success() {
        return Err("kernel build failed".into());
    }

    let profile_dir = if is_debug { "debug" } else { "release" };
    let elf_path = root.join("target").join(TARGET).join(profile_dir).join("kernel");
    let binary_path = root.join("target").join(TARGET).join(profile_dir).join("kernel.bin");

    if !Command::new("rust-objcopy")
        .args(["-O", "binary"])
        .arg(&elf_path)
        .arg(&binary_path)
        .status()?
        .success()
    {
        return Err("objcopy failed".into());
    }

    println!("built {}", binary_path.display());
    Ok(binary_path)
}
