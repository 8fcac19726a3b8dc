//! The `clap`-derived command-line surface, parsed once into a typed
//! [`rvvm_machine::MachineConfig`] before anything else in the binary runs.

use std::path::PathBuf;

use clap::Parser;

/// Boots a RISC-V guest on top of the rvvm machine substrate.
#[derive(Parser, Debug)]
#[clap(name = "rvvm-run", version, about, long_about = None)]
pub struct Cli {
    /// RAM amount, with an optional K/M/G suffix.
    #[arg(short = 'm', long = "mem", default_value = "256M")]
    pub mem: String,

    /// Hart count.
    #[arg(short = 's', long = "smp", default_value_t = 1)]
    pub smp: u32,

    /// Select the 32-bit ISA; 64-bit otherwise.
    #[arg(long)]
    pub rv32: bool,

    /// S-mode payload to load at the reset vector.
    #[arg(short = 'k', long = "kernel")]
    pub kernel: Option<PathBuf>,

    /// Bare firmware path, equivalent to `--kernel` when given positionally.
    #[arg(value_name = "FIRMWARE")]
    pub firmware: Option<PathBuf>,

    /// Custom device-tree blob to load instead of the built-in fallback.
    #[arg(long)]
    pub dtb: Option<PathBuf>,

    /// Write the auto-generated (or loaded) device tree out to this path.
    #[arg(long)]
    pub dumpdtb: Option<PathBuf>,

    /// Attach storage as NVMe.
    #[arg(short = 'i', long = "image", visible_alias = "nvme")]
    pub nvme: Vec<PathBuf>,

    /// Attach storage as ATA.
    #[arg(long)]
    pub ata: Vec<PathBuf>,

    /// Additional UART backend: `pty`, `pipe`, or `null`.
    #[arg(long)]
    pub serial: Vec<String>,

    /// Framebuffer resolution, `WxH`.
    #[arg(long)]
    pub res: Option<String>,

    /// Override the kernel command line.
    #[arg(long)]
    pub cmdline: Option<String>,

    /// Extend rather than replace the kernel command line.
    #[arg(long)]
    pub append: Option<String>,

    #[arg(long)]
    pub nogui: bool,

    #[arg(long)]
    pub nonet: bool,

    #[arg(long)]
    pub noisolation: bool,

    #[arg(long)]
    pub nojit: bool,

    /// Enable the debugger listener at `host:port`.
    #[arg(long)]
    pub gdbstub: Option<String>,

    /// Track per-mnemonic retire counts and log them on shutdown.
    #[arg(long)]
    pub count_instructions: bool,
}
