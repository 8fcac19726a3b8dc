//! The structured boot-time configuration record that replaces the
//! distilled spec's "opaque integer-tag options map" (§3, §9's own
//! recommendation): a typed [`MachineConfig`] the CLI (`bins/rvvm-run`)
//! builds once from its `clap`-derived arguments and hands to
//! [`crate::Machine::create`].

use std::path::PathBuf;

use crate::error::{MachineError, MachineResult};

/// Default RAM size when `-m`/`--mem` is not given.
pub const DEFAULT_MEMORY_SIZE: u64 = 256 * 1024 * 1024;

/// Guest physical address RAM is based at; matches the conventional RISC-V
/// virt-machine layout the boot convention (`a1` = DTB pointer into this
/// window) assumes.
pub const DEFAULT_MEMORY_BASE: u64 = 0x8000_0000;

/// Reset vector every hart's PC starts at.
pub const DEFAULT_BOOT_PC: u64 = DEFAULT_MEMORY_BASE;

/// Offset from the memory base the device tree blob is loaded at, leaving
/// room below it for firmware/kernel images loaded at the reset vector.
pub const DEFAULT_DTB_OFFSET: u64 = 0x0020_0000;

/// One additional UART beyond the machine's primary console, as requested
/// by a repeated `--serial` flag.
#[derive(Debug, Clone)]
pub enum SerialBackend {
    Pty,
    Pipe,
    Null,
}

/// Which storage protocol a `-i`/`--image`/`--nvme`/`--ata` path attaches as.
#[derive(Debug, Clone)]
pub enum StorageKind {
    Nvme,
    Ata,
}

#[derive(Debug, Clone)]
pub struct StorageDevice {
    pub path: PathBuf,
    pub kind: StorageKind,
}

/// A fully-parsed, validated description of one machine to boot. Built by
/// the CLI from the flags in the external-interfaces table and consumed
/// only by [`crate::Machine::create`]; nothing downstream touches the raw
/// command line again.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub memory_size: u64,
    pub hart_count: u32,
    pub rv32: bool,
    pub kernel_path: Option<PathBuf>,
    pub dtb_path: Option<PathBuf>,
    pub dumpdtb_path: Option<PathBuf>,
    pub storage: Vec<StorageDevice>,
    pub serial: Vec<SerialBackend>,
    pub framebuffer_resolution: Option<(u32, u32)>,
    pub cmdline: Option<String>,
    pub append_cmdline: bool,
    pub nogui: bool,
    pub nonet: bool,
    pub noisolation: bool,
    pub nojit: bool,
    pub gdbstub: Option<String>,
    pub count_instructions: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            hart_count: 1,
            rv32: false,
            kernel_path: None,
            dtb_path: None,
            dumpdtb_path: None,
            storage: Vec::new(),
            serial: Vec::new(),
            framebuffer_resolution: None,
            cmdline: None,
            append_cmdline: false,
            nogui: false,
            nonet: false,
            noisolation: false,
            nojit: false,
            gdbstub: None,
            count_instructions: false,
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> MachineResult<()> {
        if self.hart_count == 0 {
            return Err(MachineError::ZeroHarts);
        }
        Ok(())
    }

    pub fn memory_base(&self) -> u64 {
        DEFAULT_MEMORY_BASE
    }

    pub fn boot_pc(&self) -> u64 {
        DEFAULT_BOOT_PC
    }

    pub fn dtb_addr(&self) -> u64 {
        self.memory_base() + DEFAULT_DTB_OFFSET
    }
}

/// Parses a memory-size argument per the CLI table: a plain integer byte
/// count or one suffixed with `K`/`M`/`G` (case-insensitive) for
/// kibi/mebi/gibibytes.
pub fn parse_memory_size(text: &str) -> MachineResult<u64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(MachineError::InvalidMemorySize(text.to_string()));
    }
    let (digits, multiplier) = match trimmed.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&trimmed[..trimmed.len() - 1], 1024u64),
        'M' => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        'G' => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| MachineError::InvalidMemorySize(text.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| MachineError::InvalidMemorySize(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_byte_count() {
        assert_eq!(parse_memory_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_suffixed_sizes_case_insensitively() {
        assert_eq!(parse_memory_size("256M").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("4k").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_size("banana").is_err());
        assert!(parse_memory_size("").is_err());
    }

    #[test]
    fn validate_rejects_zero_harts() {
        let mut cfg = MachineConfig::default();
        cfg.hart_count = 0;
        assert!(cfg.validate().is_err());
    }
}
