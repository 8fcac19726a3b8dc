//! Error types for the rvvm-machine crate.

use thiserror::Error;

/// Configuration and lifecycle errors the orchestrator's own operations can
/// fail with. Per the engine's error-handling policy, these are always
/// surfaced through a `Result` at the call site, never thrown — resource
/// exhaustion inside the process is the support layer's business (it
/// aborts), and guest-visible faults never reach this type at all.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid memory size {0:?}: expected a number with an optional K/M/G suffix")]
    InvalidMemorySize(String),

    #[error("hart count must be at least 1")]
    ZeroHarts,

    #[error("hart index {0} is out of range")]
    UnknownHart(usize),

    #[error("failed to read {path}: {source}")]
    FirmwareIo { path: String, #[source] source: std::io::Error },

    #[error("device tree blob is malformed: {0}")]
    MalformedDtb(&'static str),

    #[error("device tree blob of {0} bytes does not fit before the end of RAM")]
    DtbTooLarge(usize),

    #[error("image {path:?} ({len} bytes) does not fit entirely inside RAM at its load address")]
    ImageTooLarge { path: String, len: usize },

    #[error(transparent)]
    Memory(#[from] rvvm_mem::MemError),

    #[error(transparent)]
    Pci(#[from] rvvm_pci::PciError),
}

pub type MachineResult<T> = Result<T, MachineError>;
