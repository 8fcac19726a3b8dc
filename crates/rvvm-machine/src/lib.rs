//! Machine orchestrator (component G): owns the harts and the physical
//! map, drives their shared lifecycle (create/start/pause/reset/join), the
//! boot device-tree blob, and the event loop that ticks every attached
//! device's `update` callback.

pub mod config;
pub mod dtb;
pub mod error;
mod machine;

pub use config::{MachineConfig, SerialBackend, StorageDevice, StorageKind};
pub use error::{MachineError, MachineResult};
pub use machine::Machine;
