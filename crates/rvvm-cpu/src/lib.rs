//! Hart execution loop (component F) and translation cache (component A):
//! register files, CSRs, trap dispatch, the software TLB, and the
//! interpreter/JIT boundary a hart's worker thread drives.

pub mod csr;
pub mod exec;
pub mod hart;
pub mod regfile;
pub mod tlb;
pub mod trap;

pub use exec::{interpreter::Interpreter, ExecutionBackend, JitBackend, NoJit, StepOutcome};
pub use hart::{Hart, HartControl};
pub use tlb::{AccessKind, TranslationCache};
pub use trap::{Exception, Interrupt, Privilege, Trap};
