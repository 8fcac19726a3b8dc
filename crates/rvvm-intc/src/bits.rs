//! Standard RISC-V `mip`/`mie` interrupt bit positions, shared by the local
//! interruptor, the wired aggregator, and whichever CSR file in `rvvm-cpu`
//! reads them back out of a hart's pending mask.

pub const SSIP_BIT: u64 = 1 << 1;
pub const MSIP_BIT: u64 = 1 << 3;
pub const STIP_BIT: u64 = 1 << 5;
pub const MTIP_BIT: u64 = 1 << 7;
pub const SEIP_BIT: u64 = 1 << 9;
pub const MEIP_BIT: u64 = 1 << 11;
