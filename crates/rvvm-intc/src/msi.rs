//! Message-signaled interrupts: a device posts a write of a 32-bit datum to
//! a guest-physical address instead of asserting a wired pin. The host
//! bridge (in `rvvm-pci`) recognizes writes that land in a function's MSI
//! capability's configured address and turns them into a call here, which
//! delivers straight to the target hart without going through
//! [`crate::plic::IrqAggregator`] at all.

use std::sync::Arc;

use crate::bits::MEIP_BIT;
use crate::InterruptTarget;

/// A decoded MSI posted write: the guest-physical address a device wrote
/// and the 32-bit payload it wrote there. `address`/`data` come straight
/// out of a function's MSI capability registers; nothing here interprets
/// the payload beyond treating its delivery as an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

/// Deliver `message` to `target` as a standard external-interrupt event.
///
/// Real PCI MSI payloads can carry a vector number in the low bits of
/// `data`; this host doesn't multiplex per-vector delivery; the entire
/// message resolves to one external-interrupt bit on the addressed hart.
/// A future multi-vector target can inspect `message.data` itself before
/// calling this.
pub fn deliver(target: &Arc<dyn InterruptTarget>, message: MsiMessage) {
    let _ = message.address;
    let _ = message.data;
    target.raise(MEIP_BIT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingTarget(AtomicU64);
    impl InterruptTarget for RecordingTarget {
        fn raise(&self, bit: u64) {
            self.0.fetch_or(bit, Ordering::SeqCst);
        }
        fn lower(&self, bit: u64) {
            self.0.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivery_against_concrete_target_sets_meip() {
        let target = Arc::new(RecordingTarget(AtomicU64::new(0)));
        let dyn_target: Arc<dyn InterruptTarget> = target.clone();
        deliver(&dyn_target, MsiMessage { address: 0x2000, data: 7 });
        assert_eq!(target.0.load(Ordering::SeqCst) & MEIP_BIT, MEIP_BIT);
    }
}
