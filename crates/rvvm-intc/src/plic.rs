//! Platform-level wired IRQ aggregator: a PLIC-shaped priority router from
//! many device IRQ sources to many harts.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::bits::{MEIP_BIT, SEIP_BIT};
use crate::InterruptTarget;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrqError {
    #[error("IRQ source {0} was never allocated")]
    UnknownSource(u32),
    #[error("hart index {0} is out of range")]
    UnknownHart(usize),
}

struct State {
    next_source: u32,
    priority: Vec<u32>,
    /// Level sources currently asserted by their device.
    asserted: BTreeSet<u32>,
    /// Edge sources that fired since their last claim.
    edge_fired: BTreeSet<u32>,
    /// Sources currently claimed (masked until `complete`).
    in_service: BTreeSet<u32>,
    enable: Vec<BTreeSet<u32>>,
    threshold: Vec<u32>,
}

/// Whether mode the hart should receive the external-interrupt bit in:
/// machine-mode (`MEIP`) or supervisor-mode (`SEIP`) delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Machine,
    Supervisor,
}

/// A PLIC-shaped router from device-raised IRQ sources to enabled, routed
/// harts, honoring per-hart priority thresholds.
pub struct IrqAggregator {
    state: Mutex<State>,
    targets: Vec<(Arc<dyn InterruptTarget>, DeliveryMode)>,
}

impl IrqAggregator {
    pub fn new(targets: Vec<(Arc<dyn InterruptTarget>, DeliveryMode)>) -> Self {
        let hart_count = targets.len();
        Self {
            state: Mutex::new(State {
                next_source: 1, // source 0 means "no interrupt" per the PLIC convention.
                priority: vec![0; 1],
                asserted: BTreeSet::new(),
                edge_fired: BTreeSet::new(),
                in_service: BTreeSet::new(),
                enable: vec![BTreeSet::new(); hart_count],
                threshold: vec![0; hart_count],
            }),
            targets,
        }
    }

    /// Allocate a fresh IRQ source id.
    pub fn alloc_source(&self) -> u32 {
        let mut state = self.state.lock();
        let id = state.next_source;
        state.next_source += 1;
        state.priority.push(1);
        id
    }

    pub fn set_priority(&self, source: u32, priority: u32) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        let slot = state
            .priority
            .get_mut(source as usize)
            .ok_or(IrqError::UnknownSource(source))?;
        *slot = priority;
        Ok(())
    }

    pub fn set_enabled(&self, hart: usize, source: u32, enabled: bool) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        if source as usize >= state.priority.len() {
            return Err(IrqError::UnknownSource(source));
        }
        let set = state.enable.get_mut(hart).ok_or(IrqError::UnknownHart(hart))?;
        if enabled {
            set.insert(source);
        } else {
            set.remove(&source);
        }
        Ok(())
    }

    pub fn set_threshold(&self, hart: usize, threshold: u32) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        let slot = state.threshold.get_mut(hart).ok_or(IrqError::UnknownHart(hart))?;
        *slot = threshold;
        Ok(())
    }

    /// Assert a level-triggered source. Stays pending until the source is
    /// explicitly lowered, even across claim/complete cycles.
    pub fn raise(&self, source: u32) -> Result<(), IrqError> {
        {
            let mut state = self.state.lock();
            if source as usize >= state.priority.len() {
                return Err(IrqError::UnknownSource(source));
            }
            state.asserted.insert(source);
        }
        self.dispatch();
        Ok(())
    }

    /// Deassert a level-triggered source.
    pub fn lower(&self, source: u32) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        if source as usize >= state.priority.len() {
            return Err(IrqError::UnknownSource(source));
        }
        state.asserted.remove(&source);
        Ok(())
    }

    /// Fire an edge-triggered source once.
    pub fn pulse(&self, source: u32) -> Result<(), IrqError> {
        {
            let mut state = self.state.lock();
            if source as usize >= state.priority.len() {
                return Err(IrqError::UnknownSource(source));
            }
            state.edge_fired.insert(source);
        }
        self.dispatch();
        Ok(())
    }

    /// The highest-priority pending, enabled, above-threshold source for
    /// `hart`, masking it until [`Self::complete`] is called.
    pub fn claim(&self, hart: usize) -> Result<Option<u32>, IrqError> {
        let mut state = self.state.lock();
        if hart >= state.enable.len() {
            return Err(IrqError::UnknownHart(hart));
        }
        let threshold = state.threshold[hart];
        let best = state
            .enable[hart]
            .iter()
            .copied()
            .filter(|s| !state.in_service.contains(s))
            .filter(|s| state.asserted.contains(s) || state.edge_fired.contains(s))
            .filter(|s| state.priority[*s as usize] > threshold)
            .max_by_key(|s| state.priority[*s as usize]);

        if let Some(source) = best {
            state.in_service.insert(source);
            state.edge_fired.remove(&source);
            Ok(Some(source))
        } else {
            Ok(None)
        }
    }

    /// Acknowledge completion of servicing `source` on `hart`. If the
    /// source is level-triggered and still asserted, it becomes eligible
    /// for claim again immediately.
    pub fn complete(&self, hart: usize, source: u32) -> Result<(), IrqError> {
        {
            let mut state = self.state.lock();
            if hart >= state.enable.len() {
                return Err(IrqError::UnknownHart(hart));
            }
            state.in_service.remove(&source);
        }
        self.dispatch();
        Ok(())
    }

    /// Re-evaluate pending state and raise/lower the external-interrupt bit
    /// on every hart that has an eligible source.
    fn dispatch(&self) {
        let state = self.state.lock();
        for (hart, (target, mode)) in self.targets.iter().enumerate() {
            let threshold = state.threshold[hart];
            let has_pending = state.enable[hart].iter().any(|s| {
                !state.in_service.contains(s)
                    && (state.asserted.contains(s) || state.edge_fired.contains(s))
                    && state.priority[*s as usize] > threshold
            });
            let bit = match mode {
                DeliveryMode::Machine => MEIP_BIT,
                DeliveryMode::Supervisor => SEIP_BIT,
            };
            if has_pending {
                target.raise(bit);
            } else {
                target.lower(bit);
            }
        }
    }
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

    fn aggregator_with_one_hart() -> (Arc<RecordingTarget>, IrqAggregator) {
        let target = Arc::new(RecordingTarget(AtomicU64::new(0)));
        let agg = IrqAggregator::new(vec![(target.clone(), DeliveryMode::Machine)]);
        (target, agg)
    }

    #[test]
    fn claim_returns_highest_priority_pending_source() {
        let (_t, agg) = aggregator_with_one_hart();
        let low = agg.alloc_source();
        let high = agg.alloc_source();
        agg.set_priority(low, 1).unwrap();
        agg.set_priority(high, 7).unwrap();
        agg.set_enabled(0, low, true).unwrap();
        agg.set_enabled(0, high, true).unwrap();
        agg.raise(low).unwrap();
        agg.raise(high).unwrap();
        assert_eq!(agg.claim(0).unwrap(), Some(high));
    }

    #[test]
    fn claim_masks_until_complete() {
        let (_t, agg) = aggregator_with_one_hart();
        let source = agg.alloc_source();
        agg.set_priority(source, 1).unwrap();
        agg.set_enabled(0, source, true).unwrap();
        agg.raise(source).unwrap();
        assert_eq!(agg.claim(0).unwrap(), Some(source));
        assert_eq!(agg.claim(0).unwrap(), None);
        agg.complete(0, source).unwrap();
        assert_eq!(agg.claim(0).unwrap(), Some(source));
    }

    #[test]
    fn threshold_filters_low_priority_sources() {
        let (_t, agg) = aggregator_with_one_hart();
        let source = agg.alloc_source();
        agg.set_priority(source, 3).unwrap();
        agg.set_enabled(0, source, true).unwrap();
        agg.set_threshold(0, 5).unwrap();
        agg.raise(source).unwrap();
        assert_eq!(agg.claim(0).unwrap(), None);
    }

    #[test]
    fn dispatch_routes_by_device_pin_rotation_example() {
        // Scenario 4 from the testable-properties list: function at device
        // 2 pin A (pin index 0) routes to aggregator source (2+0+3)%4 = 1.
        let (target, agg) = aggregator_with_one_hart();
        for _ in 0..4 {
            agg.alloc_source();
        }
        let device = 2u32;
        let pin = 0u32;
        let lane = (device + pin + 3) % 4;
        agg.set_enabled(0, lane + 1, true).unwrap(); // +1: source 0 is reserved.
        agg.set_priority(lane + 1, 1).unwrap();
        agg.raise(lane + 1).unwrap();
        assert_eq!(target.0.load(Ordering::SeqCst) & MEIP_BIT, MEIP_BIT);
        assert_eq!(agg.claim(0).unwrap(), Some(lane + 1));
    }
}
