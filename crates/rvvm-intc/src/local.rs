//! Per-hart local interruptor: a 64-bit wall-clock timer shared by all
//! harts, a per-hart timer-compare register, and a per-hart software
//! doorbell for inter-processor interrupts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bits::{MSIP_BIT, MTIP_BIT};
use crate::InterruptTarget;

/// The machine-wide wall clock all harts read `mtime` from. Advanced by the
/// orchestrator's event loop (or a dedicated timer thread) at a fixed
/// frequency; this type itself has no notion of real time, it just counts.
#[derive(Default)]
pub struct WallClock(AtomicU64);

impl WallClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn advance(&self, ticks: u64) -> u64 {
        self.0.fetch_add(ticks, Ordering::Relaxed) + ticks
    }
}

/// One hart's timer-compare register and software-interrupt doorbell.
pub struct LocalInterruptor {
    clock: Arc<WallClock>,
    timecmp: AtomicU64,
    software_pending: AtomicBool,
}

impl LocalInterruptor {
    pub fn new(clock: Arc<WallClock>) -> Self {
        Self {
            clock,
            timecmp: AtomicU64::new(u64::MAX),
            software_pending: AtomicBool::new(false),
        }
    }

    pub fn read_time(&self) -> u64 {
        self.clock.now()
    }

    pub fn set_timecmp(&self, value: u64) {
        self.timecmp.store(value, Ordering::Relaxed);
    }

    pub fn timecmp(&self) -> u64 {
        self.timecmp.load(Ordering::Relaxed)
    }

    pub fn timer_due(&self) -> bool {
        self.read_time() >= self.timecmp.load(Ordering::Relaxed)
    }

    pub fn send_ipi(&self) {
        self.software_pending.store(true, Ordering::Release);
    }

    pub fn clear_ipi(&self) {
        self.software_pending.store(false, Ordering::Release);
    }

    pub fn ipi_pending(&self) -> bool {
        self.software_pending.load(Ordering::Acquire)
    }

    /// Called once per event-loop tick (or whenever the clock advances) to
    /// reflect timer/IPI state into the hart's pending-interrupt mask.
    pub fn poll(&self, target: &dyn InterruptTarget) {
        if self.timer_due() {
            target.raise(MTIP_BIT);
        } else {
            target.lower(MTIP_BIT);
        }
        if self.ipi_pending() {
            target.raise(MSIP_BIT);
        }
    }
}
