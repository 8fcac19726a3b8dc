//! Cross-crate integration scenarios spanning `rvvm-cpu`, `rvvm-intc`, and
//! `rvvm-mem`: a hart's worker thread actually spawned, actually sleeping on
//! WFI, and actually woken by the local interruptor's timer — the kind of
//! scenario a single crate's unit tests can't exercise because it needs the
//! real worker-thread/condvar handoff between `Hart` and `HartControl`.

use std::sync::Arc;
use std::time::Duration;

use rvvm_cpu::{csr, ExecutionBackend, Hart, Interpreter, Interrupt, NoJit};
use rvvm_intc::{LocalInterruptor, WallClock};
use rvvm_mem::{PhysicalMap, Region};

const WFI: u32 = 0x1050_0073;
/// `jal x0, 0`: an infinite self-loop, used as the trap vector so the hart
/// has somewhere stable to sit once the trap is taken.
const JAL_SELF: u32 = 0x0000_006F;

fn store_word(map: &PhysicalMap, addr: u64, word: u32) {
    rvvm_mem::mmio::write(map, addr, 4, word as u64).unwrap();
}

/// Scenario 5 (timer interrupt): setting timer-compare to current timer +
/// a small delta, then executing WFI, wakes the hart and delivers the
/// standard M-mode timer trap within the expected window.
#[test]
fn timer_interrupt_wakes_hart_from_wfi() {
    let map = Arc::new(PhysicalMap::new());
    map.attach(Region::ram(0, 0x10000)).unwrap();
    store_word(&map, 0, WFI);
    store_word(&map, 0x100, JAL_SELF);

    let clock = Arc::new(WallClock::new());
    let interruptor = Arc::new(LocalInterruptor::new(clock.clone()));
    let mut hart = Hart::new(0, false, 0, 0x2000, map, interruptor.clone());

    hart.csrs.write(csr::MTVEC, 0x100);
    hart.csrs.write(csr::MIE, csr::MTIP_BIT);
    hart.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_MIE, 1);
    interruptor.set_timecmp(clock.now() + 5);

    let control = hart.control();
    let handle = hart.spawn(Interpreter::default(), NoJit);

    // Give the worker a chance to retire WFI and park, then cross the
    // timer-compare value the way a device posting a deadline would.
    std::thread::sleep(Duration::from_millis(5));
    clock.advance(10);
    std::thread::sleep(Duration::from_millis(20));

    control.request_shutdown();
    let hart = handle.join().unwrap();

    assert_eq!(hart.pc, 0x100, "trap vector was not reached within the expected window");
    assert_eq!(hart.csrs.read(csr::MCAUSE), Interrupt::MachineTimer.cause());
    // WFI retires (advancing pc past itself) before the hart parks, so the
    // interrupt taken afterward saves that already-advanced pc as mepc.
    assert_eq!(hart.csrs.read(csr::MEPC), 4);
}

/// Stands in for scenario 1's firmware (writing a known byte to a
/// memory-mapped sink) using a fake sink device in place of the
/// out-of-scope UART model, to exercise the hart's store path through
/// `PhysicalMap`/MMIO dispatch end to end.
#[test]
fn guest_store_reaches_mmio_sink_device() {
    use parking_lot::Mutex;
    use rvvm_mem::MmioDevice;

    struct Sink {
        last_byte: Mutex<Option<u8>>,
    }
    impl MmioDevice for Sink {
        fn read(&self, _offset: u64, buf: &mut [u8]) -> bool {
            buf.fill(0);
            true
        }
        fn write(&self, _offset: u64, buf: &[u8]) -> bool {
            *self.last_byte.lock() = Some(buf[0]);
            true
        }
    }

    let map = Arc::new(PhysicalMap::new());
    map.attach(Region::ram(0, 0x1000)).unwrap();
    let sink = Arc::new(Sink { last_byte: Mutex::new(None) });
    map.attach(Region::mmio(0x1000_0000, 0x1000, sink.clone(), 1, 1)).unwrap();

    // addi x1, x0, 0x42
    store_word(&map, 0, 0x0420_0093);
    // sb x1, 0(x2)
    let sb_x1_at_x2 = (1 << 20) | (2 << 15) | 0x23;
    store_word(&map, 4, sb_x1_at_x2);

    let interruptor = Arc::new(LocalInterruptor::new(Arc::new(WallClock::new())));
    let mut hart = Hart::new(0, false, 0, 0x2000, map.clone(), interruptor);
    hart.int_regs.write(2, 0x1000_0000);

    let mut interpreter = Interpreter::default();
    interpreter.step(&mut hart).unwrap();
    interpreter.step(&mut hart).unwrap();

    assert_eq!(*sink.last_byte.lock(), Some(0x42));
}
