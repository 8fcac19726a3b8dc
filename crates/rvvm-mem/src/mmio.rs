//! MMIO dispatch: locating the containing region and widening/splitting an
//! access to fit the device's supported operation sizes.

use crate::error::{MemError, MemResult};
use crate::map::PhysicalMap;
use crate::region::RegionKind;

/// Read `width` (1, 2, 4, or 8) bytes at `addr` from whichever region
/// contains it, returning the bytes in little-endian order.
pub fn read(map: &PhysicalMap, addr: u64, width: u8) -> MemResult<u64> {
    let region = map
        .find(addr, width as u64)
        .ok_or(MemError::Unmapped { addr, width })?;
    let offset = addr - region.base;

    match &region.kind {
        RegionKind::Ram { data } => {
            let data = data.read();
            let mut buf = [0u8; 8];
            buf[..width as usize].copy_from_slice(&data[offset as usize..offset as usize + width as usize]);
            Ok(u64::from_le_bytes(buf))
        }
        RegionKind::Mmio {
            device,
            min_op_size,
            max_op_size,
            fast_path,
        } => {
            if let Some(fp) = fast_path {
                let slice = fp.as_slice();
                let start = offset as usize;
                if start + width as usize <= slice.len() {
                    let mut buf = [0u8; 8];
                    buf[..width as usize].copy_from_slice(&slice[start..start + width as usize]);
                    return Ok(u64::from_le_bytes(buf));
                }
            }
            read_dispatch(device.as_ref(), offset, width, *min_op_size, *max_op_size)
        }
    }
}

/// Write `width` (1, 2, 4, or 8) little-endian bytes of `value` at `addr`.
pub fn write(map: &PhysicalMap, addr: u64, width: u8, value: u64) -> MemResult<()> {
    let region = map
        .find(addr, width as u64)
        .ok_or(MemError::Unmapped { addr, width })?;
    let offset = addr - region.base;

    match &region.kind {
        RegionKind::Ram { data } => {
            let mut data = data.write();
            let bytes = value.to_le_bytes();
            data[offset as usize..offset as usize + width as usize]
                .copy_from_slice(&bytes[..width as usize]);
            Ok(())
        }
        RegionKind::Mmio {
            device,
            min_op_size,
            max_op_size,
            fast_path,
        } => {
            if let Some(fp) = fast_path {
                let slice = fp.as_mut_slice();
                let start = offset as usize;
                if start + width as usize <= slice.len() {
                    let bytes = value.to_le_bytes();
                    slice[start..start + width as usize].copy_from_slice(&bytes[..width as usize]);
                    return Ok(());
                }
            }
            write_dispatch(device.as_ref(), offset, width, value, *min_op_size, *max_op_size)
        }
    }
}

/// Dispatch a read of `width` bytes to a device whose supported operation
/// range is `[min_op, max_op]`.
///
/// - `width` inside `[min_op, max_op]`: one direct callback invocation.
/// - `width < min_op` (narrower than the device wants): widen to `min_op`
///   via one callback call and extract the requested bytes locally — the
///   device never sees an access smaller than it declared.
/// - `width > max_op` (wider than the device wants): split into
///   `width / max_op` independent calls of `max_op` bytes each.
fn read_dispatch(
    device: &(dyn crate::region::MmioDevice),
    offset: u64,
    width: u8,
    min_op: u8,
    max_op: u8,
) -> MemResult<u64> {
    if width >= min_op && width <= max_op {
        let mut buf = [0u8; 8];
        if !device.read(offset, &mut buf[..width as usize]) {
            return Err(MemError::DeviceRejected { offset });
        }
        return Ok(u64::from_le_bytes(buf));
    }

    if width < min_op {
        let mut buf = [0u8; 8];
        if !device.read(offset, &mut buf[..min_op as usize]) {
            return Err(MemError::DeviceRejected { offset });
        }
        let full = u64::from_le_bytes(buf);
        let mask = if width == 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };
        return Ok(full & mask);
    }

    // width > max_op: split into max_op-sized chunks, little-endian order.
    if width % max_op != 0 {
        return Err(MemError::WidthOutOfRange { width, min: min_op, max: max_op });
    }
    let mut result = 0u64;
    let chunks = width / max_op;
    for i in 0..chunks {
        let mut buf = [0u8; 8];
        if !device.read(offset + (i * max_op) as u64, &mut buf[..max_op as usize]) {
            return Err(MemError::DeviceRejected { offset: offset + (i * max_op) as u64 });
        }
        let chunk = u64::from_le_bytes(buf);
        result |= chunk << (i * max_op * 8);
    }
    Ok(result)
}

fn write_dispatch(
    device: &(dyn crate::region::MmioDevice),
    offset: u64,
    width: u8,
    value: u64,
    min_op: u8,
    max_op: u8,
) -> MemResult<()> {
    if width >= min_op && width <= max_op {
        let bytes = value.to_le_bytes();
        if !device.write(offset, &bytes[..width as usize]) {
            return Err(MemError::DeviceRejected { offset });
        }
        return Ok(());
    }

    if width < min_op {
        // Read-modify-write: fetch the device's min_op-sized register,
        // splice in the narrower write, and write the whole thing back.
        let mut buf = [0u8; 8];
        if !device.read(offset, &mut buf[..min_op as usize]) {
            return Err(MemError::DeviceRejected { offset });
        }
        let bytes = value.to_le_bytes();
        buf[..width as usize].copy_from_slice(&bytes[..width as usize]);
        if !device.write(offset, &buf[..min_op as usize]) {
            return Err(MemError::DeviceRejected { offset });
        }
        return Ok(());
    }

    if width % max_op != 0 {
        return Err(MemError::WidthOutOfRange { width, min: min_op, max: max_op });
    }
    let chunks = width / max_op;
    for i in 0..chunks {
        let chunk = (value >> (i * max_op * 8))
            & if max_op == 8 { u64::MAX } else { (1u64 << (max_op * 8)) - 1 };
        let bytes = chunk.to_le_bytes();
        if !device.write(offset + (i * max_op) as u64, &bytes[..max_op as usize]) {
            return Err(MemError::DeviceRejected { offset: offset + (i * max_op) as u64 });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{MmioDevice, Region};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FakeReg {
        storage: Mutex<[u8; 4]>,
    }

    impl MmioDevice for FakeReg {
        fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
            let storage = self.storage.lock();
            let start = offset as usize;
            if start + buf.len() > storage.len() {
                return false;
            }
            buf.copy_from_slice(&storage[start..start + buf.len()]);
            true
        }

        fn write(&self, offset: u64, buf: &[u8]) -> bool {
            let mut storage = self.storage.lock();
            let start = offset as usize;
            if start + buf.len() > storage.len() {
                return false;
            }
            storage[start..start + buf.len()].copy_from_slice(buf);
            true
        }
    }

    #[test]
    fn word_write_then_word_read_roundtrips() {
        let map = PhysicalMap::new();
        let dev = Arc::new(FakeReg { storage: Mutex::new([0; 4]) });
        map.attach(Region::mmio(0x1000, 4, dev, 1, 4)).unwrap();
        write(&map, 0x1000, 4, 0xdead_beef).unwrap();
        assert_eq!(read(&map, 0x1000, 4).unwrap(), 0xdead_beef);
    }

    #[test]
    fn byte_write_is_read_modify_write_on_min4_register() {
        let map = PhysicalMap::new();
        let dev = Arc::new(FakeReg { storage: Mutex::new([0; 4]) });
        map.attach(Region::mmio(0x2000, 4, dev, 4, 4)).unwrap();
        write(&map, 0x2000, 4, 0xffff_ffff).unwrap();
        write(&map, 0x2000, 1, 0x00).unwrap();
        assert_eq!(read(&map, 0x2000, 4).unwrap(), 0xffff_ff00);
    }

    #[test]
    fn wide_read_splits_into_max_op_chunks() {
        let map = PhysicalMap::new();
        // Device only supports 1-byte ops but the guest issues a 4-byte read.
        struct ByteDev {
            bytes: Mutex<[u8; 4]>,
        }
        impl MmioDevice for ByteDev {
            fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
                buf[0] = self.bytes.lock()[offset as usize];
                true
            }
            fn write(&self, offset: u64, buf: &[u8]) -> bool {
                self.bytes.lock()[offset as usize] = buf[0];
                true
            }
        }
        let dev = Arc::new(ByteDev { bytes: Mutex::new([1, 2, 3, 4]) });
        map.attach(Region::mmio(0x3000, 4, dev, 1, 1)).unwrap();
        assert_eq!(read(&map, 0x3000, 4).unwrap(), 0x0403_0201);
    }

    #[test]
    fn unmapped_address_is_rejected() {
        let map = PhysicalMap::new();
        assert_eq!(
            read(&map, 0x5000, 4).unwrap_err(),
            MemError::Unmapped { addr: 0x5000, width: 4 }
        );
    }
}
