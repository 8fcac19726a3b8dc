//! Device-tree blob loading.
//!
//! The device-tree *serializer* is an external collaborator (§1's
//! out-of-scope list): this module never builds a guest-meaningful tree
//! from device descriptions. It only validates and copies a caller-supplied
//! FDT byte blob into guest RAM at the boot convention's `a1` pointer, and
//! — when the caller gave none — writes a minimal, structurally valid but
//! otherwise empty fallback tree so a guest that unconditionally reads its
//! boot DTB pointer doesn't fault.
//!
//! Per §6, this platform's wire format is the canonical flat-tree header
//! and string block encoded little-endian (not the upstream big-endian
//! convention real hardware uses).

use rvvm_mem::PhysicalMap;

use crate::error::{MachineError, MachineResult};

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_END: u32 = 9;
const FDT_HEADER_SIZE: u64 = 40;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Validates a caller-supplied DTB's header (magic number, declared total
/// size matching the slice) and copies it into RAM at `dtb_addr`.
pub fn load_blob(map: &PhysicalMap, dtb_addr: u64, blob: &[u8]) -> MachineResult<()> {
    if blob.len() < FDT_HEADER_SIZE as usize {
        return Err(MachineError::MalformedDtb("blob shorter than the flat-tree header"));
    }
    let magic = u32::from_le_bytes(blob[0..4].try_into().unwrap());
    if magic != FDT_MAGIC {
        return Err(MachineError::MalformedDtb("bad magic number"));
    }
    let total_size = u32::from_le_bytes(blob[4..8].try_into().unwrap()) as usize;
    if total_size != blob.len() {
        return Err(MachineError::MalformedDtb("totalsize field does not match blob length"));
    }
    write_blob(map, dtb_addr, blob)
}

/// Builds and loads a minimal fallback tree: a root node with no
/// properties. Used when the caller supplies neither `--dtb` nor a kernel
/// image embedding its own, so that a guest unconditionally dereferencing
/// its boot DTB pointer sees a well-formed (if empty) tree rather than
/// garbage.
pub fn load_fallback(map: &PhysicalMap, dtb_addr: u64) -> MachineResult<Vec<u8>> {
    let mut struct_block = Vec::new();
    struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_le_bytes());
    struct_block.push(0); // the root node's unit name is the empty string.
    pad4(&mut struct_block);
    struct_block.extend_from_slice(&FDT_END_NODE.to_le_bytes());
    struct_block.extend_from_slice(&FDT_END.to_le_bytes());

    let off_mem_rsvmap = FDT_HEADER_SIZE;
    let off_dt_struct = off_mem_rsvmap + 16; // one zeroed reservation-list terminator entry.
    let off_dt_strings = off_dt_struct + struct_block.len() as u64;
    let total_size = off_dt_strings; // the strings block is empty: no named properties.

    let mut blob = Vec::with_capacity(total_size as usize);
    blob.extend_from_slice(&FDT_MAGIC.to_le_bytes());
    blob.extend_from_slice(&(total_size as u32).to_le_bytes());
    blob.extend_from_slice(&(off_dt_struct as u32).to_le_bytes());
    blob.extend_from_slice(&(off_dt_strings as u32).to_le_bytes());
    blob.extend_from_slice(&(off_mem_rsvmap as u32).to_le_bytes());
    blob.extend_from_slice(&FDT_VERSION.to_le_bytes());
    blob.extend_from_slice(&FDT_LAST_COMP_VERSION.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes()); // boot_cpuid_phys
    blob.extend_from_slice(&0u32.to_le_bytes()); // size_dt_strings
    blob.extend_from_slice(&(struct_block.len() as u32).to_le_bytes());
    blob.extend_from_slice(&[0u8; 16]); // the single reservation-map terminator entry.
    blob.extend_from_slice(&struct_block);

    write_blob(map, dtb_addr, &blob)?;
    Ok(blob)
}

fn write_blob(map: &PhysicalMap, addr: u64, blob: &[u8]) -> MachineResult<()> {
    let dma = map
        .dma_ptr(addr, blob.len() as u64)
        .ok_or(MachineError::DtbTooLarge(blob.len()))?;
    dma.write_from(blob);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvvm_mem::Region;
    use std::sync::Arc;

    fn ram() -> Arc<PhysicalMap> {
        let map = Arc::new(PhysicalMap::new());
        map.attach(Region::ram(0x8000_0000, 0x10_0000)).unwrap();
        map
    }

    #[test]
    fn fallback_tree_round_trips_through_ram() {
        let map = ram();
        let blob = load_fallback(&map, 0x8000_1000).unwrap();
        let dma = map.dma_ptr(0x8000_1000, blob.len() as u64).unwrap();
        let mut out = vec![0u8; blob.len()];
        dma.read_to(&mut out);
        assert_eq!(out, blob);
    }

    #[test]
    fn load_blob_rejects_bad_magic() {
        let map = ram();
        let mut blob = vec![0u8; FDT_HEADER_SIZE as usize];
        blob[4..8].copy_from_slice(&(blob.len() as u32).to_le_bytes());
        assert!(load_blob(&map, 0x8000_1000, &blob).is_err());
    }

    #[test]
    fn load_blob_accepts_a_fallback_tree_it_produced() {
        let map = ram();
        let blob = load_fallback(&map, 0x8000_1000).unwrap();
        assert!(load_blob(&map, 0x8000_2000, &blob).is_ok());
    }
}
