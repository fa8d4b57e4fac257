use crate::address::logical_to_physical;
use crate::btrfs::{csum_data, sb_to_bytes, FsInfo};
use crate::error::{FsckError, Result};
use crate::extent_buffer::{EbRef, ExtentBuffer};
use crate::structures::*;

use log::debug;

/// Tree block reads go through the block cache; a miss tries every mirror
/// in turn and only accepts a copy whose checksum, bytenr and fsid all
/// agree with where we found it.
pub fn read_tree_block(fs: &FsInfo, bytenr: u64) -> Result<EbRef> {
    if let Some(eb) = fs.block_cache.borrow().get(&bytenr) {
        return Ok(eb.clone());
    }

    let nodesize = fs.nodesize as usize;
    let mirrors = logical_to_physical(fs, bytenr)?;
    for (dev, physical) in mirrors {
        let mut buf = vec![0_u8; nodesize];
        if dev.store.read_at(physical, &mut buf).is_err() {
            continue;
        }
        if !tree_block_ok(fs, &buf, bytenr) {
            debug!("bad copy of block {bytenr} on devid {}", dev.devid);
            continue;
        }
        let eb = ExtentBuffer::new(bytenr, buf);
        fs.block_cache.borrow_mut().insert(bytenr, eb.clone());
        return Ok(eb);
    }
    Err(FsckError::IoBadBlock(bytenr))
}

fn tree_block_ok(fs: &FsInfo, buf: &[u8], bytenr: u64) -> bool {
    let stored_bytenr = u64::from_le_bytes(buf[48..56].try_into().unwrap());
    if stored_bytenr != bytenr {
        return false;
    }
    if buf[32..32 + BTRFS_FSID_SIZE] != fs.fsid {
        return false;
    }
    let csum = csum_data(&buf[BTRFS_CSUM_SIZE..], fs.csum_type);
    csum == buf[0..BTRFS_CSUM_SIZE]
}

/// the data already sits in the page cache courtesy of the mapping, so a
/// hint is all this is
pub fn readahead_tree_block(fs: &FsInfo, bytenr: u64, size: u64) {
    let _ = (fs, bytenr, size);
    debug!("readahead {bytenr} size {size}");
}

/// allocate a fresh in-memory block at `bytenr` and enter it into the
/// cache; contents are the caller's problem
pub fn alloc_tree_block_buffer(fs: &FsInfo, bytenr: u64) -> EbRef {
    let eb = ExtentBuffer::zeroed(bytenr, fs.nodesize as usize);
    fs.block_cache.borrow_mut().insert(bytenr, eb.clone());
    eb
}

pub fn drop_cached_block(fs: &FsInfo, bytenr: u64) {
    fs.block_cache.borrow_mut().remove(&bytenr);
}

/// re-checksum and write one block to every mirror
pub fn write_tree_block(fs: &FsInfo, eb: &EbRef) -> Result<()> {
    let csum = {
        let data = eb.data_clone();
        csum_data(&data[BTRFS_CSUM_SIZE..], fs.csum_type)
    };
    eb.write_bytes(0, &csum);

    let data = eb.data_clone();
    for (dev, physical) in logical_to_physical(fs, eb.start)? {
        dev.store.write_at(physical, &data)?;
    }
    eb.clear_dirty();
    Ok(())
}

/// flush every dirty cached block, lowest address first
pub fn write_dirty_blocks(fs: &FsInfo) -> Result<()> {
    let mut dirty: Vec<EbRef> = fs
        .block_cache
        .borrow()
        .values()
        .filter(|eb| eb.is_dirty())
        .cloned()
        .collect();
    dirty.sort_by_key(|eb| eb.start);
    for eb in dirty {
        write_tree_block(fs, &eb)?;
    }
    Ok(())
}

/// rewrite the superblock on every device, on every mirror offset the
/// device is large enough to hold
pub fn write_super(fs: &FsInfo) -> Result<()> {
    let mut sb = *fs.sb.borrow();
    sb.generation = fs.generation.get();
    sb.bytes_used = fs.bytes_used.get();
    {
        let tree_root = fs.tree_root();
        sb.root = tree_root.node().start;
        sb.root_level = tree_root.node().level();
        let chunk_root = fs.chunk_root();
        sb.chunk_root = chunk_root.node().start;
        sb.chunk_root_level = chunk_root.node().level();
    }

    for dev in fs.devid_map.values() {
        for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
            let offset = btrfs_sb_offset(mirror);
            if offset + BTRFS_SUPER_INFO_SIZE as u64 > dev.store.byte_len() {
                continue;
            }
            sb.bytenr = offset;
            let mut bytes = sb_to_bytes(&sb);
            let csum = csum_data(&bytes[BTRFS_CSUM_SIZE..], fs.csum_type);
            bytes[0..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
            dev.store.write_at(offset, &bytes)?;
        }
    }
    *fs.sb.borrow_mut() = sb;
    Ok(())
}
