use crate::btrfs::*;
use crate::disk_io::read_tree_block;
use crate::error::{FsckError, Result as FsckResult};
use crate::structures::*;

use anyhow::Result;
use log::debug;
use std::rc::Rc;

/// Translation between the logical address space every tree pointer uses
/// and physical device offsets. Chunks come from the superblock's system
/// array first (enough to read the chunk tree) and then from the chunk
/// tree itself.

/// every present mirror of a logical range; the range must not straddle a
/// chunk boundary
pub fn logical_to_physical(fs: &FsInfo, logical: u64) -> FsckResult<Vec<(Rc<DeviceInfo>, u64)>> {
    let chunks = fs.chunks.borrow();
    let (start, length, chunk) = chunks.find(logical, 1).ok_or(FsckError::NoChunk(logical))?;
    debug_assert!(logical >= start && logical < start + length);

    let mut out = Vec::new();
    for stripe in &chunk.stripes {
        if let Some(dev) = fs.devid_map.get(&stripe.devid) {
            out.push((Rc::clone(dev), logical - start + stripe.offset));
        }
    }
    if out.is_empty() {
        return Err(FsckError::NoChunk(logical));
    }
    Ok(out)
}

/// true when [start, start + len) intersects a superblock copy on any
/// stripe backing it
pub fn intersects_super_stripe(fs: &FsInfo, start: u64, len: u64) -> bool {
    let chunks = fs.chunks.borrow();
    let Some((cstart, _, chunk)) = chunks.find(start, len.max(1)) else {
        return false;
    };
    for stripe in &chunk.stripes {
        for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
            let sb = btrfs_sb_offset(mirror);
            let phys = start - cstart + stripe.offset;
            if sb + BTRFS_SUPER_INFO_SIZE as u64 > phys && sb < phys + len {
                return true;
            }
        }
    }
    false
}

/// descend the chunk tree, populating the chunk map beyond what the
/// system array bootstrapped
pub fn read_chunk_tree(fs: &FsInfo) -> Result<()> {
    let chunk_root = fs.sb.borrow().chunk_root;
    read_chunk_block(fs, chunk_root)?;
    Ok(())
}

fn read_chunk_block(fs: &FsInfo, bytenr: u64) -> Result<()> {
    let eb = read_tree_block(fs, bytenr)?;
    let nritems = eb.nritems() as usize;
    if eb.is_leaf() {
        for slot in 0..nritems {
            let key = eb.item_key(slot);
            if key.item_type != BTRFS_CHUNK_ITEM_KEY {
                continue;
            }
            let data = eb.item_data(slot);
            let mut ci = parse_chunk(key.offset, &data);
            let stripe_bytes = std::mem::size_of::<btrfs_stripe>();
            assert_eq!(
                data.len(),
                std::mem::size_of::<btrfs_chunk>() + ci.num_stripes as usize * stripe_bytes
            );
            for i in 0..ci.num_stripes as usize {
                let off = std::mem::size_of::<btrfs_chunk>() + i * stripe_bytes;
                ci.stripes.push(parse_stripe(&data[off..]));
            }
            debug!(
                "chunk {} len {} stripes {}",
                ci.start, ci.length, ci.num_stripes
            );
            let (start, length) = (ci.start, ci.length);
            let mut chunks = fs.chunks.borrow_mut();
            if chunks.find(start, length).is_none() {
                chunks.insert(start, length, ci).ok();
            }
        }
    } else {
        for slot in 0..nritems {
            read_chunk_block(fs, eb.node_blockptr(slot))?;
        }
    }
    Ok(())
}
