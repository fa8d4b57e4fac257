use crate::address::intersects_super_stripe;
use crate::btrfs::{FreeExtentEvent, FsInfo, Root};
use crate::disk_io::{alloc_tree_block_buffer, drop_cached_block};
use crate::error::{FsckError, Result};
use crate::extent_buffer::EbRef;
use crate::structures::*;
use crate::transaction::TransHandle;
use crate::tree::{
    del_items, insert_item, next_leaf, search_slot, Path,
};

use crc::{Crc, CRC_32_ISCSI};
use log::debug;
use std::cell::Cell;
use std::rc::Rc;

/// Extent tree services: reference counting, allocation and block group
/// accounting for the engine's COW paths and for the repair pass.

#[derive(Debug)]
pub struct BlockGroupRec {
    pub flags: u64,
    pub used: Cell<u64>,
}

fn btrfs_crc32c(seed: u32, data: &[u8]) -> u32 {
    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut digest = CASTAGNOLI.digest_with_initial(seed);
    digest.update(data);
    digest.finalize()
}

/// key offset for an EXTENT_DATA_REF item
pub fn hash_extent_data_ref(root_objectid: u64, owner: u64, offset: u64) -> u64 {
    let high_crc = btrfs_crc32c(!0, &root_objectid.to_le_bytes());
    let low_crc = btrfs_crc32c(!0, &owner.to_le_bytes());
    let low_crc = btrfs_crc32c(low_crc, &offset.to_le_bytes());
    ((high_crc as u64) << 31) ^ (low_crc as u64)
}

/// load the block group items once; everything afterwards adjusts the
/// in-memory copies and writes through
pub fn ensure_block_groups(fs: &FsInfo) -> Result<()> {
    if fs.block_groups_loaded.get() {
        return Ok(());
    }
    let extent_root = fs.extent_root();
    let mut path = Path::new();
    let key = Key::new(0, 0, 0);
    search_slot(None, fs, &extent_root, &key, &mut path, 0, false)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &extent_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.item_type == BTRFS_BLOCK_GROUP_ITEM_KEY {
            let data = leaf.item_data(path.slots[0]);
            let used = u64::from_le_bytes(data[0..8].try_into().unwrap());
            let flags = u64::from_le_bytes(data[16..24].try_into().unwrap());
            fs.block_groups
                .borrow_mut()
                .insert(
                    key.objectid,
                    key.offset,
                    BlockGroupRec {
                        flags,
                        used: Cell::new(used),
                    },
                )
                .ok();
        }
        path.slots[0] += 1;
    }
    fs.block_groups_loaded.set(true);
    Ok(())
}

/// refs and flags of the extent item covering `bytenr`, if any
pub fn lookup_extent_info(fs: &FsInfo, bytenr: u64) -> Result<Option<(u64, u64)>> {
    let extent_root = fs.extent_root();
    let mut path = Path::new();
    let key = Key::new(bytenr, BTRFS_EXTENT_ITEM_KEY, 0);
    search_slot(None, fs, &extent_root, &key, &mut path, 0, false)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &extent_root, &mut path)? != 0 {
                return Ok(None);
            }
            continue;
        }
        let found = leaf.item_key(path.slots[0]);
        if found.objectid != bytenr {
            return Ok(None);
        }
        if found.item_type == BTRFS_EXTENT_ITEM_KEY
            || found.item_type == BTRFS_METADATA_ITEM_KEY
        {
            let data = leaf.item_data(path.slots[0]);
            let refs = u64::from_le_bytes(data[0..8].try_into().unwrap());
            let flags = u64::from_le_bytes(data[16..24].try_into().unwrap());
            return Ok(Some((refs, flags)));
        }
        path.slots[0] += 1;
    }
}

/// locate the extent item for `bytenr` on the write path and adjust its
/// reference count; a count dropping to zero removes the item
fn update_extent_item_refs(
    trans: &TransHandle,
    fs: &FsInfo,
    bytenr: u64,
    delta: i64,
) -> Result<u64> {
    let extent_root = fs.extent_root();
    let mut path = Path::new();
    let key = Key::new(bytenr, BTRFS_EXTENT_ITEM_KEY, 0);
    search_slot(Some(trans), fs, &extent_root, &key, &mut path, 0, true)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &extent_root, &mut path)? != 0 {
                if delta < 0 {
                    debug!("no extent item for {bytenr} while dropping a ref");
                    return Ok(0);
                }
                return Err(FsckError::Unsupported("extent item missing"));
            }
            continue;
        }
        let found = leaf.item_key(path.slots[0]);
        if found.objectid != bytenr {
            if delta < 0 {
                debug!("no extent item for {bytenr} while dropping a ref");
                return Ok(0);
            }
            return Err(FsckError::Unsupported("extent item missing"));
        }
        if found.item_type != BTRFS_EXTENT_ITEM_KEY
            && found.item_type != BTRFS_METADATA_ITEM_KEY
        {
            path.slots[0] += 1;
            continue;
        }

        let ptr = leaf.item_ptr_offset(path.slots[0]);
        let refs = leaf.read_u64(ptr);
        let new_refs = (refs as i64 + delta).max(0) as u64;
        if new_refs == 0 {
            let num_bytes = if found.item_type == BTRFS_METADATA_ITEM_KEY {
                fs.nodesize as u64
            } else {
                found.offset
            };
            let slot = path.slots[0];
            del_items(trans, fs, &extent_root, &mut path, slot, 1)?;
            update_block_group(trans, fs, bytenr, num_bytes, false)?;
        } else {
            leaf.write_u64(ptr, new_refs);
            leaf.mark_dirty();
        }
        return Ok(new_refs);
    }
}

fn ref_item_key(bytenr: u64, parent: u64, root_objectid: u64, owner: u64, offset: u64) -> Key {
    let is_data = owner >= BTRFS_FIRST_FREE_OBJECTID;
    if is_data {
        if parent > 0 {
            Key::new(bytenr, BTRFS_SHARED_DATA_REF_KEY, parent)
        } else {
            Key::new(
                bytenr,
                BTRFS_EXTENT_DATA_REF_KEY,
                hash_extent_data_ref(root_objectid, owner, offset),
            )
        }
    } else if parent > 0 {
        Key::new(bytenr, BTRFS_SHARED_BLOCK_REF_KEY, parent)
    } else {
        Key::new(bytenr, BTRFS_TREE_BLOCK_REF_KEY, root_objectid)
    }
}

/// add one reference to an allocated extent: bump the extent item and
/// insert or grow the matching keyed backref item
pub fn inc_extent_ref(
    trans: &TransHandle,
    fs: &FsInfo,
    bytenr: u64,
    _num_bytes: u64,
    parent: u64,
    root_objectid: u64,
    owner: u64,
    offset: u64,
) -> Result<()> {
    let extent_root = fs.extent_root();
    let key = ref_item_key(bytenr, parent, root_objectid, owner, offset);

    let mut path = Path::new();
    let found = search_slot(Some(trans), fs, &extent_root, &key, &mut path, 0, true)?;
    if found {
        match key.item_type {
            BTRFS_TREE_BLOCK_REF_KEY | BTRFS_SHARED_BLOCK_REF_KEY => {
                debug!("tree ref {key:?} already present");
            }
            BTRFS_SHARED_DATA_REF_KEY => {
                let leaf = path.leaf();
                let ptr = leaf.item_ptr_offset(path.slots[0]);
                leaf.write_u32(ptr, leaf.read_u32(ptr) + 1);
                leaf.mark_dirty();
            }
            BTRFS_EXTENT_DATA_REF_KEY => {
                let leaf = path.leaf();
                let ptr = leaf.item_ptr_offset(path.slots[0]);
                leaf.write_u32(ptr + 24, leaf.read_u32(ptr + 24) + 1);
                leaf.mark_dirty();
            }
            _ => unreachable!(),
        }
    } else {
        path.release();
        let data: Vec<u8> = match key.item_type {
            BTRFS_TREE_BLOCK_REF_KEY | BTRFS_SHARED_BLOCK_REF_KEY => Vec::new(),
            BTRFS_SHARED_DATA_REF_KEY => 1_u32.to_le_bytes().to_vec(),
            BTRFS_EXTENT_DATA_REF_KEY => {
                let mut buf = Vec::with_capacity(28);
                buf.extend_from_slice(&root_objectid.to_le_bytes());
                buf.extend_from_slice(&owner.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&1_u32.to_le_bytes());
                buf
            }
            _ => unreachable!(),
        };
        insert_item(trans, fs, &extent_root, &key, &data)?;
    }

    update_extent_item_refs(trans, fs, bytenr, 1)?;
    Ok(())
}

/// drop one reference; mirrors inc_extent_ref. During repair the drop is
/// logged so the reconciler can keep its records honest.
pub fn free_extent(
    trans: &TransHandle,
    fs: &FsInfo,
    bytenr: u64,
    num_bytes: u64,
    parent: u64,
    root_objectid: u64,
    owner: u64,
    offset: u64,
) -> Result<()> {
    if fs.record_extent_removals.get() {
        fs.free_extent_log.borrow_mut().push(FreeExtentEvent {
            bytenr,
            num_bytes,
            parent,
            root_objectid,
            owner,
            offset,
            refs_to_drop: 1,
        });
    }

    let extent_root = fs.extent_root();
    let key = ref_item_key(bytenr, parent, root_objectid, owner, offset);
    let mut path = Path::new();
    let found = search_slot(Some(trans), fs, &extent_root, &key, &mut path, 0, true)?;
    if found {
        let remove = match key.item_type {
            BTRFS_TREE_BLOCK_REF_KEY | BTRFS_SHARED_BLOCK_REF_KEY => true,
            BTRFS_SHARED_DATA_REF_KEY => {
                let leaf = path.leaf();
                let ptr = leaf.item_ptr_offset(path.slots[0]);
                let count = leaf.read_u32(ptr);
                if count > 1 {
                    leaf.write_u32(ptr, count - 1);
                    leaf.mark_dirty();
                    false
                } else {
                    true
                }
            }
            BTRFS_EXTENT_DATA_REF_KEY => {
                let leaf = path.leaf();
                let ptr = leaf.item_ptr_offset(path.slots[0]);
                let count = leaf.read_u32(ptr + 24);
                if count > 1 {
                    leaf.write_u32(ptr + 24, count - 1);
                    leaf.mark_dirty();
                    false
                } else {
                    true
                }
            }
            _ => unreachable!(),
        };
        if remove {
            let slot = path.slots[0];
            del_items(trans, fs, &extent_root, &mut path, slot, 1)?;
        }
    } else {
        debug!("no backref item for extent {bytenr} {key:?}");
    }
    path.release();

    let new_refs = update_extent_item_refs(trans, fs, bytenr, -1)?;
    if new_refs == 0 {
        drop_cached_block(fs, bytenr);
    }
    Ok(())
}

/// walk every reference a block holds and inc or dec each one; used when
/// COW moves a shared block between owner-encoded and parent-encoded refs
pub fn mod_ref(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    buf: &EbRef,
    inc: bool,
    full_backref: bool,
) -> Result<()> {
    if !root.ref_cows && buf.level() == 0 {
        return Ok(());
    }
    let ref_root = root.objectid;
    let parent = if full_backref { buf.start } else { 0 };
    let nritems = buf.nritems() as usize;
    let level = buf.level();

    for i in 0..nritems {
        if level == 0 {
            let key = buf.item_key(i);
            if key.item_type != BTRFS_EXTENT_DATA_KEY {
                continue;
            }
            let data = buf.item_data(i);
            if data[BTRFS_FILE_EXTENT_INLINE_DATA_START - 1] == BTRFS_FILE_EXTENT_INLINE {
                continue;
            }
            let disk_bytenr = u64::from_le_bytes(data[21..29].try_into().unwrap());
            if disk_bytenr == 0 {
                continue;
            }
            let disk_num_bytes = u64::from_le_bytes(data[29..37].try_into().unwrap());
            let extent_offset = u64::from_le_bytes(data[37..45].try_into().unwrap());
            let file_offset = key.offset.wrapping_sub(extent_offset);
            if inc {
                inc_extent_ref(
                    trans,
                    fs,
                    disk_bytenr,
                    disk_num_bytes,
                    parent,
                    ref_root,
                    key.objectid,
                    file_offset,
                )?;
            } else {
                free_extent(
                    trans,
                    fs,
                    disk_bytenr,
                    disk_num_bytes,
                    parent,
                    ref_root,
                    key.objectid,
                    file_offset,
                )?;
            }
        } else {
            let bytenr = buf.node_blockptr(i);
            let num_bytes = fs.nodesize as u64;
            if inc {
                inc_extent_ref(
                    trans,
                    fs,
                    bytenr,
                    num_bytes,
                    parent,
                    ref_root,
                    (level - 1) as u64,
                    0,
                )?;
            } else {
                free_extent(
                    trans,
                    fs,
                    bytenr,
                    num_bytes,
                    parent,
                    ref_root,
                    (level - 1) as u64,
                    0,
                )?;
            }
        }
    }
    Ok(())
}

/// OR flags into the extent item for a tree block
pub fn set_block_flags(trans: &TransHandle, fs: &FsInfo, bytenr: u64, flags: u64) -> Result<()> {
    let extent_root = fs.extent_root();
    let mut path = Path::new();
    let key = Key::new(bytenr, BTRFS_EXTENT_ITEM_KEY, 0);
    search_slot(Some(trans), fs, &extent_root, &key, &mut path, 0, true)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &extent_root, &mut path)? != 0 {
                return Err(FsckError::Unsupported("extent item missing"));
            }
            continue;
        }
        let found = leaf.item_key(path.slots[0]);
        if found.objectid != bytenr {
            return Err(FsckError::Unsupported("extent item missing"));
        }
        if found.item_type == BTRFS_EXTENT_ITEM_KEY
            || found.item_type == BTRFS_METADATA_ITEM_KEY
        {
            let ptr = leaf.item_ptr_offset(path.slots[0]);
            let old = leaf.read_u64(ptr + 16);
            leaf.write_u64(ptr + 16, old | flags);
            leaf.mark_dirty();
            return Ok(());
        }
        path.slots[0] += 1;
    }
}

/// keep repairs away from a damaged or interesting range
pub fn pin_extent(fs: &FsInfo, start: u64, num_bytes: u64) {
    fs.pinned.borrow_mut().insert(start, num_bytes, ()).ok();
}

fn range_is_usable(fs: &FsInfo, start: u64, num_bytes: u64) -> bool {
    if fs.pinned.borrow().find(start, num_bytes).is_some() {
        return false;
    }
    if fs.trans_allocated.borrow().find(start, num_bytes).is_some() {
        return false;
    }
    if fs.corrupt_blocks.borrow().find(start, num_bytes).is_some() {
        return false;
    }
    !intersects_super_stripe(fs, start, num_bytes)
}

/// find a hole of `num_bytes` inside some block group, preferring the one
/// containing `hint`. The scan is read-only so it cannot recurse into
/// allocation itself.
pub fn find_free_extent(fs: &FsInfo, num_bytes: u64, hint: u64) -> Result<u64> {
    ensure_block_groups(fs)?;
    let extent_root = fs.extent_root();

    let mut groups: Vec<(u64, u64)> = fs
        .block_groups
        .borrow()
        .iter()
        .map(|(start, len, _)| (start, len))
        .collect();
    if groups.is_empty() {
        return Err(FsckError::NoSpace);
    }
    /* rotate so the hinted group comes first */
    let pivot = groups
        .iter()
        .position(|&(s, l)| hint >= s && hint < s + l)
        .unwrap_or(0);
    groups.rotate_left(pivot);

    for (group_start, group_len) in groups {
        let group_end = group_start + group_len;
        let mut cursor = group_start;
        let mut path = Path::new();
        let key = Key::new(group_start, 0, 0);
        search_slot(None, fs, &extent_root, &key, &mut path, 0, false)?;
        loop {
            let leaf = path.leaf();
            if path.slots[0] >= leaf.nritems() as usize {
                if next_leaf(fs, &extent_root, &mut path)? != 0 {
                    break;
                }
                continue;
            }
            let found = leaf.item_key(path.slots[0]);
            if found.objectid >= group_end {
                break;
            }
            let (estart, elen) = match found.item_type {
                BTRFS_EXTENT_ITEM_KEY => (found.objectid, found.offset),
                BTRFS_METADATA_ITEM_KEY => (found.objectid, fs.nodesize as u64),
                _ => {
                    path.slots[0] += 1;
                    continue;
                }
            };
            if estart + elen <= cursor {
                path.slots[0] += 1;
                continue;
            }
            while cursor + num_bytes <= estart {
                if range_is_usable(fs, cursor, num_bytes) {
                    return Ok(cursor);
                }
                cursor += num_bytes;
            }
            cursor = cursor.max(estart + elen);
            path.slots[0] += 1;
        }
        /* tail of the group */
        while cursor + num_bytes <= group_end {
            if range_is_usable(fs, cursor, num_bytes) {
                return Ok(cursor);
            }
            cursor += num_bytes;
        }
    }
    Err(FsckError::NoSpace)
}

/// allocate a fresh tree block for `root_objectid`: reserve the range,
/// enter the extent item + backref, account the block group
pub fn alloc_free_block(
    trans: &TransHandle,
    fs: &FsInfo,
    root_objectid: u64,
    level: u8,
    hint: u64,
) -> Result<EbRef> {
    let num_bytes = fs.nodesize as u64;
    let bytenr = find_free_extent(fs, num_bytes, hint)?;
    fs.trans_allocated
        .borrow_mut()
        .insert(bytenr, num_bytes, ())
        .expect("allocator handed out an overlapping range");

    let eb = alloc_tree_block_buffer(fs, bytenr);
    eb.set_level(level);
    eb.mark_dirty();
    debug!("allocated tree block {bytenr} level {level} for root {root_objectid}");

    let extent_root = fs.extent_root();
    let key = Key::new(bytenr, BTRFS_METADATA_ITEM_KEY, level as u64);
    let mut data = [0_u8; 24];
    data[0..8].copy_from_slice(&1_u64.to_le_bytes());
    data[8..16].copy_from_slice(&trans.transid.to_le_bytes());
    data[16..24].copy_from_slice(&BTRFS_EXTENT_FLAG_TREE_BLOCK.to_le_bytes());
    insert_item(trans, fs, &extent_root, &key, &data)?;

    let ref_key = Key::new(bytenr, BTRFS_TREE_BLOCK_REF_KEY, root_objectid);
    insert_item(trans, fs, &extent_root, &ref_key, &[])?;

    update_block_group(trans, fs, bytenr, num_bytes, true)?;
    Ok(eb)
}

/// adjust the used counter of the group containing `bytenr`, in memory
/// and on disk
pub fn update_block_group(
    trans: &TransHandle,
    fs: &FsInfo,
    bytenr: u64,
    num_bytes: u64,
    alloc: bool,
) -> Result<()> {
    ensure_block_groups(fs)?;
    let (group_start, group_len, used) = {
        let groups = fs.block_groups.borrow();
        let Some((start, len, rec)) = groups.find(bytenr, 1) else {
            eprintln!("no block group for extent {bytenr}");
            return Ok(());
        };
        let old = rec.used.get();
        let new = if alloc {
            old + num_bytes
        } else {
            old.saturating_sub(num_bytes)
        };
        rec.used.set(new);
        (start, len, new)
    };

    let total = fs.bytes_used.get();
    fs.bytes_used.set(if alloc {
        total + num_bytes
    } else {
        total.saturating_sub(num_bytes)
    });

    write_block_group_item(trans, fs, group_start, group_len, used)
}

fn write_block_group_item(
    trans: &TransHandle,
    fs: &FsInfo,
    group_start: u64,
    group_len: u64,
    used: u64,
) -> Result<()> {
    let extent_root = fs.extent_root();
    let key = Key::new(group_start, BTRFS_BLOCK_GROUP_ITEM_KEY, group_len);
    let mut path = Path::new();
    let found = search_slot(Some(trans), fs, &extent_root, &key, &mut path, 0, true)?;
    if !found {
        eprintln!("block group item {group_start} missing on disk");
        return Ok(());
    }
    let leaf = path.leaf();
    leaf.write_u64(leaf.item_ptr_offset(path.slots[0]), used);
    leaf.mark_dirty();
    Ok(())
}

/// recompute every block group's used bytes (and the superblock total)
/// from the extent tree
pub fn fix_block_accounting(trans: &TransHandle, fs: &FsInfo) -> Result<()> {
    ensure_block_groups(fs)?;
    for (_, _, rec) in fs.block_groups.borrow().iter() {
        rec.used.set(0);
    }
    fs.bytes_used.set(0);

    let extent_root = fs.extent_root();
    let mut path = Path::new();
    let key = Key::new(0, 0, 0);
    let mut total: u64 = 0;
    search_slot(None, fs, &extent_root, &key, &mut path, 0, false)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &extent_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let found = leaf.item_key(path.slots[0]);
        let bytes = match found.item_type {
            BTRFS_EXTENT_ITEM_KEY => Some(found.offset),
            BTRFS_METADATA_ITEM_KEY => Some(fs.nodesize as u64),
            _ => None,
        };
        if let Some(bytes) = bytes {
            total += bytes;
            if let Some((_, _, rec)) = fs.block_groups.borrow().find(found.objectid, 1) {
                rec.used.set(rec.used.get() + bytes);
            }
        }
        path.slots[0] += 1;
    }
    path.release();
    fs.bytes_used.set(total);

    let groups: Vec<(u64, u64, u64)> = fs
        .block_groups
        .borrow()
        .iter()
        .map(|(s, l, rec)| (s, l, rec.used.get()))
        .collect();
    for (start, len, used) in groups {
        write_block_group_item(trans, fs, start, len, used)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ref_hash_is_stable() {
        let a = hash_extent_data_ref(5, 256, 0);
        let b = hash_extent_data_ref(5, 256, 0);
        assert_eq!(a, b);
        assert_ne!(a, hash_extent_data_ref(5, 256, 4096));
        assert_ne!(a, hash_extent_data_ref(5, 257, 0));
    }
}
