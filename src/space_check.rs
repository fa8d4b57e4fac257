use crate::btrfs::{read_root, FsInfo, Root};
use crate::cache_tree::CacheTree;
use crate::error::Result;
use crate::extent_tree::ensure_block_groups;
use crate::structures::*;
use crate::tree::{next_leaf, search_slot, Path};

use log::debug;
use std::rc::Rc;

/// Free-space verification: replay every extent in a block group and
/// demand that each hole between extents matches a recorded free-space
/// entry exactly, superblock stripes excluded.

const FREE_SPACE_USING_BITMAPS: u32 = 1 << 0;

struct FreeSpaceCtl {
    entries: CacheTree<()>,
}

/// collect this block group's free-space extents from the free-space tree
fn load_free_space(
    fs: &FsInfo,
    fst_root: &Rc<Root>,
    group_start: u64,
    group_len: u64,
) -> Result<FreeSpaceCtl> {
    let mut ctl = FreeSpaceCtl {
        entries: CacheTree::new(),
    };
    let group_end = group_start + group_len;
    let sectorsize = fs.sectorsize as u64;

    let mut path = Path::new();
    let key = Key::new(group_start, BTRFS_FREE_SPACE_INFO_KEY, group_len);
    let found = search_slot(None, fs, fst_root, &key, &mut path, 0, false)?;
    if !found {
        debug!("no free space info for block group {group_start}");
        return Ok(ctl);
    }
    let flags = {
        let leaf = path.leaf();
        let data = leaf.item_data(path.slots[0]);
        u32::from_le_bytes(data[4..8].try_into().unwrap())
    };
    path.slots[0] += 1;

    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, fst_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.objectid >= group_end {
            break;
        }
        match key.item_type {
            BTRFS_FREE_SPACE_EXTENT_KEY => {
                ctl.entries.insert(key.objectid, key.offset, ()).ok();
            }
            BTRFS_FREE_SPACE_BITMAP_KEY if flags & FREE_SPACE_USING_BITMAPS != 0 => {
                let data = leaf.item_data(path.slots[0]);
                let mut run_start = None;
                let nbits = (key.offset / sectorsize) as usize;
                for bit in 0..nbits {
                    let set = data[bit / 8] & (1 << (bit % 8)) != 0;
                    match (set, run_start) {
                        (true, None) => run_start = Some(bit),
                        (false, Some(first)) => {
                            ctl.entries
                                .insert(
                                    key.objectid + first as u64 * sectorsize,
                                    (bit - first) as u64 * sectorsize,
                                    (),
                                )
                                .ok();
                            run_start = None;
                        }
                        _ => {}
                    }
                }
                if let Some(first) = run_start {
                    ctl.entries
                        .insert(
                            key.objectid + first as u64 * sectorsize,
                            (nbits - first) as u64 * sectorsize,
                            (),
                        )
                        .ok();
                }
            }
            _ => {}
        }
        path.slots[0] += 1;
    }
    Ok(ctl)
}

/// logical addresses within [offset, offset + bytes) that sit on top of a
/// superblock copy
fn super_overlaps(fs: &FsInfo, offset: u64, bytes: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let chunks = fs.chunks.borrow();
    let Some((cstart, clen, chunk)) = chunks.find(offset, bytes.max(1)) else {
        return out;
    };
    for stripe in &chunk.stripes {
        for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
            let sb = btrfs_sb_offset(mirror);
            if sb >= stripe.offset && sb < stripe.offset + clen {
                let logical = cstart + (sb - stripe.offset);
                let len = BTRFS_SUPER_INFO_SIZE as u64;
                if logical + len > offset && logical < offset + bytes {
                    out.push((logical, len));
                }
            }
        }
    }
    out
}

/// the hole [offset, offset + bytes) must be covered by a free-space
/// entry with exactly that shape
fn check_cache_range(fs: &FsInfo, ctl: &mut FreeSpaceCtl, offset: u64, bytes: u64) -> i32 {
    let mut offset = offset;
    let mut bytes = bytes;

    for (logical, stripe_len) in super_overlaps(fs, offset, bytes) {
        if logical + stripe_len <= offset || offset + bytes <= logical {
            continue;
        }
        if logical == offset {
            if stripe_len >= bytes {
                return 0;
            }
            bytes -= stripe_len;
            offset += stripe_len;
        } else if logical < offset {
            if logical + stripe_len >= offset + bytes {
                return 0;
            }
            bytes = (offset + bytes) - (logical + stripe_len);
            offset = logical + stripe_len;
        } else {
            /* the super lands in the middle of the hole; check the left
             * side and continue with the right */
            if logical + stripe_len >= bytes + offset {
                bytes = logical - offset;
                continue;
            }
            let ret = check_cache_range(fs, ctl, offset, logical - offset);
            if ret != 0 {
                return ret;
            }
            bytes = (offset + bytes) - (logical + stripe_len);
            offset = logical + stripe_len;
        }
    }

    let entry = ctl.entries.find(offset, bytes.max(1)).map(|(s, l, _)| (s, l));
    let Some((estart, ebytes)) = entry else {
        eprintln!(
            "There is no free space entry for {}-{}",
            offset,
            offset + bytes
        );
        return -1;
    };
    if estart != offset {
        eprintln!("Wanted offset {offset}, found {estart}");
        return -1;
    }
    if ebytes != bytes {
        eprintln!("Wanted bytes {bytes}, found {ebytes} for off {offset}");
        return -1;
    }
    ctl.entries.remove(estart);
    0
}

fn verify_space_cache(
    fs: &FsInfo,
    ctl: &mut FreeSpaceCtl,
    group_start: u64,
    group_len: u64,
) -> Result<i32> {
    let extent_root = fs.extent_root();
    let group_end = group_start + group_len;
    let mut last = group_start.max(BTRFS_SUPER_INFO_OFFSET as u64);

    let mut path = Path::new();
    let key = Key::new(last, BTRFS_EXTENT_ITEM_KEY, 0);
    search_slot(None, fs, &extent_root, &key, &mut path, 0, false)?;
    let mut ret = 0;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &extent_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.objectid >= group_end {
            break;
        }
        if key.item_type != BTRFS_EXTENT_ITEM_KEY
            && key.item_type != BTRFS_METADATA_ITEM_KEY
        {
            path.slots[0] += 1;
            continue;
        }

        if last < key.objectid {
            ret = check_cache_range(fs, ctl, last, key.objectid - last);
            if ret != 0 {
                break;
            }
        }
        last = if key.item_type == BTRFS_EXTENT_ITEM_KEY {
            key.objectid + key.offset
        } else {
            key.objectid + fs.nodesize as u64
        };
        path.slots[0] += 1;
    }

    if ret == 0 && last < group_end {
        ret = check_cache_range(fs, ctl, last, group_end - last);
    }

    if ret == 0 && !ctl.entries.is_empty() {
        eprintln!("There are still entries left in the space cache");
        ret = -1;
    }
    Ok(ret)
}

/// verify the recorded free space of every block group. A generation
/// mismatch means the cache would be rebuilt at mount, so there is
/// nothing to verify.
pub fn check_space_cache(fs: &FsInfo) -> Result<i32> {
    if fs.generation.get() != fs.cache_generation {
        println!("cache and super generation don't match, space cache will be invalidated");
        return Ok(0);
    }

    let Ok(fst_root) = read_root(fs, BTRFS_FREE_SPACE_TREE_OBJECTID) else {
        println!("no free space tree on this filesystem");
        return Ok(0);
    };

    ensure_block_groups(fs)?;
    let groups: Vec<(u64, u64)> = fs
        .block_groups
        .borrow()
        .iter()
        .map(|(start, len, _)| (start, len))
        .collect();

    let mut error = 0;
    for (start, len) in groups {
        let mut ctl = load_free_space(fs, &fst_root, start, len)?;
        let ret = verify_space_cache(fs, &mut ctl, start, len)?;
        if ret != 0 {
            eprintln!("cache appears valid but isnt {start}");
            error += 1;
        }
    }
    Ok(error)
}
