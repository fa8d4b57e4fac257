use crate::btrfs::FsInfo;
use crate::error::Result;
use crate::structures::*;
use crate::tree::{next_leaf, prev_leaf, search_slot, Path};

/// Checksum-to-extent consistency: aggregate contiguous csum coverage in
/// logical order and require every covered range to be backed by an
/// extent tree entry.

/// is [bytenr, bytenr + num_bytes) fully covered by data extent items?
fn check_extent_exists(fs: &FsInfo, mut bytenr: u64, mut num_bytes: u64) -> Result<i32> {
    let extent_root = fs.extent_root();

    'again: loop {
        let mut path = Path::new();
        let key = Key::new(bytenr, BTRFS_EXTENT_ITEM_KEY, 0);
        let found = search_slot(None, fs, &extent_root, &key, &mut path, 0, false)?;
        if !found {
            if path.slots[0] > 0 {
                path.slots[0] -= 1;
            } else {
                prev_leaf(fs, &extent_root, &mut path)?;
            }
        }

        /*
         * block group items come before extent items if they have the
         * same bytenr, so walk back one more just in case
         */
        let key = path.leaf().item_key(path.slots[0]);
        if key.item_type == BTRFS_BLOCK_GROUP_ITEM_KEY {
            if path.slots[0] > 0 {
                path.slots[0] -= 1;
            } else {
                prev_leaf(fs, &extent_root, &mut path)?;
            }
        }

        while num_bytes > 0 {
            let leaf = path.leaf();
            if path.slots[0] >= leaf.nritems() as usize {
                if next_leaf(fs, &extent_root, &mut path)? != 0 {
                    break;
                }
                continue;
            }
            let key = leaf.item_key(path.slots[0]);
            if key.item_type != BTRFS_EXTENT_ITEM_KEY {
                path.slots[0] += 1;
                continue;
            }
            if key.objectid + key.offset < bytenr {
                path.slots[0] += 1;
                continue;
            }
            if key.objectid > bytenr + num_bytes {
                break;
            }

            if key.objectid == bytenr {
                if key.offset >= num_bytes {
                    num_bytes = 0;
                    break;
                }
                num_bytes -= key.offset;
                bytenr += key.offset;
            } else if key.objectid < bytenr {
                if key.objectid + key.offset >= bytenr + num_bytes {
                    num_bytes = 0;
                    break;
                }
                num_bytes = (bytenr + num_bytes) - (key.objectid + key.offset);
                bytenr = key.objectid + key.offset;
            } else {
                if key.objectid + key.offset < bytenr + num_bytes {
                    let new_start = key.objectid + key.offset;
                    let new_bytes = bytenr + num_bytes - new_start;

                    /*
                     * the extent sits in the middle of our range; search
                     * the right side on its own and restart for the left
                     */
                    let ret = check_extent_exists(fs, new_start, new_bytes)?;
                    if ret != 0 {
                        eprintln!("Right section didn't have a record");
                        break;
                    }
                    num_bytes = key.objectid - bytenr;
                    continue 'again;
                }
                num_bytes = key.objectid - bytenr;
            }
            path.slots[0] += 1;
        }

        if num_bytes > 0 {
            eprintln!(
                "There are no extents for csum range {}-{}",
                bytenr,
                bytenr + num_bytes
            );
            return Ok(1);
        }
        return Ok(0);
    }
}

/// walk the checksum tree in logical order; whenever coverage breaks, the
/// finished range must map onto allocated extents
pub fn check_csums(fs: &FsInfo) -> Result<i32> {
    let csum_root = fs.csum_root();
    let csum_size = 4_u64; // crc32

    let mut path = Path::new();
    let key = Key::new(BTRFS_EXTENT_CSUM_OBJECTID, BTRFS_EXTENT_CSUM_KEY, 0);
    let found = search_slot(None, fs, &csum_root, &key, &mut path, 0, false)?;
    if !found && path.slots[0] > 0 {
        path.slots[0] -= 1;
    }

    let mut offset = 0_u64;
    let mut num_bytes = 0_u64;
    let mut errors = 0;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &csum_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.item_type != BTRFS_EXTENT_CSUM_KEY {
            path.slots[0] += 1;
            continue;
        }

        if num_bytes == 0 {
            offset = key.offset;
        } else if key.offset != offset + num_bytes {
            let ret = check_extent_exists(fs, offset, num_bytes)?;
            if ret != 0 {
                eprintln!(
                    "Csum exists for {}-{} but there is no extent record",
                    offset,
                    offset + num_bytes
                );
                errors += 1;
            }
            offset = key.offset;
            num_bytes = 0;
        }

        let item_size = leaf.item_size(path.slots[0]) as u64;
        num_bytes += (item_size / csum_size) * fs.sectorsize as u64;
        path.slots[0] += 1;
    }
    Ok(errors)
}
