use crate::btrfs::{parse_root_item, FsInfo, Root};
use crate::disk_io::{read_tree_block, readahead_tree_block};
use crate::error::Result;
use crate::extent_buffer::EbRef;
use crate::extent_tree::lookup_extent_info;
use crate::inode_record::*;
use crate::shared_walk::{
    enter_shared_node, leave_shared_node, new_shared_node, SharedNodeRef, WalkControl,
};
use crate::structures::*;
use crate::tree::{next_leaf, search_slot, Path};

use log::debug;
use std::rc::Rc;

/// Cross-checking of the filesystem trees: every subvolume is walked once
/// (shared subtrees memoised), its items aggregated into inode records,
/// and each record reconciled against itself when complete.

pub fn check_orphan_item(fs: &FsInfo, root: &Rc<Root>, ino: u64) -> Result<bool> {
    let key = Key::new(BTRFS_ORPHAN_OBJECTID, BTRFS_ORPHAN_ITEM_KEY, ino);
    let mut path = Path::new();
    let found = search_slot(None, fs, root, &key, &mut path, 0, false)?;
    Ok(found)
}

fn process_inode_item(eb: &EbRef, slot: usize, key: &Key, active_node: &SharedNodeRef) {
    let node = &mut *active_node.borrow_mut();
    let rec = node.current.clone().expect("leaf walk lost its cursor");
    {
        let mut r = rec.borrow_mut();
        assert!(r.ino == key.objectid && r.refs <= 1);
        if r.found_inode_item {
            r.errors |= I_ERR_DUP_INODE_ITEM;
            return;
        }
        let data = eb.item_data(slot);
        r.nlink = u32::from_le_bytes(data[40..44].try_into().unwrap());
        r.isize = u64::from_le_bytes(data[16..24].try_into().unwrap());
        r.nbytes = u64::from_le_bytes(data[24..32].try_into().unwrap());
        r.imode = u32::from_le_bytes(data[52..56].try_into().unwrap());
        let flags = u64::from_le_bytes(data[64..72].try_into().unwrap());
        if flags & BTRFS_INODE_NODATASUM != 0 {
            r.nodatasum = true;
        }
        r.found_inode_item = true;
        if r.nlink == 0 {
            r.errors |= I_ERR_NO_ORPHAN_ITEM;
        }
    }
    maybe_free_inode_rec(&mut node.inode_cache, &rec);
}

fn process_dir_item(eb: &EbRef, slot: usize, key: &Key, active_node: &SharedNodeRef) {
    let data = eb.item_data(slot);
    let total = data.len();
    let mut cur = 0;
    let mut nritems = 0;

    {
        let node = &mut *active_node.borrow_mut();
        let rec = node.current.clone().expect("leaf walk lost its cursor");
        rec.borrow_mut().found_dir_item = true;
    }

    while cur < total {
        nritems += 1;
        let di = &data[cur..];
        let location = Key::from_disk_bytes(&di[0..17]);
        let data_len = u16::from_le_bytes(di[25..27].try_into().unwrap()) as usize;
        let name_len = u16::from_le_bytes(di[27..29].try_into().unwrap()) as usize;
        let filetype = di[29];

        let (len, error) = if name_len <= BTRFS_NAME_LEN {
            (name_len, 0)
        } else {
            (BTRFS_NAME_LEN, REF_ERR_NAME_TOO_LONG)
        };
        let name = &di[30..30 + len];

        {
            let node = &mut *active_node.borrow_mut();
            let rec = node.current.clone().unwrap();
            rec.borrow_mut().found_size += name_len as u64;
        }

        let node = &mut *active_node.borrow_mut();
        if location.item_type == BTRFS_INODE_ITEM_KEY {
            add_inode_backref(
                &mut node.inode_cache,
                location.objectid,
                key.objectid,
                key.offset,
                name,
                filetype,
                key.item_type,
                error,
            );
        } else if location.item_type == BTRFS_ROOT_ITEM_KEY {
            add_inode_backref(
                &mut node.root_cache,
                location.objectid,
                key.objectid,
                key.offset,
                name,
                filetype,
                key.item_type,
                error,
            );
        } else {
            eprintln!(
                "warning: dir item in {} points to a {}",
                key.objectid,
                key_type_name(location.item_type)
            );
        }

        cur += 30 + name_len + data_len;
    }

    if key.item_type == BTRFS_DIR_INDEX_KEY && nritems > 1 {
        let node = &mut *active_node.borrow_mut();
        let rec = node.current.clone().unwrap();
        rec.borrow_mut().errors |= I_ERR_DUP_DIR_INDEX;
    }
}

fn process_inode_ref(eb: &EbRef, slot: usize, key: &Key, active_node: &SharedNodeRef) {
    let data = eb.item_data(slot);
    let total = data.len();
    let mut cur = 0;
    while cur < total {
        let r = &data[cur..];
        let index = u64::from_le_bytes(r[0..8].try_into().unwrap());
        let name_len = u16::from_le_bytes(r[8..10].try_into().unwrap()) as usize;
        let (len, error) = if name_len <= BTRFS_NAME_LEN {
            (name_len, 0)
        } else {
            (BTRFS_NAME_LEN, REF_ERR_NAME_TOO_LONG)
        };
        let name = &r[10..10 + len];

        let node = &mut *active_node.borrow_mut();
        add_inode_backref(
            &mut node.inode_cache,
            key.objectid,
            key.offset,
            index,
            name,
            0,
            key.item_type,
            error,
        );
        cur += 10 + name_len;
    }
}

fn process_inode_extref(eb: &EbRef, slot: usize, key: &Key, active_node: &SharedNodeRef) {
    let data = eb.item_data(slot);
    let total = data.len();
    let mut cur = 0;
    while cur < total {
        let r = &data[cur..];
        let parent = u64::from_le_bytes(r[0..8].try_into().unwrap());
        let index = u64::from_le_bytes(r[8..16].try_into().unwrap());
        let name_len = u16::from_le_bytes(r[16..18].try_into().unwrap()) as usize;
        let (len, error) = if name_len <= BTRFS_NAME_LEN {
            (name_len, 0)
        } else {
            (BTRFS_NAME_LEN, REF_ERR_NAME_TOO_LONG)
        };
        let name = &r[18..18 + len];

        let node = &mut *active_node.borrow_mut();
        add_inode_backref(
            &mut node.inode_cache,
            key.objectid,
            parent,
            index,
            name,
            0,
            key.item_type,
            error,
        );
        cur += 18 + name_len;
    }
}

/// how many bytes of [start, start + len) the checksum tree covers
pub fn count_csum_range(fs: &FsInfo, mut start: u64, mut len: u64) -> Result<u64> {
    let csum_root = fs.csum_root();
    let csum_size = 4_u64; // crc32
    let mut found = 0_u64;

    let mut path = Path::new();
    let key = Key::new(BTRFS_EXTENT_CSUM_OBJECTID, BTRFS_EXTENT_CSUM_KEY, start);
    let ret = search_slot(None, fs, &csum_root, &key, &mut path, 0, false)?;
    if !ret && path.slots[0] > 0 {
        let prev = path.leaf().item_key(path.slots[0] - 1);
        if prev.objectid == BTRFS_EXTENT_CSUM_OBJECTID
            && prev.item_type == BTRFS_EXTENT_CSUM_KEY
        {
            path.slots[0] -= 1;
        }
    }

    while len > 0 {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &csum_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.objectid != BTRFS_EXTENT_CSUM_OBJECTID
            || key.item_type != BTRFS_EXTENT_CSUM_KEY
        {
            break;
        }
        if key.offset >= start + len {
            break;
        }
        if key.offset > start {
            start = key.offset;
        }
        let size = leaf.item_size(path.slots[0]) as u64;
        let csum_end = key.offset + (size / csum_size) * fs.sectorsize as u64;
        if csum_end > start {
            let size = (csum_end - start).min(len);
            len -= size;
            start += size;
            found += size;
        }
        path.slots[0] += 1;
    }
    Ok(found)
}

fn process_file_extent(
    fs: &FsInfo,
    eb: &EbRef,
    slot: usize,
    key: &Key,
    active_node: &SharedNodeRef,
) -> Result<()> {
    let mask = fs.sectorsize as u64 - 1;
    let data = eb.item_data(slot);
    let rec = active_node
        .borrow()
        .current
        .clone()
        .expect("leaf walk lost its cursor");

    let mut num_bytes: u64 = 0;
    let mut disk_bytenr: u64 = 0;
    let mut extent_offset: u64 = 0;
    let compression = data[16];
    let extent_type = data[20];

    {
        let mut r = rec.borrow_mut();
        assert!(r.ino == key.objectid && r.refs <= 1);
        r.found_file_extent = true;

        if r.extent_start == u64::MAX {
            r.extent_start = key.offset;
            r.extent_end = key.offset;
        }
        if r.extent_end > key.offset {
            r.errors |= I_ERR_FILE_EXTENT_OVERLAP;
        } else if r.extent_end < key.offset && r.extent_end < r.first_extent_gap {
            r.first_extent_gap = r.extent_end;
        }

        if extent_type == BTRFS_FILE_EXTENT_INLINE {
            num_bytes = if compression != 0 {
                u64::from_le_bytes(data[8..16].try_into().unwrap())
            } else {
                (data.len() - BTRFS_FILE_EXTENT_INLINE_DATA_START) as u64
            };
            if num_bytes == 0 {
                r.errors |= I_ERR_BAD_FILE_EXTENT;
            }
            r.found_size += num_bytes;
            num_bytes = (num_bytes + mask) & !mask;
        } else if extent_type == BTRFS_FILE_EXTENT_REG
            || extent_type == BTRFS_FILE_EXTENT_PREALLOC
        {
            num_bytes = u64::from_le_bytes(data[45..53].try_into().unwrap());
            disk_bytenr = u64::from_le_bytes(data[21..29].try_into().unwrap());
            extent_offset = u64::from_le_bytes(data[37..45].try_into().unwrap());
            let ram_bytes = u64::from_le_bytes(data[8..16].try_into().unwrap());
            let encryption = data[17];
            let other_encoding = u16::from_le_bytes(data[18..20].try_into().unwrap());
            if num_bytes == 0 || num_bytes & mask != 0 {
                r.errors |= I_ERR_BAD_FILE_EXTENT;
            }
            if num_bytes + extent_offset > ram_bytes {
                r.errors |= I_ERR_BAD_FILE_EXTENT;
            }
            if extent_type == BTRFS_FILE_EXTENT_PREALLOC
                && (compression != 0 || encryption != 0 || other_encoding != 0)
            {
                r.errors |= I_ERR_BAD_FILE_EXTENT;
            }
            if disk_bytenr > 0 {
                r.found_size += num_bytes;
            }
        } else {
            r.errors |= I_ERR_BAD_FILE_EXTENT;
        }
        r.extent_end = key.offset + num_bytes;
    }

    if disk_bytenr > 0 {
        let mut csum_start = disk_bytenr;
        let mut csum_len = num_bytes;
        if compression != 0 {
            csum_len = u64::from_le_bytes(data[29..37].try_into().unwrap());
        } else {
            csum_start += extent_offset;
        }
        let found = count_csum_range(fs, csum_start, csum_len)?;
        let mut r = rec.borrow_mut();
        if extent_type == BTRFS_FILE_EXTENT_REG {
            if found > 0 {
                r.found_csum_item = true;
            }
            if found < csum_len {
                r.some_csum_missing = true;
            }
        } else if extent_type == BTRFS_FILE_EXTENT_PREALLOC && found > 0 {
            r.errors |= I_ERR_ODD_CSUM_ITEM;
        }
    }
    Ok(())
}

fn process_one_leaf(
    fs: &FsInfo,
    root: &Rc<Root>,
    eb: &EbRef,
    wc: &mut WalkControl,
) -> Result<()> {
    if wc.root_level == wc.active_node && root.refs() == 0 {
        return Ok(());
    }
    let active_node = wc.active();
    let nritems = eb.nritems() as usize;
    for i in 0..nritems {
        let key = eb.item_key(i);
        if key.objectid == BTRFS_FREE_SPACE_OBJECTID {
            continue;
        }

        {
            let node = &mut *active_node.borrow_mut();
            let need_new = match &node.current {
                Some(cur) => cur.borrow().ino < key.objectid,
                None => true,
            };
            if need_new {
                if let Some(cur) = node.current.take() {
                    cur.borrow_mut().checked = true;
                    maybe_free_inode_rec(&mut node.inode_cache, &cur);
                }
                node.current = get_inode_rec(&mut node.inode_cache, key.objectid, true);
            }
        }

        match key.item_type {
            BTRFS_DIR_ITEM_KEY | BTRFS_DIR_INDEX_KEY => {
                process_dir_item(eb, i, &key, &active_node)
            }
            BTRFS_INODE_REF_KEY => process_inode_ref(eb, i, &key, &active_node),
            BTRFS_INODE_EXTREF_KEY => process_inode_extref(eb, i, &key, &active_node),
            BTRFS_INODE_ITEM_KEY => process_inode_item(eb, i, &key, &active_node),
            BTRFS_EXTENT_DATA_KEY => process_file_extent(fs, eb, i, &key, &active_node)?,
            _ => {}
        }
    }
    Ok(())
}

fn reada_walk_down(fs: &FsInfo, node: &EbRef, slot: usize) {
    if node.level() != 1 {
        return;
    }
    let nritems = node.nritems() as usize;
    for i in slot..nritems {
        readahead_tree_block(fs, node.node_blockptr(i), fs.nodesize as u64);
    }
}

fn walk_down_tree(
    fs: &FsInfo,
    root: &Rc<Root>,
    path: &mut Path,
    wc: &mut WalkControl,
    level: &mut usize,
) -> Result<()> {
    let start = path.nodes[*level].as_ref().unwrap().start;
    let refs = match lookup_extent_info(fs, start) {
        Ok(Some((refs, _))) => refs,
        _ => 0,
    };
    let mut skip = false;
    if refs > 1 {
        skip = enter_shared_node(root, start, refs, wc, *level);
    }

    if !skip {
        loop {
            let cur = path.nodes[*level].as_ref().unwrap().clone();
            if cur.level() as usize != *level {
                eprintln!("mismatched level {} in block {}", cur.level(), cur.start);
            }
            if path.slots[*level] >= cur.nritems() as usize {
                break;
            }
            if *level == 0 {
                process_one_leaf(fs, root, &cur, wc)?;
                break;
            }
            let slot = path.slots[*level];
            let bytenr = cur.node_blockptr(slot);
            let refs = match lookup_extent_info(fs, bytenr) {
                Ok(Some((refs, _))) => refs,
                _ => 0,
            };
            if refs > 1 && enter_shared_node(root, bytenr, refs, wc, *level - 1) {
                path.slots[*level] += 1;
                continue;
            }

            if !fs.block_cache.borrow().contains_key(&bytenr) {
                reada_walk_down(fs, &cur, slot);
            }
            let next = read_tree_block(fs, bytenr)?;
            *level -= 1;
            path.nodes[*level] = Some(next);
            path.slots[*level] = 0;
        }
    }
    let nritems = path.nodes[*level].as_ref().unwrap().nritems() as usize;
    path.slots[*level] = nritems;
    Ok(())
}

fn walk_up_tree(
    root: &Rc<Root>,
    path: &mut Path,
    wc: &mut WalkControl,
    level: &mut usize,
) -> i32 {
    let mut i = *level;
    while i < BTRFS_MAX_LEVEL - 1 {
        let Some(node) = path.nodes[i].clone() else {
            break;
        };
        if path.slots[i] + 1 < node.nritems() as usize {
            path.slots[i] += 1;
            *level = i;
            return 0;
        }
        path.nodes[i] = None;
        assert!(*level <= wc.active_node);
        if *level == wc.active_node {
            leave_shared_node(root, wc, *level);
        }
        *level = i + 1;
        i += 1;
    }
    1
}

fn check_root_dir(rec: &InodeRecRef) -> bool {
    let r = rec.borrow();
    if !r.found_inode_item || r.errors != 0 {
        return false;
    }
    if r.nlink != 1 || r.found_link != 0 {
        return false;
    }
    if r.backrefs.len() != 1 {
        return false;
    }
    let backref = &r.backrefs[0];
    if !backref.found_inode_ref {
        return false;
    }
    if backref.index != 0 || backref.name != b".." {
        return false;
    }
    if backref.found_dir_index || backref.found_dir_item {
        return false;
    }
    true
}

fn check_inode_recs(fs: &FsInfo, root: &Rc<Root>, inode_cache: &mut InodeCache) -> u64 {
    let mut error = 0_u64;
    let root_dirid = root.root_item.borrow().root_dirid;

    if root.refs() == 0 {
        if !inode_cache.is_empty() {
            eprintln!(
                "warning: dropped root {} still had inode records",
                root.objectid
            );
        }
        return 0;
    }

    match get_inode_rec(inode_cache, root_dirid, false) {
        Some(rec) => {
            if !check_root_dir(&rec) {
                eprintln!(
                    "root {} root dir {} error",
                    root.objectid, root_dirid
                );
                error += 1;
            }
        }
        None => {
            eprintln!(
                "root {} root dir {} not found",
                root.objectid, root_dirid
            );
        }
    }

    while let Some((ino, _, rec)) = inode_cache.pop_first() {
        if ino == root_dirid || ino == BTRFS_ORPHAN_OBJECTID {
            free_inode_rec(&rec);
            continue;
        }

        if rec.borrow().errors & I_ERR_NO_ORPHAN_ITEM != 0 {
            let found = check_orphan_item(fs, root, ino).unwrap_or(false);
            if found {
                rec.borrow_mut().errors &= !I_ERR_NO_ORPHAN_ITEM;
            }
            if can_free_inode_rec(&rec.borrow()) {
                free_inode_rec(&rec);
                continue;
            }
        }

        error += 1;
        {
            let mut r = rec.borrow_mut();
            if !r.found_inode_item {
                r.errors |= I_ERR_NO_INODE_ITEM;
            }
            if r.found_link != r.nlink {
                r.errors |= I_ERR_LINK_COUNT_WRONG;
            }
            eprintln!(
                "root {} inode {} errors {:x}",
                root.objectid, ino, r.errors
            );
            for backref in r.backrefs.iter_mut() {
                if !backref.found_dir_item {
                    backref.errors |= REF_ERR_NO_DIR_ITEM;
                }
                if !backref.found_dir_index {
                    backref.errors |= REF_ERR_NO_DIR_INDEX;
                }
                if !backref.found_inode_ref {
                    backref.errors |= REF_ERR_NO_INODE_REF;
                }
                eprintln!(
                    "\tunresolved ref dir {} index {} namelen {} name {} filetype {} error {:x}",
                    backref.dir,
                    backref.index,
                    backref.name.len(),
                    String::from_utf8_lossy(&backref.name),
                    backref.filetype,
                    backref.errors
                );
            }
        }
        free_inode_rec(&rec);
    }
    error
}

/// does `child_root_id` hang off `parent_root_id`? 1 yes, 0 it has some
/// other parent, -1 it has no parent at all
fn is_child_root(fs: &FsInfo, parent_root_id: u64, child_root_id: u64) -> Result<i32> {
    let tree_root = fs.tree_root();
    let mut path = Path::new();
    let key = Key::new(parent_root_id, BTRFS_ROOT_REF_KEY, child_root_id);
    let found = search_slot(None, fs, &tree_root, &key, &mut path, 0, false)?;
    if found {
        return Ok(1);
    }
    path.release();

    let mut has_parent = false;
    let key = Key::new(child_root_id, BTRFS_ROOT_BACKREF_KEY, 0);
    search_slot(None, fs, &tree_root, &key, &mut path, 0, false)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &tree_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.objectid != child_root_id || key.item_type != BTRFS_ROOT_BACKREF_KEY {
            break;
        }
        has_parent = true;
        if key.offset == parent_root_id {
            return Ok(1);
        }
        path.slots[0] += 1;
    }
    Ok(if has_parent { 0 } else { -1 })
}

/// promote the subvolume-naming entries gathered during the walk into
/// root backrefs
fn merge_root_recs(
    fs: &FsInfo,
    root: &Rc<Root>,
    src_cache: &mut InodeCache,
    root_cache: &mut RootCache,
) -> Result<()> {
    if root.objectid == BTRFS_TREE_RELOC_OBJECTID {
        while let Some((_, _, rec)) = src_cache.pop_first() {
            free_inode_rec(&rec);
        }
        return Ok(());
    }

    while let Some((ino, _, rec)) = src_cache.pop_first() {
        if is_child_root(fs, root.objectid, ino)? != 0 {
            let r = rec.borrow();
            for backref in &r.backrefs {
                assert!(!backref.found_inode_ref);
                if backref.found_dir_item {
                    add_root_backref(
                        root_cache,
                        ino,
                        root.objectid,
                        backref.dir,
                        backref.index,
                        &backref.name,
                        BTRFS_DIR_ITEM_KEY,
                        backref.errors,
                    );
                }
                if backref.found_dir_index {
                    add_root_backref(
                        root_cache,
                        ino,
                        root.objectid,
                        backref.dir,
                        backref.index,
                        &backref.name,
                        BTRFS_DIR_INDEX_KEY,
                        backref.errors,
                    );
                }
            }
        }
        free_inode_rec(&rec);
    }
    Ok(())
}

pub fn process_root_ref(eb: &EbRef, slot: usize, key: &Key, root_cache: &mut RootCache) {
    let data = eb.item_data(slot);
    let dirid = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let index = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let name_len = u16::from_le_bytes(data[16..18].try_into().unwrap()) as usize;
    let (len, error) = if name_len <= BTRFS_NAME_LEN {
        (name_len, 0)
    } else {
        (BTRFS_NAME_LEN, REF_ERR_NAME_TOO_LONG)
    };
    let name = &data[18..18 + len];

    if key.item_type == BTRFS_ROOT_REF_KEY {
        add_root_backref(
            root_cache,
            key.offset,
            key.objectid,
            dirid,
            index,
            name,
            key.item_type,
            error,
        );
    } else {
        add_root_backref(
            root_cache,
            key.objectid,
            key.offset,
            dirid,
            index,
            name,
            key.item_type,
            error,
        );
    }
}

fn check_fs_root(
    fs: &FsInfo,
    root: &Rc<Root>,
    root_cache: &mut RootCache,
    wc: &mut WalkControl,
) -> Result<u64> {
    if root.objectid != BTRFS_TREE_RELOC_OBJECTID {
        let rec = get_root_rec(root_cache, root.objectid);
        if root.refs() > 0 {
            rec.borrow_mut().found_root_item = true;
        }
    }

    let mut path = Path::new();
    let root_node = new_shared_node(0);

    let mut level = root.node().level() as usize;
    wc.nodes = Default::default();
    wc.nodes[level] = Some(root_node.clone());
    wc.active_node = level;
    wc.root_level = level;

    let drop_progress = root.root_item.borrow().drop_progress;
    if root.refs() > 0 || drop_progress.objectid == 0 {
        path.nodes[level] = Some(root.node());
        path.slots[level] = 0;
    } else {
        level = root.root_item.borrow().drop_level as usize;
        path.lowest_level = level as u8;
        search_slot(None, fs, root, &drop_progress, &mut path, 0, false)?;
        let node = path.nodes[level].as_ref().unwrap();
        let found_key = if level == 0 {
            node.item_key(path.slots[level].min((node.nritems() as usize).saturating_sub(1)))
        } else {
            node.node_key(path.slots[level])
        };
        if found_key != drop_progress {
            eprintln!(
                "warning: drop progress key not found in root {}",
                root.objectid
            );
        }
    }

    loop {
        walk_down_tree(fs, root, &mut path, wc, &mut level)?;
        if walk_up_tree(root, &mut path, wc, &mut level) != 0 {
            break;
        }
    }
    path.release();

    {
        let node = &mut *root_node.borrow_mut();
        merge_root_recs(fs, root, &mut node.root_cache, root_cache)?;

        if let Some(cur) = node.current.take() {
            cur.borrow_mut().checked = true;
            maybe_free_inode_rec(&mut node.inode_cache, &cur);
        }
    }

    let errors = check_inode_recs(fs, root, &mut root_node.borrow_mut().inode_cache);
    Ok(errors)
}

/// walk the tree of trees, checking every filesystem tree hanging off it
pub fn check_fs_roots(fs: &FsInfo, root_cache: &mut RootCache) -> Result<bool> {
    let tree_root = fs.tree_root();
    let mut wc = WalkControl::new();
    let mut err = false;

    let mut path = Path::new();
    let key = Key::new(0, BTRFS_ROOT_ITEM_KEY, 0);
    search_slot(None, fs, &tree_root, &key, &mut path, 0, false)?;
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, &tree_root, &mut path)? != 0 {
                break;
            }
            continue;
        }
        let key = leaf.item_key(path.slots[0]);
        if key.item_type == BTRFS_ROOT_ITEM_KEY && is_fs_root_objectid(key.objectid) {
            let ri = parse_root_item(&leaf.item_data(path.slots[0]));
            match read_tree_block(fs, ri.bytenr) {
                Ok(node) => {
                    let root = Root::new(key.objectid, node, ri);
                    match check_fs_root(fs, &root, root_cache, &mut wc) {
                        Ok(errors) if errors > 0 => err = true,
                        Ok(_) => {}
                        Err(e) => {
                            eprintln!("error walking root {}: {e}", key.objectid);
                            err = true;
                        }
                    }
                }
                Err(e) => {
                    eprintln!("cannot read root {}: {e}", key.objectid);
                    err = true;
                }
            }
        } else if key.item_type == BTRFS_ROOT_REF_KEY
            || key.item_type == BTRFS_ROOT_BACKREF_KEY
        {
            process_root_ref(&leaf, path.slots[0], &key, root_cache);
        }
        path.slots[0] += 1;
    }

    if !wc.shared.is_empty() {
        eprintln!("warning: shared node cache not drained after fs root walk");
    }
    debug!("fs root walk done, err = {err}");
    Ok(err)
}

/// reachability over the subvolume graph: strip found_refs contributed by
/// unreachable parents until a fixpoint. Reference cycles are not
/// detected and keep themselves alive.
pub fn check_root_refs(fs: &FsInfo, root_cache: &mut RootCache) -> u64 {
    let rec = get_root_rec(root_cache, BTRFS_FS_TREE_OBJECTID);
    rec.borrow_mut().found_ref = 1;

    let mut loop_again = true;
    while loop_again {
        loop_again = false;
        let recs: Vec<RootRecRef> = root_cache.iter().map(|(_, _, r)| r.clone()).collect();
        for rec in &recs {
            if rec.borrow().found_ref == 0 {
                continue;
            }
            let backref_roots: Vec<(usize, u64)> = rec
                .borrow()
                .backrefs
                .iter()
                .enumerate()
                .filter(|(_, b)| b.reachable)
                .map(|(i, b)| (i, b.ref_root))
                .collect();
            for (i, ref_root) in backref_roots {
                let parent = get_root_rec(root_cache, ref_root);
                if parent.borrow().found_ref > 0 {
                    continue;
                }
                let mut r = rec.borrow_mut();
                r.backrefs[i].reachable = false;
                r.found_ref -= 1;
                if r.found_ref == 0 {
                    loop_again = true;
                }
            }
        }
    }

    let mut errors = 0_u64;
    let recs: Vec<RootRecRef> = root_cache.iter().map(|(_, _, r)| r.clone()).collect();
    for rec in recs {
        let mut r = rec.borrow_mut();
        if r.found_ref == 0
            && (BTRFS_FIRST_FREE_OBJECTID..=BTRFS_LAST_FREE_OBJECTID).contains(&r.objectid)
        {
            let orphan = check_orphan_item(fs, &fs.tree_root(), r.objectid).unwrap_or(false);
            if orphan {
                continue;
            }
            errors += 1;
            eprintln!("fs tree {} not referenced", r.objectid);
        }

        let mut error = false;
        if r.found_ref > 0 && !r.found_root_item {
            error = true;
        }
        for backref in r.backrefs.iter_mut() {
            if !backref.found_dir_item {
                backref.errors |= REF_ERR_NO_DIR_ITEM;
            }
            if !backref.found_dir_index {
                backref.errors |= REF_ERR_NO_DIR_INDEX;
            }
            if !backref.found_back_ref {
                backref.errors |= REF_ERR_NO_ROOT_BACKREF;
            }
            if !backref.found_forward_ref {
                backref.errors |= REF_ERR_NO_ROOT_REF;
            }
            if backref.reachable && backref.errors != 0 {
                error = true;
            }
        }
        if !error {
            continue;
        }

        errors += 1;
        eprintln!(
            "fs tree {} refs {} {}",
            r.objectid,
            r.found_ref,
            if r.found_root_item { "" } else { "not found" }
        );
        for backref in &r.backrefs {
            if !backref.reachable {
                continue;
            }
            if backref.errors == 0 && r.found_root_item {
                continue;
            }
            eprintln!(
                "\tunresolved ref root {} dir {} index {} namelen {} name {} error {:x}",
                backref.ref_root,
                backref.dir,
                backref.index,
                backref.name.len(),
                String::from_utf8_lossy(&backref.name),
                backref.errors
            );
        }
    }
    errors
}
