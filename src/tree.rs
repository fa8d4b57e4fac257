use crate::btrfs::{FsInfo, Root};
use crate::disk_io::{drop_cached_block, read_tree_block, readahead_tree_block};
use crate::error::{FsckError, Result};
use crate::extent_buffer::{EbRef, ExtentBuffer};
use crate::extent_tree::{
    alloc_free_block, free_extent, lookup_extent_info, mod_ref, set_block_flags,
};
use crate::structures::*;
use crate::transaction::TransHandle;

use log::debug;
use std::rc::Rc;

/// Search and mutation over one btrfs tree. A Path is a root-to-leaf
/// cursor: nodes[level] holds a reference on the block visited at that
/// level, slots[level] the index taken within it.

pub struct Path {
    pub nodes: [Option<EbRef>; BTRFS_MAX_LEVEL],
    pub slots: [usize; BTRFS_MAX_LEVEL],
    /// readahead direction for leaf iteration: -1 back, 0 off, 1 forward
    pub reada: i8,
    pub lowest_level: u8,
    pub search_for_split: bool,
}

impl Path {
    pub fn new() -> Path {
        Path {
            nodes: Default::default(),
            slots: [0; BTRFS_MAX_LEVEL],
            reada: 0,
            lowest_level: 0,
            search_for_split: false,
        }
    }

    pub fn release(&mut self) {
        for i in 0..BTRFS_MAX_LEVEL {
            self.nodes[i] = None;
            self.slots[i] = 0;
        }
    }

    pub fn leaf(&self) -> EbRef {
        self.nodes[0].as_ref().expect("path has no leaf").clone()
    }
}

impl Default for Path {
    fn default() -> Self {
        Path::new()
    }
}

pub fn leaf_data_size(fs: &FsInfo) -> u32 {
    fs.nodesize - BTRFS_HEADER_SIZE as u32
}

pub fn nodeptrs_per_block(fs: &FsInfo) -> u32 {
    leaf_data_size(fs) / BTRFS_KEY_PTR_SIZE as u32
}

/// The leaf data grows from end-to-front in the block; this returns the
/// start of the last item, which is the stop of the leaf data stack.
pub fn leaf_data_end(fs: &FsInfo, leaf: &EbRef) -> u32 {
    let nr = leaf.nritems();
    if nr == 0 {
        return leaf_data_size(fs);
    }
    leaf.item_offset(nr as usize - 1)
}

/// bytes used by items [start, start + nr): item structs plus their data
fn leaf_space_used(leaf: &EbRef, start: usize, nr: usize) -> u32 {
    let nritems = leaf.nritems() as usize;
    if nr == 0 {
        return 0;
    }
    let end = nritems.min(start + nr) - 1;
    let data_len = leaf.item_end(start) - leaf.item_offset(end);
    data_len + (BTRFS_ITEM_SIZE * nr) as u32
}

pub fn leaf_free_space(fs: &FsInfo, leaf: &EbRef) -> i64 {
    let nritems = leaf.nritems() as usize;
    leaf_data_size(fs) as i64 - leaf_space_used(leaf, 0, nritems) as i64
}

pub fn check_node(fs: &FsInfo, parent_key: Option<&Key>, buf: &EbRef) -> Result<()> {
    let nritems = buf.nritems();
    let fail = |reason: &str| {
        eprintln!("bad node {}: {}", buf.start, reason);
        record_invalid_block(fs, parent_key, buf);
        Err(FsckError::BadBlock(buf.start))
    };

    if nritems == 0 || nritems > nodeptrs_per_block(fs) {
        return fail("invalid number of ptrs");
    }
    if let Some(pk) = parent_key {
        if pk.item_type != 0 && *pk != buf.node_key(0) {
            return fail("parent key mismatch");
        }
    }
    for i in 0..nritems.saturating_sub(1) as usize {
        if buf.node_key(i) >= buf.node_key(i + 1) {
            return fail("bad key ordering");
        }
    }
    Ok(())
}

pub fn check_leaf(fs: &FsInfo, parent_key: Option<&Key>, buf: &EbRef) -> Result<()> {
    let nritems = buf.nritems();
    let fail = |reason: &str| {
        eprintln!("bad leaf {}: {}", buf.start, reason);
        record_invalid_block(fs, parent_key, buf);
        Err(FsckError::BadBlock(buf.start))
    };

    if nritems as usize * BTRFS_ITEM_SIZE > buf.len() as usize {
        return fail("invalid number of items");
    }
    if buf.level() != 0 {
        return fail("leaf is not a leaf");
    }
    if leaf_free_space(fs, buf) < 0 {
        return fail("leaf free space incorrect");
    }
    if nritems == 0 {
        return Ok(());
    }
    if let Some(pk) = parent_key {
        if pk.item_type != 0 && *pk != buf.item_key(0) {
            return fail("leaf parent key incorrect");
        }
    }
    for i in 0..nritems as usize {
        if i + 1 < nritems as usize {
            if buf.item_key(i) >= buf.item_key(i + 1) {
                return fail("bad key ordering");
            }
            if buf.item_offset(i) != buf.item_end(i + 1) {
                return fail("incorrect item offsets");
            }
        }
        if i == 0 && buf.item_end(i) != leaf_data_size(fs) {
            return fail("bad item end");
        }
    }
    Ok(())
}

/// structural failures in extent tree blocks feed the corrupt-block
/// registry so repair can prune them
fn record_invalid_block(fs: &FsInfo, parent_key: Option<&Key>, buf: &EbRef) {
    if buf.header_owner() != BTRFS_EXTENT_TREE_OBJECTID {
        return;
    }
    let key = match parent_key {
        Some(k) => *k,
        None => buf.first_key(),
    };
    fs.add_corrupt_block(&key, buf.start, buf.len() as u64, buf.level());
}

fn check_block_in_path(fs: &FsInfo, p: &Path, level: usize) -> Result<()> {
    let mut key = None;
    if level + 1 < BTRFS_MAX_LEVEL {
        if let Some(parent) = &p.nodes[level + 1] {
            key = Some(parent.node_key(p.slots[level + 1]));
        }
    }
    let buf = p.nodes[level].as_ref().unwrap();
    if level == 0 {
        check_leaf(fs, key.as_ref(), buf)
    } else {
        check_node(fs, key.as_ref(), buf)
    }
}

/// binary search within one block; on miss the returned slot is where the
/// key would be inserted (may equal nritems)
pub fn bin_search(eb: &EbRef, key: &Key, level: usize) -> (bool, usize) {
    let nritems = eb.nritems() as usize;
    let mut low = 0;
    let mut high = nritems;
    while low < high {
        let mid = (low + high) / 2;
        let mid_key = if level == 0 {
            eb.item_key(mid)
        } else {
            eb.node_key(mid)
        };
        match mid_key.cmp(key) {
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
            std::cmp::Ordering::Equal => return (true, mid),
        }
    }
    (false, low)
}

pub fn read_node_slot(fs: &FsInfo, parent: &EbRef, slot: usize) -> Result<EbRef> {
    assert!(!parent.is_leaf());
    assert!(slot < parent.nritems() as usize);
    read_tree_block(fs, parent.node_blockptr(slot))
}

fn try_read_node_slot(fs: &FsInfo, parent: &EbRef, slot: isize) -> Option<EbRef> {
    if slot < 0 || slot as usize >= parent.nritems() as usize {
        return None;
    }
    read_tree_block(fs, parent.node_blockptr(slot as usize)).ok()
}

/*
 * COW
 */

pub fn block_can_be_shared(root: &Root, buf: &EbRef) -> bool {
    root.ref_cows
        && !Rc::ptr_eq(buf, &root.node())
        && (buf.header_generation() <= root.root_item.borrow().last_snapshot
            || buf.header_flag(BTRFS_HEADER_FLAG_RELOC))
}

fn should_cow_block(trans: &TransHandle, root: &Root, buf: &EbRef) -> bool {
    !(buf.header_generation() == trans.transid
        && !buf.header_flag(BTRFS_HEADER_FLAG_WRITTEN)
        && !(root.objectid != BTRFS_TREE_RELOC_OBJECTID
            && buf.header_flag(BTRFS_HEADER_FLAG_RELOC)))
}

/// Backrefs update rules:
///
/// Always use full backrefs for extent pointers in tree blocks allocated
/// by tree relocation.
///
/// If a shared tree block is no longer referenced by its owner tree
/// (header owner == root objectid), use full backrefs for its extent
/// pointers, since the owner-encoded ref is about to go away.
fn update_ref_for_cow(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    buf: &EbRef,
    cow: &EbRef,
) -> Result<()> {
    let refs;
    let mut flags;
    if block_can_be_shared(root, buf) {
        let (r, f) =
            lookup_extent_info(fs, buf.start)?.ok_or(FsckError::BadBlock(buf.start))?;
        refs = r;
        flags = f;
        assert!(refs > 0);
    } else {
        refs = 1;
        if root.objectid == BTRFS_TREE_RELOC_OBJECTID
            || buf.backref_rev() < BTRFS_MIXED_BACKREF_REV
        {
            flags = BTRFS_BLOCK_FLAG_FULL_BACKREF;
        } else {
            flags = 0;
        }
    }

    let owner = buf.header_owner();
    assert!(
        flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0 || owner != BTRFS_TREE_RELOC_OBJECTID
    );

    if refs > 1 {
        if (owner == root.objectid || root.objectid == BTRFS_TREE_RELOC_OBJECTID)
            && flags & BTRFS_BLOCK_FLAG_FULL_BACKREF == 0
        {
            mod_ref(trans, fs, root, buf, true, true)?;

            if root.objectid == BTRFS_TREE_RELOC_OBJECTID {
                mod_ref(trans, fs, root, buf, false, false)?;
                mod_ref(trans, fs, root, cow, true, true)?;
            }
            flags = BTRFS_BLOCK_FLAG_FULL_BACKREF;
            set_block_flags(trans, fs, buf.start, flags)?;
        } else if root.objectid == BTRFS_TREE_RELOC_OBJECTID {
            mod_ref(trans, fs, root, cow, true, true)?;
        } else {
            mod_ref(trans, fs, root, cow, true, false)?;
        }
    } else {
        if flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0 {
            if root.objectid == BTRFS_TREE_RELOC_OBJECTID {
                mod_ref(trans, fs, root, cow, true, true)?;
            } else {
                mod_ref(trans, fs, root, cow, true, false)?;
            }
            mod_ref(trans, fs, root, buf, false, true)?;
        }
        clean_tree_block(fs, buf);
    }
    Ok(())
}

fn cow_block_impl(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    buf: &EbRef,
    parent: Option<(EbRef, usize)>,
    search_start: u64,
) -> Result<EbRef> {
    let level = buf.level();
    let cow = alloc_free_block(trans, fs, root.objectid, level, search_start)?;

    cow.copy_from(buf, 0, 0, cow.len() as usize);
    cow.set_header_bytenr(cow.start);
    cow.set_header_generation(trans.transid);
    cow.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
    cow.clear_header_flag(BTRFS_HEADER_FLAG_WRITTEN | BTRFS_HEADER_FLAG_RELOC);
    if root.objectid == BTRFS_TREE_RELOC_OBJECTID {
        cow.set_header_flag(BTRFS_HEADER_FLAG_RELOC);
    } else {
        cow.set_header_owner(root.objectid);
    }
    cow.set_header_fsid(&fs.fsid);
    cow.set_header_chunk_tree_uuid(&fs.chunk_tree_uuid.get());

    assert!(buf.header_generation() <= trans.transid);
    update_ref_for_cow(trans, fs, root, buf, &cow)?;

    if Rc::ptr_eq(buf, &root.node()) {
        *root.node.borrow_mut() = cow.clone();
        free_extent(
            trans,
            fs,
            buf.start,
            buf.len() as u64,
            0,
            root.objectid,
            level as u64,
            0,
        )?;
        fs.mark_root_dirty(root);
    } else {
        let (parent, parent_slot) = parent.expect("non-root block COWed without a parent");
        parent.set_node_blockptr(parent_slot, cow.start);
        parent.set_node_ptr_generation(parent_slot, trans.transid);
        parent.mark_dirty();
        free_extent(
            trans,
            fs,
            buf.start,
            buf.len() as u64,
            0,
            root.objectid,
            level as u64,
            0,
        )?;
    }
    cow.mark_dirty();
    Ok(cow)
}

pub fn cow_block(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    buf: &EbRef,
    parent: Option<(EbRef, usize)>,
) -> Result<EbRef> {
    if trans.transid != fs.generation.get() {
        panic!(
            "trans {} running {}",
            trans.transid,
            fs.generation.get()
        );
    }
    if !should_cow_block(trans, root, buf) {
        return Ok(buf.clone());
    }
    let search_start = buf.start & !((1_u64 << 30) - 1);
    cow_block_impl(trans, fs, root, buf, parent, search_start)
}

/// a freed or superseded block must not hit the disk
fn clean_tree_block(fs: &FsInfo, buf: &EbRef) {
    buf.clear_dirty();
    let _ = fs;
}

/*
 * search
 */

/// look for key in the tree, filling in the path along the way.
///
/// Returns true if the key was found exactly; otherwise the path points
/// at the slot where it would be inserted.
///
/// ins_len > 0 splits nodes and leaves on the way down so the target leaf
/// ends up with `ins_len` free bytes; ins_len < 0 rebalances on the way
/// down; `cow` copies every visited block into the current transaction.
pub fn search_slot(
    trans: Option<&TransHandle>,
    fs: &FsInfo,
    root: &Rc<Root>,
    key: &Key,
    p: &mut Path,
    ins_len: i32,
    cow: bool,
) -> Result<bool> {
    let lowest_level = p.lowest_level as usize;
    assert!(lowest_level == 0 || ins_len <= 0);
    assert!(p.nodes[0].is_none());
    assert!(cow || ins_len == 0);

    'again: loop {
        let mut b = root.node();
        loop {
            let mut level = b.level() as usize;
            if cow {
                let trans = trans.expect("cow search without transaction");
                let parent = if level + 1 < BTRFS_MAX_LEVEL {
                    p.nodes[level + 1]
                        .clone()
                        .map(|pb| (pb, p.slots[level + 1]))
                } else {
                    None
                };
                b = cow_block(trans, fs, root, &b, parent)?;
            }
            level = b.level() as usize;
            p.nodes[level] = Some(b.clone());
            check_block_in_path(fs, p, level)?;
            let (found, mut slot) = bin_search(&b, key, level);
            if level != 0 {
                if !found && slot > 0 {
                    slot -= 1;
                }
                p.slots[level] = slot;
                if (p.search_for_split || ins_len > 0)
                    && b.nritems() >= nodeptrs_per_block(fs) - 3
                {
                    split_node(trans.unwrap(), fs, root, p, level)?;
                    b = p.nodes[level].clone().unwrap();
                    slot = p.slots[level];
                } else if ins_len < 0 {
                    balance_level(trans.unwrap(), fs, root, p, level)?;
                    if p.nodes[level].is_none() {
                        p.release();
                        continue 'again;
                    }
                    b = p.nodes[level].clone().unwrap();
                    slot = p.slots[level];
                    assert_ne!(b.nritems(), 1);
                }
                /* this is only true while dropping a snapshot */
                if level == lowest_level {
                    return Ok(found);
                }

                if p.reada != 0 {
                    reada_for_search(fs, p, level, slot, key.objectid);
                }

                b = read_node_slot(fs, &b, slot)?;
            } else {
                p.slots[level] = slot;
                if ins_len > 0 && leaf_free_space(fs, &b) < ins_len as i64 {
                    split_leaf(trans.unwrap(), fs, root, key, p, ins_len as u32, found)?;
                }
                return Ok(found);
            }
        }
    }
}

/// adjust the pointers going up the tree, making sure the key of each
/// node points to 'key'; stops at the first ancestor where our slot is
/// not slot 0
fn fixup_low_keys(p: &Path, key: &Key, level: usize) {
    for i in level..BTRFS_MAX_LEVEL {
        let tslot = p.slots[i];
        let Some(t) = &p.nodes[i] else { break };
        t.set_node_key(tslot, key);
        t.mark_dirty();
        if tslot != 0 {
            break;
        }
    }
}

/// update the key of the item the path points at. The caller must make
/// sure the new key still sits strictly between both neighbours.
pub fn set_item_key_safe(p: &Path, new_key: &Key) -> Result<()> {
    let eb = p.leaf();
    let slot = p.slots[0];
    if slot > 0 && eb.item_key(slot - 1) >= *new_key {
        return Err(FsckError::Unsupported("new key breaks leaf ordering"));
    }
    if slot + 1 < eb.nritems() as usize && eb.item_key(slot + 1) <= *new_key {
        return Err(FsckError::Unsupported("new key breaks leaf ordering"));
    }
    eb.set_item_key(slot, new_key);
    eb.mark_dirty();
    if slot == 0 {
        fixup_low_keys(p, new_key, 1);
    }
    Ok(())
}

/*
 * node balancing
 */

/// try to push key pointers from src into dst (dst is left of src);
/// returns 1 if nothing could be moved
fn push_node_left(
    trans: &TransHandle,
    fs: &FsInfo,
    dst: &EbRef,
    src: &EbRef,
    empty: bool,
) -> Result<i32> {
    let src_nritems = src.nritems() as i64;
    let dst_nritems = dst.nritems() as i64;
    let mut push_items = nodeptrs_per_block(fs) as i64 - dst_nritems;
    assert_eq!(src.header_generation(), trans.transid);
    assert_eq!(dst.header_generation(), trans.transid);

    if !empty && src_nritems <= 8 {
        return Ok(1);
    }
    if push_items <= 0 {
        return Ok(1);
    }

    if empty {
        push_items = push_items.min(src_nritems);
        if push_items < src_nritems {
            /* leave at least 8 pointers in the node if
             * we aren't going to empty it
             */
            if src_nritems - push_items < 8 {
                if push_items <= 8 {
                    return Ok(1);
                }
                push_items -= 8;
            }
        }
    } else {
        push_items = push_items.min(src_nritems - 8);
    }
    let push_items = push_items as usize;

    dst.copy_from(
        src,
        ExtentBuffer::key_ptr_offset(dst_nritems as usize),
        ExtentBuffer::key_ptr_offset(0),
        push_items * BTRFS_KEY_PTR_SIZE,
    );
    if (push_items as i64) < src_nritems {
        src.memmove(
            ExtentBuffer::key_ptr_offset(0),
            ExtentBuffer::key_ptr_offset(push_items),
            (src_nritems as usize - push_items) * BTRFS_KEY_PTR_SIZE,
        );
    }
    src.set_nritems((src_nritems - push_items as i64) as u32);
    dst.set_nritems((dst_nritems + push_items as i64) as u32);
    src.mark_dirty();
    dst.mark_dirty();
    Ok(0)
}

/// push key pointers from src into dst (dst is right of src); moves at
/// most half of what src holds
fn balance_node_right(
    trans: &TransHandle,
    fs: &FsInfo,
    dst: &EbRef,
    src: &EbRef,
) -> Result<i32> {
    assert_eq!(src.header_generation(), trans.transid);
    assert_eq!(dst.header_generation(), trans.transid);

    let src_nritems = src.nritems() as i64;
    let dst_nritems = dst.nritems() as i64;
    let mut push_items = nodeptrs_per_block(fs) as i64 - dst_nritems;
    if push_items <= 0 {
        return Ok(1);
    }
    if src_nritems < 4 {
        return Ok(1);
    }

    let max_push = src_nritems / 2 + 1;
    /* don't try to empty the node */
    if max_push >= src_nritems {
        return Ok(1);
    }
    push_items = push_items.min(max_push);
    let push_items = push_items as usize;

    dst.memmove(
        ExtentBuffer::key_ptr_offset(push_items),
        ExtentBuffer::key_ptr_offset(0),
        dst_nritems as usize * BTRFS_KEY_PTR_SIZE,
    );
    dst.copy_from(
        src,
        ExtentBuffer::key_ptr_offset(0),
        ExtentBuffer::key_ptr_offset((src_nritems as usize) - push_items),
        push_items * BTRFS_KEY_PTR_SIZE,
    );

    src.set_nritems((src_nritems - push_items as i64) as u32);
    dst.set_nritems((dst_nritems + push_items as i64) as u32);
    src.mark_dirty();
    dst.mark_dirty();
    Ok(0)
}

/// insert a new root level above the current root node
fn insert_new_root(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    level: usize,
) -> Result<()> {
    assert!(p.nodes[level].is_none());
    assert!(Rc::ptr_eq(p.nodes[level - 1].as_ref().unwrap(), &root.node()));

    let lower = p.nodes[level - 1].as_ref().unwrap().clone();
    let lower_key = lower.first_key();

    let c = alloc_free_block(trans, fs, root.objectid, level as u8, root.node().start)?;
    c.memset(0, BTRFS_HEADER_SIZE);
    c.set_nritems(1);
    c.set_level(level as u8);
    c.set_header_bytenr(c.start);
    c.set_header_generation(trans.transid);
    c.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
    c.set_header_owner(root.objectid);
    c.set_header_fsid(&fs.fsid);
    c.set_header_chunk_tree_uuid(&fs.chunk_tree_uuid.get());

    c.set_node_key(0, &lower_key);
    c.set_node_blockptr(0, lower.start);
    let lower_gen = lower.header_generation();
    assert_eq!(lower_gen, trans.transid);
    c.set_node_ptr_generation(0, lower_gen);
    c.mark_dirty();

    *root.node.borrow_mut() = c.clone();
    fs.mark_root_dirty(root);
    p.nodes[level] = Some(c);
    p.slots[level] = 0;
    Ok(())
}

/// insert one pointer in a node that already has room for it
fn insert_ptr(
    trans: &TransHandle,
    p: &Path,
    key: &Key,
    bytenr: u64,
    slot: usize,
    level: usize,
) {
    let lower = p.nodes[level].as_ref().expect("insert_ptr without node");
    let nritems = lower.nritems() as usize;
    assert!(slot <= nritems);
    if slot != nritems {
        lower.memmove(
            ExtentBuffer::key_ptr_offset(slot + 1),
            ExtentBuffer::key_ptr_offset(slot),
            (nritems - slot) * BTRFS_KEY_PTR_SIZE,
        );
    }
    lower.set_node_key(slot, key);
    lower.set_node_blockptr(slot, bytenr);
    assert_ne!(trans.transid, 0);
    lower.set_node_ptr_generation(slot, trans.transid);
    lower.set_nritems(nritems as u32 + 1);
    lower.mark_dirty();
}

/// split the node at `level` in two; tries pushing into siblings first,
/// grows the tree when the root itself is splitting
fn split_node(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    level: usize,
) -> Result<()> {
    let mut c = p.nodes[level].as_ref().unwrap().clone();
    assert_eq!(c.header_generation(), trans.transid);
    if Rc::ptr_eq(&c, &root.node()) {
        /* trying to split the root, lets make a new one */
        insert_new_root(trans, fs, root, p, level + 1)?;
    } else {
        let pushed = push_nodes_for_insert(trans, fs, root, p, level)?;
        c = p.nodes[level].as_ref().unwrap().clone();
        if pushed == 0 && c.nritems() < nodeptrs_per_block(fs) - 3 {
            return Ok(());
        }
    }
    c = p.nodes[level].as_ref().unwrap().clone();

    let c_nritems = c.nritems() as usize;
    let mid = (c_nritems + 1) / 2;
    let mid_key = c.node_key(mid);

    let split = alloc_free_block(trans, fs, root.objectid, level as u8, c.start)?;
    split.memset(0, BTRFS_HEADER_SIZE);
    split.set_level(level as u8);
    split.set_header_bytenr(split.start);
    split.set_header_generation(trans.transid);
    split.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
    split.set_header_owner(root.objectid);
    split.set_header_fsid(&fs.fsid);
    split.set_header_chunk_tree_uuid(&fs.chunk_tree_uuid.get());

    split.copy_from(
        &c,
        ExtentBuffer::key_ptr_offset(0),
        ExtentBuffer::key_ptr_offset(mid),
        (c_nritems - mid) * BTRFS_KEY_PTR_SIZE,
    );
    split.set_nritems((c_nritems - mid) as u32);
    c.set_nritems(mid as u32);
    c.mark_dirty();
    split.mark_dirty();

    insert_ptr(
        trans,
        p,
        &mid_key,
        split.start,
        p.slots[level + 1] + 1,
        level + 1,
    );

    if p.slots[level] >= mid {
        p.slots[level] -= mid;
        p.nodes[level] = Some(split);
        p.slots[level + 1] += 1;
    }
    Ok(())
}

/// room-making for node inserts: try the left sibling, then the right.
/// Returns 0 when the push freed space and fixed the path.
fn push_nodes_for_insert(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    level: usize,
) -> Result<i32> {
    if level == 0 {
        return Ok(1);
    }
    let mid = p.nodes[level].as_ref().unwrap().clone();
    assert_eq!(mid.header_generation(), trans.transid);

    let Some(parent) = p.nodes[level + 1].clone() else {
        return Ok(1);
    };
    let pslot = p.slots[level + 1];
    let mut orig_slot = p.slots[level];

    if let Some(left) = try_read_node_slot(fs, &parent, pslot as isize - 1) {
        let left_nr = left.nritems();
        if left_nr < nodeptrs_per_block(fs) - 1 {
            let left = cow_block(trans, fs, root, &left, Some((parent.clone(), pslot - 1)))?;
            if push_node_left(trans, fs, &left, &mid, false)? == 0 {
                orig_slot += left_nr as usize;
                let mid_key = mid.node_key(0);
                parent.set_node_key(pslot, &mid_key);
                parent.mark_dirty();
                if left.nritems() as usize > orig_slot {
                    p.nodes[level] = Some(left);
                    p.slots[level + 1] -= 1;
                    p.slots[level] = orig_slot;
                } else {
                    orig_slot -= left.nritems() as usize;
                    p.slots[level] = orig_slot;
                }
                return Ok(0);
            }
        }
    }

    /*
     * then try to empty the right most buffer into the middle
     */
    if let Some(right) = try_read_node_slot(fs, &parent, pslot as isize + 1) {
        let right_nr = right.nritems();
        if right_nr < nodeptrs_per_block(fs) - 1 {
            let right = cow_block(trans, fs, root, &right, Some((parent.clone(), pslot + 1)))?;
            if balance_node_right(trans, fs, &right, &mid)? == 0 {
                let right_key = right.node_key(0);
                parent.set_node_key(pslot + 1, &right_key);
                parent.mark_dirty();

                if mid.nritems() as usize <= orig_slot {
                    p.nodes[level] = Some(right);
                    p.slots[level + 1] += 1;
                    p.slots[level] = orig_slot - mid.nritems() as usize;
                }
                return Ok(0);
            }
        }
    }
    Ok(1)
}

/// downward-merge pass for a node visited with negative ins_len: pull the
/// node above a quarter full, drop emptied siblings, collapse an
/// only-child root
fn balance_level(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    level: usize,
) -> Result<()> {
    let mid = p.nodes[level].as_ref().unwrap().clone();
    assert_eq!(mid.header_generation(), trans.transid);

    let mut orig_slot = p.slots[level];
    let orig_ptr = mid.node_blockptr(orig_slot);

    let parent = if level < BTRFS_MAX_LEVEL - 1 {
        p.nodes[level + 1].clone()
    } else {
        None
    };

    let Some(parent) = parent else {
        /*
         * deal with the case where there is only one pointer in the root
         * by promoting the node below to a root
         */
        if mid.nritems() != 1 {
            return Ok(());
        }
        /* promote the child to a root */
        let child = read_node_slot(fs, &mid, 0)?;
        let child = cow_block(trans, fs, root, &child, Some((mid.clone(), 0)))?;
        *root.node.borrow_mut() = child;
        fs.mark_root_dirty(root);
        p.nodes[level] = None;
        clean_tree_block(fs, &mid);
        drop_cached_block(fs, mid.start);
        free_extent(
            trans,
            fs,
            mid.start,
            mid.len() as u64,
            0,
            root.objectid,
            level as u64,
            0,
        )?;
        return Ok(());
    };
    let pslot = p.slots[level + 1];

    if mid.nritems() > nodeptrs_per_block(fs) / 4 {
        return Ok(());
    }

    let mut left = try_read_node_slot(fs, &parent, pslot as isize - 1);
    if let Some(l) = left {
        left = Some(cow_block(trans, fs, root, &l, Some((parent.clone(), pslot - 1)))?);
    }
    let mut right = try_read_node_slot(fs, &parent, pslot as isize + 1);
    if let Some(r) = right {
        right = Some(cow_block(trans, fs, root, &r, Some((parent.clone(), pslot + 1)))?);
    }

    /* first, try to make some room in the middle buffer */
    if let Some(l) = &left {
        orig_slot += l.nritems() as usize;
        push_node_left(trans, fs, l, &mid, true)?;
    }

    /*
     * then try to empty the right most buffer into the middle
     */
    if let Some(r) = right.take() {
        push_node_left(trans, fs, &mid, &r, true)?;
        if r.nritems() == 0 {
            let bytenr = r.start;
            let blocksize = r.len();
            clean_tree_block(fs, &r);
            drop_cached_block(fs, bytenr);
            del_ptr(trans, fs, root, p, level + 1, pslot + 1)?;
            free_extent(
                trans,
                fs,
                bytenr,
                blocksize as u64,
                0,
                root.objectid,
                level as u64,
                0,
            )?;
        } else {
            let right_key = r.node_key(0);
            parent.set_node_key(pslot + 1, &right_key);
            parent.mark_dirty();
            right = Some(r);
        }
    }
    let _ = right;

    if mid.nritems() == 1 {
        /*
         * we're not allowed to leave a node with one item in the tree
         * during a delete. A deletion from lower in the tree could try
         * to delete the only pointer in this node. So, pull some keys
         * from the left; there has to be a left pointer at this point
         * because otherwise we would have pulled some from the right.
         */
        let l = left.as_ref().expect("no left sibling next to singleton node");
        let wret = balance_node_right(trans, fs, &mid, l)?;
        if wret == 1 {
            let wret = push_node_left(trans, fs, l, &mid, true)?;
            assert_ne!(wret, 1);
        }
    }

    if mid.nritems() == 0 {
        /* we've managed to empty the middle node, drop it */
        let bytenr = mid.start;
        let blocksize = mid.len();
        clean_tree_block(fs, &mid);
        drop_cached_block(fs, bytenr);
        p.nodes[level] = None;
        del_ptr(trans, fs, root, p, level + 1, pslot)?;
        free_extent(
            trans,
            fs,
            bytenr,
            blocksize as u64,
            0,
            root.objectid,
            level as u64,
            0,
        )?;
    } else {
        /* update the parent key to reflect our changes */
        let mid_key = mid.node_key(0);
        parent.set_node_key(pslot, &mid_key);
        parent.mark_dirty();
    }

    /* update the path */
    let mut done_with_left = false;
    if let Some(l) = left {
        if l.nritems() as usize > orig_slot {
            p.nodes[level] = Some(l.clone());
            p.slots[level + 1] -= 1;
            p.slots[level] = orig_slot;
            done_with_left = true;
        } else {
            orig_slot -= l.nritems() as usize;
            p.slots[level] = orig_slot;
        }
    }

    if !done_with_left && p.nodes[level].is_some() {
        /* double check we haven't messed things up */
        check_block_in_path(fs, p, level)?;
        if orig_ptr
            != p.nodes[level]
                .as_ref()
                .unwrap()
                .node_blockptr(p.slots[level])
        {
            panic!("balance_level moved the target pointer");
        }
    }
    Ok(())
}

/// readahead one full node of leaves around the search position
pub fn reada_for_search(fs: &FsInfo, p: &Path, level: usize, slot: usize, objectid: u64) {
    if level != 1 {
        return;
    }
    let Some(node) = &p.nodes[level] else { return };

    let search = node.node_blockptr(slot);
    if fs.block_cache.borrow().contains_key(&search) {
        return;
    }

    let blocksize = fs.nodesize as u64;
    let mut lowest_read = search;
    let mut highest_read = search;
    let nritems = node.nritems() as usize;
    let mut nr = slot as isize;
    let mut nread: u64 = 0;
    let mut nscan = 0;
    let direction = p.reada;
    loop {
        if direction < 0 {
            if nr == 0 {
                break;
            }
            nr -= 1;
        } else if direction > 0 {
            nr += 1;
            if nr as usize >= nritems {
                break;
            }
        } else {
            break;
        }
        if direction < 0 && objectid != 0 && node.node_key(nr as usize).objectid != objectid {
            break;
        }
        let search = node.node_blockptr(nr as usize);
        if (search >= lowest_read && search <= highest_read)
            || (search < lowest_read && lowest_read - search <= 32768)
            || (search > highest_read && search - highest_read <= 32768)
        {
            readahead_tree_block(fs, search, blocksize);
            nread += blocksize;
        }
        nscan += 1;
        if nread > 256 * 1024 || nscan > 32 {
            break;
        }
        if search < lowest_read {
            lowest_read = search;
        }
        if search > highest_read {
            highest_read = search;
        }
    }
}

/*
 * leaves
 */

/// push items from the path's leaf into its right sibling, freeing at
/// least data_size bytes; returns 1 when nothing fits
fn push_leaf_right(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    data_size: u32,
    empty: bool,
) -> Result<i32> {
    let left = p.leaf();
    let slot = p.slots[1];
    let Some(upper) = p.nodes[1].clone() else {
        return Ok(1);
    };
    if slot + 1 >= upper.nritems() as usize {
        return Ok(1);
    }

    let right = read_node_slot(fs, &upper, slot + 1)?;
    if leaf_free_space(fs, &right) < data_size as i64 {
        return Ok(1);
    }

    /* cow and double check */
    let right = cow_block(trans, fs, root, &right, Some((upper.clone(), slot + 1)))?;
    if leaf_free_space(fs, &right) < data_size as i64 {
        return Ok(1);
    }

    let mut left_nritems = left.nritems() as usize;
    if left_nritems == 0 {
        return Ok(1);
    }

    let nr = if empty { 0 } else { 1 };
    let mut push_space: u32 = 0;
    let mut push_items: usize = 0;
    let free_space = leaf_free_space(fs, &right) as u32;

    let mut i = left_nritems - 1;
    loop {
        if (i as isize) < nr as isize {
            break;
        }
        if p.slots[0] == i {
            push_space += data_size + BTRFS_ITEM_SIZE as u32;
        }
        let this_item_size = left.item_size(i);
        if this_item_size + BTRFS_ITEM_SIZE as u32 + push_space > free_space {
            break;
        }
        push_items += 1;
        push_space += this_item_size + BTRFS_ITEM_SIZE as u32;
        if i == 0 {
            break;
        }
        i -= 1;
    }

    if push_items == 0 {
        return Ok(1);
    }

    /* push left to right */
    let mut right_nritems = right.nritems() as usize;
    let mut push_space = left.item_end(left_nritems - push_items);
    push_space -= leaf_data_end(fs, &left);

    /* make room in the right data area */
    let data_end = leaf_data_end(fs, &right);
    right.memmove(
        BTRFS_HEADER_SIZE + (data_end - push_space) as usize,
        BTRFS_HEADER_SIZE + data_end as usize,
        (leaf_data_size(fs) - data_end) as usize,
    );

    /* copy from the left data area */
    right.copy_from(
        &left,
        BTRFS_HEADER_SIZE + (leaf_data_size(fs) - push_space) as usize,
        BTRFS_HEADER_SIZE + leaf_data_end(fs, &left) as usize,
        push_space as usize,
    );

    right.memmove(
        ExtentBuffer::item_nr_offset(push_items),
        ExtentBuffer::item_nr_offset(0),
        right_nritems * BTRFS_ITEM_SIZE,
    );

    /* copy the items from left to right */
    right.copy_from(
        &left,
        ExtentBuffer::item_nr_offset(0),
        ExtentBuffer::item_nr_offset(left_nritems - push_items),
        push_items * BTRFS_ITEM_SIZE,
    );

    /* update the item pointers */
    right_nritems += push_items;
    right.set_nritems(right_nritems as u32);
    let mut push_space = leaf_data_size(fs);
    for i in 0..right_nritems {
        push_space -= right.item_size(i);
        right.set_item_offset(i, push_space);
    }

    left_nritems -= push_items;
    left.set_nritems(left_nritems as u32);
    if left_nritems != 0 {
        left.mark_dirty();
    }
    right.mark_dirty();

    let right_key = right.item_key(0);
    upper.set_node_key(slot + 1, &right_key);
    upper.mark_dirty();

    /* then fixup the leaf pointer in the path */
    if p.slots[0] >= left_nritems {
        p.slots[0] -= left_nritems;
        p.nodes[0] = Some(right);
        p.slots[1] += 1;
    }
    Ok(0)
}

/// push items from the path's leaf into its left sibling
fn push_leaf_left(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    data_size: u32,
    empty: bool,
) -> Result<i32> {
    let right = p.leaf();
    let slot = p.slots[1];
    if slot == 0 {
        return Ok(1);
    }
    let Some(upper) = p.nodes[1].clone() else {
        return Ok(1);
    };

    let mut right_nritems = right.nritems() as usize;
    if right_nritems == 0 {
        return Ok(1);
    }

    let left = read_node_slot(fs, &upper, slot - 1)?;
    if leaf_free_space(fs, &left) < data_size as i64 {
        return Ok(1);
    }

    /* cow and double check */
    let left = cow_block(trans, fs, root, &left, Some((upper.clone(), slot - 1)))?;
    if leaf_free_space(fs, &left) < data_size as i64 {
        return Ok(1);
    }

    let nr = if empty {
        right_nritems
    } else {
        right_nritems - 1
    };
    let free_space = leaf_free_space(fs, &left) as u32;
    let mut push_space: u32 = 0;
    let mut push_items: usize = 0;
    for i in 0..nr {
        if p.slots[0] == i {
            push_space += data_size + BTRFS_ITEM_SIZE as u32;
        }
        let this_item_size = right.item_size(i);
        if this_item_size + BTRFS_ITEM_SIZE as u32 + push_space > free_space {
            break;
        }
        push_items += 1;
        push_space += this_item_size + BTRFS_ITEM_SIZE as u32;
    }

    if push_items == 0 {
        return Ok(1);
    }

    /* push data from right to left */
    let old_left_nritems = left.nritems() as usize;
    left.copy_from(
        &right,
        ExtentBuffer::item_nr_offset(old_left_nritems),
        ExtentBuffer::item_nr_offset(0),
        push_items * BTRFS_ITEM_SIZE,
    );

    let push_space = leaf_data_size(fs) - right.item_offset(push_items - 1);
    left.copy_from(
        &right,
        BTRFS_HEADER_SIZE + (leaf_data_end(fs, &left) - push_space) as usize,
        BTRFS_HEADER_SIZE + right.item_offset(push_items - 1) as usize,
        push_space as usize,
    );
    assert_ne!(old_left_nritems, 0);

    let old_left_item_size = left.item_offset(old_left_nritems - 1);
    for i in old_left_nritems..old_left_nritems + push_items {
        let ioff = left.item_offset(i);
        left.set_item_offset(i, ioff - (leaf_data_size(fs) - old_left_item_size));
    }
    left.set_nritems((old_left_nritems + push_items) as u32);

    /* fixup right node */
    assert!(push_items <= right_nritems);
    if push_items < right_nritems {
        let push_space = right.item_offset(push_items - 1) - leaf_data_end(fs, &right);
        right.memmove(
            BTRFS_HEADER_SIZE + (leaf_data_size(fs) - push_space) as usize,
            BTRFS_HEADER_SIZE + leaf_data_end(fs, &right) as usize,
            push_space as usize,
        );
        right.memmove(
            ExtentBuffer::item_nr_offset(0),
            ExtentBuffer::item_nr_offset(push_items),
            (right_nritems - push_items) * BTRFS_ITEM_SIZE,
        );
    }
    right_nritems -= push_items;
    right.set_nritems(right_nritems as u32);
    let mut push_space = leaf_data_size(fs);
    for i in 0..right_nritems {
        push_space -= right.item_size(i);
        right.set_item_offset(i, push_space);
    }

    left.mark_dirty();
    if right_nritems != 0 {
        right.mark_dirty();
    }

    let right_key = right.item_key(0);
    fixup_low_keys(p, &right_key, 1);

    /* then fixup the leaf pointer in the path */
    if p.slots[0] < push_items {
        p.slots[0] += old_left_nritems;
        p.nodes[0] = Some(left);
        p.slots[1] -= 1;
    } else {
        p.slots[0] -= push_items;
    }
    Ok(0)
}

/// move the upper half of the splitting leaf into `right`
fn copy_for_split(
    trans: &TransHandle,
    fs: &FsInfo,
    p: &mut Path,
    l: &EbRef,
    right: &EbRef,
    slot: usize,
    mid: usize,
    nritems: usize,
) {
    let nritems = nritems - mid;
    right.set_nritems(nritems as u32);
    let data_copy_size = (l.item_end(mid) - leaf_data_end(fs, l)) as usize;

    right.copy_from(
        l,
        ExtentBuffer::item_nr_offset(0),
        ExtentBuffer::item_nr_offset(mid),
        nritems * BTRFS_ITEM_SIZE,
    );
    right.copy_from(
        l,
        BTRFS_HEADER_SIZE + leaf_data_size(fs) as usize - data_copy_size,
        BTRFS_HEADER_SIZE + leaf_data_end(fs, l) as usize,
        data_copy_size,
    );

    let rt_data_off = leaf_data_size(fs) - l.item_end(mid);
    for i in 0..nritems {
        let ioff = right.item_offset(i);
        right.set_item_offset(i, ioff + rt_data_off);
    }

    l.set_nritems(mid as u32);
    let right_key = right.item_key(0);
    insert_ptr(trans, p, &right_key, right.start, p.slots[1] + 1, 1);

    right.mark_dirty();
    l.mark_dirty();
    assert_eq!(p.slots[0], slot);

    if mid <= slot {
        p.nodes[0] = Some(right.clone());
        p.slots[0] -= mid;
        p.slots[1] += 1;
    }
    assert!(p.slots[0] <= p.leaf().nritems() as usize);
}

/// split the path's leaf so at least data_size bytes become available.
/// The split point follows the insertion key; a second split of one half
/// ("double split") is allowed when that half still cannot host the
/// insertion.
fn split_leaf(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    ins_key: &Key,
    p: &mut Path,
    data_size: u32,
    extend: bool,
) -> Result<()> {
    /* first try to make some room by pushing left and right */
    if data_size != 0 && ins_key.item_type != BTRFS_DIR_ITEM_KEY {
        push_leaf_right(trans, fs, root, p, data_size, false)?;
        if leaf_free_space(fs, &p.leaf()) < data_size as i64 {
            push_leaf_left(trans, fs, root, p, data_size, false)?;
        }
        /* did the pushes work? */
        if leaf_free_space(fs, &p.leaf()) >= data_size as i64 {
            return Ok(());
        }
    }

    if p.nodes[1].is_none() {
        insert_new_root(trans, fs, root, p, 1)?;
    }

    let mut num_doubles = 0;
    loop {
        let l = p.leaf();
        let slot = p.slots[0];
        let nritems = l.nritems() as usize;
        let mut mid = (nritems + 1) / 2;

        let mut split = 1;
        if mid <= slot {
            if nritems == 1
                || leaf_space_used(&l, mid, nritems - mid) + data_size
                    > leaf_data_size(fs)
            {
                if slot >= nritems {
                    split = 0;
                } else {
                    mid = slot;
                    if mid != nritems
                        && leaf_space_used(&l, mid, nritems - mid) + data_size
                            > leaf_data_size(fs)
                    {
                        split = 2;
                    }
                }
            }
        } else if leaf_space_used(&l, 0, mid) + data_size > leaf_data_size(fs) {
            if !extend && data_size != 0 && slot == 0 {
                split = 0;
            } else if (extend || data_size == 0) && slot == 0 {
                mid = 1;
            } else {
                mid = slot;
                if mid != nritems
                    && leaf_space_used(&l, mid, nritems - mid) + data_size
                        > leaf_data_size(fs)
                {
                    split = 2;
                }
            }
        }

        let disk_key = if split == 0 {
            *ins_key
        } else {
            l.item_key(mid)
        };

        let right = alloc_free_block(trans, fs, root.objectid, 0, l.start)?;
        right.memset(0, BTRFS_HEADER_SIZE);
        right.set_header_bytenr(right.start);
        right.set_header_generation(trans.transid);
        right.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
        right.set_header_owner(root.objectid);
        right.set_level(0);
        right.set_header_fsid(&fs.fsid);
        right.set_header_chunk_tree_uuid(&fs.chunk_tree_uuid.get());

        if split == 0 {
            /* the new item lands alone in the fresh leaf */
            if mid <= slot {
                insert_ptr(trans, p, &disk_key, right.start, p.slots[1] + 1, 1);
                p.nodes[0] = Some(right.clone());
                p.slots[0] = 0;
                p.slots[1] += 1;
            } else {
                insert_ptr(trans, p, &disk_key, right.start, p.slots[1], 1);
                p.nodes[0] = Some(right.clone());
                p.slots[0] = 0;
                if p.slots[1] == 0 {
                    fixup_low_keys(p, &disk_key, 1);
                }
            }
            right.mark_dirty();
            return Ok(());
        }

        copy_for_split(trans, fs, p, &l, &right, slot, mid, nritems);

        if split == 2 {
            assert_eq!(num_doubles, 0);
            num_doubles += 1;
            continue;
        }
        return Ok(());
    }
}

/*
 * item surgery
 */

/// split a single item into two items sharing the leaf; new_key names
/// the second half, split_offset is measured from the item start
pub fn split_item(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    new_key: &Key,
    split_offset: u32,
) -> Result<()> {
    let orig_key = p.leaf().item_key(p.slots[0]);
    if leaf_free_space(fs, &p.leaf()) < BTRFS_ITEM_SIZE as i64 {
        let item_size = p.leaf().item_size(p.slots[0]);
        p.release();

        p.search_for_split = true;
        let ret = search_slot(Some(trans), fs, root, &orig_key, p, 0, true)?;
        p.search_for_split = false;

        /* if our item isn't there or got smaller, return now */
        if !ret || item_size != p.leaf().item_size(p.slots[0]) {
            return Err(FsckError::Unsupported("item moved while splitting"));
        }
        split_leaf(trans, fs, root, &orig_key, p, 0, false)?;
        assert!(leaf_free_space(fs, &p.leaf()) >= BTRFS_ITEM_SIZE as i64);
    }

    let leaf = p.leaf();
    let orig_offset = leaf.item_offset(p.slots[0]);
    let item_size = leaf.item_size(p.slots[0]);
    let buf = leaf.item_data(p.slots[0]);

    let slot = p.slots[0] + 1;
    let nritems = leaf.nritems() as usize;
    if slot != nritems {
        /* shift the items */
        leaf.memmove(
            ExtentBuffer::item_nr_offset(slot + 1),
            ExtentBuffer::item_nr_offset(slot),
            (nritems - slot) * BTRFS_ITEM_SIZE,
        );
    }

    leaf.set_item_key(slot, new_key);
    leaf.set_item_offset(slot, orig_offset);
    leaf.set_item_size(slot, item_size - split_offset);

    leaf.set_item_offset(p.slots[0], orig_offset + item_size - split_offset);
    leaf.set_item_size(p.slots[0], split_offset);
    leaf.set_nritems((nritems + 1) as u32);

    /* write the data for the start of the original item */
    leaf.write_bytes(
        leaf.item_ptr_offset(p.slots[0]),
        &buf[..split_offset as usize],
    );
    /* write the data for the new item */
    leaf.write_bytes(
        leaf.item_ptr_offset(slot),
        &buf[split_offset as usize..],
    );
    leaf.mark_dirty();
    assert!(leaf_free_space(fs, &leaf) >= 0);
    Ok(())
}

/// shrink an item in place; when truncating from the front the key
/// offset moves forward and inline file extents keep their header
pub fn truncate_item(
    fs: &FsInfo,
    p: &mut Path,
    new_size: u32,
    from_end: bool,
) -> Result<()> {
    let leaf = p.leaf();
    let slot = p.slots[0];
    let old_size = leaf.item_size(slot);
    if old_size == new_size {
        return Ok(());
    }

    let nritems = leaf.nritems() as usize;
    let data_end = leaf_data_end(fs, &leaf);
    let old_data_start = leaf.item_offset(slot);
    let size_diff = old_size - new_size;

    assert!(slot < nritems);

    /*
     * item0..itemN ... dataN.offset..dataN.size .. data0.size
     */
    /* first correct the data pointers */
    for i in slot..nritems {
        let ioff = leaf.item_offset(i);
        leaf.set_item_offset(i, ioff + size_diff);
    }

    /* shift the data */
    if from_end {
        leaf.memmove(
            BTRFS_HEADER_SIZE + (data_end + size_diff) as usize,
            BTRFS_HEADER_SIZE + data_end as usize,
            (old_data_start + new_size - data_end) as usize,
        );
    } else {
        let mut disk_key = leaf.item_key(slot);
        if disk_key.item_type == BTRFS_EXTENT_DATA_KEY {
            let fi_offset = leaf.item_ptr_offset(slot) - size_diff as usize;
            let extent_type =
                leaf.read_u8(fi_offset + BTRFS_FILE_EXTENT_INLINE_DATA_START - 1);
            if extent_type == BTRFS_FILE_EXTENT_INLINE {
                let ptr = leaf.item_ptr_offset(slot);
                leaf.memmove(ptr, fi_offset, BTRFS_FILE_EXTENT_INLINE_DATA_START);
            }
        }

        leaf.memmove(
            BTRFS_HEADER_SIZE + (data_end + size_diff) as usize,
            BTRFS_HEADER_SIZE + data_end as usize,
            (old_data_start - data_end) as usize,
        );

        disk_key.offset += size_diff as u64;
        leaf.set_item_key(slot, &disk_key);
        if slot == 0 {
            fixup_low_keys(p, &disk_key, 1);
        }
    }

    leaf.set_item_size(slot, new_size);
    leaf.mark_dirty();
    assert!(leaf_free_space(fs, &leaf) >= 0);
    Ok(())
}

/// grow an item in place by data_size bytes
pub fn extend_item(fs: &FsInfo, p: &mut Path, data_size: u32) -> Result<()> {
    let leaf = p.leaf();
    let slot = p.slots[0];
    let nritems = leaf.nritems() as usize;
    let data_end = leaf_data_end(fs, &leaf);

    if leaf_free_space(fs, &leaf) < data_size as i64 {
        return Err(FsckError::NoSpace);
    }
    assert!(slot < nritems);
    let old_data = leaf.item_end(slot);

    /* first correct the data pointers */
    for i in slot..nritems {
        let ioff = leaf.item_offset(i);
        leaf.set_item_offset(i, ioff - data_size);
    }

    /* shift the data */
    leaf.memmove(
        BTRFS_HEADER_SIZE + (data_end - data_size) as usize,
        BTRFS_HEADER_SIZE + data_end as usize,
        (old_data - data_end) as usize,
    );

    let old_size = leaf.item_size(slot);
    leaf.set_item_size(slot, old_size + data_size);
    leaf.mark_dirty();
    assert!(leaf_free_space(fs, &leaf) >= 0);
    Ok(())
}

/// make room for `nr` new items at the path's slot; keys must all land in
/// the same leaf
pub fn insert_empty_items(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    keys: &[Key],
    sizes: &[u32],
) -> Result<()> {
    assert_eq!(keys.len(), sizes.len());
    let nr = keys.len();
    let total_data: u32 = sizes.iter().sum();
    let total_size = total_data + (nr * BTRFS_ITEM_SIZE) as u32;

    let found = search_slot(Some(trans), fs, root, &keys[0], p, total_size as i32, true)?;
    if found {
        return Err(FsckError::ItemExists);
    }

    let leaf = p.leaf();
    let nritems = leaf.nritems() as usize;
    let mut data_end = leaf_data_end(fs, &leaf);

    if leaf_free_space(fs, &leaf) < total_size as i64 {
        panic!(
            "not enough freespace need {} have {}",
            total_size,
            leaf_free_space(fs, &leaf)
        );
    }

    let slot = p.slots[0];
    if slot != nritems {
        let old_data = leaf.item_end(slot);
        assert!(old_data >= data_end);

        /* first correct the data pointers */
        for i in slot..nritems {
            let ioff = leaf.item_offset(i);
            leaf.set_item_offset(i, ioff - total_data);
        }

        /* shift the items */
        leaf.memmove(
            ExtentBuffer::item_nr_offset(slot + nr),
            ExtentBuffer::item_nr_offset(slot),
            (nritems - slot) * BTRFS_ITEM_SIZE,
        );

        /* shift the data */
        leaf.memmove(
            BTRFS_HEADER_SIZE + (data_end - total_data) as usize,
            BTRFS_HEADER_SIZE + data_end as usize,
            (old_data - data_end) as usize,
        );
        data_end = old_data;
    }

    /* setup the item for the new data */
    for i in 0..nr {
        leaf.set_item_key(slot + i, &keys[i]);
        leaf.set_item_offset(slot + i, data_end - sizes[i]);
        data_end -= sizes[i];
        leaf.set_item_size(slot + i, sizes[i]);
    }
    leaf.set_nritems((nritems + nr) as u32);
    leaf.mark_dirty();

    if slot == 0 {
        fixup_low_keys(p, &keys[0], 1);
    }
    assert!(leaf_free_space(fs, &leaf) >= 0);
    Ok(())
}

pub fn insert_empty_item(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    key: &Key,
    data_size: u32,
) -> Result<()> {
    insert_empty_items(trans, fs, root, p, &[*key], &[data_size])
}

/// insert key + data, handling path setup and room-making
pub fn insert_item(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    key: &Key,
    data: &[u8],
) -> Result<()> {
    let mut path = Path::new();
    insert_empty_item(trans, fs, root, &mut path, key, data.len() as u32)?;
    let leaf = path.leaf();
    leaf.write_bytes(leaf.item_ptr_offset(path.slots[0]), data);
    leaf.mark_dirty();
    Ok(())
}

/// delete the pointer at `slot` from the node at `level`. An emptied root
/// node collapses into a leaf.
pub fn del_ptr(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    level: usize,
    slot: usize,
) -> Result<()> {
    let parent = p.nodes[level].as_ref().expect("del_ptr without node").clone();
    let mut nritems = parent.nritems() as usize;
    let _ = (trans, fs);

    if slot != nritems - 1 {
        parent.memmove(
            ExtentBuffer::key_ptr_offset(slot),
            ExtentBuffer::key_ptr_offset(slot + 1),
            BTRFS_KEY_PTR_SIZE * (nritems - slot - 1),
        );
    }
    nritems -= 1;
    parent.set_nritems(nritems as u32);
    if nritems == 0 && Rc::ptr_eq(&parent, &root.node()) {
        assert_eq!(root.node().level(), 1);
        /* just turn the root into a leaf and break */
        root.node().set_level(0);
    } else if slot == 0 {
        let disk_key = parent.node_key(0);
        fixup_low_keys(p, &disk_key, level + 1);
    }
    parent.mark_dirty();
    Ok(())
}

/// delete the leaf the path points at; the pointer at path level 1 goes
/// away and the block is returned to the allocator
fn del_leaf(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    leaf: &EbRef,
) -> Result<()> {
    assert_eq!(leaf.header_generation(), trans.transid);
    del_ptr(trans, fs, root, p, 1, p.slots[1])?;

    drop_cached_block(fs, leaf.start);
    free_extent(
        trans,
        fs,
        leaf.start,
        leaf.len() as u64,
        0,
        root.objectid,
        0,
        0,
    )?;
    Ok(())
}

/// delete `nr` items starting at `slot`; compacts the leaf, pushing into
/// siblings and freeing the leaf when it runs dry
pub fn del_items(
    trans: &TransHandle,
    fs: &FsInfo,
    root: &Rc<Root>,
    p: &mut Path,
    slot: usize,
    nr: usize,
) -> Result<()> {
    let leaf = p.leaf();
    if nr == 0 {
        return Ok(());
    }
    let last_off = leaf.item_offset(slot + nr - 1);
    let mut dsize = 0;
    for i in 0..nr {
        dsize += leaf.item_size(slot + i);
    }
    let mut nritems = leaf.nritems() as usize;

    if slot + nr != nritems {
        let data_end = leaf_data_end(fs, &leaf);
        leaf.memmove(
            BTRFS_HEADER_SIZE + (data_end + dsize) as usize,
            BTRFS_HEADER_SIZE + data_end as usize,
            (last_off - data_end) as usize,
        );

        for i in slot + nr..nritems {
            let ioff = leaf.item_offset(i);
            leaf.set_item_offset(i, ioff + dsize);
        }

        leaf.memmove(
            ExtentBuffer::item_nr_offset(slot),
            ExtentBuffer::item_nr_offset(slot + nr),
            BTRFS_ITEM_SIZE * (nritems - slot - nr),
        );
    }
    nritems -= nr;
    leaf.set_nritems(nritems as u32);

    /* delete the leaf if we've emptied it */
    if nritems == 0 {
        if Rc::ptr_eq(&leaf, &root.node()) {
            leaf.set_level(0);
            leaf.mark_dirty();
        } else {
            clean_tree_block(fs, &leaf);
            del_leaf(trans, fs, root, p, &leaf)?;
        }
        return Ok(());
    }

    if slot == 0 {
        let disk_key = leaf.item_key(0);
        fixup_low_keys(p, &disk_key, 1);
    }

    /* delete the leaf if it is mostly empty */
    let used = leaf_space_used(&leaf, 0, nritems);
    if used < leaf_data_size(fs) / 4 {
        /* push_leaf_left fixes the path.
         * make sure the path still points to our leaf
         * for possible call to del_ptr below
         */
        let orig_slot = p.slots[1];
        push_leaf_left(trans, fs, root, p, 1, true)?;
        if Rc::ptr_eq(&p.leaf(), &leaf) && leaf.nritems() != 0 {
            push_leaf_right(trans, fs, root, p, 1, true)?;
        }
        if leaf.nritems() == 0 {
            clean_tree_block(fs, &leaf);
            p.slots[1] = orig_slot;
            p.nodes[0] = Some(leaf.clone());
            del_leaf(trans, fs, root, p, &leaf)?;
        } else {
            leaf.mark_dirty();
        }
    } else {
        leaf.mark_dirty();
    }
    Ok(())
}

/*
 * leaf-to-leaf iteration
 */

/// walk to the previous leaf; 1 means there are no lesser leaves
pub fn prev_leaf(fs: &FsInfo, root: &Rc<Root>, p: &mut Path) -> Result<i32> {
    let _ = root;
    let mut level = 1;
    let mut next: Option<EbRef> = None;
    let mut slot = 0;
    while level < BTRFS_MAX_LEVEL {
        let Some(c) = &p.nodes[level] else {
            return Ok(1);
        };
        slot = p.slots[level];
        if slot == 0 {
            level += 1;
            continue;
        }
        slot -= 1;
        next = Some(read_node_slot(fs, c, slot)?);
        break;
    }
    if next.is_none() {
        return Ok(1);
    }
    p.slots[level] = slot;
    let mut next = next.unwrap();
    loop {
        level -= 1;
        let mut slot = next.nritems() as usize;
        if slot != 0 {
            slot -= 1;
        }
        p.nodes[level] = Some(next.clone());
        p.slots[level] = slot;
        if level == 0 {
            break;
        }
        next = read_node_slot(fs, &next, slot)?;
    }
    Ok(0)
}

/// walk to the next leaf; 1 means there are no greater leaves
pub fn next_leaf(fs: &FsInfo, root: &Rc<Root>, p: &mut Path) -> Result<i32> {
    let _ = root;
    let mut level = 1;
    let mut next: Option<EbRef> = None;
    let mut slot = 0;
    while level < BTRFS_MAX_LEVEL {
        let Some(c) = &p.nodes[level] else {
            return Ok(1);
        };
        slot = p.slots[level] + 1;
        if slot >= c.nritems() as usize {
            level += 1;
            continue;
        }
        if p.reada != 0 {
            reada_for_search(fs, p, level, slot, 0);
        }
        next = Some(read_node_slot(fs, c, slot)?);
        break;
    }
    if next.is_none() {
        return Ok(1);
    }
    p.slots[level] = slot;
    let mut next = next.unwrap();
    loop {
        level -= 1;
        p.nodes[level] = Some(next.clone());
        p.slots[level] = 0;
        if level == 0 {
            break;
        }
        if p.reada != 0 {
            reada_for_search(fs, p, level, 0, 0);
        }
        next = read_node_slot(fs, &next, 0)?;
    }
    Ok(0)
}

/// step the cursor back one item, crossing leaves as needed
pub fn prev_item(fs: &FsInfo, root: &Rc<Root>, p: &mut Path) -> Result<i32> {
    if p.slots[0] == 0 {
        let ret = prev_leaf(fs, root, p)?;
        if ret != 0 {
            return Ok(ret);
        }
        debug!("prev_item crossed into leaf {}", p.leaf().start);
    } else {
        p.slots[0] -= 1;
    }
    Ok(0)
}
