use crate::btrfs::{parse_root_item, FsInfo};
use crate::cache_tree::CacheTree;
use crate::check::Stats;
use crate::disk_io::{read_tree_block, readahead_tree_block};
use crate::error::{FsckError, Result};
use crate::extent_buffer::EbRef;
use crate::extent_tree::{
    fix_block_accounting, inc_extent_ref, lookup_extent_info, pin_extent, update_block_group,
};
use crate::structures::*;
use crate::transaction::TransHandle;
use crate::tree::{
    check_leaf, check_node, del_items, del_ptr, insert_empty_item, leaf_free_space, next_leaf,
    nodeptrs_per_block, search_slot, Path,
};

use log::debug;
use std::rc::Rc;

/// The extent reference reconciler: a superblock-rooted walk over every
/// tree records, per allocated extent, which references were actually
/// found; the extent tree's own declarations are folded into the same
/// records and the two views must agree before a record may die.

#[derive(Clone, Debug, Default)]
pub struct BackrefBase {
    pub found_extent_tree: bool,
    pub full_backref: bool,
    pub found_ref: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TreeBackref {
    pub base: BackrefBase,
    pub parent: u64,
    pub root: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DataBackref {
    pub base: BackrefBase,
    pub parent: u64,
    pub root: u64,
    pub owner: u64,
    pub offset: u64,
    pub bytes: u64,
    pub num_refs: u32,
    pub found_ref: u32,
}

#[derive(Clone, Debug)]
pub enum Backref {
    Tree(TreeBackref),
    Data(DataBackref),
}

impl Backref {
    fn base(&self) -> &BackrefBase {
        match self {
            Backref::Tree(t) => &t.base,
            Backref::Data(d) => &d.base,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExtentRecord {
    pub start: u64,
    pub max_size: u64,
    /// accounting length; reset to the declared length once the extent
    /// item is seen so backref byte counts can be compared against it
    pub nr: u64,
    pub refs: u64,
    pub extent_item_refs: u64,
    pub generation: u64,
    pub parent_key: Option<Key>,
    pub info_objectid: u64,
    pub info_level: u8,
    pub content_checked: bool,
    pub owner_ref_checked: bool,
    pub is_root: bool,
    pub metadata: bool,
    pub backrefs: Vec<Backref>,
}

pub type ExtentCache = CacheTree<ExtentRecord>;

fn find_tree_backref(rec: &mut ExtentRecord, parent: u64, root: u64) -> Option<usize> {
    rec.backrefs.iter().position(|b| match b {
        Backref::Tree(t) => {
            if parent > 0 {
                t.base.full_backref && t.parent == parent
            } else {
                !t.base.full_backref && t.root == root
            }
        }
        Backref::Data(_) => false,
    })
}

fn alloc_tree_backref(rec: &mut ExtentRecord, parent: u64, root: u64) -> usize {
    let mut t = TreeBackref::default();
    if parent > 0 {
        t.parent = parent;
        t.base.full_backref = true;
    } else {
        t.root = root;
    }
    rec.backrefs.push(Backref::Tree(t));
    rec.backrefs.len() - 1
}

fn find_data_backref(
    rec: &mut ExtentRecord,
    parent: u64,
    root: u64,
    owner: u64,
    offset: u64,
    found_ref: bool,
    bytes: u64,
) -> Option<usize> {
    rec.backrefs.iter().position(|b| match b {
        Backref::Data(d) => {
            if parent > 0 {
                d.base.full_backref && d.parent == parent
            } else if d.base.full_backref {
                false
            } else if d.root == root && d.owner == owner && d.offset == offset {
                /*
                 * when found_ref is set, bytes is the real size and must
                 * match any previously found ref; mismatching lengths get
                 * their own backref so the disagreement is surfaced
                 */
                !(found_ref && d.base.found_ref && d.bytes != bytes)
            } else {
                false
            }
        }
        Backref::Tree(_) => false,
    })
}

fn alloc_data_backref(
    rec: &mut ExtentRecord,
    parent: u64,
    root: u64,
    owner: u64,
    offset: u64,
    max_size: u64,
) -> usize {
    let mut d = DataBackref {
        bytes: max_size,
        ..Default::default()
    };
    if parent > 0 {
        d.parent = parent;
        d.base.full_backref = true;
    } else {
        d.root = root;
        d.owner = owner;
        d.offset = offset;
    }
    rec.backrefs.push(Backref::Data(d));
    if max_size > rec.max_size {
        rec.max_size = max_size;
    }
    rec.backrefs.len() - 1
}

/// every-way agreement test between the backref set and the record's
/// counters; returns true when something is off
pub fn all_backpointers_checked(rec: &ExtentRecord, print_errs: bool) -> bool {
    let mut found: u64 = 0;
    let mut err = false;

    for back in &rec.backrefs {
        if !back.base().found_extent_tree {
            err = true;
            if !print_errs {
                return err;
            }
            match back {
                Backref::Data(d) => eprintln!(
                    "Backref {} {} {} owner {} offset {} num_refs {} not found in extent tree",
                    rec.start,
                    if d.base.full_backref { "parent" } else { "root" },
                    if d.base.full_backref { d.parent } else { d.root },
                    d.owner,
                    d.offset,
                    d.num_refs
                ),
                Backref::Tree(t) => eprintln!(
                    "Backref {} parent {} root {} not found in extent tree",
                    rec.start, t.parent, t.root
                ),
            }
        }
        if let Backref::Tree(t) = back {
            if !t.base.found_ref {
                err = true;
                if !print_errs {
                    return err;
                }
                eprintln!(
                    "Backref {} {} {} not referenced",
                    rec.start,
                    if t.base.full_backref { "parent" } else { "root" },
                    if t.base.full_backref { t.parent } else { t.root }
                );
            }
        }
        if let Backref::Data(d) = back {
            if d.found_ref != d.num_refs {
                err = true;
                if !print_errs {
                    return err;
                }
                eprintln!(
                    "Incorrect local backref count on {} {} {} owner {} offset {} found {} wanted {}",
                    rec.start,
                    if d.base.full_backref { "parent" } else { "root" },
                    if d.base.full_backref { d.parent } else { d.root },
                    d.owner,
                    d.offset,
                    d.found_ref,
                    d.num_refs
                );
            }
            if d.bytes != rec.nr {
                err = true;
                if !print_errs {
                    return err;
                }
                eprintln!(
                    "Backref bytes do not match extent backref, bytenr={}, ref bytes={}, backref bytes={}",
                    rec.start, rec.nr, d.bytes
                );
            }
        }
        found += match back {
            Backref::Tree(_) => 1,
            Backref::Data(d) => d.found_ref as u64,
        };
    }
    if found != rec.refs {
        err = true;
        if !print_errs {
            return err;
        }
        eprintln!(
            "Incorrect global backref count on {} found {} wanted {}",
            rec.start, found, rec.refs
        );
    }
    err
}

fn maybe_free_extent_rec(extent_cache: &mut ExtentCache, start: u64) {
    let done = match extent_cache.find(start, 1) {
        Some((s, _, rec)) if s == start || rec.start == start => {
            rec.content_checked
                && rec.owner_ref_checked
                && rec.extent_item_refs == rec.refs
                && rec.refs > 0
                && !all_backpointers_checked(rec, false)
        }
        _ => false,
    };
    if done {
        extent_cache.remove(start);
    }
}

#[allow(clippy::too_many_arguments)]
fn add_extent_rec(
    extent_cache: &mut ExtentCache,
    parent_key: Option<&Key>,
    start: u64,
    nr: u64,
    extent_item_refs: u64,
    is_root: bool,
    inc_ref: bool,
    set_checked: bool,
    metadata: bool,
    extent_rec: bool,
    max_size: u64,
    stats: &mut Stats,
) {
    if let Some((_, _, rec)) = extent_cache.find_mut(start, nr.max(1)) {
        if inc_ref {
            rec.refs += 1;
        }
        if rec.nr == 1 {
            rec.nr = nr.max(max_size);
        }
        /*
         * reset nr to whatever the extent record actually declares; the
         * backref byte comparison runs against the declared size
         */
        if extent_rec {
            rec.nr = nr;
        }

        if start != rec.start {
            eprintln!("warning, start mismatch {} {}", rec.start, start);
        }
        if extent_item_refs != 0 {
            if rec.extent_item_refs != 0 {
                eprintln!(
                    "block {} rec extent_item_refs {}, passed {}",
                    start, rec.extent_item_refs, extent_item_refs
                );
            }
            rec.extent_item_refs = extent_item_refs;
        }
        if is_root {
            rec.is_root = true;
        }
        if set_checked {
            rec.content_checked = true;
            rec.owner_ref_checked = true;
        }
        if let Some(pk) = parent_key {
            rec.parent_key = Some(*pk);
        }
        if rec.max_size < max_size {
            rec.max_size = max_size;
        }
        maybe_free_extent_rec(extent_cache, start);
        return;
    }

    let rec = ExtentRecord {
        start,
        max_size,
        nr: nr.max(max_size),
        refs: if inc_ref { 1 } else { 0 },
        extent_item_refs,
        generation: 0,
        parent_key: parent_key.copied(),
        info_objectid: 0,
        info_level: 0,
        content_checked: set_checked,
        owner_ref_checked: set_checked,
        is_root,
        metadata,
        backrefs: Vec::new(),
    };
    stats.bytes_used += nr;
    extent_cache
        .insert(start, nr, rec)
        .ok()
        .expect("extent record collided");
}

fn add_tree_backref(
    extent_cache: &mut ExtentCache,
    bytenr: u64,
    parent: u64,
    root: u64,
    found_ref: bool,
    stats: &mut Stats,
) {
    if extent_cache.find(bytenr, 1).is_none() {
        add_extent_rec(
            extent_cache,
            None,
            bytenr,
            1,
            0,
            false,
            false,
            false,
            true,
            false,
            0,
            stats,
        );
    }
    let (_, _, rec) = extent_cache
        .find_mut(bytenr, 1)
        .expect("extent record vanished");
    assert_eq!(rec.start, bytenr);

    let idx = match find_tree_backref(rec, parent, root) {
        Some(i) => i,
        None => alloc_tree_backref(rec, parent, root),
    };
    let Backref::Tree(back) = &mut rec.backrefs[idx] else {
        unreachable!()
    };
    if found_ref {
        if back.base.found_ref {
            eprintln!(
                "Extent back ref already exists for {bytenr} parent {parent} root {root}"
            );
        }
        back.base.found_ref = true;
    } else {
        if back.base.found_extent_tree {
            eprintln!(
                "Extent back ref already exists for {bytenr} parent {parent} root {root}"
            );
        }
        back.base.found_extent_tree = true;
    }
}

#[allow(clippy::too_many_arguments)]
fn add_data_backref(
    extent_cache: &mut ExtentCache,
    bytenr: u64,
    parent: u64,
    root: u64,
    owner: u64,
    offset: u64,
    num_refs: u32,
    found_ref: bool,
    max_size: u64,
    stats: &mut Stats,
) {
    if extent_cache.find(bytenr, 1).is_none() {
        add_extent_rec(
            extent_cache,
            None,
            bytenr,
            1,
            0,
            false,
            false,
            false,
            false,
            false,
            max_size,
            stats,
        );
    }
    let (_, _, rec) = extent_cache
        .find_mut(bytenr, 1)
        .expect("extent record vanished");
    assert_eq!(rec.start, bytenr);
    if rec.max_size < max_size {
        rec.max_size = max_size;
    }

    let idx = match find_data_backref(rec, parent, root, owner, offset, found_ref, max_size) {
        Some(i) => i,
        None => alloc_data_backref(rec, parent, root, owner, offset, max_size),
    };
    let Backref::Data(back) = &mut rec.backrefs[idx] else {
        unreachable!()
    };
    if found_ref {
        assert_eq!(num_refs, 1);
        if back.base.found_ref {
            assert_eq!(back.bytes, max_size);
        }
        back.base.found_ref = true;
        back.found_ref += 1;
        back.bytes = max_size;
    } else {
        if back.base.found_extent_tree {
            eprintln!(
                "Extent back ref already exists for {bytenr} parent {parent} root {root} owner {owner} offset {offset} num_refs {num_refs}"
            );
        }
        back.num_refs = num_refs;
        back.base.found_extent_tree = true;
    }
}

fn add_pending(pending: &mut CacheTree<()>, seen: &mut CacheTree<()>, bytenr: u64, size: u64) {
    if seen.insert(bytenr, size, ()).is_err() {
        return;
    }
    pending.insert(bytenr, size, ()).ok();
}

/// scheduling policy for the scan: readahead hints first, then the node
/// queue near the last address for locality, pending leaves as fallback;
/// slack in the batch is topped up with pending blocks within 32 KiB
fn pick_next_pending(
    pending: &mut CacheTree<()>,
    reada: &mut CacheTree<()>,
    nodes: &mut CacheTree<()>,
    last: u64,
    bits_nr: usize,
) -> (Vec<(u64, u64)>, bool) {
    let mut bits = Vec::new();

    if let Some((start, size, _)) = reada.find_first(0) {
        bits.push((start, size));
        return (bits, true);
    }

    let node_start = last.saturating_sub(32768);
    let mut cursor = nodes.find_first(node_start);
    if cursor.is_none() {
        cursor = nodes.find_first(0);
    }

    if cursor.is_none() {
        let mut next = pending.find_first(0);
        while let Some((start, size, _)) = next {
            bits.push((start, size));
            if bits.len() >= bits_nr {
                break;
            }
            next = pending.next_after(start);
        }
        return (bits, false);
    }

    let mut next = cursor.map(|(s, l, _)| (s, l));
    while let Some((start, size)) = next {
        bits.push((start, size));
        if bits.len() >= bits_nr {
            break;
        }
        next = nodes.next_after(start).map(|(s, l, _)| (s, l));
    }

    if bits_nr - bits.len() > 8 {
        let mut lookup = bits[0].0 + bits[0].1;
        let mut next = pending.find_first(lookup);
        while let Some((start, size, _)) = next {
            if start.saturating_sub(lookup) > 32768 {
                break;
            }
            bits.push((start, size));
            lookup = start + size;
            if bits.len() >= bits_nr {
                break;
            }
            next = pending.next_after(start);
        }
    }
    (bits, false)
}

/// does every backref of this record point at the extent tree itself?
fn is_extent_tree_record(rec: &ExtentRecord) -> bool {
    let mut is_extent = false;
    for back in &rec.backrefs {
        match back {
            Backref::Data(_) => return false,
            Backref::Tree(t) => {
                if t.base.full_backref {
                    return false;
                }
                if t.root == BTRFS_EXTENT_TREE_OBJECTID {
                    is_extent = true;
                }
            }
        }
    }
    is_extent
}

fn record_bad_block_io(fs: &FsInfo, extent_cache: &mut ExtentCache, start: u64, len: u64) {
    let Some((_, _, rec)) = extent_cache.find(start, len) else {
        return;
    };
    if !is_extent_tree_record(rec) {
        return;
    }
    let key = rec.parent_key.unwrap_or_default();
    fs.add_corrupt_block(&key, start, len, 0);
}

/// try to locate `buf` under its declared owner tree; blocks carrying
/// owner-encoded refs must be reachable from that root
fn check_owner_ref(fs: &FsInfo, rec: &ExtentRecord, buf: &EbRef) -> bool {
    for node in &rec.backrefs {
        let Backref::Tree(back) = node else { continue };
        if !back.base.found_ref || back.base.full_backref {
            continue;
        }
        if buf.header_owner() == back.root {
            return false;
        }
    }
    assert!(!rec.is_root);

    /* try to find the block in the corresponding fs tree */
    let Ok(ref_root) = crate::btrfs::read_root(fs, buf.header_owner()) else {
        return true;
    };
    if buf.nritems() == 0 {
        return true;
    }
    let level = buf.level();
    let key = buf.first_key();

    let mut path = Path::new();
    path.lowest_level = level + 1;
    if search_slot(None, fs, &ref_root, &key, &mut path, 0, false).is_err() {
        return false;
    }

    let mut found = false;
    if let Some(parent) = &path.nodes[level as usize + 1] {
        if buf.start == parent.node_blockptr(path.slots[level as usize + 1]) {
            found = true;
        }
    }
    !found
}

fn check_block(
    fs: &FsInfo,
    extent_cache: &mut ExtentCache,
    buf: &EbRef,
    flags: u64,
) -> i32 {
    let Some((rec_start, _, rec)) = extent_cache.find_mut(buf.start, buf.len() as u64) else {
        return 1;
    };
    rec.generation = buf.header_generation();

    let level = buf.level();
    if buf.nritems() > 0 {
        rec.info_objectid = buf.first_key().objectid;
    }
    rec.info_level = level;

    let parent_key = rec.parent_key;
    let rec_snapshot = rec.clone();

    let structural = if buf.is_leaf() {
        check_leaf(fs, parent_key.as_ref(), buf)
    } else {
        check_node(fs, parent_key.as_ref(), buf)
    };

    let mut ret = 1;
    if structural.is_err() {
        eprintln!("bad block {}", buf.start);
    } else {
        ret = 0;
        let owner_ok = if flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0 {
            true
        } else {
            !check_owner_ref(fs, &rec_snapshot, buf)
        };
        let (_, _, rec) = extent_cache.find_mut(buf.start, buf.len() as u64).unwrap();
        rec.content_checked = true;
        if owner_ok {
            rec.owner_ref_checked = true;
        }
    }
    if ret == 0 {
        maybe_free_extent_rec(extent_cache, rec_start);
    }
    ret
}

fn process_extent_ref_v0(
    extent_cache: &mut ExtentCache,
    eb: &EbRef,
    slot: usize,
    key: &Key,
    stats: &mut Stats,
) {
    let data = eb.item_data(slot);
    let objectid = u64::from_le_bytes(data[16..24].try_into().unwrap());
    let count = u32::from_le_bytes(data[24..28].try_into().unwrap());
    if objectid < BTRFS_FIRST_FREE_OBJECTID {
        add_tree_backref(extent_cache, key.objectid, key.offset, 0, false, stats);
    } else {
        add_data_backref(
            extent_cache,
            key.objectid,
            key.offset,
            0,
            0,
            0,
            count,
            false,
            0,
            stats,
        );
    }
}

fn process_extent_item(
    fs: &FsInfo,
    extent_cache: &mut ExtentCache,
    eb: &EbRef,
    slot: usize,
    stats: &mut Stats,
) {
    let key = eb.item_key(slot);
    let item_size = eb.item_size(slot) as usize;
    let data = eb.item_data(slot);

    let metadata = key.item_type == BTRFS_METADATA_ITEM_KEY;
    let num_bytes = if metadata {
        fs.nodesize as u64
    } else {
        key.offset
    };

    if item_size < 24 {
        /* legacy v0 extent item: a bare u32 refcount */
        let refs = u32::from_le_bytes(data[0..4].try_into().unwrap()) as u64;
        add_extent_rec(
            extent_cache,
            None,
            key.objectid,
            num_bytes,
            refs,
            false,
            false,
            false,
            metadata,
            true,
            num_bytes,
            stats,
        );
        return;
    }

    let refs = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let flags = u64::from_le_bytes(data[16..24].try_into().unwrap());
    add_extent_rec(
        extent_cache,
        None,
        key.objectid,
        num_bytes,
        refs,
        false,
        false,
        false,
        metadata,
        true,
        num_bytes,
        stats,
    );

    let mut ptr = 24;
    if flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0 && key.item_type == BTRFS_EXTENT_ITEM_KEY {
        ptr += 18; // btrfs_tree_block_info
    }
    while ptr < item_size {
        let ref_type = data[ptr];
        let offset = u64::from_le_bytes(data[ptr + 1..ptr + 9].try_into().unwrap());
        match ref_type {
            BTRFS_TREE_BLOCK_REF_KEY => {
                add_tree_backref(extent_cache, key.objectid, 0, offset, false, stats);
                ptr += 9;
            }
            BTRFS_SHARED_BLOCK_REF_KEY => {
                add_tree_backref(extent_cache, key.objectid, offset, 0, false, stats);
                ptr += 9;
            }
            BTRFS_EXTENT_DATA_REF_KEY => {
                let dref = &data[ptr + 1..ptr + 29];
                let root = u64::from_le_bytes(dref[0..8].try_into().unwrap());
                let owner = u64::from_le_bytes(dref[8..16].try_into().unwrap());
                let off = u64::from_le_bytes(dref[16..24].try_into().unwrap());
                let count = u32::from_le_bytes(dref[24..28].try_into().unwrap());
                add_data_backref(
                    extent_cache,
                    key.objectid,
                    0,
                    root,
                    owner,
                    off,
                    count,
                    false,
                    num_bytes,
                    stats,
                );
                ptr += 29;
            }
            BTRFS_SHARED_DATA_REF_KEY => {
                let count = u32::from_le_bytes(data[ptr + 9..ptr + 13].try_into().unwrap());
                add_data_backref(
                    extent_cache,
                    key.objectid,
                    offset,
                    0,
                    0,
                    0,
                    count,
                    false,
                    num_bytes,
                    stats,
                );
                ptr += 13;
            }
            _ => {
                eprintln!(
                    "corrupt extent record: key {} {} {}",
                    key.objectid, key.item_type, num_bytes
                );
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_next_block(
    fs: &FsInfo,
    bits_nr: usize,
    last: &mut u64,
    pending: &mut CacheTree<()>,
    seen: &mut CacheTree<()>,
    reada: &mut CacheTree<()>,
    nodes: &mut CacheTree<()>,
    extent_cache: &mut ExtentCache,
    stats: &mut Stats,
) -> Result<i32> {
    let (bits, reada_bits) = pick_next_pending(pending, reada, nodes, *last, bits_nr);
    if bits.is_empty() {
        return Ok(1);
    }
    if !reada_bits {
        for &(start, size) in &bits {
            reada.insert(start, size, ()).ok();
            readahead_tree_block(fs, start, size);
        }
    }
    *last = bits[0].0;
    let bytenr = bits[0].0;
    let size = bits[0].1;

    pending.remove(bytenr);
    reada.remove(bytenr);
    nodes.remove(bytenr);

    let buf = match read_tree_block(fs, bytenr) {
        Ok(buf) => buf,
        Err(e) => {
            debug!("unreadable block {bytenr}: {e}");
            record_bad_block_io(fs, extent_cache, bytenr, size);
            return Ok(0);
        }
    };

    let nritems = buf.nritems() as usize;
    let flags = match lookup_extent_info(fs, bytenr) {
        Ok(Some((_, flags))) => flags,
        _ => BTRFS_BLOCK_FLAG_FULL_BACKREF,
    };

    let (parent, owner) = if flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0 {
        (bytenr, 0)
    } else {
        (0, buf.header_owner())
    };

    if check_block(fs, extent_cache, &buf, flags) != 0 {
        return Ok(0);
    }

    if buf.is_leaf() {
        stats.btree_space_waste += leaf_free_space(fs, &buf).max(0) as u64;
        for i in 0..nritems {
            let key = buf.item_key(i);
            match key.item_type {
                BTRFS_EXTENT_ITEM_KEY | BTRFS_METADATA_ITEM_KEY => {
                    process_extent_item(fs, extent_cache, &buf, i, stats);
                }
                BTRFS_EXTENT_CSUM_KEY => {
                    stats.total_csum_bytes += buf.item_size(i) as u64;
                }
                BTRFS_BLOCK_GROUP_ITEM_KEY => {}
                BTRFS_EXTENT_REF_V0_KEY => {
                    process_extent_ref_v0(extent_cache, &buf, i, &key, stats);
                }
                BTRFS_TREE_BLOCK_REF_KEY => {
                    add_tree_backref(extent_cache, key.objectid, 0, key.offset, false, stats);
                }
                BTRFS_SHARED_BLOCK_REF_KEY => {
                    add_tree_backref(extent_cache, key.objectid, key.offset, 0, false, stats);
                }
                BTRFS_EXTENT_DATA_REF_KEY => {
                    let data = buf.item_data(i);
                    let root = u64::from_le_bytes(data[0..8].try_into().unwrap());
                    let ref_owner = u64::from_le_bytes(data[8..16].try_into().unwrap());
                    let off = u64::from_le_bytes(data[16..24].try_into().unwrap());
                    let count = u32::from_le_bytes(data[24..28].try_into().unwrap());
                    add_data_backref(
                        extent_cache,
                        key.objectid,
                        0,
                        root,
                        ref_owner,
                        off,
                        count,
                        false,
                        fs.sectorsize as u64,
                        stats,
                    );
                }
                BTRFS_SHARED_DATA_REF_KEY => {
                    let data = buf.item_data(i);
                    let count = u32::from_le_bytes(data[0..4].try_into().unwrap());
                    add_data_backref(
                        extent_cache,
                        key.objectid,
                        key.offset,
                        0,
                        0,
                        0,
                        count,
                        false,
                        fs.sectorsize as u64,
                        stats,
                    );
                }
                BTRFS_EXTENT_DATA_KEY => {
                    let data = buf.item_data(i);
                    if data[BTRFS_FILE_EXTENT_INLINE_DATA_START - 1]
                        == BTRFS_FILE_EXTENT_INLINE
                    {
                        continue;
                    }
                    let disk_bytenr =
                        u64::from_le_bytes(data[21..29].try_into().unwrap());
                    if disk_bytenr == 0 {
                        continue;
                    }
                    let disk_num_bytes =
                        u64::from_le_bytes(data[29..37].try_into().unwrap());
                    let extent_offset =
                        u64::from_le_bytes(data[37..45].try_into().unwrap());
                    let num_bytes = u64::from_le_bytes(data[45..53].try_into().unwrap());
                    stats.data_bytes_allocated += disk_num_bytes;
                    assert!(stats.data_bytes_allocated >= fs.sectorsize as u64);
                    stats.data_bytes_referenced += num_bytes;
                    add_extent_rec(
                        extent_cache,
                        None,
                        disk_bytenr,
                        disk_num_bytes,
                        0,
                        false,
                        true,
                        true,
                        false,
                        false,
                        disk_num_bytes,
                        stats,
                    );
                    add_data_backref(
                        extent_cache,
                        disk_bytenr,
                        parent,
                        owner,
                        key.objectid,
                        key.offset.wrapping_sub(extent_offset),
                        1,
                        true,
                        disk_num_bytes,
                        stats,
                    );
                }
                _ => {}
            }
        }
    } else {
        let level = buf.level();
        let blocksize = fs.nodesize as u64;
        for i in 0..nritems {
            let ptr = buf.node_blockptr(i);
            let key = buf.node_key(i);
            add_extent_rec(
                extent_cache,
                Some(&key),
                ptr,
                blocksize,
                0,
                false,
                true,
                false,
                true,
                false,
                blocksize,
                stats,
            );
            add_tree_backref(extent_cache, ptr, parent, owner, true, stats);

            if level > 1 {
                add_pending(nodes, seen, ptr, blocksize);
            } else {
                add_pending(pending, seen, ptr, blocksize);
            }
        }
        stats.btree_space_waste +=
            (nodeptrs_per_block(fs) as u64 - nritems as u64) * BTRFS_KEY_PTR_SIZE as u64;
    }

    stats.total_btree_bytes += buf.len() as u64;
    if is_fs_root_objectid(buf.header_owner()) {
        stats.total_fs_tree_bytes += buf.len() as u64;
    }
    if buf.header_owner() == BTRFS_EXTENT_TREE_OBJECTID {
        stats.total_extent_tree_bytes += buf.len() as u64;
    }
    if !stats.found_old_backref
        && buf.header_owner() == BTRFS_TREE_RELOC_OBJECTID
        && buf.backref_rev() == BTRFS_MIXED_BACKREF_REV
        && !buf.header_flag(BTRFS_HEADER_FLAG_RELOC)
    {
        stats.found_old_backref = true;
    }
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn add_root_to_pending(
    buf: &EbRef,
    extent_cache: &mut ExtentCache,
    pending: &mut CacheTree<()>,
    seen: &mut CacheTree<()>,
    nodes: &mut CacheTree<()>,
    root_objectid: u64,
    stats: &mut Stats,
) {
    if buf.level() > 0 {
        add_pending(nodes, seen, buf.start, buf.len() as u64);
    } else {
        add_pending(pending, seen, buf.start, buf.len() as u64);
    }
    add_extent_rec(
        extent_cache,
        None,
        buf.start,
        buf.len() as u64,
        0,
        true,
        true,
        false,
        true,
        false,
        buf.len() as u64,
        stats,
    );

    if root_objectid == BTRFS_TREE_RELOC_OBJECTID
        || buf.backref_rev() < BTRFS_MIXED_BACKREF_REV
    {
        add_tree_backref(extent_cache, buf.start, buf.start, 0, true, stats);
    } else {
        add_tree_backref(extent_cache, buf.start, 0, root_objectid, true, stats);
    }
}

/// replay reference drops the engine performed while repairing, so the
/// in-memory records stay in line with the trees being fixed
fn apply_free_extent_log(fs: &FsInfo, extent_cache: &mut ExtentCache) {
    let events: Vec<_> = fs.free_extent_log.borrow_mut().drain(..).collect();
    for ev in events {
        let is_data = ev.owner >= BTRFS_FIRST_FREE_OBJECTID;
        let Some((start, _, rec)) = extent_cache.find_mut(ev.bytenr, ev.num_bytes) else {
            continue;
        };
        let drop = ev.refs_to_drop;

        if is_data {
            let Some(idx) = find_data_backref(
                rec, ev.parent, ev.root_objectid, ev.owner, ev.offset, true, ev.num_bytes,
            ) else {
                continue;
            };
            let mut remove = false;
            {
                let Backref::Data(back) = &mut rec.backrefs[idx] else {
                    unreachable!()
                };
                if back.base.found_ref {
                    back.found_ref = back.found_ref.saturating_sub(drop);
                    if rec.refs > 0 {
                        rec.refs -= (drop as u64).min(rec.refs);
                    }
                }
                if back.base.found_extent_tree {
                    back.num_refs = back.num_refs.saturating_sub(drop);
                    if rec.extent_item_refs > 0 {
                        rec.extent_item_refs -= (drop as u64).min(rec.extent_item_refs);
                    }
                }
                if back.found_ref == 0 {
                    back.base.found_ref = false;
                }
                if back.num_refs == 0 {
                    back.base.found_extent_tree = false;
                }
                if !back.base.found_extent_tree && back.base.found_ref {
                    remove = true;
                }
            }
            if remove {
                rec.backrefs.remove(idx);
            }
        } else {
            let Some(idx) = find_tree_backref(rec, ev.parent, ev.root_objectid) else {
                continue;
            };
            let mut remove = false;
            {
                let Backref::Tree(back) = &mut rec.backrefs[idx] else {
                    unreachable!()
                };
                if back.base.found_ref {
                    if rec.refs > 0 {
                        rec.refs -= 1;
                    }
                    back.base.found_ref = false;
                }
                if back.base.found_extent_tree {
                    if rec.extent_item_refs > 0 {
                        rec.extent_item_refs -= 1;
                    }
                    back.base.found_extent_tree = false;
                }
                if !back.base.found_extent_tree && back.base.found_ref {
                    remove = true;
                }
            }
            if remove {
                rec.backrefs.remove(idx);
            }
        }
        maybe_free_extent_rec(extent_cache, start);
    }
}

/// delete every extent tree entry for [bytenr, bytenr + max_size):
/// extent/metadata items, keyed ref items, legacy v0 refs
fn delete_extent_records(trans: &TransHandle, fs: &FsInfo, bytenr: u64) -> Result<()> {
    let extent_root = fs.extent_root();
    let mut key = Key::new(bytenr, u8::MAX, u64::MAX);

    loop {
        let mut path = Path::new();
        let found = search_slot(Some(trans), fs, &extent_root, &key, &mut path, 0, true)?;
        if !found {
            if path.slots[0] == 0 {
                break;
            }
            path.slots[0] -= 1;
        }

        let leaf = path.leaf();
        let slot = path.slots[0];
        let found_key = leaf.item_key(slot);
        if found_key.objectid != bytenr {
            break;
        }

        let interesting = matches!(
            found_key.item_type,
            BTRFS_EXTENT_ITEM_KEY
                | BTRFS_METADATA_ITEM_KEY
                | BTRFS_TREE_BLOCK_REF_KEY
                | BTRFS_EXTENT_DATA_REF_KEY
                | BTRFS_EXTENT_REF_V0_KEY
                | BTRFS_SHARED_BLOCK_REF_KEY
                | BTRFS_SHARED_DATA_REF_KEY
        );
        if !interesting {
            path.release();
            if found_key.item_type == 0 {
                if found_key.offset == 0 {
                    break;
                }
                key.offset = found_key.offset - 1;
                continue;
            }
            key.item_type = found_key.item_type - 1;
            key.offset = u64::MAX;
            continue;
        }

        eprintln!(
            "repair deleting extent record: key {} {} {}",
            found_key.objectid, found_key.item_type, found_key.offset
        );

        del_items(trans, fs, &extent_root, &mut path, slot, 1)?;
        path.release();

        if found_key.item_type == BTRFS_EXTENT_ITEM_KEY
            || found_key.item_type == BTRFS_METADATA_ITEM_KEY
        {
            let bytes = if found_key.item_type == BTRFS_EXTENT_ITEM_KEY {
                found_key.offset
            } else {
                fs.nodesize as u64
            };
            update_block_group(trans, fs, bytenr, bytes, false)?;
        }
    }
    Ok(())
}

/// allocate a fresh extent item for the record (first call) and replay
/// one backref into the extent tree
fn record_extent(
    trans: &TransHandle,
    fs: &FsInfo,
    rec: &mut ExtentRecord,
    back: &Backref,
    allocated: bool,
    flags: u64,
) -> Result<()> {
    let extent_root = fs.extent_root();
    let is_data = matches!(back, Backref::Data(_));

    if !is_data {
        rec.max_size = rec.max_size.max(fs.nodesize as u64);
    }

    if !allocated {
        let item_size: u32 = if is_data { 24 } else { 24 + 18 };
        let ins_key = Key::new(rec.start, BTRFS_EXTENT_ITEM_KEY, rec.max_size);

        let mut path = Path::new();
        insert_empty_item(trans, fs, &extent_root, &mut path, &ins_key, item_size)?;
        let leaf = path.leaf();
        let ptr = leaf.item_ptr_offset(path.slots[0]);
        leaf.write_u64(ptr, 0); // refs; the backref replay bumps them
        leaf.write_u64(ptr + 8, rec.generation);
        if is_data {
            leaf.write_u64(ptr + 16, BTRFS_EXTENT_FLAG_DATA);
        } else {
            leaf.write_u64(ptr + 16, BTRFS_EXTENT_FLAG_TREE_BLOCK | flags);
            let info_key = Key::new(rec.info_objectid, 0, 0);
            leaf.write_bytes(ptr + 24, &info_key.to_disk_bytes());
            leaf.write_u8(ptr + 41, rec.info_level);
        }
        leaf.mark_dirty();
        path.release();
        update_block_group(trans, fs, rec.start, rec.max_size, true)?;
    }

    match back {
        Backref::Data(dback) => {
            let parent = if dback.base.full_backref {
                dback.parent
            } else {
                0
            };
            for _ in 0..dback.found_ref {
                /* a nonzero parent makes the backref parent-encoded; the
                 * owner only has to look like a data objectid then */
                inc_extent_ref(
                    trans,
                    fs,
                    rec.start,
                    rec.max_size,
                    parent,
                    dback.root,
                    if parent != 0 {
                        BTRFS_FIRST_FREE_OBJECTID
                    } else {
                        dback.owner
                    },
                    dback.offset,
                )?;
            }
            eprintln!(
                "adding new data backref on {} {} {} owner {} offset {} found {}",
                rec.start,
                if dback.base.full_backref { "parent" } else { "root" },
                if dback.base.full_backref {
                    dback.parent
                } else {
                    dback.root
                },
                dback.owner,
                dback.offset,
                dback.found_ref
            );
        }
        Backref::Tree(tback) => {
            let parent = if tback.base.full_backref {
                tback.parent
            } else {
                0
            };
            inc_extent_ref(trans, fs, rec.start, rec.max_size, parent, tback.root, 0, 0)?;
            eprintln!(
                "adding new tree backref on start {} len {} parent {} root {}",
                rec.start, rec.max_size, tback.parent, tback.root
            );
        }
    }
    Ok(())
}

/// delete all existing entries for a failing record and recreate them
/// from what the tree scan actually found
fn fixup_extent_refs(
    trans: &TransHandle,
    fs: &FsInfo,
    extent_cache: &mut ExtentCache,
    rec: &mut ExtentRecord,
) -> Result<()> {
    /* remember the flags for recreating the extent */
    let flags = match lookup_extent_info(fs, rec.start) {
        Ok(Some((_, flags))) => flags,
        _ => BTRFS_BLOCK_FLAG_FULL_BACKREF,
    };

    /* step one, delete all the existing records */
    delete_extent_records(trans, fs, rec.start)?;
    apply_free_extent_log(fs, extent_cache);

    /* was this block corrupt?  If so, don't add references to it */
    if fs
        .corrupt_blocks
        .borrow()
        .find(rec.start, rec.max_size)
        .is_some()
    {
        return Ok(());
    }

    /* step two, recreate all the refs we did find */
    let backrefs = rec.backrefs.clone();
    let mut allocated = false;
    for back in &backrefs {
        /*
         * if we didn't find any references, don't create a new extent
         * record
         */
        let found = match back {
            Backref::Tree(t) => t.base.found_ref,
            Backref::Data(d) => d.base.found_ref,
        };
        if !found {
            continue;
        }
        record_extent(trans, fs, rec, back, allocated, flags)?;
        allocated = true;
    }
    apply_free_extent_log(fs, extent_cache);
    Ok(())
}

/// descend to the parent of a corrupt block and delete the pointer to it,
/// scanning upward when the search does not land on it directly
fn prune_one_block(
    trans: &TransHandle,
    fs: &FsInfo,
    key: &Key,
    corrupt_level: u8,
    start: u64,
) -> Result<()> {
    let extent_root = fs.extent_root();
    let mut level = corrupt_level as usize + 1;

    loop {
        /* we want to stop at the parent of our busted block */
        let mut path = Path::new();
        path.lowest_level = level as u8;
        search_slot(Some(trans), fs, &extent_root, key, &mut path, -1, true)?;

        let Some(eb) = path.nodes[level].clone() else {
            return Err(FsckError::Unsupported("corrupt block has no parent"));
        };

        /*
         * hopefully the search gave us the block we want to prune,
         * lets try that first
         */
        let slot = path.slots[level];
        if eb.node_blockptr(slot) == start {
            println!("deleting pointer to block {start}");
            return del_ptr(trans, fs, &extent_root, &mut path, level, slot);
        }

        /* the search missed, scan this whole node for the pointer */
        let nritems = eb.nritems() as usize;
        for slot in 0..nritems {
            if eb.node_blockptr(slot) == start {
                println!("deleting pointer to block {start}");
                path.slots[level] = slot;
                return del_ptr(trans, fs, &extent_root, &mut path, level, slot);
            }
        }

        if Rc::ptr_eq(&eb, &extent_root.node()) {
            return Err(FsckError::Unsupported("corrupt block not referenced"));
        }
        level += 1;
    }
}

fn prune_corrupt_blocks(trans: &TransHandle, fs: &FsInfo) {
    let corrupt: Vec<(u64, Key, u8)> = fs
        .corrupt_blocks
        .borrow()
        .iter()
        .map(|(start, _, c)| (start, c.key, c.level))
        .collect();
    for (start, key, level) in corrupt {
        if let Err(e) = prune_one_block(trans, fs, &key, level, start) {
            eprintln!("unable to prune corrupt block {start}: {e}");
        }
    }
}

/// final reconciliation: every surviving record is a discrepancy; print
/// them all and, in repair mode, rewrite the extent tree to match the
/// scan
pub fn check_extent_refs(
    trans: Option<&TransHandle>,
    fs: &FsInfo,
    extent_cache: &mut ExtentCache,
    repair: bool,
) -> Result<i32> {
    let mut err = 0;

    if repair {
        let trans = trans.expect("repair without a transaction");
        /*
         * if we're doing a repair, we have to make sure we don't allocate
         * from the problem extents. In the worst case, this will be all
         * the extents in the FS.
         */
        for (_, _, rec) in extent_cache.iter() {
            pin_extent(fs, rec.start, rec.max_size);
        }

        /* pin down all the corrupted blocks too */
        let corrupt: Vec<(u64, u64)> = fs
            .corrupt_blocks
            .borrow()
            .iter()
            .map(|(start, len, _)| (start, len))
            .collect();
        for (start, len) in corrupt {
            pin_extent(fs, start, len);
        }
        prune_corrupt_blocks(trans, fs);
        apply_free_extent_log(fs, extent_cache);
    }

    loop {
        let Some((start, _, _)) = extent_cache.find_first(0) else {
            break;
        };
        let (_, mut rec) = extent_cache.remove(start).unwrap();
        let mut fixed = false;

        if rec.refs != rec.extent_item_refs {
            eprintln!("ref mismatch on [{} {}] ", rec.start, rec.nr);
            eprintln!(
                "extent item {}, found {}",
                rec.extent_item_refs, rec.refs
            );
            if !fixed && repair {
                fixup_extent_refs(trans.unwrap(), fs, extent_cache, &mut rec)?;
                fixed = true;
            }
            err = 1;
        }
        if all_backpointers_checked(&rec, true) {
            eprintln!("backpointer mismatch on [{} {}]", rec.start, rec.nr);
            if !fixed && repair {
                fixup_extent_refs(trans.unwrap(), fs, extent_cache, &mut rec)?;
                fixed = true;
            }
            err = 1;
        }
        if !rec.owner_ref_checked {
            eprintln!("owner ref check failed [{} {}]", rec.start, rec.nr);
            if !fixed && repair {
                fixup_extent_refs(trans.unwrap(), fs, extent_cache, &mut rec)?;
            }
            err = 1;
        }
    }

    if repair {
        fix_block_accounting(trans.unwrap(), fs)?;
        if err != 0 {
            eprintln!("repaired damaged extent references");
        }
        return Ok(0);
    }
    Ok(err)
}

/// scan every tree from the superblock down and reconcile the extent
/// tree against what the scan found
pub fn check_extents(
    trans: Option<&TransHandle>,
    fs: &FsInfo,
    repair: bool,
    stats: &mut Stats,
) -> Result<i32> {
    let mut extent_cache = ExtentCache::new();
    let mut seen = CacheTree::new();
    let mut pending = CacheTree::new();
    let mut reada = CacheTree::new();
    let mut nodes = CacheTree::new();
    let bits_nr = 1024;
    let mut last: u64 = 0;

    if repair {
        fs.record_extent_removals.set(true);
    }

    add_root_to_pending(
        &fs.tree_root().node(),
        &mut extent_cache,
        &mut pending,
        &mut seen,
        &mut nodes,
        BTRFS_ROOT_TREE_OBJECTID,
        stats,
    );
    add_root_to_pending(
        &fs.chunk_root().node(),
        &mut extent_cache,
        &mut pending,
        &mut seen,
        &mut nodes,
        BTRFS_CHUNK_TREE_OBJECTID,
        stats,
    );

    /* push every tree named by a root item */
    let tree_root = fs.tree_root();
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
        let found_key = leaf.item_key(path.slots[0]);
        if found_key.item_type == BTRFS_ROOT_ITEM_KEY {
            let ri = parse_root_item(&leaf.item_data(path.slots[0]));
            match read_tree_block(fs, ri.bytenr) {
                Ok(buf) => add_root_to_pending(
                    &buf,
                    &mut extent_cache,
                    &mut pending,
                    &mut seen,
                    &mut nodes,
                    found_key.objectid,
                    stats,
                ),
                Err(e) => eprintln!("cannot read root block of {}: {e}", found_key.objectid),
            }
        }
        path.slots[0] += 1;
    }
    path.release();

    loop {
        let ret = run_next_block(
            fs,
            bits_nr,
            &mut last,
            &mut pending,
            &mut seen,
            &mut reada,
            &mut nodes,
            &mut extent_cache,
            stats,
        )?;
        if ret != 0 {
            break;
        }
    }

    let ret = check_extent_refs(trans, fs, &mut extent_cache, repair);

    if repair {
        fs.record_extent_removals.set(false);
        fs.free_extent_log.borrow_mut().clear();
        fs.corrupt_blocks.borrow_mut().clear();
    }
    ret
}

/// the leaf validator feeds structural failures into the corrupt block
/// registry keyed by the block's parent key; leaf_data_size pins the
/// tiling invariant the validator enforces
#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> Stats {
        Stats::default()
    }

    #[test]
    fn extent_record_completes_and_dies() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        /* scan finds a tree block reference */
        add_extent_rec(
            &mut cache, None, 4096, 4096, 0, false, true, false, true, false, 4096, &mut st,
        );
        add_tree_backref(&mut cache, 4096, 0, 5, true, &mut st);
        assert!(cache.find(4096, 1).is_some());

        /* the extent tree declares the same */
        add_tree_backref(&mut cache, 4096, 0, 5, false, &mut st);
        add_extent_rec(
            &mut cache, None, 4096, 4096, 1, false, false, false, true, true, 4096, &mut st,
        );
        /* still alive: content/owner not checked yet */
        let (_, _, rec) = cache.find_mut(4096, 1).unwrap();
        rec.content_checked = true;
        rec.owner_ref_checked = true;
        maybe_free_extent_rec(&mut cache, 4096);
        assert!(cache.find(4096, 1).is_none());
    }

    #[test]
    fn missing_extent_tree_ref_is_reported() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        add_extent_rec(
            &mut cache, None, 8192, 4096, 0, false, true, true, false, false, 4096, &mut st,
        );
        add_data_backref(&mut cache, 8192, 0, 5, 256, 0, 1, true, 4096, &mut st);
        let (_, _, rec) = cache.find_mut(8192, 1).unwrap();
        assert!(all_backpointers_checked(rec, false));
    }

    #[test]
    fn mismatched_data_ref_lengths_become_two_backrefs() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        add_data_backref(&mut cache, 16384, 0, 5, 256, 0, 1, true, 4096, &mut st);
        add_data_backref(&mut cache, 16384, 0, 5, 256, 0, 1, true, 8192, &mut st);
        let (_, _, rec) = cache.find_mut(16384, 1).unwrap();
        assert_eq!(rec.backrefs.len(), 2);
    }
}
