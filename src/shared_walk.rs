use crate::btrfs::Root;
use crate::cache_tree::CacheTree;
use crate::inode_record::{
    free_inode_rec, get_inode_rec, maybe_free_inode_rec, merge_inode_recs, InodeCache,
    InodeRecRef,
};
use crate::structures::*;

use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// Snapshots share subtrees; walking each subvolume in isolation would
/// rescan identical blocks and double count every fact inside them. The
/// walker instead memoises per shared block: the first visit records its
/// facts into a fresh cache, every later visit splices those facts into
/// whichever subvolume is walking and skips the subtree.

pub struct SharedNode {
    /// subvolume-naming entries found below this block (inode-record
    /// shaped; promoted to root records after the walk)
    pub root_cache: InodeCache,
    pub inode_cache: InodeCache,
    pub current: Option<InodeRecRef>,
    /// extent refcount of the block when first entered
    pub refs: u32,
}

pub type SharedNodeRef = Rc<RefCell<SharedNode>>;

pub fn new_shared_node(refs: u32) -> SharedNodeRef {
    Rc::new(RefCell::new(SharedNode {
        root_cache: InodeCache::new(),
        inode_cache: InodeCache::new(),
        current: None,
        refs,
    }))
}

/// per-walk state: the memo table plus the stack of caches facts are
/// currently being written into
pub struct WalkControl {
    pub shared: CacheTree<SharedNodeRef>,
    pub nodes: [Option<SharedNodeRef>; BTRFS_MAX_LEVEL],
    pub active_node: usize,
    pub root_level: usize,
}

impl WalkControl {
    pub fn new() -> WalkControl {
        WalkControl {
            shared: CacheTree::new(),
            nodes: Default::default(),
            active_node: 0,
            root_level: 0,
        }
    }

    pub fn active(&self) -> SharedNodeRef {
        self.nodes[self.active_node]
            .as_ref()
            .expect("walk has no active node")
            .clone()
    }
}

impl Default for WalkControl {
    fn default() -> Self {
        WalkControl::new()
    }
}

fn find_shared_node(shared: &CacheTree<SharedNodeRef>, bytenr: u64) -> Option<SharedNodeRef> {
    shared.find(bytenr, 1).map(|(_, _, n)| n.clone())
}

/// move (or clone, when other references remain) every record from src
/// into dst, merging on collision
pub fn splice_shared_node(src_node: &SharedNodeRef, dst_node: &SharedNodeRef) {
    assert!(!Rc::ptr_eq(src_node, dst_node));
    let splice = {
        let mut s = src_node.borrow_mut();
        s.refs -= 1;
        s.refs == 0
    };
    let current_ino = src_node
        .borrow()
        .current
        .as_ref()
        .map(|r| r.borrow().ino)
        .unwrap_or(0);

    {
        let src = &mut *src_node.borrow_mut();
        let dst = &mut *dst_node.borrow_mut();
        splice_cache(&mut src.root_cache, &mut dst.root_cache, &mut dst.current, splice);
        splice_cache(
            &mut src.inode_cache,
            &mut dst.inode_cache,
            &mut dst.current,
            splice,
        );

        if current_ino > 0
            && (dst.current.is_none()
                || current_ino > dst.current.as_ref().unwrap().borrow().ino)
        {
            if let Some(cur) = dst.current.take() {
                cur.borrow_mut().checked = true;
                maybe_free_inode_rec(&mut dst.inode_cache, &cur);
            }
            dst.current = get_inode_rec(&mut dst.inode_cache, current_ino, true);
        }
    }
}

fn splice_cache(
    src: &mut InodeCache,
    dst: &mut InodeCache,
    dst_current: &mut Option<InodeRecRef>,
    splice: bool,
) {
    let entries: Vec<(u64, InodeRecRef)> = if splice {
        let mut v = Vec::with_capacity(src.len());
        while let Some((ino, _, rec)) = src.pop_first() {
            v.push((ino, rec));
        }
        v
    } else {
        src.iter()
            .map(|(ino, _, rec)| {
                rec.borrow_mut().refs += 1;
                (ino, rec.clone())
            })
            .collect()
    };

    for (ino, rec) in entries {
        if dst.insert(ino, 1, rec.clone()).is_err() {
            let conflict = get_inode_rec(dst, ino, true).unwrap();
            merge_inode_recs(dst, &rec, &conflict);
            if rec.borrow().checked {
                conflict.borrow_mut().checked = true;
                if let Some(cur) = dst_current {
                    if Rc::ptr_eq(cur, &conflict) {
                        *dst_current = None;
                    }
                }
            }
            maybe_free_inode_rec(dst, &conflict);
            free_inode_rec(&rec);
        }
    }
}

fn free_shared_caches(node: &SharedNodeRef) {
    let mut n = node.borrow_mut();
    while let Some((_, _, rec)) = n.root_cache.pop_first() {
        free_inode_rec(&rec);
    }
    while let Some((_, _, rec)) = n.inode_cache.pop_first() {
        free_inode_rec(&rec);
    }
    n.current = None;
}

/// descend into a block with extent refcount > 1. Returns true when the
/// subtree has been seen before and must be skipped.
pub fn enter_shared_node(
    root: &Rc<Root>,
    bytenr: u64,
    refs: u64,
    wc: &mut WalkControl,
    level: usize,
) -> bool {
    if level == wc.active_node {
        return false;
    }
    assert!(wc.active_node > level);

    let node = find_shared_node(&wc.shared, bytenr);
    let Some(node) = node else {
        let node = new_shared_node(refs as u32);
        wc.shared
            .insert(bytenr, 1, node.clone())
            .ok()
            .expect("shared node collided");
        wc.nodes[level] = Some(node);
        wc.active_node = level;
        return false;
    };

    if wc.root_level == wc.active_node && root.refs() == 0 {
        /* the subvolume is being dropped; nothing to splice into */
        let gone = {
            let mut n = node.borrow_mut();
            n.refs -= 1;
            n.refs == 0
        };
        if gone {
            free_shared_caches(&node);
            wc.shared.remove(bytenr);
        }
        return true;
    }

    let dest = wc.active();
    splice_shared_node(&node, &dest);
    if node.borrow().refs == 0 {
        wc.shared.remove(bytenr);
    }
    debug!("spliced shared block {bytenr} at level {level}");
    true
}

/// ascending above the active node's level: hand its accumulated facts to
/// the next cache up the stack (or just unref them for a dropped root)
pub fn leave_shared_node(root: &Rc<Root>, wc: &mut WalkControl, level: usize) {
    if level == wc.root_level {
        return;
    }

    let mut dest_level = usize::MAX;
    for i in level + 1..BTRFS_MAX_LEVEL {
        if wc.nodes[i].is_some() {
            dest_level = i;
            break;
        }
    }
    assert!(dest_level < BTRFS_MAX_LEVEL);

    let node = wc.nodes[wc.active_node].take().expect("no active node to leave");
    wc.active_node = dest_level;
    let dest = wc.active();

    if wc.active_node < wc.root_level || root.refs() > 0 {
        assert!(node.borrow().refs > 1);
        splice_shared_node(&node, &dest);
    } else {
        assert!(node.borrow().refs >= 2);
        node.borrow_mut().refs -= 1;
    }
}
