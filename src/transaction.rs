use crate::btrfs::{root_item_to_bytes, FsInfo, Root};
use crate::disk_io::{write_dirty_blocks, write_super};
use crate::error::Result;
use crate::structures::*;
use crate::tree::{search_slot, Path};

use log::debug;
use std::rc::Rc;

/// One write transaction. The tool runs at most one at a time; every
/// engine mutation happens at generation + 1 until commit makes that the
/// filesystem's generation.
pub struct TransHandle {
    pub transid: u64,
}

pub fn start_transaction(fs: &FsInfo) -> TransHandle {
    let transid = fs.generation.get() + 1;
    fs.generation.set(transid);
    debug!("starting transaction {transid}");
    TransHandle { transid }
}

pub fn commit_transaction(fs: &FsInfo, trans: &TransHandle) -> Result<()> {
    /*
     * updating one root item can move other tree roots (splits inside the
     * tree of trees, allocations dirtying the extent root), so drain the
     * dirty list until it stays empty
     */
    loop {
        let next = fs.dirty_roots.borrow_mut().pop();
        let Some(root) = next else { break };
        if root.objectid == BTRFS_ROOT_TREE_OBJECTID
            || root.objectid == BTRFS_CHUNK_TREE_OBJECTID
        {
            /* recorded in the superblock, not in any root item */
            continue;
        }
        update_root(trans, fs, &root)?;
    }

    write_dirty_blocks(fs)?;
    write_super(fs)?;
    fs.trans_allocated.borrow_mut().clear();
    debug!("committed transaction {}", trans.transid);
    Ok(())
}

/// rewrite the tree's root item to point at the current root node
pub fn update_root(trans: &TransHandle, fs: &FsInfo, root: &Rc<Root>) -> Result<()> {
    let tree_root = fs.tree_root();
    let node = root.node();
    {
        let mut ri = root.root_item.borrow_mut();
        ri.bytenr = node.start;
        ri.level = node.level();
        ri.generation = trans.transid;
    }

    /* locate the highest root item for this tree */
    let mut path = Path::new();
    let key = Key::new(root.objectid, BTRFS_ROOT_ITEM_KEY, u64::MAX);
    let found = search_slot(None, fs, &tree_root, &key, &mut path, 0, false)?;
    if !found && path.slots[0] > 0 {
        path.slots[0] -= 1;
    }
    let found_key = path.leaf().item_key(path.slots[0]);
    assert_eq!(found_key.objectid, root.objectid);
    assert_eq!(found_key.item_type, BTRFS_ROOT_ITEM_KEY);
    path.release();

    /* now take the write path against the exact key */
    let found = search_slot(Some(trans), fs, &tree_root, &found_key, &mut path, 0, true)?;
    assert!(found);
    let leaf = path.leaf();
    let bytes = root_item_to_bytes(&root.root_item.borrow());
    let item_size = leaf.item_size(path.slots[0]) as usize;
    let item_ptr = leaf.item_ptr_offset(path.slots[0]);
    leaf.write_bytes(item_ptr, &bytes[..bytes.len().min(item_size)]);
    if item_size >= bytes.len() + 8 {
        /* extended root items carry generation_v2 right after */
        leaf.write_u64(item_ptr + bytes.len(), trans.transid);
    }
    leaf.mark_dirty();
    debug!(
        "updated root item {} to bytenr {}",
        root.objectid, node.start
    );
    Ok(())
}
