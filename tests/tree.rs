use btrfs_fsck::btrfs::FsInfo;
use btrfs_fsck::format::make_test_fs;
use btrfs_fsck::structures::*;
use btrfs_fsck::transaction::{commit_transaction, start_transaction};
use btrfs_fsck::tree::*;

use std::rc::Rc;

fn csum_key(i: u64) -> Key {
    Key::new(BTRFS_EXTENT_CSUM_OBJECTID, BTRFS_EXTENT_CSUM_KEY, i * 4096)
}

fn payload(i: u64, len: usize) -> Vec<u8> {
    let mut v = vec![0_u8; len];
    v[..8].copy_from_slice(&i.to_le_bytes());
    v
}

/// walk every leaf left to right collecting keys
fn collect_keys(fs: &FsInfo, root: &Rc<btrfs_fsck::btrfs::Root>) -> Vec<Key> {
    let mut path = Path::new();
    let key = Key::new(0, 0, 0);
    search_slot(None, fs, root, &key, &mut path, 0, false).unwrap();
    let mut keys = Vec::new();
    loop {
        let leaf = path.leaf();
        if path.slots[0] >= leaf.nritems() as usize {
            if next_leaf(fs, root, &mut path).unwrap() != 0 {
                break;
            }
            continue;
        }
        keys.push(leaf.item_key(path.slots[0]));
        path.slots[0] += 1;
    }
    keys
}

/// node keys must equal their child's first key, levels must descend
fn check_tree_shape(fs: &FsInfo, root: &Rc<btrfs_fsck::btrfs::Root>) {
    fn recurse(fs: &FsInfo, eb: &btrfs_fsck::extent_buffer::EbRef) {
        if eb.is_leaf() {
            check_leaf(fs, None, eb).unwrap();
            return;
        }
        check_node(fs, None, eb).unwrap();
        for slot in 0..eb.nritems() as usize {
            let child = read_node_slot(fs, eb, slot).unwrap();
            assert_eq!(child.level(), eb.level() - 1);
            assert_eq!(child.first_key(), eb.node_key(slot));
            recurse(fs, &child);
        }
    }
    recurse(fs, &root.node());
}

#[test]
fn insert_then_search_finds_item() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);

    insert_item(&trans, &fs, &root, &csum_key(1), &payload(1, 16)).unwrap();
    commit_transaction(&fs, &trans).unwrap();

    let mut path = Path::new();
    let found = search_slot(None, &fs, &root, &csum_key(1), &mut path, 0, false).unwrap();
    assert!(found);
    let leaf = path.leaf();
    assert_eq!(leaf.item_data(path.slots[0]), payload(1, 16));
}

#[test]
fn duplicate_insert_is_rejected() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);
    insert_item(&trans, &fs, &root, &csum_key(1), &payload(1, 16)).unwrap();
    let err = insert_item(&trans, &fs, &root, &csum_key(1), &payload(1, 16));
    assert!(matches!(err, Err(btrfs_fsck::error::FsckError::ItemExists)));
}

#[test]
fn mass_insert_splits_and_keeps_order() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);

    /* more than a single 4k leaf can hold, inserted out of order */
    let count = 200_u64;
    for i in 0..count {
        let i = (i * 7919) % count; // scramble
        insert_item(&trans, &fs, &root, &csum_key(i), &payload(i, 64)).unwrap();
    }
    commit_transaction(&fs, &trans).unwrap();

    assert!(root.node().level() > 0, "tree should have grown a level");
    check_tree_shape(&fs, &root);

    let keys = collect_keys(&fs, &root);
    assert_eq!(keys.len(), count as usize);
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(*k, csum_key(i as u64));
    }

    /* every key individually findable with the right payload */
    for i in (0..count).step_by(17) {
        let mut path = Path::new();
        assert!(search_slot(None, &fs, &root, &csum_key(i), &mut path, 0, false).unwrap());
        assert_eq!(path.leaf().item_data(path.slots[0])[..8], i.to_le_bytes());
    }
}

#[test]
fn delete_all_collapses_to_empty_leaf() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);
    let count = 150_u64;
    for i in 0..count {
        insert_item(&trans, &fs, &root, &csum_key(i), &payload(i, 64)).unwrap();
    }
    assert!(root.node().level() > 0);

    for i in 0..count {
        let mut path = Path::new();
        let found =
            search_slot(Some(&trans), &fs, &root, &csum_key(i), &mut path, -1, true).unwrap();
        assert!(found, "key {i} disappeared");
        let slot = path.slots[0];
        del_items(&trans, &fs, &root, &mut path, slot, 1).unwrap();
    }
    commit_transaction(&fs, &trans).unwrap();

    let node = root.node();
    assert_eq!(node.level(), 0, "root should collapse back to a leaf");
    assert_eq!(node.nritems(), 0);
}

#[test]
fn batch_insert_and_ranged_delete() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);

    let keys: Vec<Key> = (0..8).map(csum_key).collect();
    let sizes = [24_u32; 8];
    let mut path = Path::new();
    insert_empty_items(&trans, &fs, &root, &mut path, &keys, &sizes).unwrap();
    let leaf = path.leaf();
    assert_eq!(leaf.nritems(), 8);
    path.release();

    /* delete the middle four in one call */
    let found = search_slot(Some(&trans), &fs, &root, &csum_key(2), &mut path, -1, true).unwrap();
    assert!(found);
    let slot = path.slots[0];
    del_items(&trans, &fs, &root, &mut path, slot, 4).unwrap();
    path.release();
    commit_transaction(&fs, &trans).unwrap();

    let remaining = collect_keys(&fs, &root);
    let expect: Vec<Key> = [0_u64, 1, 6, 7].iter().map(|&i| csum_key(i)).collect();
    assert_eq!(remaining, expect);
}

#[test]
fn truncate_and_extend_preserve_bytes() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);

    let data = payload(9, 64);
    insert_item(&trans, &fs, &root, &csum_key(0), &data).unwrap();
    insert_item(&trans, &fs, &root, &csum_key(1), &payload(1, 32)).unwrap();

    let mut path = Path::new();
    assert!(search_slot(Some(&trans), &fs, &root, &csum_key(0), &mut path, 0, true).unwrap());

    truncate_item(&fs, &mut path, 40, true).unwrap();
    let leaf = path.leaf();
    assert_eq!(leaf.item_size(path.slots[0]), 40);
    assert_eq!(leaf.item_data(path.slots[0]), data[..40]);
    assert!(leaf_free_space(&fs, &leaf) >= 0);

    extend_item(&fs, &mut path, 24).unwrap();
    let leaf = path.leaf();
    assert_eq!(leaf.item_size(path.slots[0]), 64);
    /* the original prefix survives both resizes */
    assert_eq!(leaf.item_data(path.slots[0])[..40], data[..40]);

    /* the neighbour is untouched */
    path.release();
    assert!(search_slot(None, &fs, &root, &csum_key(1), &mut path, 0, false).unwrap());
    assert_eq!(path.leaf().item_data(path.slots[0]), payload(1, 32));
}

#[test]
fn split_item_divides_payload() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);

    let data = payload(3, 48);
    insert_item(&trans, &fs, &root, &csum_key(0), &data).unwrap();

    let mut path = Path::new();
    assert!(search_slot(Some(&trans), &fs, &root, &csum_key(0), &mut path, 0, true).unwrap());
    let new_key = Key::new(BTRFS_EXTENT_CSUM_OBJECTID, BTRFS_EXTENT_CSUM_KEY, 16 * 1024);
    split_item(&trans, &fs, &root, &mut path, &new_key, 16).unwrap();

    let leaf = path.leaf();
    let slot = path.slots[0];
    assert_eq!(leaf.item_size(slot), 16);
    assert_eq!(leaf.item_data(slot), data[..16]);
    assert_eq!(leaf.item_key(slot + 1), new_key);
    assert_eq!(leaf.item_size(slot + 1), 32);
    assert_eq!(leaf.item_data(slot + 1), data[16..]);
    check_leaf(&fs, None, &leaf).unwrap();
}

#[test]
fn set_item_key_respects_neighbours() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);
    for i in [0_u64, 2, 4] {
        insert_item(&trans, &fs, &root, &csum_key(i), &payload(i, 16)).unwrap();
    }

    let mut path = Path::new();
    assert!(search_slot(Some(&trans), &fs, &root, &csum_key(2), &mut path, 0, true).unwrap());

    /* between the neighbours: fine */
    set_item_key_safe(&path, &csum_key(3)).unwrap();
    assert_eq!(path.leaf().item_key(path.slots[0]), csum_key(3));

    /* colliding with the next key: refused */
    assert!(set_item_key_safe(&path, &csum_key(4)).is_err());
    /* before the previous key: refused */
    assert!(set_item_key_safe(&path, &csum_key(0)).is_err());
}

#[test]
fn leaf_iteration_crosses_leaves_both_ways() {
    let fs = make_test_fs();
    let root = fs.csum_root();
    let trans = start_transaction(&fs);
    let count = 120_u64;
    for i in 0..count {
        insert_item(&trans, &fs, &root, &csum_key(i), &payload(i, 64)).unwrap();
    }
    commit_transaction(&fs, &trans).unwrap();
    assert!(root.node().level() > 0);

    /* forward from the start */
    assert_eq!(collect_keys(&fs, &root).len(), count as usize);

    /* backward from beyond the end */
    let mut path = Path::new();
    let probe = Key::new(u64::MAX, u8::MAX, u64::MAX);
    search_slot(None, &fs, &root, &probe, &mut path, 0, false).unwrap();
    let mut seen = 0;
    loop {
        if path.slots[0] == 0 {
            if prev_leaf(&fs, &root, &mut path).unwrap() != 0 {
                break;
            }
        } else {
            path.slots[0] -= 1;
        }
        if path.leaf().nritems() == 0 {
            break;
        }
        seen += 1;
        if seen > count {
            panic!("prev_leaf loop ran away");
        }
    }
    assert_eq!(seen, count);
}
