use btrfs_fsck::btrfs::{root_item_to_bytes, FsInfo, Root, RootItem};
use btrfs_fsck::check::{run_checks, Stats};
use btrfs_fsck::extent_tree::{hash_extent_data_ref, inc_extent_ref};
use btrfs_fsck::format::*;
use btrfs_fsck::structures::*;
use btrfs_fsck::transaction::{commit_transaction, start_transaction, TransHandle};
use btrfs_fsck::tree::{insert_item, search_slot, Path};

use std::rc::Rc;

const ROOT_DIR: u64 = BTRFS_FIRST_FREE_OBJECTID;

fn check_clean(fs: &FsInfo) -> u64 {
    let mut stats = Stats::default();
    run_checks(fs, false, &mut stats).unwrap()
}

fn bump_dir_size(fs: &FsInfo, trans: &TransHandle, root: &Rc<Root>, dir: u64, delta: u64) {
    let mut path = Path::new();
    let key = Key::new(dir, BTRFS_INODE_ITEM_KEY, 0);
    let found = search_slot(Some(trans), fs, root, &key, &mut path, 0, true).unwrap();
    assert!(found);
    let leaf = path.leaf();
    let ptr = leaf.item_ptr_offset(path.slots[0]);
    let size = leaf.read_u64(ptr + 16);
    leaf.write_u64(ptr + 16, size + delta);
    leaf.mark_dirty();
}

struct FileExtent {
    file_off: u64,
    disk_bytenr: u64,
    num_bytes: u64,
}

#[allow(clippy::too_many_arguments)]
fn add_file(
    fs: &FsInfo,
    trans: &TransHandle,
    fs_root: &Rc<Root>,
    ino: u64,
    name: &[u8],
    index: u64,
    isize: u64,
    extents: &[FileExtent],
    with_csums: bool,
) {
    let nbytes: u64 = extents.iter().map(|e| e.num_bytes).sum();
    let flags = if with_csums { 0 } else { BTRFS_INODE_NODATASUM };
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ino, BTRFS_INODE_ITEM_KEY, 0),
        &inode_item_bytes(S_IFREG | 0o644, 1, isize, nbytes, flags),
    )
    .unwrap();
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ino, BTRFS_INODE_REF_KEY, ROOT_DIR),
        &inode_ref_bytes(index, name),
    )
    .unwrap();

    let location = Key::new(ino, BTRFS_INODE_ITEM_KEY, 0);
    let entry = dir_item_bytes(&location, BTRFS_FT_REG_FILE, name);
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_ITEM_KEY, index),
        &entry,
    )
    .unwrap();
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_INDEX_KEY, index),
        &entry,
    )
    .unwrap();
    bump_dir_size(fs, trans, fs_root, ROOT_DIR, 2 * name.len() as u64);

    let extent_root = fs.extent_root();
    let csum_root = fs.csum_root();
    for e in extents {
        insert_item(
            trans,
            fs,
            fs_root,
            &Key::new(ino, BTRFS_EXTENT_DATA_KEY, e.file_off),
            &file_extent_bytes(
                BTRFS_FILE_EXTENT_REG,
                e.disk_bytenr,
                e.num_bytes,
                0,
                e.num_bytes,
                e.num_bytes,
            ),
        )
        .unwrap();
        insert_item(
            trans,
            fs,
            &extent_root,
            &Key::new(e.disk_bytenr, BTRFS_EXTENT_ITEM_KEY, e.num_bytes),
            &extent_item_bytes(1, BTRFS_EXTENT_FLAG_DATA),
        )
        .unwrap();
        insert_item(
            trans,
            fs,
            &extent_root,
            &Key::new(
                e.disk_bytenr,
                BTRFS_EXTENT_DATA_REF_KEY,
                hash_extent_data_ref(fs_root.objectid, ino, e.file_off),
            ),
            &extent_data_ref_bytes(fs_root.objectid, ino, e.file_off, 1),
        )
        .unwrap();
        if with_csums {
            let sectors = (e.num_bytes / fs.sectorsize as u64) as usize;
            insert_item(
                trans,
                fs,
                &csum_root,
                &Key::new(BTRFS_EXTENT_CSUM_OBJECTID, BTRFS_EXTENT_CSUM_KEY, e.disk_bytenr),
                &vec![0xAA_u8; 4 * sectors],
            )
            .unwrap();
        }
    }
}

fn add_subdir(fs: &FsInfo, trans: &TransHandle, fs_root: &Rc<Root>, ino: u64, name: &[u8], index: u64) {
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ino, BTRFS_INODE_ITEM_KEY, 0),
        &inode_item_bytes(S_IFDIR | 0o755, 1, 0, 0, 0),
    )
    .unwrap();
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ino, BTRFS_INODE_REF_KEY, ROOT_DIR),
        &inode_ref_bytes(index, name),
    )
    .unwrap();
    let location = Key::new(ino, BTRFS_INODE_ITEM_KEY, 0);
    let entry = dir_item_bytes(&location, BTRFS_FT_DIR, name);
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_ITEM_KEY, index),
        &entry,
    )
    .unwrap();
    insert_item(
        trans,
        fs,
        fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_INDEX_KEY, index),
        &entry,
    )
    .unwrap();
    bump_dir_size(fs, trans, fs_root, ROOT_DIR, 2 * name.len() as u64);
}

/* a data address comfortably past the metadata blocks */
const DATA_AT: u64 = 4 * 1024 * 1024;

#[test]
fn clean_filesystem_checks_out() {
    let fs = make_test_fs();
    assert_eq!(check_clean(&fs), 0);
}

#[test]
fn clean_filesystem_with_file_and_directory() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    /* one empty regular file and one directory */
    add_file(&fs, &trans, &fs_root, 257, b"empty", 2, 0, &[], true);
    add_subdir(&fs, &trans, &fs_root, 258, b"d", 3);
    commit_transaction(&fs, &trans).unwrap();

    assert_eq!(check_clean(&fs), 0);
}

#[test]
fn missing_orphan_item_is_reported() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    /* unlinked inode without the orphan marker */
    insert_item(
        &trans,
        &fs,
        &fs_root,
        &Key::new(259, BTRFS_INODE_ITEM_KEY, 0),
        &inode_item_bytes(S_IFREG | 0o644, 0, 0, 0, BTRFS_INODE_NODATASUM),
    )
    .unwrap();
    commit_transaction(&fs, &trans).unwrap();

    assert!(check_clean(&fs) > 0);
}

#[test]
fn orphan_item_excuses_unlinked_inode() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    insert_item(
        &trans,
        &fs,
        &fs_root,
        &Key::new(259, BTRFS_INODE_ITEM_KEY, 0),
        &inode_item_bytes(S_IFREG | 0o644, 0, 0, 0, BTRFS_INODE_NODATASUM),
    )
    .unwrap();
    insert_item(
        &trans,
        &fs,
        &fs_root,
        &Key::new(BTRFS_ORPHAN_OBJECTID, BTRFS_ORPHAN_ITEM_KEY, 259),
        &[],
    )
    .unwrap();
    commit_transaction(&fs, &trans).unwrap();

    assert_eq!(check_clean(&fs), 0);
}

#[test]
fn duplicate_dir_index_entries_are_reported() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    add_file(&fs, &trans, &fs_root, 260, b"x", 2, 0, &[], true);

    /* a second index entry for the same name packed into one item */
    let location = Key::new(260, BTRFS_INODE_ITEM_KEY, 0);
    let mut doubled = dir_item_bytes(&location, BTRFS_FT_REG_FILE, b"x");
    doubled.extend_from_slice(&dir_item_bytes(&location, BTRFS_FT_REG_FILE, b"x"));
    insert_item(
        &trans,
        &fs,
        &fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_INDEX_KEY, 99),
        &doubled,
    )
    .unwrap();
    bump_dir_size(&fs, &trans, &fs_root, ROOT_DIR, 2);
    commit_transaction(&fs, &trans).unwrap();

    assert!(check_clean(&fs) > 0);
}

#[test]
fn file_extent_gap_is_reported() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    /* isize says 8k but only [0, 4k) is mapped */
    add_file(
        &fs,
        &trans,
        &fs_root,
        261,
        b"gappy",
        2,
        8192,
        &[FileExtent {
            file_off: 0,
            disk_bytenr: DATA_AT,
            num_bytes: 4096,
        }],
        false,
    );
    commit_transaction(&fs, &trans).unwrap();

    assert!(check_clean(&fs) > 0);
}

#[test]
fn fully_mapped_file_is_clean() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    add_file(
        &fs,
        &trans,
        &fs_root,
        261,
        b"solid",
        2,
        8192,
        &[
            FileExtent {
                file_off: 0,
                disk_bytenr: DATA_AT,
                num_bytes: 4096,
            },
            FileExtent {
                file_off: 4096,
                disk_bytenr: DATA_AT + 4096,
                num_bytes: 4096,
            },
        ],
        true,
    );
    commit_transaction(&fs, &trans).unwrap();

    assert_eq!(check_clean(&fs), 0);
}

#[test]
fn extent_with_missing_backref_is_reported() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);
    add_file(
        &fs,
        &trans,
        &fs_root,
        262,
        b"f",
        2,
        4096,
        &[FileExtent {
            file_off: 0,
            disk_bytenr: DATA_AT,
            num_bytes: 4096,
        }],
        false,
    );

    /* break the declaration: refs say two but the data ref is gone */
    let extent_root = fs.extent_root();
    let mut path = Path::new();
    let refkey = Key::new(
        DATA_AT,
        BTRFS_EXTENT_DATA_REF_KEY,
        hash_extent_data_ref(fs_root.objectid, 262, 0),
    );
    let found =
        search_slot(Some(&trans), &fs, &extent_root, &refkey, &mut path, -1, true).unwrap();
    assert!(found);
    let slot = path.slots[0];
    btrfs_fsck::tree::del_items(&trans, &fs, &extent_root, &mut path, slot, 1)
        .unwrap();
    path.release();

    let itemkey = Key::new(DATA_AT, BTRFS_EXTENT_ITEM_KEY, 4096);
    let found =
        search_slot(Some(&trans), &fs, &extent_root, &itemkey, &mut path, 0, true).unwrap();
    assert!(found);
    let leaf = path.leaf();
    leaf.write_u64(leaf.item_ptr_offset(path.slots[0]), 2);
    leaf.mark_dirty();
    path.release();
    commit_transaction(&fs, &trans).unwrap();

    assert!(check_clean(&fs) > 0);
}

#[test]
fn shared_snapshot_block_accounts_once() {
    let fs = make_test_fs();
    let fs_root = test_fs_root(&fs);
    let trans = start_transaction(&fs);

    add_file(
        &fs,
        &trans,
        &fs_root,
        263,
        b"data",
        2,
        4096,
        &[FileExtent {
            file_off: 0,
            disk_bytenr: DATA_AT,
            num_bytes: 4096,
        }],
        true,
    );

    /* snapshot entry in the parent subvolume, then share the root block */
    let snap_id = 300_u64;
    let location = Key::new(snap_id, BTRFS_ROOT_ITEM_KEY, u64::MAX);
    let entry = dir_item_bytes(&location, BTRFS_FT_DIR, b"snap");
    insert_item(
        &trans,
        &fs,
        &fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_ITEM_KEY, 5),
        &entry,
    )
    .unwrap();
    insert_item(
        &trans,
        &fs,
        &fs_root,
        &Key::new(ROOT_DIR, BTRFS_DIR_INDEX_KEY, 5),
        &entry,
    )
    .unwrap();
    bump_dir_size(&fs, &trans, &fs_root, ROOT_DIR, 8);

    /* nothing below may touch the shared tree again */
    let shared = fs_root.node();
    inc_extent_ref(
        &trans,
        &fs,
        shared.start,
        fs.nodesize as u64,
        0,
        snap_id,
        0,
        0,
    )
    .unwrap();

    let tree_root = fs.tree_root();
    let ri = RootItem {
        generation: trans.transid,
        root_dirid: ROOT_DIR,
        bytenr: shared.start,
        refs: 1,
        level: shared.level(),
        ..Default::default()
    };
    insert_item(
        &trans,
        &fs,
        &tree_root,
        &Key::new(snap_id, BTRFS_ROOT_ITEM_KEY, 0),
        &root_item_to_bytes(&ri),
    )
    .unwrap();
    insert_item(
        &trans,
        &fs,
        &tree_root,
        &Key::new(BTRFS_FS_TREE_OBJECTID, BTRFS_ROOT_REF_KEY, snap_id),
        &root_ref_bytes(ROOT_DIR, 5, b"snap"),
    )
    .unwrap();
    insert_item(
        &trans,
        &fs,
        &tree_root,
        &Key::new(snap_id, BTRFS_ROOT_BACKREF_KEY, BTRFS_FS_TREE_OBJECTID),
        &root_ref_bytes(ROOT_DIR, 5, b"snap"),
    )
    .unwrap();
    commit_transaction(&fs, &trans).unwrap();

    /* two tree refs, one per root; no mismatch anywhere */
    assert_eq!(check_clean(&fs), 0);
}
