use crate::block_io::DeviceStore;
use crate::btrfs::{
    ChunkInfo, ChunkStripe, DeviceInfo, FsInfo, Root, RootItem,
};
use crate::cache_tree::CacheTree;
use crate::disk_io::{alloc_tree_block_buffer, write_dirty_blocks, write_super};
use crate::error::Result;
use crate::extent_buffer::EbRef;
use crate::extent_tree::{alloc_free_block, ensure_block_groups, pin_extent};
use crate::structures::*;
use crate::transaction::TransHandle;
use crate::tree::{insert_item, next_leaf, search_slot, Path};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Root reinitialisation for --init-csum-tree / --init-extent-tree, and
/// the minimal in-memory image the test suite builds filesystems from.

/// throw the tree's contents away and point its root at a fresh empty
/// leaf
pub fn fsck_reinit_root(trans: &TransHandle, fs: &FsInfo, root: &Rc<Root>) -> Result<()> {
    let c = alloc_free_block(trans, fs, root.objectid, 0, 0)?;
    c.memset(0, BTRFS_HEADER_SIZE);
    c.set_level(0);
    c.set_header_bytenr(c.start);
    c.set_header_generation(trans.transid);
    c.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
    c.set_header_owner(root.objectid);
    c.set_header_fsid(&fs.fsid);
    c.set_header_chunk_tree_uuid(&fs.chunk_tree_uuid.get());
    c.mark_dirty();

    *root.node.borrow_mut() = c;
    {
        let mut ri = root.root_item.borrow_mut();
        ri.level = 0;
        ri.generation = trans.transid;
    }
    fs.mark_root_dirty(root);
    Ok(())
}

/// wipe the extent tree and seed it with empty block group items; the
/// subsequent repair scan recreates every extent record from the trees
/// that reference them
pub fn reinit_extent_tree(trans: &TransHandle, fs: &FsInfo) -> Result<()> {
    ensure_block_groups(fs)?;
    let extent_root = fs.extent_root();

    /* nothing the old tree declared may be handed out while rebuilding */
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
        let found = leaf.item_key(path.slots[0]);
        match found.item_type {
            BTRFS_EXTENT_ITEM_KEY => pin_extent(fs, found.objectid, found.offset),
            BTRFS_METADATA_ITEM_KEY => {
                pin_extent(fs, found.objectid, fs.nodesize as u64)
            }
            _ => {}
        }
        path.slots[0] += 1;
    }
    path.release();

    fsck_reinit_root(trans, fs, &extent_root)?;

    let groups: Vec<(u64, u64, u64)> = fs
        .block_groups
        .borrow()
        .iter()
        .map(|(start, len, rec)| {
            rec.used.set(0);
            (start, len, rec.flags)
        })
        .collect();
    for (start, len, flags) in groups {
        let key = Key::new(start, BTRFS_BLOCK_GROUP_ITEM_KEY, len);
        let mut data = [0_u8; 24];
        data[8..16].copy_from_slice(&BTRFS_FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
        data[16..24].copy_from_slice(&flags.to_le_bytes());
        insert_item(trans, fs, &extent_root, &key, &data)?;
    }
    Ok(())
}

/*
 * minimal image builder
 */

pub const TEST_NODESIZE: u32 = 4096;
const TEST_TOTAL_BYTES: u64 = 16 * 1024 * 1024;
const BG_START: u64 = 1024 * 1024;

const MIXED_BG_FLAGS: u64 =
    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_SYSTEM;

/// append one item to a leaf under construction; keys must arrive in
/// ascending order
pub fn append_leaf_item(eb: &EbRef, key: &Key, data: &[u8]) {
    let slot = eb.nritems() as usize;
    let data_end = if slot == 0 {
        eb.len() - BTRFS_HEADER_SIZE as u32
    } else {
        assert!(eb.item_key(slot - 1) < *key, "appended key out of order");
        eb.item_offset(slot - 1)
    };
    let offset = data_end - data.len() as u32;
    eb.set_item_key(slot, key);
    eb.set_item_offset(slot, offset);
    eb.set_item_size(slot, data.len() as u32);
    eb.write_bytes(BTRFS_HEADER_SIZE + offset as usize, data);
    eb.set_nritems(slot as u32 + 1);
    eb.mark_dirty();
}

pub fn inode_item_bytes(mode: u32, nlink: u32, size: u64, nbytes: u64, flags: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; std::mem::size_of::<btrfs_inode_item>()];
    buf[0..8].copy_from_slice(&1_u64.to_le_bytes()); // generation
    buf[16..24].copy_from_slice(&size.to_le_bytes());
    buf[24..32].copy_from_slice(&nbytes.to_le_bytes());
    buf[40..44].copy_from_slice(&nlink.to_le_bytes());
    buf[52..56].copy_from_slice(&mode.to_le_bytes());
    buf[64..72].copy_from_slice(&flags.to_le_bytes());
    buf
}

pub fn inode_ref_bytes(index: u64, name: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + name.len());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name);
    buf
}

pub fn dir_item_bytes(location: &Key, filetype: u8, name: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(30 + name.len());
    buf.extend_from_slice(&location.to_disk_bytes());
    buf.extend_from_slice(&1_u64.to_le_bytes()); // transid
    buf.extend_from_slice(&0_u16.to_le_bytes()); // data_len
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.push(filetype);
    buf.extend_from_slice(name);
    buf
}

#[allow(clippy::too_many_arguments)]
pub fn file_extent_bytes(
    extent_type: u8,
    disk_bytenr: u64,
    disk_num_bytes: u64,
    offset: u64,
    num_bytes: u64,
    ram_bytes: u64,
) -> Vec<u8> {
    let mut buf = vec![0_u8; std::mem::size_of::<btrfs_file_extent_item>()];
    buf[0..8].copy_from_slice(&1_u64.to_le_bytes()); // generation
    buf[8..16].copy_from_slice(&ram_bytes.to_le_bytes());
    buf[20] = extent_type;
    buf[21..29].copy_from_slice(&disk_bytenr.to_le_bytes());
    buf[29..37].copy_from_slice(&disk_num_bytes.to_le_bytes());
    buf[37..45].copy_from_slice(&offset.to_le_bytes());
    buf[45..53].copy_from_slice(&num_bytes.to_le_bytes());
    buf
}

pub fn extent_item_bytes(refs: u64, flags: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; 24];
    buf[0..8].copy_from_slice(&refs.to_le_bytes());
    buf[8..16].copy_from_slice(&1_u64.to_le_bytes()); // generation
    buf[16..24].copy_from_slice(&flags.to_le_bytes());
    buf
}

pub fn extent_data_ref_bytes(root: u64, objectid: u64, offset: u64, count: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(&root.to_le_bytes());
    buf.extend_from_slice(&objectid.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    buf
}

pub fn root_ref_bytes(dirid: u64, sequence: u64, name: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + name.len());
    buf.extend_from_slice(&dirid.to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name);
    buf
}

fn start_leaf(fs: &FsInfo, bytenr: u64, owner: u64) -> EbRef {
    let eb = alloc_tree_block_buffer(fs, bytenr);
    eb.set_header_bytenr(bytenr);
    eb.set_header_generation(1);
    eb.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
    eb.set_header_owner(owner);
    eb.set_header_fsid(&fs.fsid);
    eb.set_level(0);
    eb.set_header_flag(BTRFS_HEADER_FLAG_WRITTEN);
    eb.mark_dirty();
    eb
}

fn build_super(fsid: BtrfsFsid, dev_uuid: BtrfsUuid) -> btrfs_super_block {
    let mut sb: btrfs_super_block = unsafe { std::mem::zeroed() };
    sb.fsid = fsid;
    sb.bytenr = BTRFS_SUPER_INFO_OFFSET as u64;
    sb.magic = BTRFS_MAGIC;
    sb.generation = 1;
    sb.total_bytes = TEST_TOTAL_BYTES;
    sb.root_dir_object_id = BTRFS_ROOT_TREE_DIR_OBJECTID;
    sb.num_devices = 1;
    sb.sectorsize = TEST_NODESIZE;
    sb.nodesize = TEST_NODESIZE;
    sb.stripesize = TEST_NODESIZE;
    sb.csum_type = BtrfsCsumType::CRC32;
    sb.dev_item.devid = 1;
    sb.dev_item.total_bytes = TEST_TOTAL_BYTES;
    sb.dev_item.sector_size = TEST_NODESIZE;
    sb.dev_item.uuid = dev_uuid;
    sb.dev_item.fsid = fsid;

    /* one identity chunk covering the whole device */
    let mut cursor = 0;
    let key = Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0);
    sb.sys_chunk_array[cursor..cursor + 17].copy_from_slice(&key.to_disk_bytes());
    cursor += 17;
    sb.sys_chunk_array[cursor..cursor + 48].copy_from_slice(&chunk_bytes());
    cursor += 48;
    sb.sys_chunk_array[cursor..cursor + 32].copy_from_slice(&stripe_bytes(dev_uuid));
    cursor += 32;
    sb.sys_chunk_array_size = cursor as u32;
    sb
}

fn chunk_bytes() -> [u8; 48] {
    let mut buf = [0_u8; 48];
    buf[0..8].copy_from_slice(&TEST_TOTAL_BYTES.to_le_bytes());
    buf[8..16].copy_from_slice(&BTRFS_EXTENT_TREE_OBJECTID.to_le_bytes());
    buf[16..24].copy_from_slice(&(65536_u64).to_le_bytes()); // stripe_len
    buf[24..32].copy_from_slice(&MIXED_BG_FLAGS.to_le_bytes());
    buf[44..46].copy_from_slice(&1_u16.to_le_bytes()); // num_stripes
    buf
}

fn stripe_bytes(dev_uuid: BtrfsUuid) -> [u8; 32] {
    let mut buf = [0_u8; 32];
    buf[0..8].copy_from_slice(&1_u64.to_le_bytes()); // devid
    buf[16..32].copy_from_slice(&dev_uuid);
    buf
}

fn dev_item_bytes(dev_uuid: BtrfsUuid, fsid: BtrfsFsid) -> Vec<u8> {
    let mut buf = vec![0_u8; std::mem::size_of::<btrfs_dev_item>()];
    buf[0..8].copy_from_slice(&1_u64.to_le_bytes()); // devid
    buf[8..16].copy_from_slice(&TEST_TOTAL_BYTES.to_le_bytes());
    buf[32..36].copy_from_slice(&TEST_NODESIZE.to_le_bytes()); // sector_size
    buf[66..82].copy_from_slice(&dev_uuid);
    buf[82..98].copy_from_slice(&fsid);
    buf
}

/// a freshly formatted single-device filesystem living in memory: one
/// subvolume holding just its root directory. Everything the test suite
/// checks or corrupts starts from this.
pub fn make_test_fs() -> FsInfo {
    let fsid: BtrfsFsid = [0x42; BTRFS_FSID_SIZE];
    let dev_uuid: BtrfsUuid = [0x24; BTRFS_UUID_SIZE];
    let sb = build_super(fsid, dev_uuid);

    let dev = Rc::new(DeviceInfo {
        path: None,
        store: DeviceStore::memory(TEST_TOTAL_BYTES as usize),
        devid: 1,
        dev_uuid,
    });
    let mut devid_map = HashMap::new();
    devid_map.insert(1, dev.clone());
    let mut devuuid_map = HashMap::new();
    devuuid_map.insert(dev_uuid, dev);

    let mut chunks = CacheTree::new();
    chunks
        .insert(
            0,
            TEST_TOTAL_BYTES,
            ChunkInfo {
                start: 0,
                length: TEST_TOTAL_BYTES,
                owner: BTRFS_EXTENT_TREE_OBJECTID,
                type_flags: MIXED_BG_FLAGS,
                num_stripes: 1,
                sub_stripes: 0,
                stripes: vec![ChunkStripe { devid: 1, offset: 0 }],
            },
        )
        .ok();

    let fs = FsInfo {
        fsid,
        chunk_tree_uuid: Cell::new([0; BTRFS_UUID_SIZE]),
        nodesize: TEST_NODESIZE,
        sectorsize: TEST_NODESIZE,
        csum_type: BtrfsCsumType::CRC32,
        total_bytes: TEST_TOTAL_BYTES,
        num_devices: 1,
        generation: Cell::new(1),
        cache_generation: 0,
        bytes_used: Cell::new(0),
        root_dir_object_id: BTRFS_ROOT_TREE_DIR_OBJECTID,
        sb_bytenr: BTRFS_SUPER_INFO_OFFSET as u64,
        sb: RefCell::new(sb),
        devid_map,
        devuuid_map,
        chunks: RefCell::new(chunks),
        block_cache: RefCell::new(HashMap::new()),
        block_groups: RefCell::new(CacheTree::new()),
        block_groups_loaded: Cell::new(false),
        corrupt_blocks: RefCell::new(CacheTree::new()),
        pinned: RefCell::new(CacheTree::new()),
        trans_allocated: RefCell::new(CacheTree::new()),
        free_extent_log: RefCell::new(Vec::new()),
        record_extent_removals: Cell::new(false),
        dirty_roots: RefCell::new(Vec::new()),
        tree_root: RefCell::new(None),
        extent_root: RefCell::new(None),
        chunk_root: RefCell::new(None),
        csum_root: RefCell::new(None),
    };

    let tree_root_addr = BG_START;
    let extent_root_addr = BG_START + TEST_NODESIZE as u64;
    let chunk_root_addr = BG_START + 2 * TEST_NODESIZE as u64;
    let csum_root_addr = BG_START + 3 * TEST_NODESIZE as u64;
    let fs_root_addr = BG_START + 4 * TEST_NODESIZE as u64;
    let bg_len = TEST_TOTAL_BYTES - BG_START;

    /* tree of trees */
    let tree_root = start_leaf(&fs, tree_root_addr, BTRFS_ROOT_TREE_OBJECTID);
    let mk_root_item = |bytenr: u64, root_dirid: u64| RootItem {
        generation: 1,
        root_dirid,
        bytenr,
        refs: 1,
        level: 0,
        ..Default::default()
    };
    for (objectid, bytenr, dirid) in [
        (BTRFS_EXTENT_TREE_OBJECTID, extent_root_addr, 0),
        (BTRFS_FS_TREE_OBJECTID, fs_root_addr, BTRFS_FIRST_FREE_OBJECTID),
        (BTRFS_CSUM_TREE_OBJECTID, csum_root_addr, 0),
    ] {
        append_leaf_item(
            &tree_root,
            &Key::new(objectid, BTRFS_ROOT_ITEM_KEY, 0),
            &crate::btrfs::root_item_to_bytes(&mk_root_item(bytenr, dirid)),
        );
    }

    /* extent tree: one metadata item + owner backref per tree block,
     * plus the single mixed block group */
    let extent_root = start_leaf(&fs, extent_root_addr, BTRFS_EXTENT_TREE_OBJECTID);
    let blocks = [
        (tree_root_addr, BTRFS_ROOT_TREE_OBJECTID),
        (extent_root_addr, BTRFS_EXTENT_TREE_OBJECTID),
        (chunk_root_addr, BTRFS_CHUNK_TREE_OBJECTID),
        (csum_root_addr, BTRFS_CSUM_TREE_OBJECTID),
        (fs_root_addr, BTRFS_FS_TREE_OBJECTID),
    ];
    for (i, (addr, owner)) in blocks.iter().enumerate() {
        append_leaf_item(
            &extent_root,
            &Key::new(*addr, BTRFS_METADATA_ITEM_KEY, 0),
            &extent_item_bytes(1, BTRFS_EXTENT_FLAG_TREE_BLOCK),
        );
        append_leaf_item(
            &extent_root,
            &Key::new(*addr, BTRFS_TREE_BLOCK_REF_KEY, *owner),
            &[],
        );
        if i == 0 {
            /* the block group shares its objectid with the first block */
            let mut bg = [0_u8; 24];
            bg[0..8].copy_from_slice(&(blocks.len() as u64 * TEST_NODESIZE as u64).to_le_bytes());
            bg[8..16].copy_from_slice(&BTRFS_FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
            bg[16..24].copy_from_slice(&MIXED_BG_FLAGS.to_le_bytes());
            append_leaf_item(
                &extent_root,
                &Key::new(BG_START, BTRFS_BLOCK_GROUP_ITEM_KEY, bg_len),
                &bg,
            );
        }
    }

    /* chunk tree */
    let chunk_root = start_leaf(&fs, chunk_root_addr, BTRFS_CHUNK_TREE_OBJECTID);
    append_leaf_item(
        &chunk_root,
        &Key::new(1, BTRFS_DEV_ITEM_KEY, 1),
        &dev_item_bytes(dev_uuid, fsid),
    );
    let mut chunk_item = Vec::with_capacity(80);
    chunk_item.extend_from_slice(&chunk_bytes());
    chunk_item.extend_from_slice(&stripe_bytes(dev_uuid));
    append_leaf_item(
        &chunk_root,
        &Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0),
        &chunk_item,
    );

    /* empty checksum tree */
    let csum_root = start_leaf(&fs, csum_root_addr, BTRFS_CSUM_TREE_OBJECTID);

    /* default subvolume: just the root directory */
    let fs_root = start_leaf(&fs, fs_root_addr, BTRFS_FS_TREE_OBJECTID);
    append_leaf_item(
        &fs_root,
        &Key::new(BTRFS_FIRST_FREE_OBJECTID, BTRFS_INODE_ITEM_KEY, 0),
        &inode_item_bytes(S_IFDIR | 0o755, 1, 0, 0, 0),
    );
    append_leaf_item(
        &fs_root,
        &Key::new(
            BTRFS_FIRST_FREE_OBJECTID,
            BTRFS_INODE_REF_KEY,
            BTRFS_FIRST_FREE_OBJECTID,
        ),
        &inode_ref_bytes(0, b".."),
    );

    *fs.tree_root.borrow_mut() = Some(Root::new(
        BTRFS_ROOT_TREE_OBJECTID,
        tree_root,
        mk_root_item(tree_root_addr, 0),
    ));
    *fs.extent_root.borrow_mut() = Some(Root::new(
        BTRFS_EXTENT_TREE_OBJECTID,
        extent_root,
        mk_root_item(extent_root_addr, 0),
    ));
    *fs.chunk_root.borrow_mut() = Some(Root::new(
        BTRFS_CHUNK_TREE_OBJECTID,
        chunk_root,
        mk_root_item(chunk_root_addr, 0),
    ));
    *fs.csum_root.borrow_mut() = Some(Root::new(
        BTRFS_CSUM_TREE_OBJECTID,
        csum_root,
        mk_root_item(csum_root_addr, 0),
    ));
    fs.bytes_used
        .set(blocks.len() as u64 * TEST_NODESIZE as u64);
    write_dirty_blocks(&fs).expect("flushing fresh image");
    write_super(&fs).expect("writing fresh superblock");
    fs
}

/// the default subvolume of a test image, read back through the tree of
/// trees like any other consumer would
pub fn test_fs_root(fs: &FsInfo) -> Rc<Root> {
    crate::btrfs::read_root(fs, BTRFS_FS_TREE_OBJECTID).expect("test image has a fs tree")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::leaf_free_space;

    #[test]
    fn fresh_image_has_sane_leaves() {
        let fs = make_test_fs();
        let tree_root = fs.tree_root();
        let node = tree_root.node();
        assert_eq!(node.nritems(), 3);
        assert!(leaf_free_space(&fs, &node) >= 0);
        crate::tree::check_leaf(&fs, None, &node).unwrap();

        let fs_root = test_fs_root(&fs);
        assert_eq!(fs_root.root_item.borrow().root_dirid, BTRFS_FIRST_FREE_OBJECTID);
        crate::tree::check_leaf(&fs, None, &fs_root.node()).unwrap();
    }

    #[test]
    fn fresh_image_survives_reread() {
        let fs = make_test_fs();
        fs.block_cache.borrow_mut().clear();
        let node = crate::disk_io::read_tree_block(&fs, BG_START).unwrap();
        assert_eq!(node.header_owner(), BTRFS_ROOT_TREE_OBJECTID);
        assert_eq!(node.nritems(), 3);
    }
}
