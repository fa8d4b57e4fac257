use crate::block_io::DeviceStore;
use crate::cache_tree::CacheTree;
use crate::error::{FsckError, Result as FsckResult};
use crate::extent_buffer::EbRef;
use crate::structures::*;

use anyhow::{anyhow, ensure, Result};
use crc::{Crc, CRC_32_ISCSI};
use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{BufRead, Cursor, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// btrfsprogs does quite a lot of work when opening a btrfs filesystem.
/// It uses libblkid to scan devices and identify those that are part of
/// the same filesystem then performs a lot of checks on the validity of
/// the superblock.
///
/// This programme does none of this, requiring the user to provide the
/// list of devices, and verifying only magic and checksum before use.

pub fn load_sb(store: &DeviceStore, sb_bytenr: u64) -> Result<btrfs_super_block> {
    union SbBuf {
        buf: [u8; BTRFS_SUPER_INFO_SIZE],
        block: btrfs_super_block,
    }

    let mut sb: SbBuf = SbBuf {
        buf: [0_u8; BTRFS_SUPER_INFO_SIZE],
    };

    let sb = unsafe {
        store.read_at(sb_bytenr, &mut sb.buf)?;
        if sb.block.magic != BTRFS_MAGIC {
            return Err(anyhow!("invalid magic in superblock"));
        }
        if csum_data(&sb.buf[BTRFS_CSUM_SIZE..], sb.block.csum_type) != sb.block.csum {
            return Err(anyhow!("invalid checksum in superblock"));
        }
        sb.block
    };
    Ok(sb)
}

pub fn sb_to_bytes(sb: &btrfs_super_block) -> [u8; BTRFS_SUPER_INFO_SIZE] {
    unsafe { std::mem::transmute::<btrfs_super_block, [u8; BTRFS_SUPER_INFO_SIZE]>(*sb) }
}

/* the checksums range from 4-32 bytes depending on the algorithm in use. For simplicity we'll always return a 32 byte buffer, but this could be improved upon */
pub fn csum_data(buf: &[u8], csum_type: BtrfsCsumType) -> BtrfsCsum {
    match csum_type {
        BtrfsCsumType::CRC32 => csum_data_crc32(buf),
        _ => panic!("only crc32 checksums are implemented - could be a small project for you?"),
    }
}

fn csum_data_crc32(buf: &[u8]) -> [u8; BTRFS_CSUM_SIZE] {
    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    let cs = CASTAGNOLI.checksum(buf).to_le_bytes();
    ret[..cs.len()].copy_from_slice(&cs[..]);
    ret
}

pub fn uuid_str(uuid: &BtrfsUuid) -> String {
    std::format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkStripe {
    pub devid: u64,
    pub offset: u64,
}

/// CPU-side view of one chunk mapping: logical [start, start + length)
/// lands at stripe.offset on each listed device (mirrored profiles; the
/// striped raid profiles are not supported here)
#[derive(Clone, Debug)]
pub struct ChunkInfo {
    pub start: u64,
    pub length: u64,
    pub owner: u64,
    pub type_flags: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<ChunkStripe>,
}

/// sys_chunk_array has members with inconsistent lengths. Each member is
/// a btrfs_disk_key followed by a btrfs_chunk followed by
/// btrfs_chunk.num_stripes btrfs_stripes.
pub struct SysChunkIter<'a> {
    cursor: Cursor<&'a [u8]>,
    size: u64,
}

impl SysChunkIter<'_> {
    pub fn new(sb: &btrfs_super_block) -> SysChunkIter {
        SysChunkIter {
            cursor: Cursor::<&[u8]>::new(unsafe {
                std::slice::from_raw_parts(
                    sb.sys_chunk_array.as_ptr(),
                    BTRFS_SYSTEM_CHUNK_ARRAY_SIZE,
                )
            }),
            size: sb.sys_chunk_array_size as u64,
        }
    }
}

impl Iterator for SysChunkIter<'_> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.position() >= self.size {
            return None;
        }

        let mut key_buf = [0_u8; 17];
        self.cursor.read_exact(&mut key_buf).ok()?;
        let key = Key::from_disk_bytes(&key_buf);
        assert_eq!(key.item_type, BTRFS_CHUNK_ITEM_KEY);
        assert_eq!(key.objectid, BTRFS_FIRST_CHUNK_TREE_OBJECTID);

        let mut chunk_buf = [0_u8; std::mem::size_of::<btrfs_chunk>()];
        self.cursor.read_exact(&mut chunk_buf).ok()?;
        let mut ci = parse_chunk(key.offset, &chunk_buf);

        for _ in 0..ci.num_stripes {
            let mut stripe_buf = [0_u8; std::mem::size_of::<btrfs_stripe>()];
            self.cursor.read_exact(&mut stripe_buf).ok()?;
            ci.stripes.push(parse_stripe(&stripe_buf));
        }
        Some(ci)
    }
}

pub fn parse_chunk(logical: u64, buf: &[u8]) -> ChunkInfo {
    ChunkInfo {
        start: logical,
        length: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        owner: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        type_flags: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        num_stripes: u16::from_le_bytes(buf[44..46].try_into().unwrap()),
        sub_stripes: u16::from_le_bytes(buf[46..48].try_into().unwrap()),
        stripes: Vec::new(),
    }
}

pub fn parse_stripe(buf: &[u8]) -> ChunkStripe {
    ChunkStripe {
        devid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
    }
}

pub struct DeviceInfo {
    pub path: Option<PathBuf>,
    pub store: DeviceStore,
    pub devid: LE64,
    pub dev_uuid: BtrfsUuid,
}

/// blocks failing structural validation, keyed by address; the parent key
/// recorded here drives the repair-time prune
#[derive(Clone, Debug)]
pub struct CorruptBlock {
    pub key: Key,
    pub level: u8,
}

/// one reference drop performed by the engine while repairing; the extent
/// reconciler replays these against its in-memory records
#[derive(Clone, Debug)]
pub struct FreeExtentEvent {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub parent: u64,
    pub root_objectid: u64,
    pub owner: u64,
    pub offset: u64,
    pub refs_to_drop: u32,
}

/// CPU-side root item; only the fields the checker acts on
#[derive(Clone, Copy, Debug, Default)]
pub struct RootItem {
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
}

const ROOT_ITEM_INODE_SIZE: usize = std::mem::size_of::<btrfs_inode_item>();
pub const ROOT_ITEM_SIZE: usize = ROOT_ITEM_INODE_SIZE + 79;

pub fn parse_root_item(buf: &[u8]) -> RootItem {
    let b = ROOT_ITEM_INODE_SIZE;
    let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
    RootItem {
        generation: u64_at(b),
        root_dirid: u64_at(b + 8),
        bytenr: u64_at(b + 16),
        bytes_used: u64_at(b + 32),
        last_snapshot: u64_at(b + 40),
        flags: u64_at(b + 48),
        refs: u32::from_le_bytes(buf[b + 56..b + 60].try_into().unwrap()),
        drop_progress: Key::from_disk_bytes(&buf[b + 60..b + 77]),
        drop_level: buf[b + 77],
        level: buf[b + 78],
    }
}

/// serialise in the short pre-v2 layout; the embedded inode item is left
/// zeroed apart from a link count of 1
pub fn root_item_to_bytes(ri: &RootItem) -> Vec<u8> {
    let mut buf = vec![0_u8; ROOT_ITEM_SIZE];
    buf[20..24].copy_from_slice(&1_u32.to_le_bytes()); // inode.nlink
    let b = ROOT_ITEM_INODE_SIZE;
    buf[b..b + 8].copy_from_slice(&ri.generation.to_le_bytes());
    buf[b + 8..b + 16].copy_from_slice(&ri.root_dirid.to_le_bytes());
    buf[b + 16..b + 24].copy_from_slice(&ri.bytenr.to_le_bytes());
    buf[b + 32..b + 40].copy_from_slice(&ri.bytes_used.to_le_bytes());
    buf[b + 40..b + 48].copy_from_slice(&ri.last_snapshot.to_le_bytes());
    buf[b + 48..b + 56].copy_from_slice(&ri.flags.to_le_bytes());
    buf[b + 56..b + 60].copy_from_slice(&ri.refs.to_le_bytes());
    buf[b + 60..b + 77].copy_from_slice(&ri.drop_progress.to_disk_bytes());
    buf[b + 77] = ri.drop_level;
    buf[b + 78] = ri.level;
    buf
}

/// One tree. The node handle is replaced wholesale when the root block is
/// COWed or the tree grows/shrinks a level.
pub struct Root {
    pub objectid: u64,
    pub node: RefCell<EbRef>,
    pub root_item: RefCell<RootItem>,
    /// reference counted tree (fs trees and their snapshots)
    pub ref_cows: bool,
}

impl Root {
    pub fn new(objectid: u64, node: EbRef, root_item: RootItem) -> Rc<Root> {
        let ref_cows = is_fs_root_objectid(objectid);
        Rc::new(Root {
            objectid,
            node: RefCell::new(node),
            root_item: RefCell::new(root_item),
            ref_cows,
        })
    }

    pub fn node(&self) -> EbRef {
        self.node.borrow().clone()
    }

    pub fn refs(&self) -> u32 {
        self.root_item.borrow().refs
    }
}

/// processed info about the filesystem
pub struct FsInfo {
    pub fsid: BtrfsFsid,
    pub chunk_tree_uuid: Cell<BtrfsUuid>,
    pub nodesize: u32,
    pub sectorsize: u32,
    pub csum_type: BtrfsCsumType,
    pub total_bytes: u64,
    pub num_devices: u64,
    /// generation of the loaded superblock; a transaction runs at +1
    pub generation: Cell<u64>,
    pub cache_generation: u64,
    pub bytes_used: Cell<u64>,
    pub root_dir_object_id: u64,
    pub sb_bytenr: u64,
    pub sb: RefCell<btrfs_super_block>,

    pub devid_map: HashMap<LE64, Rc<DeviceInfo>>,
    pub devuuid_map: HashMap<BtrfsUuid, Rc<DeviceInfo>>,
    pub chunks: RefCell<CacheTree<ChunkInfo>>,

    pub block_cache: RefCell<HashMap<u64, EbRef>>,
    pub block_groups: RefCell<CacheTree<crate::extent_tree::BlockGroupRec>>,
    pub block_groups_loaded: Cell<bool>,
    pub corrupt_blocks: RefCell<CacheTree<CorruptBlock>>,
    pub pinned: RefCell<CacheTree<()>>,
    /// blocks handed out by the allocator inside the running transaction
    pub trans_allocated: RefCell<CacheTree<()>>,
    /// reference drops logged for the extent reconciler during repair
    pub free_extent_log: RefCell<Vec<FreeExtentEvent>>,
    pub record_extent_removals: Cell<bool>,

    pub dirty_roots: RefCell<Vec<Rc<Root>>>,
    pub tree_root: RefCell<Option<Rc<Root>>>,
    pub extent_root: RefCell<Option<Rc<Root>>>,
    pub chunk_root: RefCell<Option<Rc<Root>>>,
    pub csum_root: RefCell<Option<Rc<Root>>>,
}

impl FsInfo {
    pub fn tree_root(&self) -> Rc<Root> {
        self.tree_root.borrow().as_ref().unwrap().clone()
    }

    pub fn extent_root(&self) -> Rc<Root> {
        self.extent_root.borrow().as_ref().unwrap().clone()
    }

    pub fn chunk_root(&self) -> Rc<Root> {
        self.chunk_root.borrow().as_ref().unwrap().clone()
    }

    pub fn csum_root(&self) -> Rc<Root> {
        self.csum_root.borrow().as_ref().unwrap().clone()
    }

    pub fn add_corrupt_block(&self, key: &Key, start: u64, len: u64, level: u8) {
        let mut corrupt = self.corrupt_blocks.borrow_mut();
        if corrupt.find(start, len).is_none() {
            let _ = corrupt.insert(
                start,
                len,
                CorruptBlock {
                    key: *key,
                    level,
                },
            );
        }
    }

    /// the root's item (or superblock pointer) is rewritten at commit
    pub fn mark_root_dirty(&self, root: &Rc<Root>) {
        let mut dirty = self.dirty_roots.borrow_mut();
        if !dirty.iter().any(|r| r.objectid == root.objectid) {
            dirty.push(root.clone());
        }
    }
}

/// open the devices making up one filesystem; `sb_bytenr` selects a
/// superblock mirror (0 means the primary copy)
pub fn load_fs(paths: &Vec<PathBuf>, sb_bytenr: u64) -> Result<FsInfo> {
    let sb_bytenr = if sb_bytenr == 0 {
        BTRFS_SUPER_INFO_OFFSET as u64
    } else {
        sb_bytenr
    };

    let mut fsid = None;
    let mut devid_map = HashMap::<LE64, Rc<DeviceInfo>>::new();
    let mut devuuid_map = HashMap::<BtrfsUuid, Rc<DeviceInfo>>::new();
    let mut master_sb: Option<btrfs_super_block> = None;
    let mut initial_chunks = Vec::new();
    for path in paths {
        ensure!(
            !check_mounted(path)?,
            "{} is currently mounted. Aborting.",
            path.display()
        );
        let store = DeviceStore::open(path)?;
        let sb = load_sb(&store, sb_bytenr)?;
        match fsid {
            None => fsid = Some(sb.fsid),
            Some(f) => ensure!(sb.fsid == f, "devices belong to different filesystems"),
        };
        assert_eq!(sb.dev_item.fsid, fsid.unwrap());
        if let Some(prev_sb) = master_sb {
            let prev_num_devices = prev_sb.num_devices;
            let num_devices = sb.num_devices;
            assert_eq!(prev_num_devices, num_devices);
        }

        let di = Rc::new(DeviceInfo {
            path: Some(path.clone()),
            store,
            devid: sb.dev_item.devid,
            dev_uuid: sb.dev_item.uuid,
        });
        devid_map.insert(di.devid, Rc::clone(&di));
        devuuid_map.insert(di.dev_uuid, Rc::clone(&di));
        master_sb = Some(sb);
        if initial_chunks.is_empty() {
            for ci in SysChunkIter::new(&sb) {
                initial_chunks.push(ci);
            }
        }
    }
    let sb = master_sb.ok_or_else(|| anyhow!("no devices given"))?;

    let mut chunks = CacheTree::new();
    for ci in initial_chunks {
        debug!("bootstrap chunk {} len {}", ci.start, ci.length);
        let start = ci.start;
        let length = ci.length;
        if chunks.insert(start, length, ci).is_err() {
            debug!("duplicate bootstrap chunk at {start}");
        }
    }

    let fs = FsInfo {
        fsid: fsid.unwrap(),
        chunk_tree_uuid: Cell::new([0; BTRFS_UUID_SIZE]),
        nodesize: sb.nodesize,
        sectorsize: sb.sectorsize,
        csum_type: sb.csum_type,
        total_bytes: sb.total_bytes,
        num_devices: sb.num_devices,
        generation: Cell::new(sb.generation),
        cache_generation: sb.cache_generation,
        bytes_used: Cell::new(sb.bytes_used),
        root_dir_object_id: sb.root_dir_object_id,
        sb_bytenr,
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

    crate::address::read_chunk_tree(&fs)?;
    setup_roots(&fs)?;
    Ok(fs)
}

/// read the permanent roots: chunk and tree roots from the superblock,
/// extent and csum roots through the tree root
pub fn setup_roots(fs: &FsInfo) -> Result<()> {
    let sb_root = fs.sb.borrow().root;
    let sb_chunk_root = fs.sb.borrow().chunk_root;

    let tree_node = crate::disk_io::read_tree_block(fs, sb_root)
        .map_err(|e| anyhow!("cannot read tree root: {e}"))?;
    assert_eq!(tree_node.header_fsid(), fs.fsid);
    fs.chunk_tree_uuid.set(tree_node.header_chunk_tree_uuid());
    let ri = RootItem {
        bytenr: sb_root,
        level: tree_node.level(),
        generation: tree_node.header_generation(),
        refs: 1,
        ..Default::default()
    };
    *fs.tree_root.borrow_mut() = Some(Root::new(BTRFS_ROOT_TREE_OBJECTID, tree_node, ri));

    let chunk_node = crate::disk_io::read_tree_block(fs, sb_chunk_root)
        .map_err(|e| anyhow!("cannot read chunk root: {e}"))?;
    let ri = RootItem {
        bytenr: sb_chunk_root,
        level: chunk_node.level(),
        generation: chunk_node.header_generation(),
        refs: 1,
        ..Default::default()
    };
    *fs.chunk_root.borrow_mut() = Some(Root::new(BTRFS_CHUNK_TREE_OBJECTID, chunk_node, ri));

    let extent_root = read_root(fs, BTRFS_EXTENT_TREE_OBJECTID)
        .map_err(|e| anyhow!("cannot read extent root: {e}"))?;
    *fs.extent_root.borrow_mut() = Some(extent_root);
    let csum_root = read_root(fs, BTRFS_CSUM_TREE_OBJECTID)
        .map_err(|e| anyhow!("cannot read csum root: {e}"))?;
    *fs.csum_root.borrow_mut() = Some(csum_root);
    Ok(())
}

/// look a tree up by root item in the tree of trees
pub fn read_root(fs: &FsInfo, objectid: u64) -> FsckResult<Rc<Root>> {
    let tree_root = fs.tree_root();
    let mut path = crate::tree::Path::new();
    let key = Key::new(objectid, BTRFS_ROOT_ITEM_KEY, u64::MAX);
    let found = crate::tree::search_slot(None, fs, &tree_root, &key, &mut path, 0, false)?;
    if !found {
        // the exact offset is the generation; take the previous item
        if path.slots[0] == 0 {
            if crate::tree::prev_leaf(fs, &tree_root, &mut path)? != 0 {
                return Err(FsckError::Unsupported("missing root item"));
            }
        } else {
            path.slots[0] -= 1;
        }
    }
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    let found_key = leaf.item_key(path.slots[0]);
    if found_key.objectid != objectid || found_key.item_type != BTRFS_ROOT_ITEM_KEY {
        return Err(FsckError::Unsupported("missing root item"));
    }
    let ri = parse_root_item(&leaf.item_data(path.slots[0]));
    let node = crate::disk_io::read_tree_block(fs, ri.bytenr)?;
    Ok(Root::new(objectid, node, ri))
}

/// refuse to operate on devices that are mounted
pub fn check_mounted(path: &Path) -> Result<bool> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mounts = match std::fs::File::open("/proc/mounts") {
        Ok(f) => f,
        Err(_) => return Ok(false),
    };
    for line in std::io::BufReader::new(mounts).lines() {
        let line = line?;
        if let Some(dev) = line.split_whitespace().next() {
            if Path::new(dev) == canonical.as_path() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
