#![allow(non_camel_case_types)]

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SUPER_INFO_OFFSET: usize = 65536;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

pub const BTRFS_SUPER_MIRROR_MAX: usize = 3;
pub const BTRFS_SUPER_MIRROR_SHIFT: usize = 12;

pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_LABEL_SIZE: usize = 256;

pub const BTRFS_MAGIC: u64 = 0x4D5F53665248425F;
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

pub const BTRFS_MAX_LEVEL: usize = 8;
pub const BTRFS_NAME_LEN: usize = 255;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;
pub const BTRFS_UUID_TREE_OBJECTID: u64 = 9;
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;

pub const BTRFS_DEV_STATS_OBJECTID: u64 = 0;
pub const BTRFS_BALANCE_OBJECTID: u64 = -4_i64 as u64;
pub const BTRFS_ORPHAN_OBJECTID: u64 = -5_i64 as u64;
pub const BTRFS_TREE_LOG_OBJECTID: u64 = -6_i64 as u64;
pub const BTRFS_TREE_LOG_FIXUP_OBJECTID: u64 = -7_i64 as u64;
pub const BTRFS_TREE_RELOC_OBJECTID: u64 = -8_i64 as u64;
pub const BTRFS_DATA_RELOC_TREE_OBJECTID: u64 = -9_i64 as u64;
pub const BTRFS_EXTENT_CSUM_OBJECTID: u64 = -10_i64 as u64;
pub const BTRFS_FREE_SPACE_OBJECTID: u64 = -11_i64 as u64;
pub const BTRFS_FREE_INO_OBJECTID: u64 = -12_i64 as u64;
pub const BTRFS_MULTIPLE_OBJECTIDS: u64 = -255_i64 as u64;

pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
pub const BTRFS_LAST_FREE_OBJECTID: u64 = -256_i64 as u64;

pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/* item type bytes, in key order */
pub const BTRFS_INODE_ITEM_KEY: u8 = 1;
pub const BTRFS_INODE_REF_KEY: u8 = 12;
pub const BTRFS_INODE_EXTREF_KEY: u8 = 13;
pub const BTRFS_XATTR_ITEM_KEY: u8 = 24;
pub const BTRFS_ORPHAN_ITEM_KEY: u8 = 48;
pub const BTRFS_DIR_LOG_ITEM_KEY: u8 = 60;
pub const BTRFS_DIR_LOG_INDEX_KEY: u8 = 72;
pub const BTRFS_DIR_ITEM_KEY: u8 = 84;
pub const BTRFS_DIR_INDEX_KEY: u8 = 96;
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
pub const BTRFS_EXTENT_CSUM_KEY: u8 = 128;
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u8 = 144;
pub const BTRFS_ROOT_REF_KEY: u8 = 156;
pub const BTRFS_EXTENT_ITEM_KEY: u8 = 168;
pub const BTRFS_METADATA_ITEM_KEY: u8 = 169;
pub const BTRFS_TREE_BLOCK_REF_KEY: u8 = 176;
pub const BTRFS_EXTENT_DATA_REF_KEY: u8 = 178;
pub const BTRFS_EXTENT_REF_V0_KEY: u8 = 180;
pub const BTRFS_SHARED_BLOCK_REF_KEY: u8 = 182;
pub const BTRFS_SHARED_DATA_REF_KEY: u8 = 184;
pub const BTRFS_BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const BTRFS_FREE_SPACE_INFO_KEY: u8 = 198;
pub const BTRFS_FREE_SPACE_EXTENT_KEY: u8 = 199;
pub const BTRFS_FREE_SPACE_BITMAP_KEY: u8 = 200;
pub const BTRFS_DEV_EXTENT_KEY: u8 = 204;
pub const BTRFS_DEV_ITEM_KEY: u8 = 216;
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

/* header.flags low bits */
pub const BTRFS_HEADER_FLAG_WRITTEN: u64 = 1 << 0;
pub const BTRFS_HEADER_FLAG_RELOC: u64 = 1 << 1;
/* header.flags top byte carries the backref revision */
pub const BTRFS_BACKREF_REV_SHIFT: u32 = 56;
pub const BTRFS_OLD_BACKREF_REV: u64 = 0;
pub const BTRFS_MIXED_BACKREF_REV: u64 = 1;

/* extent item flags */
pub const BTRFS_EXTENT_FLAG_DATA: u64 = 1 << 0;
pub const BTRFS_EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
pub const BTRFS_BLOCK_FLAG_FULL_BACKREF: u64 = 1 << 8;

/* block group type flags */
pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;

pub const BTRFS_INODE_NODATASUM: u64 = 1 << 0;

pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

/* directory entry file types */
pub const BTRFS_FT_UNKNOWN: u8 = 0;
pub const BTRFS_FT_REG_FILE: u8 = 1;
pub const BTRFS_FT_DIR: u8 = 2;
pub const BTRFS_FT_CHRDEV: u8 = 3;
pub const BTRFS_FT_BLKDEV: u8 = 4;
pub const BTRFS_FT_FIFO: u8 = 5;
pub const BTRFS_FT_SOCK: u8 = 6;
pub const BTRFS_FT_SYMLINK: u8 = 7;
pub const BTRFS_FT_XATTR: u8 = 8;

/* imode bits as stored on disk */
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/*
  repr(u16) will not work on big-endian architectures. We could work around this with target_endian confg so that we declare these values with swapped bytes on big-endian systems. But I'm not going to write code I'm not going to test.
*/
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq)]
#[allow(dead_code)]
pub enum BtrfsCsumType {
    CRC32 = 0,
    XXHASH = 1,
    SHA256 = 2,
    BLAKE2 = 3,
}

/// on-disc format is little-endian
pub type LE16 = u16;
pub type LE32 = u32;
pub type LE64 = u64;

pub type BtrfsCsum = [u8; BTRFS_CSUM_SIZE];
pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_super_block {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub magic: LE64,
    pub generation: LE64,
    pub root: LE64,
    pub chunk_root: LE64,
    pub log_root: LE64,
    pub __unused_log_root_transid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub root_dir_object_id: LE64,
    pub num_devices: LE64,
    pub sectorsize: LE32,
    pub nodesize: LE32,
    pub __unused_leafsize: LE32,
    pub stripesize: LE32,
    pub sys_chunk_array_size: LE32,
    pub chunk_root_generation: LE64,
    pub compat_flags: LE64,
    pub compat_ro_flags: LE64,
    pub incompat_flags: LE64,
    pub csum_type: BtrfsCsumType,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: btrfs_dev_item,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: LE64,
    pub uuid_tree_generation: LE64,
    pub metadata_uuid: BtrfsFsid, //fsid vs uuid as per ctree.h
    pub nr_global_roots: LE64,
    pub reserved: [LE64; 27],
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub super_roots: [btrfs_root_backup; BTRFS_NUM_BACKUP_ROOTS],
    pub padding: [u8; 565],
}
static_assertions::assert_eq_size!([u8; BTRFS_SUPER_INFO_SIZE], btrfs_super_block);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_backup {
    pub tree_root: LE64,
    pub tree_root_gen: LE64,

    pub chunk_root: LE64,
    pub chunk_root_gen: LE64,

    pub extent_root: LE64,
    pub extent_root_gen: LE64,

    pub fs_root: LE64,
    pub fs_root_gen: LE64,

    pub dev_root: LE64,
    pub dev_root_gen: LE64,

    pub csum_root: LE64,
    pub csum_root_gen: LE64,

    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub num_devices: LE64,

    pub unused_64: [LE64; 4],

    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
    pub unused_8: [u8; 10],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dev_item {
    pub devid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub r#type: LE64,
    pub generation: LE64,
    pub start_offset: LE64,
    pub dev_group: LE32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}

/* header is stored at the start of every tree node */
#[repr(C, packed)]
pub struct btrfs_header {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,

    pub chunk_tree_uuid: BtrfsUuid,
    pub generation: LE64,
    pub owner: LE64,
    pub nritems: LE32,
    pub level: u8,
}
static_assertions::assert_eq_size!([u8; 101], btrfs_header);

pub const BTRFS_HEADER_SIZE: usize = std::mem::size_of::<btrfs_header>();
pub const BTRFS_ITEM_SIZE: usize = std::mem::size_of::<btrfs_item>();
pub const BTRFS_KEY_PTR_SIZE: usize = std::mem::size_of::<btrfs_key_ptr>();

/* leaf nodes are full of btrfs_items, and data */
#[repr(C, packed)]
pub struct btrfs_item {
    pub key: btrfs_disk_key,
    pub offset: LE32, //counting starts at end of btrfs_header
    pub size: LE32,
}
static_assertions::assert_eq_size!([u8; 25], btrfs_item);

/* non-leaf nodes are full of btrfs_key_ptrs */
#[repr(C, packed)]
pub struct btrfs_key_ptr {
    pub key: btrfs_disk_key,
    pub blockptr: LE64,
    pub generation: LE64,
}
static_assertions::assert_eq_size!([u8; 33], btrfs_key_ptr);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_disk_key {
    pub objectid: LE64,
    pub item_type: u8,
    pub offset: LE64,
}
static_assertions::assert_eq_size!([u8; 17], btrfs_disk_key);

/// CPU-side key. Field order gives the derived `Ord` the on-disk
/// lexicographic ordering (objectid, type, offset).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub fn new(objectid: u64, item_type: u8, offset: u64) -> Key {
        Key {
            objectid,
            item_type,
            offset,
        }
    }

    pub fn from_disk_bytes(buf: &[u8]) -> Key {
        Key {
            objectid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            item_type: buf[8],
            offset: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
        }
    }

    pub fn to_disk_bytes(&self) -> [u8; 17] {
        let mut buf = [0_u8; 17];
        buf[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        buf[8] = self.item_type;
        buf[9..17].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "({} {} {})",
            self.objectid,
            key_type_name(self.item_type),
            self.offset
        )
    }
}

pub fn key_type_name(t: u8) -> &'static str {
    match t {
        BTRFS_INODE_ITEM_KEY => "INODE_ITEM",
        BTRFS_INODE_REF_KEY => "INODE_REF",
        BTRFS_INODE_EXTREF_KEY => "INODE_EXTREF",
        BTRFS_XATTR_ITEM_KEY => "XATTR_ITEM",
        BTRFS_ORPHAN_ITEM_KEY => "ORPHAN_ITEM",
        BTRFS_DIR_LOG_ITEM_KEY => "DIR_LOG_ITEM",
        BTRFS_DIR_LOG_INDEX_KEY => "DIR_LOG_INDEX",
        BTRFS_DIR_ITEM_KEY => "DIR_ITEM",
        BTRFS_DIR_INDEX_KEY => "DIR_INDEX",
        BTRFS_EXTENT_DATA_KEY => "EXTENT_DATA",
        BTRFS_EXTENT_CSUM_KEY => "EXTENT_CSUM",
        BTRFS_ROOT_ITEM_KEY => "ROOT_ITEM",
        BTRFS_ROOT_BACKREF_KEY => "ROOT_BACKREF",
        BTRFS_ROOT_REF_KEY => "ROOT_REF",
        BTRFS_EXTENT_ITEM_KEY => "EXTENT_ITEM",
        BTRFS_METADATA_ITEM_KEY => "METADATA_ITEM",
        BTRFS_TREE_BLOCK_REF_KEY => "TREE_BLOCK_REF",
        BTRFS_EXTENT_DATA_REF_KEY => "EXTENT_DATA_REF",
        BTRFS_EXTENT_REF_V0_KEY => "EXTENT_REF_V0",
        BTRFS_SHARED_BLOCK_REF_KEY => "SHARED_BLOCK_REF",
        BTRFS_SHARED_DATA_REF_KEY => "SHARED_DATA_REF",
        BTRFS_BLOCK_GROUP_ITEM_KEY => "BLOCK_GROUP_ITEM",
        BTRFS_FREE_SPACE_INFO_KEY => "FREE_SPACE_INFO",
        BTRFS_FREE_SPACE_EXTENT_KEY => "FREE_SPACE_EXTENT",
        BTRFS_FREE_SPACE_BITMAP_KEY => "FREE_SPACE_BITMAP",
        BTRFS_DEV_EXTENT_KEY => "DEV_EXTENT",
        BTRFS_DEV_ITEM_KEY => "DEV_ITEM",
        BTRFS_CHUNK_ITEM_KEY => "CHUNK_ITEM",
        _ => "UNKNOWN",
    }
}

#[repr(C, packed)]
pub struct btrfs_stripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: BtrfsUuid,
}

#[repr(C, packed)]
pub struct btrfs_chunk {
    pub length: LE64,
    pub owner: LE64,
    pub stripe_len: LE64,
    pub r#type: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub num_stripes: LE16,
    pub sub_stripes: LE16,
}

#[repr(C, packed)]
pub struct btrfs_timespec {
    pub sec: LE64,
    pub nsec: LE32,
}

#[repr(C, packed)]
pub struct btrfs_inode_item {
    pub generation: LE64,
    pub transid: LE64,
    pub size: LE64,
    pub nbytes: LE64,
    pub block_group: LE64,
    pub nlink: LE32,
    pub uid: LE32,
    pub gid: LE32,
    pub mode: LE32,
    pub rdev: LE64,
    pub flags: LE64,

    pub sequence: LE64,
    pub __reserved: [LE64; 4],
    pub atime: btrfs_timespec,
    pub ctime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
}

/* there was an older version of this structure which I'm ignoring */
#[repr(C, packed)]
pub struct btrfs_root_item {
    pub inode: btrfs_inode_item,
    pub generation: LE64,
    pub root_dirid: LE64,
    pub bytenr: LE64,
    pub byte_limit: LE64,
    pub bytes_used: LE64,
    pub last_snapshot: LE64,
    pub flags: LE64,
    pub refs: LE32,
    pub drop_progress: btrfs_disk_key,
    pub drop_level: u8,
    pub level: u8,
}

#[repr(C, packed)]
pub struct btrfs_root_ref {
    pub dirid: LE64,
    pub sequence: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
pub struct btrfs_extent_item {
    pub refs: LE64,
    pub generation: LE64,
    pub flags: LE64,
}

/* follows btrfs_extent_item for EXTENT_ITEM tree blocks */
#[repr(C, packed)]
pub struct btrfs_tree_block_info {
    pub key: btrfs_disk_key,
    pub level: u8,
}

/* an inline ref is a type byte followed by type-specific payload */
#[repr(C, packed)]
pub struct btrfs_extent_inline_ref {
    pub r#type: u8,
    pub offset: LE64,
}

#[repr(C, packed)]
pub struct btrfs_extent_data_ref {
    pub root: LE64,
    pub objectid: LE64,
    pub offset: LE64,
    pub count: LE32,
}

#[repr(C, packed)]
pub struct btrfs_shared_data_ref {
    pub count: LE32,
}

#[repr(C, packed)]
pub struct btrfs_extent_ref_v0 {
    pub root: LE64,
    pub generation: LE64,
    pub objectid: LE64,
    pub count: LE32,
}

#[repr(C, packed)]
pub struct btrfs_dir_item {
    pub location: btrfs_disk_key,
    pub transid: LE64,
    pub data_len: LE16,
    pub name_len: LE16,
    pub r#type: u8,
    /* name, then data, follow here */
}
static_assertions::assert_eq_size!([u8; 30], btrfs_dir_item);

#[repr(C, packed)]
pub struct btrfs_inode_ref {
    pub index: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
pub struct btrfs_inode_extref {
    pub parent_objectid: LE64,
    pub index: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
pub struct btrfs_file_extent_item {
    pub generation: LE64,
    /* uncompressed length of the whole extent */
    pub ram_bytes: LE64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: LE16,
    pub r#type: u8,
    /* inline items carry the (possibly compressed) bytes from here on */
    pub disk_bytenr: LE64,
    pub disk_num_bytes: LE64,
    pub offset: LE64,
    pub num_bytes: LE64,
}
static_assertions::assert_eq_size!([u8; 53], btrfs_file_extent_item);

/// byte count of everything before `disk_bytenr`; an inline extent item
/// is this header followed by the inline data
pub const BTRFS_FILE_EXTENT_INLINE_DATA_START: usize = 21;

#[repr(C, packed)]
pub struct btrfs_block_group_item {
    pub used: LE64,
    pub chunk_objectid: LE64,
    pub flags: LE64,
}

#[repr(C, packed)]
pub struct btrfs_free_space_info {
    pub extent_count: LE32,
    pub flags: LE32,
}

pub fn btrfs_sb_offset(mirror: usize) -> u64 {
    if mirror > 0 {
        return (16 * 1024_u64) << (BTRFS_SUPER_MIRROR_SHIFT * mirror);
    }
    BTRFS_SUPER_INFO_OFFSET as u64
}

pub fn imode_to_type(imode: u32) -> u8 {
    match imode & S_IFMT {
        S_IFREG => BTRFS_FT_REG_FILE,
        S_IFDIR => BTRFS_FT_DIR,
        S_IFCHR => BTRFS_FT_CHRDEV,
        S_IFBLK => BTRFS_FT_BLKDEV,
        S_IFIFO => BTRFS_FT_FIFO,
        S_IFSOCK => BTRFS_FT_SOCK,
        S_IFLNK => BTRFS_FT_SYMLINK,
        _ => BTRFS_FT_UNKNOWN,
    }
}

pub fn is_fs_root_objectid(objectid: u64) -> bool {
    objectid == BTRFS_FS_TREE_OBJECTID
        || objectid == BTRFS_TREE_RELOC_OBJECTID
        || objectid == BTRFS_DATA_RELOC_TREE_OBJECTID
        || (BTRFS_FIRST_FREE_OBJECTID..=BTRFS_LAST_FREE_OBJECTID).contains(&objectid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = Key::new(1, BTRFS_INODE_ITEM_KEY, 0);
        let b = Key::new(1, BTRFS_INODE_REF_KEY, 0);
        let c = Key::new(1, BTRFS_INODE_REF_KEY, 5);
        let d = Key::new(2, BTRFS_INODE_ITEM_KEY, 0);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn key_disk_round_trip() {
        let k = Key::new(0xdead_beef_0042, BTRFS_EXTENT_DATA_KEY, u64::MAX - 7);
        assert_eq!(k, Key::from_disk_bytes(&k.to_disk_bytes()));
    }

    #[test]
    fn super_mirror_offsets() {
        assert_eq!(btrfs_sb_offset(0), 65536);
        assert_eq!(btrfs_sb_offset(1), 64 * 1024 * 1024);
        assert_eq!(btrfs_sb_offset(2), 256 * 1024 * 1024 * 1024);
    }
}
