use crate::structures::*;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A tree block held in memory. Shared by reference count: the block
/// cache, every Path slot and the walker's active-node stack each hold an
/// `Rc` clone; interior mutability because the single-threaded engine
/// rewrites blocks in place after COW.
///
/// All multi-byte fields are little-endian on disk, so every accessor goes
/// through the `read_*`/`write_*` helpers rather than casting the buffer.
pub struct ExtentBuffer {
    pub start: u64,
    data: RefCell<Vec<u8>>,
    dirty: Cell<bool>,
}

pub type EbRef = Rc<ExtentBuffer>;

/* byte offsets within btrfs_header */
const HDR_FSID: usize = 32;
const HDR_BYTENR: usize = 48;
const HDR_FLAGS: usize = 56;
const HDR_CHUNK_TREE_UUID: usize = 64;
const HDR_GENERATION: usize = 80;
const HDR_OWNER: usize = 88;
const HDR_NRITEMS: usize = 96;
const HDR_LEVEL: usize = 100;

impl ExtentBuffer {
    pub fn new(start: u64, data: Vec<u8>) -> EbRef {
        Rc::new(ExtentBuffer {
            start,
            data: RefCell::new(data),
            dirty: Cell::new(false),
        })
    }

    pub fn zeroed(start: u64, len: usize) -> EbRef {
        ExtentBuffer::new(start, vec![0_u8; len])
    }

    pub fn len(&self) -> u32 {
        self.data.borrow().len() as u32
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    pub fn clear_dirty(&self) {
        self.dirty.set(false);
    }

    pub fn data_clone(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.borrow()[offset..offset + len].to_vec()
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        self.data.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn memset(&self, offset: usize, len: usize) {
        self.data.borrow_mut()[offset..offset + len].fill(0);
    }

    /// overlapping-safe move within this buffer
    pub fn memmove(&self, dst: usize, src: usize, len: usize) {
        self.data.borrow_mut().copy_within(src..src + len, dst);
    }

    pub fn copy_from(&self, other: &ExtentBuffer, dst: usize, src: usize, len: usize) {
        if std::ptr::eq(self, other) {
            self.memmove(dst, src, len);
            return;
        }
        let src_data = other.data.borrow();
        self.data.borrow_mut()[dst..dst + len].copy_from_slice(&src_data[src..src + len]);
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data.borrow()[offset]
    }

    pub fn write_u8(&self, offset: usize, v: u8) {
        self.data.borrow_mut()[offset] = v;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.data.borrow()[offset..offset + 2].try_into().unwrap())
    }

    pub fn write_u16(&self, offset: usize, v: u16) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data.borrow()[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&self, offset: usize, v: u32) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.data.borrow()[offset..offset + 8].try_into().unwrap())
    }

    pub fn write_u64(&self, offset: usize, v: u64) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    /* header */

    pub fn header_bytenr(&self) -> u64 {
        self.read_u64(HDR_BYTENR)
    }

    pub fn set_header_bytenr(&self, v: u64) {
        self.write_u64(HDR_BYTENR, v);
    }

    pub fn header_flags(&self) -> u64 {
        self.read_u64(HDR_FLAGS)
    }

    pub fn set_header_flags(&self, v: u64) {
        self.write_u64(HDR_FLAGS, v);
    }

    pub fn header_flag(&self, flag: u64) -> bool {
        self.header_flags() & flag != 0
    }

    pub fn set_header_flag(&self, flag: u64) {
        self.set_header_flags(self.header_flags() | flag);
    }

    pub fn clear_header_flag(&self, flag: u64) {
        self.set_header_flags(self.header_flags() & !flag);
    }

    pub fn backref_rev(&self) -> u64 {
        self.header_flags() >> BTRFS_BACKREF_REV_SHIFT
    }

    pub fn set_backref_rev(&self, rev: u64) {
        let flags = self.header_flags() & ((1 << BTRFS_BACKREF_REV_SHIFT) - 1);
        self.set_header_flags(flags | (rev << BTRFS_BACKREF_REV_SHIFT));
    }

    pub fn header_fsid(&self) -> BtrfsFsid {
        self.read_bytes(HDR_FSID, BTRFS_FSID_SIZE).try_into().unwrap()
    }

    pub fn set_header_fsid(&self, fsid: &BtrfsFsid) {
        self.write_bytes(HDR_FSID, fsid);
    }

    pub fn header_chunk_tree_uuid(&self) -> BtrfsUuid {
        self.read_bytes(HDR_CHUNK_TREE_UUID, BTRFS_UUID_SIZE)
            .try_into()
            .unwrap()
    }

    pub fn set_header_chunk_tree_uuid(&self, uuid: &BtrfsUuid) {
        self.write_bytes(HDR_CHUNK_TREE_UUID, uuid);
    }

    pub fn header_generation(&self) -> u64 {
        self.read_u64(HDR_GENERATION)
    }

    pub fn set_header_generation(&self, v: u64) {
        self.write_u64(HDR_GENERATION, v);
    }

    pub fn header_owner(&self) -> u64 {
        self.read_u64(HDR_OWNER)
    }

    pub fn set_header_owner(&self, v: u64) {
        self.write_u64(HDR_OWNER, v);
    }

    pub fn nritems(&self) -> u32 {
        self.read_u32(HDR_NRITEMS)
    }

    pub fn set_nritems(&self, v: u32) {
        self.write_u32(HDR_NRITEMS, v);
    }

    pub fn level(&self) -> u8 {
        self.read_u8(HDR_LEVEL)
    }

    pub fn set_level(&self, v: u8) {
        self.write_u8(HDR_LEVEL, v);
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    /* leaf items */

    pub fn item_nr_offset(slot: usize) -> usize {
        BTRFS_HEADER_SIZE + slot * BTRFS_ITEM_SIZE
    }

    pub fn item_key(&self, slot: usize) -> Key {
        Key::from_disk_bytes(&self.read_bytes(Self::item_nr_offset(slot), 17))
    }

    pub fn set_item_key(&self, slot: usize, key: &Key) {
        self.write_bytes(Self::item_nr_offset(slot), &key.to_disk_bytes());
    }

    /// data offset relative to the end of the header, as stored on disk
    pub fn item_offset(&self, slot: usize) -> u32 {
        self.read_u32(Self::item_nr_offset(slot) + 17)
    }

    pub fn set_item_offset(&self, slot: usize, v: u32) {
        self.write_u32(Self::item_nr_offset(slot) + 17, v);
    }

    pub fn item_size(&self, slot: usize) -> u32 {
        self.read_u32(Self::item_nr_offset(slot) + 21)
    }

    pub fn set_item_size(&self, slot: usize, v: u32) {
        self.write_u32(Self::item_nr_offset(slot) + 21, v);
    }

    pub fn item_end(&self, slot: usize) -> u32 {
        self.item_offset(slot) + self.item_size(slot)
    }

    /// absolute buffer offset of the item's data bytes
    pub fn item_ptr_offset(&self, slot: usize) -> usize {
        BTRFS_HEADER_SIZE + self.item_offset(slot) as usize
    }

    pub fn item_data(&self, slot: usize) -> Vec<u8> {
        self.read_bytes(self.item_ptr_offset(slot), self.item_size(slot) as usize)
    }

    /* node key pointers */

    pub fn key_ptr_offset(slot: usize) -> usize {
        BTRFS_HEADER_SIZE + slot * BTRFS_KEY_PTR_SIZE
    }

    pub fn node_key(&self, slot: usize) -> Key {
        Key::from_disk_bytes(&self.read_bytes(Self::key_ptr_offset(slot), 17))
    }

    pub fn set_node_key(&self, slot: usize, key: &Key) {
        self.write_bytes(Self::key_ptr_offset(slot), &key.to_disk_bytes());
    }

    pub fn node_blockptr(&self, slot: usize) -> u64 {
        self.read_u64(Self::key_ptr_offset(slot) + 17)
    }

    pub fn set_node_blockptr(&self, slot: usize, v: u64) {
        self.write_u64(Self::key_ptr_offset(slot) + 17, v);
    }

    pub fn node_ptr_generation(&self, slot: usize) -> u64 {
        self.read_u64(Self::key_ptr_offset(slot) + 25)
    }

    pub fn set_node_ptr_generation(&self, slot: usize, v: u64) {
        self.write_u64(Self::key_ptr_offset(slot) + 25, v);
    }

    /// first key of the block regardless of level
    pub fn first_key(&self) -> Key {
        if self.is_leaf() {
            self.item_key(0)
        } else {
            self.node_key(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_round_trip() {
        let eb = ExtentBuffer::zeroed(4096, 4096);
        eb.set_header_bytenr(4096);
        eb.set_header_owner(BTRFS_EXTENT_TREE_OBJECTID);
        eb.set_header_generation(7);
        eb.set_nritems(3);
        eb.set_level(2);
        eb.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
        eb.set_header_flag(BTRFS_HEADER_FLAG_WRITTEN);
        assert_eq!(eb.header_bytenr(), 4096);
        assert_eq!(eb.header_owner(), BTRFS_EXTENT_TREE_OBJECTID);
        assert_eq!(eb.header_generation(), 7);
        assert_eq!(eb.nritems(), 3);
        assert_eq!(eb.level(), 2);
        assert_eq!(eb.backref_rev(), BTRFS_MIXED_BACKREF_REV);
        assert!(eb.header_flag(BTRFS_HEADER_FLAG_WRITTEN));
        eb.clear_header_flag(BTRFS_HEADER_FLAG_WRITTEN);
        assert!(!eb.header_flag(BTRFS_HEADER_FLAG_WRITTEN));
        assert_eq!(eb.backref_rev(), BTRFS_MIXED_BACKREF_REV);
    }

    #[test]
    fn item_and_node_slots() {
        let eb = ExtentBuffer::zeroed(0, 4096);
        let k = Key::new(256, BTRFS_INODE_ITEM_KEY, 0);
        eb.set_item_key(0, &k);
        eb.set_item_offset(0, 3800);
        eb.set_item_size(0, 160);
        assert_eq!(eb.item_key(0), k);
        assert_eq!(eb.item_end(0), 3960);
        assert_eq!(eb.item_ptr_offset(0), BTRFS_HEADER_SIZE + 3800);

        eb.set_node_key(1, &k);
        eb.set_node_blockptr(1, 1 << 20);
        eb.set_node_ptr_generation(1, 9);
        assert_eq!(eb.node_key(1), k);
        assert_eq!(eb.node_blockptr(1), 1 << 20);
        assert_eq!(eb.node_ptr_generation(1), 9);
    }
}
