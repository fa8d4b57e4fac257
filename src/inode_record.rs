use crate::cache_tree::CacheTree;
use crate::structures::*;

use std::cell::RefCell;
use std::rc::Rc;

/// In-memory reconstruction of one inode, built up from whatever items
/// the fs-tree walk encounters, in whatever order. Errors accumulate in a
/// bitmap so one pass reports everything.

pub const I_ERR_NO_INODE_ITEM: u32 = 1 << 0;
pub const I_ERR_NO_ORPHAN_ITEM: u32 = 1 << 1;
pub const I_ERR_DUP_INODE_ITEM: u32 = 1 << 2;
pub const I_ERR_DUP_DIR_INDEX: u32 = 1 << 3;
pub const I_ERR_ODD_DIR_ITEM: u32 = 1 << 4;
pub const I_ERR_ODD_FILE_EXTENT: u32 = 1 << 5;
pub const I_ERR_BAD_FILE_EXTENT: u32 = 1 << 6;
pub const I_ERR_FILE_EXTENT_OVERLAP: u32 = 1 << 7;
pub const I_ERR_FILE_EXTENT_DISCOUNT: u32 = 1 << 8;
pub const I_ERR_DIR_ISIZE_WRONG: u32 = 1 << 9;
pub const I_ERR_FILE_NBYTES_WRONG: u32 = 1 << 10;
pub const I_ERR_ODD_CSUM_ITEM: u32 = 1 << 11;
pub const I_ERR_SOME_CSUM_MISSING: u32 = 1 << 12;
pub const I_ERR_LINK_COUNT_WRONG: u32 = 1 << 13;

pub const REF_ERR_NO_DIR_ITEM: u32 = 1 << 0;
pub const REF_ERR_NO_DIR_INDEX: u32 = 1 << 1;
pub const REF_ERR_NO_INODE_REF: u32 = 1 << 2;
pub const REF_ERR_DUP_DIR_ITEM: u32 = 1 << 3;
pub const REF_ERR_DUP_DIR_INDEX: u32 = 1 << 4;
pub const REF_ERR_DUP_INODE_REF: u32 = 1 << 5;
pub const REF_ERR_INDEX_UNMATCH: u32 = 1 << 6;
pub const REF_ERR_FILETYPE_UNMATCH: u32 = 1 << 7;
pub const REF_ERR_NAME_TOO_LONG: u32 = 1 << 8;
pub const REF_ERR_NO_ROOT_REF: u32 = 1 << 9;
pub const REF_ERR_NO_ROOT_BACKREF: u32 = 1 << 10;
pub const REF_ERR_DUP_ROOT_REF: u32 = 1 << 11;
pub const REF_ERR_DUP_ROOT_BACKREF: u32 = 1 << 12;

/// one (directory, name) link to an inode, assembled from dir item, dir
/// index and inode ref sightings
#[derive(Clone, Debug, Default)]
pub struct InodeBackref {
    pub dir: u64,
    pub index: u64,
    pub name: Vec<u8>,
    pub filetype: u8,
    pub ref_type: u8,
    pub errors: u32,
    pub found_dir_item: bool,
    pub found_dir_index: bool,
    pub found_inode_ref: bool,
}

#[derive(Debug)]
pub struct InodeRecord {
    pub ino: u64,
    pub nlink: u32,
    pub imode: u32,
    pub isize: u64,
    pub nbytes: u64,

    pub found_link: u32,
    pub found_size: u64,
    pub extent_start: u64,
    pub extent_end: u64,
    pub first_extent_gap: u64,

    pub errors: u32,
    /// caches holding this record; modified records with refs > 1 are
    /// cloned first
    pub refs: u32,

    pub checked: bool,
    pub merging: bool,
    pub found_inode_item: bool,
    pub found_dir_item: bool,
    pub found_file_extent: bool,
    pub found_csum_item: bool,
    pub some_csum_missing: bool,
    pub nodatasum: bool,

    pub backrefs: Vec<InodeBackref>,
}

pub type InodeRecRef = Rc<RefCell<InodeRecord>>;
pub type InodeCache = CacheTree<InodeRecRef>;

fn new_inode_rec(ino: u64) -> InodeRecord {
    InodeRecord {
        ino,
        nlink: 0,
        imode: 0,
        isize: 0,
        nbytes: 0,
        found_link: if ino == BTRFS_FREE_INO_OBJECTID { 1 } else { 0 },
        found_size: 0,
        extent_start: u64::MAX,
        extent_end: 0,
        first_extent_gap: u64::MAX,
        errors: 0,
        refs: 1,
        checked: false,
        merging: false,
        found_inode_item: false,
        found_dir_item: false,
        found_file_extent: false,
        found_csum_item: false,
        some_csum_missing: false,
        nodatasum: false,
        backrefs: Vec::new(),
    }
}

fn clone_inode_rec(orig: &InodeRecord) -> InodeRecord {
    InodeRecord {
        refs: 1,
        backrefs: orig.backrefs.clone(),
        merging: orig.merging,
        ino: orig.ino,
        nlink: orig.nlink,
        imode: orig.imode,
        isize: orig.isize,
        nbytes: orig.nbytes,
        found_link: orig.found_link,
        found_size: orig.found_size,
        extent_start: orig.extent_start,
        extent_end: orig.extent_end,
        first_extent_gap: orig.first_extent_gap,
        errors: orig.errors,
        checked: orig.checked,
        found_inode_item: orig.found_inode_item,
        found_dir_item: orig.found_dir_item,
        found_file_extent: orig.found_file_extent,
        found_csum_item: orig.found_csum_item,
        some_csum_missing: orig.some_csum_missing,
        nodatasum: orig.nodatasum,
    }
}

/// fetch the record for `ino`, creating it when `do_mod` asks for a
/// mutable view. A record shared between snapshot caches is cloned before
/// it may be modified.
pub fn get_inode_rec(cache: &mut InodeCache, ino: u64, do_mod: bool) -> Option<InodeRecRef> {
    if let Some(rec) = cache.get(ino).cloned() {
        if do_mod && rec.borrow().refs > 1 {
            let cloned = Rc::new(RefCell::new(clone_inode_rec(&rec.borrow())));
            rec.borrow_mut().refs -= 1;
            cache.remove(ino);
            cache
                .insert(ino, 1, cloned.clone())
                .ok()
                .expect("inode cache slot should be free");
            return Some(cloned);
        }
        return Some(rec);
    }
    if !do_mod {
        return None;
    }
    let rec = Rc::new(RefCell::new(new_inode_rec(ino)));
    cache
        .insert(ino, 1, rec.clone())
        .ok()
        .expect("fresh inode record collided");
    Some(rec)
}

pub fn free_inode_rec(rec: &InodeRecRef) {
    rec.borrow_mut().refs -= 1;
    /* storage goes away with the last Rc */
}

pub fn can_free_inode_rec(rec: &InodeRecord) -> bool {
    rec.errors == 0
        && rec.checked
        && rec.found_inode_item
        && rec.nlink == rec.found_link
        && rec.backrefs.is_empty()
}

/// settle what can be settled on a record and drop it from the cache once
/// it is fully clean; called every time new facts land
pub fn maybe_free_inode_rec(cache: &mut InodeCache, rec: &InodeRecRef) {
    {
        let mut r = rec.borrow_mut();
        if !r.found_inode_item {
            return;
        }

        let filetype = imode_to_type(r.imode);
        for backref in r.backrefs.iter_mut() {
            if backref.found_dir_item
                && backref.found_dir_index
                && backref.filetype != filetype
            {
                backref.errors |= REF_ERR_FILETYPE_UNMATCH;
            }
        }
        r.backrefs.retain(|b| {
            !(b.found_dir_item && b.found_dir_index && b.found_inode_ref && b.errors == 0)
        });

        if !r.checked || r.merging {
            return;
        }

        if r.imode & S_IFMT == S_IFDIR {
            if r.found_size != r.isize {
                r.errors |= I_ERR_DIR_ISIZE_WRONG;
            }
            if r.found_file_extent {
                r.errors |= I_ERR_ODD_FILE_EXTENT;
            }
        } else if r.imode & S_IFMT == S_IFREG || r.imode & S_IFMT == S_IFLNK {
            if r.found_dir_item {
                r.errors |= I_ERR_ODD_DIR_ITEM;
            }
            if r.found_size != r.nbytes {
                r.errors |= I_ERR_FILE_NBYTES_WRONG;
            }
            if r.extent_start == u64::MAX || r.extent_start > 0 {
                r.first_extent_gap = 0;
            }
            if r.nlink > 0
                && (r.extent_end < r.isize || r.first_extent_gap < r.isize)
            {
                r.errors |= I_ERR_FILE_EXTENT_DISCOUNT;
            }
        }

        if r.imode & S_IFMT == S_IFREG || r.imode & S_IFMT == S_IFLNK {
            if r.found_csum_item && r.nodatasum {
                r.errors |= I_ERR_ODD_CSUM_ITEM;
            }
            if r.some_csum_missing && !r.nodatasum {
                r.errors |= I_ERR_SOME_CSUM_MISSING;
            }
        }

        assert_eq!(r.refs, 1);
    }

    let r = rec.borrow();
    if can_free_inode_rec(&r) {
        let ino = r.ino;
        drop(r);
        cache.remove(ino);
    }
}

/// record a directory entry / inode ref sighting against the target
/// inode. `itemtype` says which flavour of item produced it.
pub fn add_inode_backref(
    cache: &mut InodeCache,
    ino: u64,
    dir: u64,
    index: u64,
    name: &[u8],
    filetype: u8,
    itemtype: u8,
    errors: u32,
) {
    let rec = get_inode_rec(cache, ino, true).unwrap();
    {
        let mut r = rec.borrow_mut();
        let pos = r
            .backrefs
            .iter()
            .position(|b| b.dir == dir && b.name == name);
        let pos = match pos {
            Some(p) => p,
            None => {
                r.backrefs.push(InodeBackref {
                    dir,
                    name: name.to_vec(),
                    ..Default::default()
                });
                r.backrefs.len() - 1
            }
        };

        if errors != 0 {
            r.backrefs[pos].errors |= errors;
        }
        match itemtype {
            BTRFS_DIR_INDEX_KEY => {
                let b = &mut r.backrefs[pos];
                if b.found_dir_index {
                    b.errors |= REF_ERR_DUP_DIR_INDEX;
                }
                if b.found_inode_ref && b.index != index {
                    b.errors |= REF_ERR_INDEX_UNMATCH;
                }
                if b.found_dir_item && b.filetype != filetype {
                    b.errors |= REF_ERR_FILETYPE_UNMATCH;
                }
                b.index = index;
                b.filetype = filetype;
                b.found_dir_index = true;
            }
            BTRFS_DIR_ITEM_KEY => {
                r.found_link += 1;
                let b = &mut r.backrefs[pos];
                if b.found_dir_item {
                    b.errors |= REF_ERR_DUP_DIR_ITEM;
                }
                if b.found_dir_index && b.filetype != filetype {
                    b.errors |= REF_ERR_FILETYPE_UNMATCH;
                }
                b.filetype = filetype;
                b.found_dir_item = true;
            }
            BTRFS_INODE_REF_KEY | BTRFS_INODE_EXTREF_KEY => {
                let b = &mut r.backrefs[pos];
                if b.found_inode_ref {
                    b.errors |= REF_ERR_DUP_INODE_REF;
                }
                if b.found_dir_index && b.index != index {
                    b.errors |= REF_ERR_INDEX_UNMATCH;
                }
                b.ref_type = itemtype;
                b.index = index;
                b.found_inode_ref = true;
            }
            _ => panic!("unexpected backref item type {itemtype}"),
        }
    }
    maybe_free_inode_rec(cache, &rec);
}

/// fold the facts gathered for one inode in a shared subtree into the
/// same inode seen from another root
pub fn merge_inode_recs(cache: &mut InodeCache, src: &InodeRecRef, dst: &InodeRecRef) {
    dst.borrow_mut().merging = true;
    let (dst_ino, src_backrefs) = {
        let s = src.borrow();
        (dst.borrow().ino, s.backrefs.clone())
    };

    let mut dir_count: u32 = 0;
    for backref in &src_backrefs {
        if backref.found_dir_index {
            add_inode_backref(
                cache,
                dst_ino,
                backref.dir,
                backref.index,
                &backref.name,
                backref.filetype,
                BTRFS_DIR_INDEX_KEY,
                backref.errors,
            );
        }
        if backref.found_dir_item {
            dir_count += 1;
            add_inode_backref(
                cache,
                dst_ino,
                backref.dir,
                0,
                &backref.name,
                backref.filetype,
                BTRFS_DIR_ITEM_KEY,
                backref.errors,
            );
        }
        if backref.found_inode_ref {
            add_inode_backref(
                cache,
                dst_ino,
                backref.dir,
                backref.index,
                &backref.name,
                0,
                backref.ref_type,
                backref.errors,
            );
        }
    }

    let s = src.borrow();
    let mut d = dst.borrow_mut();
    if s.found_dir_item {
        d.found_dir_item = true;
    }
    if s.found_file_extent {
        d.found_file_extent = true;
    }
    if s.found_csum_item {
        d.found_csum_item = true;
    }
    if s.some_csum_missing {
        d.some_csum_missing = true;
    }
    if d.first_extent_gap > s.first_extent_gap {
        d.first_extent_gap = s.first_extent_gap;
    }

    assert!(s.found_link >= dir_count);
    /* links the caller will rediscover through the spliced dir items */
    d.found_link += s.found_link - dir_count;
    d.found_size += s.found_size;
    if s.extent_start != u64::MAX {
        if d.extent_start == u64::MAX {
            d.extent_start = s.extent_start;
            d.extent_end = s.extent_end;
        } else {
            if d.extent_end > s.extent_start {
                d.errors |= I_ERR_FILE_EXTENT_OVERLAP;
            } else if d.extent_end < s.extent_start && d.extent_end < d.first_extent_gap {
                d.first_extent_gap = d.extent_end;
            }
            if d.extent_end < s.extent_end {
                d.extent_end = s.extent_end;
            }
        }
    }

    d.errors |= s.errors;
    if s.found_inode_item {
        if !d.found_inode_item {
            d.nlink = s.nlink;
            d.isize = s.isize;
            d.nbytes = s.nbytes;
            d.imode = s.imode;
            d.nodatasum = s.nodatasum;
            d.found_inode_item = true;
        } else {
            d.errors |= I_ERR_DUP_INODE_ITEM;
        }
    }
    d.merging = false;
}

/*
 * subvolume root records, reconstructed from root items, root refs and
 * the directory entries naming subvolumes
 */

#[derive(Clone, Debug, Default)]
pub struct RootBackref {
    pub ref_root: u64,
    pub dir: u64,
    pub index: u64,
    pub name: Vec<u8>,
    pub errors: u32,
    pub found_dir_item: bool,
    pub found_dir_index: bool,
    pub found_back_ref: bool,
    pub found_forward_ref: bool,
    pub reachable: bool,
}

#[derive(Debug, Default)]
pub struct RootRecord {
    pub objectid: u64,
    pub found_root_item: bool,
    pub found_ref: u32,
    pub backrefs: Vec<RootBackref>,
}

pub type RootRecRef = Rc<RefCell<RootRecord>>;
pub type RootCache = CacheTree<RootRecRef>;

pub fn get_root_rec(cache: &mut RootCache, objectid: u64) -> RootRecRef {
    if let Some(rec) = cache.get(objectid) {
        return rec.clone();
    }
    let rec = Rc::new(RefCell::new(RootRecord {
        objectid,
        ..Default::default()
    }));
    cache
        .insert(objectid, 1, rec.clone())
        .ok()
        .expect("fresh root record collided");
    rec
}

pub fn add_root_backref(
    cache: &mut RootCache,
    root_id: u64,
    ref_root: u64,
    dir: u64,
    index: u64,
    name: &[u8],
    item_type: u8,
    errors: u32,
) {
    let rec = get_root_rec(cache, root_id);
    let mut r = rec.borrow_mut();
    let pos = r
        .backrefs
        .iter()
        .position(|b| b.ref_root == ref_root && b.dir == dir && b.name == name);
    let pos = match pos {
        Some(p) => p,
        None => {
            r.backrefs.push(RootBackref {
                ref_root,
                dir,
                index,
                name: name.to_vec(),
                ..Default::default()
            });
            r.backrefs.len() - 1
        }
    };

    r.backrefs[pos].errors |= errors;

    if item_type != BTRFS_DIR_ITEM_KEY {
        let b = &mut r.backrefs[pos];
        if b.found_dir_index || b.found_back_ref || b.found_forward_ref {
            if b.index != index {
                b.errors |= REF_ERR_INDEX_UNMATCH;
            }
        } else {
            b.index = index;
        }
    }

    match item_type {
        BTRFS_DIR_ITEM_KEY => {
            r.backrefs[pos].found_dir_item = true;
            r.backrefs[pos].reachable = true;
            r.found_ref += 1;
        }
        BTRFS_DIR_INDEX_KEY => {
            r.backrefs[pos].found_dir_index = true;
        }
        BTRFS_ROOT_REF_KEY => {
            let b = &mut r.backrefs[pos];
            if b.found_forward_ref {
                b.errors |= REF_ERR_DUP_ROOT_REF;
            }
            b.found_forward_ref = true;
        }
        BTRFS_ROOT_BACKREF_KEY => {
            let b = &mut r.backrefs[pos];
            if b.found_back_ref {
                b.errors |= REF_ERR_DUP_ROOT_BACKREF;
            }
            b.found_back_ref = true;
        }
        _ => panic!("unexpected root backref item type {item_type}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_created_on_demand_only_with_mod() {
        let mut cache = InodeCache::new();
        assert!(get_inode_rec(&mut cache, 256, false).is_none());
        let rec = get_inode_rec(&mut cache, 256, true).unwrap();
        assert_eq!(rec.borrow().ino, 256);
        assert_eq!(rec.borrow().extent_start, u64::MAX);
        assert!(get_inode_rec(&mut cache, 256, false).is_some());
    }

    #[test]
    fn shared_record_is_cloned_before_modification() {
        let mut cache = InodeCache::new();
        let rec = get_inode_rec(&mut cache, 256, true).unwrap();
        rec.borrow_mut().refs = 2;
        rec.borrow_mut().nlink = 7;
        let modified = get_inode_rec(&mut cache, 256, true).unwrap();
        assert!(!Rc::ptr_eq(&rec, &modified));
        assert_eq!(rec.borrow().refs, 1);
        assert_eq!(modified.borrow().refs, 1);
        assert_eq!(modified.borrow().nlink, 7);
    }

    #[test]
    fn dup_dir_index_sets_backref_error() {
        let mut cache = InodeCache::new();
        add_inode_backref(&mut cache, 257, 256, 2, b"f", BTRFS_FT_REG_FILE,
            BTRFS_DIR_INDEX_KEY, 0);
        add_inode_backref(&mut cache, 257, 256, 2, b"f", BTRFS_FT_REG_FILE,
            BTRFS_DIR_INDEX_KEY, 0);
        let rec = get_inode_rec(&mut cache, 257, false).unwrap();
        assert!(rec.borrow().backrefs[0].errors & REF_ERR_DUP_DIR_INDEX != 0);
    }

    #[test]
    fn merge_discounts_dir_item_links() {
        let mut cache = InodeCache::new();
        let dst = get_inode_rec(&mut cache, 300, true).unwrap();
        let src = Rc::new(RefCell::new(new_inode_rec(300)));
        {
            let mut s = src.borrow_mut();
            s.found_link = 2;
            s.found_size = 10;
            s.backrefs.push(InodeBackref {
                dir: 256,
                index: 3,
                name: b"x".to_vec(),
                filetype: BTRFS_FT_REG_FILE,
                found_dir_item: true,
                ..Default::default()
            });
        }
        merge_inode_recs(&mut cache, &src, &dst);
        let d = dst.borrow();
        /* one of the two links came from the dir item we re-added */
        assert_eq!(d.found_link, 2);
        assert_eq!(d.found_size, 10);
    }
}
