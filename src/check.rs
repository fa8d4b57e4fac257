use crate::btrfs::{load_fs, uuid_str, FsInfo};
use crate::csum_check::check_csums;
use crate::extent_check::check_extents;
use crate::format::{reinit_extent_tree, fsck_reinit_root};
use crate::fs_check::{check_fs_roots, check_root_refs};
use crate::inode_record::RootCache;
use crate::space_check::check_space_cache;
use crate::structures::*;
use crate::transaction::{commit_transaction, start_transaction};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Whole-filesystem accounting gathered during the scans; reported at the
/// end of the run. Threaded by value so nothing global leaks between
/// checks.
#[derive(Default)]
pub struct Stats {
    pub bytes_used: u64,
    pub total_csum_bytes: u64,
    pub total_btree_bytes: u64,
    pub total_fs_tree_bytes: u64,
    pub total_extent_tree_bytes: u64,
    pub btree_space_waste: u64,
    pub data_bytes_allocated: u64,
    pub data_bytes_referenced: u64,
    pub found_old_backref: bool,
}

pub struct CheckOptions {
    pub paths: Vec<PathBuf>,
    pub repair: bool,
    pub init_csum_tree: bool,
    pub init_extent_tree: bool,
    pub super_mirror: Option<usize>,
}

/// run the whole check sequence against an already-open filesystem;
/// returns the number of failing sections
pub fn run_checks(fs: &FsInfo, repair: bool, stats: &mut Stats) -> Result<u64> {
    let mut errors = 0_u64;

    let trans = if repair {
        Some(start_transaction(fs))
    } else {
        None
    };

    eprintln!("checking extents");
    match check_extents(trans.as_ref(), fs, repair, stats) {
        Ok(0) => {}
        Ok(_) => {
            eprintln!("Errors found in extent allocation tree");
            errors += 1;
        }
        Err(e) => {
            if repair {
                bail!("failed to repair damaged filesystem, aborting: {e}");
            }
            eprintln!("Errors found in extent allocation tree: {e}");
            errors += 1;
        }
    }

    eprintln!("checking free space cache");
    if check_space_cache(fs)? != 0 {
        errors += 1;
    }

    eprintln!("checking fs roots");
    let mut root_cache = RootCache::new();
    if check_fs_roots(fs, &mut root_cache)? {
        errors += 1;
    }

    eprintln!("checking csums");
    if check_csums(fs)? != 0 {
        errors += 1;
    }

    eprintln!("checking root refs");
    if check_root_refs(fs, &mut root_cache) != 0 {
        errors += 1;
    }

    if let Some(trans) = trans {
        commit_transaction(fs, &trans)?;
    }
    Ok(errors)
}

pub fn run_check(opts: &CheckOptions) -> Result<i32> {
    let sb_bytenr = match opts.super_mirror {
        Some(n) => {
            let bytenr = btrfs_sb_offset(n);
            println!("using SB copy {n}, bytenr {bytenr}");
            bytenr
        }
        None => 0,
    };

    let fs = load_fs(&opts.paths, sb_bytenr)?;
    println!(
        "Checking filesystem on {}\nUUID: {}",
        opts.paths[0].display(),
        uuid_str(&fs.fsid)
    );

    if opts.init_csum_tree {
        eprintln!("Reinit crc root");
        let trans = start_transaction(&fs);
        fsck_reinit_root(&trans, &fs, &fs.csum_root())?;
        commit_transaction(&fs, &trans)?;
        return Ok(0);
    }

    if opts.init_extent_tree {
        eprintln!("Reinit extent root");
        let trans = start_transaction(&fs);
        reinit_extent_tree(&trans, &fs)?;
        commit_transaction(&fs, &trans)?;
    }

    let repair = opts.repair || opts.init_extent_tree;
    if repair {
        println!("enabling repair mode");
    }

    let mut stats = Stats::default();
    let errors = run_checks(&fs, repair, &mut stats)?;

    let mut ret = if errors > 0 { 1 } else { 0 };
    if stats.found_old_backref {
        /*
         * there was a disk format change when mixed backref was in the
         * testing tree; the old format existed about one week
         */
        println!(
            "\n * Found old mixed backref format. \
             The old format is not supported! *\
             \n * Please mount the FS in readonly mode, \
             backup data and re-format the FS. *\n"
        );
        ret = 1;
    }
    print_stats(&stats, ret);
    Ok(ret)
}

fn print_stats(stats: &Stats, ret: i32) {
    println!("found {} bytes used err is {}", stats.bytes_used, ret);
    println!("total csum bytes: {}", stats.total_csum_bytes);
    println!("total tree bytes: {}", stats.total_btree_bytes);
    println!("total fs tree bytes: {}", stats.total_fs_tree_bytes);
    println!(
        "total extent tree bytes: {}",
        stats.total_extent_tree_bytes
    );
    println!("btree space waste bytes: {}", stats.btree_space_waste);
    println!(
        "file data blocks allocated: {}\n referenced {}",
        stats.data_bytes_allocated, stats.data_bytes_referenced
    );
}
