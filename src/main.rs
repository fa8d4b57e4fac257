use btrfs_fsck::check::{run_check, CheckOptions};
use clap::Parser;

/// Check an unmounted btrfs filesystem.
///
/// Each available block device in the filesystem should be specified on
/// the command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// try to repair the filesystem
    #[clap(long)]
    repair: bool,

    /// create a new CRC tree
    #[clap(long)]
    init_csum_tree: bool,

    /// create a new extent tree from the scanned references
    #[clap(long)]
    init_extent_tree: bool,

    /// use this superblock copy
    #[clap(short = 's', long = "super")]
    super_mirror: Option<usize>,

    #[clap(required = true)]
    paths: Vec<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Params::parse();

    let ret = run_check(&CheckOptions {
        paths: args.paths,
        repair: args.repair,
        init_csum_tree: args.init_csum_tree,
        init_extent_tree: args.init_extent_tree,
        super_mirror: args.super_mirror,
    })?;

    std::process::exit(ret);
}
