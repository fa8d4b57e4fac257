use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic number in {0}")]
    BadMagic(&'static str),
    #[error("tree block {0} unreadable or checksum mismatch")]
    IoBadBlock(u64),
    #[error("tree block {0} violates block invariants")]
    BadBlock(u64),
    #[error("logical address {0} not covered by any chunk")]
    NoChunk(u64),
    #[error("no free space for tree mutation")]
    NoSpace,
    #[error("item already exists")]
    ItemExists,
    #[error("unsupported layout: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, FsckError>;
