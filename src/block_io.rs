use crate::mapped_file::MappedFile;

use anyhow::Result;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Storage behind one device of the filesystem. The block device layer is
/// a collaborator, not part of the checker core, so everything above this
/// type only sees positioned reads and writes.
///
/// `Mapped` is the real thing: an mmap for reads plus a lazily opened
/// descriptor for repair writes. `Memory` backs the test suite and grows
/// on demand.
pub enum DeviceStore {
    Mapped {
        path: PathBuf,
        map: MappedFile,
        writer: RefCell<Option<File>>,
    },
    Memory(RefCell<Vec<u8>>),
}

impl DeviceStore {
    pub fn open(path: &Path) -> Result<DeviceStore> {
        Ok(DeviceStore::Mapped {
            path: path.to_path_buf(),
            map: MappedFile::open(path)?,
            writer: RefCell::new(None),
        })
    }

    pub fn memory(size: usize) -> DeviceStore {
        DeviceStore::Memory(RefCell::new(vec![0_u8; size]))
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            DeviceStore::Mapped { map, .. } => {
                buf.copy_from_slice(map.slice(offset as usize, buf.len()));
                Ok(())
            }
            DeviceStore::Memory(data) => {
                let data = data.borrow();
                let start = offset as usize;
                let end = start + buf.len();
                if end > data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past end of memory device",
                    ));
                }
                buf.copy_from_slice(&data[start..end]);
                Ok(())
            }
        }
    }

    /// Writes go through a real descriptor, never the mapping. Blocks we
    /// rewrite are always served from the block cache afterwards, so the
    /// private mapping staying stale is fine.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        match self {
            DeviceStore::Mapped { path, writer, .. } => {
                let mut w = writer.borrow_mut();
                if w.is_none() {
                    *w = Some(OpenOptions::new().write(true).open(path)?);
                }
                w.as_ref().unwrap().write_all_at(data, offset)
            }
            DeviceStore::Memory(buf) => {
                let mut buf = buf.borrow_mut();
                let end = offset as usize + data.len();
                if end > buf.len() {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    pub fn byte_len(&self) -> u64 {
        match self {
            DeviceStore::Mapped { map, .. } => map.byte_len() as u64,
            DeviceStore::Memory(data) => data.borrow().len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = DeviceStore::memory(8192);
        store.write_at(4096, &[7_u8; 16]).unwrap();
        let mut buf = [0_u8; 16];
        store.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [7_u8; 16]);
    }

    #[test]
    fn memory_store_grows_on_write() {
        let store = DeviceStore::memory(0);
        store.write_at(100, &[1, 2, 3]).unwrap();
        assert_eq!(store.byte_len(), 103);
        let mut buf = [0_u8; 3];
        store.read_at(100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn memory_store_read_past_end_fails() {
        let store = DeviceStore::memory(10);
        let mut buf = [0_u8; 4];
        assert!(store.read_at(8, &mut buf).is_err());
    }
}
