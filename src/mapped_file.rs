use anyhow::*;
use libc::c_void;
use more_asserts::*;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

/// Read-only mapping of a regular file or block device. The checker reads
/// superblocks and tree blocks out of this; repair writes bypass it.

pub struct MappedFile {
    pointer: *mut c_void,
    len: usize,
    mapping_size: usize,
}

impl MappedFile {
    pub fn open(file: &Path) -> Result<MappedFile> {
        let f = File::open(file)?;
        let md = f.metadata()?;
        let len = if md.is_file() {
            md.len() as usize
        } else {
            //assume block device
            let mut len64 = 0_u64;
            let len_ref = &mut len64 as *mut u64;
            let ret = unsafe { ioctls::blkgetsize64(f.as_raw_fd(), len_ref) };
            ensure!(ret == 0, "BLKGETSIZE64 failed on {}", file.display());
            len64 as usize
        };
        let ps = sysconf::page::pagesize();
        let mapping_size = ((len + ps - 1) / ps) * ps;
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                f.as_raw_fd(),
                0,
            )
        };
        if libc::MAP_FAILED == p {
            return Err(anyhow!(
                "Failed to map file: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(MappedFile {
            pointer: p,
            len,
            mapping_size,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// Returns a slice of u8s representing part of the mapped file
    pub fn slice(&self, offset: usize, length: usize) -> &[u8] {
        assert_le!(offset + length, self.len, "access beyond end of file");
        unsafe {
            std::slice::from_raw_parts((self.pointer as usize + offset) as *const u8, length)
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::munmap(self.pointer, self.mapping_size);
            assert_eq!(ret, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_slice() -> Result<()> {
        let mf = MappedFile::open(Path::new("Cargo.toml"))?;
        assert_eq!(mf.slice(0, 5), b"[pack");
        assert_eq!(mf.slice(1, 3), b"pac");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "access beyond end of file")]
    fn slice_past_end_panics() {
        let mf = MappedFile::open(Path::new("Cargo.toml")).unwrap();
        mf.slice(mf.byte_len(), 1);
    }
}
