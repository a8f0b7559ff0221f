use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::{Error, Result};

/// Read-only view of a store file.
pub struct MmapFile {
    map: Option<Mmap>,
    len: usize,
}

impl MmapFile {
    /// Maps the first `limit` bytes of `path` (or the whole file if shorter).
    pub fn open(path: &Path, limit: u64) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len().min(limit);
        let len = usize::try_from(len).map_err(|_| Error::Corrupt("store exceeds address space"))?;
        if len == 0 {
            return Ok(Self { map: None, len: 0 });
        }
        // SAFETY: the store file is only appended to or truncated past `limit`
        // by the owning handle, which is not concurrently active during a read.
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(Self {
            map: Some(map),
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..self.len],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::MmapFile;
    use tempfile::tempdir;

    #[test]
    fn maps_up_to_limit() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").expect("write");

        let map = MmapFile::open(&path, 5).expect("map");
        assert_eq!(map.as_slice(), b"hello");
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn empty_file_maps_to_empty_slice() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").expect("write");

        let map = MmapFile::open(&path, u64::MAX).expect("map");
        assert_eq!(map.len(), 0);
        assert!(map.as_slice().is_empty());
    }
}
