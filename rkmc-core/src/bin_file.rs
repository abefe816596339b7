// Temp-file storage for one bin's super-k-mer stream
//
// The splitter appends packed parts while the bin is open; the sorter
// rewinds and drains the whole stream into its arena slot. A memory-backed
// variant keeps the parts in RAM for small runs and for tests.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

enum Backing {
    Disk(File),
    Memory(Vec<Vec<u8>>),
}

pub struct BinFile {
    backing: Mutex<Backing>,
    path: Option<PathBuf>,
}

impl BinFile {
    /// Create (or truncate) a disk-backed bin file
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("cannot open temporary file {}", path.display()))?;
        Ok(BinFile {
            backing: Mutex::new(Backing::Disk(file)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a memory-backed bin
    pub fn in_memory() -> Self {
        BinFile {
            backing: Mutex::new(Backing::Memory(Vec::new())),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one packed part
    pub fn write(&self, part: &[u8]) -> Result<()> {
        match &mut *self.backing.lock().unwrap() {
            Backing::Disk(file) => file
                .write_all(part)
                .with_context(|| format!("write to temporary file {:?} failed", self.path)),
            Backing::Memory(parts) => {
                parts.push(part.to_vec());
                Ok(())
            }
        }
    }

    pub fn rewind(&self) -> Result<()> {
        match &mut *self.backing.lock().unwrap() {
            Backing::Disk(file) => {
                file.seek(SeekFrom::Start(0))
                    .with_context(|| format!("rewind of temporary file {:?} failed", self.path))?;
                Ok(())
            }
            Backing::Memory(_) => Ok(()),
        }
    }

    /// Drain the whole stream into `buf`, returning the number of bytes
    /// read. The memory-backed variant gives its parts up to the caller.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        match &mut *self.backing.lock().unwrap() {
            Backing::Disk(file) => {
                let mut pos = 0;
                loop {
                    let n = file
                        .read(&mut buf[pos..])
                        .with_context(|| format!("read of temporary file {:?} failed", self.path))?;
                    if n == 0 || pos == buf.len() {
                        return Ok(pos + n);
                    }
                    pos += n;
                }
            }
            Backing::Memory(parts) => {
                let mut pos = 0;
                for part in parts.drain(..) {
                    buf[pos..pos + part.len()].copy_from_slice(&part);
                    pos += part.len();
                }
                Ok(pos)
            }
        }
    }

    /// Remove the backing file from disk
    pub fn remove(&self) -> Result<()> {
        if let Some(path) = &self.path {
            std::fs::remove_file(path)
                .with_context(|| format!("cannot remove temporary file {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backed_roundtrip() {
        let f = BinFile::in_memory();
        f.write(&[1, 2, 3]).unwrap();
        f.write(&[4, 5]).unwrap();
        f.rewind().unwrap();

        let mut buf = [0u8; 8];
        let n = f.read_into(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_disk_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin_00000.bin");
        let f = BinFile::create(&path).unwrap();
        f.write(&[9u8; 100]).unwrap();
        f.write(&[7u8; 28]).unwrap();
        f.rewind().unwrap();

        let mut buf = vec![0u8; 128];
        let n = f.read_into(&mut buf).unwrap();
        assert_eq!(n, 128);
        assert_eq!(&buf[..100], &[9u8; 100][..]);
        assert_eq!(&buf[100..], &[7u8; 28][..]);

        f.remove().unwrap();
        assert!(!path.exists());
    }
}
