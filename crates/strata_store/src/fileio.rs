//! File access primitives for column storage.
//!
//! Column files are grown with `set_len` and written either through
//! positional I/O (`FileExt`) or through shared read-write mappings that
//! multiple copy workers write into at disjoint offsets.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use memmap2::MmapMut;

/// Open (or create) a file for read-write access.
pub fn open_rw(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("could not open for append [file={}]", path.display()))
}

/// Grow a file to at least `len` bytes. Never shrinks.
pub fn allocate(file: &File, len: u64) -> anyhow::Result<()> {
    let current = file.metadata().context("file metadata")?.len();
    if current < len {
        file.set_len(len)
            .with_context(|| format!("could not allocate file [size={len}]"))?;
    }
    Ok(())
}

/// Read an 8-byte little-endian integer at `offset`.
pub fn read_i64_at(file: &File, offset: u64) -> anyhow::Result<i64> {
    let mut buf = [0u8; 8];
    file.read_exact_at(&mut buf, offset)
        .with_context(|| format!("could not read [offset={offset}]"))?;
    Ok(i64::from_le_bytes(buf))
}

/// Read a 4-byte little-endian integer at `offset`.
pub fn read_i32_at(file: &File, offset: u64) -> anyhow::Result<i32> {
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, offset)
        .with_context(|| format!("could not read [offset={offset}]"))?;
    Ok(i32::from_le_bytes(buf))
}

/// Write an 8-byte little-endian integer at `offset`, growing the file as needed.
pub fn write_i64_at(file: &File, offset: u64, value: i64) -> anyhow::Result<()> {
    allocate(file, offset + 8)?;
    file.write_all_at(&value.to_le_bytes(), offset)
        .with_context(|| format!("could not write [offset={offset}]"))?;
    Ok(())
}

/// A column file handle with explicit close ownership.
///
/// The merge planner receives the active partition's already-open files from
/// the table writer. Those must not be closed by the copy workers when the
/// partition rewrite completes; files the planner opened itself must be.
#[derive(Clone)]
pub struct FileSlot {
    pub file: Arc<File>,
    pub owned: bool,
}

impl FileSlot {
    /// A file opened by the planner; the copy path closes it.
    pub fn owned(file: File) -> Self {
        Self {
            file: Arc::new(file),
            owned: true,
        }
    }

    /// A caller-owned file (the writer's active partition); never closed here.
    pub fn shared(file: &Arc<File>) -> Self {
        Self {
            file: Arc::clone(file),
            owned: false,
        }
    }
}

impl std::fmt::Debug for FileSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSlot").field("owned", &self.owned).finish()
    }
}

/// A read-write mapping shared between copy workers.
///
/// Invariant: concurrent writers touch disjoint byte ranges. The planner
/// hands every copy task a fixed `[offset, offset + len)` window and no two
/// tasks of one column overlap, which is what makes the unchecked interior
/// mutability here sound in practice.
pub struct SharedMmap {
    map: UnsafeCell<MmapMut>,
    len: usize,
}

unsafe impl Send for SharedMmap {}
unsafe impl Sync for SharedMmap {}

impl SharedMmap {
    /// Map `len` bytes of `file` read-write, growing the file first.
    pub fn map_rw(file: &File, len: u64) -> anyhow::Result<Arc<Self>> {
        allocate(file, len)?;
        let map = unsafe {
            memmap2::MmapOptions::new()
                .len(len as usize)
                .map_mut(file)
                .with_context(|| format!("could not mmap column [size={len}]"))?
        };
        Ok(Arc::new(Self {
            map: UnsafeCell::new(map),
            len: len as usize,
        }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.map.get()).as_mut_ptr() }
    }

    /// Copy `src` into the mapping at `offset`.
    ///
    /// # Safety
    /// The caller must guarantee no other thread writes an overlapping range.
    pub unsafe fn write_at(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
    }

    /// Fill `count` consecutive `N`-byte values starting at `offset`.
    ///
    /// # Safety
    /// Same disjoint-range contract as [`Self::write_at`].
    pub unsafe fn fill_with<const N: usize>(&self, offset: usize, value: [u8; N], count: usize) {
        debug_assert!(offset + count * N <= self.len);
        let mut dst = self.base().add(offset);
        for _ in 0..count {
            std::ptr::copy_nonoverlapping(value.as_ptr(), dst, N);
            dst = dst.add(N);
        }
    }

    /// Read `len` bytes at `offset`. Only sound while no concurrent writer
    /// overlaps the range; copy tasks read source mappings that nothing
    /// mutates during the rewrite.
    pub fn read_at(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.base().add(offset), len) }
    }

    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_at(offset, 8));
        i64::from_le_bytes(buf)
    }

    /// Flush dirty pages back to the file.
    pub fn flush(&self) -> anyhow::Result<()> {
        unsafe { (*self.map.get()).flush().context("mmap flush") }
    }
}

impl std::fmt::Debug for SharedMmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMmap").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_but_never_shrinks() {
        let dir = tempdir();
        let path = dir.join("col.d");
        let file = open_rw(&path).unwrap();
        allocate(&file, 128).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 128);
        allocate(&file, 64).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 128);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mapped_writes_hit_the_file() {
        let dir = tempdir();
        let path = dir.join("col.d");
        let file = open_rw(&path).unwrap();
        let map = SharedMmap::map_rw(&file, 32).unwrap();
        unsafe {
            map.write_at(8, &42i64.to_le_bytes());
            map.fill_with(16, (-1i64).to_le_bytes(), 2);
        }
        map.flush().unwrap();
        assert_eq!(read_i64_at(&file, 8).unwrap(), 42);
        assert_eq!(read_i64_at(&file, 16).unwrap(), -1);
        assert_eq!(read_i64_at(&file, 24).unwrap(), -1);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "strata-fileio-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
