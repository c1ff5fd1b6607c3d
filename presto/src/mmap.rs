//! Memory-mapped file access.
//!
//! A file is mapped as a sequence of chunks so that models larger than a
//! single mapping limit still load on 32-bit targets. All reads are
//! position-based; a [`MmapCursor`] adds a sequential view for loaders.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::errors::{PrestoError, Result};

#[cfg(target_pointer_width = "64")]
const DEFAULT_CHUNK_SIZE_POWER: u32 = 30;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_CHUNK_SIZE_POWER: u32 = 28;

/// A file mapped into memory as a sequence of read-only chunks.
///
/// Cloning is O(1) and shares the mapping. [`MappedFile::close`] marks the
/// mapping unusable for every clone; the memory itself is released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct MappedFile {
    chunks: Arc<Vec<Mmap>>,
    closed: Arc<AtomicBool>,
    len: u64,
    chunk_size: u64,
}

impl MappedFile {
    /// Maps `path` with the default chunk size.
    pub fn open<P: AsRef<Path>>(path: P, preload: bool) -> Result<Self> {
        Self::open_with_chunk_size_power(path, preload, DEFAULT_CHUNK_SIZE_POWER)
    }

    /// Maps `path` with chunks of `1 << chunk_size_power` bytes.
    pub fn open_with_chunk_size_power<P: AsRef<Path>>(
        path: P,
        preload: bool,
        chunk_size_power: u32,
    ) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        let chunk_size = 1u64 << chunk_size_power;

        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < len {
            let chunk_len = (len - offset).min(chunk_size);
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(usize::try_from(chunk_len).map_err(|_| {
                        PrestoError::invalid_argument(
                            "chunk_size_power",
                            "chunk does not fit in the address space",
                        )
                    })?)
                    .map(&file)
            }
            .map_err(PrestoError::map_failed)?;
            if preload {
                // Best-effort: ignore advisory failures.
                #[cfg(unix)]
                let _ = mmap.advise(memmap2::Advice::WillNeed);
            }
            chunks.push(mmap);
            offset += chunk_len;
        }

        Ok(Self {
            chunks: Arc::new(chunks),
            closed: Arc::new(AtomicBool::new(false)),
            len,
            chunk_size,
        })
    }

    /// Total length of the mapped file in bytes.
    #[inline(always)]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the file is empty.
    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks the mapping closed for this handle and all clones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PrestoError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// Copies `dst.len()` bytes starting at `pos`, crossing chunk
    /// boundaries as needed.
    pub fn bytes_at(&self, pos: u64, dst: &mut [u8]) -> Result<()> {
        self.check_open()?;
        let end = pos + dst.len() as u64;
        if end > self.len {
            return Err(PrestoError::truncated("mapped bytes"));
        }
        let mut pos = pos;
        let mut written = 0;
        while written < dst.len() {
            let chunk_idx = (pos / self.chunk_size) as usize;
            let chunk_off = (pos % self.chunk_size) as usize;
            let chunk = &self.chunks[chunk_idx];
            let n = (dst.len() - written).min(chunk.len() - chunk_off);
            dst[written..written + n].copy_from_slice(&chunk[chunk_off..chunk_off + n]);
            written += n;
            pos += n as u64;
        }
        Ok(())
    }

    /// Byte at `pos`.
    #[inline]
    pub fn u8_at(&self, pos: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.bytes_at(pos, &mut buf)?;
        Ok(buf[0])
    }

    /// Little-endian i32 at `pos`.
    #[inline]
    pub fn i32_at(&self, pos: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.bytes_at(pos, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Little-endian i64 at `pos`.
    #[inline]
    pub fn i64_at(&self, pos: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.bytes_at(pos, &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Little-endian f32 at `pos`.
    #[inline]
    pub fn f32_at(&self, pos: u64) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.bytes_at(pos, &mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Creates a sequential cursor positioned at the head.
    pub fn cursor(&self) -> MmapCursor {
        MmapCursor {
            file: self.clone(),
            pos: 0,
        }
    }
}

/// An independent sequential cursor over a [`MappedFile`].
#[derive(Clone)]
pub struct MmapCursor {
    file: MappedFile,
    pos: u64,
}

impl MmapCursor {
    /// Current absolute position.
    #[inline(always)]
    pub const fn position(&self) -> u64 {
        self.pos
    }

    /// Moves the cursor to an absolute position.
    #[inline(always)]
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Reads one byte and advances.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let x = self.file.u8_at(self.pos)?;
        self.pos += 1;
        Ok(x)
    }

    /// Reads a little-endian i32 and advances.
    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        let x = self.file.i32_at(self.pos)?;
        self.pos += 4;
        Ok(x)
    }

    /// Reads a little-endian i64 and advances.
    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        let x = self.file.i64_at(self.pos)?;
        self.pos += 8;
        Ok(x)
    }

    /// Reads a little-endian f32 and advances.
    #[inline]
    pub fn read_f32(&mut self) -> Result<f32> {
        let x = self.file.f32_at(self.pos)?;
        self.pos += 4;
        Ok(x)
    }

    /// Fills `dst` and advances.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.file.bytes_at(self.pos, dst)?;
        self.pos += dst.len() as u64;
        Ok(())
    }
}
