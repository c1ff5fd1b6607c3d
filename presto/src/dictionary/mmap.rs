//! Dictionary resolved against a memory-mapped sidecar file.
//!
//! The layout replaces the probe table with a sorted array of 64-bit word
//! hashes and a parallel id array, and stores entries as fixed-width records
//! so every access is a couple of random reads.

use std::io::Write;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::args::Args;
use crate::dictionary::{fnv1a_32, EntryType, MemDictionary};
use crate::errors::{PrestoError, Result};
use crate::io::ModelWriter;
use crate::mmap::MappedFile;

/// Dictionary over the mapped `dict.mmap` layout.
pub struct MmapDictionary {
    args: Arc<Args>,
    file: MappedFile,
    size: usize,
    nwords: usize,
    nlabels: usize,
    ntokens: i64,
    prune_idx_size: i64,
    prune_idx: HashMap<i32, i32>,
    word_bytes_len: u64,
    hashes_offset: u64,
    ids_offset: u64,
    entries_offset: u64,
    entry_stride: u64,
}

impl MmapDictionary {
    /// Opens the dictionary stored in `file`.
    pub fn open(file: MappedFile, args: Arc<Args>) -> Result<Self> {
        let mut cursor = file.cursor();
        let word_bytes_len = cursor.read_i32()?;
        let subword_bytes_len = cursor.read_i32()?;
        let size = cursor.read_i32()?;
        let nwords = cursor.read_i32()?;
        let nlabels = cursor.read_i32()?;
        let ntokens = cursor.read_i64()?;
        let prune_idx_size = cursor.read_i64()?;
        if word_bytes_len < 0
            || subword_bytes_len < 0
            || size < 0
            || nwords < 0
            || nlabels < 0
            || nwords + nlabels != size
        {
            return Err(PrestoError::invalid_model(format!(
                "inconsistent mapped dictionary header: size={size} nwords={nwords} nlabels={nlabels}"
            )));
        }
        if size == 0 {
            return Err(PrestoError::invalid_model("empty vocabulary"));
        }

        let prune_count = prune_idx_size.max(0) as usize;
        let mut keys = Vec::with_capacity(prune_count);
        for _ in 0..prune_count {
            keys.push(cursor.read_i32()?);
        }
        let mut prune_idx = HashMap::with_capacity(prune_count);
        for key in keys {
            prune_idx.insert(key, cursor.read_i32()?);
        }

        let hashes_offset = cursor.position();
        let ids_offset = hashes_offset + 8 * size as u64;
        let entries_offset = ids_offset + 4 * size as u64;
        let entry_stride = 4 + word_bytes_len as u64 + 8 + 1 + 4 + subword_bytes_len as u64;

        Ok(Self {
            args,
            file,
            size: size as usize,
            nwords: nwords as usize,
            nlabels: nlabels as usize,
            ntokens,
            prune_idx_size,
            prune_idx,
            word_bytes_len: word_bytes_len as u64,
            hashes_offset,
            ids_offset,
            entries_offset,
            entry_stride,
        })
    }

    /// Marks the underlying mapping closed.
    pub fn close(&self) {
        self.file.close();
    }

    /// Total number of entries.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if the dictionary has no entries.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of word entries.
    #[inline(always)]
    pub fn num_words(&self) -> usize {
        self.nwords
    }

    /// Number of label entries.
    #[inline(always)]
    pub fn num_labels(&self) -> usize {
        self.nlabels
    }

    /// Number of tokens seen during training.
    #[inline(always)]
    pub fn num_tokens(&self) -> i64 {
        self.ntokens
    }

    /// Serialized size of the pruning map, `-1` when absent.
    #[inline(always)]
    pub fn prune_idx_size(&self) -> i64 {
        self.prune_idx_size
    }

    #[inline(always)]
    pub(crate) fn prune_lookup(&self, bucket: usize) -> Option<usize> {
        self.prune_idx.get(&(bucket as i32)).map(|&b| b as usize)
    }

    #[inline(always)]
    pub(crate) fn args(&self) -> &Args {
        &self.args
    }

    /// Id of `word`: binary search of its widened FNV-1a hash over the
    /// sorted hash array.
    pub fn word_id(&self, word: &str) -> Result<Option<usize>> {
        let target = i64::from(fnv1a_32(word));
        let mut lo = 0i64;
        let mut hi = self.size as i64 - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let h = self.file.i64_at(self.hashes_offset + 8 * mid as u64)?;
            if h == target {
                let id = self.file.i32_at(self.ids_offset + 4 * mid as u64)?;
                return Ok(Some(id as usize));
            }
            if h < target {
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        Ok(None)
    }

    #[inline]
    fn entry_offset(&self, id: usize) -> Result<u64> {
        if id >= self.size {
            return Err(PrestoError::invalid_argument(
                "id",
                format!("must be within [0, {}): {id}", self.size),
            ));
        }
        Ok(self.entries_offset + id as u64 * self.entry_stride)
    }

    /// Surface form of entry `id`.
    pub fn word(&self, id: usize) -> Result<String> {
        let off = self.entry_offset(id)?;
        let len = self.file.i32_at(off)?;
        if len < 0 || len as u64 > self.word_bytes_len {
            return Err(PrestoError::invalid_model(format!(
                "corrupt word record at id {id}: length {len}"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.file.bytes_at(off + 4, &mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Training count of entry `id`.
    pub fn count(&self, id: usize) -> Result<i64> {
        let off = self.entry_offset(id)?;
        self.file.i64_at(off + 4 + self.word_bytes_len)
    }

    /// Type of entry `id`.
    pub fn entry_type(&self, id: usize) -> Result<EntryType> {
        let off = self.entry_offset(id)?;
        EntryType::from_u8(self.file.u8_at(off + 12 + self.word_bytes_len)?)
    }

    /// Stored subword ids of entry `id`.
    pub fn subword_ids_of(&self, id: usize) -> Result<Vec<usize>> {
        let off = self.entry_offset(id)?;
        let len = self.file.i32_at(off + 13 + self.word_bytes_len)?;
        if len < 0 {
            return Err(PrestoError::invalid_model(format!(
                "corrupt subword record at id {id}: length {len}"
            )));
        }
        let base = off + 17 + self.word_bytes_len;
        let mut subwords = Vec::with_capacity(len as usize);
        for k in 0..len as u64 {
            subwords.push(self.file.i32_at(base + 4 * k)? as usize);
        }
        Ok(subwords)
    }
}

/// Writes `dict` in the mapped sidecar layout.
///
/// Fails with `InvalidModel` if two distinct entries share an FNV-1a hash:
/// the sorted-array lookup cannot represent such a vocabulary.
pub(crate) fn write_mmap_dictionary<W: Write>(
    dict: &MemDictionary,
    wtr: &mut ModelWriter<W>,
) -> Result<()> {
    let entries = dict.entries();
    let word_bytes_len = entries.iter().map(|e| e.word.len()).max().unwrap_or(0);
    let subword_bytes_len = entries.iter().map(|e| e.subwords.len() * 4).max().unwrap_or(0);

    wtr.write_i32(word_bytes_len as i32)?;
    wtr.write_i32(subword_bytes_len as i32)?;
    wtr.write_i32(entries.len() as i32)?;
    wtr.write_i32(dict.num_words() as i32)?;
    wtr.write_i32(dict.num_labels() as i32)?;
    wtr.write_i64(dict.num_tokens())?;
    wtr.write_i64(dict.prune_idx_size())?;
    for &(first, _) in dict.prune_pairs() {
        wtr.write_i32(first)?;
    }
    for &(_, second) in dict.prune_pairs() {
        wtr.write_i32(second)?;
    }

    let mut hashed: Vec<(i64, usize)> = entries
        .iter()
        .enumerate()
        .map(|(id, e)| (i64::from(fnv1a_32(&e.word)), id))
        .collect();
    hashed.sort_unstable();
    for pair in hashed.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(PrestoError::invalid_model(format!(
                "hash collision between entries {} and {}; \
                 the vocabulary cannot be converted",
                pair[0].1, pair[1].1
            )));
        }
    }
    for &(h, _) in &hashed {
        wtr.write_i64(h)?;
    }
    for &(_, id) in &hashed {
        wtr.write_i32(id as i32)?;
    }

    for entry in entries {
        wtr.write_prefixed_string(&entry.word)?;
        for _ in entry.word.len()..word_bytes_len {
            wtr.write_u8(0)?;
        }
        wtr.write_i64(entry.count)?;
        wtr.write_u8(entry.entry_type as u8)?;
        wtr.write_i32(entry.subwords.len() as i32)?;
        for &s in &entry.subwords {
            wtr.write_i32(s as i32)?;
        }
        for _ in entry.subwords.len() * 4..subword_bytes_len {
            wtr.write_u8(0)?;
        }
    }
    Ok(())
}
