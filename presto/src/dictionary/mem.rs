//! Heap-backed dictionary loaded from the single-file format.

use std::io::{Read, Write};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::args::Args;
use crate::common::{EOS, MAX_VOCAB_SIZE};
use crate::dictionary::{discard_probability, fnv1a_32, iter_char_ngrams, Entry, EntryType};
use crate::errors::{PrestoError, Result};
use crate::io::{ModelReader, ModelWriter};

/// Load factor of the open-addressed vocabulary table.
const TABLE_LOAD_FACTOR: f64 = 0.7;

/// In-memory dictionary: entry list plus an open-addressed hash table from
/// FNV-1a word hashes to entry ids.
pub struct MemDictionary {
    args: Arc<Args>,
    entries: Vec<Entry>,
    word2int: Vec<i32>,
    nwords: usize,
    nlabels: usize,
    ntokens: i64,
    prune_idx_size: i64,
    prune_pairs: Vec<(i32, i32)>,
    prune_idx: HashMap<i32, i32>,
    pdiscard: Vec<f64>,
}

impl MemDictionary {
    /// Builds a dictionary from bare entries, recomputing the probe table,
    /// the discard table, and per-entry subwords.
    pub fn from_entries(
        args: Arc<Args>,
        entries: Vec<(String, i64, EntryType)>,
        ntokens: i64,
        prune_pairs: Option<Vec<(i32, i32)>>,
    ) -> Result<Self> {
        let nwords = entries
            .iter()
            .filter(|(_, _, t)| *t == EntryType::Word)
            .count();
        let nlabels = entries.len() - nwords;
        let (prune_idx_size, prune_pairs) = match prune_pairs {
            Some(pairs) => (pairs.len() as i64, pairs),
            None => (-1, Vec::new()),
        };
        let entries = entries
            .into_iter()
            .map(|(word, count, entry_type)| Entry {
                word,
                count,
                entry_type,
                subwords: Vec::new(),
            })
            .collect();
        let mut dict = Self {
            args,
            entries,
            word2int: Vec::new(),
            nwords,
            nlabels,
            ntokens,
            prune_idx_size,
            prune_idx: prune_pairs.iter().copied().collect(),
            prune_pairs,
            pdiscard: Vec::new(),
        };
        dict.init_table()?;
        dict.init_discard();
        dict.init_ngrams();
        Ok(dict)
    }

    /// Reads the dictionary section of the single-file format.
    pub fn read<R: Read>(rdr: &mut ModelReader<R>, args: Arc<Args>) -> Result<Self> {
        let size = rdr.read_i32()?;
        let nwords = rdr.read_i32()?;
        let nlabels = rdr.read_i32()?;
        let ntokens = rdr.read_i64()?;
        let prune_idx_size = rdr.read_i64()?;
        if size < 0 || nwords < 0 || nlabels < 0 || nwords + nlabels != size {
            return Err(PrestoError::invalid_model(format!(
                "inconsistent dictionary sizes: size={size} nwords={nwords} nlabels={nlabels}"
            )));
        }
        if size == 0 {
            return Err(PrestoError::invalid_model("empty vocabulary"));
        }

        let mut entries = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let word = rdr.read_terminated_string()?;
            let count = rdr.read_i64()?;
            let entry_type = EntryType::from_u8(rdr.read_u8()?)?;
            entries.push(Entry {
                word,
                count,
                entry_type,
                subwords: Vec::new(),
            });
        }

        let mut prune_pairs = Vec::new();
        if prune_idx_size >= 0 {
            for _ in 0..prune_idx_size {
                let first = rdr.read_i32()?;
                let second = rdr.read_i32()?;
                prune_pairs.push((first, second));
            }
        }

        let mut dict = Self {
            args,
            entries,
            word2int: Vec::new(),
            nwords: nwords as usize,
            nlabels: nlabels as usize,
            ntokens,
            prune_idx_size,
            prune_idx: prune_pairs.iter().copied().collect(),
            prune_pairs,
            pdiscard: Vec::new(),
        };
        dict.init_table()?;
        dict.init_discard();
        dict.init_ngrams();
        Ok(dict)
    }

    /// Writes the dictionary section of the single-file format.
    pub fn write<W: Write>(&self, wtr: &mut ModelWriter<W>) -> Result<()> {
        wtr.write_i32(self.entries.len() as i32)?;
        wtr.write_i32(self.nwords as i32)?;
        wtr.write_i32(self.nlabels as i32)?;
        wtr.write_i64(self.ntokens)?;
        wtr.write_i64(self.prune_idx_size)?;
        for entry in &self.entries {
            wtr.write_terminated_string(&entry.word)?;
            wtr.write_i64(entry.count)?;
            wtr.write_u8(entry.entry_type as u8)?;
        }
        if self.prune_idx_size >= 0 {
            for &(first, second) in &self.prune_pairs {
                wtr.write_i32(first)?;
                wtr.write_i32(second)?;
            }
        }
        Ok(())
    }

    fn table_size(&self) -> usize {
        if self.args.use_max_vocabulary_size {
            MAX_VOCAB_SIZE
        } else {
            (self.entries.len() as f64 / TABLE_LOAD_FACTOR).ceil() as usize
        }
    }

    fn init_table(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(PrestoError::invalid_model("empty vocabulary"));
        }
        let table_size = self.table_size();
        if self.entries.len() > table_size {
            return Err(PrestoError::invalid_model(format!(
                "vocabulary of {} entries exceeds the hash table capacity {table_size}",
                self.entries.len()
            )));
        }
        self.word2int = vec![-1; table_size];
        for i in 0..self.entries.len() {
            let slot = self.find_slot(&self.entries[i].word);
            self.word2int[slot] = i as i32;
        }
        Ok(())
    }

    /// Linear-probe slot of `word`: either its current slot or the first
    /// free one.
    fn find_slot(&self, word: &str) -> usize {
        let table_size = self.word2int.len();
        let mut h = fnv1a_32(word) as usize % table_size;
        loop {
            let id = self.word2int[h];
            if id == -1 || self.entries[id as usize].word == word {
                return h;
            }
            h = (h + 1) % table_size;
        }
    }

    fn init_discard(&mut self) {
        let t = self.args.t;
        self.pdiscard = self
            .entries
            .iter()
            .map(|e| discard_probability(e.count, self.ntokens, t))
            .collect();
    }

    fn init_ngrams(&mut self) {
        let minn = self.args.minn;
        let maxn = self.args.maxn;
        let bucket = self.args.bucket;
        let nwords = self.nwords;
        for i in 0..self.entries.len() {
            let mut subwords = vec![i];
            if self.entries[i].word != EOS && bucket > 0 {
                let word = self.entries[i].word.clone();
                iter_char_ngrams(&word, minn, maxn, |ngram| {
                    let raw = (fnv1a_32(ngram) % bucket as u32) as usize;
                    if let Some(b) = self.remap_bucket(raw) {
                        subwords.push(nwords + b);
                    }
                });
            }
            self.entries[i].subwords = subwords;
        }
    }

    #[inline]
    fn remap_bucket(&self, bucket: usize) -> Option<usize> {
        if self.prune_idx_size == 0 {
            return None;
        }
        if self.prune_idx_size > 0 {
            return self.prune_lookup(bucket);
        }
        Some(bucket)
    }

    /// Total number of entries.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the dictionary has no entries.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
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

    /// Id of `word`, if present.
    pub fn word_id(&self, word: &str) -> Option<usize> {
        let slot = self.find_slot(word);
        match self.word2int[slot] {
            -1 => None,
            id => Some(id as usize),
        }
    }

    fn entry(&self, id: usize) -> Result<&Entry> {
        self.entries.get(id).ok_or_else(|| {
            PrestoError::invalid_argument("id", format!("must be within [0, {})", self.entries.len()))
        })
    }

    /// Surface form of entry `id`.
    pub fn word(&self, id: usize) -> Result<&str> {
        Ok(&self.entry(id)?.word)
    }

    /// Training count of entry `id`.
    pub fn count(&self, id: usize) -> Result<i64> {
        Ok(self.entry(id)?.count)
    }

    /// Type of entry `id`.
    pub fn entry_type(&self, id: usize) -> Result<EntryType> {
        Ok(self.entry(id)?.entry_type)
    }

    /// Stored subword ids of entry `id`.
    pub fn subword_ids_of(&self, id: usize) -> Result<&[usize]> {
        Ok(&self.entry(id)?.subwords)
    }

    #[inline(always)]
    pub(crate) fn discard_probability(&self, id: usize) -> f64 {
        self.pdiscard[id]
    }

    /// All entries, in id order.
    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Pruning pairs in serialization order.
    pub(crate) fn prune_pairs(&self) -> &[(i32, i32)] {
        &self.prune_pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::args::ModelKind;

    fn supervised_args() -> Arc<Args> {
        Arc::new(Args {
            model: ModelKind::Supervised,
            maxn: 0,
            ..Args::default()
        })
    }

    fn pet_dictionary() -> MemDictionary {
        MemDictionary::from_entries(
            supervised_args(),
            vec![
                ("cat".to_string(), 5, EntryType::Word),
                ("dog".to_string(), 7, EntryType::Word),
                ("__label__pet".to_string(), 5, EntryType::Label),
            ],
            17,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let dict = pet_dictionary();
        let mut wtr = ModelWriter::new(Vec::new());
        dict.write(&mut wtr).unwrap();
        let buf = wtr.finish().unwrap();

        let mut rdr = ModelReader::new(buf.as_slice());
        let decoded = MemDictionary::read(&mut rdr, supervised_args()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.num_words(), 2);
        assert_eq!(decoded.num_labels(), 1);
        assert_eq!(decoded.num_tokens(), 17);
        assert_eq!(decoded.prune_idx_size(), -1);
        assert_eq!(decoded.word(0).unwrap(), "cat");
        assert_eq!(decoded.word(1).unwrap(), "dog");
        assert_eq!(decoded.count(1).unwrap(), 7);
        assert_eq!(decoded.entry_type(2).unwrap(), EntryType::Label);
        assert_eq!(decoded.word_id("dog"), Some(1));
        assert_eq!(decoded.word_id("bird"), None);

        // Byte-exact re-serialization.
        let mut wtr = ModelWriter::new(Vec::new());
        decoded.write(&mut wtr).unwrap();
        assert_eq!(wtr.finish().unwrap(), buf);
    }

    #[test]
    fn test_empty_vocabulary_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0i64.to_le_bytes());
        buf.extend_from_slice(&(-1i64).to_le_bytes());
        let mut rdr = ModelReader::new(buf.as_slice());
        match MemDictionary::read(&mut rdr, supervised_args()) {
            Err(PrestoError::InvalidModel(_)) => {}
            r => panic!("unexpected result: {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn test_bad_entry_type_rejected() {
        let mut wtr = ModelWriter::new(Vec::new());
        wtr.write_i32(1).unwrap();
        wtr.write_i32(1).unwrap();
        wtr.write_i32(0).unwrap();
        wtr.write_i64(1).unwrap();
        wtr.write_i64(-1).unwrap();
        wtr.write_terminated_string("cat").unwrap();
        wtr.write_i64(1).unwrap();
        wtr.write_u8(9).unwrap();
        let buf = wtr.finish().unwrap();
        let mut rdr = ModelReader::new(buf.as_slice());
        match MemDictionary::read(&mut rdr, supervised_args()) {
            Err(PrestoError::InvalidModel(_)) => {}
            r => panic!("unexpected result: {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn test_subwords_of_in_vocabulary_word() {
        let args = Arc::new(Args {
            minn: 3,
            maxn: 3,
            bucket: 100_000,
            ..Args::default()
        });
        let dict = MemDictionary::from_entries(
            args,
            vec![
                ("cat".to_string(), 5, EntryType::Word),
                ("dog".to_string(), 7, EntryType::Word),
            ],
            12,
            None,
        )
        .unwrap();
        let subwords = dict.subword_ids_of(0).unwrap();
        assert_eq!(subwords[0], 0);
        for &id in &subwords[1..] {
            assert!(id >= 2 && id < 2 + 100_000);
        }
        // "<ca", "cat", "at>"
        assert_eq!(subwords.len(), 4);
    }

    #[test]
    fn test_eos_has_no_subwords() {
        let args = Arc::new(Args::default());
        let dict = MemDictionary::from_entries(
            args,
            vec![(EOS.to_string(), 1, EntryType::Word)],
            1,
            None,
        )
        .unwrap();
        assert_eq!(dict.subword_ids_of(0).unwrap(), &[0]);
    }

    #[test]
    fn test_discard_table() {
        let dict = pet_dictionary();
        for (i, count) in [(0usize, 5i64), (1, 7), (2, 5)] {
            let f = count as f64 / 17.0;
            let expected = (dict.args().t / f).sqrt() + dict.args().t / f;
            assert!((dict.discard_probability(i) - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_prune_gate_empties_subwords() {
        let args = Arc::new(Args {
            minn: 3,
            maxn: 3,
            bucket: 100_000,
            ..Args::default()
        });
        let dict = MemDictionary::from_entries(
            args,
            vec![("cat".to_string(), 5, EntryType::Word)],
            5,
            Some(Vec::new()),
        )
        .unwrap();
        assert_eq!(dict.prune_idx_size(), 0);
        // The empty pruning map suppresses every n-gram bucket.
        assert_eq!(dict.subword_ids_of(0).unwrap(), &[0]);
    }
}
