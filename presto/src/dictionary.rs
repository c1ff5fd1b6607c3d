//! Vocabulary and label dictionary.
//!
//! Two backends share one contract: [`MemDictionary`] keeps entries and the
//! probe table on the heap, [`MmapDictionary`] resolves the same queries with
//! binary searches over mapped buffers. [`DictionaryWrapper`] dispatches
//! between them and hosts the behaviour common to both: tokenization,
//! character n-grams, word n-grams, and sub-sampling.

pub(crate) mod mem;
pub(crate) mod mmap;

use rand::rngs::StdRng;
use rand::Rng;

use crate::args::{Args, ModelKind};
use crate::common::{BOW, EOS, EOW, MAX_LINE_SIZE};
use crate::errors::{PrestoError, Result};

pub use crate::dictionary::mem::MemDictionary;
pub use crate::dictionary::mmap::MmapDictionary;

/// Type of a dictionary entry.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum EntryType {
    /// Vocabulary word.
    Word = 0,
    /// Classification label.
    Label = 1,
}

impl EntryType {
    pub(crate) fn from_u8(x: u8) -> Result<Self> {
        match x {
            0 => Ok(Self::Word),
            1 => Ok(Self::Label),
            _ => Err(PrestoError::invalid_model(format!(
                "invalid entry type: {x}"
            ))),
        }
    }
}

/// One vocabulary or label entry.
#[derive(Clone, Debug)]
pub struct Entry {
    /// UTF-8 surface form.
    pub word: String,
    /// Occurrence count in the training corpus.
    pub count: i64,
    /// Word or label.
    pub entry_type: EntryType,
    /// The entry's own id followed by its character-n-gram bucket ids.
    pub subwords: Vec<usize>,
}

/// 32-bit FNV-1a over the UTF-8 bytes of `s`.
#[inline]
pub fn fnv1a_32(s: &str) -> u32 {
    let mut h = 0x811C_9DC5u32;
    for &b in s.as_bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Whitespace set used by the trainer's tokenizer.
#[inline]
fn is_separator(c: char) -> bool {
    matches!(
        c,
        '\u{00A0}'
            | '\u{0009}'
            | '\u{000A}'..='\u{000D}'
            | '\u{0020}'
            | '\u{0085}'
            | '\u{1680}'
            | '\u{2000}'..='\u{200A}'
            | '\u{2028}'
            | '\u{2029}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
    )
}

/// Splits `text` on the trainer's whitespace set, dropping empty runs and
/// appending the end-of-sentence sentinel.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = text.split(is_separator).filter(|t| !t.is_empty()).collect();
    tokens.push(EOS);
    tokens
}

/// Enumerates the character n-grams of `word` (unpadded) whose length in
/// code points is within `[minn, maxn]`, calling `f` with each n-gram.
///
/// Iteration runs over the padded form `<word>`; a length-1 n-gram touching
/// either padding boundary is skipped.
pub(crate) fn iter_char_ngrams<F>(word: &str, minn: i32, maxn: i32, mut f: F)
where
    F: FnMut(&str),
{
    let padded = format!("{BOW}{word}{EOW}");
    let bytes = padded.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] & 0xC0 == 0x80 {
            continue;
        }
        let mut j = i;
        let mut n = 1i32;
        while j < bytes.len() && n <= maxn {
            j += 1;
            while j < bytes.len() && bytes[j] & 0xC0 == 0x80 {
                j += 1;
            }
            if n >= minn && !(n == 1 && (i == 0 || j == bytes.len())) {
                f(&padded[i..j]);
            }
            n += 1;
        }
    }
}

/// Multiplier of the word-n-gram rolling hash.
const NGRAM_HASH_MULTIPLIER: u64 = 116_049_371;

/// Widens a 32-bit token hash the way the trainer does: sign extension
/// into the 64-bit accumulator.
#[inline]
pub(crate) fn widen_token_hash(h: u32) -> u64 {
    h as i32 as i64 as u64
}

/// Emits the bucket id of every word n-gram of `hashes`, up to length
/// `word_ngrams`, through `push`.
pub(crate) fn iter_word_ngrams<F>(hashes: &[u32], word_ngrams: i32, bucket: i32, mut push: F)
where
    F: FnMut(usize),
{
    if word_ngrams <= 1 || bucket <= 0 {
        return;
    }
    let bucket = bucket as u64;
    for i in 0..hashes.len() {
        let mut h = widen_token_hash(hashes[i]);
        let end = hashes.len().min(i + word_ngrams as usize);
        for &h2 in &hashes[i + 1..end] {
            h = h
                .wrapping_mul(NGRAM_HASH_MULTIPLIER)
                .wrapping_add(widen_token_hash(h2));
            push((h % bucket) as usize);
        }
    }
}

/// Sub-sampling probability for a count `c` out of `ntokens` at threshold `t`.
#[inline]
pub(crate) fn discard_probability(c: i64, ntokens: i64, t: f64) -> f64 {
    let f = c as f64 / ntokens as f64;
    (t / f).sqrt() + t / f
}

/// Word ids and label ids decoded from one line of text.
#[derive(Default, Debug)]
pub struct DecodedLine {
    /// Input feature ids: word ids, subword buckets, and word-n-gram buckets.
    pub words: Vec<usize>,
    /// Label ids, already rebased to `[0, nlabels)`.
    pub labels: Vec<usize>,
}

/// Dictionary backend chosen at load time.
pub enum DictionaryWrapper {
    /// Heap-backed dictionary from the single-file format.
    Mem(MemDictionary),
    /// Dictionary resolved against mapped sidecar files.
    Mmap(MmapDictionary),
}

impl DictionaryWrapper {
    /// Model configuration shared with the dictionary.
    #[inline(always)]
    pub fn args(&self) -> &Args {
        match self {
            Self::Mem(d) => d.args(),
            Self::Mmap(d) => d.args(),
        }
    }

    /// Total number of entries (words and labels).
    #[inline(always)]
    pub fn len(&self) -> usize {
        match self {
            Self::Mem(d) => d.len(),
            Self::Mmap(d) => d.len(),
        }
    }

    /// Returns true if the dictionary has no entries.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of word entries.
    #[inline(always)]
    pub fn num_words(&self) -> usize {
        match self {
            Self::Mem(d) => d.num_words(),
            Self::Mmap(d) => d.num_words(),
        }
    }

    /// Number of label entries.
    #[inline(always)]
    pub fn num_labels(&self) -> usize {
        match self {
            Self::Mem(d) => d.num_labels(),
            Self::Mmap(d) => d.num_labels(),
        }
    }

    /// Number of tokens seen during training.
    #[inline(always)]
    pub fn num_tokens(&self) -> i64 {
        match self {
            Self::Mem(d) => d.num_tokens(),
            Self::Mmap(d) => d.num_tokens(),
        }
    }

    /// Serialized size of the pruning map, `-1` when absent.
    #[inline(always)]
    pub fn prune_idx_size(&self) -> i64 {
        match self {
            Self::Mem(d) => d.prune_idx_size(),
            Self::Mmap(d) => d.prune_idx_size(),
        }
    }

    #[inline(always)]
    fn prune_lookup(&self, bucket: usize) -> Option<usize> {
        match self {
            Self::Mem(d) => d.prune_lookup(bucket),
            Self::Mmap(d) => d.prune_lookup(bucket),
        }
    }

    /// Id of `word`, if in the vocabulary.
    #[inline(always)]
    pub fn word_id(&self, word: &str) -> Result<Option<usize>> {
        match self {
            Self::Mem(d) => Ok(d.word_id(word)),
            Self::Mmap(d) => d.word_id(word),
        }
    }

    /// Whether `word` is in the vocabulary.
    pub fn contains(&self, word: &str) -> Result<bool> {
        Ok(self.word_id(word)?.is_some())
    }

    /// Surface form of entry `id`.
    pub fn word(&self, id: usize) -> Result<String> {
        match self {
            Self::Mem(d) => d.word(id).map(str::to_string),
            Self::Mmap(d) => d.word(id),
        }
    }

    /// Surface form of label `lid`.
    pub fn label(&self, lid: usize) -> Result<String> {
        let nlabels = self.num_labels();
        if lid >= nlabels {
            return Err(PrestoError::invalid_argument(
                "lid",
                format!("must be within [0, {nlabels}): {lid}"),
            ));
        }
        self.word(self.num_words() + lid)
    }

    /// Training count of entry `id`.
    pub fn count(&self, id: usize) -> Result<i64> {
        match self {
            Self::Mem(d) => d.count(id),
            Self::Mmap(d) => d.count(id),
        }
    }

    /// Type of entry `id`.
    pub fn entry_type(&self, id: usize) -> Result<EntryType> {
        match self {
            Self::Mem(d) => d.entry_type(id),
            Self::Mmap(d) => d.entry_type(id),
        }
    }

    /// Subword ids stored for entry `id`: the id itself followed by its
    /// character-n-gram buckets.
    pub fn subword_ids_of(&self, id: usize) -> Result<Vec<usize>> {
        match self {
            Self::Mem(d) => d.subword_ids_of(id).map(<[usize]>::to_vec),
            Self::Mmap(d) => d.subword_ids_of(id),
        }
    }

    /// Counts of all entries of `entry_type`, in id order.
    pub fn counts(&self, entry_type: EntryType) -> Result<Vec<i64>> {
        let range = match entry_type {
            EntryType::Word => 0..self.num_words(),
            EntryType::Label => self.num_words()..self.len(),
        };
        let mut counts = Vec::with_capacity(range.len());
        for id in range {
            counts.push(self.count(id)?);
        }
        Ok(counts)
    }

    /// Entry type a token would have, judged by its surface form.
    #[inline]
    fn type_of_token(&self, token: &str) -> EntryType {
        if token.starts_with(&self.args().label) {
            EntryType::Label
        } else {
            EntryType::Word
        }
    }

    /// Remaps a raw bucket through the pruning table and pushes the final
    /// feature id. With an empty pruning table nothing is emitted.
    fn push_bucket(&self, out: &mut Vec<usize>, bucket: usize) {
        let prune_size = self.prune_idx_size();
        if prune_size == 0 {
            return;
        }
        let bucket = if prune_size > 0 {
            match self.prune_lookup(bucket) {
                Some(b) => b,
                None => return,
            }
        } else {
            bucket
        };
        out.push(self.num_words() + bucket);
    }

    /// Computes character-n-gram buckets of an out-of-vocabulary word.
    fn push_oov_subwords(&self, out: &mut Vec<usize>, word: &str) {
        let args = self.args();
        if args.bucket <= 0 {
            return;
        }
        let bucket = args.bucket as u32;
        iter_char_ngrams(word, args.minn, args.maxn, |ngram| {
            self.push_bucket(out, (fnv1a_32(ngram) % bucket) as usize);
        });
    }

    /// Subword ids of `word`, stored for in-vocabulary words and computed on
    /// the fly otherwise. The sentinel has no subwords.
    pub fn subword_ids(&self, word: &str) -> Result<Vec<usize>> {
        if let Some(id) = self.word_id(word)? {
            return self.subword_ids_of(id);
        }
        let mut out = Vec::new();
        if word != EOS {
            self.push_oov_subwords(&mut out, word);
        }
        Ok(out)
    }

    /// As [`subword_ids`](Self::subword_ids), also yielding the n-gram
    /// surface forms for in- and out-of-vocabulary words alike.
    pub fn subwords_with_ngrams(&self, word: &str) -> Result<Vec<(String, usize)>> {
        let mut out = Vec::new();
        if let Some(id) = self.word_id(word)? {
            out.push((word.to_string(), id));
        }
        if word != EOS {
            let args = self.args();
            if args.bucket > 0 {
                let bucket = args.bucket as u32;
                let mut ids = Vec::new();
                iter_char_ngrams(word, args.minn, args.maxn, |ngram| {
                    ids.clear();
                    self.push_bucket(&mut ids, (fnv1a_32(ngram) % bucket) as usize);
                    if let Some(&id) = ids.first() {
                        out.push((ngram.to_string(), id));
                    }
                });
            }
        }
        Ok(out)
    }

    fn push_token_subwords(
        &self,
        out: &mut Vec<usize>,
        token: &str,
        wid: Option<usize>,
    ) -> Result<()> {
        match wid {
            Some(id) => {
                if self.args().has_subwords() {
                    out.extend(self.subword_ids_of(id)?);
                } else {
                    out.push(id);
                }
            }
            None => {
                if token != EOS {
                    self.push_oov_subwords(out, token);
                }
            }
        }
        Ok(())
    }

    /// Decodes one line for supervised prediction: word features (including
    /// subword and word-n-gram buckets) and rebased label ids.
    pub fn decode_line(&self, text: &str) -> Result<DecodedLine> {
        let mut line = DecodedLine::default();
        let mut token_hashes = Vec::new();
        for token in tokenize(text) {
            let wid = self.word_id(token)?;
            let entry_type = match wid {
                Some(id) => self.entry_type(id)?,
                None => self.type_of_token(token),
            };
            match entry_type {
                EntryType::Word => {
                    self.push_token_subwords(&mut line.words, token, wid)?;
                    token_hashes.push(fnv1a_32(token));
                }
                EntryType::Label => {
                    if let Some(id) = wid {
                        line.labels.push(id - self.num_words());
                    }
                }
            }
        }
        let args = self.args();
        let mut buckets = Vec::new();
        iter_word_ngrams(&token_hashes, args.word_ngrams, args.bucket, |b| {
            buckets.push(b)
        });
        for b in buckets {
            self.push_bucket(&mut line.words, b);
        }
        Ok(line)
    }

    /// Decodes one line for unsupervised vector paths: in-vocabulary word
    /// ids only, with sub-sampling applied.
    pub fn sampled_line(&self, text: &str, rng: &mut StdRng) -> Result<Vec<usize>> {
        let mut words = Vec::new();
        let mut ntokens = 0usize;
        for token in tokenize(text) {
            if let Some(id) = self.word_id(token)? {
                ntokens += 1;
                if self.entry_type(id)? == EntryType::Word && !self.discard(id, rng.gen())? {
                    words.push(id);
                }
                if ntokens > MAX_LINE_SIZE || token == EOS {
                    break;
                }
            }
        }
        Ok(words)
    }

    /// Sub-sampling decision for word `id` given a uniform draw `r`.
    pub fn discard(&self, id: usize, r: f64) -> Result<bool> {
        if self.args().model == ModelKind::Supervised {
            return Ok(false);
        }
        let p = match self {
            Self::Mem(d) => d.discard_probability(id),
            Self::Mmap(d) => discard_probability(d.count(id)?, d.num_tokens(), d.args().t),
        };
        Ok(r > p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a_32(""), 0x811C_9DC5);
        assert_eq!(fnv1a_32("abc"), 0x1A47_E90B);
    }

    #[test]
    fn test_tokenize_whitespace_set() {
        assert_eq!(
            tokenize("hello\u{3000}world\t!"),
            vec!["hello", "world", "!", EOS]
        );
        assert_eq!(tokenize(""), vec![EOS]);
        assert_eq!(tokenize("  \n "), vec![EOS]);
    }

    #[test]
    fn test_char_ngrams_ascii() {
        let mut grams = Vec::new();
        iter_char_ngrams("cat", 3, 3, |g| grams.push(g.to_string()));
        assert_eq!(grams, vec!["<ca", "cat", "at>"]);
    }

    #[test]
    fn test_char_ngrams_skip_boundary_singletons() {
        let mut grams = Vec::new();
        iter_char_ngrams("ab", 1, 2, |g| grams.push(g.to_string()));
        // "<" and ">" alone are skipped; "b>" and "<a" are fine.
        assert!(!grams.contains(&"<".to_string()));
        assert!(!grams.contains(&">".to_string()));
        assert!(grams.contains(&"<a".to_string()));
        assert!(grams.contains(&"a".to_string()));
        assert!(grams.contains(&"b>".to_string()));
    }

    #[test]
    fn test_char_ngrams_multibyte() {
        let mut grams = Vec::new();
        iter_char_ngrams("日本", 2, 2, |g| grams.push(g.to_string()));
        assert_eq!(grams, vec!["<日", "日本", "本>"]);
    }

    #[test]
    fn test_char_ngrams_disabled_when_maxn_zero() {
        let mut grams = Vec::new();
        iter_char_ngrams("cat", 0, 0, |g| grams.push(g.to_string()));
        assert!(grams.is_empty());
    }

    #[test]
    fn test_word_ngram_rolling_hash() {
        let hashes = [fnv1a_32("new"), fnv1a_32("york")];
        let mut got = Vec::new();
        iter_word_ngrams(&hashes, 2, 2_000_000, |b| got.push(b));

        let mut h = widen_token_hash(hashes[0]);
        h = h
            .wrapping_mul(NGRAM_HASH_MULTIPLIER)
            .wrapping_add(widen_token_hash(hashes[1]));
        assert_eq!(got, vec![(h % 2_000_000) as usize]);
    }

    #[test]
    fn test_word_ngram_sign_extension() {
        // 0x80000001 has the top bit set: the widened seed must carry the
        // upper 32 bits 0xFFFF_FFFF.
        assert_eq!(widen_token_hash(0x8000_0001), 0xFFFF_FFFF_8000_0001);
        assert_eq!(widen_token_hash(0x7FFF_FFFF), 0x0000_0000_7FFF_FFFF);
    }

    #[test]
    fn test_word_ngram_window() {
        let hashes = [1u32, 2, 3, 4];
        let mut count = 0;
        iter_word_ngrams(&hashes, 3, 100, |_| count += 1);
        // Pairs (i, j) with i < j <= i + 2: (0,1) (0,2) (1,2) (1,3) (2,3).
        assert_eq!(count, 5);
    }

    #[test]
    fn test_discard_probability() {
        let t = 1e-4;
        let p = discard_probability(5, 100, t);
        let f = 5.0 / 100.0;
        assert!((p - ((t / f).sqrt() + t / f)).abs() < 1e-9);
    }

    #[test]
    fn test_entry_type_decoding() {
        assert_eq!(EntryType::from_u8(0).unwrap(), EntryType::Word);
        assert_eq!(EntryType::from_u8(1).unwrap(), EntryType::Label);
        assert!(matches!(
            EntryType::from_u8(7),
            Err(PrestoError::InvalidModel(_))
        ));
    }

    use std::sync::Arc;

    fn wrapper(args: Args, entries: Vec<(&str, i64, EntryType)>) -> DictionaryWrapper {
        let entries = entries
            .into_iter()
            .map(|(w, c, t)| (w.to_string(), c, t))
            .collect();
        DictionaryWrapper::Mem(
            MemDictionary::from_entries(Arc::new(args), entries, 100, None).unwrap(),
        )
    }

    fn ten_word_args() -> Args {
        Args {
            minn: 3,
            maxn: 3,
            bucket: 100_000,
            model: ModelKind::Supervised,
            ..Args::default()
        }
    }

    fn ten_word_entries() -> Vec<(&'static str, i64, EntryType)> {
        let mut entries: Vec<_> = [
            "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
            "juliett",
        ]
        .iter()
        .map(|w| (*w, 3i64, EntryType::Word))
        .collect();
        entries.push(("__label__x", 5, EntryType::Label));
        entries
    }

    #[test]
    fn test_oov_subwords_are_bucketed_ngrams() {
        let dict = wrapper(ten_word_args(), ten_word_entries());
        let subwords = dict.subword_ids("cat").unwrap();
        let expected: Vec<usize> = ["<ca", "cat", "at>"]
            .iter()
            .map(|g| 10 + (fnv1a_32(g) % 100_000) as usize)
            .collect();
        assert_eq!(subwords, expected);
    }

    #[test]
    fn test_in_vocabulary_subwords_start_with_id() {
        let dict = wrapper(ten_word_args(), ten_word_entries());
        let id = dict.word_id("charlie").unwrap().unwrap();
        let subwords = dict.subword_ids("charlie").unwrap();
        assert_eq!(subwords[0], id);
        for &s in &subwords[1..] {
            assert!((10..10 + 100_000).contains(&s));
        }
    }

    #[test]
    fn test_eos_subwords_are_empty_for_oov() {
        let dict = wrapper(ten_word_args(), ten_word_entries());
        assert!(dict.subword_ids(EOS).unwrap().is_empty());
    }

    #[test]
    fn test_decode_line_words_and_labels() {
        let args = Args {
            minn: 0,
            maxn: 0,
            word_ngrams: 1,
            model: ModelKind::Supervised,
            ..Args::default()
        };
        let dict = wrapper(
            args,
            vec![
                ("cat", 5, EntryType::Word),
                ("dog", 7, EntryType::Word),
                ("__label__pet", 5, EntryType::Label),
            ],
        );
        let line = dict.decode_line("dog cat __label__pet").unwrap();
        assert_eq!(line.words, vec![1, 0]);
        assert_eq!(line.labels, vec![0]);

        // Unknown labels are dropped, unknown words contribute nothing
        // without subwords.
        let line = dict.decode_line("fish __label__wild").unwrap();
        assert!(line.words.is_empty());
        assert!(line.labels.is_empty());
    }

    #[test]
    fn test_decode_line_word_ngram_buckets() {
        let args = Args {
            minn: 0,
            maxn: 0,
            word_ngrams: 2,
            bucket: 1000,
            model: ModelKind::Supervised,
            ..Args::default()
        };
        let dict = wrapper(
            args,
            vec![("cat", 5, EntryType::Word), ("dog", 7, EntryType::Word)],
        );
        let line = dict.decode_line("cat dog").unwrap();
        // Unigrams cat, dog plus bigram buckets for (cat,dog), (dog,</s>).
        assert_eq!(line.words.len(), 4);
        assert_eq!(&line.words[..2], &[0, 1]);
        for &b in &line.words[2..] {
            assert!((2..2 + 1000).contains(&b));
        }
    }

    #[test]
    fn test_sampled_line_keeps_supervised_words() {
        use rand::SeedableRng;

        let dict = wrapper(
            Args {
                model: ModelKind::Supervised,
                ..Args::default()
            },
            vec![
                ("cat", 5, EntryType::Word),
                ("dog", 7, EntryType::Word),
                ("__label__pet", 5, EntryType::Label),
            ],
        );
        let mut rng = StdRng::seed_from_u64(42);
        // Supervised models never discard.
        let words = dict.sampled_line("cat dog __label__pet", &mut rng).unwrap();
        assert_eq!(words, vec![0, 1]);
    }

    #[test]
    fn test_discard_gate_by_model_kind() {
        let supervised = wrapper(
            Args {
                model: ModelKind::Supervised,
                ..Args::default()
            },
            vec![("cat", 99, EntryType::Word)],
        );
        assert!(!supervised.discard(0, 0.999999).unwrap());

        let skipgram = wrapper(
            Args {
                model: ModelKind::Skipgram,
                t: 1e-10,
                ..Args::default()
            },
            vec![("cat", 99, EntryType::Word)],
        );
        // A tiny threshold over a frequent word makes the discard
        // probability almost zero.
        assert!(skipgram.discard(0, 0.999999).unwrap());
        assert!(!skipgram.discard(0, 0.0).unwrap());
    }
}
