//! Common settings in Presto.

/// Magic number at the head of every model file.
pub const MODEL_MAGIC: i32 = 793_712_314;

/// Format version written by `save`.
pub const MODEL_VERSION: i32 = 12;

/// Oldest format version accepted by `load`.
pub const MIN_MODEL_VERSION: i32 = 11;

/// End-of-sentence sentinel appended to every tokenized line.
pub const EOS: &str = "</s>";

/// Begin-of-word padding for character n-grams.
pub const BOW: &str = "<";

/// End-of-word padding for character n-grams.
pub const EOW: &str = ">";

/// Size of the vocabulary hash table for models trained with the
/// fixed-capacity table (format version 11).
pub(crate) const MAX_VOCAB_SIZE: usize = 30_000_000;

/// Maximum number of feature ids produced for one line.
pub(crate) const MAX_LINE_SIZE: usize = 1024;

/// Number of entries in the negative-sampling table.
pub(crate) const NEGATIVE_TABLE_SIZE: usize = 10_000_000;
