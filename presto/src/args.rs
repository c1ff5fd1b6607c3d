//! Configuration of an already-trained model.

use std::io::{Read, Write};

use crate::errors::{PrestoError, Result};
use crate::io::{ModelReader, ModelWriter};

/// Loss function the model was trained with.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum Loss {
    /// Hierarchical softmax.
    Hs = 1,
    /// Negative sampling. Behaves as softmax at predict time.
    Ns = 2,
    /// Plain softmax.
    Softmax = 3,
}

impl Loss {
    fn from_i32(x: i32) -> Result<Self> {
        match x {
            1 => Ok(Self::Hs),
            2 => Ok(Self::Ns),
            3 => Ok(Self::Softmax),
            _ => Err(PrestoError::invalid_model(format!("invalid loss value: {x}"))),
        }
    }
}

/// Kind of the trained model.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum ModelKind {
    /// Continuous bag of words.
    Cbow = 1,
    /// Skip-gram.
    Skipgram = 2,
    /// Supervised classification.
    Supervised = 3,
}

impl ModelKind {
    fn from_i32(x: i32) -> Result<Self> {
        match x {
            1 => Ok(Self::Cbow),
            2 => Ok(Self::Skipgram),
            3 => Ok(Self::Supervised),
            _ => Err(PrestoError::invalid_model(format!(
                "invalid model value: {x}"
            ))),
        }
    }
}

/// Hyper-parameters of a trained model, immutable after load.
#[derive(Clone, Debug)]
pub struct Args {
    /// Embedding dimension.
    pub dim: i32,
    /// Context window size.
    pub ws: i32,
    /// Number of training epochs.
    pub epoch: i32,
    /// Minimum word count.
    pub min_count: i32,
    /// Number of negative samples.
    pub neg: i32,
    /// Maximum length of word n-grams.
    pub word_ngrams: i32,
    /// Loss function.
    pub loss: Loss,
    /// Model kind.
    pub model: ModelKind,
    /// Number of hash buckets for subwords and word n-grams.
    pub bucket: i32,
    /// Minimum character n-gram length.
    pub minn: i32,
    /// Maximum character n-gram length. Zero disables subwords.
    pub maxn: i32,
    /// Learning-rate update rate.
    pub lr_update_rate: i32,
    /// Sub-sampling threshold.
    pub t: f64,
    /// Label prefix.
    pub label: String,
    /// Whether the output matrix is quantized.
    pub qout: bool,
    /// Whether the vocabulary hash table uses the fixed legacy capacity.
    pub use_max_vocabulary_size: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            dim: 100,
            ws: 5,
            epoch: 5,
            min_count: 5,
            neg: 5,
            word_ngrams: 1,
            loss: Loss::Ns,
            model: ModelKind::Skipgram,
            bucket: 2_000_000,
            minn: 3,
            maxn: 6,
            lr_update_rate: 100,
            t: 1e-4,
            label: "__label__".to_string(),
            qout: false,
            use_max_vocabulary_size: false,
        }
    }
}

impl Args {
    /// Reads the fixed serialized sequence: 12 i32 values and one f64.
    pub fn read<R: Read>(rdr: &mut ModelReader<R>) -> Result<Self> {
        let dim = rdr.read_i32()?;
        let ws = rdr.read_i32()?;
        let epoch = rdr.read_i32()?;
        let min_count = rdr.read_i32()?;
        let neg = rdr.read_i32()?;
        let word_ngrams = rdr.read_i32()?;
        let loss = Loss::from_i32(rdr.read_i32()?)?;
        let model = ModelKind::from_i32(rdr.read_i32()?)?;
        let bucket = rdr.read_i32()?;
        let minn = rdr.read_i32()?;
        let maxn = rdr.read_i32()?;
        let lr_update_rate = rdr.read_i32()?;
        let t = rdr.read_f64()?;
        Ok(Self {
            dim,
            ws,
            epoch,
            min_count,
            neg,
            word_ngrams,
            loss,
            model,
            bucket,
            minn,
            maxn,
            lr_update_rate,
            t,
            ..Self::default()
        })
    }

    /// Writes the fixed serialized sequence: 12 i32 values and one f64.
    pub fn write<W: Write>(&self, wtr: &mut ModelWriter<W>) -> Result<()> {
        wtr.write_i32(self.dim)?;
        wtr.write_i32(self.ws)?;
        wtr.write_i32(self.epoch)?;
        wtr.write_i32(self.min_count)?;
        wtr.write_i32(self.neg)?;
        wtr.write_i32(self.word_ngrams)?;
        wtr.write_i32(self.loss as i32)?;
        wtr.write_i32(self.model as i32)?;
        wtr.write_i32(self.bucket)?;
        wtr.write_i32(self.minn)?;
        wtr.write_i32(self.maxn)?;
        wtr.write_i32(self.lr_update_rate)?;
        wtr.write_f64(self.t)
    }

    /// Adjusts fields for models saved with format version 11.
    ///
    /// Legacy supervised models carry no character subwords and were trained
    /// against the fixed-capacity vocabulary table.
    pub fn apply_version_11_fixup(&mut self) {
        if self.model == ModelKind::Supervised {
            self.maxn = 0;
            self.use_max_vocabulary_size = true;
        }
    }

    /// True when character subwords are enabled.
    #[inline(always)]
    pub fn has_subwords(&self) -> bool {
        self.maxn > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_layout() {
        let args = Args {
            dim: 4,
            ws: 5,
            epoch: 6,
            min_count: 7,
            neg: 8,
            word_ngrams: 2,
            loss: Loss::Softmax,
            model: ModelKind::Supervised,
            bucket: 1000,
            minn: 2,
            maxn: 5,
            lr_update_rate: 100,
            t: 1e-4,
            ..Args::default()
        };
        let mut wtr = ModelWriter::new(Vec::new());
        args.write(&mut wtr).unwrap();
        let buf = wtr.finish().unwrap();
        assert_eq!(buf.len(), 12 * 4 + 8);
        assert_eq!(&buf[..4], &4i32.to_le_bytes());
        assert_eq!(&buf[24..28], &3i32.to_le_bytes()); // loss = softmax
        assert_eq!(&buf[48..], &1e-4f64.to_le_bytes());

        let mut rdr = ModelReader::new(buf.as_slice());
        let decoded = Args::read(&mut rdr).unwrap();
        assert_eq!(decoded.dim, 4);
        assert_eq!(decoded.loss, Loss::Softmax);
        assert_eq!(decoded.model, ModelKind::Supervised);
        assert_eq!(decoded.t, 1e-4);
        assert_eq!(decoded.label, "__label__");
    }

    #[test]
    fn test_invalid_loss_byte() {
        let mut buf = Vec::new();
        for x in [4i32, 5, 6, 7, 8, 2, 9, 3, 1000, 2, 5, 100] {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        buf.extend_from_slice(&1e-4f64.to_le_bytes());
        let mut rdr = ModelReader::new(buf.as_slice());
        match Args::read(&mut rdr) {
            Err(PrestoError::InvalidModel(_)) => {}
            r => panic!("unexpected result: {r:?}"),
        }
    }

    #[test]
    fn test_version_11_fixup() {
        let mut args = Args {
            model: ModelKind::Supervised,
            maxn: 6,
            ..Args::default()
        };
        args.apply_version_11_fixup();
        assert_eq!(args.maxn, 0);
        assert!(args.use_max_vocabulary_size);

        let mut args = Args {
            model: ModelKind::Skipgram,
            maxn: 6,
            ..Args::default()
        };
        args.apply_version_11_fixup();
        assert_eq!(args.maxn, 6);
        assert!(!args.use_max_vocabulary_size);
    }
}
