//! The predictor handle: loading, saving, and query dispatch.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::args::{Args, ModelKind};
use crate::common::{EOS, MIN_MODEL_VERSION, MODEL_MAGIC, MODEL_VERSION};
use crate::dictionary::mmap::write_mmap_dictionary;
use crate::dictionary::{tokenize, DictionaryWrapper, EntryType, MemDictionary, MmapDictionary};
use crate::errors::{PrestoError, Result};
use crate::io::{ModelReader, ModelWriter};
use crate::matrix::{Matrix, MmapMatrix};
use crate::mmap::MappedFile;
use crate::model::{InputMatrix, Model, OutputMatrix};
use crate::quant::{MmapQMatrix, QMatrix};

/// One predicted label with its probability.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Label surface form, prefix included.
    pub label: String,
    /// Predicted probability.
    pub prob: f32,
}

/// A loaded model answering prediction, vector, and neighbour queries.
///
/// A handle is single-writer: prediction reuses internal scratch. For
/// concurrent use, [`Predictor::clone`] produces a handle sharing the
/// read-only matrices and mappings but owning its own scratch.
pub struct Predictor {
    args: Arc<Args>,
    version: i32,
    dict: Arc<DictionaryWrapper>,
    input: Arc<InputMatrix>,
    output: Arc<OutputMatrix>,
    model: Model,
    word_vectors: Arc<OnceLock<Matrix>>,
    closed: Arc<AtomicBool>,
}

impl Clone for Predictor {
    fn clone(&self) -> Self {
        Self {
            args: Arc::clone(&self.args),
            version: self.version,
            dict: Arc::clone(&self.dict),
            input: Arc::clone(&self.input),
            output: Arc::clone(&self.output),
            model: self.model.clone(),
            word_vectors: Arc::clone(&self.word_vectors),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl Predictor {
    /// Loads a model: a file path loads the single-file format, a
    /// directory path loads the memory-mapped form.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::load_memory_mapped(path, false)
        } else {
            let file = File::open(path)?;
            Self::load_from_reader(BufReader::new(file))
        }
    }

    /// Loads a single-file model from a reader.
    pub fn load_from_reader<R: Read>(rdr: R) -> Result<Self> {
        let mut rdr = ModelReader::new(rdr);
        let version = Self::check_header(&mut rdr)?;

        let mut args = Args::read(&mut rdr)?;
        if version == 11 {
            args.apply_version_11_fixup();
        }

        let dict_args = Arc::new(args.clone());
        let dict = MemDictionary::read(&mut rdr, Arc::clone(&dict_args))?;

        let quant_input = rdr.read_bool()?;
        let input = if quant_input {
            InputMatrix::Quantized(QMatrix::read(&mut rdr)?)
        } else {
            InputMatrix::Dense(Matrix::read(&mut rdr)?)
        };
        if dict.prune_idx_size() >= 0 && !quant_input {
            return Err(PrestoError::invalid_model("please download updated model"));
        }

        args.qout = rdr.read_bool()?;
        let output = if quant_input && args.qout {
            OutputMatrix::Quantized(QMatrix::read(&mut rdr)?)
        } else {
            OutputMatrix::Dense(Matrix::read(&mut rdr)?)
        };

        let args = Arc::new(args);
        Self::assemble(
            args,
            version,
            DictionaryWrapper::Mem(dict),
            input,
            output,
        )
    }

    /// Loads the memory-mapped form from a directory containing
    /// `model.bin` (or `model.ftz`), `dict.mmap`, and `in.mmap`.
    pub fn load_memory_mapped<P: AsRef<Path>>(dir: P, preload: bool) -> Result<Self> {
        let dir = dir.as_ref();
        let model_path = {
            let bin = dir.join("model.bin");
            if bin.is_file() {
                bin
            } else {
                dir.join("model.ftz")
            }
        };

        let mut rdr = ModelReader::new(BufReader::new(File::open(model_path)?));
        let version = Self::check_header(&mut rdr)?;
        let mut args = Args::read(&mut rdr)?;
        if version == 11 {
            args.apply_version_11_fixup();
        }
        let quant_input = rdr.read_bool()?;
        args.qout = rdr.read_bool()?;
        let output = if quant_input && args.qout {
            OutputMatrix::Quantized(QMatrix::read(&mut rdr)?)
        } else {
            OutputMatrix::Dense(Matrix::read(&mut rdr)?)
        };
        let args = Arc::new(args);

        let dict_map = MappedFile::open(dir.join("dict.mmap"), preload)?;
        let dict = MmapDictionary::open(dict_map, Arc::clone(&args))?;

        let input_map = MappedFile::open(dir.join("in.mmap"), preload)?;
        let input = if quant_input {
            InputMatrix::MappedQuantized(MmapQMatrix::open(input_map)?)
        } else {
            InputMatrix::MappedDense(MmapMatrix::open(input_map)?)
        };
        if dict.prune_idx_size() >= 0 && !quant_input {
            return Err(PrestoError::invalid_model("please download updated model"));
        }

        Self::assemble(
            args,
            version,
            DictionaryWrapper::Mmap(dict),
            input,
            output,
        )
    }

    fn check_header<R: Read>(rdr: &mut ModelReader<R>) -> Result<i32> {
        let magic = rdr.read_i32()?;
        if magic != MODEL_MAGIC {
            return Err(PrestoError::invalid_model(format!(
                "bad magic number: {magic}"
            )));
        }
        let version = rdr.read_i32()?;
        if !(MIN_MODEL_VERSION..=MODEL_VERSION).contains(&version) {
            return Err(PrestoError::invalid_model(format!(
                "unsupported model version: {version}"
            )));
        }
        Ok(version)
    }

    fn assemble(
        args: Arc<Args>,
        version: i32,
        dict: DictionaryWrapper,
        input: InputMatrix,
        output: OutputMatrix,
    ) -> Result<Self> {
        if input.num_cols() != args.dim as usize {
            return Err(PrestoError::invalid_model(format!(
                "input matrix has {} columns, expected {}",
                input.num_cols(),
                args.dim
            )));
        }
        let counts = match args.model {
            ModelKind::Supervised => dict.counts(EntryType::Label)?,
            _ => dict.counts(EntryType::Word)?,
        };
        let input = Arc::new(input);
        let output = Arc::new(output);
        let model = Model::new(Arc::clone(&input), Arc::clone(&output), args.loss, &counts);
        Ok(Self {
            args,
            version,
            dict: Arc::new(dict),
            input,
            output,
            model,
            word_vectors: Arc::new(OnceLock::new()),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    #[inline]
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PrestoError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn mem_dictionary(&self) -> Result<&MemDictionary> {
        match self.dict.as_ref() {
            DictionaryWrapper::Mem(d) => Ok(d),
            DictionaryWrapper::Mmap(_) => Err(PrestoError::invalid_argument(
                "self",
                "operation requires a heap-resident model",
            )),
        }
    }

    /// Saves the single-file format, byte-exact for a freshly loaded model.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut wtr = ModelWriter::new(BufWriter::new(file));
        self.save_to_writer(&mut wtr)?;
        wtr.finish()?;
        Ok(())
    }

    /// Saves the single-file format into a writer.
    pub fn save_to_writer<W: Write>(&self, wtr: &mut ModelWriter<W>) -> Result<()> {
        self.ensure_open()?;
        let dict = self.mem_dictionary()?;
        wtr.write_i32(MODEL_MAGIC)?;
        wtr.write_i32(self.version)?;
        self.args.write(wtr)?;
        dict.write(wtr)?;
        wtr.write_bool(self.input.is_quantized())?;
        match self.input.as_ref() {
            InputMatrix::Dense(m) => m.write(wtr)?,
            InputMatrix::Quantized(m) => m.write(wtr)?,
            _ => unreachable!("memory-mapped input with a heap dictionary"),
        }
        wtr.write_bool(self.args.qout)?;
        match self.output.as_ref() {
            OutputMatrix::Dense(m) => m.write(wtr)?,
            OutputMatrix::Quantized(m) => m.write(wtr)?,
        }
        Ok(())
    }

    /// Converts the model to the memory-mapped form: `model.bin`,
    /// `dict.mmap`, and `in.mmap` inside `dir`.
    pub fn save_as_memory_mapped<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        self.ensure_open()?;
        let dict = self.mem_dictionary()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut wtr = ModelWriter::new(BufWriter::new(File::create(dir.join("model.bin"))?));
        wtr.write_i32(MODEL_MAGIC)?;
        wtr.write_i32(self.version)?;
        self.args.write(&mut wtr)?;
        wtr.write_bool(self.input.is_quantized())?;
        wtr.write_bool(self.args.qout)?;
        match self.output.as_ref() {
            OutputMatrix::Dense(m) => m.write(&mut wtr)?,
            OutputMatrix::Quantized(m) => m.write(&mut wtr)?,
        }
        wtr.finish()?;

        let mut wtr = ModelWriter::new(BufWriter::new(File::create(dir.join("dict.mmap"))?));
        write_mmap_dictionary(dict, &mut wtr)?;
        wtr.finish()?;

        let mut wtr = ModelWriter::new(BufWriter::new(File::create(dir.join("in.mmap"))?));
        match self.input.as_ref() {
            InputMatrix::Dense(m) => m.write(&mut wtr)?,
            InputMatrix::Quantized(m) => m.write(&mut wtr)?,
            _ => unreachable!("memory-mapped input with a heap dictionary"),
        }
        wtr.finish()?;
        Ok(())
    }

    /// Releases mapped resources and invalidates this handle and its clones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let DictionaryWrapper::Mmap(d) = self.dict.as_ref() {
            d.close();
        }
        self.input.close();
    }

    /// Top-`k` labels for `text` with probability at least `threshold`.
    pub fn predict(&mut self, text: &str, k: usize, threshold: f32) -> Result<Vec<Prediction>> {
        self.ensure_open()?;
        let line = self.dict.decode_line(text)?;
        if line.words.is_empty() {
            return Ok(Vec::new());
        }
        let scored = self.model.predict(&line.words, k, threshold)?;
        scored
            .into_iter()
            .map(|s| {
                Ok(Prediction {
                    label: self.dict.label(s.id)?,
                    prob: s.score.exp(),
                })
            })
            .collect()
    }

    /// All labels for `text` with probability at least `threshold`.
    pub fn predict_all(&mut self, text: &str, threshold: f32) -> Result<Vec<Prediction>> {
        let k = self.dict.num_labels().max(1);
        self.predict(text, k, threshold)
    }

    /// Embedding of `word`: the average of its subword rows.
    pub fn word_vector(&self, word: &str) -> Result<Vec<f32>> {
        self.ensure_open()?;
        let dim = self.args.dim as usize;
        let ids = self.dict.subword_ids(word)?;
        let mut vec = vec![0.0; dim];
        for &id in &ids {
            self.input.add_row_to(&mut vec, id)?;
        }
        if !ids.is_empty() {
            let inv = 1.0 / ids.len() as f32;
            vec.iter_mut().for_each(|x| *x *= inv);
        }
        Ok(vec)
    }

    /// Embedding of a sentence.
    ///
    /// Supervised models average the raw input rows of the decoded line;
    /// unsupervised models average the normalized word vectors of tokens
    /// with non-zero norm.
    pub fn sentence_vector(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_open()?;
        let dim = self.args.dim as usize;
        let mut svec = vec![0.0; dim];
        if self.args.model == ModelKind::Supervised {
            let line = self.dict.decode_line(text)?;
            for &id in &line.words {
                self.input.add_row_to(&mut svec, id)?;
            }
            if !line.words.is_empty() {
                let inv = 1.0 / line.words.len() as f32;
                svec.iter_mut().for_each(|x| *x *= inv);
            }
        } else {
            let mut count = 0usize;
            for token in tokenize(text) {
                if token == EOS {
                    continue;
                }
                let vec = self.word_vector(token)?;
                let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for (dst, x) in svec.iter_mut().zip(&vec) {
                        *dst += x / norm;
                    }
                    count += 1;
                }
            }
            if count > 0 {
                let inv = 1.0 / count as f32;
                svec.iter_mut().for_each(|x| *x *= inv);
            }
        }
        Ok(svec)
    }

    /// Average input row of the features decoded from `text`.
    pub fn text_vector(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_open()?;
        let line = self.dict.decode_line(text)?;
        let mut vec = vec![0.0; self.args.dim as usize];
        for &id in &line.words {
            self.input.add_row_to(&mut vec, id)?;
        }
        if !line.words.is_empty() {
            let inv = 1.0 / line.words.len() as f32;
            vec.iter_mut().for_each(|x| *x *= inv);
        }
        Ok(vec)
    }

    /// Character n-grams of `word` with the vector of each n-gram row.
    pub fn ngram_vectors(&self, word: &str) -> Result<Vec<(String, Vec<f32>)>> {
        self.ensure_open()?;
        let dim = self.args.dim as usize;
        let mut out = Vec::new();
        for (ngram, id) in self.dict.subwords_with_ngrams(word)? {
            let mut vec = vec![0.0; dim];
            self.input.add_row_to(&mut vec, id)?;
            out.push((ngram, vec));
        }
        Ok(out)
    }

    /// `k` nearest vocabulary words to `word` by cosine similarity.
    pub fn nn(&self, word: &str, k: usize) -> Result<Vec<(String, f32)>> {
        self.ensure_open()?;
        let query = self.word_vector(word)?;
        let mut ban = HashSet::new();
        ban.insert(word.to_string());
        self.find_nn(&query, k, &ban)
    }

    /// Words completing the analogy `a - b + c`, e.g.
    /// `analogies("berlin", "germany", "france", k)` suggests "paris".
    pub fn analogies(&self, a: &str, b: &str, c: &str, k: usize) -> Result<Vec<(String, f32)>> {
        self.ensure_open()?;
        let dim = self.args.dim as usize;
        let mut query = vec![0.0; dim];
        for (word, sign) in [(a, 1.0f32), (b, -1.0), (c, 1.0)] {
            let vec = self.word_vector(word)?;
            for (dst, x) in query.iter_mut().zip(&vec) {
                *dst += sign * x;
            }
        }
        let ban: HashSet<String> = [a, b, c].iter().map(|w| w.to_string()).collect();
        self.find_nn(&query, k, &ban)
    }

    /// Normalized word-vector matrix, computed once and shared with clones.
    fn precomputed_word_vectors(&self) -> Result<&Matrix> {
        if let Some(wv) = self.word_vectors.get() {
            return Ok(wv);
        }
        let nwords = self.dict.num_words();
        let dim = self.args.dim as usize;
        let mut wv = Matrix::zeros(nwords, dim);
        for i in 0..nwords {
            let word = self.dict.word(i)?;
            let vec = self.word_vector(&word)?;
            let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                let scaled: Vec<f32> = vec.iter().map(|x| x / norm).collect();
                wv.add_vector_to_row(&scaled, i, 1.0);
            }
        }
        Ok(self.word_vectors.get_or_init(|| wv))
    }

    fn find_nn(
        &self,
        query: &[f32],
        k: usize,
        ban: &HashSet<String>,
    ) -> Result<Vec<(String, f32)>> {
        if k == 0 {
            return Err(PrestoError::invalid_argument("k", "must be positive"));
        }
        let wv = self.precomputed_word_vectors()?;
        let mut query_norm = query.iter().map(|x| x * x).sum::<f32>().sqrt();
        if query_norm.abs() < 1e-8 {
            query_norm = 1.0;
        }

        let mut heap = crate::model::KBestQueue::new(k);
        for i in 0..self.dict.num_words() {
            let score = wv.dot_row(query, i) / query_norm;
            if heap.rejects(score) {
                continue;
            }
            let word = self.dict.word(i)?;
            if ban.contains(&word) {
                continue;
            }
            heap.push(crate::model::Scored { score, id: i });
        }
        heap.into_sorted()
            .into_iter()
            .map(|s| Ok((self.dict.word(s.id)?, s.score)))
            .collect()
    }

    /// Embedding dimension.
    #[inline(always)]
    pub fn dimension(&self) -> usize {
        self.args.dim as usize
    }

    /// True when the input matrix is product-quantized.
    #[inline(always)]
    pub fn is_quantized(&self) -> bool {
        self.input.is_quantized()
    }

    /// Format version the model was loaded with.
    #[inline(always)]
    pub const fn version(&self) -> i32 {
        self.version
    }

    /// Model configuration.
    #[inline(always)]
    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Number of vocabulary words.
    #[inline(always)]
    pub fn num_words(&self) -> usize {
        self.dict.num_words()
    }

    /// Number of labels.
    #[inline(always)]
    pub fn num_labels(&self) -> usize {
        self.dict.num_labels()
    }

    /// Id of `word`, if in the vocabulary.
    pub fn word_id(&self, word: &str) -> Result<Option<usize>> {
        self.ensure_open()?;
        self.dict.word_id(word)
    }

    /// Surface form of entry `id`.
    pub fn word(&self, id: usize) -> Result<String> {
        self.ensure_open()?;
        self.dict.word(id)
    }

    /// Surface form of label `lid`.
    pub fn label(&self, lid: usize) -> Result<String> {
        self.ensure_open()?;
        self.dict.label(lid)
    }

    /// Subword ids of `word`.
    pub fn subword_ids(&self, word: &str) -> Result<Vec<usize>> {
        self.ensure_open()?;
        self.dict.subword_ids(word)
    }
}
