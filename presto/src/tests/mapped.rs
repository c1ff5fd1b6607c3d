use std::sync::Arc;

use crate::args::{Args, Loss, ModelKind};
use crate::common::{MODEL_MAGIC, MODEL_VERSION};
use crate::dictionary::{EntryType, MemDictionary};
use crate::errors::PrestoError;
use crate::io::ModelWriter;
use crate::matrix::Matrix;
use crate::predictor::Predictor;
use crate::quant::{ProductQuantizer, QMatrix, KSUB};

const BUCKET: usize = 1000;

fn sample_args() -> Args {
    Args {
        dim: 4,
        loss: Loss::Softmax,
        model: ModelKind::Supervised,
        minn: 2,
        maxn: 3,
        word_ngrams: 2,
        bucket: BUCKET as i32,
        ..Args::default()
    }
}

fn sample_entries() -> Vec<(String, i64, EntryType)> {
    vec![
        ("cat".to_string(), 10, EntryType::Word),
        ("dog".to_string(), 7, EntryType::Word),
        ("bird".to_string(), 3, EntryType::Word),
        ("</s>".to_string(), 5, EntryType::Word),
        ("__label__animal".to_string(), 12, EntryType::Label),
        ("__label__pet".to_string(), 8, EntryType::Label),
    ]
}

fn input_data(rows: usize, dim: usize) -> Vec<f32> {
    (0..rows * dim)
        .map(|k| ((k * 31 + 7) % 17) as f32 / 17.0 - 0.5)
        .collect()
}

fn build_dense_model_bytes(args: &Args) -> Vec<u8> {
    let dict =
        MemDictionary::from_entries(Arc::new(args.clone()), sample_entries(), 45, None).unwrap();
    let rows = 4 + BUCKET;
    let mut wtr = ModelWriter::new(Vec::new());
    wtr.write_i32(MODEL_MAGIC).unwrap();
    wtr.write_i32(MODEL_VERSION).unwrap();
    args.write(&mut wtr).unwrap();
    dict.write(&mut wtr).unwrap();
    wtr.write_bool(false).unwrap();
    Matrix::from_data(input_data(rows, 4), rows, 4)
        .write(&mut wtr)
        .unwrap();
    wtr.write_bool(false).unwrap();
    Matrix::from_data(input_data(2, 4), 2, 4)
        .write(&mut wtr)
        .unwrap();
    wtr.finish().unwrap()
}

fn build_quantized_model_bytes(args: &Args) -> Vec<u8> {
    let dict =
        MemDictionary::from_entries(Arc::new(args.clone()), sample_entries(), 45, None).unwrap();
    let rows = 4 + BUCKET;
    let centroids: Vec<f32> = (0..4 * KSUB).map(|k| (k % 64) as f32 / 64.0 - 0.5).collect();
    let pq = ProductQuantizer::from_centroids(4, 2, centroids);
    let codes: Vec<u8> = (0..rows * 2).map(|k| (k * 13 % 251) as u8).collect();
    let qmat = QMatrix::new(rows, 4, codes, pq, None);

    let mut wtr = ModelWriter::new(Vec::new());
    wtr.write_i32(MODEL_MAGIC).unwrap();
    wtr.write_i32(MODEL_VERSION).unwrap();
    args.write(&mut wtr).unwrap();
    dict.write(&mut wtr).unwrap();
    wtr.write_bool(true).unwrap();
    qmat.write(&mut wtr).unwrap();
    wtr.write_bool(false).unwrap();
    Matrix::from_data(input_data(2, 4), 2, 4)
        .write(&mut wtr)
        .unwrap();
    wtr.finish().unwrap()
}

fn convert(bytes: &[u8]) -> (Predictor, tempfile::TempDir) {
    let native = Predictor::load_from_reader(bytes).unwrap();
    let dir = tempfile::tempdir().unwrap();
    native.save_as_memory_mapped(dir.path()).unwrap();
    let mapped = Predictor::load_memory_mapped(dir.path(), false).unwrap();
    (mapped, dir)
}

#[test]
fn word_id_parity_over_vocabulary_and_oov() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    let (mapped, _dir) = convert(&bytes);

    for (word, _, _) in sample_entries() {
        assert_eq!(
            mapped.word_id(&word).unwrap(),
            native.word_id(&word).unwrap(),
            "word {word:?}"
        );
    }
    for i in 0..1000 {
        let word = format!("oov{i}");
        assert_eq!(
            mapped.word_id(&word).unwrap(),
            native.word_id(&word).unwrap(),
            "word {word:?}"
        );
    }
}

#[test]
fn dictionary_parity() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    let (mapped, _dir) = convert(&bytes);

    assert_eq!(mapped.num_words(), native.num_words());
    assert_eq!(mapped.num_labels(), native.num_labels());
    for id in 0..native.num_words() + native.num_labels() {
        assert_eq!(mapped.word(id).unwrap(), native.word(id).unwrap());
    }
    for word in ["cat", "dog", "bird", "fish", "catfish"] {
        assert_eq!(
            mapped.subword_ids(word).unwrap(),
            native.subword_ids(word).unwrap(),
            "subwords of {word:?}"
        );
    }
}

#[test]
fn predict_parity_dense() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let mut native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    let (mut mapped, _dir) = convert(&bytes);
    assert!(!mapped.is_quantized());

    for text in ["cat dog", "bird", "fish swims", "cat dog bird cat"] {
        let a = native.predict(text, 2, 0.0).unwrap();
        let b = mapped.predict(text, 2, 0.0).unwrap();
        assert_eq!(a.len(), b.len(), "text {text:?}");
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.label, y.label);
            assert!((x.prob - y.prob).abs() < 1e-6);
        }
    }
}

#[test]
fn word_vector_parity() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    let (mapped, _dir) = convert(&bytes);

    for word in ["cat", "dog", "fish", "catfish"] {
        let a = native.word_vector(word).unwrap();
        let b = mapped.word_vector(word).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6, "vector of {word:?}");
        }
    }
}

#[test]
fn predict_parity_quantized() {
    let args = sample_args();
    let bytes = build_quantized_model_bytes(&args);
    let mut native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    assert!(native.is_quantized());
    let (mut mapped, _dir) = convert(&bytes);
    assert!(mapped.is_quantized());

    for text in ["cat dog", "bird", "fish swims"] {
        let a = native.predict(text, 2, 0.0).unwrap();
        let b = mapped.predict(text, 2, 0.0).unwrap();
        assert_eq!(a.len(), b.len(), "text {text:?}");
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.label, y.label);
            assert!((x.prob - y.prob).abs() < 1e-6);
        }
    }
}

#[test]
fn quantized_model_roundtrips_byte_exact() {
    let args = sample_args();
    let bytes = build_quantized_model_bytes(&args);
    let native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    let mut wtr = ModelWriter::new(Vec::new());
    native.save_to_writer(&mut wtr).unwrap();
    assert_eq!(wtr.finish().unwrap(), bytes);
}

#[test]
fn nearest_neighbour_parity() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let native = Predictor::load_from_reader(bytes.as_slice()).unwrap();
    let (mapped, _dir) = convert(&bytes);

    let a = native.nn("cat", 3).unwrap();
    let b = mapped.nn("cat", 3).unwrap();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.0, y.0);
        assert!((x.1 - y.1).abs() < 1e-5);
    }
}

#[test]
fn close_releases_mapped_model() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let (mut mapped, _dir) = convert(&bytes);
    mapped.close();
    assert!(matches!(
        mapped.predict("cat", 1, 0.0),
        Err(PrestoError::AlreadyClosed)
    ));
}

#[test]
fn mmap_handle_cannot_save_single_file() {
    let args = sample_args();
    let bytes = build_dense_model_bytes(&args);
    let (mapped, dir) = convert(&bytes);
    let mut wtr = ModelWriter::new(Vec::new());
    assert!(matches!(
        mapped.save_to_writer(&mut wtr),
        Err(PrestoError::InvalidArgument(_))
    ));
    drop(dir);
}
