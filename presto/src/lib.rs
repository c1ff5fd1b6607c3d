//! Presto: a read-only predictor for supervised text-classification and
//! word-embedding models in binary format versions 11 and 12.
//!
//! A model is loaded either from its single binary file or, for large
//! models, from a memory-mapped directory produced by
//! [`Predictor::save_as_memory_mapped`]. A loaded handle answers top-k
//! label prediction, word/sentence/n-gram vector lookup, and
//! nearest-neighbour and analogy queries.
#![deny(missing_docs)]

#[cfg(target_pointer_width = "16")]
compile_error!("`target_pointer_width` must be larger than or equal to 32");

pub mod args;
pub mod common;
pub mod dictionary;
pub mod errors;
pub mod io;
pub mod matrix;
pub mod mmap;
pub mod model;
pub mod predictor;
pub mod quant;


pub use args::{Args, Loss, ModelKind};
pub use errors::{PrestoError, Result};
pub use predictor::{Prediction, Predictor};
