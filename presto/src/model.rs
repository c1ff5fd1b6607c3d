//! Inference over the trained matrices: hidden-layer averaging, softmax and
//! hierarchical-softmax scoring, and bounded top-k selection.

use std::sync::Arc;

use crate::args::Loss;
use crate::common::NEGATIVE_TABLE_SIZE;
use crate::errors::{PrestoError, Result};
use crate::matrix::{Matrix, MmapMatrix};
use crate::quant::{MmapQMatrix, QMatrix};

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: f32 = 8.0;
const LOG_TABLE_SIZE: usize = 512;

/// Count assigned to unbuilt internal tree nodes.
const HUFFMAN_INFINITY: i64 = 1_000_000_000_000_000;

/// Input embedding matrix, in any of its four representations.
pub enum InputMatrix {
    /// Heap-resident dense rows.
    Dense(Matrix),
    /// Heap-resident quantized rows.
    Quantized(QMatrix),
    /// Dense rows behind a memory map.
    MappedDense(MmapMatrix),
    /// Quantized rows behind a memory map.
    MappedQuantized(MmapQMatrix),
}

impl InputMatrix {
    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        match self {
            Self::Dense(m) => m.num_rows(),
            Self::Quantized(m) => m.num_rows(),
            Self::MappedDense(m) => m.num_rows(),
            Self::MappedQuantized(m) => m.num_rows(),
        }
    }

    /// Number of columns (the embedding dimension).
    pub fn num_cols(&self) -> usize {
        match self {
            Self::Dense(m) => m.num_cols(),
            Self::Quantized(m) => m.num_cols(),
            Self::MappedDense(m) => m.num_cols(),
            Self::MappedQuantized(m) => m.num_cols(),
        }
    }

    /// True for the quantized representations.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_) | Self::MappedQuantized(_))
    }

    /// Releases any mapping behind this matrix.
    pub fn close(&self) {
        match self {
            Self::MappedDense(m) => m.close(),
            Self::MappedQuantized(m) => m.close(),
            Self::Dense(_) | Self::Quantized(_) => {}
        }
    }

    /// `x += row(i)`.
    #[inline]
    pub fn add_row_to(&self, x: &mut [f32], i: usize) -> Result<()> {
        match self {
            Self::Dense(m) => {
                m.add_row_to(x, i, 1.0);
                Ok(())
            }
            Self::Quantized(m) => {
                m.add_row_to(x, i);
                Ok(())
            }
            Self::MappedDense(m) => m.add_row_to(x, i, 1.0),
            Self::MappedQuantized(m) => m.add_row_to(x, i),
        }
    }
}

/// Output matrix: dense, or quantized for fully-quantized models.
pub enum OutputMatrix {
    /// Dense rows.
    Dense(Matrix),
    /// Quantized rows.
    Quantized(QMatrix),
}

impl OutputMatrix {
    /// Number of rows (the number of output classes).
    pub fn num_rows(&self) -> usize {
        match self {
            Self::Dense(m) => m.num_rows(),
            Self::Quantized(m) => m.num_rows(),
        }
    }

    /// Dot product of row `i` with `v`.
    #[inline]
    pub fn dot_row(&self, v: &[f32], i: usize) -> f32 {
        match self {
            Self::Dense(m) => m.dot_row(v, i),
            Self::Quantized(m) => m.dot_row(v, i),
        }
    }
}

/// One scored class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scored {
    /// Log-probability of the class.
    pub score: f32,
    /// Class id.
    pub id: usize,
}

/// Bounded double-ended priority queue keeping the `k` highest scores.
///
/// Draining yields scores in descending order with ties broken by
/// insertion order.
pub(crate) struct KBestQueue {
    k: usize,
    items: Vec<(Scored, usize)>,
    next_seq: usize,
}

impl KBestQueue {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k + 1),
            next_seq: 0,
        }
    }

    /// Score of the current minimum, or `-inf` while below capacity.
    #[inline]
    pub fn min_score(&self) -> f32 {
        if self.items.len() < self.k {
            f32::NEG_INFINITY
        } else {
            self.items
                .iter()
                .map(|(s, _)| s.score)
                .fold(f32::INFINITY, f32::min)
        }
    }

    /// True when a candidate with `score` would be discarded.
    #[inline]
    pub fn rejects(&self, score: f32) -> bool {
        self.items.len() == self.k && score < self.min_score()
    }

    pub fn push(&mut self, scored: Scored) {
        if self.rejects(scored.score) {
            return;
        }
        self.items.push((scored, self.next_seq));
        self.next_seq += 1;
        if self.items.len() > self.k {
            // Evict the minimum; on score ties the latest insertion goes.
            let evict = self
                .items
                .iter()
                .enumerate()
                .min_by(|(_, (a, sa)), (_, (b, sb))| {
                    a.score.total_cmp(&b.score).then(sb.cmp(sa))
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.items.swap_remove(evict);
        }
    }

    /// Drains into a descending-ordered list.
    pub fn into_sorted(mut self) -> Vec<Scored> {
        self.items
            .sort_by(|(a, sa), (b, sb)| b.score.total_cmp(&a.score).then(sa.cmp(sb)));
        self.items.into_iter().map(|(s, _)| s).collect()
    }
}

struct HuffmanNode {
    parent: i32,
    left: i32,
    right: i32,
    count: i64,
    binary: bool,
}

/// Read-only per-model state shared between cloned handles.
///
/// `paths`, `codes`, and `negatives` are rebuilt at load so the model
/// carries the state the trainer left behind; only `tree` is walked at
/// predict time.
struct ModelShared {
    loss: Loss,
    osz: usize,
    tree: Vec<HuffmanNode>,
    #[allow(dead_code)]
    paths: Vec<Vec<usize>>,
    #[allow(dead_code)]
    codes: Vec<Vec<bool>>,
    #[allow(dead_code)]
    negatives: Vec<usize>,
    t_sigmoid: Vec<f32>,
    t_log: Vec<f32>,
}

/// Inference state over one input and one output matrix.
///
/// A model is single-writer: `hidden` and `output` are scratch reused
/// between calls. Cloning shares the matrices and lookup tables but gives
/// the clone its own scratch.
pub struct Model {
    input: Arc<InputMatrix>,
    output_matrix: Arc<OutputMatrix>,
    shared: Arc<ModelShared>,
    hidden: Vec<f32>,
    output: Vec<f32>,
    #[allow(dead_code)]
    grad: Vec<f32>,
}

impl Clone for Model {
    fn clone(&self) -> Self {
        Self {
            input: Arc::clone(&self.input),
            output_matrix: Arc::clone(&self.output_matrix),
            shared: Arc::clone(&self.shared),
            hidden: vec![0.0; self.hidden.len()],
            output: vec![0.0; self.output.len()],
            grad: vec![0.0; self.grad.len()],
        }
    }
}

impl Model {
    /// Builds the inference state, including the Huffman tree for
    /// hierarchical softmax or the sampling table for negative sampling.
    pub fn new(
        input: Arc<InputMatrix>,
        output_matrix: Arc<OutputMatrix>,
        loss: Loss,
        counts: &[i64],
    ) -> Self {
        let dim = input.num_cols();
        let osz = output_matrix.num_rows();
        let mut shared = ModelShared {
            loss,
            osz,
            tree: Vec::new(),
            paths: Vec::new(),
            codes: Vec::new(),
            negatives: Vec::new(),
            t_sigmoid: init_sigmoid_table(),
            t_log: init_log_table(),
        };
        match loss {
            Loss::Hs if !counts.is_empty() => shared.build_tree(counts),
            Loss::Ns => shared.build_negative_table(counts),
            _ => {}
        }
        Self {
            input,
            output_matrix,
            shared: Arc::new(shared),
            hidden: vec![0.0; dim],
            output: vec![0.0; osz],
            grad: vec![0.0; dim],
        }
    }

    /// Number of output classes.
    #[inline(always)]
    pub fn output_size(&self) -> usize {
        self.shared.osz
    }

    /// Averages the input rows of `input_ids` into the hidden vector.
    pub fn compute_hidden(&mut self, input_ids: &[usize]) -> Result<()> {
        self.hidden.iter_mut().for_each(|x| *x = 0.0);
        for &id in input_ids {
            self.input.add_row_to(&mut self.hidden, id)?;
        }
        if !input_ids.is_empty() {
            let inv = 1.0 / input_ids.len() as f32;
            self.hidden.iter_mut().for_each(|x| *x *= inv);
        }
        Ok(())
    }

    /// Top-`k` classes for the averaged `input_ids`, descending by
    /// log-probability, dropping classes with probability below `threshold`.
    pub fn predict(&mut self, input_ids: &[usize], k: usize, threshold: f32) -> Result<Vec<Scored>> {
        if k == 0 {
            return Err(PrestoError::invalid_argument("k", "must be positive"));
        }
        if input_ids.is_empty() || self.shared.osz == 0 {
            return Ok(Vec::new());
        }
        self.compute_hidden(input_ids)?;

        let mut heap = KBestQueue::new(k);
        if self.shared.loss == Loss::Hs {
            let root = 2 * self.shared.osz - 2;
            self.dfs(root, 0.0, threshold.ln(), &mut heap);
        } else {
            self.find_k_best(threshold, &mut heap);
        }
        Ok(heap
            .into_sorted()
            .into_iter()
            .filter(|s| s.score.exp() >= threshold)
            .collect())
    }

    /// Fills the output scratch with softmax probabilities of the current
    /// hidden vector.
    pub fn compute_output_softmax(&mut self) {
        for i in 0..self.shared.osz {
            self.output[i] = self.output_matrix.dot_row(&self.hidden, i);
        }
        let max = self.output.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut z = 0.0;
        for x in self.output.iter_mut() {
            *x = (*x - max).exp();
            z += *x;
        }
        for x in self.output.iter_mut() {
            *x /= z;
        }
    }

    fn find_k_best(&mut self, threshold: f32, heap: &mut KBestQueue) {
        self.compute_output_softmax();
        for i in 0..self.shared.osz {
            let p = self.output[i];
            if p < threshold {
                continue;
            }
            let score = self.shared.log(p);
            if heap.rejects(score) {
                continue;
            }
            heap.push(Scored { score, id: i });
        }
    }

    fn dfs(&self, node: usize, score: f32, log_threshold: f32, heap: &mut KBestQueue) {
        if score < log_threshold || heap.rejects(score) {
            return;
        }
        let n = &self.shared.tree[node];
        if n.left == -1 && n.right == -1 {
            heap.push(Scored { score, id: node });
            return;
        }
        let f = self
            .shared
            .sigmoid(self.output_matrix.dot_row(&self.hidden, node - self.shared.osz));
        self.dfs(
            n.left as usize,
            score + self.shared.log(1.0 - f),
            log_threshold,
            heap,
        );
        self.dfs(
            n.right as usize,
            score + self.shared.log(f),
            log_threshold,
            heap,
        );
    }

    #[cfg(test)]
    fn output_scratch(&self) -> &[f32] {
        &self.output
    }

    #[cfg(test)]
    fn shared(&self) -> &ModelShared {
        &self.shared
    }
}

impl ModelShared {
    /// Piecewise-constant sigmoid lookup, saturating outside `[-8, 8]`.
    #[inline]
    fn sigmoid(&self, x: f32) -> f32 {
        if x < -MAX_SIGMOID {
            0.0
        } else if x > MAX_SIGMOID {
            1.0
        } else {
            let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as f32 / MAX_SIGMOID / 2.0) as usize;
            self.t_sigmoid[i]
        }
    }

    /// Piecewise-constant natural-log lookup over `(0, 1]`, clamped to 0
    /// above 1.
    #[inline]
    fn log(&self, x: f32) -> f32 {
        if x > 1.0 {
            0.0
        } else {
            let i = (x * LOG_TABLE_SIZE as f32) as usize;
            self.t_log[i]
        }
    }

    /// Builds the Huffman coding tree over class `counts`.
    fn build_tree(&mut self, counts: &[i64]) {
        let osz = counts.len();
        debug_assert_eq!(osz, self.osz);
        let mut tree: Vec<HuffmanNode> = (0..2 * osz - 1)
            .map(|_| HuffmanNode {
                parent: -1,
                left: -1,
                right: -1,
                count: HUFFMAN_INFINITY,
                binary: false,
            })
            .collect();
        for (i, &c) in counts.iter().enumerate() {
            tree[i].count = c;
        }
        let mut leaf = osz as i64 - 1;
        let mut node = osz;
        for i in osz..2 * osz - 1 {
            let mut mini = [0usize; 2];
            for m in mini.iter_mut() {
                if leaf >= 0 && tree[leaf as usize].count < tree[node].count {
                    *m = leaf as usize;
                    leaf -= 1;
                } else {
                    *m = node;
                    node += 1;
                }
            }
            tree[i].left = mini[0] as i32;
            tree[i].right = mini[1] as i32;
            tree[i].count = tree[mini[0]].count + tree[mini[1]].count;
            tree[mini[0]].parent = i as i32;
            tree[mini[1]].parent = i as i32;
            tree[mini[1]].binary = true;
        }
        for i in 0..osz {
            let mut path = Vec::new();
            let mut code = Vec::new();
            let mut j = i;
            while tree[j].parent != -1 {
                path.push((tree[j].parent as usize) - osz);
                code.push(tree[j].binary);
                j = tree[j].parent as usize;
            }
            self.paths.push(path);
            self.codes.push(code);
        }
        self.tree = tree;
    }

    /// Builds the negative-sampling table from class `counts`.
    ///
    /// Not consulted at predict time; rebuilt so a loaded model carries the
    /// same state the trainer left behind.
    fn build_negative_table(&mut self, counts: &[i64]) {
        let z: f64 = counts.iter().map(|&c| (c as f64).sqrt()).sum();
        if z == 0.0 {
            return;
        }
        let mut negatives = Vec::with_capacity(NEGATIVE_TABLE_SIZE);
        for (i, &c) in counts.iter().enumerate() {
            let multiplicity = ((c as f64).sqrt() * NEGATIVE_TABLE_SIZE as f64 / z) as usize;
            for _ in 0..multiplicity {
                negatives.push(i);
            }
        }
        self.negatives = negatives;
    }
}

fn init_sigmoid_table() -> Vec<f32> {
    (0..=SIGMOID_TABLE_SIZE)
        .map(|i| {
            let x = (i as f64 * 2.0 * MAX_SIGMOID as f64) / SIGMOID_TABLE_SIZE as f64
                - MAX_SIGMOID as f64;
            (1.0 / (1.0 + (-x).exp())) as f32
        })
        .collect()
}

fn init_log_table() -> Vec<f32> {
    (0..=LOG_TABLE_SIZE)
        .map(|i| ((i as f64 + 1e-5) / LOG_TABLE_SIZE as f64).ln() as f32)
        .collect()
}
