//! Dense row-major matrices, on the heap or behind a memory map.

use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{PrestoError, Result};
use crate::io::{ModelReader, ModelWriter};
use crate::mmap::MappedFile;

/// Row-major dense f32 matrix.
pub struct Matrix {
    data: Vec<f32>,
    m: usize,
    n: usize,
}

impl Matrix {
    /// Creates a zeroed matrix of shape `(m, n)`.
    pub fn zeros(m: usize, n: usize) -> Self {
        Self {
            data: vec![0.0; m * n],
            m,
            n,
        }
    }

    /// Creates a matrix from row-major data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != m * n`.
    pub fn from_data(data: Vec<f32>, m: usize, n: usize) -> Self {
        assert_eq!(data.len(), m * n);
        Self { data, m, n }
    }

    /// Creates a matrix with entries drawn uniformly from `[-bound, bound)`,
    /// using an independent PRNG seeded at 1.
    pub fn uniform(m: usize, n: usize, bound: f32) -> Self {
        let mut rng = StdRng::seed_from_u64(1);
        let data = (0..m * n).map(|_| rng.gen_range(-bound..bound)).collect();
        Self { data, m, n }
    }

    /// Number of rows.
    #[inline(always)]
    pub const fn num_rows(&self) -> usize {
        self.m
    }

    /// Number of columns.
    #[inline(always)]
    pub const fn num_cols(&self) -> usize {
        self.n
    }

    #[inline(always)]
    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.m);
        debug_assert!(j < self.n);
        i * self.n + j
    }

    /// Value at `(i, j)`.
    #[inline(always)]
    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.data[self.index(i, j)]
    }

    /// Row `i` as a slice.
    #[inline(always)]
    pub fn row(&self, i: usize) -> &[f32] {
        debug_assert!(i < self.m);
        &self.data[i * self.n..(i + 1) * self.n]
    }

    /// Dot product of row `i` with `v`.
    #[inline]
    pub fn dot_row(&self, v: &[f32], i: usize) -> f32 {
        debug_assert_eq!(v.len(), self.n);
        self.row(i).iter().zip(v).map(|(a, b)| a * b).sum()
    }

    /// `x += a * row(i)`.
    #[inline]
    pub fn add_row_to(&self, x: &mut [f32], i: usize, a: f32) {
        debug_assert_eq!(x.len(), self.n);
        for (dst, src) in x.iter_mut().zip(self.row(i)) {
            *dst += a * src;
        }
    }

    /// `row(i) += a * v`.
    pub fn add_vector_to_row(&mut self, v: &[f32], i: usize, a: f32) {
        debug_assert_eq!(v.len(), self.n);
        let row = &mut self.data[i * self.n..(i + 1) * self.n];
        for (dst, src) in row.iter_mut().zip(v) {
            *dst += a * src;
        }
    }

    /// Multiplies each row in `[ib, ie)` by the corresponding scalar.
    pub fn multiply_rows(&mut self, nums: &[f32], ib: usize, ie: usize) {
        debug_assert!(ie <= self.m);
        debug_assert_eq!(nums.len(), ie - ib);
        for (i, &num) in (ib..ie).zip(nums) {
            for j in 0..self.n {
                self.data[i * self.n + j] *= num;
            }
        }
    }

    /// Divides each row in `[ib, ie)` by the corresponding scalar.
    /// Rows with a zero divisor are left untouched.
    pub fn divide_rows(&mut self, denoms: &[f32], ib: usize, ie: usize) {
        debug_assert!(ie <= self.m);
        debug_assert_eq!(denoms.len(), ie - ib);
        for (i, &denom) in (ib..ie).zip(denoms) {
            if denom != 0.0 {
                for j in 0..self.n {
                    self.data[i * self.n + j] /= denom;
                }
            }
        }
    }

    /// L2 norm of row `i`.
    #[inline]
    pub fn l2_norm_row(&self, i: usize) -> f32 {
        self.row(i).iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Reads `m:i64, n:i64, m*n x f32`.
    pub fn read<R: Read>(rdr: &mut ModelReader<R>) -> Result<Self> {
        let m = rdr.read_i64()?;
        let n = rdr.read_i64()?;
        if m < 0 || n < 0 {
            return Err(PrestoError::invalid_model(format!(
                "invalid matrix shape: ({m}, {n})"
            )));
        }
        let (m, n) = (m as usize, n as usize);
        let data = rdr.read_f32_vec(m * n)?;
        Ok(Self { data, m, n })
    }

    /// Writes `m:i64, n:i64, m*n x f32`.
    pub fn write<W: Write>(&self, wtr: &mut ModelWriter<W>) -> Result<()> {
        wtr.write_i64(self.m as i64)?;
        wtr.write_i64(self.n as i64)?;
        for &x in &self.data {
            wtr.write_f32(x)?;
        }
        Ok(())
    }
}

/// Dense matrix read in place from a mapped file.
///
/// Layout: `m:i64, n:i64` followed by `m*n` f32 values, so the element
/// `(i, j)` lives at byte offset `16 + (i*n + j) * 4`.
#[derive(Clone)]
pub struct MmapMatrix {
    file: MappedFile,
    m: usize,
    n: usize,
}

impl MmapMatrix {
    const HEADER_BYTES: u64 = 16;

    /// Opens a matrix stored at the head of `file`.
    pub fn open(file: MappedFile) -> Result<Self> {
        let m = file.i64_at(0)?;
        let n = file.i64_at(8)?;
        if m < 0 || n < 0 {
            return Err(PrestoError::invalid_model(format!(
                "invalid matrix shape: ({m}, {n})"
            )));
        }
        Ok(Self {
            file,
            m: m as usize,
            n: n as usize,
        })
    }

    /// Number of rows.
    #[inline(always)]
    pub const fn num_rows(&self) -> usize {
        self.m
    }

    /// Number of columns.
    #[inline(always)]
    pub const fn num_cols(&self) -> usize {
        self.n
    }

    /// Marks the underlying mapping closed.
    pub fn close(&self) {
        self.file.close();
    }

    #[inline(always)]
    fn element_offset(&self, i: usize, j: usize) -> u64 {
        debug_assert!(i < self.m);
        debug_assert!(j < self.n);
        Self::HEADER_BYTES + ((i * self.n + j) as u64) * 4
    }

    /// Value at `(i, j)`.
    #[inline]
    pub fn at(&self, i: usize, j: usize) -> Result<f32> {
        self.file.f32_at(self.element_offset(i, j))
    }

    /// Dot product of row `i` with `v`.
    pub fn dot_row(&self, v: &[f32], i: usize) -> Result<f32> {
        debug_assert_eq!(v.len(), self.n);
        let mut res = 0.0;
        let mut buf = [0u8; 4];
        let base = self.element_offset(i, 0);
        for (j, x) in v.iter().enumerate() {
            self.file.bytes_at(base + (j as u64) * 4, &mut buf)?;
            res += x * f32::from_le_bytes(buf);
        }
        Ok(res)
    }

    /// `x += a * row(i)`.
    pub fn add_row_to(&self, x: &mut [f32], i: usize, a: f32) -> Result<()> {
        debug_assert_eq!(x.len(), self.n);
        let mut buf = [0u8; 4];
        let base = self.element_offset(i, 0);
        for (j, dst) in x.iter_mut().enumerate() {
            self.file.bytes_at(base + (j as u64) * 4, &mut buf)?;
            *dst += a * f32::from_le_bytes(buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_and_row() {
        let mat = Matrix::from_data(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(mat.at(0, 2), 3.0);
        assert_eq!(mat.at(1, 0), 4.0);
        assert_eq!(mat.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_dot_row() {
        let mat = Matrix::from_data(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        assert_eq!(mat.dot_row(&[1.0, 0.5], 0), 2.0);
        assert_eq!(mat.dot_row(&[1.0, 0.5], 1), 5.0);
    }

    #[test]
    fn test_add_row_to() {
        let mat = Matrix::from_data(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        let mut x = vec![1.0, 1.0];
        mat.add_row_to(&mut x, 1, 2.0);
        assert_eq!(x, vec![7.0, 9.0]);
    }

    #[test]
    fn test_l2_norm_row() {
        let mat = Matrix::from_data(vec![3.0, 4.0], 1, 2);
        assert_eq!(mat.l2_norm_row(0), 5.0);
    }

    #[test]
    fn test_divide_rows_skips_zero() {
        let mut mat = Matrix::from_data(vec![2.0, 4.0, 6.0, 8.0], 2, 2);
        mat.divide_rows(&[2.0, 0.0], 0, 2);
        assert_eq!(mat.row(0), &[1.0, 2.0]);
        assert_eq!(mat.row(1), &[6.0, 8.0]);
    }

    #[test]
    fn test_uniform_is_deterministic() {
        let a = Matrix::uniform(3, 4, 0.25);
        let b = Matrix::uniform(3, 4, 0.25);
        for i in 0..3 {
            assert_eq!(a.row(i), b.row(i));
            for j in 0..4 {
                assert!(a.at(i, j) >= -0.25 && a.at(i, j) < 0.25);
            }
        }
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mat = Matrix::from_data(vec![0.5, -1.5, 2.0, 0.0, 3.25, -4.0], 3, 2);
        let mut wtr = ModelWriter::new(Vec::new());
        mat.write(&mut wtr).unwrap();
        let buf = wtr.finish().unwrap();
        assert_eq!(buf.len(), 16 + 6 * 4);

        let mut rdr = ModelReader::new(buf.as_slice());
        let decoded = Matrix::read(&mut rdr).unwrap();
        assert_eq!(decoded.num_rows(), 3);
        assert_eq!(decoded.num_cols(), 2);
        for i in 0..3 {
            assert_eq!(decoded.row(i), mat.row(i));
        }
    }
}
