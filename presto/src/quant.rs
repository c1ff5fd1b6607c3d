//! Product-quantized matrices.
//!
//! Each row is compressed to one byte per sub-quantizer, indexing a codebook
//! of 256 centroids. An optional second quantizer stores per-row norms.

use std::io::{Read, Write};

use crate::errors::{PrestoError, Result};
use crate::io::{ModelReader, ModelWriter};
use crate::mmap::MappedFile;

/// Number of centroids per sub-quantizer; codes are single bytes.
pub const KSUB: usize = 256;

/// Codebooks of a product quantizer.
pub struct ProductQuantizer {
    dim: usize,
    nsubq: usize,
    dsub: usize,
    lastdsub: usize,
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// Creates a quantizer from its codebooks.
    ///
    /// # Panics
    ///
    /// Panics if `centroids.len() != dim * KSUB`.
    pub fn from_centroids(dim: usize, dsub: usize, centroids: Vec<f32>) -> Self {
        assert_eq!(centroids.len(), dim * KSUB);
        let nsubq = (dim + dsub - 1) / dsub;
        let lastdsub = (dim - 1) % dsub + 1;
        Self {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids,
        }
    }

    /// Number of sub-quantizers per row.
    #[inline(always)]
    pub const fn num_subquantizers(&self) -> usize {
        self.nsubq
    }

    /// Dimension covered by one full sub-quantizer.
    #[inline(always)]
    pub const fn dsub(&self) -> usize {
        self.dsub
    }

    /// Base offset of centroid `code` of sub-quantizer `m`.
    ///
    /// The final sub-quantizer packs its centroids with the short tail
    /// width, so its offsets follow a different formula.
    #[inline(always)]
    pub fn centroid_offset(&self, m: usize, code: u8) -> usize {
        debug_assert!(m < self.nsubq);
        let i = code as usize;
        if m == self.nsubq - 1 {
            m * KSUB * self.dsub + i * self.lastdsub
        } else {
            (m * KSUB + i) * self.dsub
        }
    }

    #[inline(always)]
    fn subq_len(&self, m: usize) -> usize {
        if m == self.nsubq - 1 {
            self.lastdsub
        } else {
            self.dsub
        }
    }

    /// First component of centroid `code` of a one-dimensional quantizer.
    #[inline(always)]
    pub fn centroid_value(&self, code: u8) -> f32 {
        self.centroids[self.centroid_offset(0, code)]
    }

    /// Dot product of `x` with the row decoded from `codes[row_start..]`,
    /// scaled by `alpha`.
    pub fn mul_code(&self, x: &[f32], codes: &[u8], row_start: usize, alpha: f32) -> f32 {
        debug_assert_eq!(x.len(), self.dim);
        let mut res = 0.0;
        for m in 0..self.nsubq {
            let c = self.centroid_offset(m, codes[row_start + m]);
            for n in 0..self.subq_len(m) {
                res += x[m * self.dsub + n] * self.centroids[c + n];
            }
        }
        res * alpha
    }

    /// `x += alpha * row` for the row decoded from `codes[row_start..]`.
    pub fn add_code(&self, x: &mut [f32], codes: &[u8], row_start: usize, alpha: f32) {
        debug_assert_eq!(x.len(), self.dim);
        for m in 0..self.nsubq {
            let c = self.centroid_offset(m, codes[row_start + m]);
            for n in 0..self.subq_len(m) {
                x[m * self.dsub + n] += alpha * self.centroids[c + n];
            }
        }
    }

    /// Reads `dim:i32, nsubq:i32, dsub:i32, lastdsub:i32, centroids`.
    pub fn read<R: Read>(rdr: &mut ModelReader<R>) -> Result<Self> {
        let dim = rdr.read_i32()?;
        let nsubq = rdr.read_i32()?;
        let dsub = rdr.read_i32()?;
        let lastdsub = rdr.read_i32()?;
        if dim <= 0 || nsubq <= 0 || dsub <= 0 || lastdsub <= 0 {
            return Err(PrestoError::invalid_model(format!(
                "invalid quantizer shape: dim={dim} nsubq={nsubq} dsub={dsub} lastdsub={lastdsub}"
            )));
        }
        let dim = dim as usize;
        let centroids = rdr.read_f32_vec(dim * KSUB)?;
        Ok(Self {
            dim,
            nsubq: nsubq as usize,
            dsub: dsub as usize,
            lastdsub: lastdsub as usize,
            centroids,
        })
    }

    /// Writes `dim:i32, nsubq:i32, dsub:i32, lastdsub:i32, centroids`.
    pub fn write<W: Write>(&self, wtr: &mut ModelWriter<W>) -> Result<()> {
        wtr.write_i32(self.dim as i32)?;
        wtr.write_i32(self.nsubq as i32)?;
        wtr.write_i32(self.dsub as i32)?;
        wtr.write_i32(self.lastdsub as i32)?;
        for &x in &self.centroids {
            wtr.write_f32(x)?;
        }
        Ok(())
    }

    fn read_from_cursor(cursor: &mut crate::mmap::MmapCursor) -> Result<Self> {
        let dim = cursor.read_i32()?;
        let nsubq = cursor.read_i32()?;
        let dsub = cursor.read_i32()?;
        let lastdsub = cursor.read_i32()?;
        if dim <= 0 || nsubq <= 0 || dsub <= 0 || lastdsub <= 0 {
            return Err(PrestoError::invalid_model(format!(
                "invalid quantizer shape: dim={dim} nsubq={nsubq} dsub={dsub} lastdsub={lastdsub}"
            )));
        }
        let dim = dim as usize;
        let mut centroids = vec![0f32; dim * KSUB];
        for x in centroids.iter_mut() {
            *x = cursor.read_f32()?;
        }
        Ok(Self {
            dim,
            nsubq: nsubq as usize,
            dsub: dsub as usize,
            lastdsub: lastdsub as usize,
            centroids,
        })
    }
}

/// Matrix whose rows are product-quantized codes.
pub struct QMatrix {
    qnorm: bool,
    m: usize,
    n: usize,
    codes: Vec<u8>,
    pq: ProductQuantizer,
    norm_codes: Vec<u8>,
    npq: Option<ProductQuantizer>,
}

impl QMatrix {
    /// Assembles a quantized matrix from its parts.
    pub fn new(
        m: usize,
        n: usize,
        codes: Vec<u8>,
        pq: ProductQuantizer,
        norms: Option<(Vec<u8>, ProductQuantizer)>,
    ) -> Self {
        assert_eq!(codes.len(), m * pq.nsubq);
        let (qnorm, norm_codes, npq) = match norms {
            Some((norm_codes, npq)) => {
                assert_eq!(norm_codes.len(), m);
                (true, norm_codes, Some(npq))
            }
            None => (false, Vec::new(), None),
        };
        Self {
            qnorm,
            m,
            n,
            codes,
            pq,
            norm_codes,
            npq,
        }
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
    fn alpha(&self, i: usize) -> f32 {
        if self.qnorm {
            // Safe: npq is always present when qnorm is set.
            self.npq
                .as_ref()
                .map(|npq| npq.centroid_value(self.norm_codes[i]))
                .unwrap_or(1.0)
        } else {
            1.0
        }
    }

    /// Dot product of row `i` with `v`.
    #[inline]
    pub fn dot_row(&self, v: &[f32], i: usize) -> f32 {
        debug_assert!(i < self.m);
        self.pq
            .mul_code(v, &self.codes, i * self.pq.nsubq, self.alpha(i))
    }

    /// `x += row(i)`.
    #[inline]
    pub fn add_row_to(&self, x: &mut [f32], i: usize) {
        debug_assert!(i < self.m);
        self.pq
            .add_code(x, &self.codes, i * self.pq.nsubq, self.alpha(i));
    }

    /// Reads the serialized layout described in the format contract.
    pub fn read<R: Read>(rdr: &mut ModelReader<R>) -> Result<Self> {
        let qnorm = rdr.read_bool()?;
        let m = rdr.read_i64()?;
        let n = rdr.read_i64()?;
        let code_size = rdr.read_i32()?;
        if m < 0 || n < 0 || code_size < 0 {
            return Err(PrestoError::invalid_model(format!(
                "invalid quantized matrix shape: ({m}, {n}), code_size={code_size}"
            )));
        }
        let mut codes = vec![0u8; code_size as usize];
        rdr.read_bytes(&mut codes)?;
        let pq = ProductQuantizer::read(rdr)?;
        let (norm_codes, npq) = if qnorm {
            let mut norm_codes = vec![0u8; m as usize];
            rdr.read_bytes(&mut norm_codes)?;
            (norm_codes, Some(ProductQuantizer::read(rdr)?))
        } else {
            (Vec::new(), None)
        };
        Ok(Self {
            qnorm,
            m: m as usize,
            n: n as usize,
            codes,
            pq,
            norm_codes,
            npq,
        })
    }

    /// Writes the serialized layout described in the format contract.
    pub fn write<W: Write>(&self, wtr: &mut ModelWriter<W>) -> Result<()> {
        wtr.write_bool(self.qnorm)?;
        wtr.write_i64(self.m as i64)?;
        wtr.write_i64(self.n as i64)?;
        wtr.write_i32(self.codes.len() as i32)?;
        wtr.write_bytes(&self.codes)?;
        self.pq.write(wtr)?;
        if self.qnorm {
            wtr.write_bytes(&self.norm_codes)?;
            if let Some(npq) = self.npq.as_ref() {
                npq.write(wtr)?;
            }
        }
        Ok(())
    }
}

/// Quantized matrix whose code bytes stay behind a memory map.
///
/// The codebooks are small and are decoded into memory at open; only the
/// per-row codes are fetched from the mapping on demand.
pub struct MmapQMatrix {
    file: MappedFile,
    m: usize,
    n: usize,
    codes_offset: u64,
    norm_codes_offset: u64,
    qnorm: bool,
    pq: ProductQuantizer,
    npq: Option<ProductQuantizer>,
}

impl MmapQMatrix {
    /// Opens a quantized matrix stored at the head of `file`.
    pub fn open(file: MappedFile) -> Result<Self> {
        let mut cursor = file.cursor();
        let qnorm = cursor.read_u8()? != 0;
        let m = cursor.read_i64()?;
        let n = cursor.read_i64()?;
        let code_size = cursor.read_i32()?;
        if m < 0 || n < 0 || code_size < 0 {
            return Err(PrestoError::invalid_model(format!(
                "invalid quantized matrix shape: ({m}, {n}), code_size={code_size}"
            )));
        }
        let codes_offset = cursor.position();
        cursor.seek(codes_offset + code_size as u64);
        let pq = ProductQuantizer::read_from_cursor(&mut cursor)?;
        let (norm_codes_offset, npq) = if qnorm {
            let off = cursor.position();
            cursor.seek(off + m as u64);
            (off, Some(ProductQuantizer::read_from_cursor(&mut cursor)?))
        } else {
            (0, None)
        };
        Ok(Self {
            file,
            m: m as usize,
            n: n as usize,
            codes_offset,
            norm_codes_offset,
            qnorm,
            pq,
            npq,
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

    fn row_codes(&self, i: usize) -> Result<Vec<u8>> {
        debug_assert!(i < self.m);
        let nsubq = self.pq.num_subquantizers();
        let mut codes = vec![0u8; nsubq];
        self.file
            .bytes_at(self.codes_offset + (i * nsubq) as u64, &mut codes)?;
        Ok(codes)
    }

    fn alpha(&self, i: usize) -> Result<f32> {
        if self.qnorm {
            let code = self.file.u8_at(self.norm_codes_offset + i as u64)?;
            Ok(self
                .npq
                .as_ref()
                .map(|npq| npq.centroid_value(code))
                .unwrap_or(1.0))
        } else {
            Ok(1.0)
        }
    }

    /// Dot product of row `i` with `v`.
    pub fn dot_row(&self, v: &[f32], i: usize) -> Result<f32> {
        let codes = self.row_codes(i)?;
        let alpha = self.alpha(i)?;
        Ok(self.pq.mul_code(v, &codes, 0, alpha))
    }

    /// `x += row(i)`.
    pub fn add_row_to(&self, x: &mut [f32], i: usize) -> Result<()> {
        let codes = self.row_codes(i)?;
        let alpha = self.alpha(i)?;
        self.pq.add_code(x, &codes, 0, alpha);
        Ok(())
    }
}
