//! Little-endian binary readers and writers for the model formats.
//!
//! Two string encodings coexist: the single-file format stores strings as a
//! raw UTF-8 run terminated by `\0`, `' '`, or `'\n'`, while the mmap sidecar
//! files store a 4-byte length followed by the bytes.

use std::io::{ErrorKind, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::errors::{PrestoError, Result};

/// Reader of model fields in the native little-endian encoding.
pub struct ModelReader<R> {
    inner: R,
}

impl<R: Read> ModelReader<R> {
    /// Creates a new instance wrapping `inner`.
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Unwraps the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    #[inline]
    fn map_eof(e: std::io::Error, field: &'static str) -> PrestoError {
        if e.kind() == ErrorKind::UnexpectedEof {
            PrestoError::truncated(field)
        } else {
            PrestoError::StdIo(e)
        }
    }

    /// Reads one byte.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        self.inner.read_u8().map_err(|e| Self::map_eof(e, "u8"))
    }

    /// Reads a little-endian i32.
    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        self.inner
            .read_i32::<LittleEndian>()
            .map_err(|e| Self::map_eof(e, "i32"))
    }

    /// Reads a little-endian i64.
    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        self.inner
            .read_i64::<LittleEndian>()
            .map_err(|e| Self::map_eof(e, "i64"))
    }

    /// Reads a little-endian f32.
    #[inline]
    pub fn read_f32(&mut self) -> Result<f32> {
        self.inner
            .read_f32::<LittleEndian>()
            .map_err(|e| Self::map_eof(e, "f32"))
    }

    /// Reads a little-endian f64.
    #[inline]
    pub fn read_f64(&mut self) -> Result<f64> {
        self.inner
            .read_f64::<LittleEndian>()
            .map_err(|e| Self::map_eof(e, "f64"))
    }

    /// Reads one byte as a boolean.
    #[inline]
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Fills `dst` from the stream.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(dst)
            .map_err(|e| Self::map_eof(e, "bytes"))
    }

    /// Reads `len` f32 values into a vector.
    pub fn read_f32_vec(&mut self, len: usize) -> Result<Vec<f32>> {
        let mut data = vec![0f32; len];
        self.inner
            .read_f32_into::<LittleEndian>(&mut data)
            .map_err(|e| Self::map_eof(e, "f32 array"))?;
        Ok(data)
    }

    /// Reads a string terminated by `\0`, `' '`, or `'\n'`.
    ///
    /// The terminator is consumed and not included in the result.
    pub fn read_terminated_string(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self
                .inner
                .read_u8()
                .map_err(|e| Self::map_eof(e, "string"))?;
            if b == 0 || b == b' ' || b == b'\n' {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8(bytes)?)
    }

    /// Reads a 4-byte length followed by that many UTF-8 bytes.
    pub fn read_prefixed_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(PrestoError::invalid_model(format!(
                "negative string length: {len}"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.read_bytes(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Writer of model fields in the native little-endian encoding.
///
/// Keeps a running CRC32 and a count of emitted bytes so callers can report
/// or verify what was written.
pub struct ModelWriter<W> {
    inner: W,
    crc: Hasher,
    num_bytes: u64,
}

impl<W: Write> ModelWriter<W> {
    /// Creates a new instance wrapping `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            crc: Hasher::new(),
            num_bytes: 0,
        }
    }

    /// Number of bytes written so far.
    #[inline(always)]
    pub const fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// CRC32 of the bytes written so far.
    pub fn checksum(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// Flushes and unwraps the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }

    #[inline]
    fn account(&mut self, bytes: &[u8]) {
        self.crc.update(bytes);
        self.num_bytes += bytes.len() as u64;
    }

    /// Writes one byte.
    #[inline]
    pub fn write_u8(&mut self, x: u8) -> Result<()> {
        self.inner.write_u8(x)?;
        self.account(&[x]);
        Ok(())
    }

    /// Writes a little-endian i32.
    #[inline]
    pub fn write_i32(&mut self, x: i32) -> Result<()> {
        self.inner.write_i32::<LittleEndian>(x)?;
        self.account(&x.to_le_bytes());
        Ok(())
    }

    /// Writes a little-endian i64.
    #[inline]
    pub fn write_i64(&mut self, x: i64) -> Result<()> {
        self.inner.write_i64::<LittleEndian>(x)?;
        self.account(&x.to_le_bytes());
        Ok(())
    }

    /// Writes a little-endian f32.
    #[inline]
    pub fn write_f32(&mut self, x: f32) -> Result<()> {
        self.inner.write_f32::<LittleEndian>(x)?;
        self.account(&x.to_le_bytes());
        Ok(())
    }

    /// Writes a little-endian f64.
    #[inline]
    pub fn write_f64(&mut self, x: f64) -> Result<()> {
        self.inner.write_f64::<LittleEndian>(x)?;
        self.account(&x.to_le_bytes());
        Ok(())
    }

    /// Writes a boolean as one byte.
    #[inline]
    pub fn write_bool(&mut self, x: bool) -> Result<()> {
        self.write_u8(u8::from(x))
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.account(bytes);
        Ok(())
    }

    /// Writes the string bytes followed by a `\0` terminator.
    pub fn write_terminated_string(&mut self, s: &str) -> Result<()> {
        self.write_bytes(s.as_bytes())?;
        self.write_u8(0)
    }

    /// Writes a 4-byte length followed by the string bytes.
    pub fn write_prefixed_string(&mut self, s: &str) -> Result<()> {
        self.write_i32(i32::try_from(s.len()).map_err(|_| {
            PrestoError::invalid_argument("s", "string length must fit in an i32")
        })?)?;
        self.write_bytes(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut wtr = ModelWriter::new(Vec::new());
        wtr.write_i32(-7).unwrap();
        wtr.write_i64(1 << 40).unwrap();
        wtr.write_f32(0.25).unwrap();
        wtr.write_f64(-1.5).unwrap();
        wtr.write_bool(true).unwrap();
        let buf = wtr.finish().unwrap();
        assert_eq!(buf.len(), 4 + 8 + 4 + 8 + 1);

        let mut rdr = ModelReader::new(buf.as_slice());
        assert_eq!(rdr.read_i32().unwrap(), -7);
        assert_eq!(rdr.read_i64().unwrap(), 1 << 40);
        assert_eq!(rdr.read_f32().unwrap(), 0.25);
        assert_eq!(rdr.read_f64().unwrap(), -1.5);
        assert!(rdr.read_bool().unwrap());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut wtr = ModelWriter::new(Vec::new());
        wtr.write_i32(0x0403_0201).unwrap();
        let buf = wtr.finish().unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_terminated_string() {
        let mut rdr = ModelReader::new(&b"cat\0dog bird\n"[..]);
        assert_eq!(rdr.read_terminated_string().unwrap(), "cat");
        assert_eq!(rdr.read_terminated_string().unwrap(), "dog");
        assert_eq!(rdr.read_terminated_string().unwrap(), "bird");
    }

    #[test]
    fn test_terminated_string_writes_nul() {
        let mut wtr = ModelWriter::new(Vec::new());
        wtr.write_terminated_string("cat").unwrap();
        assert_eq!(wtr.finish().unwrap(), b"cat\0");
    }

    #[test]
    fn test_prefixed_string_roundtrip() {
        let mut wtr = ModelWriter::new(Vec::new());
        wtr.write_prefixed_string("東京").unwrap();
        let buf = wtr.finish().unwrap();
        assert_eq!(&buf[..4], &(6i32).to_le_bytes());

        let mut rdr = ModelReader::new(buf.as_slice());
        assert_eq!(rdr.read_prefixed_string().unwrap(), "東京");
    }

    #[test]
    fn test_truncated() {
        let mut rdr = ModelReader::new(&[0x01, 0x02][..]);
        match rdr.read_i32() {
            Err(PrestoError::Truncated(_)) => {}
            r => panic!("unexpected result: {r:?}"),
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let mut rdr = ModelReader::new(&[0xff, 0xfe, 0x00][..]);
        match rdr.read_terminated_string() {
            Err(PrestoError::InvalidUtf8(_)) => {}
            r => panic!("unexpected result: {r:?}"),
        }
    }

    #[test]
    fn test_checksum_and_count() {
        let mut wtr = ModelWriter::new(Vec::new());
        wtr.write_bytes(b"123456789").unwrap();
        assert_eq!(wtr.num_bytes(), 9);
        // Standard CRC32 check value.
        assert_eq!(wtr.checksum(), 0xCBF4_3926);
    }
}
