//! Bounds-checked reading of wire data.
//!
//! Every field extracted from received bytes goes through [`Decoder`];
//! there is no raw offset arithmetic anywhere above this module.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("field extends past the end of the received data")]
pub struct Truncated;

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        if self.remaining() < n {
            return Err(Truncated);
        }
        let span = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(span)
    }

    pub fn u8(&mut self) -> Result<u8, Truncated> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Truncated> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16, Truncated> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32, Truncated> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        self.take(n)
    }

    /// Length-prefixed byte array: a word-sized count, then that many bytes.
    pub fn prefixed_bytes(&mut self) -> Result<&'a [u8], Truncated> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Truncated> {
        self.take(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_scalars_in_order() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut d = Decoder::new(&data);
        assert_eq!(d.u8().unwrap(), 0x01);
        assert_eq!(d.u16().unwrap(), 0x0302);
        assert_eq!(d.u32().unwrap(), 0x07060504);
        assert!(d.is_empty());
    }

    #[test]
    fn refuses_to_read_past_the_end() {
        let mut d = Decoder::new(&[0xAA, 0xBB]);
        assert_eq!(d.u32(), Err(Truncated));
        // a failed read consumes nothing
        assert_eq!(d.u16().unwrap(), 0xBBAA);
    }

    #[test]
    fn prefixed_bytes_checks_declared_length() {
        let mut ok = Decoder::new(&[3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(ok.prefixed_bytes().unwrap(), b"abc");

        let mut short = Decoder::new(&[9, 0, 0, 0, b'a']);
        assert_eq!(short.prefixed_bytes(), Err(Truncated));
    }
}
