//! XDR primitives (RFC 4506): big-endian 4-byte units, opaque data padded to 4.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Default)]
pub(crate) struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub(crate) fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub(crate) fn fixed_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
        self
    }

    pub(crate) fn opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.fixed_opaque(data)
    }

    pub(crate) fn string(&mut self, s: &str) -> &mut Self {
        self.opaque(s.as_bytes())
    }

    pub(crate) fn bytes(&mut self, raw: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(raw);
        self
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn finish(self) -> BytesMut {
        self.buf
    }
}

pub(crate) struct XdrReader<'a> {
    buf: &'a [u8],
}

impl<'a> XdrReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(Error::Protocol("truncated xdr integer"));
        }
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(Error::Protocol("truncated xdr integer"));
        }
        Ok(self.buf.get_i32())
    }

    pub(crate) fn fixed_opaque(&mut self, len: usize) -> Result<&'a [u8]> {
        let padded = len + padding(len);
        if self.buf.remaining() < padded {
            return Err(Error::Protocol("truncated xdr opaque"));
        }
        let data = &self.buf[..len];
        self.buf = &self.buf[padded..];
        Ok(data)
    }

    pub(crate) fn opaque(&mut self, max: usize) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(Error::Protocol("xdr opaque exceeds limit"));
        }
        self.fixed_opaque(len)
    }

    pub(crate) fn string(&mut self, max: usize) -> Result<String> {
        let raw = self.opaque(max)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("xdr string is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_data_is_padded_to_four_bytes() {
        let mut w = XdrWriter::new();
        w.string("abcde").u32(7);
        let wire = w.finish();
        assert_eq!(
            &wire[..],
            &[0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0, 0, 0, 0, 7]
        );

        let mut r = XdrReader::new(&wire);
        assert_eq!(r.string(255).expect("string"), "abcde");
        assert_eq!(r.u32().expect("u32"), 7);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn limits_and_truncation_are_checked() {
        let mut w = XdrWriter::new();
        w.opaque(&[1, 2, 3, 4, 5, 6]);
        let wire = w.finish();
        assert!(XdrReader::new(&wire).opaque(4).is_err());
        assert!(XdrReader::new(&wire[..8]).opaque(16).is_err());
        assert!(XdrReader::new(&[0, 0]).i32().is_err());
    }
}
