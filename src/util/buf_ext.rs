use anyhow::bail;
use bytes::{Buf, BufMut};

//TODO extract to crate?

/// Strings on the wire are prefixed with their byte length as a u16. Everything we send this way
///  (server ids, rejection reasons) is short, and a fixed-width prefix keeps frames trivially
///  inspectable in a hex dump.
pub trait BufExt: Buf {
    fn try_get_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_u16()? as usize;
        if self.remaining() < len {
            bail!("buffer underflow: string of length {} with only {} bytes remaining", len, self.remaining());
        }
        let raw = self.copy_to_bytes(len);
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn try_get_bool(&mut self) -> anyhow::Result<bool> {
        match self.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => bail!("invalid value for a boolean: {}", b),
        }
    }
}

pub trait BufMutExt: BufMut {
    /// NB: callers are responsible for keeping strings below 64k - longer strings are truncated
    ///      at a char boundary rather than corrupting the frame
    fn put_string(&mut self, s: &str) {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.put_u16(len as u16);
        self.put_slice(&s.as_bytes()[..len]);
    }

    fn put_bool(&mut self, b: bool) {
        self.put_u8(if b { 1 } else { 0 });
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
