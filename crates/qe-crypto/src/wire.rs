//! Fixed-layout byte framing for payload blobs.

use qe_core::{QeError, QeResult};
use uuid::Uuid;

use crate::KEY_SIZE;

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn uuid(&mut self, id: &Uuid) -> &mut Self {
        self.buf.extend_from_slice(id.as_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// `[u32 LE length][bytes]`
    pub fn prefixed(&mut self, b: &[u8]) -> QeResult<&mut Self> {
        let len = u32::try_from(b.len())
            .map_err(|_| QeError::invalid(format!("field too large to frame: {} bytes", b.len())))?;
        Ok(self.u32(len).bytes(b))
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    pub fn take(&mut self, n: usize) -> QeResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(QeError::invalid(format!(
                "truncated {}: need {n} more bytes, have {}",
                self.what,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> QeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> QeResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> QeResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn uuid(&mut self) -> QeResult<Uuid> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    pub fn token(&mut self) -> QeResult<[u8; KEY_SIZE]> {
        self.array()
    }

    pub fn array<const N: usize>(&mut self) -> QeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn prefixed(&mut self) -> QeResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn expect_end(&self) -> QeResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(QeError::invalid(format!(
                "{} has {} trailing bytes",
                self.what,
                self.buf.len()
            )))
        }
    }
}
