//! Byte access to a loaded image.

use crate::error::DecodeError;

/// A contiguous run of bytes mapped at `base`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub base: u64,
    pub data: Vec<u8>,
}

impl Section {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Little-endian fetch of `len` bytes (at most 8).
    pub fn get(&self, addr: u64, len: usize) -> Result<u64, DecodeError> {
        if !self.contains(addr) || addr + len as u64 > self.end() || len > 8 {
            return Err(DecodeError::OutOfImage { addr });
        }
        let off = (addr - self.base) as usize;
        Ok(self.data[off..off + len]
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn little_endian_fetch() {
        let s = Section::new(0x100, vec![0x34, 0x12, 0xff]);
        assert_eq!(s.get(0x100, 2), Ok(0x1234));
        assert_eq!(s.get(0x102, 1), Ok(0xff));
        assert_eq!(s.get(0x102, 2), Err(DecodeError::OutOfImage { addr: 0x102 }));
        assert!(!s.contains(0x103));
    }
}
