//! raw flash region primitive
//!
//! the anti-rollback counter talks to a dedicated region that the filesystem
//! never relocates. nor semantics: erase sets every byte of a page to 0xff,
//! programming can only clear bits.
//!
//! implementations:
//! - memory: host-side region for tests and the simulator, with power-loss
//!   injection and image save/load

use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// erased byte value
pub const ERASED: u8 = 0xff;

/// flash region trait - pluggable raw flash driver
pub trait FlashRegion {
    /// erase granularity in bytes
    fn page_size(&self) -> usize;

    /// total region size in bytes
    fn len(&self) -> usize;

    /// read `buf.len()` bytes starting at `addr`
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    /// erase the page starting at `addr` (must be page aligned)
    fn erase_page(&mut self, addr: usize) -> Result<()>;

    /// program `data` at `addr`, blocking until the driver reports completion
    fn write_word(&mut self, addr: usize, data: &[u8]) -> Result<()>;
}

/// in-memory nor flash
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    page_size: usize,
    data: Vec<u8>,
    /// program only this many more bytes, then fail as if power was cut
    power_loss_after: Option<usize>,
}

impl MemoryFlash {
    /// create an erased region of `pages` pages
    pub fn new(page_size: usize, pages: usize) -> Self {
        Self {
            page_size,
            data: vec![ERASED; page_size * pages],
            power_loss_after: None,
        }
    }

    /// simulate power loss: the next write programs `bytes` bytes and fails
    pub fn power_loss_after(&mut self, bytes: usize) {
        self.power_loss_after = Some(bytes);
    }

    /// raw contents (for inspection in tests)
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// load a region image written by [`MemoryFlash::save`]
    pub fn load(path: &Path, page_size: usize) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::Flash(format!("{}: {}", path.display(), e)))?;
        if page_size == 0 || data.is_empty() || data.len() % page_size != 0 {
            return Err(Error::Flash(format!(
                "image size {} is not a multiple of page size {}",
                data.len(),
                page_size
            )));
        }
        Ok(Self {
            page_size,
            data,
            power_loss_after: None,
        })
    }

    /// persist the region image
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.data).map_err(|e| Error::Flash(format!("{}: {}", path.display(), e)))
    }

    fn check_bounds(&self, addr: usize, len: usize) -> Result<()> {
        match addr.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(Error::Flash(format!(
                "access {:#x}+{} outside region of {} bytes",
                addr,
                len,
                self.data.len()
            ))),
        }
    }
}

impl FlashRegion for MemoryFlash {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(addr, buf.len())?;
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
        Ok(())
    }

    fn erase_page(&mut self, addr: usize) -> Result<()> {
        if addr % self.page_size != 0 {
            return Err(Error::Flash(format!("erase address {:#x} not page aligned", addr)));
        }
        self.check_bounds(addr, self.page_size)?;
        self.data[addr..addr + self.page_size].fill(ERASED);
        Ok(())
    }

    fn write_word(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(addr, data.len())?;

        let (programmed, torn) = match self.power_loss_after.take() {
            Some(n) if n < data.len() => (n, true),
            _ => (data.len(), false),
        };

        // nor: programming only clears bits
        for (cell, byte) in self.data[addr..addr + programmed].iter_mut().zip(data) {
            *cell &= *byte;
        }

        if torn {
            return Err(Error::Flash(format!(
                "power lost after {} of {} bytes at {:#x}",
                programmed,
                data.len(),
                addr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erase_and_program() {
        let mut flash = MemoryFlash::new(64, 2);
        assert!(flash.as_bytes().iter().all(|b| *b == ERASED));

        flash.write_word(4, &[0x0f, 0xf0]).unwrap();
        let mut buf = [0u8; 2];
        flash.read(4, &mut buf).unwrap();
        assert_eq!(buf, [0x0f, 0xf0]);

        // cannot set bits without erase
        flash.write_word(4, &[0xff, 0xff]).unwrap();
        flash.read(4, &mut buf).unwrap();
        assert_eq!(buf, [0x0f, 0xf0]);

        flash.erase_page(0).unwrap();
        flash.read(4, &mut buf).unwrap();
        assert_eq!(buf, [ERASED, ERASED]);
    }

    #[test]
    fn test_unaligned_erase_rejected() {
        let mut flash = MemoryFlash::new(64, 2);
        assert!(flash.erase_page(10).is_err());
        assert!(flash.erase_page(128).is_err());
    }

    #[test]
    fn test_power_loss_is_partial() {
        let mut flash = MemoryFlash::new(64, 1);
        flash.power_loss_after(3);
        assert!(flash.write_word(0, &[0u8; 8]).is_err());
        assert_eq!(&flash.as_bytes()[..4], &[0, 0, 0, ERASED]);

        // injection is one-shot
        flash.write_word(8, &[0u8; 8]).unwrap();
    }

    #[test]
    fn test_image_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.img");

        let mut flash = MemoryFlash::new(32, 2);
        flash.write_word(0, b"lw").unwrap();
        flash.save(&path).unwrap();

        let loaded = MemoryFlash::load(&path, 32).unwrap();
        assert_eq!(loaded.as_bytes(), flash.as_bytes());
        assert!(MemoryFlash::load(&path, 48).is_err());
    }
}
