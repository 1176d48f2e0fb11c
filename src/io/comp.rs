use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ZSTD_LEVEL: i32 = 3;

/// Name of the trained dictionary file inside a store directory.
pub const ZDICT_FILE: &str = "zdict";

/// Minimum bytes of sample material before dictionary training is tried.
const TRAIN_THRESHOLD: usize = 4 * 1024 * 1024;
const DICT_CAPACITY: usize = 112 * 1024;

/// Compression algorithm of a store / file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum Comp {
    #[default]
    Flat = 0,
    Zstd = 1,
}

impl Comp {
    #[must_use]
    pub fn from_tag(tag: u32) -> Self {
        if tag == 1 { Comp::Zstd } else { Comp::Flat }
    }
}

/// Bounded pool of (de)compression slots plus the trained dictionary.
/// Slots are plain tokens: contexts are cheap to build against the
/// prepared dictionary, the pool bounds how many are live at once.
#[derive(Debug)]
pub struct CompPool {
    slots: Mutex<Slots>,
    dict: RwLock<Option<Vec<u8>>>,
    path: PathBuf,
}

#[derive(Debug)]
struct Slots {
    comp: u32,
    decomp: u32,
    ncomp: u32,
    ndecomp: u32,
}

impl CompPool {
    /// `base` is the store directory; a `zdict` file there is picked up
    /// lazily.
    #[must_use]
    pub fn new(base: &Path, ncomp: u32, ndecomp: u32) -> Self {
        Self {
            slots: Mutex::new(Slots { comp: 0, decomp: 0, ncomp, ndecomp }),
            dict: RwLock::new(None),
            path: base.join(ZDICT_FILE),
        }
    }

    /// Load the trained dictionary if present on disk.
    pub fn load_dict(&self) -> Result<bool> {
        if self.dict.read().is_some() {
            return Ok(true);
        }
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                *self.dict.write() = Some(bytes);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(NowError::os(ErrorKind::CompDict, "zdict", &e)),
        }
    }

    /// Train a dictionary from a sample buffer of fixed-size records and
    /// persist it. No-op when the sample is too small or a dictionary
    /// already exists.
    pub fn train_dict(&self, sample: &[u8], recsize: usize) -> Result<()> {
        if self.dict.read().is_some() || sample.len() < TRAIN_THRESHOLD {
            return Ok(());
        }
        let sizes: Vec<usize> = std::iter::repeat_n(recsize, sample.len() / recsize).collect();
        let dict = zstd::dict::from_continuous(sample, &sizes, DICT_CAPACITY)
            .map_err(|e| NowError::os(ErrorKind::CompDict, "zdict", &e))?;
        crate::fsutil::write_atomic(&self.path, &dict)?;
        *self.dict.write() = Some(dict);
        Ok(())
    }

    #[must_use]
    pub fn has_dict(&self) -> bool {
        self.dict.read().is_some()
    }

    /// Acquire a compression slot; fails with `no-rsc` when all are busy.
    pub fn get_cctx(&self) -> Result<CctxGuard<'_>> {
        let mut s = self.slots.lock();
        let free = free_bit(s.comp, s.ncomp)
            .ok_or_else(|| errof!(NoRsc, "compctx", "all compression contexts busy"))?;
        s.comp |= 1 << free;
        Ok(CctxGuard { pool: self, slot: free })
    }

    /// Acquire a decompression slot; falls back to an ad-hoc context when
    /// the pool is exhausted.
    #[must_use]
    pub fn get_dctx(&self) -> DctxGuard<'_> {
        let mut s = self.slots.lock();
        match free_bit(s.decomp, s.ndecomp) {
            Some(free) => {
                s.decomp |= 1 << free;
                DctxGuard { pool: self, slot: Some(free) }
            }
            None => DctxGuard { pool: self, slot: None },
        }
    }
}

fn free_bit(map: u32, n: u32) -> Option<u32> {
    (0..n.min(32)).find(|i| map & (1 << i) == 0)
}

#[derive(Debug)]
pub struct CctxGuard<'a> {
    pool: &'a CompPool,
    slot: u32,
}

impl CctxGuard<'_> {
    /// Compress `src` into `dst`, returning the compressed size.
    pub fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let dict = self.pool.dict.read();
        let mut ctx = match dict.as_deref() {
            Some(d) => zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, d),
            None => zstd::bulk::Compressor::new(ZSTD_LEVEL),
        }
        .map_err(|e| NowError::os(ErrorKind::Comp, "compctx", &e))?;
        ctx.compress_to_buffer(src, dst)
            .map_err(|e| NowError::os(ErrorKind::Comp, "compctx", &e))
    }
}

impl Drop for CctxGuard<'_> {
    fn drop(&mut self) {
        self.pool.slots.lock().comp &= !(1 << self.slot);
    }
}

pub struct DctxGuard<'a> {
    pool: &'a CompPool,
    slot: Option<u32>,
}

impl DctxGuard<'_> {
    /// Decompress `src` into `dst`, returning the decompressed size.
    pub fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let dict = self.pool.dict.read();
        let mut ctx = match dict.as_deref() {
            Some(d) => zstd::bulk::Decompressor::with_dictionary(d),
            None => zstd::bulk::Decompressor::new(),
        }
        .map_err(|e| NowError::os(ErrorKind::Decomp, "compctx", &e))?;
        ctx.decompress_to_buffer(src, dst)
            .map_err(|e| NowError::os(ErrorKind::Decomp, "compctx", &e))
    }
}

impl Drop for DctxGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            self.pool.slots.lock().decomp &= !(1 << slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CompPool::new(dir.path(), 2, 2);
        let src = vec![42u8; 8192];
        let mut dst = vec![0u8; 16384];
        let c = pool.get_cctx().unwrap();
        let n = c.compress(&src, &mut dst).unwrap();
        assert!(n < src.len());
        let mut back = vec![0u8; 8192];
        let d = pool.get_dctx();
        let m = d.decompress(&dst[..n], &mut back).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(back, src);
    }

    #[test]
    fn cctx_pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CompPool::new(dir.path(), 1, 1);
        let g1 = pool.get_cctx().unwrap();
        assert!(pool.get_cctx().unwrap_err().is(ErrorKind::NoRsc));
        drop(g1);
        assert!(pool.get_cctx().is_ok());
    }

    #[test]
    fn dctx_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CompPool::new(dir.path(), 1, 1);
        let _g1 = pool.get_dctx();
        let g2 = pool.get_dctx(); // ad-hoc, no slot
        let mut dst = vec![0u8; 64];
        let c = pool.get_cctx().unwrap();
        let mut comp = vec![0u8; 256];
        let n = c.compress(b"hello hello hello hello", &mut comp).unwrap();
        assert!(g2.decompress(&comp[..n], &mut dst).is_ok());
    }
}
