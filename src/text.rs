use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::types::Key;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

const DICT_FILE: &str = "dict";
const MAGIC: u32 = 0x6e77_7464; // "nwtd"

/// Bidirectional mapping between textual names and 64-bit keys. Inserts
/// are idempotent; the dictionary is append-only within a scope.
pub struct TextDict {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    by_text: HashMap<String, Key>,
    by_key: HashMap<Key, String>,
    next: Key,
    log: Option<std::fs::File>,
}

impl TextDict {
    /// Create the dictionary directory and an empty log.
    pub fn create(base: &Path) -> Result<Self> {
        let dir = base.join("text");
        crate::fsutil::ensure_dir(&dir)?;
        let path = dir.join(DICT_FILE);
        let mut f = std::fs::File::create(&path)
            .map_err(|e| NowError::os(ErrorKind::Create, "text", &e))?;
        f.write_all(&MAGIC.to_le_bytes())
            .map_err(|e| NowError::os(ErrorKind::Write, "text", &e))?;
        drop(f);
        Self::open(base)
    }

    /// Open an existing dictionary, replaying the log.
    pub fn open(base: &Path) -> Result<Self> {
        let path = base.join("text").join(DICT_FILE);
        let f = std::fs::File::open(&path)
            .map_err(|e| NowError::os(ErrorKind::Open, "text", &e))?;
        let mut rd = BufReader::new(f);
        let mut magic = [0u8; 4];
        rd.read_exact(&mut magic)
            .map_err(|e| NowError::os(ErrorKind::Read, "text", &e))?;
        if u32::from_le_bytes(magic) != MAGIC {
            return Err(errof!(Magic, "text"));
        }
        let mut by_text = HashMap::new();
        let mut by_key = HashMap::new();
        let mut next: Key = 1;
        loop {
            let mut hdr = [0u8; 12];
            match rd.read_exact(&mut hdr) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(NowError::os(ErrorKind::Read, "text", &e)),
            }
            let key = u64::from_le_bytes(hdr[0..8].try_into().expect("8 bytes"));
            let len = u32::from_le_bytes(hdr[8..12].try_into().expect("4 bytes")) as usize;
            let mut bytes = vec![0u8; len];
            rd.read_exact(&mut bytes)
                .map_err(|e| NowError::os(ErrorKind::Read, "text", &e))?;
            let s = String::from_utf8(bytes)
                .map_err(|_| errof!(Catalog, "text", "non-utf8 entry"))?;
            if key >= next {
                next = key + 1;
            }
            by_text.insert(s.clone(), key);
            by_key.insert(key, s);
        }
        let log = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| NowError::os(ErrorKind::Open, "text", &e))?;
        Ok(Self {
            path,
            inner: RwLock::new(Inner { by_text, by_key, next, log: Some(log) }),
        })
    }

    /// Intern a string; returns the existing key when already present.
    pub fn insert(&self, s: &str) -> Result<Key> {
        {
            let g = self.inner.read();
            if let Some(&k) = g.by_text.get(s) {
                return Ok(k);
            }
        }
        let mut g = self.inner.write();
        if let Some(&k) = g.by_text.get(s) {
            return Ok(k);
        }
        let key = g.next;
        g.next += 1;
        let mut entry = Vec::with_capacity(12 + s.len());
        entry.extend_from_slice(&key.to_le_bytes());
        entry.extend_from_slice(&(s.len() as u32).to_le_bytes());
        entry.extend_from_slice(s.as_bytes());
        g.log
            .as_mut()
            .ok_or_else(|| errof!(Invalid, "text", "dictionary closed"))?
            .write_all(&entry)
            .map_err(|e| NowError::os(ErrorKind::Write, "text", &e))?;
        g.by_text.insert(s.to_string(), key);
        g.by_key.insert(key, s.to_string());
        Ok(key)
    }

    pub fn get_key(&self, s: &str) -> Result<Key> {
        self.inner
            .read()
            .by_text
            .get(s)
            .copied()
            .ok_or_else(|| errof!(KeyNotFound, "text", "'{s}'"))
    }

    pub fn get_text(&self, key: Key) -> Result<String> {
        self.inner
            .read()
            .by_key
            .get(&key)
            .cloned()
            .ok_or_else(|| errof!(KeyNotFound, "text", "key {key}"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) -> Result<()> {
        let mut g = self.inner.write();
        if let Some(f) = g.log.take() {
            f.sync_all()
                .map_err(|e| NowError::os(ErrorKind::Sync, "text", &e))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Process-local per-query read cache in front of the dictionary.
pub struct TextCache<'a> {
    dict: &'a TextDict,
    lru: LruCache<Key, String>,
}

impl<'a> TextCache<'a> {
    #[must_use]
    pub fn new(dict: &'a TextDict, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self { dict, lru: LruCache::new(cap) }
    }

    pub fn get(&mut self, key: Key) -> Result<String> {
        if let Some(s) = self.lru.get(&key) {
            return Ok(s.clone());
        }
        let s = self.dict.get_text(key)?;
        self.lru.put(key, s.clone());
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_law() {
        let dir = tempfile::tempdir().unwrap();
        let t = TextDict::create(dir.path()).unwrap();
        let k = t.insert("frankfurt").unwrap();
        assert_eq!(t.get_text(t.get_key("frankfurt").unwrap()).unwrap(), "frankfurt");
        assert_eq!(t.insert("frankfurt").unwrap(), k);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k;
        {
            let t = TextDict::create(dir.path()).unwrap();
            k = t.insert("madrid").unwrap();
            t.insert("lisbon").unwrap();
            t.close().unwrap();
        }
        let t = TextDict::open(dir.path()).unwrap();
        assert_eq!(t.get_key("madrid").unwrap(), k);
        assert_eq!(t.len(), 2);
        let k2 = t.insert("porto").unwrap();
        assert!(k2 > k);
    }

    #[test]
    fn missing_is_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let t = TextDict::create(dir.path()).unwrap();
        assert!(t.get_key("nope").unwrap_err().is(ErrorKind::KeyNotFound));
        assert!(t.get_text(99).unwrap_err().is(ErrorKind::KeyNotFound));
    }

    #[test]
    fn cache_serves_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let t = TextDict::create(dir.path()).unwrap();
        let k = t.insert("x").unwrap();
        let mut c = TextCache::new(&t, 8);
        assert_eq!(c.get(k).unwrap(), "x");
        assert_eq!(c.get(k).unwrap(), "x");
    }
}
