use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::io::comp::Comp;
use crate::io::file::File;
use crate::types::{FileId, Time};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x6e77_7374; // "nwst"
const VERSION: u32 = 1;
const ENTRY_SIZE: usize = 57;
const HDR_SIZE: usize = 16;

/// One fixed-width catalog line describing a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: FileId,
    pub order: u32,
    pub capacity: u32,
    pub size: u32,
    pub blocksize: u32,
    pub recordsize: u32,
    pub ctrl: u8,
    pub comp: u32,
    pub encp: u32,
    pub grain: Time,
    pub oldest: Time,
    pub newest: Time,
}

impl CatalogEntry {
    #[must_use]
    pub fn from_file(f: &File) -> Self {
        Self {
            id: f.id,
            order: f.order,
            capacity: f.capacity,
            size: f.size,
            blocksize: f.blocksize,
            recordsize: f.recordsize,
            ctrl: f.ctrl,
            comp: f.comp as u32,
            encp: f.encp,
            grain: f.grain,
            oldest: f.oldest,
            newest: f.newest,
        }
    }

    /// Build a closed descriptor; the data file lives at `<base>/<id>`.
    #[must_use]
    pub fn to_file(&self, base: &Path) -> File {
        let mut f = File::new(
            self.id,
            base.join(self.id.to_string()),
            self.capacity,
            self.size,
            self.blocksize,
            self.recordsize,
            self.ctrl,
            Comp::from_tag(self.comp),
            self.encp,
            self.grain,
            self.oldest,
            self.newest,
        );
        f.order = self.order;
        f
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.order.to_le_bytes());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.blocksize.to_le_bytes());
        out.extend_from_slice(&self.recordsize.to_le_bytes());
        out.push(self.ctrl);
        out.extend_from_slice(&self.comp.to_le_bytes());
        out.extend_from_slice(&self.encp.to_le_bytes());
        out.extend_from_slice(&self.grain.to_le_bytes());
        out.extend_from_slice(&self.oldest.to_le_bytes());
        out.extend_from_slice(&self.newest.to_le_bytes());
    }

    fn decode(b: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().expect("4 bytes"));
        let i64_at = |o: usize| i64::from_le_bytes(b[o..o + 8].try_into().expect("8 bytes"));
        Self {
            id: u32_at(0),
            order: u32_at(4),
            capacity: u32_at(8),
            size: u32_at(12),
            blocksize: u32_at(16),
            recordsize: u32_at(20),
            ctrl: b[24],
            comp: u32_at(25),
            encp: u32_at(29),
            grain: i64_at(33),
            oldest: i64_at(41),
            newest: i64_at(49),
        }
    }
}

/// Persist the catalog: header (magic, version, count, crc of the entry
/// bytes), then the fixed-width entries. Write-to-temp then rename.
pub fn write_catalog(path: &PathBuf, entries: &[CatalogEntry]) -> Result<()> {
    let mut body = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for e in entries {
        e.encode(&mut body);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();
    let mut out = Vec::with_capacity(HDR_SIZE + body.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    crate::fsutil::write_atomic(path, &out)
}

/// Load the catalog; a missing file is an empty store.
pub fn read_catalog(path: &PathBuf) -> Result<Vec<CatalogEntry>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(NowError::os(ErrorKind::Open, "catalog", &e)),
    };
    if bytes.len() < HDR_SIZE {
        return Err(errof!(Catalog, "catalog", "short header"));
    }
    let u32_at = |o: usize| u32::from_le_bytes(bytes[o..o + 4].try_into().expect("4 bytes"));
    if u32_at(0) != MAGIC {
        return Err(errof!(Magic, "catalog"));
    }
    if u32_at(4) != VERSION {
        return Err(errof!(Version, "catalog"));
    }
    let count = u32_at(8) as usize;
    let crc = u32_at(12);
    let body = &bytes[HDR_SIZE..];
    if body.len() != count * ENTRY_SIZE {
        return Err(errof!(Catalog, "catalog", "size mismatch"));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != crc {
        return Err(errof!(Catalog, "catalog", "checksum mismatch"));
    }
    Ok(body.chunks(ENTRY_SIZE).map(CatalogEntry::decode).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::file::{CTRL_READER, CTRL_SORT, CTRL_WRITER};

    fn entry(id: FileId, ctrl: u8) -> CatalogEntry {
        CatalogEntry {
            id,
            order: id,
            capacity: 1024 * 1024,
            size: 8192,
            blocksize: 8192,
            recordsize: 64,
            ctrl,
            comp: 1,
            encp: 0,
            grain: 0,
            oldest: -5,
            newest: 77,
        }
    }

    #[test]
    fn roundtrip_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("catalog");
        let entries = vec![entry(1, CTRL_WRITER), entry(2, CTRL_READER | CTRL_SORT)];
        write_catalog(&p, &entries).unwrap();
        assert_eq!(read_catalog(&p).unwrap(), entries);
    }

    #[test]
    fn missing_catalog_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("none");
        assert!(read_catalog(&p).unwrap().is_empty());
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("catalog");
        write_catalog(&p, &[entry(1, CTRL_WRITER)]).unwrap();
        let mut bytes = std::fs::read(&p).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&p, &bytes).unwrap();
        assert!(read_catalog(&p).unwrap_err().is(ErrorKind::Catalog));
    }
}
