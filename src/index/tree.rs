use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::sort::IndexKeys;
use crate::types::{FileId, PageId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const HOST_FILE: &str = "host";
pub const EMB_FILE: &str = "emb";

/// Bitmap over the record slots of one page. Pages with more than 128
/// records map two adjacent records onto one bit.
pub type SlotMask = u128;

/// Node/page sizing class chosen at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sizing {
    Tiny,
    Small,
    #[default]
    Medium,
    Large,
    Huge,
}

#[derive(Serialize, Deserialize)]
struct HostImage {
    version: u32,
    entries: Vec<(Vec<u8>, u64)>,
    next_emb: u64,
}

#[derive(Serialize, Deserialize)]
struct EmbImage {
    version: u32,
    trees: Vec<(u64, Vec<(u64, SlotMask)>)>,
}

const TREE_VERSION: u32 = 1;

#[derive(Debug)]
struct Trees {
    /// mangled composite key -> embedded tree id
    host: BTreeMap<Vec<u8>, u64>,
    /// embedded tree id -> (page id -> slot mask)
    embs: HashMap<u64, BTreeMap<PageId, SlotMask>>,
    next_emb: u64,
}

/// A named two-level index: the host tree maps composite keys to embedded
/// trees, each embedded tree maps page ids to slot bitmaps. A read-write
/// lock guards swapping the trees underneath live users.
#[derive(Debug)]
pub struct Index {
    pub name: String,
    pub keys: IndexKeys,
    pub sizing: Sizing,
    dir: PathBuf,
    trees: RwLock<Trees>,
}

impl Index {
    /// Create a fresh index under `dir` (`.../index/<name>`).
    pub fn create(name: &str, keys: IndexKeys, sizing: Sizing, dir: &Path) -> Result<Self> {
        crate::fsutil::ensure_dir(dir)?;
        let idx = Self {
            name: name.to_string(),
            keys,
            sizing,
            dir: dir.to_path_buf(),
            trees: RwLock::new(Trees {
                host: BTreeMap::new(),
                embs: HashMap::new(),
                next_emb: 1,
            }),
        };
        idx.save()?;
        Ok(idx)
    }

    /// Open a persisted index.
    pub fn open(name: &str, keys: IndexKeys, sizing: Sizing, dir: &Path) -> Result<Self> {
        let host_bytes = std::fs::read(dir.join(HOST_FILE))
            .map_err(|e| NowError::os(ErrorKind::Open, "index", &e))?;
        let (host_img, _): (HostImage, usize) =
            bincode::serde::decode_from_slice(&host_bytes, bincode::config::standard())
                .map_err(|e| errof!(Tree, "index", "host: {e}"))?;
        let emb_bytes = std::fs::read(dir.join(EMB_FILE))
            .map_err(|e| NowError::os(ErrorKind::Open, "index", &e))?;
        let (emb_img, _): (EmbImage, usize) =
            bincode::serde::decode_from_slice(&emb_bytes, bincode::config::standard())
                .map_err(|e| errof!(Tree, "index", "emb: {e}"))?;
        if host_img.version != TREE_VERSION || emb_img.version != TREE_VERSION {
            return Err(errof!(Version, "index"));
        }
        let mut embs = HashMap::new();
        for (id, pages) in emb_img.trees {
            let tree: BTreeMap<PageId, SlotMask> =
                pages.into_iter().map(|(p, m)| (PageId(p), m)).collect();
            embs.insert(id, tree);
        }
        let host: BTreeMap<Vec<u8>, u64> = host_img.entries.into_iter().collect();
        // every host leaf must reference a live embedded tree
        for embid in host.values() {
            if !embs.contains_key(embid) {
                return Err(errof!(Tree, "index", "dangling embedded tree {embid}"));
            }
        }
        Ok(Self {
            name: name.to_string(),
            keys,
            sizing,
            dir: dir.to_path_buf(),
            trees: RwLock::new(Trees { host, embs, next_emb: host_img.next_emb }),
        })
    }

    /// Persist both trees.
    pub fn save(&self) -> Result<()> {
        let g = self.trees.read();
        let host_img = HostImage {
            version: TREE_VERSION,
            entries: g.host.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            next_emb: g.next_emb,
        };
        let emb_img = EmbImage {
            version: TREE_VERSION,
            trees: g
                .embs
                .iter()
                .map(|(id, t)| (*id, t.iter().map(|(p, m)| (p.0, *m)).collect()))
                .collect(),
        };
        drop(g);
        let host_bytes = bincode::serde::encode_to_vec(&host_img, bincode::config::standard())
            .map_err(|e| errof!(Tree, "index", "host: {e}"))?;
        crate::fsutil::write_atomic(&self.dir.join(HOST_FILE), &host_bytes)?;
        let emb_bytes = bincode::serde::encode_to_vec(&emb_img, bincode::config::standard())
            .map_err(|e| errof!(Tree, "index", "emb: {e}"))?;
        crate::fsutil::write_atomic(&self.dir.join(EMB_FILE), &emb_bytes)
    }

    /// Map a record index onto its slot bit.
    #[must_use]
    pub fn slot_of(per_page: usize, rec: usize) -> u32 {
        if per_page <= 128 {
            rec as u32
        } else {
            (rec * 128 / per_page) as u32
        }
    }

    /// Insert one (key, page, slot). Idempotent: re-inserting the same
    /// triple leaves the bitmap unchanged.
    pub fn insert(&self, key: &[u8], pageid: PageId, slot: u32) -> Result<()> {
        if key.len() != self.keys.keysize() {
            return Err(errof!(Invalid, "index", "key size mismatch"));
        }
        let mangled = self.keys.mangle(key);
        let mut g = self.trees.write();
        let t = &mut *g;
        let embid = if let Some(&id) = t.host.get(&mangled) {
            id
        } else {
            let id = t.next_emb;
            t.next_emb += 1;
            t.host.insert(mangled, id);
            t.embs.insert(id, BTreeMap::new());
            id
        };
        let tree = t.embs.get_mut(&embid).expect("host leaf references live tree");
        *tree.entry(pageid).or_insert(0) |= 1u128 << (slot & 127);
        Ok(())
    }

    /// Apply the index to one completed page: iterate its records, build
    /// the composite key and record the slot.
    pub fn insert_page(&self, page: &[u8], pageid: PageId, nrec: usize, recsize: usize) -> Result<()> {
        let per_page = page.len() / recsize;
        for i in 0..nrec {
            let rec = &page[i * recsize..(i + 1) * recsize];
            let key = self.keys.extract(rec);
            self.insert(&key, pageid, Self::slot_of(per_page, i))?;
        }
        Ok(())
    }

    /// Point lookup: all (page, mask) pairs for a key, ascending by page.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Vec<(PageId, SlotMask)> {
        let mangled = self.keys.mangle(key);
        let g = self.trees.read();
        match g.host.get(&mangled) {
            None => Vec::new(),
            Some(embid) => g.embs[embid].iter().map(|(p, m)| (*p, *m)).collect(),
        }
    }

    /// Range scan: all keys in [start, end] (unmangled form), ascending by
    /// key then page id.
    #[must_use]
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<(Vec<u8>, Vec<(PageId, SlotMask)>)> {
        use std::ops::Bound;
        let lo = match start {
            Some(s) => Bound::Included(self.keys.mangle(s)),
            None => Bound::Unbounded,
        };
        let hi = match end {
            Some(e) => Bound::Included(self.keys.mangle(e)),
            None => Bound::Unbounded,
        };
        let g = self.trees.read();
        g.host
            .range((lo, hi))
            .map(|(k, embid)| {
                let pages = g.embs[embid].iter().map(|(p, m)| (*p, *m)).collect();
                (self.keys.unmangle(k), pages)
            })
            .collect()
    }

    /// Keys-only variant: stops at the host level.
    #[must_use]
    pub fn keys_in_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Vec<u8>> {
        self.range(start, end).into_iter().map(|(k, _)| k).collect()
    }

    /// Count-only variant: per-key population counts of the slot bitmaps.
    #[must_use]
    pub fn counts_in_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<(Vec<u8>, u64)> {
        self.range(start, end)
            .into_iter()
            .map(|(k, pages)| {
                let n: u64 = pages.iter().map(|(_, m)| u64::from(m.count_ones())).sum();
                (k, n)
            })
            .collect()
    }

    /// Drop every entry referencing a file (its pages were erased).
    pub fn remove_file(&self, file: FileId) {
        let mut g = self.trees.write();
        let mut empty: Vec<Vec<u8>> = Vec::new();
        for (key, embid) in &g.host {
            let embid = *embid;
            if let Some(tree) = g.embs.get(&embid) {
                let all_gone = tree.keys().all(|p| p.file() == file);
                if all_gone && !tree.is_empty() {
                    empty.push(key.clone());
                }
            }
        }
        for (_, tree) in g.embs.iter_mut() {
            tree.retain(|p, _| p.file() != file);
        }
        for key in empty {
            if let Some(embid) = g.host.remove(&key) {
                g.embs.remove(&embid);
            }
        }
    }

    #[must_use]
    pub fn keysize(&self) -> usize {
        self.keys.keysize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, Edge, OFF_DESTIN, OFF_ORIGIN, Typ};

    fn keys() -> IndexKeys {
        IndexKeys::new(Content::Edge, vec![OFF_ORIGIN as u16, OFF_DESTIN as u16])
    }

    fn edge(origin: u64, destin: u64) -> [u8; 64] {
        Edge {
            edge: 1,
            origin,
            destin,
            label: 0,
            timestamp: 0,
            weight: 0,
            weight2: 0,
            wtype: Typ::Float,
            wtype2: Typ::Nothing,
        }
        .to_bytes()
    }

    #[test]
    fn insert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let idx = Index::create("i", keys(), Sizing::Tiny, dir.path()).unwrap();
        let key = keys().extract(&edge(5, 6));
        idx.insert(&key, PageId::new(1, 0), 3).unwrap();
        idx.insert(&key, PageId::new(1, 0), 3).unwrap();
        let hits = idx.search(&key);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.count_ones(), 1);
    }

    #[test]
    fn range_is_key_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let idx = Index::create("i", keys(), Sizing::Small, dir.path()).unwrap();
        for o in [9u64, 2, 5] {
            let key = keys().extract(&edge(o, 1));
            idx.insert(&key, PageId::new(1, 0), 0).unwrap();
        }
        let lo = keys().extract(&edge(2, 0));
        let hi = keys().extract(&edge(9, u64::MAX));
        let ks = idx.keys_in_range(Some(&lo), Some(&hi));
        let origins: Vec<u64> =
            ks.iter().map(|k| u64::from_le_bytes(k[0..8].try_into().unwrap())).collect();
        assert_eq!(origins, vec![2, 5, 9]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = keys().extract(&edge(7, 8));
        {
            let idx = Index::create("i", keys(), Sizing::Medium, dir.path()).unwrap();
            idx.insert(&key, PageId::new(2, 8192), 1).unwrap();
            idx.save().unwrap();
        }
        let idx = Index::open("i", keys(), Sizing::Medium, dir.path()).unwrap();
        let hits = idx.search(&key);
        assert_eq!(hits, vec![(PageId::new(2, 8192), 1u128 << 1)]);
    }

    #[test]
    fn remove_file_drops_entries() {
        let dir = tempfile::tempdir().unwrap();
        let idx = Index::create("i", keys(), Sizing::Medium, dir.path()).unwrap();
        let key = keys().extract(&edge(1, 1));
        idx.insert(&key, PageId::new(1, 0), 0).unwrap();
        idx.insert(&key, PageId::new(2, 0), 0).unwrap();
        idx.remove_file(1);
        let hits = idx.search(&key);
        assert_eq!(hits, vec![(PageId::new(2, 0), 1u128)]);
        idx.remove_file(2);
        assert!(idx.search(&key).is_empty());
    }

    #[test]
    fn counts_sum_slots() {
        let dir = tempfile::tempdir().unwrap();
        let idx = Index::create("i", keys(), Sizing::Medium, dir.path()).unwrap();
        let page_recs: Vec<[u8; 64]> = vec![edge(3, 3), edge(3, 3), edge(3, 4)];
        let mut page = vec![0u8; 8192];
        for (i, r) in page_recs.iter().enumerate() {
            page[i * 64..(i + 1) * 64].copy_from_slice(r);
        }
        idx.insert_page(&page, PageId::new(1, 0), 3, 64).unwrap();
        let counts = idx.counts_in_range(None, None);
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 3);
    }
}
