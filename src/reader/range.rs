use crate::errof;
use crate::errors::Result;
use crate::index::{Index, SlotMask};
use crate::io::file::File;
use crate::reader::Reader;
use crate::sort::IndexKeys;
use crate::types::PageId;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

const PAGE_CACHE: usize = 64;
const BLACKLIST: usize = 256;

/// Resolve pages by page-id against a set of files, with a positive LRU
/// page cache and a negative black-list of unresolvable page-ids.
struct PageSource {
    files: HashMap<u32, File>,
    cache: LruCache<PageId, (Vec<u8>, usize)>,
    blacklist: LruCache<PageId, ()>,
    recsize: usize,
}

impl PageSource {
    fn new(files: Vec<File>) -> Result<Self> {
        let recsize = files
            .first()
            .map(|f| f.recordsize as usize)
            .ok_or_else(|| errof!(Invalid, "reader", "index reader without files"))?;
        Ok(Self {
            files: files.into_iter().map(|f| (f.id, f)).collect(),
            cache: LruCache::new(NonZeroUsize::new(PAGE_CACHE).expect("nonzero")),
            blacklist: LruCache::new(NonZeroUsize::new(BLACKLIST).expect("nonzero")),
            recsize,
        })
    }

    /// Load a page; `None` when the page-id does not resolve against the
    /// file set (stale index entry or pruned file).
    fn load(&mut self, pid: PageId) -> Result<Option<(Vec<u8>, usize)>> {
        if self.blacklist.contains(&pid) {
            return Ok(None);
        }
        if let Some(hit) = self.cache.get(&pid) {
            return Ok(Some(hit.clone()));
        }
        let Some(f) = self.files.get_mut(&pid.file()) else {
            self.blacklist.put(pid, ());
            return Ok(None);
        };
        f.open()?;
        match f.load_page_at(pid.offset()) {
            Ok(()) => {
                let entry = (f.page().to_vec(), f.page_records() as usize);
                self.cache.put(pid, entry.clone());
                Ok(Some(entry))
            }
            Err(e) if e.is_eof() => {
                self.blacklist.put(pid, ());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Index point search: positions on the first page matching the key, then
/// walks the embedded tree's page ids.
pub struct Search {
    source: PageSource,
    index: Arc<Index>,
    key: Vec<u8>,
    hits: Vec<(PageId, SlotMask)>,
    pos: Option<usize>,
    page: Option<(Vec<u8>, usize)>,
}

impl Search {
    pub fn new(files: Vec<File>, index: Arc<Index>, key: Vec<u8>) -> Result<Self> {
        if key.len() != index.keysize() {
            return Err(errof!(Invalid, "reader", "search key size mismatch"));
        }
        let hits = index.search(&key);
        Ok(Self { source: PageSource::new(files)?, index, key, hits, pos: None, page: None })
    }
}

impl Reader for Search {
    fn move_next(&mut self) -> Result<()> {
        loop {
            let next = self.pos.map_or(0, |p| p + 1);
            if next >= self.hits.len() {
                self.page = None;
                return Err(errof!(Eof, "reader"));
            }
            self.pos = Some(next);
            if let Some(page) = self.source.load(self.hits[next].0)? {
                self.page = Some(page);
                return Ok(());
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = None;
        self.page = None;
        self.hits = self.index.search(&self.key);
        Ok(())
    }

    fn page(&self) -> Option<&[u8]> {
        self.page.as_ref().map(|(p, _)| p.as_slice())
    }

    fn pageid(&self) -> Option<PageId> {
        self.pos.map(|p| self.hits[p].0)
    }

    fn page_records(&self) -> usize {
        self.page.as_ref().map_or(0, |(_, n)| *n)
    }

    fn recsize(&self) -> usize {
        self.source.recsize
    }

    fn key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn ikeys(&self) -> Option<&IndexKeys> {
        Some(&self.index.keys)
    }

    fn slot_mask(&self) -> Option<SlotMask> {
        self.pos.map(|p| self.hits[p].1)
    }
}

/// What a range reader delivers per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// All pages of all keys in range (frange).
    Full,
    /// The keys only (krange).
    Keys,
    /// Keys plus record counts from the slot bitmaps (crange).
    Counts,
}

/// Index range scan, ascending by key then page id.
pub struct Range {
    source: PageSource,
    index: Arc<Index>,
    mode: RangeMode,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    entries: Vec<(Vec<u8>, Vec<(PageId, SlotMask)>)>,
    kpos: usize,
    ppos: Option<usize>,
    page: Option<(Vec<u8>, usize)>,
    started: bool,
}

impl Range {
    pub fn new(
        files: Vec<File>,
        index: Arc<Index>,
        mode: RangeMode,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Result<Self> {
        let entries = index.range(start.as_deref(), end.as_deref());
        Ok(Self {
            source: PageSource::new(files)?,
            index,
            mode,
            start,
            end,
            entries,
            kpos: 0,
            ppos: None,
            page: None,
            started: false,
        })
    }

    fn advance_key(&mut self) -> Result<()> {
        if self.started {
            self.kpos += 1;
        }
        self.started = true;
        self.ppos = None;
        self.page = None;
        if self.kpos >= self.entries.len() {
            return Err(errof!(Eof, "reader"));
        }
        Ok(())
    }
}

impl Reader for Range {
    fn move_next(&mut self) -> Result<()> {
        if self.mode != RangeMode::Full {
            // keys-only and count-only stop at the host level
            return self.advance_key();
        }
        loop {
            if !self.started || self.kpos >= self.entries.len() {
                self.advance_key()?;
            }
            let pages = &self.entries[self.kpos].1;
            let next = self.ppos.map_or(0, |p| p + 1);
            if next >= pages.len() {
                self.advance_key()?;
                continue;
            }
            self.ppos = Some(next);
            let pid = pages[next].0;
            if let Some(page) = self.source.load(pid)? {
                self.page = Some(page);
                return Ok(());
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.entries = self.index.range(self.start.as_deref(), self.end.as_deref());
        self.kpos = 0;
        self.ppos = None;
        self.page = None;
        self.started = false;
        Ok(())
    }

    fn page(&self) -> Option<&[u8]> {
        self.page.as_ref().map(|(p, _)| p.as_slice())
    }

    fn pageid(&self) -> Option<PageId> {
        let p = self.ppos?;
        Some(self.entries[self.kpos].1[p].0)
    }

    fn page_records(&self) -> usize {
        self.page.as_ref().map_or(0, |(_, n)| *n)
    }

    fn recsize(&self) -> usize {
        self.source.recsize
    }

    fn key(&self) -> Option<&[u8]> {
        self.entries.get(self.kpos).map(|(k, _)| k.as_slice())
    }

    fn ikeys(&self) -> Option<&IndexKeys> {
        Some(&self.index.keys)
    }

    fn slot_mask(&self) -> Option<SlotMask> {
        let p = self.ppos?;
        Some(self.entries[self.kpos].1[p].1)
    }

    fn row_count(&self) -> Option<u64> {
        if self.mode != RangeMode::Counts {
            return None;
        }
        self.entries.get(self.kpos).map(|(_, pages)| {
            pages.iter().map(|(_, m)| u64::from(m.count_ones())).sum()
        })
    }

    fn skip_key(&mut self) -> Result<()> {
        self.advance_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Sizing;
    use crate::io::comp::Comp;
    use crate::io::file::CTRL_WRITER;
    use crate::time::{DAWN, DUSK};
    use crate::types::{Content, Edge, OFF_ORIGIN, PAGE_SIZE, Typ, read_u64};

    fn setup(dir: &std::path::Path) -> (File, Arc<Index>) {
        let mut f = File::new(
            1,
            dir.join("1"),
            1024 * 1024,
            0,
            PAGE_SIZE as u32,
            64,
            CTRL_WRITER,
            Comp::Flat,
            0,
            0,
            DAWN,
            DUSK,
        );
        f.create().unwrap();
        f.map().unwrap();
        let keys = IndexKeys::new(Content::Edge, vec![OFF_ORIGIN as u16]);
        let idx =
            Arc::new(Index::create("byorigin", keys.clone(), Sizing::Small, &dir.join("idx")).unwrap());
        for i in 0..256u64 {
            let e = Edge {
                edge: 1,
                origin: i % 4,
                destin: i,
                label: 0,
                timestamp: 0,
                weight: 0,
                weight2: 0,
                wtype: Typ::Nothing,
                wtype2: Typ::Nothing,
            };
            f.push_record(&e.to_bytes()).unwrap();
            if f.size % f.blocksize == 0 {
                let off = f.size - f.blocksize;
                let page = f.mapped_page(off).unwrap().to_vec();
                idx.insert_page(&page, PageId::new(1, off), 128, 64).unwrap();
            }
        }
        f.close().unwrap();
        (f, idx)
    }

    #[test]
    fn search_finds_key_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (f, idx) = setup(dir.path());
        let key = 2u64.to_le_bytes().to_vec();
        let mut s = Search::new(vec![f.fresh_copy()], idx, key.clone()).unwrap();
        let mut matches = 0;
        while s.move_next().is_ok() {
            let page = s.page().unwrap();
            let mask = s.slot_mask().unwrap();
            for i in 0..s.page_records() {
                if mask & (1 << (i as u32 & 127)) != 0
                    && read_u64(&page[i * 64..], OFF_ORIGIN) == 2
                {
                    matches += 1;
                }
            }
        }
        assert_eq!(matches, 64);
    }

    #[test]
    fn range_orders_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (f, idx) = setup(dir.path());
        let mut r = Range::new(vec![f.fresh_copy()], idx, RangeMode::Keys, None, None).unwrap();
        let mut seen = Vec::new();
        while r.move_next().is_ok() {
            seen.push(read_u64(r.key().unwrap(), 0));
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn counts_stop_at_host_level() {
        let dir = tempfile::tempdir().unwrap();
        let (f, idx) = setup(dir.path());
        let mut r =
            Range::new(vec![f.fresh_copy()], idx, RangeMode::Counts, None, None).unwrap();
        let mut total = 0;
        while r.move_next().is_ok() {
            assert!(r.page().is_none());
            total += r.row_count().unwrap();
        }
        assert_eq!(total, 256);
    }

    #[test]
    fn blacklist_swallows_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let (f, idx) = setup(dir.path());
        // an index entry for a file that is not in the reader's file set
        idx.insert(&9u64.to_le_bytes(), PageId::new(99, 0), 0).unwrap();
        let mut s =
            Search::new(vec![f.fresh_copy()], idx, 9u64.to_le_bytes().to_vec()).unwrap();
        assert!(s.move_next().unwrap_err().is_eof());
    }
}
