use crate::errof;
use crate::errors::Result;
use crate::io::file::File;
use crate::reader::Reader;
use crate::sort::{self, IndexKeys};
use crate::types::{Ord_, PageId, Time};

/// Sequential scan over a list of files: each move loads one page from
/// the current file, advancing to the next file on exhaustion.
pub struct Fullscan {
    files: Vec<File>,
    cur: usize,
    opened: bool,
    recsize: usize,
    period: (Time, Time),
}

impl Fullscan {
    pub fn new(files: Vec<File>) -> Result<Self> {
        let recsize = files
            .first()
            .map(|f| f.recordsize as usize)
            .ok_or_else(|| errof!(Invalid, "reader", "fullscan without files"))?;
        Ok(Self {
            files,
            cur: 0,
            opened: false,
            recsize,
            period: (crate::time::DAWN, crate::time::DUSK),
        })
    }
}

impl Reader for Fullscan {
    fn move_next(&mut self) -> Result<()> {
        loop {
            if self.cur >= self.files.len() {
                return Err(errof!(Eof, "reader"));
            }
            let (start, end) = self.period;
            let f = &mut self.files[self.cur];
            if !f.in_period(start, end) {
                if self.opened {
                    f.close()?;
                    self.opened = false;
                }
                self.cur += 1;
                continue;
            }
            if !self.opened {
                f.open()?;
                f.rewind()?;
                self.opened = true;
            }
            match f.move_next() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_eof() => {
                    f.close()?;
                    self.opened = false;
                    self.cur += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        if self.opened && self.cur < self.files.len() {
            self.files[self.cur].close()?;
        }
        self.cur = 0;
        self.opened = false;
        Ok(())
    }

    fn page(&self) -> Option<&[u8]> {
        self.files.get(self.cur).map(File::page)
    }

    fn pageid(&self) -> Option<PageId> {
        let f = self.files.get(self.cur)?;
        Some(PageId::new(f.id, f.page_offset()))
    }

    fn page_records(&self) -> usize {
        self.files.get(self.cur).map_or(0, |f| f.page_records() as usize)
    }

    fn recsize(&self) -> usize {
        self.recsize
    }

    fn set_period(&mut self, start: Time, end: Time) {
        self.period = (start, end);
    }
}

/// Reads a list of files fully into memory, optionally sorting the
/// records by an index key order; serves pages from the buffer. With an
/// ordering and a range it behaves like a range scanner over unsorted
/// data.
pub struct Buffer {
    pages: Vec<Vec<u8>>,
    nrecs: Vec<usize>,
    keys: Option<IndexKeys>,
    /// Key of the first record of each page (index ordering only).
    page_keys: Vec<Vec<u8>>,
    pos: Option<usize>,
    recsize: usize,
}

impl Buffer {
    /// Plain buffer scan over whole files.
    pub fn new(files: Vec<File>) -> Result<Self> {
        Self::build(files, None, None, Ord_::Asc, None, None)
    }

    /// A reader over nothing (all files pruned by the period).
    #[must_use]
    pub fn empty(recsize: usize) -> Self {
        Self {
            pages: Vec::new(),
            nrecs: Vec::new(),
            keys: None,
            page_keys: Vec::new(),
            pos: None,
            recsize,
        }
    }

    /// Buffer over the writer's unindexed tail: only records from
    /// `tail_off` on.
    pub fn from_tail(file: File, tail_off: u32) -> Result<Self> {
        Self::build(vec![file], Some(tail_off), None, Ord_::Asc, None, None)
    }

    /// Buffer simulating an index range scan (bufidx).
    pub fn bufidx(
        files: Vec<File>,
        keys: IndexKeys,
        ord: Ord_,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Self> {
        Self::build(files, None, Some(keys), ord, start, end)
    }

    fn build(
        files: Vec<File>,
        tail_off: Option<u32>,
        keys: Option<IndexKeys>,
        ord: Ord_,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Self> {
        let recsize = files
            .first()
            .map(|f| f.recordsize as usize)
            .ok_or_else(|| errof!(Invalid, "reader", "buffer without files"))?;
        let blocksize = files
            .first()
            .map(|f| f.blocksize as usize)
            .unwrap_or(crate::types::PAGE_SIZE);
        let mut records: Vec<Vec<u8>> = Vec::new();
        for mut f in files {
            f.open()?;
            f.rewind()?;
            if let Some(off) = tail_off {
                f.position(off)?;
            }
            loop {
                match f.move_next() {
                    Ok(()) => {}
                    Err(e) if e.is_eof() => break,
                    Err(e) => return Err(e),
                }
                let n = f.page_records() as usize;
                let page = f.page();
                for i in 0..n {
                    records.push(page[i * recsize..(i + 1) * recsize].to_vec());
                }
            }
            f.close()?;
        }
        if let Some(keys) = &keys {
            if let (Some(s), Some(e)) = (start, end) {
                records.retain(|r| {
                    let k = keys.extract(r);
                    keys.compare_keys(&k, s) != std::cmp::Ordering::Less
                        && keys.compare_keys(&k, e) != std::cmp::Ordering::Greater
                });
            }
            records.sort_by(|a, b| {
                let c = keys.compare_records(a, b);
                if ord == Ord_::Desc { c.reverse() } else { c }
            });
        }
        let nrec_total = records.len();
        let per_page = blocksize / recsize;
        let pages = sort::to_pages(&records, blocksize, recsize);
        let mut nrecs = Vec::with_capacity(pages.len());
        let mut page_keys = Vec::new();
        for (i, _) in pages.iter().enumerate() {
            let n = if (i + 1) * per_page <= nrec_total {
                per_page
            } else {
                nrec_total - i * per_page
            };
            nrecs.push(n);
            if let Some(keys) = &keys {
                page_keys.push(keys.extract(&records[i * per_page]));
            }
        }
        Ok(Self { pages, nrecs, keys, page_keys, pos: None, recsize })
    }
}

impl Reader for Buffer {
    fn move_next(&mut self) -> Result<()> {
        let next = self.pos.map_or(0, |p| p + 1);
        if next >= self.pages.len() {
            return Err(errof!(Eof, "reader"));
        }
        self.pos = Some(next);
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = None;
        Ok(())
    }

    fn page(&self) -> Option<&[u8]> {
        self.pos.and_then(|p| self.pages.get(p)).map(Vec::as_slice)
    }

    fn pageid(&self) -> Option<PageId> {
        // buffer pages are synthetic; file 0 is reserved for them
        self.pos.map(|p| PageId::new(0, (p * self.pages.first().map_or(0, Vec::len)) as u32))
    }

    fn page_records(&self) -> usize {
        self.pos.and_then(|p| self.nrecs.get(p)).copied().unwrap_or(0)
    }

    fn recsize(&self) -> usize {
        self.recsize
    }

    fn key(&self) -> Option<&[u8]> {
        let p = self.pos?;
        self.page_keys.get(p).map(Vec::as_slice)
    }

    fn ikeys(&self) -> Option<&IndexKeys> {
        self.keys.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::comp::Comp;
    use crate::io::file::CTRL_WRITER;
    use crate::time::{DAWN, DUSK};
    use crate::types::{Edge, PAGE_SIZE, Typ};

    fn file_with_edges(dir: &std::path::Path, id: u32, n: u64) -> File {
        let mut f = File::new(
            id,
            dir.join(id.to_string()),
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
        for i in 0..n {
            let e = Edge {
                edge: 1,
                origin: i,
                destin: 0,
                label: 0,
                timestamp: i as i64,
                weight: 0,
                weight2: 0,
                wtype: Typ::Nothing,
                wtype2: Typ::Nothing,
            };
            f.push_record(&e.to_bytes()).unwrap();
        }
        f.close().unwrap();
        f
    }

    #[test]
    fn fullscan_visits_every_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let f1 = file_with_edges(dir.path(), 1, 200);
        let f2 = file_with_edges(dir.path(), 2, 100);
        let mut r = Fullscan::new(vec![f1.fresh_copy(), f2.fresh_copy()]).unwrap();
        let mut count = 0;
        while r.move_next().is_ok() {
            count += r.page_records();
        }
        assert_eq!(count, 300);
        r.rewind().unwrap();
        let mut again = 0;
        while r.move_next().is_ok() {
            again += r.page_records();
        }
        assert_eq!(again, 300);
    }

    #[test]
    fn read_copies_matching_pages() {
        let dir = tempfile::tempdir().unwrap();
        let f = file_with_edges(dir.path(), 1, 256);
        let mut r = Fullscan::new(vec![f.fresh_copy()]).unwrap();
        let mut buf = vec![0u8; 3 * PAGE_SIZE];
        let n = crate::reader::read_into(&mut r, &mut buf).unwrap();
        assert_eq!(n, 256 * 64);
        assert_eq!(crate::types::read_u64(&buf[64..], crate::types::OFF_ORIGIN), 1);
    }

    #[test]
    fn buffer_sorts_by_keys() {
        use crate::types::{Content, OFF_ORIGIN};
        let dir = tempfile::tempdir().unwrap();
        let f = file_with_edges(dir.path(), 1, 50);
        let keys = IndexKeys::new(Content::Edge, vec![OFF_ORIGIN as u16]);
        let mut r =
            Buffer::bufidx(vec![f.fresh_copy()], keys, Ord_::Desc, None, None).unwrap();
        r.move_next().unwrap();
        let page = r.page().unwrap();
        assert_eq!(crate::types::read_u64(page, OFF_ORIGIN), 49);
    }

    #[test]
    fn tail_buffer_sees_only_tail() {
        let dir = tempfile::tempdir().unwrap();
        let f = file_with_edges(dir.path(), 1, 130); // 128 in page 0, 2 in tail
        let mut r = Buffer::from_tail(f.fresh_copy(), PAGE_SIZE as u32).unwrap();
        r.move_next().unwrap();
        assert_eq!(r.page_records(), 2);
        assert!(r.move_next().unwrap_err().is_eof());
    }
}
