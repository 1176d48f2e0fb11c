use crate::errof;
use crate::errors::Result;
use crate::index::SlotMask;
use crate::reader::Reader;
use crate::sort::IndexKeys;
use crate::types::{PageId, Time};

/// Concatenation of subreaders: consumes each in order.
pub struct Seq {
    subs: Vec<Box<dyn Reader>>,
    cur: usize,
}

impl Seq {
    pub fn new(subs: Vec<Box<dyn Reader>>) -> Result<Self> {
        if subs.is_empty() {
            return Err(errof!(Invalid, "reader", "seq without subreaders"));
        }
        Ok(Self { subs, cur: 0 })
    }
}

impl Reader for Seq {
    fn move_next(&mut self) -> Result<()> {
        loop {
            if self.cur >= self.subs.len() {
                return Err(errof!(Eof, "reader"));
            }
            match self.subs[self.cur].move_next() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_eof() => self.cur += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        for s in &mut self.subs {
            s.rewind()?;
        }
        self.cur = 0;
        Ok(())
    }

    fn page(&self) -> Option<&[u8]> {
        self.subs.get(self.cur).and_then(|s| s.page())
    }

    fn pageid(&self) -> Option<PageId> {
        self.subs.get(self.cur).and_then(|s| s.pageid())
    }

    fn page_records(&self) -> usize {
        self.subs.get(self.cur).map_or(0, |s| s.page_records())
    }

    fn recsize(&self) -> usize {
        self.subs[0].recsize()
    }

    fn key(&self) -> Option<&[u8]> {
        self.subs.get(self.cur).and_then(|s| s.key())
    }

    fn ikeys(&self) -> Option<&IndexKeys> {
        self.subs.get(self.cur).and_then(|s| s.ikeys())
    }

    fn slot_mask(&self) -> Option<SlotMask> {
        self.subs.get(self.cur).and_then(|s| s.slot_mask())
    }

    fn row_count(&self) -> Option<u64> {
        self.subs.get(self.cur).and_then(|s| s.row_count())
    }

    fn skip_key(&mut self) -> Result<()> {
        if self.cur >= self.subs.len() {
            return Err(errof!(Eof, "reader"));
        }
        self.subs[self.cur].skip_key()
    }

    fn set_period(&mut self, start: Time, end: Time) {
        for s in &mut self.subs {
            s.set_period(start, end);
        }
    }
}

/// K-way merge of subreaders by the active key ordering. A small bitmap
/// tracks which subreaders must advance before the next pick.
pub struct Merge {
    subs: Vec<Box<dyn Reader>>,
    keys: IndexKeys,
    /// Bit i set: sub i needs a move before it can compete.
    moved: u32,
    /// Bit i set: sub i is exhausted.
    done: u32,
    cur: Option<usize>,
}

impl Merge {
    pub fn new(subs: Vec<Box<dyn Reader>>, keys: IndexKeys) -> Result<Self> {
        if subs.is_empty() || subs.len() > 32 {
            return Err(errof!(Invalid, "reader", "merge arity out of range"));
        }
        let moved = (1u32 << subs.len()) - 1;
        Ok(Self { subs, keys, moved, done: 0, cur: None })
    }

    fn advance_marked(&mut self) -> Result<()> {
        for i in 0..self.subs.len() {
            let bit = 1u32 << i;
            if self.moved & bit == 0 || self.done & bit != 0 {
                continue;
            }
            match self.subs[i].move_next() {
                Ok(()) => {}
                Err(e) if e.is_eof() => self.done |= bit,
                Err(e) => return Err(e),
            }
            self.moved &= !bit;
        }
        Ok(())
    }
}

impl Reader for Merge {
    fn move_next(&mut self) -> Result<()> {
        self.advance_marked()?;
        let mut best: Option<usize> = None;
        for i in 0..self.subs.len() {
            if self.done & (1 << i) != 0 {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let (ki, kj) = (self.subs[i].key(), self.subs[j].key());
                    match (ki, kj) {
                        (Some(a), Some(b))
                            if self.keys.compare_keys(a, b) == std::cmp::Ordering::Less =>
                        {
                            Some(i)
                        }
                        _ => Some(j),
                    }
                }
            };
        }
        match best {
            None => {
                self.cur = None;
                Err(errof!(Eof, "reader"))
            }
            Some(i) => {
                self.cur = Some(i);
                self.moved |= 1 << i;
                Ok(())
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        for s in &mut self.subs {
            s.rewind()?;
        }
        self.moved = (1u32 << self.subs.len()) - 1;
        self.done = 0;
        self.cur = None;
        Ok(())
    }

    fn page(&self) -> Option<&[u8]> {
        self.cur.and_then(|i| self.subs[i].page())
    }

    fn pageid(&self) -> Option<PageId> {
        self.cur.and_then(|i| self.subs[i].pageid())
    }

    fn page_records(&self) -> usize {
        self.cur.map_or(0, |i| self.subs[i].page_records())
    }

    fn recsize(&self) -> usize {
        self.subs[0].recsize()
    }

    fn key(&self) -> Option<&[u8]> {
        self.cur.and_then(|i| self.subs[i].key())
    }

    fn ikeys(&self) -> Option<&IndexKeys> {
        Some(&self.keys)
    }

    fn slot_mask(&self) -> Option<SlotMask> {
        self.cur.and_then(|i| self.subs[i].slot_mask())
    }

    fn set_period(&mut self, start: Time, end: Time) {
        for s in &mut self.subs {
            s.set_period(start, end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::comp::Comp;
    use crate::io::file::{CTRL_WRITER, File};
    use crate::reader::scan::Buffer;
    use crate::time::{DAWN, DUSK};
    use crate::types::{Content, Edge, OFF_ORIGIN, Ord_, PAGE_SIZE, Typ, read_u64};

    fn file_with_origins(dir: &std::path::Path, id: u32, origins: &[u64]) -> File {
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
        for &o in origins {
            let e = Edge {
                edge: 1,
                origin: o,
                destin: 0,
                label: 0,
                timestamp: 0,
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
    fn seq_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let f1 = file_with_origins(dir.path(), 1, &[1, 2]);
        let f2 = file_with_origins(dir.path(), 2, &[3]);
        let b1 = Buffer::new(vec![f1.fresh_copy()]).unwrap();
        let b2 = Buffer::new(vec![f2.fresh_copy()]).unwrap();
        let mut s = Seq::new(vec![Box::new(b1), Box::new(b2)]).unwrap();
        let mut total = 0;
        while s.move_next().is_ok() {
            total += s.page_records();
        }
        assert_eq!(total, 3);
    }

    #[test]
    fn merge_orders_subreaders_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = IndexKeys::new(Content::Edge, vec![OFF_ORIGIN as u16]);
        let f1 = file_with_origins(dir.path(), 1, &[5]);
        let f2 = file_with_origins(dir.path(), 2, &[2]);
        let b1 =
            Buffer::bufidx(vec![f1.fresh_copy()], keys.clone(), Ord_::Asc, None, None).unwrap();
        let b2 =
            Buffer::bufidx(vec![f2.fresh_copy()], keys.clone(), Ord_::Asc, None, None).unwrap();
        let mut m = Merge::new(vec![Box::new(b1), Box::new(b2)], keys).unwrap();
        let mut seen = Vec::new();
        while m.move_next().is_ok() {
            let page = m.page().unwrap();
            seen.push(read_u64(page, OFF_ORIGIN));
        }
        assert_eq!(seen, vec![2, 5]);
    }
}
