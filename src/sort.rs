use crate::types::{
    Content, OFF_PROP, OFF_ROLE, OFF_TMSTMP, OFF_VERTEX, read_i64, read_u32, read_u64,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Ordered list of record offsets making up a composite index key. The
/// offset encodes the field: all fields are 8 bytes except the vertex
/// role (4 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKeys {
    pub content: Content,
    pub offs: Vec<u16>,
}

impl IndexKeys {
    #[must_use]
    pub fn new(content: Content, offs: Vec<u16>) -> Self {
        Self { content, offs }
    }

    #[must_use]
    pub fn field_size(&self, off: u16) -> usize {
        if self.content == Content::Vertex && off as usize == OFF_ROLE { 4 } else { 8 }
    }

    /// Total size of the composite key in bytes.
    #[must_use]
    pub fn keysize(&self) -> usize {
        self.offs.iter().map(|&o| self.field_size(o)).sum()
    }

    /// Concatenate the key fields of a record in declared order.
    #[must_use]
    pub fn extract(&self, rec: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.keysize());
        for &off in &self.offs {
            key.extend_from_slice(&rec[off as usize..off as usize + self.field_size(off)]);
        }
        key
    }

    fn field_cmp(&self, off: u16, a: &[u8], b: &[u8]) -> Ordering {
        let o = off as usize;
        if self.content == Content::Edge && o == OFF_TMSTMP {
            return read_i64(a, o).cmp(&read_i64(b, o));
        }
        if self.content == Content::Vertex && o == OFF_ROLE {
            return read_u32(a, o).cmp(&read_u32(b, o));
        }
        read_u64(a, o).cmp(&read_u64(b, o))
    }

    /// Compare two records by the key fields; ties are broken by natural
    /// field order over the whole record.
    #[must_use]
    pub fn compare_records(&self, a: &[u8], b: &[u8]) -> Ordering {
        for &off in &self.offs {
            let c = self.field_cmp(off, a, b);
            if c != Ordering::Equal {
                return c;
            }
        }
        a.cmp(b)
    }

    /// Rewrite an extracted key into an order-preserving byte string:
    /// fields become big-endian, the signed timestamp gets its sign bit
    /// flipped. Lexicographic order of mangled keys equals field order.
    #[must_use]
    pub fn mangle(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len());
        let mut pos = 0;
        for &off in &self.offs {
            let sz = self.field_size(off);
            let f = &key[pos..pos + sz];
            if sz == 4 {
                out.extend_from_slice(
                    &u32::from_le_bytes(f.try_into().expect("4 bytes")).to_be_bytes(),
                );
            } else if self.content == Content::Edge && off as usize == OFF_TMSTMP {
                let v = i64::from_le_bytes(f.try_into().expect("8 bytes"));
                out.extend_from_slice(&((v as u64) ^ (1 << 63)).to_be_bytes());
            } else {
                out.extend_from_slice(
                    &u64::from_le_bytes(f.try_into().expect("8 bytes")).to_be_bytes(),
                );
            }
            pos += sz;
        }
        out
    }

    /// Inverse of `mangle`.
    #[must_use]
    pub fn unmangle(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len());
        let mut pos = 0;
        for &off in &self.offs {
            let sz = self.field_size(off);
            let f = &key[pos..pos + sz];
            if sz == 4 {
                out.extend_from_slice(
                    &u32::from_be_bytes(f.try_into().expect("4 bytes")).to_le_bytes(),
                );
            } else if self.content == Content::Edge && off as usize == OFF_TMSTMP {
                let v = u64::from_be_bytes(f.try_into().expect("8 bytes")) ^ (1 << 63);
                out.extend_from_slice(&v.to_le_bytes());
            } else {
                out.extend_from_slice(
                    &u64::from_be_bytes(f.try_into().expect("8 bytes")).to_le_bytes(),
                );
            }
            pos += sz;
        }
        out
    }

    /// Compare two extracted composite keys field-wise.
    #[must_use]
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        let mut pos = 0;
        for &off in &self.offs {
            let sz = self.field_size(off);
            let (fa, fb) = (&a[pos..pos + sz], &b[pos..pos + sz]);
            let c = if sz == 4 {
                u32::from_le_bytes(fa.try_into().expect("4 bytes"))
                    .cmp(&u32::from_le_bytes(fb.try_into().expect("4 bytes")))
            } else if self.content == Content::Edge && off as usize == OFF_TMSTMP {
                i64::from_le_bytes(fa.try_into().expect("8 bytes"))
                    .cmp(&i64::from_le_bytes(fb.try_into().expect("8 bytes")))
            } else {
                u64::from_le_bytes(fa.try_into().expect("8 bytes"))
                    .cmp(&u64::from_le_bytes(fb.try_into().expect("8 bytes")))
            };
            if c != Ordering::Equal {
                return c;
            }
            pos += sz;
        }
        Ordering::Equal
    }
}

/// Record comparator. Stores persist the tag, never a function pointer.
pub type CmpFn = fn(&[u8], &[u8]) -> Ordering;

/// Sort stamped edges by timestamp.
#[must_use]
pub fn cmp_edge_stamp(a: &[u8], b: &[u8]) -> Ordering {
    read_i64(a, OFF_TMSTMP).cmp(&read_i64(b, OFF_TMSTMP))
}

/// Sort vertex triples by (vertex, property).
#[must_use]
pub fn cmp_vertex_triple(a: &[u8], b: &[u8]) -> Ordering {
    read_u64(a, OFF_VERTEX)
        .cmp(&read_u64(b, OFF_VERTEX))
        .then_with(|| read_u64(a, OFF_PROP).cmp(&read_u64(b, OFF_PROP)))
}

/// Resolve a persisted comparator tag. `none` keeps insertion order.
#[must_use]
pub fn by_tag(tag: &str) -> Option<CmpFn> {
    match tag {
        "edge_stamp" => Some(cmp_edge_stamp),
        "vertex_triple" => Some(cmp_vertex_triple),
        _ => None,
    }
}

/// Collect the records of a page-laid buffer into a packed record list.
/// `used` is the number of valid bytes; a trailing partial page holds
/// `(used % blocksize) / recsize` records.
#[must_use]
pub fn collect_records(
    buf: &[u8],
    used: usize,
    blocksize: usize,
    recsize: usize,
) -> Vec<Vec<u8>> {
    let per_page = blocksize / recsize;
    let mut out = Vec::with_capacity(used / recsize);
    let mut off = 0;
    while off < used {
        let page_bytes = blocksize.min(used - off);
        let n = (page_bytes / recsize).min(per_page);
        for i in 0..n {
            let at = off + i * recsize;
            out.push(buf[at..at + recsize].to_vec());
        }
        off += blocksize;
    }
    out
}

/// In-memory sort of a record list.
pub fn sort_records(records: &mut [Vec<u8>], cmp: CmpFn) {
    records.sort_by(|a, b| cmp(a, b));
}

/// K-way merge of sorted record lists.
#[must_use]
pub fn merge_records(lists: &[Vec<Vec<u8>>], cmp: CmpFn) -> Vec<Vec<u8>> {
    let total: usize = lists.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut cursors = vec![0usize; lists.len()];
    loop {
        let mut best: Option<usize> = None;
        for (i, list) in lists.iter().enumerate() {
            if cursors[i] >= list.len() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    if cmp(&list[cursors[i]], &lists[j][cursors[j]]) == Ordering::Less {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        match best {
            None => break,
            Some(i) => {
                out.push(lists[i][cursors[i]].clone());
                cursors[i] += 1;
            }
        }
    }
    out
}

/// Lay a packed record list back out into pages, zero-padding each tail.
#[must_use]
pub fn to_pages(records: &[Vec<u8>], blocksize: usize, recsize: usize) -> Vec<Vec<u8>> {
    let per_page = blocksize / recsize;
    let mut pages = Vec::with_capacity(records.len().div_ceil(per_page.max(1)));
    for chunk in records.chunks(per_page.max(1)) {
        let mut page = vec![0u8; blocksize];
        for (i, rec) in chunk.iter().enumerate() {
            page[i * recsize..i * recsize + recsize].copy_from_slice(rec);
        }
        pages.push(page);
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, Typ};

    fn edge(ts: i64, origin: u64) -> Vec<u8> {
        Edge {
            edge: 1,
            origin,
            destin: 2,
            label: 0,
            timestamp: ts,
            weight: 0,
            weight2: 0,
            wtype: Typ::Float,
            wtype2: Typ::Nothing,
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn sorts_by_stamp() {
        let mut recs = vec![edge(9, 1), edge(3, 2), edge(7, 3)];
        sort_records(&mut recs, cmp_edge_stamp);
        let stamps: Vec<i64> = recs.iter().map(|r| read_i64(r, OFF_TMSTMP)).collect();
        assert_eq!(stamps, vec![3, 7, 9]);
    }

    #[test]
    fn merge_keeps_order() {
        let a = vec![edge(1, 0), edge(5, 0)];
        let b = vec![edge(2, 0), edge(3, 0), edge(9, 0)];
        let m = merge_records(&[a, b], cmp_edge_stamp);
        let stamps: Vec<i64> = m.iter().map(|r| read_i64(r, OFF_TMSTMP)).collect();
        assert_eq!(stamps, vec![1, 2, 3, 5, 9]);
    }

    #[test]
    fn keys_extract_and_compare() {
        use crate::types::{OFF_DESTIN, OFF_ORIGIN};
        let keys = IndexKeys::new(
            Content::Edge,
            vec![OFF_ORIGIN as u16, OFF_DESTIN as u16],
        );
        assert_eq!(keys.keysize(), 16);
        let r1 = edge(0, 10);
        let r2 = edge(0, 11);
        let (k1, k2) = (keys.extract(&r1), keys.extract(&r2));
        assert_eq!(keys.compare_keys(&k1, &k2), Ordering::Less);
        assert_eq!(keys.compare_records(&r1, &r2), Ordering::Less);
    }

    #[test]
    fn page_layout_roundtrip() {
        let recs: Vec<Vec<u8>> = (0..300u64).map(|i| edge(i as i64, i)).collect();
        let pages = to_pages(&recs, 8192, 64);
        assert_eq!(pages.len(), 3);
        let mut flat = Vec::new();
        for p in &pages {
            flat.extend_from_slice(p);
        }
        let used = 2 * 8192 + (300 - 256) * 64;
        let back = collect_records(&flat, used, 8192, 64);
        assert_eq!(back, recs);
    }
}
