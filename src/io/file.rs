use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::io::comp::{Comp, CompPool};
use crate::time::{DAWN, DUSK};
use crate::types::Time;
use memmap2::MmapMut;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Size of one mapped window on a writer file.
pub const MAPSIZE: u32 = 8 * 1024 * 1024;

/// Mode flags of a file descriptor.
pub const CTRL_WRITER: u8 = 1;
pub const CTRL_SPARE: u8 = 2;
pub const CTRL_READER: u8 = 4;
pub const CTRL_SORT: u8 = 8;

pub const BLOCK_HDR_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Closed,
    Open,
    Mapped,
}

/// Header preceding each stored block of a compressed reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Live mask: a set bit means the slot is not deleted.
    pub set: [u64; 2],
    /// Compressed size of the block body.
    pub size: u32,
    pub reserve4: u32,
    pub reserve8: u64,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self { set: [u64::MAX, u64::MAX], size: 0, reserve4: 0, reserve8: 0 }
    }
}

impl BlockHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_HDR_SIZE] {
        let mut b = [0u8; BLOCK_HDR_SIZE];
        b[0..8].copy_from_slice(&self.set[0].to_le_bytes());
        b[8..16].copy_from_slice(&self.set[1].to_le_bytes());
        b[16..20].copy_from_slice(&self.size.to_le_bytes());
        b[20..24].copy_from_slice(&self.reserve4.to_le_bytes());
        b[24..32].copy_from_slice(&self.reserve8.to_le_bytes());
        b
    }

    #[must_use]
    pub fn decode(b: &[u8]) -> Self {
        Self {
            set: [
                u64::from_le_bytes(b[0..8].try_into().expect("8 bytes")),
                u64::from_le_bytes(b[8..16].try_into().expect("8 bytes")),
            ],
            size: u32::from_le_bytes(b[16..20].try_into().expect("4 bytes")),
            reserve4: u32::from_le_bytes(b[20..24].try_into().expect("4 bytes")),
            reserve8: u64::from_le_bytes(b[24..32].try_into().expect("8 bytes")),
        }
    }
}

/// A fixed-capacity on-disk unit. Writers are memory-mapped at the current
/// position; readers are read block-wise through a buffer, decompressing
/// ZSTD blocks on the fly.
pub struct File {
    pub id: crate::types::FileId,
    pub order: u32,
    pub path: PathBuf,
    /// Used size in stored bytes (compressed size for ZSTD readers).
    pub size: u32,
    pub capacity: u32,
    pub blocksize: u32,
    pub recordsize: u32,
    pub ctrl: u8,
    pub comp: Comp,
    /// Reserved; must be 0.
    pub encp: u32,
    pub grain: Time,
    pub oldest: Time,
    pub newest: Time,

    state: FileState,
    /// Current physical position (stored bytes).
    pos: u32,
    dirty: bool,
    handle: Option<std::fs::File>,
    map: Option<MmapMut>,
    map_off: u32,
    /// Current block, decompressed.
    tmp: Vec<u8>,
    hdr: BlockHeader,
    /// Physical offsets of blocks, built on open for compressed readers.
    blocks: Vec<u32>,
    /// Index of the current block within `blocks` / the flat image.
    cur_block: Option<u32>,
    pool: Option<Arc<CompPool>>,
}

impl File {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: crate::types::FileId,
        path: PathBuf,
        capacity: u32,
        size: u32,
        blocksize: u32,
        recordsize: u32,
        ctrl: u8,
        comp: Comp,
        encp: u32,
        grain: Time,
        oldest: Time,
        newest: Time,
    ) -> Self {
        Self {
            id,
            order: 0,
            path,
            size,
            capacity,
            blocksize,
            recordsize,
            ctrl,
            comp,
            encp,
            grain,
            oldest,
            newest,
            state: FileState::Closed,
            pos: 0,
            dirty: false,
            handle: None,
            map: None,
            map_off: 0,
            tmp: Vec::new(),
            hdr: BlockHeader::default(),
            blocks: Vec::new(),
            cur_block: None,
            pool: None,
        }
    }

    /// Descriptor copy: same metadata, closed state. Used when a store
    /// hands files out to readers.
    #[must_use]
    pub fn fresh_copy(&self) -> Self {
        let mut f = Self::new(
            self.id,
            self.path.clone(),
            self.capacity,
            self.size,
            self.blocksize,
            self.recordsize,
            self.ctrl,
            self.comp,
            self.encp,
            self.grain,
            self.oldest,
            self.newest,
        );
        f.order = self.order;
        f.pool = self.pool.clone();
        f
    }

    pub fn set_pool(&mut self, pool: Arc<CompPool>) {
        self.pool = Some(pool);
    }

    #[must_use]
    pub fn state(&self) -> FileState {
        self.state
    }

    #[must_use]
    pub fn is_writer(&self) -> bool {
        self.ctrl & CTRL_WRITER != 0
    }

    #[must_use]
    pub fn is_reader(&self) -> bool {
        self.ctrl & CTRL_READER != 0
    }

    #[must_use]
    pub fn is_spare(&self) -> bool {
        self.ctrl & CTRL_SPARE != 0
    }

    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.ctrl & CTRL_SORT != 0
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Records per page.
    #[must_use]
    pub fn per_page(&self) -> u32 {
        self.blocksize / self.recordsize
    }

    /// Number of stored pages, counting a partial tail page. For
    /// compressed files valid after `open`.
    #[must_use]
    pub fn npages(&self) -> u32 {
        match self.comp {
            Comp::Flat => self.size.div_ceil(self.blocksize),
            Comp::Zstd => self.blocks.len() as u32,
        }
    }

    /// Does the (oldest, newest) range intersect the inclusive period?
    #[must_use]
    pub fn in_period(&self, start: Time, end: Time) -> bool {
        if self.oldest == DAWN && self.newest == DUSK {
            return true; // range unknown
        }
        self.oldest <= end && self.newest >= start
    }

    pub fn mark_stamp(&mut self, t: Time) {
        if self.oldest == DAWN || t < self.oldest {
            self.oldest = t;
        }
        if self.newest == DUSK || t > self.newest {
            self.newest = t;
        }
    }

    pub fn reset_stamps(&mut self) {
        self.oldest = DAWN;
        self.newest = DUSK;
    }

    // ---- mode changes ---------------------------------------------------

    pub fn make_writer(&mut self) -> Result<()> {
        if self.state == FileState::Mapped {
            return Err(errof!(Invalid, "file", "mode change on mapped file"));
        }
        self.ctrl = CTRL_WRITER;
        self.comp = Comp::Flat;
        Ok(())
    }

    pub fn make_reader(&mut self) -> Result<()> {
        if self.state == FileState::Mapped {
            return Err(errof!(Invalid, "file", "mode change on mapped file"));
        }
        self.ctrl = (self.ctrl & CTRL_SORT) | CTRL_READER;
        Ok(())
    }

    pub fn make_spare(&mut self) -> Result<()> {
        if self.state == FileState::Mapped {
            return Err(errof!(Invalid, "file", "mode change on mapped file"));
        }
        self.ctrl = CTRL_SPARE;
        self.comp = Comp::Flat;
        self.size = 0;
        self.reset_stamps();
        Ok(())
    }

    // ---- lifecycle -------------------------------------------------------

    /// Create the file on disk, pre-sized to its capacity so a writer map
    /// always has backing bytes.
    pub fn create(&mut self) -> Result<()> {
        if self.path.exists() {
            return Err(errof!(Create, "file", "exists: {}", self.path.display()));
        }
        let f = std::fs::File::create(&self.path)
            .map_err(|e| NowError::os(ErrorKind::Create, "file", &e))?;
        f.set_len(u64::from(self.capacity))
            .map_err(|e| NowError::os(ErrorKind::Trunc, "file", &e))?;
        Ok(())
    }

    pub fn remove(&mut self) -> Result<()> {
        if self.state != FileState::Closed {
            self.close()?;
        }
        std::fs::remove_file(&self.path)
            .map_err(|e| NowError::os(ErrorKind::Remove, "file", &e))
    }

    /// Drop all content: the file keeps its capacity but reads as zero.
    pub fn erase(&mut self) -> Result<()> {
        let was_open = self.state != FileState::Closed;
        if !was_open {
            self.open()?;
        }
        let h = self.handle.as_mut().expect("open file has handle");
        h.set_len(0)
            .map_err(|e| NowError::os(ErrorKind::Trunc, "file", &e))?;
        h.set_len(u64::from(self.capacity))
            .map_err(|e| NowError::os(ErrorKind::Trunc, "file", &e))?;
        self.size = 0;
        self.pos = 0;
        self.blocks.clear();
        self.cur_block = None;
        self.reset_stamps();
        if !was_open {
            self.close()?;
        }
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        if self.state != FileState::Closed {
            return Ok(());
        }
        if self.encp != 0 {
            return Err(errof!(NotSupp, "file", "encryption is reserved"));
        }
        let handle = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| NowError::os(ErrorKind::Open, "file", &e))?;
        self.handle = Some(handle);
        self.state = FileState::Open;
        self.pos = 0;
        self.cur_block = None;
        if self.comp == Comp::Zstd {
            self.scan_blocks()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == FileState::Mapped {
            self.umap()?;
        }
        self.handle = None;
        self.state = FileState::Closed;
        self.tmp.clear();
        Ok(())
    }

    /// Walk the stored block headers once to learn each block's physical
    /// offset; lets a compressed file resolve logical page offsets.
    fn scan_blocks(&mut self) -> Result<()> {
        self.blocks.clear();
        let h = self.handle.as_mut().expect("open file has handle");
        let mut off: u32 = 0;
        let mut hdr = [0u8; BLOCK_HDR_SIZE];
        while off < self.size {
            h.seek(SeekFrom::Start(u64::from(off)))
                .map_err(|e| NowError::os(ErrorKind::Seek, "file", &e))?;
            h.read_exact(&mut hdr)
                .map_err(|e| NowError::os(ErrorKind::Read, "file", &e))?;
            let bh = BlockHeader::decode(&hdr);
            if bh.size == 0 || off + BLOCK_HDR_SIZE as u32 + bh.size > self.size {
                return Err(errof!(BadBlock, "file", "corrupt block at {off}"));
            }
            self.blocks.push(off);
            off += BLOCK_HDR_SIZE as u32 + bh.size;
        }
        Ok(())
    }

    // ---- writer (mmap) ---------------------------------------------------

    pub fn map(&mut self) -> Result<()> {
        self.map_at(0)
    }

    /// Map a window starting at `pos` (page-aligned).
    pub fn map_at(&mut self, pos: u32) -> Result<()> {
        if self.state == FileState::Closed {
            self.open()?;
        }
        if self.state == FileState::Mapped {
            self.umap()?;
        }
        if pos % self.blocksize != 0 || pos >= self.capacity {
            return Err(errof!(Invalid, "file", "bad map position {pos}"));
        }
        let len = MAPSIZE.min(self.capacity - pos);
        let h = self.handle.as_ref().expect("open file has handle");
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(u64::from(pos))
                .len(len as usize)
                .map_mut(h)
        }
        .map_err(|e| NowError::os(ErrorKind::Map, "file", &e))?;
        self.map = Some(map);
        self.map_off = pos;
        self.state = FileState::Mapped;
        Ok(())
    }

    pub fn umap(&mut self) -> Result<()> {
        if self.state != FileState::Mapped {
            return Ok(());
        }
        if self.dirty {
            self.sync()?;
        }
        self.map = None;
        self.state = FileState::Open;
        Ok(())
    }

    /// Flush the active map.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()
                .map_err(|e| NowError::os(ErrorKind::Sync, "file", &e))?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Append one record at `size`; valid on a mapped writer. Remaps the
    /// window when the record would cross its end.
    pub fn push_record(&mut self, rec: &[u8]) -> Result<()> {
        if self.state != FileState::Mapped || !self.is_writer() {
            return Err(errof!(Invalid, "file", "push on non-mapped writer"));
        }
        let recsize = rec.len() as u32;
        if self.size + recsize > self.capacity {
            return Err(errof!(TooBig, "file", "writer full"));
        }
        // records never straddle a page boundary
        let mut at = self.size;
        let room = self.blocksize - at % self.blocksize;
        if room < recsize {
            at += room;
            if at + recsize > self.capacity {
                return Err(errof!(TooBig, "file", "writer full"));
            }
        }
        let map_len = self.map.as_ref().expect("mapped").len() as u32;
        if at + recsize > self.map_off + map_len {
            let newoff = at - at % self.blocksize;
            self.map_at(newoff)?;
        }
        let base = (at - self.map_off) as usize;
        let map = self.map.as_mut().expect("mapped");
        map[base..base + rec.len()].copy_from_slice(rec);
        self.size = at + recsize;
        self.dirty = true;
        Ok(())
    }

    /// The live bytes of the current map window (writer diagnostics and
    /// buffer readers over the writer tail).
    #[must_use]
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.map.as_deref()
    }

    /// One whole page out of the current map window, by file offset.
    #[must_use]
    pub fn mapped_page(&self, page_off: u32) -> Option<&[u8]> {
        let map = self.map.as_deref()?;
        if page_off < self.map_off {
            return None;
        }
        let base = (page_off - self.map_off) as usize;
        let end = base + self.blocksize as usize;
        (end <= map.len()).then(|| &map[base..end])
    }

    #[must_use]
    pub fn map_offset(&self) -> u32 {
        self.map_off
    }

    // ---- reader (buffered) -----------------------------------------------

    /// Append one page to a reader file, compressing when configured.
    /// Valid on an open (not mapped) reader positioned at its end.
    pub fn write_buf(&mut self, buf: &[u8]) -> Result<()> {
        if self.state != FileState::Open || !self.is_reader() {
            return Err(errof!(Invalid, "file", "writeBuf on non-open reader"));
        }
        if buf.len() != self.blocksize as usize {
            return Err(errof!(Invalid, "file", "writeBuf size != blocksize"));
        }
        let h = self.handle.as_mut().expect("open file has handle");
        h.seek(SeekFrom::Start(u64::from(self.size)))
            .map_err(|e| NowError::os(ErrorKind::Seek, "file", &e))?;
        match self.comp {
            Comp::Flat => {
                h.write_all(buf)
                    .map_err(|e| NowError::os(ErrorKind::Write, "file", &e))?;
                self.size += self.blocksize;
            }
            Comp::Zstd => {
                let pool = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| errof!(Comp, "file", "no compression pool"))?;
                let bound = buf.len() + buf.len() / 128 + 128;
                let mut aux = vec![0u8; bound];
                let csize = {
                    let cctx = pool.get_cctx()?;
                    cctx.compress(buf, &mut aux)?
                };
                let hdr = BlockHeader {
                    set: [u64::MAX, u64::MAX],
                    size: csize as u32,
                    reserve4: 0,
                    reserve8: 0,
                };
                let mut out = Vec::with_capacity(BLOCK_HDR_SIZE + csize);
                out.extend_from_slice(&hdr.encode());
                out.extend_from_slice(&aux[..csize]);
                let h = self.handle.as_mut().expect("open file has handle");
                h.write_all(&out)
                    .map_err(|e| NowError::os(ErrorKind::Write, "file", &e))?;
                self.blocks.push(self.size);
                self.size += out.len() as u32;
            }
        }
        Ok(())
    }

    /// Reset the read cursor to the first block.
    pub fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        self.cur_block = None;
        self.tmp.clear();
        Ok(())
    }

    /// Position the cursor on the block holding the logical offset `pos`
    /// (multiple of the blocksize).
    pub fn position(&mut self, pos: u32) -> Result<()> {
        if pos % self.blocksize != 0 {
            return Err(errof!(Invalid, "file", "position not block-aligned"));
        }
        let block = pos / self.blocksize;
        match self.comp {
            Comp::Flat => {
                if pos > self.size {
                    return Err(errof!(Eof, "file"));
                }
                self.pos = pos;
            }
            Comp::Zstd => {
                if block as usize > self.blocks.len() {
                    return Err(errof!(Eof, "file"));
                }
                self.pos = if (block as usize) < self.blocks.len() {
                    self.blocks[block as usize]
                } else {
                    self.size
                };
            }
        }
        self.cur_block = None;
        Ok(())
    }

    /// Advance the cursor one block and load it. `Eof` past the last block.
    pub fn move_next(&mut self) -> Result<()> {
        if self.state == FileState::Closed {
            return Err(errof!(Invalid, "file", "move on closed file"));
        }
        let next = match self.cur_block {
            None => self.cur_page_index(),
            Some(b) => b + 1,
        };
        if next >= self.npages() {
            return Err(errof!(Eof, "file"));
        }
        self.cur_block = Some(next);
        self.load_block()
    }

    fn cur_page_index(&self) -> u32 {
        match self.comp {
            Comp::Flat => self.pos / self.blocksize,
            Comp::Zstd => self
                .blocks
                .iter()
                .position(|&o| o >= self.pos)
                .unwrap_or(self.blocks.len()) as u32,
        }
    }

    /// Load the block the cursor is on into the page buffer.
    pub fn load_block(&mut self) -> Result<()> {
        let block = self.cur_block.unwrap_or(0);
        if block >= self.npages() {
            return Err(errof!(Eof, "file"));
        }
        self.tmp.resize(self.blocksize as usize, 0);
        match self.comp {
            Comp::Flat => {
                let off = block * self.blocksize;
                let want = self.blocksize.min(self.size - off) as usize;
                let h = self.handle.as_mut().expect("open file has handle");
                h.seek(SeekFrom::Start(u64::from(off)))
                    .map_err(|e| NowError::os(ErrorKind::Seek, "file", &e))?;
                let mut tmp = std::mem::take(&mut self.tmp);
                tmp[want..].fill(0);
                h.read_exact(&mut tmp[..want])
                    .map_err(|e| NowError::os(ErrorKind::Read, "file", &e))?;
                self.tmp = tmp;
                self.hdr = BlockHeader::default();
                self.pos = off;
            }
            Comp::Zstd => {
                self.load_header_at(block)?;
                let off = self.blocks[block as usize] + BLOCK_HDR_SIZE as u32;
                let mut body = vec![0u8; self.hdr.size as usize];
                let h = self.handle.as_mut().expect("open file has handle");
                h.seek(SeekFrom::Start(u64::from(off)))
                    .map_err(|e| NowError::os(ErrorKind::Seek, "file", &e))?;
                h.read_exact(&mut body)
                    .map_err(|e| NowError::os(ErrorKind::Read, "file", &e))?;
                let pool = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| errof!(Decomp, "file", "no compression pool"))?;
                let mut tmp = std::mem::take(&mut self.tmp);
                let n = pool.get_dctx().decompress(&body, &mut tmp)?;
                self.tmp = tmp;
                if n != self.blocksize as usize {
                    return Err(errof!(BadBlock, "file", "short block {n}"));
                }
                self.pos = self.blocks[block as usize];
            }
        }
        Ok(())
    }

    /// Load only the header of the current block.
    pub fn load_header(&mut self) -> Result<()> {
        let block = self.cur_block.unwrap_or(0);
        if self.comp == Comp::Flat {
            self.hdr = BlockHeader::default();
            return Ok(());
        }
        self.load_header_at(block)
    }

    fn load_header_at(&mut self, block: u32) -> Result<()> {
        let off = self.blocks[block as usize];
        let h = self.handle.as_mut().expect("open file has handle");
        h.seek(SeekFrom::Start(u64::from(off)))
            .map_err(|e| NowError::os(ErrorKind::Seek, "file", &e))?;
        let mut hdr = [0u8; BLOCK_HDR_SIZE];
        h.read_exact(&mut hdr)
            .map_err(|e| NowError::os(ErrorKind::Read, "file", &e))?;
        self.hdr = BlockHeader::decode(&hdr);
        Ok(())
    }

    /// The current page (valid after `move_next` / `load_block`).
    #[must_use]
    pub fn page(&self) -> &[u8] {
        &self.tmp
    }

    /// Valid records in the current page: a flat tail page may be partial.
    #[must_use]
    pub fn page_records(&self) -> u32 {
        match self.comp {
            Comp::Zstd => self.per_page(),
            Comp::Flat => {
                let off = self.cur_block.unwrap_or(0) * self.blocksize;
                self.blocksize.min(self.size.saturating_sub(off)) / self.recordsize
            }
        }
    }

    #[must_use]
    pub fn header(&self) -> &BlockHeader {
        &self.hdr
    }

    /// Logical offset of the current page within the uncompressed image.
    #[must_use]
    pub fn page_offset(&self) -> u32 {
        self.cur_block.unwrap_or(0) * self.blocksize
    }

    /// Jump directly to the page at a logical offset and load it.
    pub fn load_page_at(&mut self, logical: u32) -> Result<()> {
        if logical % self.blocksize != 0 {
            return Err(errof!(Invalid, "file", "page offset not aligned"));
        }
        let block = logical / self.blocksize;
        if block >= self.npages() {
            return Err(errof!(Eof, "file"));
        }
        self.cur_block = Some(block);
        self.load_block()
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("ctrl", &self.ctrl)
            .field("comp", &self.comp)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PAGE_SIZE;

    fn writer(dir: &std::path::Path, cap: u32) -> File {
        let mut f = File::new(
            1,
            dir.join("1"),
            cap,
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
        f
    }

    #[test]
    fn writer_append_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = writer(dir.path(), 1024 * 1024);
        f.map().unwrap();
        let rec = [7u8; 64];
        for _ in 0..200 {
            f.push_record(&rec).unwrap();
        }
        assert_eq!(f.size, 200 * 64);
        f.close().unwrap();

        f.make_reader().unwrap();
        f.open().unwrap();
        f.move_next().unwrap();
        assert_eq!(&f.page()[0..64], &rec);
        assert_eq!(f.page_offset(), 0);
        f.move_next().unwrap();
        // second page holds the records past the first page
        assert_eq!(&f.page()[0..64], &rec);
        let e = f.move_next().unwrap_err();
        assert!(e.is_eof());
    }

    #[test]
    fn exact_fill_without_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let cap = 2 * PAGE_SIZE as u32;
        let mut f = writer(dir.path(), cap);
        f.map().unwrap();
        let rec = [1u8; 64];
        let n = cap / 64;
        for _ in 0..n {
            f.push_record(&rec).unwrap();
        }
        assert_eq!(f.size, cap);
        assert!(f.push_record(&rec).unwrap_err().is(ErrorKind::TooBig));
    }

    #[test]
    fn compressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(CompPool::new(dir.path(), 2, 2));
        let mut f = File::new(
            2,
            dir.path().join("2"),
            8 * 1024 * 1024,
            0,
            PAGE_SIZE as u32,
            64,
            CTRL_READER,
            Comp::Zstd,
            0,
            0,
            DAWN,
            DUSK,
        );
        f.set_pool(Arc::clone(&pool));
        f.create().unwrap();
        // a fresh compressed reader starts from zero stored bytes
        f.erase().unwrap();
        f.open().unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        f.write_buf(&page).unwrap();
        f.write_buf(&page).unwrap();
        assert!(f.size < 2 * PAGE_SIZE as u32);
        f.close().unwrap();

        f.open().unwrap();
        assert_eq!(f.npages(), 2);
        f.move_next().unwrap();
        assert_eq!(f.page(), &page[..]);
        f.load_page_at(PAGE_SIZE as u32).unwrap();
        assert_eq!(f.page(), &page[..]);
        assert_eq!(f.page_offset(), PAGE_SIZE as u32);
    }

    #[test]
    fn erase_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = writer(dir.path(), 1024 * 1024);
        f.map().unwrap();
        f.push_record(&[9u8; 64]).unwrap();
        f.close().unwrap();
        f.erase().unwrap();
        assert_eq!(f.size, 0);
        f.make_spare().unwrap();
        assert!(f.is_spare());
    }
}
