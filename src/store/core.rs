use crate::errof;
use crate::errors::Result;
use crate::index::IndexMan;
use crate::io::comp::{Comp, CompPool};
use crate::io::file::{CTRL_READER, CTRL_SPARE, CTRL_WRITER, File};
use crate::store::catalog::{CatalogEntry, read_catalog, write_catalog};
use crate::time::{DAWN, DUSK};
use crate::types::{Content, FileId, PageId, Time, read_i64, OFF_TMSTMP};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

const CATALOG: &str = "catalog";

pub const DEFAULT_FILESIZE: u32 = 1024 * 1024;
pub const DEFAULT_LARGESIZE: u32 = 8 * 1024 * 1024;

/// Static configuration of a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store directory name; also the index-manager context (`None` for
    /// the vertex store).
    pub name: String,
    pub context: Option<String>,
    pub content: Content,
    pub recsize: u32,
    pub blocksize: u32,
    /// Capacity of writer (and spare) files.
    pub filesize: u32,
    /// Capacity of reader files.
    pub largesize: u32,
    pub comp: Comp,
    /// Comparator tag for the sorter; `None` keeps insertion order.
    pub sort: Option<String>,
    /// Stamped stores maintain (oldest, newest) per file.
    pub stamped: bool,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recsize == 0 || self.blocksize % self.recsize != 0 {
            return Err(errof!(Invalid, "store", "recordsize must divide blocksize"));
        }
        if self.filesize % self.blocksize != 0 || self.largesize % self.blocksize != 0 {
            return Err(errof!(Invalid, "store", "file sizes must be page-aligned"));
        }
        Ok(())
    }
}

struct State {
    open: bool,
    writer: Option<File>,
    spares: VecDeque<File>,
    waiting: Vec<File>,
    readers: BTreeMap<FileId, File>,
    /// Files handed to a sorter and not yet released.
    claimed: HashSet<FileId>,
    nextid: FileId,
}

/// Per-table controller of files: one writer, a FIFO of spares, the
/// waiting list and the reader set, plus the persisted catalog.
pub struct Store {
    pub cfg: StoreConfig,
    pub path: PathBuf,
    pub pool: Arc<CompPool>,
    catalog: PathBuf,
    state: RwLock<State>,
    iman: RwLock<Option<Weak<IndexMan>>>,
    on_rollover: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Store {
    /// Create the store directory, its first writer file and the catalog.
    pub fn create(base: &std::path::Path, cfg: StoreConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        let path = base.join(&cfg.name);
        crate::fsutil::ensure_dir(&path)?;
        let pool = Arc::new(CompPool::new(&path, 8, 8));
        let store = Arc::new(Self {
            catalog: path.join(CATALOG),
            cfg,
            path,
            pool,
            state: RwLock::new(State {
                open: false,
                writer: None,
                spares: VecDeque::new(),
                waiting: Vec::new(),
                readers: BTreeMap::new(),
                claimed: HashSet::new(),
                nextid: 1,
            }),
            iman: RwLock::new(None),
            on_rollover: RwLock::new(None),
        });
        {
            let mut st = store.state.write();
            let writer = store.new_writer_file(&mut st)?;
            st.writer = Some(writer);
            st.open = true;
            store.persist_catalog(&st)?;
        }
        Ok(store)
    }

    /// Open an existing store: read the catalog, reconstruct the file
    /// lists and rewind the writer map to its persisted size.
    pub fn open(base: &std::path::Path, cfg: StoreConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        let path = base.join(&cfg.name);
        let pool = Arc::new(CompPool::new(&path, 8, 8));
        if cfg.comp == Comp::Zstd {
            pool.load_dict()?;
        }
        let catalog = path.join(CATALOG);
        let entries = read_catalog(&catalog)?;
        let mut st = State {
            open: false,
            writer: None,
            spares: VecDeque::new(),
            waiting: Vec::new(),
            readers: BTreeMap::new(),
            claimed: HashSet::new(),
            nextid: 1,
        };
        let mut writers: Vec<File> = Vec::new();
        for e in &entries {
            let mut f = e.to_file(&path);
            f.set_pool(Arc::clone(&pool));
            st.nextid = st.nextid.max(f.id + 1);
            if f.ctrl & CTRL_READER != 0 {
                st.readers.insert(f.id, f);
            } else if f.ctrl & CTRL_SPARE != 0 {
                st.spares.push_back(f);
            } else {
                writers.push(f);
            }
        }
        // the youngest writer with room continues as THE writer; full
        // writer files are still waiting to be sorted
        writers.sort_by_key(|f| f.id);
        while let Some(f) = writers.pop() {
            if st.writer.is_none() && f.size + cfg.recsize <= f.capacity {
                st.writer = Some(f);
            } else {
                st.waiting.push(f);
            }
        }
        st.waiting.sort_by_key(|f| f.id);
        let store = Arc::new(Self {
            catalog,
            cfg,
            path,
            pool,
            state: RwLock::new(st),
            iman: RwLock::new(None),
            on_rollover: RwLock::new(None),
        });
        {
            let mut st = store.state.write();
            if st.writer.is_none() {
                let w = store.new_writer_file(&mut st)?;
                st.writer = Some(w);
            } else {
                let w = st.writer.as_mut().expect("writer present");
                w.open()?;
                let aligned = w.size - w.size % w.blocksize;
                w.map_at(aligned)?;
            }
            st.open = true;
            store.persist_catalog(&st)?;
        }
        Ok(store)
    }

    /// Flush the writer and persist the catalog. Background sorters must
    /// be idle (the storage stops them first).
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.write();
        if !st.open {
            return Ok(());
        }
        if let Some(w) = st.writer.as_mut() {
            w.sync()?;
            w.close()?;
        }
        self.persist_catalog(&st)?;
        st.open = false;
        Ok(())
    }

    /// Remove the store from disk.
    pub fn drop_store(&self) -> Result<()> {
        {
            let mut st = self.state.write();
            if let Some(w) = st.writer.as_mut() {
                let _ = w.close();
            }
            st.open = false;
        }
        crate::fsutil::remove_tree(&self.path)
    }

    pub fn config_indexing(&self, iman: &Arc<IndexMan>) {
        *self.iman.write() = Some(Arc::downgrade(iman));
    }

    pub(crate) fn iman_handle(&self) -> Option<Arc<IndexMan>> {
        self.iman.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn config_rollover(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.on_rollover.write() = Some(f);
    }

    fn new_writer_file(&self, st: &mut State) -> Result<File> {
        let id = st.nextid;
        st.nextid += 1;
        let mut f = File::new(
            id,
            self.path.join(id.to_string()),
            self.cfg.filesize,
            0,
            self.cfg.blocksize,
            self.cfg.recsize,
            CTRL_WRITER,
            Comp::Flat,
            0,
            0,
            DAWN,
            DUSK,
        );
        f.order = id;
        f.set_pool(Arc::clone(&self.pool));
        if f.path.exists() {
            // leftover of an interrupted run
            std::fs::remove_file(&f.path).ok();
        }
        f.create()?;
        f.open()?;
        f.map()?;
        Ok(f)
    }

    fn persist_catalog(&self, st: &State) -> Result<()> {
        let mut entries = Vec::new();
        if let Some(w) = &st.writer {
            entries.push(CatalogEntry::from_file(w));
        }
        for f in &st.waiting {
            entries.push(CatalogEntry::from_file(f));
        }
        for f in st.readers.values() {
            entries.push(CatalogEntry::from_file(f));
        }
        for f in &st.spares {
            entries.push(CatalogEntry::from_file(f));
        }
        write_catalog(&self.catalog, &entries)
    }

    fn apply_indexes(&self, page: &[u8], pageid: PageId, nrec: usize) -> Result<()> {
        let iman = self.iman.read().as_ref().and_then(Weak::upgrade);
        if let Some(iman) = iman {
            for idx in iman.for_context(self.cfg.context.as_deref()) {
                idx.insert_page(page, pageid, nrec, self.cfg.recsize as usize)?;
            }
        }
        Ok(())
    }

    /// Insert one record: append to the writer map, stamp bookkeeping,
    /// index application on page completion, rollover when full.
    pub fn insert(&self, rec: &[u8]) -> Result<()> {
        if rec.len() != self.cfg.recsize as usize {
            return Err(errof!(Invalid, "store", "record size mismatch"));
        }
        let mut st = self.state.write();
        if !st.open {
            return Err(errof!(Store, "store", "store is closed"));
        }
        self.insert_locked(&mut st, rec)?;
        Ok(())
    }

    /// Insert a batch under one lock acquisition.
    pub fn insert_bulk(&self, recs: &[u8], count: u32) -> Result<()> {
        let recsize = self.cfg.recsize as usize;
        if recs.len() != recsize * count as usize {
            return Err(errof!(Invalid, "store", "bulk buffer size mismatch"));
        }
        let mut st = self.state.write();
        if !st.open {
            return Err(errof!(Store, "store", "store is closed"));
        }
        for i in 0..count as usize {
            self.insert_locked(&mut st, &recs[i * recsize..(i + 1) * recsize])?;
        }
        Ok(())
    }

    fn insert_locked(&self, st: &mut State, rec: &[u8]) -> Result<()> {
        let blocksize = self.cfg.blocksize;
        {
            let w = st.writer.as_mut().expect("open store has writer");
            w.push_record(rec)?;
            if self.cfg.stamped {
                w.mark_stamp(read_i64(rec, OFF_TMSTMP));
            }
        }
        // completed page: apply all active indexes to it
        let (size, wid, page_done) = {
            let w = st.writer.as_ref().expect("open store has writer");
            (w.size, w.id, w.size % blocksize == 0)
        };
        if page_done {
            let off = size - blocksize;
            let w = st.writer.as_ref().expect("open store has writer");
            if let Some(page) = w.mapped_page(off) {
                let page = page.to_vec();
                self.apply_indexes(&page, PageId::new(wid, off), w.per_page() as usize)?;
            }
        }
        // full writer rolls over to waiting; a spare takes its place
        let full = {
            let w = st.writer.as_ref().expect("open store has writer");
            w.size + self.cfg.recsize > w.capacity
        };
        if full {
            let mut old = st.writer.take().expect("open store has writer");
            old.sync()?;
            old.close()?;
            st.waiting.push(old);
            let new_writer = match st.spares.pop_front() {
                Some(mut s) => {
                    s.make_writer()?;
                    s.open()?;
                    s.map()?;
                    s
                }
                None => self.new_writer_file(st)?,
            };
            st.writer = Some(new_writer);
            self.persist_catalog(st)?;
            if let Some(nudge) = self.on_rollover.read().as_ref() {
                nudge();
            }
        }
        Ok(())
    }

    /// msync the writer when dirty (sync-worker path).
    pub fn sync_writer(&self) -> Result<()> {
        let mut st = self.state.write();
        if let Some(w) = st.writer.as_mut()
            && w.is_dirty()
        {
            w.sync()?;
        }
        Ok(())
    }

    // ---- file queries ----------------------------------------------------

    fn period_filter(&self, f: &File, start: Time, end: Time) -> bool {
        !self.cfg.stamped || f.in_period(start, end)
    }

    /// Copies of all files relevant for a period: readers in order, then
    /// waiting, then the writer.
    #[must_use]
    pub fn get_files(&self, start: Time, end: Time) -> Vec<File> {
        let st = self.state.read();
        let mut out: Vec<File> = st
            .readers
            .values()
            .filter(|f| self.period_filter(f, start, end))
            .map(File::fresh_copy)
            .collect();
        out.sort_by_key(|f| (f.order, f.id));
        for f in &st.waiting {
            if self.period_filter(f, start, end) {
                out.push(f.fresh_copy());
            }
        }
        if let Some(w) = &st.writer
            && self.period_filter(w, start, end)
        {
            out.push(w.fresh_copy());
        }
        out
    }

    /// Copies of the reader files only.
    #[must_use]
    pub fn get_readers(&self, start: Time, end: Time) -> Vec<File> {
        let st = self.state.read();
        let mut out: Vec<File> = st
            .readers
            .values()
            .filter(|f| self.period_filter(f, start, end))
            .map(File::fresh_copy)
            .collect();
        out.sort_by_key(|f| (f.order, f.id));
        out
    }

    #[must_use]
    pub fn get_all_waiting(&self) -> Vec<File> {
        self.state.read().waiting.iter().map(File::fresh_copy).collect()
    }

    /// The writer's incomplete tail page, if any: (descriptor copy,
    /// offset of the first byte past the last completed page).
    #[must_use]
    pub fn get_pending_tail(&self) -> Option<(File, u32)> {
        let st = self.state.read();
        let w = st.writer.as_ref()?;
        let tail = w.size - w.size % w.blocksize;
        (w.size > tail).then(|| (w.fresh_copy(), tail))
    }

    /// Claim one waiting file for sorting; `None` when nothing waits.
    #[must_use]
    pub fn get_waiting(&self) -> Option<File> {
        let mut st = self.state.write();
        let f = st
            .waiting
            .iter()
            .find(|f| !st.claimed.contains(&f.id))
            .map(File::fresh_copy)?;
        st.claimed.insert(f.id);
        Some(f)
    }

    /// Return a claimed waiting file unprocessed.
    pub fn release_waiting(&self, id: FileId) {
        self.state.write().claimed.remove(&id);
    }

    /// Claim a registered reader with room for `need` more bytes.
    #[must_use]
    pub fn find_free_reader(&self, need: u32) -> Option<File> {
        let mut st = self.state.write();
        let id = st
            .readers
            .values()
            .find(|f| !st.claimed.contains(&f.id) && f.capacity - f.size >= need)
            .map(|f| f.id)?;
        st.claimed.insert(id);
        Some(st.readers[&id].fresh_copy())
    }

    pub fn release_reader(&self, id: FileId) {
        self.state.write().claimed.remove(&id);
    }

    /// A new, unregistered reader file; `promote` registers it.
    pub fn create_reader(&self) -> Result<File> {
        let id = {
            let mut st = self.state.write();
            let id = st.nextid;
            st.nextid += 1;
            id
        };
        let mut f = File::new(
            id,
            self.path.join(id.to_string()),
            self.cfg.largesize,
            0,
            self.cfg.blocksize,
            self.cfg.recsize,
            CTRL_READER,
            self.cfg.comp,
            0,
            0,
            DAWN,
            DUSK,
        );
        f.order = id;
        f.set_pool(Arc::clone(&self.pool));
        if f.path.exists() {
            // leftover of an interrupted sort
            std::fs::remove_file(&f.path).ok();
        }
        f.create()?;
        Ok(f)
    }

    /// Atomically land a sort result: register the reader, drop the
    /// waiting file's index entries, erase it and donate it to spares.
    pub fn promote(&self, waiting_id: FileId, reader: File) -> Result<()> {
        let mut st = self.state.write();
        let pos = st
            .waiting
            .iter()
            .position(|f| f.id == waiting_id)
            .ok_or_else(|| errof!(NotFound, "store", "waiting file {waiting_id}"))?;
        let mut w = st.waiting.remove(pos);
        st.claimed.remove(&reader.id);
        st.readers.insert(reader.id, reader.fresh_copy());
        let iman = self.iman.read().as_ref().and_then(Weak::upgrade);
        if let Some(iman) = iman {
            for idx in iman.for_context(self.cfg.context.as_deref()) {
                idx.remove_file(waiting_id);
            }
        }
        w.erase()?;
        w.make_spare()?;
        st.claimed.remove(&waiting_id);
        st.spares.push_back(w);
        self.persist_catalog(&st)
    }

    /// Take an empty waiting file out of circulation: erase it and donate
    /// it back to the spares.
    pub fn retire_waiting(&self, id: FileId) -> Result<()> {
        let mut st = self.state.write();
        let pos = st
            .waiting
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| errof!(NotFound, "store", "waiting file {id}"))?;
        let mut w = st.waiting.remove(pos);
        w.erase()?;
        w.make_spare()?;
        st.claimed.remove(&id);
        st.spares.push_back(w);
        self.persist_catalog(&st)
    }

    /// Donate an empty file to the spares.
    pub fn donate(&self, mut file: File) -> Result<()> {
        file.erase()?;
        file.make_spare()?;
        let mut st = self.state.write();
        st.spares.push_back(file);
        self.persist_catalog(&st)
    }

    /// Register an externally built file.
    pub fn add_file(&self, file: File) -> Result<()> {
        let mut st = self.state.write();
        st.nextid = st.nextid.max(file.id + 1);
        st.readers.insert(file.id, file);
        self.persist_catalog(&st)
    }

    /// Unregister and delete a reader file.
    pub fn remove_file(&self, id: FileId) -> Result<()> {
        let mut st = self.state.write();
        let mut f = st
            .readers
            .remove(&id)
            .ok_or_else(|| errof!(NotFound, "store", "reader {id}"))?;
        f.remove()?;
        self.persist_catalog(&st)
    }

    /// Drop all reader files whose data lies entirely before `stamp`.
    pub fn drop_files(&self, stamp: Time) -> Result<u32> {
        let mut st = self.state.write();
        let doomed: Vec<FileId> = st
            .readers
            .values()
            .filter(|f| f.oldest != DAWN && f.newest != DUSK && f.newest < stamp)
            .map(|f| f.id)
            .collect();
        let iman = self.iman.read().as_ref().and_then(Weak::upgrade);
        let mut n = 0;
        for id in doomed {
            if let Some(mut f) = st.readers.remove(&id) {
                if let Some(iman) = &iman {
                    for idx in iman.for_context(self.cfg.context.as_deref()) {
                        idx.remove_file(id);
                    }
                }
                f.remove()?;
                n += 1;
            }
        }
        self.persist_catalog(&st)?;
        Ok(n)
    }

    // ---- introspection ---------------------------------------------------

    /// No waiting files and no file claimed by a sorter.
    #[must_use]
    pub fn idle(&self) -> bool {
        let st = self.state.read();
        st.waiting.is_empty() && st.claimed.is_empty()
    }

    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let st = self.state.read();
        (
            usize::from(st.writer.is_some()),
            st.waiting.len(),
            st.readers.len(),
            st.spares.len(),
        )
    }

    #[must_use]
    pub fn writer_size(&self) -> u32 {
        self.state.read().writer.as_ref().map_or(0, |w| w.size)
    }

    /// Bytes of the writer's live region ending at `size` (diagnostics
    /// and tests).
    #[must_use]
    pub fn writer_last(&self, n: usize) -> Option<Vec<u8>> {
        let st = self.state.read();
        let w = st.writer.as_ref()?;
        let map = w.mapped_slice()?;
        let end = (w.size - w.map_offset()) as usize;
        (end >= n).then(|| map[end - n..end].to_vec())
    }
}
