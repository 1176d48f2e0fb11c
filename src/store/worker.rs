use crate::errors::{ErrorKind, NowError, Result};
use crate::io::comp::Comp;
use crate::io::file::CTRL_SORT;
use crate::sort;
use crate::store::core::Store;
use crate::task::{Queue, Worker};
use crate::types::{OFF_TMSTMP, PageId, read_i64};
use parking_lot::{Mutex, RwLock};
use std::io::Read;
use std::sync::{Arc, Weak};
use std::time::Duration;

const SYNC_PERIOD: Duration = Duration::from_millis(500);
const SORT_PERIOD: Duration = Duration::from_millis(1000);

/// Message to the sorter workers: deal with this store now.
pub type SortMsg = Arc<Store>;

/// Write-path controller shared by the stores of a scope: a periodic sync
/// worker and a pool of sorter workers draining one waiting queue.
pub struct Storage {
    pub name: String,
    stores: Arc<RwLock<Vec<Arc<Store>>>>,
    sync_worker: Mutex<Option<Worker<()>>>,
    sort_worker: Mutex<Option<Worker<SortMsg>>>,
    /// Background workers report resource errors here and stay alive.
    pub errq: Arc<Queue<NowError>>,
    tasknum: usize,
}

impl Storage {
    #[must_use]
    pub fn new(name: &str, tasknum: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            stores: Arc::new(RwLock::new(Vec::new())),
            sync_worker: Mutex::new(None),
            sort_worker: Mutex::new(None),
            errq: Arc::new(Queue::new(1024)),
            tasknum: tasknum.max(1),
        })
    }

    /// Attach a store and wire its rollover nudge to the sorter queue.
    pub fn register(self: &Arc<Self>, store: &Arc<Store>) {
        self.stores.write().push(Arc::clone(store));
        let srtq = self
            .sort_worker
            .lock()
            .as_ref()
            .map(|w| Arc::downgrade(&w.queue));
        if let Some(srtq) = srtq {
            wire_rollover(store, srtq);
        }
    }

    /// Spawn the background workers.
    pub fn start(self: &Arc<Self>) {
        let mut syncw = self.sync_worker.lock();
        if syncw.is_some() {
            return;
        }
        let stores = Arc::clone(&self.stores);
        *syncw = Some(Worker::spawn(
            "sync",
            1,
            Some(SYNC_PERIOD),
            Some(Arc::clone(&self.errq)),
            move |_msg: Option<()>| {
                for s in stores.read().iter() {
                    s.sync_writer()?;
                }
                Ok(())
            },
        ));
        let stores = Arc::clone(&self.stores);
        let sorter = Worker::spawn(
            "sorter",
            self.tasknum,
            Some(SORT_PERIOD),
            Some(Arc::clone(&self.errq)),
            move |msg: Option<SortMsg>| match msg {
                Some(store) => sort_step(&store),
                None => {
                    for s in stores.read().iter() {
                        while sort_pending(s)? {}
                    }
                    Ok(())
                }
            },
        );
        let srtq = Arc::downgrade(&sorter.queue);
        *self.sort_worker.lock() = Some(sorter);
        for s in self.stores.read().iter() {
            wire_rollover(s, srtq.clone());
        }
    }

    /// Sort this store's waiting files ahead of the queue.
    pub fn sort_now(&self, store: &Arc<Store>) -> Result<()> {
        if let Some(w) = self.sort_worker.lock().as_ref() {
            w.queue.enqueue_prio(Arc::clone(store))?;
        }
        Ok(())
    }

    /// Stop the workers: sorters first (drain to idle), then sync.
    pub fn stop(&self) {
        if let Some(mut w) = self.sort_worker.lock().take() {
            w.stop();
        }
        if let Some(mut w) = self.sync_worker.lock().take() {
            w.stop();
        }
    }

    /// Drain every waiting file of every store right now, inline.
    pub fn drain_pending(&self) -> Result<()> {
        for s in self.stores.read().iter() {
            while sort_pending(s)? {}
        }
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wire_rollover(store: &Arc<Store>, srtq: Weak<Queue<SortMsg>>) {
    let weak_store = Arc::downgrade(store);
    store.config_rollover(Box::new(move || {
        if let (Some(q), Some(s)) = (srtq.upgrade(), weak_store.upgrade()) {
            let _ = q.enqueue(s);
        }
    }));
}

/// Sort one waiting file of the store if there is one. Returns whether a
/// file was processed.
pub fn sort_pending(store: &Arc<Store>) -> Result<bool> {
    let Some(src) = store.get_waiting() else {
        return Ok(false);
    };
    match sort_one(store, &src) {
        Ok(()) => Ok(true),
        Err(e) => {
            store.release_waiting(src.id);
            Err(e)
        }
    }
}

/// Explicit sort entry point for one store.
pub fn sort_step(store: &Arc<Store>) -> Result<()> {
    while sort_pending(store)? {}
    Ok(())
}

fn read_content(src: &crate::io::file::File) -> Result<Vec<u8>> {
    let mut f = std::fs::File::open(&src.path)
        .map_err(|e| NowError::os(ErrorKind::Open, "sorter", &e))?;
    let mut buf = vec![0u8; src.size as usize];
    f.read_exact(&mut buf)
        .map_err(|e| NowError::os(ErrorKind::Read, "sorter", &e))?;
    Ok(buf)
}

fn sort_one(store: &Arc<Store>, src: &crate::io::file::File) -> Result<()> {
    let cfg = &store.cfg;
    let blocksize = cfg.blocksize as usize;
    let recsize = cfg.recsize as usize;

    let buf = read_content(src)?;
    let mut records = sort::collect_records(&buf, src.size as usize, blocksize, recsize);
    if records.is_empty() {
        // empty waiting file: nothing to sort, recycle it
        return store.retire_waiting(src.id);
    }

    // min/max timestamps travel from the waiting file to the reader
    let (mut oldest, mut newest) = (i64::MAX, i64::MIN);
    if cfg.stamped {
        for r in &records {
            let t = read_i64(r, OFF_TMSTMP);
            oldest = oldest.min(t);
            newest = newest.max(t);
        }
    }

    let sorted = match cfg.sort.as_deref().and_then(sort::by_tag) {
        Some(cmp) => {
            sort::sort_records(&mut records, cmp);
            true
        }
        None => false,
    };

    if cfg.comp == Comp::Zstd {
        store.pool.load_dict()?;
        if !store.pool.has_dict() {
            let packed: Vec<u8> = records.concat();
            store.pool.train_dict(&packed, recsize)?;
        }
    }

    let pages = sort::to_pages(&records, blocksize, recsize);
    let need = (pages.len() * blocksize) as u32;
    let mut reader = match store.find_free_reader(need) {
        Some(r) => r,
        None => store.create_reader()?,
    };
    let landed = (|| -> Result<u32> {
        reader.open()?;
        let base = reader.npages();
        for p in &pages {
            reader.write_buf(p)?;
        }
        if sorted {
            reader.ctrl |= CTRL_SORT;
        }
        if cfg.stamped {
            reader.mark_stamp(oldest);
            reader.mark_stamp(newest);
        }
        reader.close()?;
        Ok(base)
    })();
    let base = match landed {
        Ok(base) => base,
        Err(e) => {
            store.release_reader(reader.id);
            return Err(e);
        }
    };

    // index the freshly landed pages; the new reader is not yet visible,
    // so searches keep hitting the waiting file until promote
    if let Some(iman) = store_iman(store) {
        let per_page = blocksize / recsize;
        for idx in iman.for_context(cfg.context.as_deref()) {
            for (i, p) in pages.iter().enumerate() {
                let nrec = if i + 1 == pages.len() {
                    records.len() - (pages.len() - 1) * per_page
                } else {
                    per_page
                };
                let off = (base as usize + i) * blocksize;
                idx.insert_page(p, PageId::new(reader.id, off as u32), nrec, recsize)?;
            }
        }
    }

    log::debug!(
        "storage {}: sorted file {} into reader {} ({} records)",
        store.cfg.name,
        src.id,
        reader.id,
        records.len()
    );
    store.promote(src.id, reader)
}

fn store_iman(store: &Arc<Store>) -> Option<Arc<crate::index::IndexMan>> {
    store.iman_handle()
}
