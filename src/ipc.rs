use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

const CATALOG: &str = "ipc";
const IPC_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum RscKind {
    Lock,
    Event,
}

#[derive(Serialize, Deserialize)]
struct Catalog {
    version: u32,
    rscs: Vec<(String, RscKind)>,
}

/// A named lock with read and write modes, waiter timeout and self-lock
/// detection.
pub struct NamedLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Default)]
struct LockState {
    readers: Vec<ThreadId>,
    writer: Option<ThreadId>,
}

impl NamedLock {
    fn new() -> Self {
        Self { state: Mutex::new(LockState::default()), cond: Condvar::new() }
    }

    fn lock(&self, write: bool, timeout: Option<Duration>) -> Result<()> {
        let me = std::thread::current().id();
        let mut st = self.state.lock();
        if st.writer == Some(me) || st.readers.contains(&me) {
            return Err(errof!(Lock, "ipc", "self-lock detected"));
        }
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            let free = if write {
                st.writer.is_none() && st.readers.is_empty()
            } else {
                st.writer.is_none()
            };
            if free {
                if write {
                    st.writer = Some(me);
                } else {
                    st.readers.push(me);
                }
                return Ok(());
            }
            match deadline {
                None => {
                    self.cond.wait(&mut st);
                }
                Some(d) => {
                    if self.cond.wait_until(&mut st, d).timed_out() {
                        return Err(errof!(Timeout, "ipc"));
                    }
                }
            }
        }
    }

    fn unlock(&self) -> Result<()> {
        let me = std::thread::current().id();
        let mut st = self.state.lock();
        if st.writer == Some(me) {
            st.writer = None;
        } else if let Some(pos) = st.readers.iter().position(|t| *t == me) {
            st.readers.remove(pos);
        } else {
            return Err(errof!(Ulock, "ipc", "lock not held by this thread"));
        }
        self.cond.notify_all();
        Ok(())
    }
}

/// A named event: set wakes all current and future waiters until reset.
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new() -> Self {
        Self { state: Mutex::new(false), cond: Condvar::new() }
    }

    pub fn set(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut st = self.state.lock();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        while !*st {
            match deadline {
                None => {
                    self.cond.wait(&mut st);
                }
                Some(d) => {
                    if self.cond.wait_until(&mut st, d).timed_out() {
                        return Err(errof!(Timeout, "ipc"));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Ad-hoc IPC primitives of a scope, registered in a persisted catalog
/// and guarded by a read-write lock.
pub struct Ipc {
    path: PathBuf,
    locks: RwLock<HashMap<String, Arc<NamedLock>>>,
    events: RwLock<HashMap<String, Arc<Event>>>,
}

impl Ipc {
    pub fn create(base: &Path) -> Result<Self> {
        let ipc = Self {
            path: base.join(CATALOG),
            locks: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        };
        ipc.persist()?;
        Ok(ipc)
    }

    pub fn open(base: &Path) -> Result<Self> {
        let path = base.join(CATALOG);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Self::create(base);
            }
            Err(e) => return Err(NowError::os(ErrorKind::Open, "ipc", &e)),
        };
        let (cat, _): (Catalog, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| errof!(Catalog, "ipc", "{e}"))?;
        if cat.version != IPC_VERSION {
            return Err(errof!(Version, "ipc"));
        }
        let ipc = Self {
            path,
            locks: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        };
        for (name, kind) in cat.rscs {
            match kind {
                RscKind::Lock => {
                    ipc.locks.write().insert(name, Arc::new(NamedLock::new()));
                }
                RscKind::Event => {
                    ipc.events.write().insert(name, Arc::new(Event::new()));
                }
            }
        }
        Ok(ipc)
    }

    fn persist(&self) -> Result<()> {
        let mut rscs: Vec<(String, RscKind)> = self
            .locks
            .read()
            .keys()
            .map(|n| (n.clone(), RscKind::Lock))
            .chain(self.events.read().keys().map(|n| (n.clone(), RscKind::Event)))
            .collect();
        rscs.sort();
        let cat = Catalog { version: IPC_VERSION, rscs };
        let bytes = bincode::serde::encode_to_vec(&cat, bincode::config::standard())
            .map_err(|e| errof!(Catalog, "ipc", "{e}"))?;
        crate::fsutil::write_atomic(&self.path, &bytes)
    }

    /// Lock a named lock, creating it on first use.
    pub fn lock(&self, name: &str, write: bool, timeout: Option<Duration>) -> Result<()> {
        let lock = self.get_or_create_lock(name)?;
        lock.lock(write, timeout)
    }

    pub fn unlock(&self, name: &str) -> Result<()> {
        let lock = self
            .locks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| errof!(NotFound, "ipc", "lock '{name}'"))?;
        lock.unlock()
    }

    fn get_or_create_lock(&self, name: &str) -> Result<Arc<NamedLock>> {
        if let Some(l) = self.locks.read().get(name) {
            return Ok(Arc::clone(l));
        }
        crate::fsutil::check_name(name)?;
        let l = Arc::new(NamedLock::new());
        self.locks.write().insert(name.to_string(), Arc::clone(&l));
        self.persist()?;
        Ok(l)
    }

    pub fn event(&self, name: &str) -> Result<Arc<Event>> {
        if let Some(e) = self.events.read().get(name) {
            return Ok(Arc::clone(e));
        }
        crate::fsutil::check_name(name)?;
        let e = Arc::new(Event::new());
        self.events.write().insert(name.to_string(), Arc::clone(&e));
        self.persist()?;
        Ok(e)
    }

    pub fn drop_rsc(&self, name: &str) -> Result<()> {
        let had_lock = self.locks.write().remove(name).is_some();
        let had_event = self.events.write().remove(name).is_some();
        if !had_lock && !had_event {
            return Err(errof!(NotFound, "ipc", "'{name}'"));
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_blocks_write_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = Arc::new(Ipc::create(dir.path()).unwrap());
        ipc.lock("l", false, None).unwrap();
        let ipc2 = Arc::clone(&ipc);
        let h = std::thread::spawn(move || {
            // short timeout fails while the read lock is held
            let e = ipc2.lock("l", true, Some(Duration::from_millis(200))).unwrap_err();
            assert!(e.is(ErrorKind::Timeout));
            // then wait for the release
            ipc2.lock("l", true, Some(Duration::from_secs(5))).unwrap();
            ipc2.unlock("l").unwrap();
        });
        std::thread::sleep(Duration::from_millis(400));
        ipc.unlock("l").unwrap();
        h.join().unwrap();
    }

    #[test]
    fn self_lock_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = Ipc::create(dir.path()).unwrap();
        ipc.lock("l", true, None).unwrap();
        assert!(ipc.lock("l", true, Some(Duration::ZERO)).unwrap_err().is(ErrorKind::Lock));
        ipc.unlock("l").unwrap();
    }

    #[test]
    fn catalog_restores_names() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ipc = Ipc::create(dir.path()).unwrap();
            ipc.lock("mylock", false, None).unwrap();
            ipc.unlock("mylock").unwrap();
            ipc.event("myevent").unwrap();
        }
        let ipc = Ipc::open(dir.path()).unwrap();
        assert!(ipc.unlock("mylock").unwrap_err().is(ErrorKind::Ulock));
        ipc.event("myevent").unwrap().set();
    }

    #[test]
    fn event_wakes_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = Arc::new(Ipc::create(dir.path()).unwrap());
        let ev = ipc.event("go").unwrap();
        let ev2 = Arc::clone(&ev);
        let h = std::thread::spawn(move || ev2.wait(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(50));
        ev.set();
        h.join().unwrap().unwrap();
    }
}
