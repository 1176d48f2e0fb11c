use crate::cursor::Cursor;
use crate::errof;
use crate::errors::{ErrorKind, Result};
use crate::plan;
use crate::scope::Scope;
use crate::sql::ast::{Lit, Stmt};
use crate::sql::parse_stmt;
use crate::task::Queue;
use crate::types::{Edge, Typ, Value};
use crate::wire;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Output buffer handed to a cursor per fetch.
const FETCH_BUF: usize = 64 * 1024;

/// Numeric code of an error kind on the wire (0 is OK).
#[must_use]
pub fn errcode(kind: ErrorKind) -> u32 {
    match kind {
        ErrorKind::Eof => 8,
        ErrorKind::Timeout => 13,
        ErrorKind::NotFound => 20,
        ErrorKind::DupName => 21,
        ErrorKind::Parser => 30,
        ErrorKind::NotSupp => 31,
        _ => 1,
    }
}

struct Conn {
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
}

/// Owns the base path, the tree of open scopes and the session thread
/// pool.
pub struct Library {
    pub base: PathBuf,
    scopes: RwLock<HashMap<String, Arc<Scope>>>,
    module_paths: HashMap<String, String>,
    nthreads: usize,
    conns: Arc<Queue<Conn>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    idle: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    timing: AtomicBool,
}

impl Library {
    pub fn new(base: &std::path::Path, nthreads: usize) -> Result<Arc<Self>> {
        crate::fsutil::ensure_dir(base)?;
        let module_paths = std::env::var("NOWDB_LUA_PATH")
            .map(|raw| crate::procman::parse_module_paths(&raw))
            .unwrap_or_default();
        Ok(Arc::new(Self {
            base: base.to_path_buf(),
            scopes: RwLock::new(HashMap::new()),
            module_paths,
            nthreads: nthreads.max(1),
            conns: Arc::new(Queue::new(0)),
            workers: Mutex::new(Vec::new()),
            idle: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            timing: AtomicBool::new(false),
        }))
    }

    pub fn set_timing(&self, on: bool) {
        self.timing.store(on, Ordering::Relaxed);
    }

    // ---- scopes ----------------------------------------------------------

    pub fn create_scope(&self, name: &str) -> Result<Arc<Scope>> {
        if self.scopes.read().contains_key(name) {
            return Err(errof!(DupName, "library", "scope '{name}'"));
        }
        let scope = Scope::create(&self.base, name)?;
        self.wire_scope(&scope);
        self.scopes.write().insert(name.to_string(), Arc::clone(&scope));
        Ok(scope)
    }

    /// Fetch an open scope, opening it from disk on first use.
    pub fn open_scope(&self, name: &str) -> Result<Arc<Scope>> {
        if let Some(s) = self.scopes.read().get(name) {
            return Ok(Arc::clone(s));
        }
        let scope = Scope::open(&self.base, name)?;
        self.wire_scope(&scope);
        let mut g = self.scopes.write();
        Ok(Arc::clone(g.entry(name.to_string()).or_insert(scope)))
    }

    fn wire_scope(&self, scope: &Arc<Scope>) {
        if let Some(p) = self.module_paths.get(&scope.name) {
            *scope.procs.module_path.write() = Some(p.clone());
        }
    }

    pub fn drop_scope(&self, name: &str) -> Result<()> {
        let scope = match self.scopes.write().remove(name) {
            Some(s) => s,
            None => Scope::open(&self.base, name)?,
        };
        scope.close()?;
        scope.drop_scope()
    }

    /// Close every open scope (daemon shutdown path).
    pub fn close(&self) -> Result<()> {
        let scopes: Vec<Arc<Scope>> = self.scopes.write().drain().map(|(_, s)| s).collect();
        for s in scopes {
            s.close()?;
        }
        Ok(())
    }

    // ---- session pool ----------------------------------------------------

    /// Hand a connection to the pool: reuse an idle session thread or
    /// spawn a new one while below `nthreads`.
    pub fn get_session(
        self: &Arc<Self>,
        input: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
    ) -> Result<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(errof!(Server, "library", "shutting down"));
        }
        let nworkers = self.workers.lock().len();
        if self.idle.load(Ordering::SeqCst) == 0 && nworkers < self.nthreads {
            self.spawn_worker(nworkers);
        }
        self.conns.enqueue(Conn { input, output })
    }

    fn spawn_worker(self: &Arc<Self>, n: usize) {
        let lib = Arc::clone(self);
        let conns = Arc::clone(&self.conns);
        let idle = Arc::clone(&self.idle);
        let h = std::thread::Builder::new()
            .name(format!("session-{n}"))
            .spawn(move || {
                loop {
                    idle.fetch_add(1, Ordering::SeqCst);
                    let conn = conns.dequeue(None);
                    idle.fetch_sub(1, Ordering::SeqCst);
                    let Ok(conn) = conn else { break };
                    let mut session = Session::new(&lib);
                    if let Err(e) = session.run(conn.input, conn.output) {
                        log::warn!("session ended with error: {e}");
                    }
                }
            })
            .expect("spawn session thread");
        self.workers.lock().push(h);
    }

    /// Signal all sessions to stop and join them.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.conns.close();
        let mut workers = self.workers.lock();
        for h in workers.drain(..) {
            let _ = h.join();
        }
    }
}

/// One client session: input/output stream pair, a parser, the current
/// scope and the open cursors.
pub struct Session {
    lib: Arc<Library>,
    scope: Option<Arc<Scope>>,
    cursors: HashMap<u64, Cursor>,
    next_cursor: u64,
    stop: Arc<AtomicBool>,
}

impl Session {
    #[must_use]
    pub fn new(lib: &Arc<Library>) -> Self {
        Self {
            lib: Arc::clone(lib),
            scope: None,
            cursors: HashMap::new(),
            next_cursor: 1,
            stop: Arc::clone(&lib.stop),
        }
    }

    /// The shared stop flag; cursors poll it between page fetches.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Drive the session: one statement per line until the stream closes
    /// or shutdown is signalled.
    pub fn run(
        &mut self,
        input: Box<dyn Read + Send>,
        mut output: Box<dyn Write + Send>,
    ) -> Result<()> {
        let reader = BufReader::new(input);
        for line in reader.lines() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            let stmt = line.trim();
            if stmt.is_empty() {
                continue;
            }
            let frames = self.handle(stmt);
            if output.write_all(&frames).is_err() || output.flush().is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Execute one statement, producing the response frames. Errors never
    /// escape: they become status frames.
    pub fn handle(&mut self, input: &str) -> Vec<u8> {
        let started = Instant::now();
        let mut out = Vec::new();
        let result = parse_stmt(input).and_then(|stmt| self.dispatch(stmt, &mut out, started));
        if let Err(e) = result {
            out.clear();
            wire::status(&mut out, errcode(e.kind), &e.to_string());
        }
        if self.lib.timing.load(Ordering::Relaxed) {
            log::info!("statement took {:?}: {input}", started.elapsed());
        }
        out
    }

    fn current(&self) -> Result<Arc<Scope>> {
        self.scope
            .clone()
            .ok_or_else(|| errof!(Scope, "session", "no database in use"))
    }

    fn dispatch(&mut self, stmt: Stmt, out: &mut Vec<u8>, started: Instant) -> Result<()> {
        match stmt {
            Stmt::CreateScope { name } => {
                self.lib.create_scope(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::DropScope { name } => {
                if let Some(s) = &self.scope
                    && s.name == name
                {
                    self.scope = None;
                }
                self.lib.drop_scope(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::UseScope { name } => {
                self.scope = Some(self.lib.open_scope(&name)?);
                wire::status(out, 0, "");
            }
            Stmt::CreateType { name, vid, props } => {
                self.current()?.create_type(&name, vid, &props)?;
                wire::status(out, 0, "");
            }
            Stmt::DropType { name } => {
                self.current()?.drop_type(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::CreateEdge { name, origin, destin, label, weight, weight2, stamped } => {
                self.current()?.create_edge(
                    &name,
                    &origin,
                    &destin,
                    label.unwrap_or(Typ::Nothing),
                    weight.unwrap_or(Typ::Nothing),
                    weight2.unwrap_or(Typ::Nothing),
                    stamped,
                )?;
                wire::status(out, 0, "");
            }
            Stmt::DropEdge { name } => {
                self.current()?.drop_edge(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::CreateContext { name } => {
                self.current()?.create_context(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::DropContext { name } => {
                self.current()?.drop_context(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::CreateIndex { name, on, fields, sizing } => {
                self.current()?.create_index(&name, &on, &fields, sizing)?;
                wire::status(out, 0, "");
            }
            Stmt::DropIndex { name } => {
                self.current()?.drop_index(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::CreateProc { name, lang, path } => {
                self.current()?.procs.create_proc(&name, &lang, path.as_deref())?;
                wire::status(out, 0, "");
            }
            Stmt::DropProc { name } => {
                self.current()?.procs.drop_proc(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::Insert { target, fields, values } => {
                let scope = self.current()?;
                self.insert(&scope, &target, fields, values)?;
                let rt = started.elapsed().as_micros() as u64;
                wire::report(out, 1, 0, rt);
            }
            Stmt::Load { path, target, use_header } => {
                let scope = self.current()?;
                let report =
                    scope.load_csv(std::path::Path::new(&path), &target, use_header)?;
                let rt = started.elapsed().as_micros() as u64;
                wire::report(out, report.inserted, report.errors, rt);
            }
            Stmt::Select(sel) => {
                let scope = self.current()?;
                let plan = plan::from_ast(&scope, &sel)?;
                let mut cursor = Cursor::new(&scope, plan, self.stop_flag())?;
                cursor.open()?;
                let id = self.next_cursor;
                self.next_cursor += 1;
                wire::cursor(out, id);
                let exhausted = Self::fetch_into(&mut cursor, out)?;
                if exhausted {
                    wire::status(out, errcode(ErrorKind::Eof), "eof");
                } else {
                    self.cursors.insert(id, cursor);
                }
            }
            Stmt::Fetch { cursor } => {
                let Some(c) = self.cursors.get_mut(&cursor) else {
                    return Err(errof!(NotFound, "session", "cursor {cursor}"));
                };
                let exhausted = Self::fetch_into(c, out)?;
                if exhausted {
                    wire::status(out, errcode(ErrorKind::Eof), "eof");
                    self.cursors.remove(&cursor);
                }
            }
            Stmt::CloseCursor { cursor } => {
                if let Some(mut c) = self.cursors.remove(&cursor) {
                    c.close();
                }
                wire::status(out, 0, "");
            }
            Stmt::Lock { name, write, timeout_ms } => {
                let scope = self.current()?;
                scope.ipc.lock(&name, write, timeout_ms.map(Duration::from_millis))?;
                wire::status(out, 0, "");
            }
            Stmt::Unlock { name } => {
                self.current()?.ipc.unlock(&name)?;
                wire::status(out, 0, "");
            }
            Stmt::Exec { name, args } => {
                let scope = self.current()?;
                let v = scope.procs.exec(&name, &args)?;
                out.extend_from_slice(&wire::encode_row(&[v]));
                wire::status(out, errcode(ErrorKind::Eof), "eof");
            }
        }
        Ok(())
    }

    /// One fetch round: append row frames, report whether the cursor is
    /// exhausted. Eof with no data still counts as a clean end.
    fn fetch_into(cursor: &mut Cursor, out: &mut Vec<u8>) -> Result<bool> {
        let mut buf = vec![0u8; FETCH_BUF];
        match cursor.fetch(&mut buf) {
            Ok((osize, _cnt)) => {
                out.extend_from_slice(&buf[..osize]);
                Ok(osize < FETCH_BUF)
            }
            Err(e) if e.is_eof() => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn insert(
        &self,
        scope: &Arc<Scope>,
        target: &str,
        fields: Option<Vec<String>>,
        values: Vec<Lit>,
    ) -> Result<()> {
        if scope.model.has_vertex(target) {
            let def = scope.model.vertex_by_name(target)?;
            let names: Vec<String> = match fields {
                Some(fs) => fs,
                None => def.props.iter().map(|p| p.name.clone()).collect(),
            };
            if names.len() != values.len() {
                return Err(errof!(Invalid, "session", "field/value count mismatch"));
            }
            let pairs: Vec<(String, Lit)> = names.into_iter().zip(values).collect();
            scope.insert_vertex(target, &pairs)?;
            return Ok(());
        }
        if scope.model.has_edge(target) {
            let def = scope.model.edge_by_name(target)?;
            let mut names: Vec<String> = match fields {
                Some(fs) => fs,
                None => {
                    let mut cols = vec!["origin".to_string(), "destin".to_string()];
                    if def.stamped {
                        cols.push("timestamp".to_string());
                    }
                    if def.weight != Typ::Nothing {
                        cols.push("weight".to_string());
                    }
                    if def.weight2 != Typ::Nothing {
                        cols.push("weight2".to_string());
                    }
                    cols
                }
            };
            names.truncate(values.len());
            if names.len() != values.len() {
                return Err(errof!(Invalid, "session", "field/value count mismatch"));
            }
            let mut e = Edge {
                edge: def.edgeid,
                wtype: def.weight,
                wtype2: def.weight2,
                ..Edge::default()
            };
            for (name, lit) in names.iter().zip(&values) {
                match name.as_str() {
                    "origin" => e.origin = id_lit(scope, lit)?,
                    "destin" | "destination" => e.destin = id_lit(scope, lit)?,
                    "label" => e.label = scope.raw_from_lit(def.label, lit)?,
                    "timestamp" | "stamp" => {
                        e.timestamp = scope.raw_from_lit(Typ::Time, lit)? as i64;
                    }
                    "weight" => e.weight = scope.raw_from_lit(def.weight, lit)?,
                    "weight2" => e.weight2 = scope.raw_from_lit(def.weight2, lit)?,
                    other => {
                        return Err(errof!(NotFound, "session", "edge field '{other}'"));
                    }
                }
            }
            return scope.insert_edge(target, &e);
        }
        Err(errof!(NotFound, "session", "target '{target}'"))
    }
}

fn id_lit(scope: &Arc<Scope>, lit: &Lit) -> Result<u64> {
    match lit {
        Lit::UInt(u) => Ok(*u),
        Lit::Int(i) if *i >= 0 => Ok(*i as u64),
        Lit::Str(s) => scope.text.insert(s),
        _ => Err(errof!(Invalid, "session", "bad id literal {lit:?}")),
    }
}

/// Convenience for tests and tools: run one statement and decode the row
/// frames out of the response.
pub fn rows_of(frames: &[u8]) -> Vec<Vec<Value>> {
    let mut pos = 0;
    let mut rows = Vec::new();
    while pos < frames.len() {
        match frames[pos] {
            wire::FRAME_CURSOR => pos += 9,
            wire::FRAME_STATUS => {
                pos += 1;
                if pos + 8 > frames.len() {
                    break;
                }
                let len =
                    u32::from_le_bytes(frames[pos + 4..pos + 8].try_into().expect("4 bytes"))
                        as usize;
                pos += 8 + len;
            }
            wire::FRAME_REPORT => pos += 25,
            wire::FRAME_ROW => {
                let Ok((mut decoded, consumed)) = wire::decode_rows(&frames[pos..]) else {
                    break;
                };
                rows.append(&mut decoded);
                if consumed == 0 {
                    break;
                }
                pos += consumed;
            }
            _ => break,
        }
    }
    rows
}

/// The report frame of a response, if any: (affected, errors, runtime).
#[must_use]
pub fn report_of(frames: &[u8]) -> Option<(u64, u64, u64)> {
    let mut pos = 0;
    while pos < frames.len() {
        match frames[pos] {
            wire::FRAME_REPORT => {
                let a = u64::from_le_bytes(frames[pos + 1..pos + 9].try_into().ok()?);
                let e = u64::from_le_bytes(frames[pos + 9..pos + 17].try_into().ok()?);
                let r = u64::from_le_bytes(frames[pos + 17..pos + 25].try_into().ok()?);
                return Some((a, e, r));
            }
            wire::FRAME_CURSOR => pos += 9,
            wire::FRAME_STATUS => {
                pos += 1;
                if pos + 8 > frames.len() {
                    return None;
                }
                let len =
                    u32::from_le_bytes(frames[pos + 4..pos + 8].try_into().ok()?) as usize;
                pos += 8 + len;
            }
            wire::FRAME_ROW => {
                let (_, consumed) = wire::decode_rows(&frames[pos..]).ok()?;
                if consumed == 0 {
                    return None;
                }
                pos += consumed;
            }
            _ => return None,
        }
    }
    None
}

/// The status of a response: (errcode, details).
#[must_use]
pub fn status_of(frames: &[u8]) -> Option<(u32, String)> {
    if frames.len() < 9 || frames.first() != Some(&wire::FRAME_STATUS) {
        return None;
    }
    let code = u32::from_le_bytes(frames[1..5].try_into().ok()?);
    let len = u32::from_le_bytes(frames[5..9].try_into().ok()?) as usize;
    let details = String::from_utf8_lossy(&frames[9..9 + len]).into_owned();
    Some((code, details))
}
