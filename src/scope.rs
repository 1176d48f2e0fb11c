use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::index::{IndexMan, Sizing};
use crate::io::comp::Comp;
use crate::io::file::CTRL_READER;
use crate::ipc::Ipc;
use crate::model::{Model, VertexDef, VidPolicy};
use crate::procman::ProcMan;
use crate::sort::IndexKeys;
use crate::sql::ast::Lit;
use crate::store::{Storage, Store, StoreConfig};
use crate::text::TextDict;
use crate::types::{
    Content, Edge, Key, OFF_DESTIN, OFF_EDGE, OFF_LABEL, OFF_ORIGIN, OFF_PROP, OFF_ROLE,
    OFF_TMSTMP, OFF_VALUE, OFF_VERTEX, OFF_WEIGHT, OFF_WEIGHT2, PageId, Typ, Vertex,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const CATALOG: &str = "catalog";
const SCOPE_VERSION: u32 = 1;
const VERTEX_STORE: &str = "vertex";

#[derive(Serialize, Deserialize, Clone)]
struct ContextDesc {
    name: String,
    comp: u32,
    sorted: bool,
    stamped: bool,
}

#[derive(Serialize, Deserialize)]
struct Catalog {
    version: u32,
    contexts: Vec<ContextDesc>,
}

/// Outcome of a bulk load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: u64,
    pub errors: u64,
}

/// A named database instance: model, dictionary, vertex store, edge
/// contexts, index manager, ipc and procedure catalogs, plus the storage
/// with its background workers.
pub struct Scope {
    pub name: String,
    pub base: PathBuf,
    pub model: Model,
    pub text: Arc<TextDict>,
    pub iman: Arc<IndexMan>,
    pub ipc: Ipc,
    pub procs: ProcMan,
    pub storage: Arc<Storage>,
    vertex: Arc<Store>,
    contexts: RwLock<HashMap<String, Arc<Store>>>,
    next_auto: AtomicU64,
}

impl Scope {
    fn catalog_path(base: &Path) -> PathBuf {
        base.join(CATALOG)
    }

    fn vertex_config() -> StoreConfig {
        StoreConfig {
            name: VERTEX_STORE.to_string(),
            context: None,
            content: Content::Vertex,
            recsize: crate::types::VERTEX_RECSIZE as u32,
            blocksize: crate::types::PAGE_SIZE as u32,
            filesize: crate::store::core::DEFAULT_FILESIZE,
            largesize: crate::store::core::DEFAULT_LARGESIZE,
            comp: Comp::Zstd,
            sort: Some("vertex_triple".to_string()),
            stamped: false,
        }
    }

    fn context_config(desc: &ContextDesc) -> StoreConfig {
        StoreConfig {
            name: desc.name.clone(),
            context: Some(desc.name.clone()),
            content: Content::Edge,
            recsize: crate::types::EDGE_RECSIZE as u32,
            blocksize: crate::types::PAGE_SIZE as u32,
            filesize: crate::store::core::DEFAULT_FILESIZE,
            largesize: crate::store::core::DEFAULT_LARGESIZE,
            comp: Comp::from_tag(desc.comp),
            sort: desc.sorted.then(|| "edge_stamp".to_string()),
            stamped: desc.stamped,
        }
    }

    /// Create a scope on disk and start its background workers.
    pub fn create(base_dir: &Path, name: &str) -> Result<Arc<Self>> {
        crate::fsutil::check_name(name)?;
        let base = base_dir.join(name);
        if base.exists() {
            return Err(errof!(DupName, "scope", "'{name}'"));
        }
        crate::fsutil::ensure_dir(&base)?;
        let model = Model::create(&base)?;
        let text = Arc::new(TextDict::create(&base)?);
        let iman = Arc::new(IndexMan::create(&base)?);
        let ipc = Ipc::create(&base)?;
        let procs = ProcMan::create(&base)?;
        let storage = Storage::new(name, 2);
        let vertex = Store::create(&base, Self::vertex_config())?;
        vertex.config_indexing(&iman);
        storage.register(&vertex);
        let scope = Arc::new(Self {
            name: name.to_string(),
            base,
            model,
            text,
            iman,
            ipc,
            procs,
            storage,
            vertex,
            contexts: RwLock::new(HashMap::new()),
            next_auto: AtomicU64::new(seed_auto()),
        });
        scope.persist_catalog()?;
        scope.storage.start();
        Ok(scope)
    }

    /// Open an existing scope: read the catalog, reconstruct every store,
    /// re-open every index and start the workers.
    pub fn open(base_dir: &Path, name: &str) -> Result<Arc<Self>> {
        let base = base_dir.join(name);
        let bytes = std::fs::read(Self::catalog_path(&base))
            .map_err(|e| NowError::os(ErrorKind::Open, "scope", &e))?;
        let (cat, _): (Catalog, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| errof!(Catalog, "scope", "{e}"))?;
        if cat.version != SCOPE_VERSION {
            return Err(errof!(Version, "scope"));
        }
        let model = Model::open(&base)?;
        let text = Arc::new(TextDict::open(&base)?);
        let iman = Arc::new(IndexMan::open(&base)?);
        let ipc = Ipc::open(&base)?;
        let procs = ProcMan::open(&base)?;
        let storage = Storage::new(name, 2);
        let vertex = Store::open(&base, Self::vertex_config())?;
        vertex.config_indexing(&iman);
        storage.register(&vertex);
        let mut contexts = HashMap::new();
        for desc in &cat.contexts {
            let store = Store::open(&base, Self::context_config(desc))?;
            store.config_indexing(&iman);
            storage.register(&store);
            contexts.insert(desc.name.clone(), store);
        }
        let scope = Arc::new(Self {
            name: name.to_string(),
            base,
            model,
            text,
            iman,
            ipc,
            procs,
            storage,
            vertex,
            contexts: RwLock::new(contexts),
            next_auto: AtomicU64::new(seed_auto()),
        });
        scope.storage.start();
        Ok(scope)
    }

    /// Flush everything: stop workers, drain pending sorts, close stores,
    /// persist the index trees.
    pub fn close(&self) -> Result<()> {
        self.storage.stop();
        self.storage.drain_pending()?;
        self.vertex.close()?;
        for store in self.contexts.read().values() {
            store.close()?;
        }
        self.iman.save_all()?;
        self.text.close()?;
        log::info!("scope {} closed", self.name);
        Ok(())
    }

    /// Remove the scope from disk. The scope must be closed.
    pub fn drop_scope(&self) -> Result<()> {
        crate::fsutil::remove_tree(&self.base)
    }

    fn persist_catalog(&self) -> Result<()> {
        let mut contexts: Vec<ContextDesc> = self
            .contexts
            .read()
            .values()
            .map(|s| ContextDesc {
                name: s.cfg.name.clone(),
                comp: s.cfg.comp as u32,
                sorted: s.cfg.sort.is_some(),
                stamped: s.cfg.stamped,
            })
            .collect();
        contexts.sort_by(|a, b| a.name.cmp(&b.name));
        let cat = Catalog { version: SCOPE_VERSION, contexts };
        let bytes = bincode::serde::encode_to_vec(&cat, bincode::config::standard())
            .map_err(|e| errof!(Catalog, "scope", "{e}"))?;
        crate::fsutil::write_atomic(&Self::catalog_path(&self.base), &bytes)
    }

    // ---- stores ----------------------------------------------------------

    #[must_use]
    pub fn vertex_store(&self) -> Arc<Store> {
        Arc::clone(&self.vertex)
    }

    pub fn context_store(&self, name: &str) -> Result<Arc<Store>> {
        self.contexts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| errof!(NotFound, "scope", "context '{name}'"))
    }

    /// Create an edge context store.
    pub fn create_context(&self, name: &str) -> Result<Arc<Store>> {
        crate::fsutil::check_name(name)?;
        if self.contexts.read().contains_key(name) {
            return Err(errof!(DupName, "scope", "context '{name}'"));
        }
        let desc = ContextDesc {
            name: name.to_string(),
            comp: Comp::Zstd as u32,
            sorted: true,
            stamped: true,
        };
        let store = Store::create(&self.base, Self::context_config(&desc))?;
        store.config_indexing(&self.iman);
        self.storage.register(&store);
        self.contexts.write().insert(name.to_string(), Arc::clone(&store));
        self.persist_catalog()?;
        Ok(store)
    }

    pub fn drop_context(&self, name: &str) -> Result<()> {
        let store = self
            .contexts
            .write()
            .remove(name)
            .ok_or_else(|| errof!(NotFound, "scope", "context '{name}'"))?;
        store.drop_store()?;
        self.persist_catalog()
    }

    // ---- DDL -------------------------------------------------------------

    pub fn create_type(
        &self,
        name: &str,
        vid: VidPolicy,
        props: &[(String, Typ, bool)],
    ) -> Result<()> {
        self.model.add_vertex_type(name, vid, props)?;
        Ok(())
    }

    pub fn drop_type(&self, name: &str) -> Result<()> {
        self.model.drop_vertex_type(name)
    }

    /// Declare an edge type; its context store is created along with it.
    #[allow(clippy::too_many_arguments)]
    pub fn create_edge(
        &self,
        name: &str,
        origin: &str,
        destin: &str,
        label: Typ,
        weight: Typ,
        weight2: Typ,
        stamped: bool,
    ) -> Result<()> {
        self.model.add_edge_type(name, origin, destin, label, weight, weight2, stamped)?;
        self.create_context(name)?;
        Ok(())
    }

    pub fn drop_edge(&self, name: &str) -> Result<()> {
        self.model.drop_edge_type(name)?;
        self.drop_context(name)
    }

    /// Create a named index over a context (edge fields) or the vertex
    /// store (triple fields) and backfill it from the existing data.
    pub fn create_index(
        &self,
        name: &str,
        on: &str,
        fields: &[String],
        sizing: Sizing,
    ) -> Result<()> {
        let (context, store, content) = if self.contexts.read().contains_key(on) {
            (Some(on.to_string()), self.context_store(on)?, Content::Edge)
        } else if on == VERTEX_STORE || self.model.has_vertex(on) {
            (None, self.vertex_store(), Content::Vertex)
        } else {
            return Err(errof!(NotFound, "scope", "index target '{on}'"));
        };
        let mut offs = Vec::with_capacity(fields.len());
        for f in fields {
            offs.push(index_field_off(content, f)?);
        }
        let keys = IndexKeys::new(content, offs);
        // settle pending sorts so the backfill sees a stable file set
        for _ in 0..1000 {
            self.storage.drain_pending()?;
            if store.idle() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let idx = self.iman.create_index(name, context.as_deref(), keys, sizing)?;
        self.backfill_index(&store, &idx)?;
        idx.save()?;
        Ok(())
    }

    /// Index all completed pages of the store's current files.
    fn backfill_index(&self, store: &Store, idx: &crate::index::Index) -> Result<()> {
        let recsize = store.cfg.recsize as usize;
        for mut f in store.get_files(crate::time::DAWN, crate::time::DUSK) {
            let whole = f.ctrl & CTRL_READER != 0;
            let per_page = f.per_page() as usize;
            f.open()?;
            loop {
                match f.move_next() {
                    Ok(()) => {}
                    Err(e) if e.is_eof() => break,
                    Err(e) => return Err(e),
                }
                let nrec = f.page_records() as usize;
                if !whole && nrec < per_page {
                    continue; // writer tail: not yet a completed page
                }
                idx.insert_page(f.page(), PageId::new(f.id, f.page_offset()), nrec, recsize)?;
            }
            f.close()?;
        }
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.iman.drop_index(name)
    }

    // ---- DML -------------------------------------------------------------

    /// Encode a literal into the raw slot of the declared type, interning
    /// text on the way in.
    pub fn raw_from_lit(&self, typ: Typ, lit: &Lit) -> Result<u64> {
        match (typ, lit) {
            (_, Lit::Null) => Ok(0),
            (Typ::UInt, Lit::UInt(u)) => Ok(*u),
            (Typ::UInt, Lit::Int(i)) if *i >= 0 => Ok(*i as u64),
            (Typ::Int, Lit::Int(i)) => Ok(*i as u64),
            (Typ::Int, Lit::UInt(u)) => Ok(*u),
            (Typ::Float, Lit::Float(f)) => Ok(f.to_bits()),
            (Typ::Float, Lit::Int(i)) => Ok((*i as f64).to_bits()),
            (Typ::Float, Lit::UInt(u)) => Ok((*u as f64).to_bits()),
            (Typ::Bool, Lit::Bool(b)) => Ok(u64::from(*b)),
            (Typ::Time, Lit::Str(s)) => Ok(crate::time::from_time_literal(s)? as u64),
            (Typ::Date, Lit::Str(s)) => Ok(crate::time::from_date_literal(s)? as u64),
            (Typ::Time | Typ::Date, Lit::Int(i)) => Ok(*i as u64),
            (Typ::Time | Typ::Date, Lit::UInt(u)) => Ok(*u),
            (Typ::Text, Lit::Str(s)) => self.text.insert(s),
            _ => Err(errof!(
                Parser,
                "scope",
                "literal {lit:?} does not fit type {}",
                typ.name()
            )),
        }
    }

    /// Insert one logical vertex: one triple per supplied property.
    /// Returns the vertex id.
    pub fn insert_vertex(&self, typ: &str, values: &[(String, Lit)]) -> Result<Key> {
        let def = self.model.vertex_by_name(typ)?;
        let vid = self.vertex_id(&def, values)?;
        for (pname, lit) in values {
            let p = def
                .prop(pname)
                .ok_or_else(|| errof!(NotFound, "scope", "property '{pname}'"))?;
            let raw = self.raw_from_lit(p.typ, lit)?;
            let triple = Vertex {
                vertex: vid,
                property: p.propid,
                value: raw,
                vtype: p.typ,
                role: def.roleid,
            };
            self.vertex.insert(&triple.to_bytes())?;
        }
        Ok(vid)
    }

    fn vertex_id(&self, def: &VertexDef, values: &[(String, Lit)]) -> Result<Key> {
        let pk = def.pk();
        match def.vid {
            VidPolicy::Auto => Ok(self.next_auto.fetch_add(1, Ordering::Relaxed)),
            policy => {
                let pk = pk.ok_or_else(|| {
                    errof!(Invalid, "scope", "type '{}' has no primary key", def.name)
                })?;
                let lit = values
                    .iter()
                    .find(|(n, _)| n == &pk.name)
                    .map(|(_, l)| l)
                    .ok_or_else(|| {
                        errof!(Invalid, "scope", "missing primary key '{}'", pk.name)
                    })?;
                match (policy, lit) {
                    (VidPolicy::Num, Lit::UInt(u)) => Ok(*u),
                    (VidPolicy::Num, Lit::Int(i)) if *i >= 0 => Ok(*i as u64),
                    (VidPolicy::Text, Lit::Str(s)) => self.text.insert(s),
                    _ => Err(errof!(Invalid, "scope", "primary key does not fit vid policy")),
                }
            }
        }
    }

    /// Insert one edge into its context.
    pub fn insert_edge(&self, context: &str, e: &Edge) -> Result<()> {
        let store = self.context_store(context)?;
        store.insert(&e.to_bytes())
    }

    /// `load '<path>' into <target> [use header]`: bulk CSV ingestion.
    pub fn load_csv(&self, path: &Path, target: &str, use_header: bool) -> Result<LoadReport> {
        let file = std::fs::File::open(path)
            .map_err(|e| NowError::os(ErrorKind::Open, "load", &e))?;
        let mut rdr = csv::ReaderBuilder::new().has_headers(use_header).from_reader(file);
        let headers: Vec<String> = if use_header {
            rdr.headers()
                .map_err(|e| errof!(Invalid, "load", "{e}"))?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        let mut report = LoadReport::default();
        if self.model.has_edge(target) {
            self.load_edges(&mut rdr, &headers, target, &mut report)?;
        } else if self.model.has_vertex(target) {
            self.load_vertices(&mut rdr, &headers, target, &mut report)?;
        } else {
            return Err(errof!(NotFound, "load", "target '{target}'"));
        }
        log::info!(
            "scope {}: loaded {} records into {} ({} errors)",
            self.name,
            report.inserted,
            target,
            report.errors
        );
        Ok(report)
    }

    fn load_vertices<R: std::io::Read>(
        &self,
        rdr: &mut csv::Reader<R>,
        headers: &[String],
        target: &str,
        report: &mut LoadReport,
    ) -> Result<()> {
        let def = self.model.vertex_by_name(target)?;
        for rec in rdr.records() {
            let rec = match rec {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("load {target}: bad csv record: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            let mut values = Vec::with_capacity(rec.len());
            let mut bad = false;
            for (i, cell) in rec.iter().enumerate() {
                let pname = if headers.is_empty() {
                    def.props.get(i).map(|p| p.name.clone())
                } else {
                    headers.get(i).cloned()
                };
                let Some(pname) = pname else {
                    bad = true;
                    break;
                };
                let Some(p) = def.prop(&pname) else {
                    bad = true;
                    break;
                };
                match cell_to_lit(cell, p.typ) {
                    Some(lit) => values.push((pname, lit)),
                    None => {
                        bad = true;
                        break;
                    }
                }
            }
            if bad {
                report.errors += 1;
                continue;
            }
            match self.insert_vertex(target, &values) {
                Ok(_) => report.inserted += 1,
                Err(e) => {
                    log::warn!("load {target}: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    fn load_edges<R: std::io::Read>(
        &self,
        rdr: &mut csv::Reader<R>,
        headers: &[String],
        target: &str,
        report: &mut LoadReport,
    ) -> Result<()> {
        let def = self.model.edge_by_name(target)?;
        // column layout without headers: origin, destin, [timestamp],
        // [weight], [weight2]
        let mut cols: Vec<&str> = vec!["origin", "destin"];
        if def.stamped {
            cols.push("timestamp");
        }
        if def.weight != Typ::Nothing {
            cols.push("weight");
        }
        if def.weight2 != Typ::Nothing {
            cols.push("weight2");
        }
        for rec in rdr.records() {
            let rec = match rec {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("load {target}: bad csv record: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            let mut e = Edge {
                edge: def.edgeid,
                wtype: def.weight,
                wtype2: def.weight2,
                ..Edge::default()
            };
            let mut bad = false;
            for (i, cell) in rec.iter().enumerate() {
                let col = if headers.is_empty() {
                    cols.get(i).copied()
                } else {
                    headers.get(i).map(String::as_str)
                };
                let ok = match col {
                    Some("origin") => self.id_cell(cell).map(|v| e.origin = v).is_some(),
                    Some("destin" | "destination") => {
                        self.id_cell(cell).map(|v| e.destin = v).is_some()
                    }
                    Some("label") => match cell_to_lit(cell, def.label) {
                        Some(l) => {
                            e.label = self.raw_from_lit(def.label, &l)?;
                            true
                        }
                        None => false,
                    },
                    Some("timestamp" | "stamp") => {
                        match crate::time::from_time_literal(cell) {
                            Ok(t) => {
                                e.timestamp = t;
                                true
                            }
                            Err(_) => false,
                        }
                    }
                    Some("weight") => match cell_to_lit(cell, def.weight) {
                        Some(l) => {
                            e.weight = self.raw_from_lit(def.weight, &l)?;
                            true
                        }
                        None => false,
                    },
                    Some("weight2") => match cell_to_lit(cell, def.weight2) {
                        Some(l) => {
                            e.weight2 = self.raw_from_lit(def.weight2, &l)?;
                            true
                        }
                        None => false,
                    },
                    _ => false,
                };
                if !ok {
                    bad = true;
                    break;
                }
            }
            if bad {
                report.errors += 1;
                continue;
            }
            match self.insert_edge(target, &e) {
                Ok(()) => report.inserted += 1,
                Err(err) => {
                    log::warn!("load {target}: {err}");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Vertex ids in CSV cells: numeric directly, otherwise interned text.
    fn id_cell(&self, cell: &str) -> Option<u64> {
        if let Ok(u) = cell.trim().parse::<u64>() {
            return Some(u);
        }
        self.text.insert(cell.trim()).ok()
    }
}

fn seed_auto() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

fn index_field_off(content: Content, field: &str) -> Result<u16> {
    let off = match (content, field) {
        (Content::Edge, "edge") => OFF_EDGE,
        (Content::Edge, "origin") => OFF_ORIGIN,
        (Content::Edge, "destin" | "destination") => OFF_DESTIN,
        (Content::Edge, "label") => OFF_LABEL,
        (Content::Edge, "timestamp" | "stamp") => OFF_TMSTMP,
        (Content::Edge, "weight") => OFF_WEIGHT,
        (Content::Edge, "weight2") => OFF_WEIGHT2,
        (Content::Vertex, "vertex") => OFF_VERTEX,
        (Content::Vertex, "property") => OFF_PROP,
        (Content::Vertex, "value") => OFF_VALUE,
        (Content::Vertex, "role") => OFF_ROLE,
        _ => return Err(errof!(NotFound, "scope", "index field '{field}'")),
    };
    Ok(off as u16)
}

fn cell_to_lit(cell: &str, typ: Typ) -> Option<Lit> {
    let cell = cell.trim();
    match typ {
        Typ::UInt => cell.parse::<u64>().ok().map(Lit::UInt),
        Typ::Int => cell.parse::<i64>().ok().map(Lit::Int),
        Typ::Float => cell.parse::<f64>().ok().map(Lit::Float),
        Typ::Bool => match cell.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Lit::Bool(true)),
            "false" | "0" => Some(Lit::Bool(false)),
            _ => None,
        },
        Typ::Time | Typ::Date => Some(Lit::Str(cell.to_string())),
        Typ::Text => Some(Lit::Str(cell.to_string())),
        Typ::Nothing => None,
    }
}
