use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::sql::ast::Lit;
use crate::types::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CATALOG: &str = "procman";
const PROC_VERSION: u32 = 1;

/// A registered stored procedure. Execution happens in an external host;
/// the core only keeps the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcDesc {
    pub name: String,
    pub lang: String,
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Catalog {
    version: u32,
    procs: Vec<ProcDesc>,
}

/// Hook into the external procedure host (Lua/Python). Absent by default.
pub type ProcHost = dyn Fn(&ProcDesc, &[Lit]) -> Result<Value> + Send + Sync;

/// Stored-procedure catalog of a scope.
pub struct ProcMan {
    path: PathBuf,
    procs: RwLock<HashMap<String, ProcDesc>>,
    host: RwLock<Option<Arc<ProcHost>>>,
    /// Module search path from NOWDB_LUA_PATH for this scope.
    pub module_path: RwLock<Option<String>>,
}

impl ProcMan {
    pub fn create(base: &Path) -> Result<Self> {
        let man = Self {
            path: base.join(CATALOG),
            procs: RwLock::new(HashMap::new()),
            host: RwLock::new(None),
            module_path: RwLock::new(None),
        };
        man.persist()?;
        Ok(man)
    }

    pub fn open(base: &Path) -> Result<Self> {
        let path = base.join(CATALOG);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Self::create(base);
            }
            Err(e) => return Err(NowError::os(ErrorKind::Open, "procman", &e)),
        };
        let (cat, _): (Catalog, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| errof!(Catalog, "procman", "{e}"))?;
        if cat.version != PROC_VERSION {
            return Err(errof!(Version, "procman"));
        }
        let procs = cat.procs.into_iter().map(|p| (p.name.clone(), p)).collect();
        Ok(Self {
            path,
            procs: RwLock::new(procs),
            host: RwLock::new(None),
            module_path: RwLock::new(None),
        })
    }

    fn persist(&self) -> Result<()> {
        let mut procs: Vec<ProcDesc> = self.procs.read().values().cloned().collect();
        procs.sort_by(|a, b| a.name.cmp(&b.name));
        let cat = Catalog { version: PROC_VERSION, procs };
        let bytes = bincode::serde::encode_to_vec(&cat, bincode::config::standard())
            .map_err(|e| errof!(Catalog, "procman", "{e}"))?;
        crate::fsutil::write_atomic(&self.path, &bytes)
    }

    pub fn create_proc(&self, name: &str, lang: &str, path: Option<&str>) -> Result<()> {
        crate::fsutil::check_name(name)?;
        if !matches!(lang, "lua" | "python") {
            return Err(errof!(NotSupp, "procman", "language '{lang}'"));
        }
        let mut g = self.procs.write();
        if g.contains_key(name) {
            return Err(errof!(DupName, "procman", "'{name}'"));
        }
        g.insert(
            name.to_string(),
            ProcDesc {
                name: name.to_string(),
                lang: lang.to_string(),
                path: path.map(str::to_string),
            },
        );
        drop(g);
        self.persist()
    }

    pub fn drop_proc(&self, name: &str) -> Result<()> {
        if self.procs.write().remove(name).is_none() {
            return Err(errof!(NotFound, "procman", "'{name}'"));
        }
        self.persist()
    }

    pub fn get(&self, name: &str) -> Result<ProcDesc> {
        self.procs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| errof!(NotFound, "procman", "'{name}'"))
    }

    #[must_use]
    pub fn list(&self) -> Vec<ProcDesc> {
        self.procs.read().values().cloned().collect()
    }

    pub fn set_host(&self, host: Arc<ProcHost>) {
        *self.host.write() = Some(host);
    }

    /// Execute a procedure through the registered host; without a host
    /// this is `not-supp`.
    pub fn exec(&self, name: &str, args: &[Lit]) -> Result<Value> {
        let desc = self.get(name)?;
        let host = self.host.read().clone();
        match host {
            Some(h) => h(&desc, args),
            None => Err(errof!(NotSupp, "procman", "no procedure host registered")),
        }
    }
}

/// Parse NOWDB_LUA_PATH: entries separated by `;`, database name and path
/// separated by `:`.
#[must_use]
pub fn parse_module_paths(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in raw.split(';') {
        if let Some((name, path)) = entry.split_once(':')
            && !name.trim().is_empty()
            && !path.trim().is_empty()
        {
            out.insert(name.trim().to_string(), path.trim().to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let man = ProcMan::create(dir.path()).unwrap();
            man.create_proc("myproc", "lua", Some("scripts/myproc.lua")).unwrap();
            assert!(man.create_proc("myproc", "lua", None).unwrap_err().is(ErrorKind::DupName));
        }
        let man = ProcMan::open(dir.path()).unwrap();
        assert_eq!(man.get("myproc").unwrap().lang, "lua");
        man.drop_proc("myproc").unwrap();
        assert!(man.get("myproc").unwrap_err().is(ErrorKind::NotFound));
    }

    #[test]
    fn exec_without_host_is_not_supp() {
        let dir = tempfile::tempdir().unwrap();
        let man = ProcMan::create(dir.path()).unwrap();
        man.create_proc("p", "python", None).unwrap();
        assert!(man.exec("p", &[]).unwrap_err().is(ErrorKind::NotSupp));
    }

    #[test]
    fn exec_through_host() {
        let dir = tempfile::tempdir().unwrap();
        let man = ProcMan::create(dir.path()).unwrap();
        man.create_proc("p", "lua", None).unwrap();
        man.set_host(Arc::new(|desc: &ProcDesc, _args: &[Lit]| {
            Ok(Value::Text(desc.name.clone()))
        }));
        assert_eq!(man.exec("p", &[]).unwrap(), Value::Text("p".into()));
    }

    #[test]
    fn module_path_parsing() {
        let map = parse_module_paths("db1:/opt/lua/db1;db2:/opt/lua/db2;broken");
        assert_eq!(map.len(), 2);
        assert_eq!(map["db1"], "/opt/lua/db1");
    }
}
