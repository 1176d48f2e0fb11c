use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::index::tree::{Index, Sizing};
use crate::sort::IndexKeys;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CATALOG: &str = "imancat";
const MAN_VERSION: u32 = 1;

/// Persisted index descriptor: name, owning context (`None` means the
/// vertex store) and the key layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDesc {
    pub name: String,
    pub context: Option<String>,
    pub keys: IndexKeys,
    pub sizing: Sizing,
}

#[derive(Serialize, Deserialize)]
struct Catalog {
    version: u32,
    indexes: Vec<IndexDesc>,
}

/// Named keyed indexes over the stores of one scope. Creation and drop
/// take the write lock, `use_index` takes a read lock and hands out a
/// shared handle whose lifetime outlives any cursor using it.
pub struct IndexMan {
    base: PathBuf,
    inner: RwLock<HashMap<String, (IndexDesc, Arc<Index>)>>,
}

impl IndexMan {
    fn catalog_path(base: &Path) -> PathBuf {
        base.join(CATALOG)
    }

    fn index_dir(base: &Path, desc_context: Option<&str>, name: &str) -> PathBuf {
        let store_dir = desc_context.unwrap_or("vertex");
        base.join(store_dir).join("index").join(name)
    }

    /// Fresh manager with an empty catalog.
    pub fn create(base: &Path) -> Result<Self> {
        let man = Self { base: base.to_path_buf(), inner: RwLock::new(HashMap::new()) };
        man.persist()?;
        Ok(man)
    }

    /// Restore all descriptors and open their trees.
    pub fn open(base: &Path) -> Result<Self> {
        let bytes = std::fs::read(Self::catalog_path(base))
            .map_err(|e| NowError::os(ErrorKind::Open, "iman", &e))?;
        let (cat, _): (Catalog, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| errof!(Catalog, "iman", "{e}"))?;
        if cat.version != MAN_VERSION {
            return Err(errof!(Version, "iman"));
        }
        let mut map = HashMap::new();
        for desc in cat.indexes {
            let dir = Self::index_dir(base, desc.context.as_deref(), &desc.name);
            let idx = Index::open(&desc.name, desc.keys.clone(), desc.sizing, &dir)?;
            map.insert(desc.name.clone(), (desc, Arc::new(idx)));
        }
        Ok(Self { base: base.to_path_buf(), inner: RwLock::new(map) })
    }

    fn persist(&self) -> Result<()> {
        let g = self.inner.read();
        let mut indexes: Vec<IndexDesc> = g.values().map(|(d, _)| d.clone()).collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        drop(g);
        let cat = Catalog { version: MAN_VERSION, indexes };
        let bytes = bincode::serde::encode_to_vec(&cat, bincode::config::standard())
            .map_err(|e| errof!(Catalog, "iman", "{e}"))?;
        crate::fsutil::write_atomic(&Self::catalog_path(&self.base), &bytes)
    }

    /// Create a named index; fails with `dup-name` when taken.
    pub fn create_index(
        &self,
        name: &str,
        context: Option<&str>,
        keys: IndexKeys,
        sizing: Sizing,
    ) -> Result<Arc<Index>> {
        crate::fsutil::check_name(name)?;
        {
            let g = self.inner.read();
            if g.contains_key(name) {
                return Err(errof!(DupName, "iman", "'{name}'"));
            }
        }
        let dir = Self::index_dir(&self.base, context, name);
        let idx = Arc::new(Index::create(name, keys.clone(), sizing, &dir)?);
        let desc = IndexDesc {
            name: name.to_string(),
            context: context.map(str::to_string),
            keys,
            sizing,
        };
        self.inner.write().insert(name.to_string(), (desc, Arc::clone(&idx)));
        self.persist()?;
        Ok(idx)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let removed = self.inner.write().remove(name);
        let Some((desc, _)) = removed else {
            return Err(errof!(NotFound, "iman", "'{name}'"));
        };
        let dir = Self::index_dir(&self.base, desc.context.as_deref(), name);
        crate::fsutil::remove_tree(&dir)?;
        self.persist()
    }

    /// Shared handle to a named index.
    pub fn use_index(&self, name: &str) -> Result<Arc<Index>> {
        self.inner
            .read()
            .get(name)
            .map(|(_, i)| Arc::clone(i))
            .ok_or_else(|| errof!(NotFound, "iman", "'{name}'"))
    }

    /// All indexes defined over one store (context name, or vertex).
    #[must_use]
    pub fn for_context(&self, context: Option<&str>) -> Vec<Arc<Index>> {
        self.inner
            .read()
            .values()
            .filter(|(d, _)| d.context.as_deref() == context)
            .map(|(_, i)| Arc::clone(i))
            .collect()
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<IndexDesc> {
        self.inner.read().values().map(|(d, _)| d.clone()).collect()
    }

    /// Persist every tree (scope close path).
    pub fn save_all(&self) -> Result<()> {
        for (_, idx) in self.inner.read().values() {
            idx.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, OFF_DESTIN, OFF_ORIGIN};

    fn keys() -> IndexKeys {
        IndexKeys::new(Content::Edge, vec![OFF_ORIGIN as u16, OFF_DESTIN as u16])
    }

    #[test]
    fn create_use_drop() {
        let dir = tempfile::tempdir().unwrap();
        let man = IndexMan::create(dir.path()).unwrap();
        man.create_index("byorigin", Some("buys"), keys(), Sizing::Medium).unwrap();
        assert!(man.use_index("byorigin").is_ok());
        assert!(
            man.create_index("byorigin", Some("buys"), keys(), Sizing::Medium)
                .unwrap_err()
                .is(ErrorKind::DupName)
        );
        assert_eq!(man.for_context(Some("buys")).len(), 1);
        assert!(man.for_context(None).is_empty());
        man.drop_index("byorigin").unwrap();
        assert!(man.use_index("byorigin").unwrap_err().is(ErrorKind::NotFound));
    }

    #[test]
    fn catalog_restores_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        {
            let man = IndexMan::create(dir.path()).unwrap();
            let idx = man.create_index("k", Some("buys"), keys(), Sizing::Large).unwrap();
            let key = keys().extract(&[0u8; 64]);
            idx.insert(&key, crate::types::PageId::new(1, 0), 0).unwrap();
            man.save_all().unwrap();
        }
        let man = IndexMan::open(dir.path()).unwrap();
        let idx = man.use_index("k").unwrap();
        assert_eq!(idx.search(&keys().extract(&[0u8; 64])).len(), 1);
        assert_eq!(man.descriptors().len(), 1);
    }
}
