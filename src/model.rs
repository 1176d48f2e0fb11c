use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use crate::types::{Key, RoleId, Typ};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const CATALOG: &str = "catalog";
const MODEL_VERSION: u32 = 1;

/// How vertex ids are assigned for a vertex type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VidPolicy {
    /// The primary key is numeric and used as the vertex id.
    #[default]
    Num,
    /// The primary key is text; its dictionary key is the vertex id.
    Text,
    /// Vertex ids are generated.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropDef {
    pub name: String,
    pub propid: Key,
    /// Position in declaration order.
    pub pos: u32,
    pub typ: Typ,
    pub pk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexDef {
    pub name: String,
    pub roleid: RoleId,
    pub vid: VidPolicy,
    pub props: Vec<PropDef>,
}

impl VertexDef {
    #[must_use]
    pub fn prop(&self, name: &str) -> Option<&PropDef> {
        self.props.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn prop_by_id(&self, propid: Key) -> Option<&PropDef> {
        self.props.iter().find(|p| p.propid == propid)
    }

    #[must_use]
    pub fn pk(&self) -> Option<&PropDef> {
        self.props.iter().find(|p| p.pk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub name: String,
    pub edgeid: Key,
    pub origin: RoleId,
    pub destin: RoleId,
    pub label: Typ,
    pub weight: Typ,
    pub weight2: Typ,
    pub stamped: bool,
    /// Extended attributes of the variable edge form; empty for the
    /// historical 64-byte layout.
    pub props: Vec<PropDef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Catalog {
    version: u32,
    next_role: RoleId,
    next_prop: Key,
    next_edge: Key,
    vertices: Vec<VertexDef>,
    edges: Vec<EdgeDef>,
}

/// The typed schema of a scope: vertex types, edge types, properties and
/// primary keys, with bidirectional name <-> id lookups persisted to disk.
pub struct Model {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    next_role: RoleId,
    next_prop: Key,
    next_edge: Key,
    verts_by_name: HashMap<String, VertexDef>,
    roles: HashMap<RoleId, String>,
    edges_by_name: HashMap<String, EdgeDef>,
    edge_ids: HashMap<Key, String>,
}

impl Model {
    pub fn create(base: &Path) -> Result<Self> {
        let dir = base.join("model");
        crate::fsutil::ensure_dir(&dir)?;
        let m = Self {
            path: dir.join(CATALOG),
            inner: RwLock::new(Inner {
                next_role: 1,
                next_prop: 1,
                next_edge: 1,
                verts_by_name: HashMap::new(),
                roles: HashMap::new(),
                edges_by_name: HashMap::new(),
                edge_ids: HashMap::new(),
            }),
        };
        m.persist()?;
        Ok(m)
    }

    pub fn open(base: &Path) -> Result<Self> {
        let path = base.join("model").join(CATALOG);
        let bytes =
            std::fs::read(&path).map_err(|e| NowError::os(ErrorKind::Open, "model", &e))?;
        let (cat, _): (Catalog, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| errof!(Catalog, "model", "{e}"))?;
        if cat.version != MODEL_VERSION {
            return Err(errof!(Version, "model", "catalog version {}", cat.version));
        }
        let mut inner = Inner {
            next_role: cat.next_role,
            next_prop: cat.next_prop,
            next_edge: cat.next_edge,
            verts_by_name: HashMap::new(),
            roles: HashMap::new(),
            edges_by_name: HashMap::new(),
            edge_ids: HashMap::new(),
        };
        for v in cat.vertices {
            inner.roles.insert(v.roleid, v.name.clone());
            inner.verts_by_name.insert(v.name.clone(), v);
        }
        for e in cat.edges {
            inner.edge_ids.insert(e.edgeid, e.name.clone());
            inner.edges_by_name.insert(e.name.clone(), e);
        }
        Ok(Self { path, inner: RwLock::new(inner) })
    }

    fn persist(&self) -> Result<()> {
        let g = self.inner.read();
        let mut vertices: Vec<VertexDef> = g.verts_by_name.values().cloned().collect();
        vertices.sort_by_key(|v| v.roleid);
        let mut edges: Vec<EdgeDef> = g.edges_by_name.values().cloned().collect();
        edges.sort_by_key(|e| e.edgeid);
        let cat = Catalog {
            version: MODEL_VERSION,
            next_role: g.next_role,
            next_prop: g.next_prop,
            next_edge: g.next_edge,
            vertices,
            edges,
        };
        drop(g);
        let bytes = bincode::serde::encode_to_vec(&cat, bincode::config::standard())
            .map_err(|e| errof!(Catalog, "model", "{e}"))?;
        crate::fsutil::write_atomic(&self.path, &bytes)
    }

    /// Declare a vertex type. Property order is declaration order; at most
    /// one property may be the primary key.
    pub fn add_vertex_type(
        &self,
        name: &str,
        vid: VidPolicy,
        props: &[(String, Typ, bool)],
    ) -> Result<RoleId> {
        crate::fsutil::check_name(name)?;
        if props.iter().filter(|(_, _, pk)| *pk).count() > 1 {
            return Err(errof!(Invalid, "model", "more than one primary key"));
        }
        let roleid;
        {
            let mut g = self.inner.write();
            if g.verts_by_name.contains_key(name) || g.edges_by_name.contains_key(name) {
                return Err(errof!(DupName, "model", "'{name}'"));
            }
            roleid = g.next_role;
            g.next_role += 1;
            let mut defs = Vec::with_capacity(props.len());
            for (pos, (pname, typ, pk)) in props.iter().enumerate() {
                let propid = g.next_prop;
                g.next_prop += 1;
                defs.push(PropDef {
                    name: pname.clone(),
                    propid,
                    pos: pos as u32,
                    typ: *typ,
                    pk: *pk,
                });
            }
            let def = VertexDef { name: name.to_string(), roleid, vid, props: defs };
            g.roles.insert(roleid, name.to_string());
            g.verts_by_name.insert(name.to_string(), def);
        }
        self.persist()?;
        Ok(roleid)
    }

    /// Declare an edge type between two declared vertex types.
    #[allow(clippy::too_many_arguments)]
    pub fn add_edge_type(
        &self,
        name: &str,
        origin: &str,
        destin: &str,
        label: Typ,
        weight: Typ,
        weight2: Typ,
        stamped: bool,
    ) -> Result<Key> {
        crate::fsutil::check_name(name)?;
        let edgeid;
        {
            let mut g = self.inner.write();
            if g.edges_by_name.contains_key(name) || g.verts_by_name.contains_key(name) {
                return Err(errof!(DupName, "model", "'{name}'"));
            }
            let o = g
                .verts_by_name
                .get(origin)
                .ok_or_else(|| errof!(NotFound, "model", "origin type '{origin}'"))?
                .roleid;
            let d = g
                .verts_by_name
                .get(destin)
                .ok_or_else(|| errof!(NotFound, "model", "destin type '{destin}'"))?
                .roleid;
            edgeid = g.next_edge;
            g.next_edge += 1;
            let def = EdgeDef {
                name: name.to_string(),
                edgeid,
                origin: o,
                destin: d,
                label,
                weight,
                weight2,
                stamped,
                props: Vec::new(),
            };
            g.edge_ids.insert(edgeid, name.to_string());
            g.edges_by_name.insert(name.to_string(), def);
        }
        self.persist()?;
        Ok(edgeid)
    }

    pub fn drop_vertex_type(&self, name: &str) -> Result<()> {
        {
            let mut g = self.inner.write();
            let def = g
                .verts_by_name
                .remove(name)
                .ok_or_else(|| errof!(NotFound, "model", "type '{name}'"))?;
            g.roles.remove(&def.roleid);
        }
        self.persist()
    }

    pub fn drop_edge_type(&self, name: &str) -> Result<()> {
        {
            let mut g = self.inner.write();
            let def = g
                .edges_by_name
                .remove(name)
                .ok_or_else(|| errof!(NotFound, "model", "edge '{name}'"))?;
            g.edge_ids.remove(&def.edgeid);
        }
        self.persist()
    }

    pub fn vertex_by_name(&self, name: &str) -> Result<VertexDef> {
        self.inner
            .read()
            .verts_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| errof!(NotFound, "model", "type '{name}'"))
    }

    pub fn vertex_by_role(&self, role: RoleId) -> Result<VertexDef> {
        let g = self.inner.read();
        g.roles
            .get(&role)
            .and_then(|n| g.verts_by_name.get(n))
            .cloned()
            .ok_or_else(|| errof!(NotFound, "model", "role {role}"))
    }

    pub fn edge_by_name(&self, name: &str) -> Result<EdgeDef> {
        self.inner
            .read()
            .edges_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| errof!(NotFound, "model", "edge '{name}'"))
    }

    pub fn edge_by_id(&self, id: Key) -> Result<EdgeDef> {
        let g = self.inner.read();
        g.edge_ids
            .get(&id)
            .and_then(|n| g.edges_by_name.get(n))
            .cloned()
            .ok_or_else(|| errof!(NotFound, "model", "edge id {id}"))
    }

    #[must_use]
    pub fn has_vertex(&self, name: &str) -> bool {
        self.inner.read().verts_by_name.contains_key(name)
    }

    #[must_use]
    pub fn has_edge(&self, name: &str) -> bool {
        self.inner.read().edges_by_name.contains_key(name)
    }

    #[must_use]
    pub fn vertex_names(&self) -> Vec<String> {
        self.inner.read().verts_by_name.keys().cloned().collect()
    }

    #[must_use]
    pub fn edge_names(&self) -> Vec<String> {
        self.inner.read().edges_by_name.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_props() -> Vec<(String, Typ, bool)> {
        vec![
            ("prod_key".into(), Typ::UInt, true),
            ("prod_desc".into(), Typ::Text, false),
            ("prod_price".into(), Typ::Float, false),
        ]
    }

    #[test]
    fn vertex_type_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let m = Model::create(dir.path()).unwrap();
        let role = m.add_vertex_type("product", VidPolicy::Num, &product_props()).unwrap();
        let v = m.vertex_by_name("product").unwrap();
        assert_eq!(v.roleid, role);
        assert_eq!(v.pk().unwrap().name, "prod_key");
        assert_eq!(v.prop("prod_price").unwrap().pos, 2);
        assert_eq!(m.vertex_by_role(role).unwrap().name, "product");
    }

    #[test]
    fn edge_type_needs_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let m = Model::create(dir.path()).unwrap();
        m.add_vertex_type("client", VidPolicy::Num, &[("c".into(), Typ::UInt, true)]).unwrap();
        assert!(
            m.add_edge_type("buys", "client", "product", Typ::Nothing, Typ::Float, Typ::Float, true)
                .unwrap_err()
                .is(ErrorKind::NotFound)
        );
        m.add_vertex_type("product", VidPolicy::Num, &product_props()).unwrap();
        let id = m
            .add_edge_type("buys", "client", "product", Typ::Nothing, Typ::Float, Typ::Float, true)
            .unwrap();
        assert_eq!(m.edge_by_id(id).unwrap().name, "buys");
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = Model::create(dir.path()).unwrap();
        m.add_vertex_type("a", VidPolicy::Num, &[]).unwrap();
        assert!(m.add_vertex_type("a", VidPolicy::Num, &[]).unwrap_err().is(ErrorKind::DupName));
    }

    #[test]
    fn catalog_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let m = Model::create(dir.path()).unwrap();
            m.add_vertex_type("product", VidPolicy::Num, &product_props()).unwrap();
        }
        let m = Model::open(dir.path()).unwrap();
        let v = m.vertex_by_name("product").unwrap();
        assert_eq!(v.props.len(), 3);
        // id counters continue after reload
        let r2 = m.add_vertex_type("client", VidPolicy::Num, &[]).unwrap();
        assert!(r2 > v.roleid);
    }
}
