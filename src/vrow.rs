use crate::model::VertexDef;
use crate::types::{Key, RoleId, Vertex, write_u64};
use std::collections::{HashMap, HashSet, VecDeque};

/// Reconstructs wide logical rows from the narrow property-triple vertex
/// encoding. The row buffer starts with the vertex id, followed by one
/// 8-byte slot per referenced (non-primary-key) property; filter and
/// projection fields are rewritten to these offsets.
///
/// The primary key is not materialised: it is the vertex id itself, so PK
/// fields map to offset 0 and a PK-only filter matches every vertex.
pub struct VRow {
    role: RoleId,
    /// Referenced property ids in slot order.
    props: Vec<Key>,
    slots: HashMap<Key, usize>,
    rowsize: usize,
    map: HashMap<Key, Partial>,
    seen: HashSet<Key>,
    ready: VecDeque<Vec<u8>>,
    /// Insertion order of partials, for deterministic force flushes.
    order: VecDeque<Key>,
}

struct Partial {
    row: Vec<u8>,
    present: u64,
    cnt: usize,
}

impl VRow {
    /// Build the rewriter for one vertex type and the set of referenced
    /// property ids (PK references resolve to the vid slot).
    #[must_use]
    pub fn new(def: &VertexDef, referenced: &[Key]) -> Self {
        let pk = def.pk().map(|p| p.propid);
        let mut props = Vec::new();
        let mut slots = HashMap::new();
        for &propid in referenced {
            if Some(propid) == pk || slots.contains_key(&propid) {
                continue;
            }
            slots.insert(propid, 8 + 8 * props.len());
            props.push(propid);
        }
        let rowsize = 8 + 8 * props.len();
        Self {
            role: def.roleid,
            props,
            slots,
            rowsize,
            map: HashMap::new(),
            seen: HashSet::new(),
            ready: VecDeque::new(),
            order: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn rowsize(&self) -> usize {
        self.rowsize
    }

    /// Row offset of a referenced property; 0 (the vid slot) for the PK.
    #[must_use]
    pub fn slot_off(&self, propid: Key) -> Option<usize> {
        self.slots.get(&propid).copied()
    }

    #[must_use]
    pub fn role(&self) -> RoleId {
        self.role
    }

    /// Feed one triple. Completed rows move to the ready queue.
    pub fn add(&mut self, v: &Vertex) {
        if v.role != self.role || self.seen.contains(&v.vertex) {
            return;
        }
        if self.props.is_empty() {
            // nothing but the vid is referenced: one row per vertex
            let mut row = vec![0u8; 8];
            write_u64(&mut row, 0, v.vertex);
            self.seen.insert(v.vertex);
            self.ready.push_back(row);
            return;
        }
        let Some(&off) = self.slots.get(&v.property) else {
            return;
        };
        let slot_bit = 1u64 << ((off - 8) / 8);
        let np = self.props.len();
        let partial = self.map.entry(v.vertex).or_insert_with(|| {
            self.order.push_back(v.vertex);
            let mut row = vec![0u8; self.rowsize];
            write_u64(&mut row, 0, v.vertex);
            Partial { row, present: 0, cnt: 0 }
        });
        if partial.present & slot_bit == 0 {
            partial.present |= slot_bit;
            partial.cnt += 1;
        }
        write_u64(&mut partial.row, off, v.value);
        if partial.cnt == np {
            let done = self.map.remove(&v.vertex).expect("partial just touched");
            self.order.retain(|k| *k != v.vertex);
            self.seen.insert(v.vertex);
            self.ready.push_back(done.row);
        }
    }

    /// Flush all partial rows to the ready queue, complete or not. Used on
    /// vertex-id change in sorted streams and at end of input.
    pub fn force(&mut self) {
        while let Some(vid) = self.order.pop_front() {
            if let Some(p) = self.map.remove(&vid) {
                self.seen.insert(vid);
                self.ready.push_back(p.row);
            }
        }
    }

    /// Pop the next completed row.
    #[must_use]
    pub fn next_ready(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, VidPolicy};
    use crate::types::Typ;

    fn def() -> VertexDef {
        let dir = tempfile::tempdir().unwrap();
        let m = Model::create(dir.path()).unwrap();
        m.add_vertex_type(
            "product",
            VidPolicy::Num,
            &[
                ("prod_key".into(), Typ::UInt, true),
                ("prod_desc".into(), Typ::Text, false),
                ("prod_price".into(), Typ::Float, false),
            ],
        )
        .unwrap();
        m.vertex_by_name("product").unwrap()
    }

    fn triple(def: &VertexDef, vid: u64, prop: &str, value: u64) -> Vertex {
        let p = def.prop(prop).unwrap();
        Vertex { vertex: vid, property: p.propid, value, vtype: p.typ, role: def.roleid }
    }

    #[test]
    fn assembles_complete_rows() {
        let d = def();
        let referenced =
            vec![d.prop("prod_desc").unwrap().propid, d.prop("prod_price").unwrap().propid];
        let mut vr = VRow::new(&d, &referenced);
        assert_eq!(vr.rowsize(), 24);
        vr.add(&triple(&d, 1, "prod_desc", 100));
        assert!(vr.next_ready().is_none());
        vr.add(&triple(&d, 1, "prod_price", 2.5f64.to_bits()));
        let row = vr.next_ready().unwrap();
        assert_eq!(crate::types::read_u64(&row, 0), 1);
        let off = vr.slot_off(d.prop("prod_price").unwrap().propid).unwrap();
        assert_eq!(f64::from_bits(crate::types::read_u64(&row, off)), 2.5);
    }

    #[test]
    fn pk_maps_to_vid_slot() {
        let d = def();
        let pk = d.pk().unwrap().propid;
        let vr = VRow::new(&d, &[pk]);
        assert_eq!(vr.rowsize(), 8);
        assert_eq!(vr.slot_off(pk), None); // rewritten to offset 0 by the planner
    }

    #[test]
    fn pk_only_emits_one_row_per_vertex() {
        let d = def();
        let pk = d.pk().unwrap().propid;
        let mut vr = VRow::new(&d, &[pk]);
        vr.add(&triple(&d, 7, "prod_desc", 1));
        vr.add(&triple(&d, 7, "prod_price", 2));
        vr.add(&triple(&d, 8, "prod_desc", 3));
        let mut vids = Vec::new();
        while let Some(r) = vr.next_ready() {
            vids.push(crate::types::read_u64(&r, 0));
        }
        assert_eq!(vids, vec![7, 8]);
    }

    #[test]
    fn force_flushes_partials() {
        let d = def();
        let referenced =
            vec![d.prop("prod_desc").unwrap().propid, d.prop("prod_price").unwrap().propid];
        let mut vr = VRow::new(&d, &referenced);
        vr.add(&triple(&d, 3, "prod_desc", 9));
        assert_eq!(vr.pending(), 1);
        vr.force();
        assert_eq!(vr.pending(), 0);
        let row = vr.next_ready().unwrap();
        assert_eq!(crate::types::read_u64(&row, 0), 3);
    }

    #[test]
    fn foreign_role_is_ignored() {
        let d = def();
        let referenced = vec![d.prop("prod_desc").unwrap().propid];
        let mut vr = VRow::new(&d, &referenced);
        let mut t = triple(&d, 1, "prod_desc", 5);
        t.role = d.roleid + 1;
        vr.add(&t);
        assert!(vr.next_ready().is_none());
        assert_eq!(vr.pending(), 0);
    }
}
