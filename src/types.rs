use serde::{Deserialize, Serialize};

/// Interned text / model keys.
pub type Key = u64;
/// Timestamps are nanoseconds since the unix epoch.
pub type Time = i64;
/// File identifiers are unique per store.
pub type FileId = u32;
/// Vertex type (role) identifiers.
pub type RoleId = u32;

/// Size of one page: the unit of compression and I/O.
pub const PAGE_SIZE: usize = 8192;

/// Fixed edge record layout (historical 64-byte form).
pub const EDGE_RECSIZE: usize = 64;
/// Vertex property-triple record.
pub const VERTEX_RECSIZE: usize = 32;

/// Field offsets into an edge record.
pub const OFF_EDGE: usize = 0;
pub const OFF_ORIGIN: usize = 8;
pub const OFF_DESTIN: usize = 16;
pub const OFF_LABEL: usize = 24;
pub const OFF_TMSTMP: usize = 32;
pub const OFF_WEIGHT: usize = 40;
pub const OFF_WEIGHT2: usize = 48;
pub const OFF_WTYPE: usize = 56;
pub const OFF_WTYPE2: usize = 60;

/// Field offsets into a vertex triple.
pub const OFF_VERTEX: usize = 0;
pub const OFF_PROP: usize = 8;
pub const OFF_VALUE: usize = 16;
pub const OFF_VTYPE: usize = 24;
pub const OFF_ROLE: usize = 28;

/// A page is addressed by (file id, byte offset of the page within the
/// uncompressed image of the file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    #[must_use]
    pub fn new(file: FileId, off: u32) -> Self {
        Self((u64::from(file) << 32) | u64::from(off))
    }
    #[must_use]
    pub fn file(self) -> FileId {
        (self.0 >> 32) as FileId
    }
    #[must_use]
    pub fn offset(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file(), self.offset())
    }
}

/// What a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Vertex,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ord_ {
    Asc,
    Desc,
}

/// Semantic type tags. The numeric values are stable: they appear in
/// records (weight/value type slots), in catalogs and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Typ {
    Nothing = 0,
    Text = 1,
    Date = 2,
    Time = 3,
    Float = 4,
    Int = 5,
    UInt = 6,
    Bool = 9,
}

impl Typ {
    #[must_use]
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            1 => Typ::Text,
            2 => Typ::Date,
            3 => Typ::Time,
            4 => Typ::Float,
            5 => Typ::Int,
            6 => Typ::UInt,
            9 => Typ::Bool,
            _ => Typ::Nothing,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Typ::Nothing => "null",
            Typ::Text => "text",
            Typ::Date => "date",
            Typ::Time => "time",
            Typ::Float => "float",
            Typ::Int => "int",
            Typ::UInt => "uint",
            Typ::Bool => "bool",
        }
    }

    /// Time and date are int64 with unit nanoseconds since epoch.
    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, Typ::Time | Typ::Date)
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Typ::UInt | Typ::Int | Typ::Float) || self.is_temporal()
    }
}

/// A dynamically typed value as it flows through expressions and rows.
/// Stored fields are the raw 8-byte slot plus the type tag; `Value` is the
/// decoded form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nothing,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    /// Nanoseconds since epoch; covers both `time` and `date`.
    Time(Time),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn typ(&self) -> Typ {
        match self {
            Value::Nothing => Typ::Nothing,
            Value::Bool(_) => Typ::Bool,
            Value::UInt(_) => Typ::UInt,
            Value::Int(_) => Typ::Int,
            Value::Float(_) => Typ::Float,
            Value::Time(_) => Typ::Time,
            Value::Text(_) => Typ::Text,
        }
    }

    /// Decode a raw 8-byte slot according to its tag. Text slots decode to
    /// the key as `UInt`; resolving them to strings is the caller's business.
    #[must_use]
    pub fn from_raw(typ: Typ, raw: u64) -> Self {
        match typ {
            Typ::Nothing => Value::Nothing,
            Typ::Bool => Value::Bool(raw != 0),
            Typ::UInt | Typ::Text => Value::UInt(raw),
            Typ::Int => Value::Int(raw as i64),
            Typ::Float => Value::Float(f64::from_bits(raw)),
            Typ::Time | Typ::Date => Value::Time(raw as i64),
        }
    }

    /// Encode into the raw 8-byte slot. `Text` must already be interned.
    #[must_use]
    pub fn to_raw(&self) -> u64 {
        match self {
            Value::Nothing => 0,
            Value::Bool(b) => u64::from(*b),
            Value::UInt(u) => *u,
            Value::Int(i) => *i as u64,
            Value::Float(f) => f.to_bits(),
            Value::Time(t) => *t as u64,
            Value::Text(_) => 0,
        }
    }

    #[must_use]
    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Numeric view following the promotion lattice uint <= int <= float.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::UInt(u) => Some(*u as f64),
            Value::Int(i) | Value::Time(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Int(i) | Value::Time(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Total order used by filters, sorting and grouping.
    #[must_use]
    pub fn cmp_with(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Nothing, Value::Nothing) => Equal,
            (Value::Nothing, _) => Less,
            (_, Value::Nothing) => Greater,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => Equal,
            },
        }
    }
}

/// Read helpers over raw record bytes.
#[inline]
#[must_use]
pub fn read_u64(rec: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(rec[off..off + 8].try_into().expect("8-byte slot"))
}

#[inline]
#[must_use]
pub fn read_i64(rec: &[u8], off: usize) -> i64 {
    read_u64(rec, off) as i64
}

#[inline]
#[must_use]
pub fn read_u32(rec: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(rec[off..off + 4].try_into().expect("4-byte slot"))
}

#[inline]
pub fn write_u64(rec: &mut [u8], off: usize, v: u64) {
    rec[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn write_u32(rec: &mut [u8], off: usize, v: u32) {
    rec[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// A decoded edge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Edge {
    pub edge: Key,
    pub origin: Key,
    pub destin: Key,
    pub label: Key,
    pub timestamp: Time,
    pub weight: u64,
    pub weight2: u64,
    pub wtype: Typ,
    pub wtype2: Typ,
}

impl Edge {
    #[must_use]
    pub fn decode(rec: &[u8]) -> Self {
        Self {
            edge: read_u64(rec, OFF_EDGE),
            origin: read_u64(rec, OFF_ORIGIN),
            destin: read_u64(rec, OFF_DESTIN),
            label: read_u64(rec, OFF_LABEL),
            timestamp: read_i64(rec, OFF_TMSTMP),
            weight: read_u64(rec, OFF_WEIGHT),
            weight2: read_u64(rec, OFF_WEIGHT2),
            wtype: Typ::from_tag(read_u32(rec, OFF_WTYPE)),
            wtype2: Typ::from_tag(read_u32(rec, OFF_WTYPE2)),
        }
    }

    pub fn encode(&self, rec: &mut [u8]) {
        write_u64(rec, OFF_EDGE, self.edge);
        write_u64(rec, OFF_ORIGIN, self.origin);
        write_u64(rec, OFF_DESTIN, self.destin);
        write_u64(rec, OFF_LABEL, self.label);
        write_u64(rec, OFF_TMSTMP, self.timestamp as u64);
        write_u64(rec, OFF_WEIGHT, self.weight);
        write_u64(rec, OFF_WEIGHT2, self.weight2);
        write_u32(rec, OFF_WTYPE, self.wtype as u32);
        write_u32(rec, OFF_WTYPE2, self.wtype2 as u32);
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; EDGE_RECSIZE] {
        let mut rec = [0u8; EDGE_RECSIZE];
        self.encode(&mut rec);
        rec
    }
}

/// A decoded vertex property triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vertex {
    pub vertex: Key,
    pub property: Key,
    pub value: u64,
    pub vtype: Typ,
    pub role: RoleId,
}

impl Vertex {
    #[must_use]
    pub fn decode(rec: &[u8]) -> Self {
        Self {
            vertex: read_u64(rec, OFF_VERTEX),
            property: read_u64(rec, OFF_PROP),
            value: read_u64(rec, OFF_VALUE),
            vtype: Typ::from_tag(read_u32(rec, OFF_VTYPE)),
            role: read_u32(rec, OFF_ROLE),
        }
    }

    pub fn encode(&self, rec: &mut [u8]) {
        write_u64(rec, OFF_VERTEX, self.vertex);
        write_u64(rec, OFF_PROP, self.property);
        write_u64(rec, OFF_VALUE, self.value);
        write_u32(rec, OFF_VTYPE, self.vtype as u32);
        write_u32(rec, OFF_ROLE, self.role);
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; VERTEX_RECSIZE] {
        let mut rec = [0u8; VERTEX_RECSIZE];
        self.encode(&mut rec);
        rec
    }
}

impl Default for Typ {
    fn default() -> Self {
        Typ::Nothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_roundtrip() {
        let e = Edge {
            edge: 1,
            origin: 2,
            destin: 3,
            label: 4,
            timestamp: -5,
            weight: 6,
            weight2: 7,
            wtype: Typ::Float,
            wtype2: Typ::UInt,
        };
        assert_eq!(Edge::decode(&e.to_bytes()), e);
    }

    #[test]
    fn vertex_roundtrip() {
        let v = Vertex {
            vertex: 42,
            property: 9,
            value: f64::to_bits(2.5),
            vtype: Typ::Float,
            role: 7,
        };
        assert_eq!(Vertex::decode(&v.to_bytes()), v);
    }

    #[test]
    fn pageid_parts() {
        let p = PageId::new(3, 8192);
        assert_eq!(p.file(), 3);
        assert_eq!(p.offset(), 8192);
    }

    #[test]
    fn value_promotion() {
        assert_eq!(Value::UInt(3).as_f64(), Some(3.0));
        assert_eq!(
            Value::Int(-1).cmp_with(&Value::Float(2.0)),
            std::cmp::Ordering::Less
        );
    }
}
