use crate::errors::Result;
use crate::text::TextDict;
use crate::types::{Key, RoleId, Typ, Value, read_u32, read_u64};
use chrono::{Datelike, Timelike};
use lru::LruCache;
use std::num::NonZeroUsize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Edge,
    Vertex,
}

/// A database field reference. For edges `off` addresses the record; for
/// vertex fields the offset into the reconstructed row is assigned by the
/// vertex-row rewriter before execution.
#[derive(Debug, Clone)]
pub struct Field {
    pub target: Target,
    pub name: String,
    pub off: Option<usize>,
    pub size: usize,
    pub typ: Typ,
    pub propid: Key,
    pub role: RoleId,
    pub pk: bool,
    /// Present interned keys instead of resolving text.
    pub usekey: bool,
}

/// Built-in operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fun {
    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Neg,
    Abs,
    Ceil,
    Floor,
    Round,
    // comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // logic
    And,
    Or,
    Not,
    // time
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    // string
    Upper,
    Lower,
    Trim,
    Length,
    // conversion
    ToUInt,
    ToInt,
    ToFloat,
    ToTime,
}

/// Typed computation tree evaluated per record.
#[derive(Debug, Clone)]
pub enum Expr {
    Const(Value),
    Field(Field),
    Op(Fun, Vec<Expr>),
    /// Reuse the value of another projection entry (group-by refs).
    Ref(usize),
    /// Read the value of an aggregate slot.
    Agg(usize),
}

/// Evaluation context: text resolution with a per-query LRU cache plus
/// the materialised aggregate and projection values of the current row.
pub struct EvalCtx {
    text: Option<std::sync::Arc<TextDict>>,
    lru: LruCache<Key, String>,
    pub aggs: Vec<Value>,
    pub refs: Vec<Value>,
}

impl EvalCtx {
    #[must_use]
    pub fn new(text: Option<std::sync::Arc<TextDict>>) -> Self {
        Self {
            text,
            lru: LruCache::new(NonZeroUsize::new(4096).expect("nonzero")),
            aggs: Vec::new(),
            refs: Vec::new(),
        }
    }

    fn resolve_text(&mut self, key: Key) -> Value {
        if let Some(s) = self.lru.get(&key) {
            return Value::Text(s.clone());
        }
        match self.text.as_ref().and_then(|t| t.get_text(key).ok()) {
            Some(s) => {
                self.lru.put(key, s.clone());
                Value::Text(s)
            }
            None => Value::Nothing,
        }
    }
}

impl Expr {
    #[must_use]
    pub fn constant(v: Value) -> Expr {
        Expr::Const(v)
    }

    /// Collect all field references.
    pub fn fields(&self, out: &mut Vec<Field>) {
        match self {
            Expr::Field(f) => out.push(f.clone()),
            Expr::Op(_, args) => {
                for a in args {
                    a.fields(out);
                }
            }
            _ => {}
        }
    }

    /// Visit all field references mutably (offset rewriting).
    pub fn fields_mut(&mut self, f: &mut impl FnMut(&mut Field)) {
        match self {
            Expr::Field(fld) => f(fld),
            Expr::Op(_, args) => {
                for a in args {
                    a.fields_mut(f);
                }
            }
            _ => {}
        }
    }

    /// Static result type, best effort.
    #[must_use]
    pub fn typ(&self) -> Typ {
        match self {
            Expr::Const(v) => v.typ(),
            Expr::Field(f) => {
                if f.typ == Typ::Text && f.usekey {
                    Typ::UInt
                } else {
                    f.typ
                }
            }
            Expr::Op(fun, args) => match fun {
                Fun::Eq | Fun::Ne | Fun::Lt | Fun::Le | Fun::Gt | Fun::Ge | Fun::And
                | Fun::Or | Fun::Not => Typ::Bool,
                Fun::Year | Fun::Month | Fun::Day | Fun::Hour | Fun::Minute
                | Fun::Second | Fun::Length | Fun::ToInt => Typ::Int,
                Fun::ToUInt => Typ::UInt,
                Fun::ToFloat | Fun::Div | Fun::Pow => Typ::Float,
                Fun::ToTime => Typ::Time,
                Fun::Upper | Fun::Lower | Fun::Trim => Typ::Text,
                _ => args.first().map_or(Typ::Nothing, Expr::typ),
            },
            Expr::Ref(_) | Expr::Agg(_) => Typ::Nothing,
        }
    }

    /// Evaluate against a record; nulls, division by zero and non-finite
    /// float results all propagate as `Nothing`.
    pub fn eval(&self, rec: &[u8], ctx: &mut EvalCtx) -> Result<Value> {
        match self {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Field(f) => Ok(eval_field(f, rec, ctx)),
            Expr::Op(fun, args) => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(a.eval(rec, ctx)?);
                }
                Ok(apply(*fun, &vals))
            }
            Expr::Ref(i) => Ok(ctx.refs.get(*i).cloned().unwrap_or(Value::Nothing)),
            Expr::Agg(i) => Ok(ctx.aggs.get(*i).cloned().unwrap_or(Value::Nothing)),
        }
    }
}

fn eval_field(f: &Field, rec: &[u8], ctx: &mut EvalCtx) -> Value {
    let Some(off) = f.off else {
        return Value::Nothing;
    };
    if off + f.size > rec.len() {
        return Value::Nothing;
    }
    let raw = if f.size == 4 { u64::from(read_u32(rec, off)) } else { read_u64(rec, off) };
    if f.typ == Typ::Text && !f.usekey {
        return ctx.resolve_text(raw);
    }
    Value::from_raw(f.typ, raw)
}

/// Apply an operator, coercing operands along the promotion lattice
/// uint <= int <= float.
#[must_use]
pub fn apply(fun: Fun, vals: &[Value]) -> Value {
    if vals.len() < arity(fun) || vals.iter().any(Value::is_nothing) {
        return Value::Nothing;
    }
    match fun {
        Fun::Add | Fun::Sub | Fun::Mul | Fun::Rem => arith(fun, vals),
        Fun::Div => {
            let (Some(a), Some(b)) = (num(vals, 0), num(vals, 1)) else {
                return Value::Nothing;
            };
            if b == 0.0 {
                return Value::Nothing;
            }
            finite(a / b)
        }
        Fun::Pow => {
            let (Some(a), Some(b)) = (num(vals, 0), num(vals, 1)) else {
                return Value::Nothing;
            };
            finite(a.powf(b))
        }
        Fun::Neg => match &vals[0] {
            Value::Int(i) => Value::Int(-i),
            Value::UInt(u) => Value::Int(-(*u as i64)),
            Value::Float(f) => Value::Float(-f),
            Value::Time(t) => Value::Time(-t),
            _ => Value::Nothing,
        },
        Fun::Abs => match &vals[0] {
            Value::Int(i) => Value::Int(i.abs()),
            Value::Float(f) => Value::Float(f.abs()),
            v @ (Value::UInt(_) | Value::Time(_)) => v.clone(),
            _ => Value::Nothing,
        },
        Fun::Ceil | Fun::Floor | Fun::Round => match &vals[0] {
            Value::Float(f) => Value::Float(match fun {
                Fun::Ceil => f.ceil(),
                Fun::Floor => f.floor(),
                _ => f.round(),
            }),
            v @ (Value::Int(_) | Value::UInt(_)) => v.clone(),
            _ => Value::Nothing,
        },
        Fun::Eq | Fun::Ne | Fun::Lt | Fun::Le | Fun::Gt | Fun::Ge => {
            use std::cmp::Ordering::*;
            let c = vals[0].cmp_with(&vals[1]);
            Value::Bool(match fun {
                Fun::Eq => c == Equal,
                Fun::Ne => c != Equal,
                Fun::Lt => c == Less,
                Fun::Le => c != Greater,
                Fun::Gt => c == Greater,
                _ => c != Less,
            })
        }
        Fun::And | Fun::Or => match (&vals[0], &vals[1]) {
            (Value::Bool(a), Value::Bool(b)) => {
                Value::Bool(if fun == Fun::And { *a && *b } else { *a || *b })
            }
            _ => Value::Nothing,
        },
        Fun::Not => match &vals[0] {
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Nothing,
        },
        Fun::Year | Fun::Month | Fun::Day | Fun::Hour | Fun::Minute | Fun::Second => {
            let Some(t) = vals[0].as_i64() else {
                return Value::Nothing;
            };
            let dt = crate::time::to_datetime(t);
            Value::Int(i64::from(match fun {
                Fun::Year => dt.year(),
                Fun::Month => dt.month() as i32,
                Fun::Day => dt.day() as i32,
                Fun::Hour => dt.hour() as i32,
                Fun::Minute => dt.minute() as i32,
                _ => dt.second() as i32,
            }))
        }
        Fun::Upper | Fun::Lower | Fun::Trim => match &vals[0] {
            Value::Text(s) => Value::Text(match fun {
                Fun::Upper => s.to_uppercase(),
                Fun::Lower => s.to_lowercase(),
                _ => s.trim().to_string(),
            }),
            _ => Value::Nothing,
        },
        Fun::Length => match &vals[0] {
            Value::Text(s) => Value::Int(s.chars().count() as i64),
            _ => Value::Nothing,
        },
        Fun::ToUInt => match vals[0].as_i64() {
            Some(i) if i >= 0 => Value::UInt(i as u64),
            _ => Value::Nothing,
        },
        Fun::ToInt => vals[0].as_i64().map_or(Value::Nothing, Value::Int),
        Fun::ToFloat => vals[0].as_f64().map_or(Value::Nothing, Value::Float),
        Fun::ToTime => vals[0].as_i64().map_or(Value::Nothing, Value::Time),
    }
}

fn arity(fun: Fun) -> usize {
    match fun {
        Fun::Add
        | Fun::Sub
        | Fun::Mul
        | Fun::Div
        | Fun::Rem
        | Fun::Pow
        | Fun::Eq
        | Fun::Ne
        | Fun::Lt
        | Fun::Le
        | Fun::Gt
        | Fun::Ge
        | Fun::And
        | Fun::Or => 2,
        _ => 1,
    }
}

fn num(vals: &[Value], i: usize) -> Option<f64> {
    vals.get(i).and_then(Value::as_f64)
}

fn finite(f: f64) -> Value {
    if f.is_finite() { Value::Float(f) } else { Value::Nothing }
}

/// Integer-preserving arithmetic: floats contaminate, otherwise ints stay
/// ints (uint only when both sides are uint and the op cannot underflow).
fn arith(fun: Fun, vals: &[Value]) -> Value {
    let (a, b) = (&vals[0], &vals[1]);
    let any_float = matches!(a, Value::Float(_)) || matches!(b, Value::Float(_));
    if any_float {
        let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
            return Value::Nothing;
        };
        return finite(match fun {
            Fun::Add => x + y,
            Fun::Sub => x - y,
            Fun::Mul => x * y,
            _ => {
                if y == 0.0 {
                    return Value::Nothing;
                }
                x % y
            }
        });
    }
    let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) else {
        return Value::Nothing;
    };
    let r = match fun {
        Fun::Add => x.checked_add(y),
        Fun::Sub => x.checked_sub(y),
        Fun::Mul => x.checked_mul(y),
        _ => {
            if y == 0 {
                return Value::Nothing;
            }
            x.checked_rem(y)
        }
    };
    match r {
        Some(v) if matches!((a, b), (Value::Time(_), _) | (_, Value::Time(_))) => Value::Time(v),
        Some(v) => Value::Int(v),
        None => Value::Nothing,
    }
}

// ---- aggregates ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// Aggregate function: the wrapped expression plus running state.
#[derive(Debug, Clone)]
pub struct AggFun {
    pub kind: AggKind,
    /// `None` is `count(*)`.
    pub expr: Option<Expr>,
}

/// Running state of one aggregate within one group.
#[derive(Debug, Clone)]
pub struct AggState {
    kind: AggKind,
    count: u64,
    fsum: f64,
    isum: i64,
    all_int: bool,
    minmax: Option<Value>,
}

impl AggState {
    #[must_use]
    pub fn new(kind: AggKind) -> Self {
        Self { kind, count: 0, fsum: 0.0, isum: 0, all_int: true, minmax: None }
    }

    pub fn update(&mut self, v: &Value) {
        if v.is_nothing() {
            return;
        }
        self.count += 1;
        if let Some(f) = v.as_f64() {
            self.fsum += f;
        }
        match v {
            Value::Float(_) => self.all_int = false,
            _ => {
                if let Some(i) = v.as_i64() {
                    self.isum = self.isum.saturating_add(i);
                }
            }
        }
        let replace = match (&self.minmax, self.kind) {
            (None, _) => true,
            (Some(m), AggKind::Min) => v.cmp_with(m) == std::cmp::Ordering::Less,
            (Some(m), AggKind::Max) => v.cmp_with(m) == std::cmp::Ordering::Greater,
            _ => false,
        };
        if replace {
            self.minmax = Some(v.clone());
        }
    }

    /// Count rows regardless of the wrapped value (`count(*)`).
    pub fn bump(&mut self) {
        self.count += 1;
    }

    #[must_use]
    pub fn value(&self) -> Value {
        match self.kind {
            AggKind::Count => Value::UInt(self.count),
            AggKind::Sum => {
                if self.count == 0 {
                    Value::Nothing
                } else if self.all_int {
                    Value::Int(self.isum)
                } else {
                    Value::Float(self.fsum)
                }
            }
            AggKind::Avg => {
                if self.count == 0 {
                    Value::Nothing
                } else {
                    Value::Float(self.fsum / self.count as f64)
                }
            }
            AggKind::Min | AggKind::Max => {
                self.minmax.clone().unwrap_or(Value::Nothing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, OFF_ORIGIN, OFF_WEIGHT};

    fn edge_rec(origin: u64, weight: f64) -> [u8; 64] {
        Edge {
            edge: 1,
            origin,
            destin: 2,
            label: 0,
            timestamp: 0,
            weight: weight.to_bits(),
            weight2: 0,
            wtype: Typ::Float,
            wtype2: Typ::Nothing,
        }
        .to_bytes()
    }

    fn field(off: usize, typ: Typ) -> Expr {
        Expr::Field(Field {
            target: Target::Edge,
            name: "f".into(),
            off: Some(off),
            size: 8,
            typ,
            propid: 0,
            role: 0,
            pk: false,
            usekey: false,
        })
    }

    #[test]
    fn promotion_and_arith() {
        let mut ctx = EvalCtx::new(None);
        let rec = edge_rec(10, 2.5);
        let e = Expr::Op(
            Fun::Mul,
            vec![field(OFF_ORIGIN, Typ::UInt), field(OFF_WEIGHT, Typ::Float)],
        );
        assert_eq!(e.eval(&rec, &mut ctx).unwrap(), Value::Float(25.0));
        let i = Expr::Op(
            Fun::Add,
            vec![Expr::Const(Value::Int(1)), Expr::Const(Value::UInt(2))],
        );
        assert_eq!(i.eval(&rec, &mut ctx).unwrap(), Value::Int(3));
    }

    #[test]
    fn division_by_zero_is_nothing() {
        let mut ctx = EvalCtx::new(None);
        let e = Expr::Op(
            Fun::Div,
            vec![Expr::Const(Value::Int(1)), Expr::Const(Value::Int(0))],
        );
        assert_eq!(e.eval(&[], &mut ctx).unwrap(), Value::Nothing);
    }

    #[test]
    fn nothing_propagates() {
        let mut ctx = EvalCtx::new(None);
        let e = Expr::Op(
            Fun::Add,
            vec![Expr::Const(Value::Nothing), Expr::Const(Value::Int(1))],
        );
        assert_eq!(e.eval(&[], &mut ctx).unwrap(), Value::Nothing);
    }

    #[test]
    fn time_extraction() {
        let mut ctx = EvalCtx::new(None);
        let t = crate::time::from_time_literal("2018-06-15T13:45:10").unwrap();
        let e = Expr::Op(Fun::Year, vec![Expr::Const(Value::Time(t))]);
        assert_eq!(e.eval(&[], &mut ctx).unwrap(), Value::Int(2018));
        let m = Expr::Op(Fun::Month, vec![Expr::Const(Value::Time(t))]);
        assert_eq!(m.eval(&[], &mut ctx).unwrap(), Value::Int(6));
    }

    #[test]
    fn aggregates() {
        let mut sum = AggState::new(AggKind::Sum);
        let mut avg = AggState::new(AggKind::Avg);
        let mut min = AggState::new(AggKind::Min);
        for v in [1.0, 2.0, 3.0] {
            sum.update(&Value::Float(v));
            avg.update(&Value::Float(v));
            min.update(&Value::Float(v));
        }
        assert_eq!(sum.value(), Value::Float(6.0));
        assert_eq!(avg.value(), Value::Float(2.0));
        assert_eq!(min.value(), Value::Float(1.0));
        let mut cnt = AggState::new(AggKind::Count);
        cnt.bump();
        cnt.bump();
        assert_eq!(cnt.value(), Value::UInt(2));
    }

    #[test]
    fn refs_read_sibling_projections() {
        let mut ctx = EvalCtx::new(None);
        ctx.refs = vec![Value::Int(7)];
        let e = Expr::Op(Fun::Add, vec![Expr::Ref(0), Expr::Const(Value::Int(1))]);
        assert_eq!(e.eval(&[], &mut ctx).unwrap(), Value::Int(8));
        assert_eq!(Expr::Ref(9).eval(&[], &mut ctx).unwrap(), Value::Nothing);
    }

    #[test]
    fn int_sum_stays_int() {
        let mut sum = AggState::new(AggKind::Sum);
        sum.update(&Value::Int(2));
        sum.update(&Value::UInt(3));
        assert_eq!(sum.value(), Value::Int(5));
    }
}
