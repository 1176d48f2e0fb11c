use crate::errof;
use crate::errors::Result;
use crate::expr::{AggFun, AggKind, Expr, Field, Fun, Target};
use crate::filter::{CmpOp, Filter};
use crate::index::Index;
use crate::model::{EdgeDef, VertexDef};
use crate::scope::Scope;
use crate::sql::ast::{AstExpr, BinOp, Lit, SelField, SelectStmt};
use crate::store::Store;
use crate::types::{
    Key, OFF_DESTIN, OFF_EDGE, OFF_LABEL, OFF_ORIGIN, OFF_TMSTMP, OFF_WEIGHT, OFF_WEIGHT2,
    Typ, Value,
};
use crate::vrow::VRow;
use std::sync::Arc;

/// What the reader stage of a plan scans.
#[derive(Clone)]
pub enum ReaderSpec {
    /// Full scan over all relevant files.
    Fullscan,
    /// Index point search (plus a buffer over the writer's tail).
    Search { index: Arc<Index>, key: Vec<u8> },
    /// Full index range scan.
    Range { index: Arc<Index>, start: Vec<u8>, end: Vec<u8> },
    /// Keys-only index range scan (distinct keys).
    KeyRange { index: Arc<Index>, start: Option<Vec<u8>>, end: Option<Vec<u8>> },
    /// Count-only index range scan.
    CountRange { index: Arc<Index>, start: Vec<u8>, end: Vec<u8> },
}

/// The query target.
#[derive(Clone)]
pub enum TargetDef {
    Edge(EdgeDef),
    Vertex(VertexDef),
}

/// One projection entry: expression plus output name.
#[derive(Clone)]
pub struct ProjEntry {
    pub expr: Expr,
    pub name: String,
}

/// Translated query: reader choice, residual filter, vertex-row property
/// set, grouping, aggregation and projection.
pub struct Plan {
    /// Summary: number of targets (always 1; joins are out of scope).
    pub targets: u32,
    pub store: Arc<Store>,
    pub target: TargetDef,
    pub reader: ReaderSpec,
    /// Residual predicate not covered by the chosen index; present iff a
    /// Filter plan node remains.
    pub filter: Option<Filter>,
    /// The complete translated where clause; the cursor applies it to
    /// every record (unindexed tail pages have no key to verify).
    pub full_filter: Option<Filter>,
    /// Property ids referenced by a vertex query, in slot order.
    pub vrow: Option<VRow>,
    pub projection: Vec<ProjEntry>,
    pub aggs: Vec<AggFun>,
    /// Indices into `projection` forming the group key.
    pub group_by: Vec<usize>,
    pub order_by: Vec<(usize, crate::types::Ord_)>,
}

/// Build a plan from a select statement: resolve the target, translate
/// the where clause, pick an index from the covered equalities, attach
/// the residual filter and the projection pipeline.
pub fn from_ast(scope: &Scope, ast: &SelectStmt) -> Result<Plan> {
    if ast.from.is_empty() {
        return Err(errof!(Invalid, "plan", "no 'from' in DQL"));
    }
    if scope.model.has_edge(&ast.from) {
        let def = scope.model.edge_by_name(&ast.from)?;
        let store = scope.context_store(&ast.from)?;
        plan_edge(scope, ast, def, store)
    } else if scope.model.has_vertex(&ast.from) {
        let def = scope.model.vertex_by_name(&ast.from)?;
        let store = scope.vertex_store();
        plan_vertex(scope, ast, def, store)
    } else {
        Err(errof!(NotFound, "plan", "target '{}'", ast.from))
    }
}

// ---- edge planning -------------------------------------------------------

fn edge_field(def: &EdgeDef, name: &str) -> Result<Field> {
    let (off, typ) = match name {
        "edge" => (OFF_EDGE, Typ::Text),
        "origin" => (OFF_ORIGIN, Typ::UInt),
        "destin" | "destination" => (OFF_DESTIN, Typ::UInt),
        "label" => (OFF_LABEL, def.label),
        "timestamp" | "stamp" => (OFF_TMSTMP, Typ::Time),
        "weight" => (OFF_WEIGHT, def.weight),
        "weight2" => (OFF_WEIGHT2, def.weight2),
        _ => return Err(errof!(NotFound, "plan", "edge field '{name}'")),
    };
    Ok(Field {
        target: Target::Edge,
        name: name.to_string(),
        off: Some(off),
        size: 8,
        typ,
        propid: 0,
        role: 0,
        pk: false,
        // edge and vertex ids present as keys, not resolved text
        usekey: matches!(name, "edge" | "origin" | "destin" | "destination"),
    })
}

/// Convert a literal into the raw slot form of the field's declared type;
/// typed literals that do not fit are parser errors.
fn lit_to_raw(scope: &Scope, field: &Field, lit: &Lit) -> Result<u64> {
    let v = lit_to_value(scope, field, lit)?;
    Ok(v.to_raw())
}

fn lit_to_value(scope: &Scope, field: &Field, lit: &Lit) -> Result<Value> {
    match (field.typ, lit) {
        (_, Lit::Null) => Ok(Value::Nothing),
        (Typ::UInt, Lit::UInt(u)) => Ok(Value::UInt(*u)),
        (Typ::UInt, Lit::Int(i)) if *i >= 0 => Ok(Value::UInt(*i as u64)),
        (Typ::Int, Lit::Int(i)) => Ok(Value::Int(*i)),
        (Typ::Int, Lit::UInt(u)) => Ok(Value::Int(*u as i64)),
        (Typ::Float, Lit::Float(f)) => Ok(Value::Float(*f)),
        (Typ::Float, Lit::Int(i)) => Ok(Value::Float(*i as f64)),
        (Typ::Float, Lit::UInt(u)) => Ok(Value::Float(*u as f64)),
        (Typ::Bool, Lit::Bool(b)) => Ok(Value::Bool(*b)),
        (Typ::Time | Typ::Date, Lit::Str(s)) => {
            let t = if field.typ == Typ::Date {
                crate::time::from_date_literal(s)?
            } else {
                crate::time::from_time_literal(s)?
            };
            Ok(Value::Time(t))
        }
        (Typ::Time | Typ::Date, Lit::Int(i)) => Ok(Value::Time(*i)),
        (Typ::Time | Typ::Date, Lit::UInt(u)) => Ok(Value::Time(*u as i64)),
        (Typ::Text, Lit::Str(s)) => {
            // interned key; the edge id field resolves through the model
            if field.name == "edge" {
                let def = scope.model.edge_by_name(s)?;
                return Ok(Value::UInt(def.edgeid));
            }
            match scope.text.get_key(s) {
                Ok(k) => Ok(Value::UInt(k)),
                // unknown text never matches anything
                Err(_) => Ok(Value::UInt(u64::MAX)),
            }
        }
        (Typ::UInt, Lit::Str(s)) if field.usekey => {
            // origin/destin given by name resolve through the dictionary
            match scope.text.get_key(s) {
                Ok(k) => Ok(Value::UInt(k)),
                Err(_) => Ok(Value::UInt(u64::MAX)),
            }
        }
        _ => Err(errof!(
            Parser,
            "plan",
            "literal {:?} does not fit field '{}' of type {}",
            lit,
            field.name,
            field.typ.name()
        )),
    }
}

fn cmp_op(op: BinOp) -> Option<CmpOp> {
    match op {
        BinOp::Eq => Some(CmpOp::Eq),
        BinOp::Ne => Some(CmpOp::Ne),
        BinOp::Lt => Some(CmpOp::Lt),
        BinOp::Le => Some(CmpOp::Le),
        BinOp::Gt => Some(CmpOp::Gt),
        BinOp::Ge => Some(CmpOp::Ge),
        _ => None,
    }
}

/// Translate a where clause into a record filter. `resolve` maps a field
/// name to its (offset, size, type) within the scanned record.
fn to_filter(
    scope: &Scope,
    ast: &AstExpr,
    resolve: &impl Fn(&str) -> Result<Field>,
) -> Result<Filter> {
    match ast {
        AstExpr::Lit(Lit::Bool(true)) => Ok(Filter::True),
        AstExpr::Lit(Lit::Bool(false)) => Ok(Filter::False),
        AstExpr::Not(inner) => {
            Ok(Filter::Not(Box::new(to_filter(scope, inner, resolve)?)))
        }
        AstExpr::Binary { op: BinOp::And, left, right } => {
            Ok(Filter::And(
                Box::new(to_filter(scope, left, resolve)?),
                Box::new(to_filter(scope, right, resolve)?),
            ))
        }
        AstExpr::Binary { op: BinOp::Or, left, right } => {
            Ok(Filter::Or(
                Box::new(to_filter(scope, left, resolve)?),
                Box::new(to_filter(scope, right, resolve)?),
            ))
        }
        AstExpr::Binary { op, left, right } => {
            let Some(cop) = cmp_op(*op) else {
                return Err(errof!(Invalid, "plan", "arithmetic in where clause"));
            };
            let (field, lit) = match (left.as_ref(), right.as_ref()) {
                (AstExpr::Field(f), AstExpr::Lit(l)) => (resolve(f)?, l),
                (AstExpr::Lit(l), AstExpr::Field(f)) => (resolve(f)?, l),
                _ => return Err(errof!(NotSupp, "plan", "unsupported where condition")),
            };
            let val = lit_to_raw(scope, &field, lit)?;
            Ok(Filter::Cmp {
                op: cop,
                off: field.off.unwrap_or(0),
                size: field.size,
                typ: if field.usekey { Typ::UInt } else { field.typ },
                val,
            })
        }
        AstExpr::InSet { field, values } => {
            let f = resolve(field)?;
            let mut set = std::collections::BTreeSet::new();
            for lit in values {
                set.insert(lit_to_raw(scope, &f, lit)?);
            }
            Ok(Filter::In {
                off: f.off.unwrap_or(0),
                size: f.size,
                typ: if f.usekey { Typ::UInt } else { f.typ },
                set,
            })
        }
        _ => Err(errof!(NotSupp, "plan", "unsupported where condition")),
    }
}

/// Translate a projection expression.
fn to_expr(
    scope: &Scope,
    ast: &AstExpr,
    resolve: &impl Fn(&str) -> Result<Field>,
    aggs: &mut Vec<AggFun>,
) -> Result<Expr> {
    match ast {
        AstExpr::Field(name) => Ok(Expr::Field(resolve(name)?)),
        AstExpr::Lit(l) => Ok(Expr::Const(match l {
            Lit::UInt(u) => Value::UInt(*u),
            Lit::Int(i) => Value::Int(*i),
            Lit::Float(f) => Value::Float(*f),
            Lit::Str(s) => Value::Text(s.clone()),
            Lit::Bool(b) => Value::Bool(*b),
            Lit::Null => Value::Nothing,
        })),
        AstExpr::Binary { op, left, right } => {
            let fun = match op {
                BinOp::Add => Fun::Add,
                BinOp::Sub => Fun::Sub,
                BinOp::Mul => Fun::Mul,
                BinOp::Div => Fun::Div,
                BinOp::Rem => Fun::Rem,
                BinOp::Eq => Fun::Eq,
                BinOp::Ne => Fun::Ne,
                BinOp::Lt => Fun::Lt,
                BinOp::Le => Fun::Le,
                BinOp::Gt => Fun::Gt,
                BinOp::Ge => Fun::Ge,
                BinOp::And => Fun::And,
                BinOp::Or => Fun::Or,
            };
            Ok(Expr::Op(
                fun,
                vec![
                    to_expr(scope, left, resolve, aggs)?,
                    to_expr(scope, right, resolve, aggs)?,
                ],
            ))
        }
        AstExpr::Not(inner) => {
            Ok(Expr::Op(Fun::Not, vec![to_expr(scope, inner, resolve, aggs)?]))
        }
        AstExpr::Fun { name, args } => {
            let lname = name.to_ascii_lowercase();
            if let Some(kind) = agg_kind(&lname) {
                let inner = match args.first() {
                    None | Some(AstExpr::Star) => None,
                    Some(a) => Some(to_expr(scope, a, resolve, aggs)?),
                };
                if kind != AggKind::Count && inner.is_none() {
                    return Err(errof!(Invalid, "plan", "{lname}(*) is not defined"));
                }
                aggs.push(AggFun { kind, expr: inner });
                return Ok(Expr::Agg(aggs.len() - 1));
            }
            let fun = scalar_fun(&lname)
                .ok_or_else(|| errof!(UnkSymbol, "plan", "function '{name}'"))?;
            let mut xargs = Vec::with_capacity(args.len());
            for a in args {
                xargs.push(to_expr(scope, a, resolve, aggs)?);
            }
            Ok(Expr::Op(fun, xargs))
        }
        AstExpr::InSet { .. } | AstExpr::Star => {
            Err(errof!(NotSupp, "plan", "expression not allowed here"))
        }
    }
}

fn agg_kind(name: &str) -> Option<AggKind> {
    match name {
        "count" => Some(AggKind::Count),
        "sum" => Some(AggKind::Sum),
        "min" => Some(AggKind::Min),
        "max" => Some(AggKind::Max),
        "avg" => Some(AggKind::Avg),
        _ => None,
    }
}

fn scalar_fun(name: &str) -> Option<Fun> {
    match name {
        "abs" => Some(Fun::Abs),
        "ceil" => Some(Fun::Ceil),
        "floor" => Some(Fun::Floor),
        "round" => Some(Fun::Round),
        "year" => Some(Fun::Year),
        "month" => Some(Fun::Month),
        "day" | "mday" => Some(Fun::Day),
        "hour" => Some(Fun::Hour),
        "minute" => Some(Fun::Minute),
        "second" => Some(Fun::Second),
        "upper" => Some(Fun::Upper),
        "lower" => Some(Fun::Lower),
        "trim" => Some(Fun::Trim),
        "length" => Some(Fun::Length),
        "touint" => Some(Fun::ToUInt),
        "toint" => Some(Fun::ToInt),
        "tofloat" => Some(Fun::ToFloat),
        "totime" => Some(Fun::ToTime),
        _ => None,
    }
}

fn expand_star_edge() -> Vec<SelField> {
    ["edge", "origin", "destin", "label", "timestamp", "weight", "weight2"]
        .into_iter()
        .map(|n| SelField::Expr { expr: AstExpr::Field(n.to_string()), alias: None })
        .collect()
}

fn expand_star_vertex(def: &VertexDef) -> Vec<SelField> {
    def.props
        .iter()
        .map(|p| SelField::Expr { expr: AstExpr::Field(p.name.clone()), alias: None })
        .collect()
}

fn field_name(f: &SelField, i: usize) -> String {
    match f {
        SelField::All => format!("col{i}"),
        SelField::Expr { alias: Some(a), .. } => a.clone(),
        SelField::Expr { expr: AstExpr::Field(n), .. } => n.clone(),
        SelField::Expr { expr: AstExpr::Fun { name, .. }, .. } => name.clone(),
        SelField::Expr { .. } => format!("col{i}"),
    }
}

/// Index selection: all equality-covered indexes, smallest key first.
fn pick_index(
    scope: &Scope,
    context: Option<&str>,
    filter: &Filter,
) -> Option<(Arc<Index>, Vec<u8>, Vec<usize>)> {
    let eqs = filter.family3();
    let mut candidates: Vec<(Arc<Index>, Vec<u8>, Vec<usize>)> = Vec::new();
    for idx in scope.iman.for_context(context) {
        let mut key = Vec::with_capacity(idx.keysize());
        let mut covered = Vec::new();
        let mut ok = true;
        for &off in &idx.keys.offs {
            let sz = idx.keys.field_size(off);
            match eqs.iter().find(|(o, s, _)| *o == off as usize && *s == sz) {
                Some((o, _, val)) => {
                    key.extend_from_slice(&val.to_le_bytes()[..sz]);
                    covered.push(*o);
                }
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            candidates.push((idx, key, covered));
        }
    }
    candidates.sort_by_key(|(idx, _, _)| idx.keysize());
    candidates.into_iter().next()
}

/// Prefix-range selection: an index whose leading key fields are pinned
/// by equalities while the rest stays open.
fn pick_range(
    scope: &Scope,
    context: Option<&str>,
    filter: &Filter,
) -> Option<(Arc<Index>, Vec<u8>, Vec<u8>, Vec<usize>)> {
    let mut candidates = Vec::new();
    for idx in scope.iman.for_context(context) {
        if let Some((start, end, complete)) = filter.range(&idx.keys)
            && !complete
        {
            let eqs = filter.family3();
            let covered: Vec<usize> = idx
                .keys
                .offs
                .iter()
                .map(|&o| o as usize)
                .filter(|o| eqs.iter().any(|(eo, _, _)| eo == o))
                .collect();
            candidates.push((idx, start, end, covered));
        }
    }
    candidates.sort_by_key(|(idx, _, _, _)| idx.keysize());
    candidates.into_iter().next()
}

/// Distinct-keys shape: every projection entry is a plain field, the
/// group key covers the whole projection, there are no aggregates and an
/// index's key layout matches the projected offsets exactly.
fn pick_keys_only(
    scope: &Scope,
    context: Option<&str>,
    projection: &[ProjEntry],
    aggs: &[AggFun],
    group_by: &[usize],
    residual: Option<&Filter>,
) -> Option<Arc<Index>> {
    if !aggs.is_empty() || residual.is_some() || projection.is_empty() {
        return None;
    }
    if group_by.len() != projection.len() {
        return None;
    }
    let mut offs = Vec::with_capacity(projection.len());
    for p in projection {
        let Expr::Field(f) = &p.expr else {
            return None;
        };
        offs.push(f.off? as u16);
    }
    scope
        .iman
        .for_context(context)
        .into_iter()
        .find(|idx| idx.keys.offs == offs)
}

fn build_projection(
    scope: &Scope,
    fields: &[SelField],
    resolve: &impl Fn(&str) -> Result<Field>,
) -> Result<(Vec<ProjEntry>, Vec<AggFun>)> {
    let mut aggs = Vec::new();
    let mut projection = Vec::with_capacity(fields.len());
    for (i, f) in fields.iter().enumerate() {
        let SelField::Expr { expr, .. } = f else {
            return Err(errof!(Invalid, "plan", "unexpanded star"));
        };
        let e = to_expr(scope, expr, resolve, &mut aggs)?;
        projection.push(ProjEntry { expr: e, name: field_name(f, i) });
    }
    Ok((projection, aggs))
}

fn group_indices(
    ast: &SelectStmt,
    projection: &[ProjEntry],
) -> Result<Vec<usize>> {
    let mut out = Vec::with_capacity(ast.group_by.len());
    for g in &ast.group_by {
        let pos = projection
            .iter()
            .position(|p| &p.name == g)
            .ok_or_else(|| errof!(Invalid, "plan", "group by '{g}' not in projection"))?;
        out.push(pos);
    }
    Ok(out)
}

fn order_indices(
    ast: &SelectStmt,
    projection: &[ProjEntry],
) -> Result<Vec<(usize, crate::types::Ord_)>> {
    let mut out = Vec::with_capacity(ast.order_by.len());
    for (o, dir) in &ast.order_by {
        let pos = projection
            .iter()
            .position(|p| &p.name == o)
            .ok_or_else(|| errof!(Invalid, "plan", "order by '{o}' not in projection"))?;
        out.push((pos, *dir));
    }
    Ok(out)
}

fn plan_edge(
    scope: &Scope,
    ast: &SelectStmt,
    def: EdgeDef,
    store: Arc<Store>,
) -> Result<Plan> {
    let fields = if ast.fields.iter().any(|f| matches!(f, SelField::All)) {
        expand_star_edge()
    } else {
        ast.fields.clone()
    };
    let resolve = |name: &str| edge_field(&def, name);
    let filter = match &ast.where_ {
        Some(w) => Some(to_filter(scope, w, &resolve)?),
        None => None,
    };
    let (projection, aggs) = build_projection(scope, &fields, &resolve)?;
    let group_by = group_indices(ast, &projection)?;
    let order_by = order_indices(ast, &projection)?;

    let ctx = Some(store.cfg.name.as_str());
    let (mut reader, residual) = match &filter {
        Some(f) => match pick_index(scope, ctx, f) {
            Some((index, key, covered)) => {
                let residual = f.strip_eq(&covered);
                // bitmap counts are exact only up to 128 slots per page
                let count_only = residual.is_none()
                    && group_by.is_empty()
                    && projection.len() == 1
                    && aggs.len() == 1
                    && aggs[0].kind == AggKind::Count
                    && store.cfg.blocksize / store.cfg.recsize <= 128;
                let spec = if count_only {
                    ReaderSpec::CountRange {
                        index,
                        start: key.clone(),
                        end: key,
                    }
                } else {
                    ReaderSpec::Search { index, key }
                };
                (spec, residual)
            }
            None => match pick_range(scope, ctx, f) {
                Some((index, start, end, covered)) => {
                    (ReaderSpec::Range { index, start, end }, f.strip_eq(&covered))
                }
                None => (ReaderSpec::Fullscan, Some(f.clone())),
            },
        },
        None => (ReaderSpec::Fullscan, None),
    };
    if matches!(reader, ReaderSpec::Fullscan)
        && let Some(index) =
            pick_keys_only(scope, ctx, &projection, &aggs, &group_by, residual.as_ref())
    {
        reader = ReaderSpec::KeyRange { index, start: None, end: None };
    }

    Ok(Plan {
        targets: 1,
        store,
        target: TargetDef::Edge(def),
        reader,
        filter: residual,
        full_filter: filter,
        vrow: None,
        projection,
        aggs,
        group_by,
        order_by,
    })
}

// ---- vertex planning -----------------------------------------------------

fn plan_vertex(
    scope: &Scope,
    ast: &SelectStmt,
    def: VertexDef,
    store: Arc<Store>,
) -> Result<Plan> {
    let fields = if ast.fields.iter().any(|f| matches!(f, SelField::All)) {
        expand_star_vertex(&def)
    } else {
        ast.fields.clone()
    };
    // collect referenced properties first: the vrow assigns row offsets
    let mut names: Vec<String> = Vec::new();
    for f in &fields {
        if let SelField::Expr { expr, .. } = f {
            collect_names(expr, &mut names);
        }
    }
    if let Some(w) = &ast.where_ {
        collect_names(w, &mut names);
    }
    let mut referenced: Vec<Key> = Vec::new();
    for n in &names {
        let p = def
            .prop(n)
            .ok_or_else(|| errof!(NotFound, "plan", "property '{n}'"))?;
        if !referenced.contains(&p.propid) {
            referenced.push(p.propid);
        }
    }
    let vrow = VRow::new(&def, &referenced);

    let resolve = |name: &str| -> Result<Field> {
        let p = def
            .prop(name)
            .ok_or_else(|| errof!(NotFound, "plan", "property '{name}'"))?;
        let off = if p.pk { Some(0) } else { vrow.slot_off(p.propid) };
        Ok(Field {
            target: Target::Vertex,
            name: name.to_string(),
            off,
            size: 8,
            typ: if p.pk && p.typ == Typ::Text { Typ::UInt } else { p.typ },
            propid: p.propid,
            role: def.roleid,
            pk: p.pk,
            usekey: p.pk && p.typ == Typ::Text,
        })
    };

    let filter = match &ast.where_ {
        Some(w) => Some(to_filter(scope, w, &resolve)?),
        None => None,
    };
    let (projection, aggs) = build_projection(scope, &fields, &resolve)?;
    let group_by = group_indices(ast, &projection)?;
    let order_by = order_indices(ast, &projection)?;

    Ok(Plan {
        targets: 1,
        store,
        target: TargetDef::Vertex(def),
        reader: ReaderSpec::Fullscan,
        filter: filter.clone(),
        full_filter: filter,
        vrow: Some(vrow),
        projection,
        aggs,
        group_by,
        order_by,
    })
}

fn collect_names(ast: &AstExpr, out: &mut Vec<String>) {
    match ast {
        AstExpr::Field(n) => {
            if !out.contains(n) {
                out.push(n.clone());
            }
        }
        AstExpr::Binary { left, right, .. } => {
            collect_names(left, out);
            collect_names(right, out);
        }
        AstExpr::Not(inner) => collect_names(inner, out),
        AstExpr::Fun { args, .. } => {
            for a in args {
                collect_names(a, out);
            }
        }
        AstExpr::InSet { field, .. } => {
            if !out.contains(field) {
                out.push(field.clone());
            }
        }
        _ => {}
    }
}

impl Plan {
    /// Human-readable reader choice, for `explain`-style output and tests.
    #[must_use]
    pub fn reader_kind(&self) -> &'static str {
        match self.reader {
            ReaderSpec::Fullscan => "fullscan",
            ReaderSpec::Search { .. } => "search",
            ReaderSpec::Range { .. } => "frange",
            ReaderSpec::KeyRange { .. } => "krange",
            ReaderSpec::CountRange { .. } => "crange",
        }
    }

    #[must_use]
    pub fn has_aggs(&self) -> bool {
        !self.aggs.is_empty()
    }
}
