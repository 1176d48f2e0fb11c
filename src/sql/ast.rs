use crate::index::Sizing;
use crate::model::VidPolicy;
use crate::types::{Ord_, Typ};

/// Literal values as they appear in statements.
#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Expression node as produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum AstExpr {
    Field(String),
    Lit(Lit),
    Fun { name: String, args: Vec<AstExpr> },
    Binary { op: BinOp, left: Box<AstExpr>, right: Box<AstExpr> },
    Not(Box<AstExpr>),
    InSet { field: String, values: Vec<Lit> },
    /// `count(*)` and friends.
    Star,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelField {
    All,
    Expr { expr: AstExpr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub fields: Vec<SelField>,
    pub from: String,
    pub where_: Option<AstExpr>,
    pub group_by: Vec<String>,
    pub order_by: Vec<(String, Ord_)>,
}

/// One parsed statement: the interface between the parser and the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    CreateScope { name: String },
    DropScope { name: String },
    UseScope { name: String },
    CreateType {
        name: String,
        vid: VidPolicy,
        props: Vec<(String, Typ, bool)>,
    },
    DropType { name: String },
    CreateEdge {
        name: String,
        origin: String,
        destin: String,
        label: Option<Typ>,
        weight: Option<Typ>,
        weight2: Option<Typ>,
        stamped: bool,
    },
    DropEdge { name: String },
    CreateContext { name: String },
    DropContext { name: String },
    CreateIndex {
        name: String,
        on: String,
        fields: Vec<String>,
        sizing: Sizing,
    },
    DropIndex { name: String },
    CreateProc { name: String, lang: String, path: Option<String> },
    DropProc { name: String },
    Insert {
        target: String,
        fields: Option<Vec<String>>,
        values: Vec<Lit>,
    },
    Load { path: String, target: String, use_header: bool },
    Select(SelectStmt),
    Lock { name: String, write: bool, timeout_ms: Option<u64> },
    Unlock { name: String },
    Fetch { cursor: u64 },
    CloseCursor { cursor: u64 },
    Exec { name: String, args: Vec<Lit> },
}
