pub mod ast;
pub mod lex;
pub mod parse;

pub use ast::{AstExpr, BinOp, Lit, SelField, SelectStmt, Stmt};
pub use parse::parse_stmt;
