use crate::errof;
use crate::errors::Result;
use crate::index::Sizing;
use crate::model::VidPolicy;
use crate::sql::ast::{AstExpr, BinOp, Lit, SelField, SelectStmt, Stmt};
use crate::sql::lex::{Token, tokenize};
use crate::types::{Ord_, Typ};

/// Parse one statement of the SQL surface.
pub fn parse_stmt(input: &str) -> Result<Stmt> {
    let tokens = tokenize(input)?;
    let mut p = Parser { tokens, pos: 0 };
    let stmt = p.statement()?;
    p.eat(&Token::Semicolon);
    p.expect(&Token::Eof)?;
    Ok(stmt)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn cur(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.cur().clone();
        self.pos += 1;
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.cur() == t {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Token) -> Result<()> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(errof!(Parser, "parse", "expected {t:?}, found {:?}", self.cur()))
        }
    }

    /// The current token as a lowercase keyword, if it is an identifier.
    fn kw(&self) -> Option<String> {
        match self.cur() {
            Token::Ident(s) => Some(s.to_ascii_lowercase()),
            _ => None,
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.kw().as_deref() == Some(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(errof!(Parser, "parse", "expected '{kw}', found {:?}", self.cur()))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.advance() {
            Token::Ident(s) => Ok(s),
            other => Err(errof!(Parser, "parse", "expected identifier, found {other:?}")),
        }
    }

    fn typ(&mut self) -> Result<Typ> {
        let name = self.ident()?.to_ascii_lowercase();
        match name.as_str() {
            "uint" => Ok(Typ::UInt),
            "int" | "integer" => Ok(Typ::Int),
            "float" => Ok(Typ::Float),
            "bool" | "boolean" => Ok(Typ::Bool),
            "text" => Ok(Typ::Text),
            "time" => Ok(Typ::Time),
            "date" => Ok(Typ::Date),
            _ => Err(errof!(Parser, "parse", "unknown type '{name}'")),
        }
    }

    fn lit(&mut self) -> Result<Lit> {
        match self.advance() {
            Token::UInt(u) => Ok(Lit::UInt(u)),
            Token::Int(i) => Ok(Lit::Int(i)),
            Token::Float(f) => Ok(Lit::Float(f)),
            Token::Str(s) => Ok(Lit::Str(s)),
            Token::Ident(s) if s.eq_ignore_ascii_case("true") => Ok(Lit::Bool(true)),
            Token::Ident(s) if s.eq_ignore_ascii_case("false") => Ok(Lit::Bool(false)),
            Token::Ident(s) if s.eq_ignore_ascii_case("null") => Ok(Lit::Null),
            other => Err(errof!(Parser, "parse", "expected literal, found {other:?}")),
        }
    }

    // ---- statements ------------------------------------------------------

    fn statement(&mut self) -> Result<Stmt> {
        let Some(kw) = self.kw() else {
            return Err(errof!(Parser, "parse", "empty statement"));
        };
        match kw.as_str() {
            "create" => {
                self.pos += 1;
                self.create()
            }
            "drop" => {
                self.pos += 1;
                self.drop_()
            }
            "use" => {
                self.pos += 1;
                Ok(Stmt::UseScope { name: self.ident()? })
            }
            "insert" => {
                self.pos += 1;
                self.insert()
            }
            "load" => {
                self.pos += 1;
                self.load()
            }
            "select" => {
                self.pos += 1;
                self.select()
            }
            "lock" => {
                self.pos += 1;
                self.lock()
            }
            "unlock" => {
                self.pos += 1;
                Ok(Stmt::Unlock { name: self.ident()? })
            }
            "fetch" => {
                self.pos += 1;
                Ok(Stmt::Fetch { cursor: self.uint()? })
            }
            "close" => {
                self.pos += 1;
                Ok(Stmt::CloseCursor { cursor: self.uint()? })
            }
            "exec" => {
                self.pos += 1;
                self.exec()
            }
            other => Err(errof!(Parser, "parse", "unknown statement '{other}'")),
        }
    }

    fn uint(&mut self) -> Result<u64> {
        match self.advance() {
            Token::UInt(u) => Ok(u),
            other => Err(errof!(Parser, "parse", "expected number, found {other:?}")),
        }
    }

    fn create(&mut self) -> Result<Stmt> {
        let kind = self.ident()?.to_ascii_lowercase();
        match kind.as_str() {
            "database" | "scope" => Ok(Stmt::CreateScope { name: self.ident()? }),
            "type" => self.create_type(),
            "edge" => self.create_edge(),
            "context" => Ok(Stmt::CreateContext { name: self.ident()? }),
            "index" => self.create_index(),
            "procedure" => self.create_proc(),
            other => Err(errof!(Parser, "parse", "cannot create '{other}'")),
        }
    }

    fn drop_(&mut self) -> Result<Stmt> {
        let kind = self.ident()?.to_ascii_lowercase();
        let name = self.ident()?;
        match kind.as_str() {
            "database" | "scope" => Ok(Stmt::DropScope { name }),
            "type" => Ok(Stmt::DropType { name }),
            "edge" => Ok(Stmt::DropEdge { name }),
            "context" => Ok(Stmt::DropContext { name }),
            "index" => Ok(Stmt::DropIndex { name }),
            "procedure" => Ok(Stmt::DropProc { name }),
            other => Err(errof!(Parser, "parse", "cannot drop '{other}'")),
        }
    }

    fn create_type(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        self.expect(&Token::LParen)?;
        let mut props = Vec::new();
        loop {
            let pname = self.ident()?;
            let typ = self.typ()?;
            let mut pk = false;
            if self.eat_kw("primary") {
                self.expect_kw("key")?;
                pk = true;
            }
            props.push((pname, typ, pk));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        // vid policy follows the primary key: text keys go through the
        // dictionary, numeric keys are the id, no key means generated ids
        let vid = match props.iter().find(|(_, _, pk)| *pk) {
            Some((_, Typ::Text, _)) => VidPolicy::Text,
            Some(_) => VidPolicy::Num,
            None => VidPolicy::Auto,
        };
        Ok(Stmt::CreateType { name, vid, props })
    }

    fn create_edge(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        self.expect(&Token::LParen)?;
        let mut origin = None;
        let mut destin = None;
        let mut label = None;
        let mut weight = None;
        let mut weight2 = None;
        let mut stamped = true;
        loop {
            let part = self.ident()?.to_ascii_lowercase();
            match part.as_str() {
                "origin" => origin = Some(self.ident()?),
                "destin" | "destination" => destin = Some(self.ident()?),
                "label" => label = Some(self.typ()?),
                "weight" => weight = Some(self.typ()?),
                "weight2" => weight2 = Some(self.typ()?),
                "stamp" | "stamped" => stamped = true,
                "nostamp" => stamped = false,
                other => {
                    return Err(errof!(Parser, "parse", "unknown edge part '{other}'"));
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        let origin = origin.ok_or_else(|| errof!(Parser, "parse", "edge without origin"))?;
        let destin = destin.ok_or_else(|| errof!(Parser, "parse", "edge without destination"))?;
        Ok(Stmt::CreateEdge { name, origin, destin, label, weight, weight2, stamped })
    }

    fn create_index(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        self.expect_kw("on")?;
        let on = self.ident()?;
        self.expect(&Token::LParen)?;
        let mut fields = Vec::new();
        loop {
            fields.push(self.ident()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        let mut sizing = Sizing::Medium;
        if self.eat_kw("sizing") {
            let s = self.ident()?.to_ascii_lowercase();
            sizing = match s.as_str() {
                "tiny" => Sizing::Tiny,
                "small" => Sizing::Small,
                "medium" => Sizing::Medium,
                "large" => Sizing::Large,
                "huge" => Sizing::Huge,
                other => return Err(errof!(Parser, "parse", "unknown sizing '{other}'")),
            };
        }
        Ok(Stmt::CreateIndex { name, on, fields, sizing })
    }

    fn create_proc(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        self.expect_kw("language")?;
        let lang = self.ident()?.to_ascii_lowercase();
        let path = if self.eat_kw("as") {
            match self.advance() {
                Token::Str(s) => Some(s),
                other => {
                    return Err(errof!(Parser, "parse", "expected path string, found {other:?}"));
                }
            }
        } else {
            None
        };
        Ok(Stmt::CreateProc { name, lang, path })
    }

    fn insert(&mut self) -> Result<Stmt> {
        self.expect_kw("into")?;
        let target = self.ident()?;
        let fields = if self.eat(&Token::LParen) {
            let mut fs = Vec::new();
            loop {
                fs.push(self.ident()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            Some(fs)
        } else {
            None
        };
        self.expect_kw("values")?;
        self.expect(&Token::LParen)?;
        let mut values = Vec::new();
        loop {
            values.push(self.lit()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(Stmt::Insert { target, fields, values })
    }

    fn load(&mut self) -> Result<Stmt> {
        let path = match self.advance() {
            Token::Str(s) => s,
            other => return Err(errof!(Parser, "parse", "expected path, found {other:?}")),
        };
        self.expect_kw("into")?;
        let target = self.ident()?;
        let mut use_header = false;
        if self.eat_kw("use") {
            self.expect_kw("header")?;
            use_header = true;
        }
        Ok(Stmt::Load { path, target, use_header })
    }

    fn lock(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        let mut write = false;
        if self.eat_kw("for") {
            let mode = self.ident()?.to_ascii_lowercase();
            write = match mode.as_str() {
                "write" => true,
                "read" => false,
                other => return Err(errof!(Parser, "parse", "unknown lock mode '{other}'")),
            };
        }
        let timeout_ms = if self.eat_kw("timeout") { Some(self.uint()?) } else { None };
        Ok(Stmt::Lock { name, write, timeout_ms })
    }

    fn exec(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        let mut args = Vec::new();
        if self.eat(&Token::LParen) {
            if !self.eat(&Token::RParen) {
                loop {
                    args.push(self.lit()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RParen)?;
            }
        }
        Ok(Stmt::Exec { name, args })
    }

    // ---- select ----------------------------------------------------------

    fn select(&mut self) -> Result<Stmt> {
        let mut fields = Vec::new();
        loop {
            if self.eat(&Token::Star) {
                fields.push(SelField::All);
            } else {
                let expr = self.expr()?;
                let alias = if self.eat_kw("as") { Some(self.ident()?) } else { None };
                fields.push(SelField::Expr { expr, alias });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_kw("from")?;
        let from = self.ident()?;
        let where_ = if self.eat_kw("where") { Some(self.expr()?) } else { None };
        let mut group_by = Vec::new();
        if self.eat_kw("group") {
            self.expect_kw("by")?;
            loop {
                group_by.push(self.ident()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let mut order_by = Vec::new();
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            loop {
                let name = self.ident()?;
                let dir = if self.eat_kw("desc") {
                    Ord_::Desc
                } else {
                    self.eat_kw("asc");
                    Ord_::Asc
                };
                order_by.push((name, dir));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        Ok(Stmt::Select(SelectStmt { fields, from, where_, group_by, order_by }))
    }

    // ---- expressions (precedence climbing) -------------------------------

    fn expr(&mut self) -> Result<AstExpr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<AstExpr> {
        let mut left = self.and_expr()?;
        while self.eat_kw("or") {
            let right = self.and_expr()?;
            left = AstExpr::Binary { op: BinOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<AstExpr> {
        let mut left = self.not_expr()?;
        while self.eat_kw("and") {
            let right = self.not_expr()?;
            left =
                AstExpr::Binary { op: BinOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<AstExpr> {
        if self.eat_kw("not") {
            return Ok(AstExpr::Not(Box::new(self.not_expr()?)));
        }
        self.cmp_expr()
    }

    fn cmp_expr(&mut self) -> Result<AstExpr> {
        let left = self.add_expr()?;
        // `in` binds a field to a literal set
        if self.kw().as_deref() == Some("in") {
            let AstExpr::Field(field) = left else {
                return Err(errof!(Parser, "parse", "'in' needs a field on the left"));
            };
            self.pos += 1;
            self.expect(&Token::LParen)?;
            let mut values = Vec::new();
            loop {
                values.push(self.lit()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            return Ok(AstExpr::InSet { field, values });
        }
        let op = match self.cur() {
            Token::Eq => BinOp::Eq,
            Token::Ne => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.add_expr()?;
        Ok(AstExpr::Binary { op, left: Box::new(left), right: Box::new(right) })
    }

    fn add_expr(&mut self) -> Result<AstExpr> {
        let mut left = self.mul_expr()?;
        loop {
            let op = match self.cur() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.mul_expr()?;
            left = AstExpr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn mul_expr(&mut self) -> Result<AstExpr> {
        let mut left = self.primary()?;
        loop {
            let op = match self.cur() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.primary()?;
            left = AstExpr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn primary(&mut self) -> Result<AstExpr> {
        match self.advance() {
            Token::UInt(u) => Ok(AstExpr::Lit(Lit::UInt(u))),
            Token::Int(i) => Ok(AstExpr::Lit(Lit::Int(i))),
            Token::Float(f) => Ok(AstExpr::Lit(Lit::Float(f))),
            Token::Str(s) => Ok(AstExpr::Lit(Lit::Str(s))),
            Token::LParen => {
                let e = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Token::Star => Ok(AstExpr::Star),
            Token::Ident(name) => {
                if name.eq_ignore_ascii_case("true") {
                    return Ok(AstExpr::Lit(Lit::Bool(true)));
                }
                if name.eq_ignore_ascii_case("false") {
                    return Ok(AstExpr::Lit(Lit::Bool(false)));
                }
                if name.eq_ignore_ascii_case("null") {
                    return Ok(AstExpr::Lit(Lit::Null));
                }
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(&Token::RParen)?;
                    }
                    return Ok(AstExpr::Fun { name, args });
                }
                Ok(AstExpr::Field(name))
            }
            other => Err(errof!(Parser, "parse", "unexpected token {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ddl() {
        let s = parse_stmt(
            "create type product (prod_key uint primary key, prod_desc text)",
        )
        .unwrap();
        let Stmt::CreateType { name, vid, props } = s else { panic!("not a type") };
        assert_eq!(name, "product");
        assert_eq!(vid, VidPolicy::Num);
        assert_eq!(props.len(), 2);
        assert!(props[0].2);
    }

    #[test]
    fn parses_create_edge() {
        let s = parse_stmt(
            "create edge buys (origin client, destination product, weight float, weight2 float)",
        )
        .unwrap();
        let Stmt::CreateEdge { name, origin, destin, weight, stamped, .. } = s else {
            panic!("not an edge")
        };
        assert_eq!(name, "buys");
        assert_eq!(origin, "client");
        assert_eq!(destin, "product");
        assert_eq!(weight, Some(Typ::Float));
        assert!(stamped);
    }

    #[test]
    fn parses_select_with_aggregates() {
        let s = parse_stmt(
            "select count(*), sum(weight) from buys where edge='buys' and origin=42",
        )
        .unwrap();
        let Stmt::Select(sel) = s else { panic!("not a select") };
        assert_eq!(sel.fields.len(), 2);
        assert_eq!(sel.from, "buys");
        assert!(sel.where_.is_some());
    }

    #[test]
    fn parses_group_and_order() {
        let s = parse_stmt(
            "select origin, sum(weight) as total from buys group by origin order by origin desc",
        )
        .unwrap();
        let Stmt::Select(sel) = s else { panic!("not a select") };
        assert_eq!(sel.group_by, vec!["origin".to_string()]);
        assert_eq!(sel.order_by, vec![("origin".to_string(), Ord_::Desc)]);
    }

    #[test]
    fn parses_in_and_load_and_lock() {
        let s = parse_stmt("select * from buys where origin in (1, 2, 3)").unwrap();
        let Stmt::Select(sel) = s else { panic!("not a select") };
        assert!(matches!(sel.where_, Some(AstExpr::InSet { .. })));

        let s = parse_stmt("load 'p.csv' into product use header").unwrap();
        assert_eq!(
            s,
            Stmt::Load { path: "p.csv".into(), target: "product".into(), use_header: true }
        );

        let s = parse_stmt("lock l for write timeout 1000").unwrap();
        assert_eq!(s, Stmt::Lock { name: "l".into(), write: true, timeout_ms: Some(1000) });
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_stmt("select from").is_err());
        assert!(parse_stmt("frobnicate x").is_err());
        assert!(parse_stmt("create table t (a uint)").is_err());
    }
}
