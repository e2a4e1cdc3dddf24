//! Recursive-descent parser
//!
//! Expression precedence, loosest first: `OR`, `XOR`, `AND`, `NOT`,
//! comparison and string predicates, `+ -`, `* / %`, `^`, unary minus,
//! postfix (`.key`, `[i]`, `:Label`), atoms.

use super::ast::*;
use super::lexer::{tokenize, Keyword, LexError, Token, TokenKind};
use crate::graph::{Direction, Label, PropertyPath, PropertyValue, RelType};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Lexical error: {0}")]
    Lexical(#[from] LexError),

    #[error("Expected {expected}, found {found} at offset {offset}")]
    Unexpected {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("{message} at offset {offset}")]
    Invalid { message: String, offset: usize },

    #[error("Empty query")]
    Empty,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse one statement, optionally terminated by `;`
pub fn parse(src: &str) -> ParseResult<Statement> {
    let tokens = tokenize(src)?;
    if matches!(tokens.first().map(|t| &t.kind), Some(TokenKind::Eof) | None) {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser { src, tokens, pos: 0 };
    let statement = parser.statement()?;
    parser.eat(&TokenKind::Semicolon);
    parser.expect_eof()?;
    Ok(statement)
}

/// Parse a standalone expression
pub fn parse_expression(src: &str) -> ParseResult<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { src, tokens, pos: 0 };
    let expr = parser.expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    // ---- token plumbing ----

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn at_kw(&self, kw: Keyword) -> bool {
        self.at_kw_n(0, kw)
    }

    fn at_kw_n(&self, n: usize, kw: Keyword) -> bool {
        matches!(self.peek_at(n), TokenKind::Keyword(k, _) if *k == kw)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected<T>(&self, expected: impl Into<String>) -> ParseResult<T> {
        Err(ParseError::Unexpected {
            expected: expected.into(),
            found: self.peek().to_string(),
            offset: self.offset(),
        })
    }

    fn invalid<T>(&self, message: impl Into<String>, offset: usize) -> ParseResult<T> {
        Err(ParseError::Invalid {
            message: message.into(),
            offset,
        })
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            self.unexpected(kind.to_string())
        }
    }

    fn expect_kw(&mut self, kw: Keyword) -> ParseResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.unexpected(kw.to_string())
        }
    }

    fn expect_eof(&self) -> ParseResult<()> {
        if self.at(&TokenKind::Eof) {
            Ok(())
        } else {
            self.unexpected("end of input")
        }
    }

    /// A variable name: plain or back-quoted identifier
    fn variable(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => self.unexpected("variable name"),
        }
    }

    /// A label, type, property key or map key; keywords are allowed here
    fn symbolic_name(&mut self, what: &str) -> ParseResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) | TokenKind::Keyword(_, name) => {
                self.advance();
                Ok(name)
            }
            _ => self.unexpected(what),
        }
    }

    fn text_from(&self, start: usize) -> String {
        let end = self.tokens[self.pos.saturating_sub(1)].end;
        self.src.get(start..end).unwrap_or_default().trim().to_string()
    }

    // ---- statements ----

    fn statement(&mut self) -> ParseResult<Statement> {
        let explain = self.eat_kw(Keyword::Explain);
        let kind = if self.at_kw(Keyword::Create) && self.at_kw_n(1, Keyword::Index) {
            self.pos += 2;
            let (label, properties) = self.index_target()?;
            StatementKind::CreateIndex { label, properties }
        } else if self.at_kw(Keyword::Drop) && self.at_kw_n(1, Keyword::Index) {
            self.pos += 2;
            let (label, properties) = self.index_target()?;
            StatementKind::DropIndex { label, properties }
        } else {
            StatementKind::Query(self.query()?)
        };
        Ok(Statement { explain, kind })
    }

    /// `ON :Label(p1, p2.sub, ...)`
    fn index_target(&mut self) -> ParseResult<(Label, Vec<PropertyPath>)> {
        self.expect_kw(Keyword::On)?;
        self.expect(TokenKind::Colon)?;
        let label = Label::new(self.symbolic_name("label")?);
        self.expect(TokenKind::LParen)?;
        let mut properties = Vec::new();
        // `:Label()` is the label index
        while !self.at(&TokenKind::RParen) {
            let mut segments = vec![self.symbolic_name("property name")?];
            while self.eat(&TokenKind::Dot) {
                segments.push(self.symbolic_name("property name")?);
            }
            properties.push(PropertyPath::parse(&segments.join(".")));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok((label, properties))
    }

    fn query(&mut self) -> ParseResult<Query> {
        let first = self.single_query()?;
        let mut unions = Vec::new();
        while self.eat_kw(Keyword::Union) {
            let all = self.eat_kw(Keyword::All);
            unions.push((all, self.single_query()?));
        }
        Ok(Query { first, unions })
    }

    fn single_query(&mut self) -> ParseResult<SingleQuery> {
        let start = self.offset();
        let clauses = self.clauses()?;
        if clauses.is_empty() {
            return self.unexpected("a clause");
        }
        for (i, clause) in clauses.iter().enumerate() {
            let last = i + 1 == clauses.len();
            if matches!(clause, Clause::Return(_)) && !last {
                return self.invalid("RETURN must be the final clause", start);
            }
            if last && !matches!(clause, Clause::Return(_)) && !clause.is_write() {
                return self.invalid(format!("Query cannot conclude with {}", clause.name()), start);
            }
        }
        Ok(SingleQuery { clauses })
    }

    fn clauses(&mut self) -> ParseResult<Vec<Clause>> {
        let mut clauses = Vec::new();
        while let Some(clause) = self.clause()? {
            clauses.push(clause);
        }
        Ok(clauses)
    }

    fn clause(&mut self) -> ParseResult<Option<Clause>> {
        let TokenKind::Keyword(kw, _) = self.peek().clone() else {
            return Ok(None);
        };
        let clause = match kw {
            Keyword::Match => {
                self.advance();
                self.match_clause(false)?
            }
            Keyword::Optional => {
                self.advance();
                self.expect_kw(Keyword::Match)?;
                self.match_clause(true)?
            }
            Keyword::Unwind => {
                self.advance();
                let expr = self.expr()?;
                self.expect_kw(Keyword::As)?;
                let variable = self.variable()?;
                Clause::Unwind { expr, variable }
            }
            Keyword::With => {
                self.advance();
                let mut projection = self.projection()?;
                if self.eat_kw(Keyword::Where) {
                    projection.predicate = Some(self.expr()?);
                }
                Clause::With(projection)
            }
            Keyword::Return => {
                self.advance();
                Clause::Return(self.projection()?)
            }
            Keyword::Create => {
                self.advance();
                Clause::Create {
                    patterns: self.patterns()?,
                }
            }
            Keyword::Merge => {
                self.advance();
                self.merge_clause()?
            }
            Keyword::Set => {
                self.advance();
                Clause::Set(self.set_items()?)
            }
            Keyword::Remove => {
                self.advance();
                Clause::Remove(self.remove_items()?)
            }
            Keyword::Delete => {
                self.advance();
                Clause::Delete {
                    detach: false,
                    exprs: self.expr_list()?,
                }
            }
            Keyword::Detach => {
                self.advance();
                self.expect_kw(Keyword::Delete)?;
                Clause::Delete {
                    detach: true,
                    exprs: self.expr_list()?,
                }
            }
            Keyword::Foreach => {
                self.advance();
                self.foreach_clause()?
            }
            Keyword::Call => {
                self.advance();
                self.call_clause()?
            }
            _ => return Ok(None),
        };
        Ok(Some(clause))
    }

    fn match_clause(&mut self, optional: bool) -> ParseResult<Clause> {
        let patterns = self.patterns()?;
        let predicate = if self.eat_kw(Keyword::Where) {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Clause::Match {
            optional,
            patterns,
            predicate,
        })
    }

    fn merge_clause(&mut self) -> ParseResult<Clause> {
        let pattern = self.path_pattern()?;
        let mut on_create = Vec::new();
        let mut on_match = Vec::new();
        while self.at_kw(Keyword::On) {
            self.advance();
            let target = if self.eat_kw(Keyword::Create) {
                &mut on_create
            } else if self.eat_kw(Keyword::Match) {
                &mut on_match
            } else {
                return self.unexpected("CREATE or MATCH");
            };
            self.expect_kw(Keyword::Set)?;
            let items = self.set_items()?;
            target.extend(items);
        }
        Ok(Clause::Merge {
            pattern,
            on_create,
            on_match,
        })
    }

    fn foreach_clause(&mut self) -> ParseResult<Clause> {
        self.expect(TokenKind::LParen)?;
        let variable = self.variable()?;
        self.expect_kw(Keyword::In)?;
        let list = self.expr()?;
        self.expect(TokenKind::Pipe)?;
        let start = self.offset();
        let clauses = self.clauses()?;
        if clauses.is_empty() {
            return self.unexpected("an updating clause");
        }
        if let Some(bad) = clauses.iter().find(|c| !c.is_write()) {
            return self.invalid(format!("{} is not allowed inside FOREACH", bad.name()), start);
        }
        self.expect(TokenKind::RParen)?;
        Ok(Clause::Foreach {
            variable,
            list,
            clauses,
        })
    }

    fn call_clause(&mut self) -> ParseResult<Clause> {
        self.expect(TokenKind::LBrace)?;
        let query = self.query()?;
        self.expect(TokenKind::RBrace)?;
        let mut yields = Vec::new();
        if self.eat_kw(Keyword::Yield) {
            loop {
                let name = self.variable()?;
                let alias = if self.eat_kw(Keyword::As) {
                    Some(self.variable()?)
                } else {
                    None
                };
                yields.push(YieldItem { name, alias });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(Clause::CallSubquery {
            query: Box::new(query),
            yields,
        })
    }

    fn projection(&mut self) -> ParseResult<Projection> {
        let mut projection = Projection {
            distinct: self.eat_kw(Keyword::Distinct),
            ..Projection::default()
        };
        if self.eat(&TokenKind::Star) {
            projection.star = true;
            if !self.eat(&TokenKind::Comma) {
                return self.projection_tail(projection);
            }
        }
        loop {
            let start = self.offset();
            let expr = self.expr()?;
            let text = self.text_from(start);
            let alias = if self.eat_kw(Keyword::As) {
                Some(self.variable()?)
            } else {
                None
            };
            projection.items.push(ProjectionItem { expr, alias, text });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.projection_tail(projection)
    }

    fn projection_tail(&mut self, mut projection: Projection) -> ParseResult<Projection> {
        if self.at_kw(Keyword::Order) {
            self.advance();
            self.expect_kw(Keyword::By)?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_kw(Keyword::Desc) {
                    true
                } else {
                    self.eat_kw(Keyword::Asc);
                    false
                };
                projection.order_by.push(SortItem { expr, descending });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        if self.eat_kw(Keyword::Skip) {
            projection.skip = Some(self.expr()?);
        }
        if self.eat_kw(Keyword::Limit) {
            projection.limit = Some(self.expr()?);
        }
        Ok(projection)
    }

    fn set_items(&mut self) -> ParseResult<Vec<SetItem>> {
        let mut items = Vec::new();
        loop {
            let variable = self.variable()?;
            let item = match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let key = self.symbolic_name("property name")?;
                    if self.at(&TokenKind::Dot) {
                        return self.invalid("Nested property assignment is not supported", self.offset());
                    }
                    self.expect(TokenKind::Eq)?;
                    SetItem::Property {
                        variable,
                        key,
                        value: self.expr()?,
                    }
                }
                TokenKind::Eq => {
                    self.advance();
                    SetItem::Replace {
                        variable,
                        value: self.expr()?,
                    }
                }
                TokenKind::PlusEq => {
                    self.advance();
                    SetItem::MergeMap {
                        variable,
                        value: self.expr()?,
                    }
                }
                TokenKind::Colon => SetItem::Labels {
                    variable,
                    labels: self.label_list()?,
                },
                _ => return self.unexpected("'.', '=', '+=' or ':'"),
            };
            items.push(item);
            if !self.eat(&TokenKind::Comma) {
                return Ok(items);
            }
        }
    }

    fn remove_items(&mut self) -> ParseResult<Vec<RemoveItem>> {
        let mut items = Vec::new();
        loop {
            let variable = self.variable()?;
            let item = match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    RemoveItem::Property {
                        variable,
                        key: self.symbolic_name("property name")?,
                    }
                }
                TokenKind::Colon => RemoveItem::Labels {
                    variable,
                    labels: self.label_list()?,
                },
                _ => return self.unexpected("'.' or ':'"),
            };
            items.push(item);
            if !self.eat(&TokenKind::Comma) {
                return Ok(items);
            }
        }
    }

    /// One or more `:Label`
    fn label_list(&mut self) -> ParseResult<Vec<Label>> {
        let mut labels = Vec::new();
        while self.eat(&TokenKind::Colon) {
            labels.push(Label::new(self.symbolic_name("label")?));
        }
        if labels.is_empty() {
            return self.unexpected("':'");
        }
        Ok(labels)
    }

    fn expr_list(&mut self) -> ParseResult<Vec<Expr>> {
        let mut exprs = vec![self.expr()?];
        while self.eat(&TokenKind::Comma) {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    // ---- patterns ----

    fn patterns(&mut self) -> ParseResult<Vec<PathPattern>> {
        let mut patterns = vec![self.path_pattern()?];
        while self.eat(&TokenKind::Comma) {
            patterns.push(self.path_pattern()?);
        }
        Ok(patterns)
    }

    fn path_pattern(&mut self) -> ParseResult<PathPattern> {
        let variable = if matches!(self.peek(), TokenKind::Ident(_)) && self.peek_at(1) == &TokenKind::Eq {
            let name = self.variable()?;
            self.advance();
            Some(name)
        } else {
            None
        };
        let start = self.node_pattern()?;
        let mut segments = Vec::new();
        while matches!(
            self.peek(),
            TokenKind::Minus | TokenKind::ArrowLeft | TokenKind::ArrowBoth
        ) {
            let relationship = self.relationship_pattern()?;
            let node = self.node_pattern()?;
            segments.push(PatternSegment { relationship, node });
        }
        Ok(PathPattern {
            variable,
            start,
            segments,
        })
    }

    fn node_pattern(&mut self) -> ParseResult<NodePattern> {
        self.expect(TokenKind::LParen)?;
        let variable = match self.peek() {
            TokenKind::Ident(_) => Some(self.variable()?),
            _ => None,
        };
        let mut labels = Vec::new();
        while self.eat(&TokenKind::Colon) {
            labels.push(Label::new(self.symbolic_name("label")?));
        }
        let properties = if self.at(&TokenKind::LBrace) {
            self.map_entries()?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::RParen)?;
        Ok(NodePattern {
            variable,
            labels,
            properties,
        })
    }

    fn relationship_pattern(&mut self) -> ParseResult<RelationshipPattern> {
        let mut rel = RelationshipPattern {
            variable: None,
            types: Vec::new(),
            direction: Direction::Both,
            length: None,
            properties: Vec::new(),
        };
        let left = match self.advance() {
            TokenKind::ArrowBoth => return Ok(rel),
            TokenKind::ArrowLeft => true,
            _ => false,
        };
        if self.eat(&TokenKind::LBracket) {
            self.relationship_detail(&mut rel)?;
            self.expect(TokenKind::RBracket)?;
        }
        let right = match self.peek() {
            TokenKind::ArrowRight => true,
            TokenKind::Minus => false,
            _ => return self.unexpected("'-' or '->'"),
        };
        self.advance();
        rel.direction = match (left, right) {
            (true, false) => Direction::Incoming,
            (false, true) => Direction::Outgoing,
            _ => Direction::Both,
        };
        Ok(rel)
    }

    fn relationship_detail(&mut self, rel: &mut RelationshipPattern) -> ParseResult<()> {
        if let TokenKind::Ident(_) = self.peek() {
            rel.variable = Some(self.variable()?);
        }
        if self.eat(&TokenKind::Colon) {
            rel.types.push(RelType::new(self.symbolic_name("relationship type")?));
            while self.eat(&TokenKind::Pipe) {
                self.eat(&TokenKind::Colon);
                rel.types.push(RelType::new(self.symbolic_name("relationship type")?));
            }
        }
        if self.eat(&TokenKind::Star) {
            rel.length = Some(self.var_length()?);
        }
        if self.at(&TokenKind::LBrace) {
            rel.properties = self.map_entries()?;
        }
        Ok(())
    }

    /// After `*`: nothing, `n`, `n..`, `..m` or `n..m`
    fn var_length(&mut self) -> ParseResult<VarLength> {
        let offset = self.offset();
        let min = self.opt_usize()?;
        let length = if self.eat(&TokenKind::DotDot) {
            VarLength {
                min: min.unwrap_or(1),
                max: self.opt_usize()?,
            }
        } else {
            match min {
                Some(n) => VarLength { min: n, max: Some(n) },
                None => VarLength { min: 1, max: None },
            }
        };
        if let Some(max) = length.max {
            if max < length.min {
                return self.invalid("Variable-length upper bound is below the lower bound", offset);
            }
        }
        Ok(length)
    }

    fn opt_usize(&mut self) -> ParseResult<Option<usize>> {
        let token = self.peek().clone();
        match token {
            TokenKind::Integer(n) if n >= 0 => {
                self.advance();
                Ok(Some(n as usize))
            }
            TokenKind::Integer(_) => self.invalid("Hop count must be non-negative", self.offset()),
            _ => Ok(None),
        }
    }

    /// `{key: expr, ...}`
    fn map_entries(&mut self) -> ParseResult<Vec<(String, Expr)>> {
        self.expect(TokenKind::LBrace)?;
        let mut entries = Vec::new();
        if self.eat(&TokenKind::RBrace) {
            return Ok(entries);
        }
        loop {
            let key = match self.peek().clone() {
                TokenKind::Str(s) => {
                    self.advance();
                    s
                }
                _ => self.symbolic_name("map key")?,
            };
            self.expect(TokenKind::Colon)?;
            entries.push((key, self.expr()?));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(entries)
    }

    // ---- expressions ----

    fn expr(&mut self) -> ParseResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.xor_expr()?;
        while self.eat_kw(Keyword::Or) {
            lhs = Expr::binary(BinaryOp::Or, lhs, self.xor_expr()?);
        }
        Ok(lhs)
    }

    fn xor_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_kw(Keyword::Xor) {
            lhs = Expr::binary(BinaryOp::Xor, lhs, self.and_expr()?);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat_kw(Keyword::And) {
            lhs = Expr::binary(BinaryOp::And, lhs, self.not_expr()?);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> ParseResult<Expr> {
        if self.eat_kw(Keyword::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::Neq => BinaryOp::Neq,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                TokenKind::RegexMatch => BinaryOp::Regex,
                // `x<-1` lexes as an arrow
                TokenKind::ArrowLeft => {
                    self.advance();
                    let rhs = self.unary_operand()?;
                    lhs = Expr::binary(BinaryOp::Lt, lhs, negate(rhs));
                    continue;
                }
                TokenKind::Keyword(Keyword::In, _) => BinaryOp::In,
                TokenKind::Keyword(Keyword::Contains, _) => BinaryOp::Contains,
                TokenKind::Keyword(Keyword::Starts, _) => {
                    self.advance();
                    self.expect_kw(Keyword::With)?;
                    lhs = Expr::binary(BinaryOp::StartsWith, lhs, self.additive()?);
                    continue;
                }
                TokenKind::Keyword(Keyword::Ends, _) => {
                    self.advance();
                    self.expect_kw(Keyword::With)?;
                    lhs = Expr::binary(BinaryOp::EndsWith, lhs, self.additive()?);
                    continue;
                }
                TokenKind::Keyword(Keyword::Is, _) => {
                    self.advance();
                    let negated = self.eat_kw(Keyword::Not);
                    self.expect_kw(Keyword::Null)?;
                    lhs = Expr::IsNull {
                        expr: Box::new(lhs),
                        negated,
                    };
                    continue;
                }
                _ => return Ok(lhs),
            };
            self.advance();
            lhs = Expr::binary(op, lhs, self.additive()?);
        }
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            lhs = Expr::binary(op, lhs, self.multiplicative()?);
        }
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.power()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            lhs = Expr::binary(op, lhs, self.power()?);
        }
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.unary()?;
        if self.eat(&TokenKind::Caret) {
            // right-associative
            return Ok(Expr::binary(BinaryOp::Pow, base, self.power()?));
        }
        Ok(base)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&TokenKind::Minus) {
            if self.peek() == &TokenKind::Integer(i64::MIN) {
                self.advance();
                return Ok(Expr::Literal(PropertyValue::Integer(i64::MIN)));
            }
            return Ok(negate(self.unary()?));
        }
        if self.eat(&TokenKind::Plus) {
            return self.unary();
        }
        self.postfix()
    }

    /// Operand of the `<-` comparison split: a unary expression up to `+ - * /`
    fn unary_operand(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.power()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            lhs = Expr::binary(op, lhs, self.power()?);
        }
        Ok(lhs)
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let key = self.symbolic_name("property name")?;
                    expr = Expr::Property(Box::new(expr), key);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                TokenKind::Colon if matches!(expr, Expr::Variable(_)) => {
                    let labels = self.label_list()?;
                    expr = Expr::HasLabels {
                        expr: Box::new(expr),
                        labels,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        let expr = match token {
            TokenKind::Integer(i64::MIN) => {
                return self.invalid("Integer literal 9223372036854775808 is out of range", self.offset());
            }
            TokenKind::Integer(i) => {
                self.advance();
                Expr::Literal(PropertyValue::Integer(i))
            }
            TokenKind::Float(f) => {
                self.advance();
                Expr::Literal(PropertyValue::Float(f))
            }
            TokenKind::Str(s) => {
                self.advance();
                Expr::Literal(PropertyValue::String(s))
            }
            TokenKind::Param(p) => {
                self.advance();
                Expr::Parameter(p)
            }
            TokenKind::Keyword(Keyword::True, _) => {
                self.advance();
                Expr::Literal(PropertyValue::Boolean(true))
            }
            TokenKind::Keyword(Keyword::False, _) => {
                self.advance();
                Expr::Literal(PropertyValue::Boolean(false))
            }
            TokenKind::Keyword(Keyword::Null, _) => {
                self.advance();
                Expr::Literal(PropertyValue::Null)
            }
            TokenKind::Keyword(Keyword::Case, _) => {
                self.advance();
                self.case_expr()?
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                inner
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    items = self.expr_list()?;
                    self.expect(TokenKind::RBracket)?;
                }
                Expr::List(items)
            }
            TokenKind::LBrace => Expr::Map(self.map_entries()?),
            TokenKind::Ident(name) => {
                self.advance();
                if self.at(&TokenKind::LParen) {
                    self.function_call(name)?
                } else {
                    Expr::Variable(name)
                }
            }
            _ => return self.unexpected("an expression"),
        };
        Ok(expr)
    }

    fn function_call(&mut self, name: String) -> ParseResult<Expr> {
        self.expect(TokenKind::LParen)?;
        let name = name.to_ascii_lowercase();
        if name == "count" && self.at(&TokenKind::Star) {
            self.advance();
            self.expect(TokenKind::RParen)?;
            return Ok(Expr::CountStar);
        }
        let distinct = self.eat_kw(Keyword::Distinct);
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            args = self.expr_list()?;
            self.expect(TokenKind::RParen)?;
        }
        Ok(Expr::Function { name, distinct, args })
    }

    fn case_expr(&mut self) -> ParseResult<Expr> {
        let operand = if self.at_kw(Keyword::When) {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let mut branches = Vec::new();
        while self.eat_kw(Keyword::When) {
            let when = self.expr()?;
            self.expect_kw(Keyword::Then)?;
            branches.push((when, self.expr()?));
        }
        if branches.is_empty() {
            return self.unexpected("WHEN");
        }
        let default = if self.eat_kw(Keyword::Else) {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_kw(Keyword::End)?;
        Ok(Expr::Case {
            operand,
            branches,
            default,
        })
    }
}

/// Unary minus, folded into numeric literals
fn negate(expr: Expr) -> Expr {
    match expr {
        Expr::Literal(PropertyValue::Integer(i)) => Expr::Literal(PropertyValue::Integer(i.wrapping_neg())),
        Expr::Literal(PropertyValue::Float(f)) => Expr::Literal(PropertyValue::Float(-f)),
        other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(src: &str) -> Query {
        match parse(src).unwrap().kind {
            StatementKind::Query(q) => q,
            other => panic!("expected a query, got {:?}", other),
        }
    }

    fn clauses(src: &str) -> Vec<Clause> {
        query(src).first.clauses
    }

    #[test]
    fn test_create_path_and_return() {
        let cs = clauses(r#"CREATE (a:Person {name:"Alice"})-[:KNOWS]->(b:Person {name:"Bob"}) RETURN a,b"#);
        assert_eq!(cs.len(), 2);
        let Clause::Create { patterns } = &cs[0] else {
            panic!("expected CREATE");
        };
        let path = &patterns[0];
        assert_eq!(path.start.variable.as_deref(), Some("a"));
        assert_eq!(path.start.labels, vec![Label::new("Person")]);
        assert_eq!(
            path.start.properties,
            vec![("name".to_string(), Expr::Literal("Alice".into()))]
        );
        assert_eq!(path.segments[0].relationship.types, vec![RelType::new("KNOWS")]);
        assert_eq!(path.segments[0].relationship.direction, Direction::Outgoing);
        let Clause::Return(proj) = &cs[1] else {
            panic!("expected RETURN");
        };
        let names: Vec<String> = proj.items.iter().map(|i| i.column_name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        let cs = clauses("MATCH (p:Person) WHERE NOT p.age > 30 RETURN p");
        let Clause::Match { predicate: Some(pred), .. } = &cs[0] else {
            panic!("expected MATCH with WHERE");
        };
        assert_eq!(
            pred,
            &Expr::Unary(
                UnaryOp::Not,
                Box::new(Expr::binary(
                    BinaryOp::Gt,
                    Expr::property(Expr::variable("p"), "age"),
                    Expr::Literal(30.into())
                ))
            )
        );
    }

    #[test]
    fn test_relationship_directions_and_lengths() {
        let cs = clauses("MATCH (a)<-[r:X|:Y*2..]-(b)-->(c)<-->(d)-[*]-(e)-[*..3]->(f) RETURN a");
        let Clause::Match { patterns, .. } = &cs[0] else {
            panic!("expected MATCH");
        };
        let segs = &patterns[0].segments;
        assert_eq!(segs[0].relationship.direction, Direction::Incoming);
        assert_eq!(segs[0].relationship.types.len(), 2);
        assert_eq!(segs[0].relationship.length, Some(VarLength { min: 2, max: None }));
        assert_eq!(segs[1].relationship.direction, Direction::Outgoing);
        assert_eq!(segs[2].relationship.direction, Direction::Both);
        assert_eq!(segs[3].relationship.length, Some(VarLength { min: 1, max: None }));
        assert_eq!(segs[3].relationship.direction, Direction::Both);
        assert_eq!(segs[4].relationship.length, Some(VarLength { min: 1, max: Some(3) }));
    }

    #[test]
    fn test_string_predicates_and_null_checks() {
        let cs = clauses(
            "MATCH (n) WHERE n.name STARTS WITH 'A' AND n.name ENDS WITH 'e' AND n.x IS NOT NULL AND n.y IN [1, 2] RETURN n",
        );
        let Clause::Match { predicate: Some(pred), .. } = &cs[0] else {
            panic!("expected WHERE");
        };
        let parts = pred.clone().conjuncts();
        assert_eq!(parts.len(), 4);
        assert!(matches!(parts[0], Expr::Binary(BinaryOp::StartsWith, ..)));
        assert!(matches!(parts[1], Expr::Binary(BinaryOp::EndsWith, ..)));
        assert!(matches!(parts[2], Expr::IsNull { negated: true, .. }));
        assert!(matches!(parts[3], Expr::Binary(BinaryOp::In, ..)));
    }

    #[test]
    fn test_arrow_in_comparison_means_less_than_negative() {
        assert_eq!(
            parse_expression("x<-1").unwrap(),
            Expr::binary(BinaryOp::Lt, Expr::variable("x"), Expr::Literal((-1).into()))
        );
    }

    #[test]
    fn test_merge_with_actions() {
        let cs = clauses("MERGE (n:City {name: 'Oslo'}) ON CREATE SET n.created = 1 ON MATCH SET n.seen = 2, n:Visited");
        let Clause::Merge { on_create, on_match, .. } = &cs[0] else {
            panic!("expected MERGE");
        };
        assert_eq!(on_create.len(), 1);
        assert_eq!(on_match.len(), 2);
        assert!(matches!(&on_match[1], SetItem::Labels { labels, .. } if labels[0] == Label::new("Visited")));
    }

    #[test]
    fn test_projection_modifiers() {
        let cs = clauses("MATCH (n) RETURN DISTINCT n.name AS name, count(*) ORDER BY name DESC SKIP 1 LIMIT 2");
        let Clause::Return(proj) = &cs[1] else {
            panic!("expected RETURN");
        };
        assert!(proj.distinct);
        assert_eq!(proj.items[1].expr, Expr::CountStar);
        assert_eq!(proj.items[1].column_name(), "count(*)");
        assert!(proj.order_by[0].descending);
        assert_eq!(proj.skip, Some(Expr::Literal(1.into())));
        assert_eq!(proj.limit, Some(Expr::Literal(2.into())));
    }

    #[test]
    fn test_foreach_call_union() {
        let cs = clauses("MATCH (n) FOREACH (x IN [1,2] | CREATE (:Tick {v: x})) RETURN n");
        assert!(matches!(&cs[1], Clause::Foreach { clauses, .. } if clauses.len() == 1));

        let cs = clauses("CALL { MATCH (n) RETURN count(n) AS c } YIELD c AS total RETURN total");
        assert!(matches!(&cs[0], Clause::CallSubquery { yields, .. } if yields[0].alias.as_deref() == Some("total")));

        let q = query("MATCH (a:A) RETURN a.x AS x UNION ALL MATCH (b:B) RETURN b.x AS x UNION MATCH (c) RETURN c.x AS x");
        assert_eq!(q.unions.len(), 2);
        assert!(q.unions[0].0);
        assert!(!q.unions[1].0);
    }

    #[test]
    fn test_case_and_functions() {
        let e = parse_expression("CASE WHEN n.a > 1 THEN 'big' ELSE toUpper('small') END").unwrap();
        let Expr::Case { operand: None, branches, default: Some(default) } = e else {
            panic!("expected CASE");
        };
        assert_eq!(branches.len(), 1);
        assert!(matches!(*default, Expr::Function { ref name, .. } if name == "toupper"));
        assert!(matches!(
            parse_expression("count(DISTINCT n.x)").unwrap(),
            Expr::Function { distinct: true, .. }
        ));
    }

    #[test]
    fn test_index_statements() {
        let st = parse("CREATE INDEX ON :Person(name, address.city)").unwrap();
        assert_eq!(
            st.kind,
            StatementKind::CreateIndex {
                label: Label::new("Person"),
                properties: vec![PropertyPath::single("name"), PropertyPath::parse("address.city")],
            }
        );
        let st = parse("EXPLAIN DROP INDEX ON :Person(name);").unwrap();
        assert!(st.explain);
        assert!(matches!(st.kind, StatementKind::DropIndex { .. }));
        let st = parse("CREATE INDEX ON :Person()").unwrap();
        assert_eq!(
            st.kind,
            StatementKind::CreateIndex {
                label: Label::new("Person"),
                properties: vec![],
            }
        );
    }

    #[test]
    fn test_keywords_as_property_keys() {
        let e = parse_expression("n.end + n.`order`").unwrap();
        assert_eq!(
            e,
            Expr::binary(
                BinaryOp::Add,
                Expr::property(Expr::variable("n"), "end"),
                Expr::property(Expr::variable("n"), "order")
            )
        );
    }

    #[test]
    fn test_errors_name_expected_and_found() {
        match parse("MATCH (n RETURN n") {
            Err(ParseError::Unexpected { expected, found, offset }) => {
                assert_eq!(expected, "')'");
                assert_eq!(found, "RETURN");
                assert_eq!(offset, 9);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(parse("MATCH (n)"), Err(ParseError::Invalid { .. })));
        assert!(matches!(parse("RETURN 1 RETURN 2"), Err(ParseError::Invalid { .. })));
        assert!(matches!(parse("   "), Err(ParseError::Empty)));
        assert!(matches!(parse("RETURN 'x"), Err(ParseError::Lexical(_))));
        assert!(matches!(parse("MATCH (a)-[*3..1]->(b) RETURN a"), Err(ParseError::Invalid { .. })));
    }

    #[test]
    fn test_minimum_integer_literal() {
        assert_eq!(
            parse_expression("-9223372036854775808").unwrap(),
            Expr::Literal(PropertyValue::Integer(i64::MIN))
        );
        assert_eq!(
            parse_expression("-9223372036854775807").unwrap(),
            Expr::Literal(PropertyValue::Integer(-i64::MAX))
        );
        assert!(matches!(
            parse_expression("9223372036854775808"),
            Err(ParseError::Invalid { .. })
        ));
        assert!(matches!(
            parse_expression("-(9223372036854775808)"),
            Err(ParseError::Invalid { .. })
        ));
    }
}
