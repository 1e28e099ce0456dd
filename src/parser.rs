//! Recursive descent parser for Skarn
//!
//! Produces the tagged-node AST consumed by the analyzer. Preprocess
//! fragments arrive from the lexer as raw text; we re-lex and re-parse them
//! here with the surface grammar at their original byte offset, so a
//! directive body is ordinary AST with exact spans by the time analysis
//! starts.
//!
//! Node slot layouts:
//!   Block        [stmts...]
//!   LocalDecl    [iddecl, value|nil]
//!   IdDecl       [name|PreprocessName, type|nil]
//!   Assign       [target, value]
//!   FuncDef      [islocal, name, params..., ret|nil, block]
//!   Return       [value|nil]
//!   If           [clauses..., elseblock|nil]    Clause [cond, block]
//!   While        [cond, block]
//!   ForNum       [iddecl, start, limit, step|nil, block]
//!   Do           [block]
//!   Call         [args..., callee]
//!   DotIndex     [name, object]
//!   KeyIndex     [index, object]
//!   UnaryOp      [opname, operand]
//!   BinaryOp     [opname, lhs, rhs]
//!   Number       [value, suffix|nil]
//!   String       [value, suffix|nil]

use thiserror::Error;

use crate::ast::{AstBuilder, NodeRef, Slot, Span, Tag};
use crate::lexer::{LexError, Lexer, SpannedToken, Token};
use crate::operators::{self, Associativity};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unexpected token: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },
    #[error("unexpected end of input")]
    UnexpectedEof(Span),
    #[error("cannot assign to this expression")]
    InvalidAssignTarget(Span),
    #[error(transparent)]
    Lex(#[from] LexError),
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. } => span.clone(),
            ParseError::UnexpectedEof(span) => span.clone(),
            ParseError::InvalidAssignTarget(span) => span.clone(),
            ParseError::Lex(e) => e.span().clone(),
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a whole source unit into a `Block` node
pub fn parse_source(source: &str, builder: &AstBuilder) -> ParseResult<NodeRef> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens, builder.clone());
    parser.parse_chunk()
}

pub struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    builder: AstBuilder,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedToken>, builder: AstBuilder) -> Self {
        Self {
            tokens,
            pos: 0,
            builder,
        }
    }

    // ========================================================================
    // Cursor
    // ========================================================================

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span.clone())
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, expected: &str) -> ParseResult<Span> {
        let span = self.current_span();
        if self.eat(&token) {
            Ok(span)
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: format!("{:?}", self.peek()),
            span: self.current_span(),
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("identifier"))
            }
        }
    }

    fn node(&self, tag: Tag, span: Span, slots: Vec<Slot>) -> NodeRef {
        self.builder.build(tag, span, slots)
    }

    // ========================================================================
    // Blocks and statements
    // ========================================================================

    pub fn parse_chunk(&mut self) -> ParseResult<NodeRef> {
        let block = self.parse_block()?;
        if !self.check(&Token::Eof) {
            return Err(self.unexpected("end of input"));
        }
        Ok(block)
    }

    fn block_ends(&self) -> bool {
        matches!(
            self.peek(),
            Token::Eof | Token::End | Token::Else | Token::Elseif
        )
    }

    fn parse_block(&mut self) -> ParseResult<NodeRef> {
        let start = self.current_span();
        let mut stmts = Vec::new();
        while !self.block_ends() {
            if self.eat(&Token::Semicolon) {
                continue;
            }
            let stmt = self.parse_statement()?;
            let is_return = stmt.borrow().tag == Tag::Return;
            stmts.push(stmt);
            // `return` ends a block
            if is_return {
                break;
            }
        }
        let span = start.merge(&self.current_span());
        Ok(self.node(Tag::Block, span, vec![Slot::List(stmts)]))
    }

    fn parse_statement(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        match self.peek().clone() {
            Token::Local => self.parse_local(),
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::For => self.parse_for(),
            Token::Do => {
                self.advance();
                let block = self.parse_block()?;
                let end = self.expect(Token::End, "'end'")?;
                Ok(self.node(Tag::Do, span.merge(&end), vec![Slot::Node(block)]))
            }
            Token::Return => {
                self.advance();
                let value = if self.block_ends() || self.check(&Token::Semicolon) {
                    Slot::Nil
                } else {
                    Slot::Node(self.parse_expr()?)
                };
                Ok(self.node(Tag::Return, span, vec![value]))
            }
            Token::Break => {
                self.advance();
                Ok(self.node(Tag::Break, span, vec![]))
            }
            Token::PreprocessStmt(text, offset) => {
                self.advance();
                let block = self.subparse_block(&text, offset)?;
                Ok(self.node(Tag::Preprocess, span, vec![Slot::Node(block)]))
            }
            _ => self.parse_expr_statement(),
        }
    }

    fn parse_local(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        self.advance();
        if self.eat(&Token::Function) {
            return self.parse_funcdef(span, true);
        }
        let iddecl = self.parse_iddecl()?;
        let value = if self.eat(&Token::Assign) {
            Slot::Node(self.parse_expr()?)
        } else {
            Slot::Nil
        };
        let span = span.merge(&self.current_span());
        Ok(self.node(Tag::LocalDecl, span, vec![Slot::Node(iddecl), value]))
    }

    fn parse_iddecl(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        let name = match self.peek().clone() {
            Token::PreprocessName(text, offset) => {
                self.advance();
                let expr = self.subparse_expr(&text, offset)?;
                let name_node =
                    self.node(Tag::PreprocessName, span.clone(), vec![Slot::Node(expr)]);
                Slot::Node(name_node)
            }
            _ => Slot::Str(self.expect_name()?),
        };
        let ty = if self.eat(&Token::Colon) {
            Slot::Node(self.parse_type_expr()?)
        } else {
            Slot::Nil
        };
        let span = span.merge(&self.current_span());
        Ok(self.node(Tag::IdDecl, span, vec![name, ty]))
    }

    fn parse_funcdef(&mut self, span: Span, islocal: bool) -> ParseResult<NodeRef> {
        let name = self.expect_name()?;
        self.expect(Token::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.parse_iddecl()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;
        let ret = if self.eat(&Token::Colon) {
            Slot::Node(self.parse_type_expr()?)
        } else {
            Slot::Nil
        };
        let block = self.parse_block()?;
        let end = self.expect(Token::End, "'end'")?;
        Ok(self.node(
            Tag::FuncDef,
            span.merge(&end),
            vec![
                Slot::Bool(islocal),
                Slot::Str(name),
                Slot::List(params),
                ret,
                Slot::Node(block),
            ],
        ))
    }

    fn parse_if(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        self.advance();
        let mut clauses = Vec::new();
        loop {
            let clause_span = self.current_span();
            let cond = self.parse_expr()?;
            self.expect(Token::Then, "'then'")?;
            let block = self.parse_block()?;
            clauses.push(self.node(
                Tag::Clause,
                clause_span,
                vec![Slot::Node(cond), Slot::Node(block)],
            ));
            if !self.eat(&Token::Elseif) {
                break;
            }
        }
        let else_block = if self.eat(&Token::Else) {
            Slot::Node(self.parse_block()?)
        } else {
            Slot::Nil
        };
        let end = self.expect(Token::End, "'end'")?;
        Ok(self.node(
            Tag::If,
            span.merge(&end),
            vec![Slot::List(clauses), else_block],
        ))
    }

    fn parse_while(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        self.advance();
        let cond = self.parse_expr()?;
        self.expect(Token::Do, "'do'")?;
        let block = self.parse_block()?;
        let end = self.expect(Token::End, "'end'")?;
        Ok(self.node(
            Tag::While,
            span.merge(&end),
            vec![Slot::Node(cond), Slot::Node(block)],
        ))
    }

    fn parse_for(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        self.advance();
        let iddecl = self.parse_iddecl()?;
        self.expect(Token::Assign, "'='")?;
        let start = self.parse_expr()?;
        self.expect(Token::Comma, "','")?;
        let limit = self.parse_expr()?;
        let step = if self.eat(&Token::Comma) {
            Slot::Node(self.parse_expr()?)
        } else {
            Slot::Nil
        };
        self.expect(Token::Do, "'do'")?;
        let block = self.parse_block()?;
        let end = self.expect(Token::End, "'end'")?;
        Ok(self.node(
            Tag::ForNum,
            span.merge(&end),
            vec![
                Slot::Node(iddecl),
                Slot::Node(start),
                Slot::Node(limit),
                step,
                Slot::Node(block),
            ],
        ))
    }

    /// A statement starting with an expression: either a call or an
    /// assignment to a suffixed expression
    fn parse_expr_statement(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        let expr = self.parse_suffixed_expr()?;
        if self.eat(&Token::Assign) {
            let tag = expr.borrow().tag;
            if !matches!(tag, Tag::Id | Tag::DotIndex | Tag::KeyIndex | Tag::UnaryOp) {
                return Err(ParseError::InvalidAssignTarget(span));
            }
            let value = self.parse_expr()?;
            let span = span.merge(&self.current_span());
            return Ok(self.node(
                Tag::Assign,
                span,
                vec![Slot::Node(expr), Slot::Node(value)],
            ));
        }
        if expr.borrow().tag != Tag::Call {
            return Err(self.unexpected("statement"));
        }
        Ok(expr)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn parse_expr(&mut self) -> ParseResult<NodeRef> {
        self.parse_binary_expr(0)
    }

    fn parse_binary_expr(&mut self, min_prec: u8) -> ParseResult<NodeRef> {
        let mut lhs = self.parse_unary_expr()?;
        while let Some(op) = operators::binary_op(self.peek()) {
            if op.precedence < min_prec {
                break;
            }
            self.advance();
            let next_min = match op.assoc {
                Associativity::Left => op.precedence + 1,
                Associativity::Right => op.precedence,
            };
            let rhs = self.parse_binary_expr(next_min)?;
            let span = lhs.borrow().span.merge(&rhs.borrow().span);
            lhs = self.node(
                Tag::BinaryOp,
                span,
                vec![Slot::Str(op.name.into()), Slot::Node(lhs), Slot::Node(rhs)],
            );
        }
        Ok(lhs)
    }

    fn parse_unary_expr(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        if let Some(op) = operators::unary_op(self.peek()) {
            self.advance();
            let operand = self.parse_unary_expr()?;
            let span = span.merge(&operand.borrow().span);
            return Ok(self.node(
                Tag::UnaryOp,
                span,
                vec![Slot::Str(op.into()), Slot::Node(operand)],
            ));
        }
        self.parse_simple_expr()
    }

    fn parse_simple_expr(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        match self.peek().clone() {
            Token::Int(value, suffix) => {
                self.advance();
                let suffix = suffix.map(Slot::Str).unwrap_or(Slot::Nil);
                Ok(self.node(Tag::Number, span, vec![Slot::Int(value), suffix]))
            }
            Token::Float(value, suffix) => {
                self.advance();
                let suffix = suffix.map(Slot::Str).unwrap_or(Slot::Nil);
                Ok(self.node(Tag::Number, span, vec![Slot::Float(value), suffix]))
            }
            Token::Str(value) => {
                self.advance();
                Ok(self.node(Tag::String, span, vec![Slot::Str(value), Slot::Nil]))
            }
            Token::True => {
                self.advance();
                Ok(self.node(Tag::Boolean, span, vec![Slot::Bool(true)]))
            }
            Token::False => {
                self.advance();
                Ok(self.node(Tag::Boolean, span, vec![Slot::Bool(false)]))
            }
            Token::Nil => {
                self.advance();
                Ok(self.node(Tag::Nil, span, vec![]))
            }
            Token::Nilptr => {
                self.advance();
                Ok(self.node(Tag::Nilptr, span, vec![]))
            }
            Token::At => {
                self.advance();
                let ty = self.parse_type_expr()?;
                let span = span.merge(&ty.borrow().span);
                Ok(self.node(Tag::Type, span, vec![Slot::Node(ty)]))
            }
            Token::LBrace => self.parse_init_list(),
            Token::PreprocessExpr(text, offset) => {
                self.advance();
                let expr = self.subparse_expr(&text, offset)?;
                Ok(self.node(Tag::PreprocessExpr, span, vec![Slot::Node(expr)]))
            }
            _ => self.parse_suffixed_expr(),
        }
    }

    fn parse_init_list(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        self.expect(Token::LBrace, "'{'")?;
        let mut items = Vec::new();
        while !self.check(&Token::RBrace) {
            let item_span = self.current_span();
            // `name = expr` field initializer needs two-token lookahead
            if let Token::Ident(name) = self.peek().clone() {
                if self
                    .tokens
                    .get(self.pos + 1)
                    .map(|t| t.token == Token::Assign)
                    .unwrap_or(false)
                {
                    self.advance();
                    self.advance();
                    let value = self.parse_expr()?;
                    items.push(self.node(
                        Tag::Pair,
                        item_span,
                        vec![Slot::Str(name), Slot::Node(value)],
                    ));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                    continue;
                }
            }
            items.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(Token::RBrace, "'}'")?;
        Ok(self.node(Tag::InitList, span.merge(&end), vec![Slot::List(items)]))
    }

    fn parse_suffixed_expr(&mut self) -> ParseResult<NodeRef> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            let span = expr.borrow().span.clone();
            match self.peek().clone() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    let span = span.merge(&self.current_span());
                    expr = self.node(
                        Tag::DotIndex,
                        span,
                        vec![Slot::Str(name), Slot::Node(expr)],
                    );
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    let end = self.expect(Token::RBracket, "']'")?;
                    expr = self.node(
                        Tag::KeyIndex,
                        span.merge(&end),
                        vec![Slot::Node(index), Slot::Node(expr)],
                    );
                }
                Token::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect(Token::RParen, "')'")?;
                    expr = self.node(
                        Tag::Call,
                        span.merge(&end),
                        vec![Slot::List(args), Slot::Node(expr)],
                    );
                }
                // Paren-less call with a string literal argument
                Token::Str(value) => {
                    let arg_span = self.current_span();
                    self.advance();
                    let arg = self.node(
                        Tag::String,
                        arg_span.clone(),
                        vec![Slot::Str(value), Slot::Nil],
                    );
                    expr = self.node(
                        Tag::Call,
                        span.merge(&arg_span),
                        vec![Slot::List(vec![arg]), Slot::Node(expr)],
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary_expr(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(self.node(Tag::Id, span, vec![Slot::Str(name)]))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                let end = self.expect(Token::RParen, "')'")?;
                Ok(self.node(Tag::Paren, span.merge(&end), vec![Slot::Node(inner)]))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    // ========================================================================
    // Type expressions
    // ========================================================================

    fn parse_type_expr(&mut self) -> ParseResult<NodeRef> {
        let span = self.current_span();
        match self.peek().clone() {
            Token::Star => {
                self.advance();
                // A bare `*` is the untyped pointer
                let subtype = match self.peek() {
                    Token::Ident(_) | Token::Star | Token::LBracket | Token::Record
                    | Token::Enum | Token::Union | Token::Function => {
                        Slot::Node(self.parse_type_expr()?)
                    }
                    _ => Slot::Nil,
                };
                let span = span.merge(&self.current_span());
                Ok(self.node(Tag::PointerType, span, vec![subtype]))
            }
            Token::Function => {
                self.advance();
                self.expect(Token::LParen, "'('")?;
                let mut params = Vec::new();
                if !self.check(&Token::RParen) {
                    loop {
                        params.push(self.parse_type_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen, "')'")?;
                let ret = if self.eat(&Token::Colon) {
                    Slot::Node(self.parse_type_expr()?)
                } else {
                    Slot::Nil
                };
                let span = span.merge(&self.current_span());
                Ok(self.node(Tag::FuncType, span, vec![Slot::List(params), ret]))
            }
            Token::LBracket => {
                self.advance();
                let len = self.parse_expr()?;
                self.expect(Token::RBracket, "']'")?;
                let subtype = self.parse_type_expr()?;
                let span = span.merge(&subtype.borrow().span);
                Ok(self.node(
                    Tag::ArrayType,
                    span,
                    vec![Slot::Node(len), Slot::Node(subtype)],
                ))
            }
            Token::Record => {
                self.advance();
                let fields = self.parse_field_list()?;
                let span = span.merge(&self.current_span());
                Ok(self.node(Tag::RecordType, span, vec![Slot::List(fields)]))
            }
            Token::Union => {
                self.advance();
                let fields = self.parse_field_list()?;
                let span = span.merge(&self.current_span());
                Ok(self.node(Tag::UnionType, span, vec![Slot::List(fields)]))
            }
            Token::Enum => {
                self.advance();
                let subtype = if self.eat(&Token::LParen) {
                    let ty = self.parse_type_expr()?;
                    self.expect(Token::RParen, "')'")?;
                    Slot::Node(ty)
                } else {
                    Slot::Nil
                };
                self.expect(Token::LBrace, "'{'")?;
                let mut fields = Vec::new();
                while !self.check(&Token::RBrace) {
                    let field_span = self.current_span();
                    let name = self.expect_name()?;
                    let value = if self.eat(&Token::Assign) {
                        Slot::Node(self.parse_expr()?)
                    } else {
                        Slot::Nil
                    };
                    fields.push(self.node(
                        Tag::EnumField,
                        field_span,
                        vec![Slot::Str(name), value],
                    ));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let end = self.expect(Token::RBrace, "'}'")?;
                Ok(self.node(
                    Tag::EnumType,
                    span.merge(&end),
                    vec![subtype, Slot::List(fields)],
                ))
            }
            Token::Ident(name) => {
                self.advance();
                Ok(self.node(Tag::Id, span, vec![Slot::Str(name)]))
            }
            _ => Err(self.unexpected("type expression")),
        }
    }

    fn parse_field_list(&mut self) -> ParseResult<Vec<NodeRef>> {
        self.expect(Token::LBrace, "'{'")?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let span = self.current_span();
            let name = self.expect_name()?;
            self.expect(Token::Colon, "':'")?;
            let ty = self.parse_type_expr()?;
            fields.push(self.node(
                Tag::RecordField,
                span,
                vec![Slot::Str(name), Slot::Node(ty)],
            ));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace, "'}'")?;
        Ok(fields)
    }

    // ========================================================================
    // Preprocess fragment re-parsing
    // ========================================================================

    fn subparse_block(&mut self, text: &str, offset: usize) -> ParseResult<NodeRef> {
        let tokens = Lexer::with_offset(text, offset).tokenize()?;
        let mut parser = Parser::new(tokens, self.builder.clone());
        parser.parse_chunk()
    }

    fn subparse_expr(&mut self, text: &str, offset: usize) -> ParseResult<NodeRef> {
        let tokens = Lexer::with_offset(text, offset).tokenize()?;
        let mut parser = Parser::new(tokens, self.builder.clone());
        let expr = parser.parse_expr()?;
        if !parser.check(&Token::Eof) {
            return Err(parser.unexpected("end of preprocess expression"));
        }
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::dump;

    fn parse(src: &str) -> NodeRef {
        let builder = AstBuilder::new();
        parse_source(src, &builder).expect("parse failure")
    }

    #[test]
    fn test_hello_world_shape() {
        let root = parse("print \"hello world\"");
        let text = dump(&root);
        assert!(text.starts_with("Block {"));
        assert!(text.contains("Call {"));
        assert!(text.contains("String {"));
        assert!(text.contains("\"hello world\""));
        assert!(text.contains("Id {"));
        assert!(text.contains("\"print\""));
    }

    #[test]
    fn test_local_with_type_annotation() {
        let root = parse("local a: int64 = 1");
        let text = dump(&root);
        assert!(text.contains("LocalDecl {"));
        assert!(text.contains("IdDecl {"));
        assert!(text.contains("\"int64\""));
    }

    #[test]
    fn test_operator_precedence() {
        let root = parse("local a = 1 + 2 * 3");
        let stmts = root.borrow().slot_list(0);
        let decl = stmts[0].borrow();
        let value = decl.slot_node(1).expect("init value");
        // `+` at the top, `*` nested on the right
        assert_eq!(value.borrow().slot_str(0).unwrap(), "add");
        let rhs = value.borrow().slot_node(2).unwrap();
        assert_eq!(rhs.borrow().slot_str(0).unwrap(), "mul");
    }

    #[test]
    fn test_if_elseif_else() {
        let root = parse("if a then f() elseif b then g() else h() end");
        let stmts = root.borrow().slot_list(0);
        let ifnode = stmts[0].borrow();
        assert_eq!(ifnode.tag, Tag::If);
        assert_eq!(ifnode.slot_list(0).len(), 2);
        assert!(ifnode.slot_node(1).is_some());
    }

    #[test]
    fn test_function_definition() {
        let root = parse("local function add(a: int64, b: int64): int64 return a + b end");
        let stmts = root.borrow().slot_list(0);
        let f = stmts[0].borrow();
        assert_eq!(f.tag, Tag::FuncDef);
        assert_eq!(f.slot_str(1).unwrap(), "add");
        assert_eq!(f.slot_list(2).len(), 2);
    }

    #[test]
    fn test_preprocess_statement() {
        let root = parse("## staticassert(true)");
        let stmts = root.borrow().slot_list(0);
        assert_eq!(stmts[0].borrow().tag, Tag::Preprocess);
    }

    #[test]
    fn test_preprocess_expr_splice() {
        let root = parse("local a = #[40 + 2]#");
        let stmts = root.borrow().slot_list(0);
        let decl = stmts[0].borrow();
        let value = decl.slot_node(1).unwrap();
        assert_eq!(value.borrow().tag, Tag::PreprocessExpr);
    }

    #[test]
    fn test_record_type() {
        let root = parse("local p: record{x: int64, y: int64}");
        let text = dump(&root);
        assert!(text.contains("RecordType {"));
        assert!(text.contains("RecordField {"));
    }

    #[test]
    fn test_pointer_and_array_types() {
        let root = parse("local p: *int64\nlocal a: [4]int64");
        let text = dump(&root);
        assert!(text.contains("PointerType {"));
        assert!(text.contains("ArrayType {"));
    }

    #[test]
    fn test_function_type_annotation() {
        let root = parse("local cb: function(int64, stringview): boolean");
        let text = dump(&root);
        assert!(text.contains("FuncType {"));
        assert!(text.contains("\"int64\""));
        assert!(text.contains("\"boolean\""));
    }

    #[test]
    fn test_assignment_and_index() {
        let root = parse("a[1] = b.c");
        let stmts = root.borrow().slot_list(0);
        let assign = stmts[0].borrow();
        assert_eq!(assign.tag, Tag::Assign);
        assert_eq!(assign.slot_node(0).unwrap().borrow().tag, Tag::KeyIndex);
        assert_eq!(assign.slot_node(1).unwrap().borrow().tag, Tag::DotIndex);
    }

    #[test]
    fn test_bad_statement_is_rejected() {
        let builder = AstBuilder::new();
        assert!(parse_source("local = 1", &builder).is_err());
        assert!(parse_source("1 + 2", &builder).is_err());
    }

    #[test]
    fn test_for_numeric() {
        let root = parse("for i = 1, 10, 2 do print(i) end");
        let stmts = root.borrow().slot_list(0);
        let f = stmts[0].borrow();
        assert_eq!(f.tag, Tag::ForNum);
        assert!(f.slot_node(3).is_some());
    }
}
