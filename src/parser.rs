use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind};

/// Parse output: the statement list plus the metadata the renderer needs
/// for inheritance, extracted in this single pass.
#[derive(Debug, Clone)]
pub struct ParsedTemplate {
    pub stmts: Vec<Stmt>,
    pub extends: Option<String>,
    /// Flat index of every block declaration in the template, nested ones
    /// included, so overrides resolve without re-walking the tree.
    pub blocks: HashMap<String, Arc<BlockDecl>>,
}

pub fn parse(tokens: Vec<Token>) -> Result<ParsedTemplate> {
    let mut parser = Parser::new(tokens);
    let stmts = parser.parse_statements(&[])?;
    // parse_statements only stops early at a stop keyword, which the empty
    // stop set rules out, or at Eof.
    match parser.peek(0) {
        TokenKind::Eof => {}
        other => {
            let token = parser.peek_token(0);
            return Err(Error::parse(
                format!("unexpected {}", describe(other)),
                token.line,
                token.column,
            ));
        }
    }
    Ok(ParsedTemplate {
        stmts,
        extends: parser.extends,
        blocks: parser.blocks,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    extends: Option<String>,
    blocks: HashMap<String, Arc<BlockDecl>>,
    /// Nesting depth of compound-statement bodies; extends is only legal
    /// at depth zero.
    depth: usize,
    /// For-loop nesting; break/continue outside any loop is rejected here
    /// rather than at render time. Macro and call-block bodies reset it.
    loop_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            extends: None,
            blocks: HashMap::new(),
            depth: 0,
            loop_depth: 0,
        }
    }

    fn peek_token(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn peek(&self, n: usize) -> &TokenKind {
        &self.peek_token(n).kind
    }

    fn here(&self) -> Span {
        self.peek_token(0).span()
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn err_here(&self, message: impl Into<String>) -> Error {
        let token = self.peek_token(0);
        Error::parse(message.into(), token.line, token.column)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.peek(0) == &kind {
            Ok(self.advance())
        } else {
            Err(self.err_here(format!("expected {what}, got {}", describe(self.peek(0)))))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek(0).clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.err_here(format!("expected {what}, got {}", describe(&other)))),
        }
    }

    fn expect_block_end(&mut self) -> Result<()> {
        self.expect(TokenKind::BlockEnd, "end of tag")?;
        Ok(())
    }

    /// Consume an ident with the given spelling (soft keywords such as
    /// `scoped`, `context`, `missing`).
    fn eat_soft_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(0), TokenKind::Ident(s) if s == word) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Parse statements until Eof or until the next `{%` is followed by
    /// one of the stop keywords. The stop tag itself is not consumed.
    fn parse_statements(&mut self, stop: &[TokenKind]) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            if self.peek(0) == &TokenKind::BlockStart && stop.contains(self.peek(1)) {
                break;
            }
            match self.peek(0).clone() {
                TokenKind::Eof => break,
                TokenKind::Text(text) => {
                    let span = self.here();
                    self.advance();
                    stmts.push(Stmt::new(StmtKind::Text(text), span));
                }
                TokenKind::VariableStart => {
                    let span = self.here();
                    self.advance();
                    let expr = self.parse_expr()?;
                    self.expect(TokenKind::VariableEnd, "end of expression")?;
                    stmts.push(Stmt::new(StmtKind::Output(expr), span));
                }
                TokenKind::BlockStart => {
                    stmts.push(self.parse_block_statement()?);
                }
                other => {
                    return Err(self.err_here(format!("unexpected {}", describe(&other))));
                }
            }
        }
        Ok(stmts)
    }

    /// Parse a nested statement-list body, tracking compound nesting depth.
    fn parse_body(&mut self, stop: &[TokenKind]) -> Result<Vec<Stmt>> {
        self.depth += 1;
        let body = self.parse_statements(stop);
        self.depth -= 1;
        body
    }

    fn parse_block_statement(&mut self) -> Result<Stmt> {
        let span = self.here();
        self.advance(); // {%
        match self.peek(0).clone() {
            TokenKind::If => self.parse_if(span),
            TokenKind::For => self.parse_for(span),
            TokenKind::Block => self.parse_block_decl(span),
            TokenKind::Extends => self.parse_extends(span),
            TokenKind::Include => self.parse_include(span),
            TokenKind::Set => self.parse_set(span),
            TokenKind::Macro => self.parse_macro(span),
            TokenKind::Call => self.parse_call_block(span),
            TokenKind::With => self.parse_with(span),
            TokenKind::Autoescape => self.parse_autoescape(span),
            TokenKind::Break => {
                if self.loop_depth == 0 {
                    return Err(self.err_here("'break' outside of a loop"));
                }
                self.advance();
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Break, span))
            }
            TokenKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.err_here("'continue' outside of a loop"));
                }
                self.advance();
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Continue, span))
            }
            other => Err(self.err_here(format!(
                "unexpected {} at start of tag",
                describe(&other)
            ))),
        }
    }

    /// Consume `{% keyword %}` where the current position is at `{%`.
    fn consume_end_tag(&mut self, keyword: TokenKind, what: &str) -> Result<()> {
        self.expect(TokenKind::BlockStart, what)?;
        self.expect(keyword, what)?;
        self.expect_block_end()
    }

    fn parse_if(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // if
        let condition = self.parse_expr()?;
        self.expect_block_end()?;
        let body = self.parse_body(&[TokenKind::Elif, TokenKind::Else, TokenKind::EndIf])?;
        let mut arms = vec![(condition, body)];
        let mut else_body = None;
        loop {
            self.expect(TokenKind::BlockStart, "elif, else, or endif")?;
            match self.peek(0).clone() {
                TokenKind::Elif => {
                    self.advance();
                    let condition = self.parse_expr()?;
                    self.expect_block_end()?;
                    let body =
                        self.parse_body(&[TokenKind::Elif, TokenKind::Else, TokenKind::EndIf])?;
                    arms.push((condition, body));
                }
                TokenKind::Else => {
                    self.advance();
                    self.expect_block_end()?;
                    else_body = Some(self.parse_body(&[TokenKind::EndIf])?);
                    self.expect(TokenKind::BlockStart, "endif")?;
                    self.expect(TokenKind::EndIf, "endif")?;
                    self.expect_block_end()?;
                    break;
                }
                TokenKind::EndIf => {
                    self.advance();
                    self.expect_block_end()?;
                    break;
                }
                other => {
                    return Err(self.err_here(format!(
                        "expected elif, else, or endif, got {}",
                        describe(&other)
                    )));
                }
            }
        }
        Ok(Stmt::new(StmtKind::If { arms, else_body }, span))
    }

    fn parse_for(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // for
        // `for (k, v) in ...` is the parenthesized spelling of the same
        // target list.
        let parenthesized = if self.peek(0) == &TokenKind::LParen {
            self.advance();
            true
        } else {
            false
        };
        let mut targets = vec![self.expect_ident("loop target")?];
        while self.peek(0) == &TokenKind::Comma {
            self.advance();
            if parenthesized && self.peek(0) == &TokenKind::RParen {
                break;
            }
            targets.push(self.expect_ident("loop target")?);
        }
        if parenthesized {
            self.expect(TokenKind::RParen, "')'")?;
        }
        self.expect(TokenKind::In, "'in'")?;
        // The iterable and the optional inline filter both parse at the
        // or-level so loop-filter syntax never collides with ternaries.
        let iter = self.parse_or()?;
        let filter = if self.peek(0) == &TokenKind::If {
            self.advance();
            Some(self.parse_or()?)
        } else {
            None
        };
        let recursive = if self.peek(0) == &TokenKind::Recursive {
            self.advance();
            true
        } else {
            false
        };
        self.expect_block_end()?;

        self.loop_depth += 1;
        let body = self.parse_body(&[TokenKind::Else, TokenKind::EndFor]);
        self.loop_depth -= 1;
        let body = body?;

        let mut else_body = None;
        self.expect(TokenKind::BlockStart, "else or endfor")?;
        match self.peek(0).clone() {
            TokenKind::Else => {
                self.advance();
                self.expect_block_end()?;
                else_body = Some(self.parse_body(&[TokenKind::EndFor])?);
                self.expect(TokenKind::BlockStart, "endfor")?;
                self.expect(TokenKind::EndFor, "endfor")?;
                self.expect_block_end()?;
            }
            TokenKind::EndFor => {
                self.advance();
                self.expect_block_end()?;
            }
            other => {
                return Err(self.err_here(format!(
                    "expected else or endfor, got {}",
                    describe(&other)
                )));
            }
        }
        Ok(Stmt::new(
            StmtKind::For {
                targets,
                iter,
                filter,
                recursive,
                body,
                else_body,
            },
            span,
        ))
    }

    fn parse_block_decl(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // block
        let name = self.expect_ident("block name")?;
        let scoped = self.eat_soft_keyword("scoped");
        self.expect_block_end()?;
        let body = self.parse_body(&[TokenKind::EndBlock])?;
        self.expect(TokenKind::BlockStart, "endblock")?;
        self.expect(TokenKind::EndBlock, "endblock")?;
        // `{% endblock name %}` is legal; a mismatched name is not.
        if let TokenKind::Ident(end_name) = self.peek(0).clone() {
            if end_name != name {
                return Err(self.err_here(format!(
                    "mismatched block name: expected {name:?}, got {end_name:?}"
                )));
            }
            self.advance();
        }
        self.expect_block_end()?;

        let decl = Arc::new(BlockDecl { name, scoped, body });
        if self
            .blocks
            .insert(decl.name.clone(), Arc::clone(&decl))
            .is_some()
        {
            return Err(Error::parse(
                format!("duplicate block name {:?}", decl.name),
                span.line,
                span.column,
            ));
        }
        Ok(Stmt::new(StmtKind::Block(decl), span))
    }

    fn parse_extends(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // extends
        if self.depth != 0 {
            return Err(Error::parse(
                "extends must be a top-level statement",
                span.line,
                span.column,
            ));
        }
        if self.extends.is_some() {
            return Err(Error::parse(
                "template already extends another template",
                span.line,
                span.column,
            ));
        }
        let name = match self.peek(0).clone() {
            TokenKind::Str(name) => {
                self.advance();
                name
            }
            other => {
                return Err(self.err_here(format!(
                    "expected template name string, got {}",
                    describe(&other)
                )));
            }
        };
        self.expect_block_end()?;
        self.extends = Some(name.clone());
        Ok(Stmt::new(StmtKind::Extends { name }, span))
    }

    fn parse_include(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // include
        let name = self.parse_expr()?;
        let mut ignore_missing = false;
        let mut with_context = true;
        loop {
            if self.eat_soft_keyword("ignore") {
                if !self.eat_soft_keyword("missing") {
                    return Err(self.err_here("expected 'missing' after 'ignore'"));
                }
                ignore_missing = true;
            } else if self.peek(0) == &TokenKind::With {
                self.advance();
                if !self.eat_soft_keyword("context") {
                    return Err(self.err_here("expected 'context' after 'with'"));
                }
                with_context = true;
            } else if self.eat_soft_keyword("without") {
                if !self.eat_soft_keyword("context") {
                    return Err(self.err_here("expected 'context' after 'without'"));
                }
                with_context = false;
            } else {
                break;
            }
        }
        self.expect_block_end()?;
        Ok(Stmt::new(
            StmtKind::Include {
                name,
                with_context,
                ignore_missing,
            },
            span,
        ))
    }

    fn parse_set(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // set
        let mut targets = vec![self.expect_ident("assignment target")?];
        while self.peek(0) == &TokenKind::Comma {
            self.advance();
            targets.push(self.expect_ident("assignment target")?);
        }
        if self.peek(0) == &TokenKind::Assign {
            self.advance();
            let value = self.parse_expr()?;
            self.expect_block_end()?;
            return Ok(Stmt::new(StmtKind::Set { targets, value }, span));
        }
        // Body-capture form: {% set x %}...{% endset %}
        if targets.len() != 1 {
            return Err(self.err_here("block-form set takes exactly one target"));
        }
        self.expect_block_end()?;
        let body = self.parse_body(&[TokenKind::EndSet])?;
        self.consume_end_tag(TokenKind::EndSet, "endset")?;
        Ok(Stmt::new(
            StmtKind::SetBlock {
                name: targets.into_iter().next().unwrap(),
                body,
            },
            span,
        ))
    }

    fn parse_macro(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // macro
        let name = self.expect_ident("macro name")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while self.peek(0) != &TokenKind::RParen {
            let param = self.expect_ident("parameter name")?;
            let default = if self.peek(0) == &TokenKind::Assign {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(MacroParam {
                name: param,
                default,
            });
            if self.peek(0) == &TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.expect_block_end()?;

        // Macro bodies are their own loop scope for break/continue.
        let saved = std::mem::replace(&mut self.loop_depth, 0);
        let body = self.parse_body(&[TokenKind::EndMacro]);
        self.loop_depth = saved;
        let body = body?;
        self.consume_end_tag(TokenKind::EndMacro, "endmacro")?;

        Ok(Stmt::new(
            StmtKind::Macro(Arc::new(MacroDecl { name, params, body })),
            span,
        ))
    }

    fn parse_call_block(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // call
        let call = self.parse_expr()?;
        if !matches!(call.kind, ExprKind::Call { .. }) {
            return Err(Error::parse(
                "expected a macro invocation after 'call'",
                call.span.line,
                call.span.column,
            ));
        }
        self.expect_block_end()?;
        let saved = std::mem::replace(&mut self.loop_depth, 0);
        let body = self.parse_body(&[TokenKind::EndCall]);
        self.loop_depth = saved;
        let body = body?;
        self.consume_end_tag(TokenKind::EndCall, "endcall")?;
        Ok(Stmt::new(
            StmtKind::CallBlock {
                call,
                body: Arc::new(body),
            },
            span,
        ))
    }

    fn parse_with(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // with
        let mut bindings = Vec::new();
        while matches!(self.peek(0), TokenKind::Ident(_)) {
            let name = self.expect_ident("binding name")?;
            self.expect(TokenKind::Assign, "'='")?;
            let value = self.parse_expr()?;
            bindings.push((name, value));
            if self.peek(0) == &TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_block_end()?;
        let body = self.parse_body(&[TokenKind::EndWith])?;
        self.consume_end_tag(TokenKind::EndWith, "endwith")?;
        Ok(Stmt::new(StmtKind::With { bindings, body }, span))
    }

    fn parse_autoescape(&mut self, span: Span) -> Result<Stmt> {
        self.advance(); // autoescape
        let enabled = match self.peek(0) {
            TokenKind::True => true,
            TokenKind::False => false,
            other => {
                return Err(self.err_here(format!(
                    "expected true or false, got {}",
                    describe(other)
                )));
            }
        };
        self.advance();
        self.expect_block_end()?;
        let body = self.parse_body(&[TokenKind::EndAutoescape])?;
        self.consume_end_tag(TokenKind::EndAutoescape, "endautoescape")?;
        Ok(Stmt::new(StmtKind::Autoescape { enabled, body }, span))
    }

    // ── Expressions, precedence low to high ──

    pub(crate) fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_cond()
    }

    fn parse_cond(&mut self) -> Result<Expr> {
        let then = self.parse_or()?;
        if self.peek(0) != &TokenKind::If {
            return Ok(then);
        }
        let span = then.span;
        self.advance();
        let test = self.parse_or()?;
        let otherwise = if self.peek(0) == &TokenKind::Else {
            self.advance();
            // Right-associative via recursion into the full conditional.
            Some(Box::new(self.parse_cond()?))
        } else {
            None
        };
        Ok(Expr::new(
            ExprKind::Cond {
                then: Box::new(then),
                test: Box::new(test),
                otherwise,
            },
            span,
        ))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek(0) == &TokenKind::Or {
            self.advance();
            let right = self.parse_and()?;
            let span = left.span;
            left = Expr::new(
                ExprKind::BinOp {
                    op: BinOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek(0) == &TokenKind::And {
            self.advance();
            let right = self.parse_not()?;
            let span = left.span;
            left = Expr::new(
                ExprKind::BinOp {
                    op: BinOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek(0) == &TokenKind::Not {
            let span = self.here();
            self.advance();
            let expr = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let first = self.parse_membership()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek(0) {
                TokenKind::Eq => CmpOp::Eq,
                TokenKind::Ne => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                _ => break,
            };
            self.advance();
            rest.push((op, self.parse_membership()?));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        let span = first.span;
        Ok(Expr::new(
            ExprKind::Compare {
                first: Box::new(first),
                rest,
            },
            span,
        ))
    }

    fn parse_membership(&mut self) -> Result<Expr> {
        let mut expr = self.parse_concat()?;
        loop {
            match self.peek(0) {
                TokenKind::In => {
                    self.advance();
                    let right = self.parse_concat()?;
                    let span = expr.span;
                    expr = Expr::new(
                        ExprKind::BinOp {
                            op: BinOp::In,
                            left: Box::new(expr),
                            right: Box::new(right),
                        },
                        span,
                    );
                }
                // `not in` needs one token of lookahead: a bare `not` here
                // belongs to the enclosing logical-not level.
                TokenKind::Not if self.peek(1) == &TokenKind::In => {
                    self.advance();
                    self.advance();
                    let right = self.parse_concat()?;
                    let span = expr.span;
                    expr = Expr::new(
                        ExprKind::BinOp {
                            op: BinOp::NotIn,
                            left: Box::new(expr),
                            right: Box::new(right),
                        },
                        span,
                    );
                }
                TokenKind::Is => {
                    self.advance();
                    let negated = if self.peek(0) == &TokenKind::Not {
                        self.advance();
                        true
                    } else {
                        false
                    };
                    let name = self.parse_test_name()?;
                    let args = if self.peek(0) == &TokenKind::LParen {
                        self.advance();
                        let (args, kwargs) = self.parse_call_args()?;
                        if let Some((kwarg, _)) = kwargs.first() {
                            return Err(
                                self.err_here(format!("tests take no keyword arguments ({kwarg})"))
                            );
                        }
                        args
                    } else {
                        Vec::new()
                    };
                    let span = expr.span;
                    expr = Expr::new(
                        ExprKind::Test {
                            base: Box::new(expr),
                            name,
                            args,
                            negated,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Test names are mostly idents, but `true`/`false`/`none`/`in` are
    /// keywords that remain legal as test names.
    fn parse_test_name(&mut self) -> Result<String> {
        let name = match self.peek(0).clone() {
            TokenKind::Ident(name) => name,
            TokenKind::True => "true".to_string(),
            TokenKind::False => "false".to_string(),
            TokenKind::None => "none".to_string(),
            TokenKind::In => "in".to_string(),
            other => {
                return Err(self.err_here(format!("expected test name, got {}", describe(&other))));
            }
        };
        self.advance();
        Ok(name)
    }

    fn parse_concat(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        while self.peek(0) == &TokenKind::Tilde {
            self.advance();
            let right = self.parse_additive()?;
            let span = left.span;
            left = Expr::new(
                ExprKind::BinOp {
                    op: BinOp::Concat,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek(0) {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            let span = left.span;
            left = Expr::new(
                ExprKind::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek(0) {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::FloorDiv => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            let span = left.span;
            left = Expr::new(
                ExprKind::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr> {
        let base = self.parse_postfix()?;
        if self.peek(0) == &TokenKind::Pow {
            self.advance();
            // Right-associative; the exponent re-admits unary so `2 ** -1`
            // parses without parentheses.
            let exponent = self.parse_unary()?;
            let span = base.span;
            return Ok(Expr::new(
                ExprKind::BinOp {
                    op: BinOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
                span,
            ));
        }
        Ok(base)
    }

    /// Unary minus/plus bind tighter than the filter pipe: `-3 | abs`
    /// filters the negated value. The filter chain attaches outside the
    /// unary node, never inside its operand.
    fn parse_unary(&mut self) -> Result<Expr> {
        let expr = self.parse_unary_operand()?;
        self.parse_filter_chain(expr)
    }

    fn parse_unary_operand(&mut self) -> Result<Expr> {
        let op = match self.peek(0) {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_pow(),
        };
        let span = self.here();
        self.advance();
        let expr = self.parse_unary_operand()?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
            span,
        ))
    }

    fn parse_filter_chain(&mut self, mut expr: Expr) -> Result<Expr> {
        while self.peek(0) == &TokenKind::Pipe {
            self.advance();
            let name = self.expect_ident("filter name")?;
            let (args, kwargs) = if self.peek(0) == &TokenKind::LParen {
                self.advance();
                self.parse_call_args()?
            } else {
                (Vec::new(), Vec::new())
            };
            let span = expr.span;
            expr = Expr::new(
                ExprKind::Filter {
                    base: Box::new(expr),
                    name,
                    args,
                    kwargs,
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek(0) {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_ident("attribute name")?;
                    let span = expr.span;
                    expr = Expr::new(
                        ExprKind::Attr {
                            base: Box::new(expr),
                            name,
                        },
                        span,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    let span = expr.span;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                TokenKind::LParen => {
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    let span = expr.span;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                            kwargs,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Arguments up to and including the closing paren. `name =` lookahead
    /// distinguishes keyword arguments from positional expressions.
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        loop {
            if self.peek(0) == &TokenKind::RParen {
                self.advance();
                return Ok((args, kwargs));
            }
            if matches!(self.peek(0), TokenKind::Ident(_)) && self.peek(1) == &TokenKind::Assign {
                let name = self.expect_ident("keyword argument name")?;
                self.advance(); // =
                kwargs.push((name, self.parse_expr()?));
            } else {
                args.push(self.parse_expr()?);
            }
            if self.peek(0) == &TokenKind::Comma {
                self.advance();
            } else {
                self.expect(TokenKind::RParen, "')'")?;
                return Ok((args, kwargs));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.here();
        match self.peek(0).clone() {
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(s), span))
            }
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(n), span))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(f), span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            TokenKind::None => {
                self.advance();
                Ok(Expr::new(ExprKind::None, span))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Name(name), span))
            }
            TokenKind::LParen => {
                self.advance();
                let first = self.parse_expr()?;
                if self.peek(0) == &TokenKind::Comma {
                    // One or more commas make this a tuple literal.
                    let mut items = vec![first];
                    while self.peek(0) == &TokenKind::Comma {
                        self.advance();
                        if self.peek(0) == &TokenKind::RParen {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    Ok(Expr::new(ExprKind::Tuple(items), span))
                } else {
                    // No comma: a grouped expression, unwrapped.
                    self.expect(TokenKind::RParen, "')'")?;
                    Ok(first)
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while self.peek(0) != &TokenKind::RBracket {
                    items.push(self.parse_expr()?);
                    if self.peek(0) == &TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Expr::new(ExprKind::List(items), span))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while self.peek(0) != &TokenKind::RBrace {
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::Colon, "':'")?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if self.peek(0) == &TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "'}'")?;
                Ok(Expr::new(ExprKind::Dict(entries), span))
            }
            other => Err(self.err_here(format!("expected expression, got {}", describe(&other)))),
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Text(_) => "text".to_string(),
        TokenKind::VariableStart => "'{{'".to_string(),
        TokenKind::VariableEnd => "'}}'".to_string(),
        TokenKind::BlockStart => "'{%'".to_string(),
        TokenKind::BlockEnd => "'%}'".to_string(),
        TokenKind::Ident(name) => format!("identifier {name:?}"),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Int(_) => "integer literal".to_string(),
        TokenKind::Float(_) => "float literal".to_string(),
        TokenKind::Eof => "end of template".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{tokenize, LexerOptions};

    fn parse_src(src: &str) -> Result<ParsedTemplate> {
        parse(tokenize(src, &LexerOptions::default())?)
    }

    #[test]
    fn loop_filter_does_not_collide_with_ternary() {
        let parsed = parse_src("{% for x in items if x > 1 %}{{ x }}{% endfor %}").unwrap();
        let StmtKind::For { filter, .. } = &parsed.stmts[0].kind else {
            panic!("expected for loop");
        };
        assert!(filter.is_some());
    }

    #[test]
    fn parenthesized_expression_unwraps_without_comma() {
        let parsed = parse_src("{{ (1) }}").unwrap();
        let StmtKind::Output(expr) = &parsed.stmts[0].kind else {
            panic!();
        };
        assert_eq!(expr.kind, ExprKind::Int(1));
    }

    #[test]
    fn trailing_comma_makes_a_tuple() {
        let parsed = parse_src("{{ (1,) }}").unwrap();
        let StmtKind::Output(expr) = &parsed.stmts[0].kind else {
            panic!();
        };
        assert!(matches!(&expr.kind, ExprKind::Tuple(items) if items.len() == 1));
    }

    #[test]
    fn endblock_name_must_match() {
        assert!(parse_src("{% block a %}{% endblock a %}").is_ok());
        let err = parse_src("{% block a %}{% endblock b %}").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn duplicate_block_names_are_rejected() {
        let err = parse_src("{% block a %}{% endblock %}{% block a %}{% endblock %}").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn blocks_are_indexed_even_when_nested() {
        let parsed =
            parse_src("{% if true %}{% block inner %}{% endblock %}{% endif %}").unwrap();
        assert!(parsed.blocks.contains_key("inner"));
    }

    #[test]
    fn extends_must_be_top_level() {
        assert!(parse_src("{% extends 'base' %}").is_ok());
        let err = parse_src("{% if true %}{% extends 'base' %}{% endif %}").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn set_forms_disambiguate_on_assign() {
        let parsed = parse_src("{% set x = 1 %}").unwrap();
        assert!(matches!(parsed.stmts[0].kind, StmtKind::Set { .. }));
        let parsed = parse_src("{% set x %}body{% endset %}").unwrap();
        assert!(matches!(parsed.stmts[0].kind, StmtKind::SetBlock { .. }));
    }

    #[test]
    fn break_outside_loop_is_a_parse_error() {
        assert!(parse_src("{% break %}").is_err());
        assert!(parse_src("{% for x in items %}{% break %}{% endfor %}").is_ok());
        // A macro body does not inherit the enclosing loop.
        assert!(
            parse_src("{% for x in items %}{% macro m() %}{% break %}{% endmacro %}{% endfor %}")
                .is_err()
        );
    }

    #[test]
    fn chained_comparison_builds_one_node() {
        let parsed = parse_src("{{ 1 < 2 < 3 }}").unwrap();
        let StmtKind::Output(expr) = &parsed.stmts[0].kind else {
            panic!();
        };
        assert!(matches!(&expr.kind, ExprKind::Compare { rest, .. } if rest.len() == 2));
    }

    #[test]
    fn not_in_is_one_operator() {
        let parsed = parse_src("{{ 1 not in [1, 2] }}").unwrap();
        let StmtKind::Output(expr) = &parsed.stmts[0].kind else {
            panic!();
        };
        assert!(matches!(
            &expr.kind,
            ExprKind::BinOp {
                op: BinOp::NotIn,
                ..
            }
        ));
    }

    #[test]
    fn is_test_allows_keyword_names() {
        let parsed = parse_src("{{ x is none }}").unwrap();
        let StmtKind::Output(expr) = &parsed.stmts[0].kind else {
            panic!();
        };
        assert!(matches!(&expr.kind, ExprKind::Test { name, .. } if name == "none"));
    }

    #[test]
    fn postfix_chain_is_left_to_right() {
        let parsed = parse_src("{{ a.b[0] | c | d(1) }}").unwrap();
        let StmtKind::Output(expr) = &parsed.stmts[0].kind else {
            panic!();
        };
        let ExprKind::Filter { name, args, .. } = &expr.kind else {
            panic!("outermost node should be the last filter");
        };
        assert_eq!(name, "d");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn missing_end_tags_error_with_location() {
        let err = parse_src("{% if true %}no end").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        let err = parse_src("{% for x in items %}").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
