#![forbid(unsafe_code)]

use std::mem;

use shadow_ast::{
    span_between, AssignStmt, BinOp, Block, CType, DeclStmt, Expr, ExprKind, FunctionDef, Ident,
    IfStmt, Item, Param, Program, Prototype, ReturnStmt, Span, Stmt, UnaryOp, WhileStmt,
};
use shadow_lex::{Token, TokenKind};

use crate::error::ParseError;

pub struct Parser<'a> {
    tokens: &'a [Token],
    idx: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, idx: 0 }
    }

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut items = Vec::new();
        while !self.at(TokenKind::Eof) {
            if self.at(TokenKind::KwTypedef) {
                self.skip_declaration()?;
                continue;
            }
            if self.at(TokenKind::Semi) {
                self.next();
                continue;
            }
            items.push(self.parse_item()?);
        }
        Ok(Program { items })
    }

    /// Parse a single expression that must consume the whole token stream.
    pub fn parse_standalone_expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if !self.at(TokenKind::Eof) {
            return Err(ParseError {
                message: format!(
                    "unexpected {} after expression",
                    self.peek_kind().map(TokenKind::describe).unwrap_or_default()
                ),
                span: self.here(),
            });
        }
        Ok(expr)
    }

    fn parse_item(&mut self) -> Result<Item, ParseError> {
        let start = self.here();
        let is_extern = if self.at(TokenKind::KwExtern) {
            self.next();
            true
        } else {
            false
        };
        let ret = self.parse_type()?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let params = self.parse_params()?;
        self.expect(TokenKind::RParen)?;

        if self.at(TokenKind::LBrace) {
            if is_extern {
                return Err(ParseError {
                    message: "extern declarations cannot have a body".to_string(),
                    span: self.here(),
                });
            }
            let body = self.parse_block()?;
            return Ok(Item::Function(FunctionDef {
                span: join(start, body.span),
                ret,
                name,
                params: params.unwrap_or_default(),
                body,
            }));
        }

        let attributes = self.parse_attribute()?;
        let semi = self.expect(TokenKind::Semi)?;
        Ok(Item::Prototype(Prototype {
            span: join(start, semi.span),
            is_extern,
            ret,
            name,
            params,
            attributes,
        }))
    }

    /// `()` yields `None`, `(void)` yields an empty list.
    fn parse_params(&mut self) -> Result<Option<Vec<Param>>, ParseError> {
        if self.at(TokenKind::RParen) {
            return Ok(None);
        }
        if self.at(TokenKind::KwVoid) && matches!(self.peek_kind_n(1), Some(TokenKind::RParen)) {
            self.next();
            return Ok(Some(Vec::new()));
        }

        let mut params = Vec::new();
        loop {
            let start = self.here();
            let ty = self.parse_type()?;
            let name = match self.peek_kind() {
                Some(TokenKind::Ident(_)) => Some(self.expect_ident()?),
                _ => None,
            };
            let mut end = name.as_ref().map(|n| n.span).unwrap_or(start);
            let is_array = if self.at(TokenKind::LBracket) {
                self.next();
                end = self.expect(TokenKind::RBracket)?.span;
                true
            } else {
                false
            };
            params.push(Param {
                span: join(start, end),
                ty,
                name,
                is_array,
            });
            if self.at(TokenKind::Comma) {
                self.next();
                continue;
            }
            break;
        }
        Ok(Some(params))
    }

    /// Keeps the parenthesised payload of `__attribute__ ((...))` as text.
    fn parse_attribute(&mut self) -> Result<Option<String>, ParseError> {
        let is_attr = matches!(self.peek_kind(), Some(TokenKind::Ident(s)) if s == "__attribute__");
        if !is_attr {
            return Ok(None);
        }
        self.next();
        let open = self.expect(TokenKind::LParen)?;
        let mut depth = 1usize;
        let mut text = String::from("(");
        while depth > 0 {
            let tok = self.expect_any()?;
            match &tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                TokenKind::Eof => {
                    return Err(ParseError {
                        message: "unterminated __attribute__".to_string(),
                        span: open.span,
                    });
                }
                _ => {}
            }
            text.push_str(&token_text(&tok.kind));
        }
        Ok(Some(text))
    }

    fn skip_declaration(&mut self) -> Result<(), ParseError> {
        let start = self.here();
        let mut depth = 0usize;
        loop {
            let tok = self.expect_any()?;
            match tok.kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth = depth.saturating_sub(1),
                TokenKind::Semi if depth == 0 => return Ok(()),
                TokenKind::Eof => {
                    return Err(ParseError {
                        message: "unterminated declaration".to_string(),
                        span: start,
                    });
                }
                _ => {}
            }
        }
    }

    fn parse_type(&mut self) -> Result<CType, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::KwInt => Ok(CType::Int),
            TokenKind::KwFloat => Ok(CType::Float),
            TokenKind::KwDouble => Ok(CType::Double),
            TokenKind::KwBool => Ok(CType::Bool),
            TokenKind::KwVoid => Ok(CType::Void),
            other => Err(ParseError {
                message: format!("expected a type, found {}", other.describe()),
                span: tok.span,
            }),
        }
    }

    fn at_type(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(
                TokenKind::KwInt
                    | TokenKind::KwFloat
                    | TokenKind::KwDouble
                    | TokenKind::KwBool
                    | TokenKind::KwVoid
            )
        )
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let open = self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(ParseError {
                    message: "unclosed block".to_string(),
                    span: open.span,
                });
            }
            self.parse_stmt_into(&mut stmts)?;
        }
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Block::new(join(open.span, close.span), stmts))
    }

    /// Branch and loop bodies may be a single statement; they are always
    /// stored as blocks.
    fn parse_body(&mut self) -> Result<Block, ParseError> {
        if self.at(TokenKind::LBrace) {
            return self.parse_block();
        }
        let start = self.here();
        let mut stmts = Vec::new();
        self.parse_stmt_into(&mut stmts)?;
        let span = stmts.last().map(|s| join(start, s.span())).unwrap_or(start);
        Ok(Block::new(span, stmts))
    }

    fn parse_stmt_into(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        match self.peek_kind() {
            Some(TokenKind::Semi) => {
                self.next();
            }
            Some(TokenKind::LBrace) => out.push(Stmt::Block(self.parse_block()?)),
            Some(TokenKind::KwIf) => out.push(self.parse_if()?),
            Some(TokenKind::KwWhile) => out.push(self.parse_while()?),
            Some(TokenKind::KwReturn) => out.push(self.parse_return()?),
            Some(TokenKind::KwFor) => {
                return Err(ParseError {
                    message: "`for` loops are not supported; rewrite the loop with `while`"
                        .to_string(),
                    span: self.here(),
                });
            }
            _ if self.at_type() => self.parse_decls(out)?,
            _ => out.push(self.parse_simple_stmt()?),
        }
        Ok(())
    }

    fn parse_decls(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        let start = self.here();
        let ty = self.parse_type()?;
        loop {
            let name = self.expect_ident()?;
            if self.at(TokenKind::LBracket) {
                return Err(ParseError {
                    message: "local array declarations are not supported".to_string(),
                    span: self.here(),
                });
            }
            let init = if self.at(TokenKind::Eq) {
                self.next();
                Some(self.parse_expr()?)
            } else {
                None
            };
            let end = init.as_ref().map(|e| e.span).unwrap_or(name.span);
            out.push(Stmt::Decl(DeclStmt {
                span: join(start, end),
                ty,
                name,
                init,
            }));
            if self.at(TokenKind::Comma) {
                self.next();
                continue;
            }
            break;
        }
        self.expect(TokenKind::Semi)?;
        Ok(())
    }

    fn parse_simple_stmt(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.parse_expr()?;
        if self.at(TokenKind::Eq) {
            let eq = self.here();
            self.next();
            let ExprKind::Ident(target) = expr.kind else {
                return Err(ParseError {
                    message: "only scalar variables can be assigned".to_string(),
                    span: join(expr.span, eq),
                });
            };
            let rhs = self.parse_expr()?;
            self.expect(TokenKind::Semi)?;
            return Ok(Stmt::Assign(AssignStmt {
                span: join(target.span, rhs.span),
                target,
                expr: rhs,
            }));
        }
        self.expect(TokenKind::Semi)?;
        Ok(Stmt::ExprStmt(expr))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwIf)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let then_block = self.parse_body()?;
        let else_block = if self.at(TokenKind::KwElse) {
            self.next();
            Some(self.parse_body()?)
        } else {
            None
        };
        let end = else_block.as_ref().map(|b| b.span).unwrap_or(then_block.span);
        Ok(Stmt::If(IfStmt {
            span: join(kw.span, end),
            cond,
            then_block,
            else_block,
        }))
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwWhile)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let body = self.parse_body()?;
        Ok(Stmt::While(WhileStmt {
            span: join(kw.span, body.span),
            cond,
            body,
        }))
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwReturn)?;
        let expr = if self.at(TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        let semi = self.expect(TokenKind::Semi)?;
        Ok(Stmt::Return(ReturnStmt {
            span: join(kw.span, semi.span),
            expr,
        }))
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_ternary_expr()
    }

    fn parse_ternary_expr(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or_expr()?;
        if !self.at(TokenKind::Question) {
            return Ok(cond);
        }
        self.next();
        let then_expr = self.parse_expr()?;
        self.expect(TokenKind::Colon)?;
        let else_expr = self.parse_ternary_expr()?;
        let span = join(cond.span, else_expr.span);
        Ok(Expr {
            span,
            kind: ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
        })
    }

    fn parse_or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and_expr()?;
        while self.at(TokenKind::OrOr) {
            self.next();
            let right = self.parse_and_expr()?;
            left = binary(left, BinOp::Or, right);
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_eq_expr()?;
        while self.at(TokenKind::AndAnd) {
            self.next();
            let right = self.parse_eq_expr()?;
            left = binary(left, BinOp::And, right);
        }
        Ok(left)
    }

    fn parse_eq_expr(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_rel_expr()?;
        let op = match self.peek_kind() {
            Some(TokenKind::EqEq) => BinOp::Eq,
            Some(TokenKind::Neq) => BinOp::Ne,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_rel_expr()?;
        let expr = binary(left, op, right);
        self.reject_chained_comparison(&expr)?;
        Ok(expr)
    }

    fn parse_rel_expr(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_add_expr()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Lt) => BinOp::Lt,
            Some(TokenKind::Gt) => BinOp::Gt,
            Some(TokenKind::Le) => BinOp::Le,
            Some(TokenKind::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_add_expr()?;
        let expr = binary(left, op, right);
        self.reject_chained_comparison(&expr)?;
        Ok(expr)
    }

    // `a < b < c` is legal C but almost never what a mechanism author means.
    fn reject_chained_comparison(&self, expr: &Expr) -> Result<(), ParseError> {
        if matches!(
            self.peek_kind(),
            Some(
                TokenKind::EqEq
                    | TokenKind::Neq
                    | TokenKind::Lt
                    | TokenKind::Gt
                    | TokenKind::Le
                    | TokenKind::Ge
            )
        ) {
            let span = self.peek_span().unwrap_or(expr.span);
            return Err(ParseError {
                message: "chained comparisons are not supported; use parentheses or boolean operators".to_string(),
                span,
            });
        }
        Ok(())
    }

    fn parse_add_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mul_expr()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_mul_expr()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_mul_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary_expr()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Rem,
                _ => break,
            };
            self.next();
            let right = self.parse_unary_expr()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Bang) => UnaryOp::Not,
            Some(TokenKind::Plus) => {
                self.next();
                return self.parse_unary_expr();
            }
            _ => return self.parse_postfix_expr(),
        };
        let op_span = self.here();
        self.next();
        let expr = self.parse_unary_expr()?;
        Ok(Expr {
            span: join(op_span, expr.span),
            kind: ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
        })
    }

    fn parse_postfix_expr(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            if self.at(TokenKind::LBracket) {
                self.next();
                let index = self.parse_expr()?;
                let close = self.expect(TokenKind::RBracket)?;
                expr = Expr {
                    span: join(expr.span, close.span),
                    kind: ExprKind::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    },
                };
                continue;
            }
            if self.at(TokenKind::LParen) {
                let ExprKind::Ident(callee) = expr.kind else {
                    return Err(ParseError {
                        message: "only named functions can be called".to_string(),
                        span: expr.span,
                    });
                };
                self.next();
                let mut args = Vec::new();
                if !self.at(TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.at(TokenKind::Comma) {
                            self.next();
                            continue;
                        }
                        break;
                    }
                }
                let close = self.expect(TokenKind::RParen)?;
                expr = Expr {
                    span: join(callee.span, close.span),
                    kind: ExprKind::Call { callee, args },
                };
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Ident(name) => Ok(Expr {
                span: tok.span,
                kind: ExprKind::Ident(Ident::new(tok.span, name)),
            }),
            TokenKind::Number(text) => Ok(Expr {
                span: tok.span,
                kind: ExprKind::Number(text),
            }),
            TokenKind::String(s) => Ok(Expr {
                span: tok.span,
                kind: ExprKind::StringLit(s),
            }),
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            other => Err(ParseError {
                message: format!("expected an expression, found {}", other.describe()),
                span: tok.span,
            }),
        }
    }

    fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Ident(name) => Ok(Ident {
                span: tok.span,
                node: name,
            }),
            other => Err(ParseError {
                message: format!("expected identifier, found {}", other.describe()),
                span: tok.span,
            }),
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token, ParseError> {
        let tok = self.expect_any()?;
        if mem::discriminant(&tok.kind) == mem::discriminant(&expected) {
            Ok(tok)
        } else {
            Err(ParseError {
                message: format!("expected {}, found {}", expected.describe(), tok.kind.describe()),
                span: tok.span,
            })
        }
    }

    fn expect_any(&mut self) -> Result<Token, ParseError> {
        self.next().ok_or_else(|| ParseError {
            message: "unexpected end of input".to_string(),
            span: span_between(0, 0),
        })
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind()
            .is_some_and(|k| mem::discriminant(k) == mem::discriminant(&kind))
    }

    fn here(&self) -> Span {
        self.peek_span().unwrap_or_else(|| span_between(0, 0))
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.idx)?.clone();
        self.idx += 1;
        Some(tok)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.idx).map(|t| &t.kind)
    }

    fn peek_kind_n(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.idx + n).map(|t| &t.kind)
    }

    fn peek_span(&self) -> Option<Span> {
        self.tokens.get(self.idx).map(|t| t.span)
    }
}

fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
    let span = join(left.span, right.span);
    Expr {
        span,
        kind: ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
    }
}

fn join(a: Span, b: Span) -> Span {
    let a0: usize = a.offset();
    let b0: usize = b.offset();
    let b1 = b0 + b.len();
    if b0 >= a0 {
        span_between(a0, b1.max(a0 + a.len()))
    } else {
        let a1 = a0 + a.len();
        span_between(b0, a1)
    }
}

fn token_text(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(s) | TokenKind::Number(s) => s.clone(),
        TokenKind::String(s) => format!("{s:?}"),
        TokenKind::LParen => "(".to_string(),
        TokenKind::RParen => ")".to_string(),
        TokenKind::Comma => ", ".to_string(),
        _ => String::new(),
    }
}
