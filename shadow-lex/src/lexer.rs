#![forbid(unsafe_code)]

use logos::Logos;
use miette::Diagnostic;
use shadow_ast::{span, span_between, Span};
use thiserror::Error;

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Diagnostic)]
#[error("lex error: {message}")]
#[diagnostic(code(shadowdp::lex))]
pub struct LexError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\f\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
#[logos(skip(r"#[^\n]*", allow_greedy = true))]
enum RawToken {
    #[token("int")]
    KwInt,
    #[token("float")]
    KwFloat,
    #[token("double")]
    KwDouble,
    #[token("bool")]
    KwBool,
    #[token("void")]
    KwVoid,
    #[token("if")]
    KwIf,
    #[token("else")]
    KwElse,
    #[token("while")]
    KwWhile,
    #[token("for")]
    KwFor,
    #[token("return")]
    KwReturn,
    #[token("extern")]
    KwExtern,
    #[token("typedef")]
    KwTypedef,

    #[token("==")]
    EqEq,
    #[token("!=")]
    Neq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token("=")]
    Eq,
    #[token(",")]
    Comma,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?[fF]?", |lex| lex.slice().to_string())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?[fF]?", |lex| lex.slice().to_string())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fF]?", |lex| lex.slice().to_string())]
    #[regex(r"[0-9]+", |lex| lex.slice().to_string())]
    Number(String),

    // Annotation strings only need the common C escapes.
    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    String(Option<String>),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn parse_string(lex: &mut logos::Lexer<RawToken>) -> Option<String> {
    let s = lex.slice();
    let inner = &s[1..s.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            _ => return None,
        }
    }

    Some(out)
}

pub struct Lexer<'a> {
    src: &'a str,
    base: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, base: 0 }
    }

    /// Lex `src` as if it started at byte `base` of a larger file.
    pub fn with_offset(src: &'a str, base: usize) -> Self {
        Self { src, base }
    }

    pub fn lex(&self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        let mut lex = RawToken::lexer(self.src);

        while let Some(raw) = lex.next() {
            let range = lex.span();
            let abs_start = self.base + range.start;
            let abs_end = self.base + range.end;

            let kind = match raw {
                Ok(RawToken::KwInt) => TokenKind::KwInt,
                Ok(RawToken::KwFloat) => TokenKind::KwFloat,
                Ok(RawToken::KwDouble) => TokenKind::KwDouble,
                Ok(RawToken::KwBool) => TokenKind::KwBool,
                Ok(RawToken::KwVoid) => TokenKind::KwVoid,
                Ok(RawToken::KwIf) => TokenKind::KwIf,
                Ok(RawToken::KwElse) => TokenKind::KwElse,
                Ok(RawToken::KwWhile) => TokenKind::KwWhile,
                Ok(RawToken::KwFor) => TokenKind::KwFor,
                Ok(RawToken::KwReturn) => TokenKind::KwReturn,
                Ok(RawToken::KwExtern) => TokenKind::KwExtern,
                Ok(RawToken::KwTypedef) => TokenKind::KwTypedef,

                Ok(RawToken::EqEq) => TokenKind::EqEq,
                Ok(RawToken::Neq) => TokenKind::Neq,
                Ok(RawToken::Le) => TokenKind::Le,
                Ok(RawToken::Ge) => TokenKind::Ge,
                Ok(RawToken::Lt) => TokenKind::Lt,
                Ok(RawToken::Gt) => TokenKind::Gt,

                Ok(RawToken::AndAnd) => TokenKind::AndAnd,
                Ok(RawToken::OrOr) => TokenKind::OrOr,
                Ok(RawToken::Bang) => TokenKind::Bang,

                Ok(RawToken::Plus) => TokenKind::Plus,
                Ok(RawToken::Minus) => TokenKind::Minus,
                Ok(RawToken::Star) => TokenKind::Star,
                Ok(RawToken::Slash) => TokenKind::Slash,
                Ok(RawToken::Percent) => TokenKind::Percent,

                Ok(RawToken::Question) => TokenKind::Question,
                Ok(RawToken::Colon) => TokenKind::Colon,
                Ok(RawToken::Semi) => TokenKind::Semi,
                Ok(RawToken::Eq) => TokenKind::Eq,
                Ok(RawToken::Comma) => TokenKind::Comma,

                Ok(RawToken::LParen) => TokenKind::LParen,
                Ok(RawToken::RParen) => TokenKind::RParen,
                Ok(RawToken::LBrace) => TokenKind::LBrace,
                Ok(RawToken::RBrace) => TokenKind::RBrace,
                Ok(RawToken::LBracket) => TokenKind::LBracket,
                Ok(RawToken::RBracket) => TokenKind::RBracket,

                Ok(RawToken::Ident(s)) => TokenKind::Ident(s),
                Ok(RawToken::Number(n)) => TokenKind::Number(n),
                Ok(RawToken::String(Some(s))) => TokenKind::String(s),
                Ok(RawToken::String(None)) => {
                    return Err(LexError {
                        message: "invalid string literal".to_string(),
                        span: span_between(abs_start, abs_end),
                    });
                }

                Err(_) => {
                    return Err(LexError {
                        message: format!("unexpected character `{}`", lex.slice()),
                        span: span_between(abs_start, abs_end),
                    });
                }
            };

            tokens.push(Token {
                kind,
                span: span_between(abs_start, abs_end),
            });
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            span: span(self.base + self.src.len(), 0),
        });

        Ok(tokens)
    }
}
