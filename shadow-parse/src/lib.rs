#![forbid(unsafe_code)]

mod error;
mod fmt;
mod parser;

use miette::IntoDiagnostic;
use shadow_lex::Lexer;

pub use error::ParseError;
pub use fmt::{format_expr, format_function, format_program, format_stmt};
pub use parser::Parser;

pub fn parse_source(src: &str) -> miette::Result<shadow_ast::Program> {
    parse_program(src).into_diagnostic()
}

/// Like [`parse_source`], keeping the typed error so callers can attach
/// the file as source code.
pub fn parse_program(src: &str) -> Result<shadow_ast::Program, ParseError> {
    let tokens = Lexer::new(src).lex().map_err(|e| ParseError {
        message: e.message,
        span: e.span,
    })?;
    let mut parser = Parser::new(&tokens);
    parser.parse_program()
}

pub fn parse_expr(src: &str) -> miette::Result<shadow_ast::Expr> {
    parse_expr_at(src, 0).into_diagnostic()
}

/// Parse a standalone expression whose text starts at byte `base` of an
/// enclosing file, so spans point back into that file.
pub fn parse_expr_at(src: &str, base: usize) -> Result<shadow_ast::Expr, ParseError> {
    let tokens = Lexer::with_offset(src, base).lex().map_err(|e| ParseError {
        message: e.message,
        span: e.span,
    })?;
    let mut parser = Parser::new(&tokens);
    parser.parse_standalone_expr()
}
