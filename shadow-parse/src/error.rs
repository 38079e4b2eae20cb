#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use miette::Diagnostic;
use shadow_ast::Span;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("parse error: {message}")]
#[diagnostic(code(shadowdp::parse))]
pub struct ParseError {
    pub message: String,
    #[label]
    pub span: Span,
}
