#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use miette::Diagnostic;
use shadow_ast::Span;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum InterpretError {
    #[error("unknown variable `{name}`")]
    #[diagnostic(code(shadowdp::interpret::unbound))]
    UnknownVariable {
        name: String,
        #[label]
        span: Span,
    },

    #[error("no function named `{name}`")]
    #[diagnostic(code(shadowdp::interpret::unknown_function))]
    UnknownFunction { name: String },

    #[error("`{name}` expects {expected} argument(s), got {got}")]
    #[diagnostic(code(shadowdp::interpret::arity))]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("type error: {message}")]
    #[diagnostic(code(shadowdp::interpret::type_error))]
    Type {
        message: String,
        #[label]
        span: Span,
    },

    #[error("division by zero")]
    #[diagnostic(code(shadowdp::interpret::division_by_zero))]
    DivisionByZero {
        #[label]
        span: Span,
    },

    #[error("arithmetic overflows the exact 128-bit range")]
    #[diagnostic(code(shadowdp::interpret::overflow))]
    Overflow {
        #[label]
        span: Span,
    },

    #[error("index {index} is out of bounds for `{array}` of length {len}")]
    #[diagnostic(code(shadowdp::interpret::bounds))]
    OutOfBounds {
        array: String,
        index: i128,
        len: usize,
        #[label]
        span: Span,
    },

    #[error("the nondeterministic value source ran dry")]
    #[diagnostic(
        code(shadowdp::interpret::nondet_exhausted),
        help("supply one value per executed draw")
    )]
    NondetExhausted {
        #[label]
        span: Span,
    },

    #[error("step limit of {limit} reached")]
    #[diagnostic(code(shadowdp::interpret::step_limit))]
    StepLimit { limit: u64 },
}
