#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use miette::Diagnostic;
use shadow_ast::Span;
use thiserror::Error;

/// Every way a function can fail to instrument. Any of these aborts the
/// function; no partial output is produced.
#[derive(Debug, Error, Diagnostic)]
pub enum TransformError {
    #[error("annotation error: {message}")]
    #[diagnostic(code(shadowdp::annotation))]
    AnnotationParse {
        message: String,
        #[label]
        span: Span,
    },

    #[error("unsupported expression: {message}")]
    #[diagnostic(
        code(shadowdp::unsupported),
        help("distances propagate through +, -, negation, scaling by untracked values and ternaries")
    )]
    UnsupportedExpression {
        message: String,
        #[label]
        span: Span,
    },

    #[error("unbound variable `{name}`")]
    #[diagnostic(code(shadowdp::unbound))]
    UnboundVariable {
        name: String,
        #[label("not a parameter or a declared local")]
        span: Span,
    },

    #[error("policy mismatch: {message}")]
    #[diagnostic(code(shadowdp::policy))]
    PolicyMismatch {
        message: String,
        #[label]
        span: Span,
    },

    #[error("loop distances are not stable after one pass; unstable: {variables}")]
    #[diagnostic(
        code(shadowdp::loop_invariant),
        help("make the per-iteration distance of these variables independent of the iteration count")
    )]
    LoopInvariantInstability {
        variables: String,
        #[label("loop")]
        span: Span,
    },

    #[error("returned value has aligned distance `{distance}`, expected 0")]
    #[diagnostic(code(shadowdp::return_distance))]
    ReturnDistanceNotZero {
        distance: String,
        #[label("released here")]
        span: Span,
    },

    #[error("noise is drawn inside a branch whose outcome may differ between adjacent runs")]
    #[diagnostic(code(shadowdp::diverging_sample))]
    SamplingInDivergingBranch {
        #[label]
        span: Span,
    },
}

impl TransformError {
    pub fn annotation(message: impl Into<String>, span: Span) -> Self {
        TransformError::AnnotationParse {
            message: message.into(),
            span,
        }
    }

    pub fn unsupported(message: impl Into<String>, span: Span) -> Self {
        TransformError::UnsupportedExpression {
            message: message.into(),
            span,
        }
    }

    /// Folding the constants of a distance left the exact 128-bit range.
    pub fn overflow(span: Span) -> Self {
        TransformError::unsupported("distance arithmetic overflows the exact 128-bit range", span)
    }

    pub fn policy(message: impl Into<String>, span: Span) -> Self {
        TransformError::PolicyMismatch {
            message: message.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            TransformError::AnnotationParse { span, .. }
            | TransformError::UnsupportedExpression { span, .. }
            | TransformError::UnboundVariable { span, .. }
            | TransformError::PolicyMismatch { span, .. }
            | TransformError::LoopInvariantInstability { span, .. }
            | TransformError::ReturnDistanceNotZero { span, .. }
            | TransformError::SamplingInDivergingBranch { span } => *span,
        }
    }
}
