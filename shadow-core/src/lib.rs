#![forbid(unsafe_code)]

//! Distance propagation and instrumentation for annotated differential
//! privacy programs.

mod annotation;
mod cost;
mod error;
mod instrument;
mod policy;
mod ratio;

pub mod distance;
pub mod env;
pub mod eval;
pub mod names;
pub mod sym;

use serde::Serialize;
use shadow_ast::{FunctionDef, Item, Program};
use tracing::info;

pub use annotation::{Annotations, NoiseScale, Sensitivity, parse_annotations};
pub use cost::{Cost, CostExpr};
pub use error::TransformError;
pub use policy::AdjacencyPolicy;
pub use ratio::Ratio;

/// Names of the verifier primitives the output calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Primitives {
    pub assume: String,
    pub assert: String,
    pub havoc: String,
}

impl Default for Primitives {
    fn default() -> Self {
        Self {
            assume: "assume".to_string(),
            assert: "assert".to_string(),
            havoc: "havoc".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransformOptions {
    pub primitives: Primitives,
    /// Largest distance of one array element under either policy.
    pub element_bound: Ratio,
    /// Multiplier on epsilon in the final obligation, for multi-pass
    /// algorithms.
    pub goal: Option<Ratio>,
    /// Concrete epsilon used in place of the parameter.
    pub epsilon: Option<Ratio>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            primitives: Primitives::default(),
            element_bound: Ratio::ONE,
            goal: None,
            epsilon: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SiteReport {
    pub variable: String,
    pub selector: String,
    pub distance: String,
    /// Largest charge of one draw; `None` when paths charge incomparable
    /// amounts.
    pub max_cost: Option<String>,
    pub span: (usize, usize),
}

#[derive(Clone, Debug, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub policy: String,
    pub shadow_enabled: bool,
    pub sites: Vec<SiteReport>,
    pub distance_vars: Vec<String>,
    pub span: (usize, usize),
}

#[derive(Clone, Debug)]
pub struct Instrumented {
    pub function: FunctionDef,
    pub report: FunctionReport,
}

/// Instrument one annotated function.
pub fn transform_function(func: &FunctionDef, options: &TransformOptions) -> Result<Instrumented, TransformError> {
    let annotations = parse_annotations(func)?;
    info!(
        function = %func.name.node,
        policy = %annotations.header.policy,
        sites = annotations.sites.len(),
        shadow = annotations.shadow_enabled(),
        "instrumenting"
    );
    instrument::Instrumenter::new(&annotations, options).run(func)
}

/// True when the function opens with a header string, or carries
/// parameters only instrumentation adds. Either makes it a candidate, so
/// that instrumenting twice is reported instead of silently skipped.
pub fn is_annotated(func: &FunctionDef) -> bool {
    let header = matches!(
        func.body.stmts.first(),
        Some(shadow_ast::Stmt::ExprStmt(e)) if e.as_string_lit().is_some()
    );
    header
        || func
            .params
            .iter()
            .filter_map(|p| p.name())
            .any(names::is_instrumentation_artifact)
}

/// Instrument every annotated function of a program. Other items are kept
/// unchanged. The first failing function aborts the whole program.
pub fn transform_program(
    program: &Program,
    options: &TransformOptions,
) -> Result<(Program, Vec<FunctionReport>), TransformError> {
    let mut items = Vec::with_capacity(program.items.len());
    let mut reports = Vec::new();
    for item in &program.items {
        match item {
            Item::Function(f) if is_annotated(f) => {
                let out = transform_function(f, options)?;
                reports.push(out.report);
                items.push(Item::Function(out.function));
            }
            other => items.push(other.clone()),
        }
    }
    Ok((Program { items }, reports))
}
