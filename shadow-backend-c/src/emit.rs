#![forbid(unsafe_code)]

use miette::Diagnostic;
use shadow_ast::{Expr, ExprKind, Item, Program, Span, Stmt};
use shadow_core::Primitives;
use thiserror::Error;

/// Declarations the CPAchecker dialect needs ahead of instrumented code.
pub const VERIFIER_HEADER: &str = "\
extern void __VERIFIER_error() __attribute__ ((__noreturn__));
extern int __VERIFIER_nondet_float(void);
extern int __VERIFIER_nondet_int();
extern void __VERIFIER_assume(int);
extern void __assert_fail();
#define __VERIFIER_assert(cond) { if(!(cond)) { __assert_fail(); } }
#define Abs(x) ((x) < 0 ? -(x) : (x))
typedef enum { false = 0, true = 1 } bool;
";

const HEADER_DECLARES: &[&str] = &[
    "__VERIFIER_error",
    "__VERIFIER_nondet_float",
    "__VERIFIER_nondet_int",
    "__VERIFIER_assume",
    "__assert_fail",
];

const NOISE_FN: &str = "Lap";

#[derive(Debug, Error, Diagnostic)]
#[error("C backend error: {message}")]
#[diagnostic(code(shadowdp::backend_c))]
#[allow(unused_assignments)]
pub struct CBackendError {
    pub message: String,
    #[label]
    pub span: Option<Span>,
}

pub fn cpachecker_primitives() -> Primitives {
    Primitives {
        assume: "__VERIFIER_assume".to_string(),
        assert: "__VERIFIER_assert".to_string(),
        havoc: "__VERIFIER_nondet_float".to_string(),
    }
}

/// The verifier input: header, then the program. Prototypes the header
/// already provides are dropped from the program.
pub fn emit_translation_unit(program: &Program) -> Result<String, CBackendError> {
    for f in program.functions() {
        for stmt in &f.body.stmts {
            check_stmt(stmt)?;
        }
    }
    let items = program
        .items
        .iter()
        .filter(|item| match item {
            Item::Prototype(p) => !HEADER_DECLARES.contains(&p.name.node.as_str()),
            Item::Function(_) => true,
        })
        .cloned()
        .collect();

    let mut out = String::from(VERIFIER_HEADER);
    out.push('\n');
    out.push_str(&shadow_parse::format_program(&Program { items }));
    Ok(out)
}

/// Annotations and noise draws must be gone before the verifier sees the
/// code; `Lap` has no C definition.
fn check_stmt(stmt: &Stmt) -> Result<(), CBackendError> {
    match stmt {
        Stmt::Decl(d) => d.init.as_ref().map_or(Ok(()), check_expr),
        Stmt::Assign(a) => check_expr(&a.expr),
        Stmt::If(s) => {
            check_expr(&s.cond)?;
            s.then_block.stmts.iter().try_for_each(check_stmt)?;
            match &s.else_block {
                Some(b) => b.stmts.iter().try_for_each(check_stmt),
                None => Ok(()),
            }
        }
        Stmt::While(w) => {
            check_expr(&w.cond)?;
            w.body.stmts.iter().try_for_each(check_stmt)
        }
        Stmt::Return(r) => r.expr.as_ref().map_or(Ok(()), check_expr),
        Stmt::Block(b) => b.stmts.iter().try_for_each(check_stmt),
        Stmt::ExprStmt(e) if e.as_string_lit().is_some() => Err(CBackendError {
            message: "annotation string left in the output; was the function instrumented?".to_string(),
            span: Some(e.span),
        }),
        Stmt::ExprStmt(e) => check_expr(e),
    }
}

fn check_expr(e: &Expr) -> Result<(), CBackendError> {
    match &e.kind {
        ExprKind::Ident(_) | ExprKind::Number(_) | ExprKind::StringLit(_) => Ok(()),
        ExprKind::Index { base, index } => {
            check_expr(base)?;
            check_expr(index)
        }
        ExprKind::Unary { expr, .. } => check_expr(expr),
        ExprKind::Binary { left, right, .. } => {
            check_expr(left)?;
            check_expr(right)
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            check_expr(cond)?;
            check_expr(then_expr)?;
            check_expr(else_expr)
        }
        ExprKind::Call { callee, .. } if callee.node == NOISE_FN => Err(CBackendError {
            message: format!("`{NOISE_FN}` call left in the output"),
            span: Some(e.span),
        }),
        ExprKind::Call { args, .. } => args.iter().try_for_each(check_expr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_core::{TransformOptions, transform_program};

    const NOISYMAX: &str = include_str!("../../shadow-core/tests/fixtures/noisymax.c");

    #[test]
    fn header_precedes_instrumented_code() {
        let src = format!("extern void __VERIFIER_assume(int);\n{NOISYMAX}");
        let program = shadow_parse::parse_source(&src).unwrap();
        let options = TransformOptions {
            primitives: cpachecker_primitives(),
            ..TransformOptions::default()
        };
        let (out, _) = transform_program(&program, &options).unwrap();
        let unit = emit_translation_unit(&out).unwrap();

        assert!(unit.starts_with("extern void __VERIFIER_error()"));
        assert_eq!(unit.matches("extern void __VERIFIER_assume(int);").count(), 1);
        assert!(unit.contains("float eta = __VERIFIER_nondet_float();"));
        assert!(unit.contains("__VERIFIER_assert(__SHADOWDP_v_epsilon <= epsilon);"));
    }

    #[test]
    fn uninstrumented_code_is_rejected() {
        let program = shadow_parse::parse_source(NOISYMAX).unwrap();
        let err = emit_translation_unit(&program).unwrap_err();
        assert!(err.message.contains("annotation string"), "{}", err.message);
    }
}
