#![forbid(unsafe_code)]

use shadow_ast::{BinOp, Block, Expr, ExprKind, FunctionDef, Item, Param, Program, Prototype, Stmt, UnaryOp};

const INDENT: &str = "    ";

/// Print a program as C. Items are separated by a blank line.
pub fn format_program(program: &Program) -> String {
    let mut out = String::new();
    for (i, item) in program.items.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        match item {
            Item::Function(f) => out.push_str(&format_function(f)),
            Item::Prototype(p) => {
                out.push_str(&format_prototype(p));
                out.push('\n');
            }
        }
    }
    out
}

pub fn format_function(f: &FunctionDef) -> String {
    let params = f.params.iter().map(format_param).collect::<Vec<_>>().join(", ");
    let mut out = format!("{} {}({}) ", f.ret.as_str(), f.name.node, params);
    write_block(&mut out, &f.body, 0);
    out.push('\n');
    out
}

fn format_prototype(p: &Prototype) -> String {
    let params = match &p.params {
        None => String::new(),
        Some(ps) if ps.is_empty() => "void".to_string(),
        Some(ps) => ps.iter().map(format_param).collect::<Vec<_>>().join(", "),
    };
    let mut out = String::new();
    if p.is_extern {
        out.push_str("extern ");
    }
    out.push_str(&format!("{} {}({})", p.ret.as_str(), p.name.node, params));
    if let Some(attr) = &p.attributes {
        out.push_str(" __attribute__ ");
        out.push_str(attr);
    }
    out.push(';');
    out
}

fn format_param(p: &Param) -> String {
    let mut out = p.ty.as_str().to_string();
    if let Some(name) = p.name() {
        out.push(' ');
        out.push_str(name);
    }
    if p.is_array {
        out.push_str("[]");
    }
    out
}

/// Print one statement (and any nested blocks) at indentation level zero.
pub fn format_stmt(stmt: &Stmt) -> String {
    let mut out = String::new();
    write_stmt(&mut out, stmt, 0);
    out
}

fn write_block(out: &mut String, block: &Block, level: usize) {
    out.push_str("{\n");
    for stmt in &block.stmts {
        write_stmt(out, stmt, level + 1);
    }
    push_indent(out, level);
    out.push('}');
}

fn write_stmt(out: &mut String, stmt: &Stmt, level: usize) {
    push_indent(out, level);
    match stmt {
        Stmt::Decl(d) => {
            out.push_str(d.ty.as_str());
            out.push(' ');
            out.push_str(&d.name.node);
            if let Some(init) = &d.init {
                out.push_str(" = ");
                out.push_str(&format_expr(init));
            }
            out.push_str(";\n");
        }
        Stmt::Assign(a) => {
            out.push_str(&a.target.node);
            out.push_str(" = ");
            out.push_str(&format_expr(&a.expr));
            out.push_str(";\n");
        }
        Stmt::If(s) => {
            out.push_str("if (");
            out.push_str(&format_expr(&s.cond));
            out.push_str(") ");
            write_block(out, &s.then_block, level);
            if let Some(else_block) = &s.else_block {
                out.push_str(" else ");
                write_block(out, else_block, level);
            }
            out.push('\n');
        }
        Stmt::While(w) => {
            out.push_str("while (");
            out.push_str(&format_expr(&w.cond));
            out.push_str(") ");
            write_block(out, &w.body, level);
            out.push('\n');
        }
        Stmt::Return(r) => match &r.expr {
            Some(e) => {
                out.push_str("return ");
                out.push_str(&format_expr(e));
                out.push_str(";\n");
            }
            None => out.push_str("return;\n"),
        },
        Stmt::Block(b) => {
            write_block(out, b, level);
            out.push('\n');
        }
        Stmt::ExprStmt(e) => {
            out.push_str(&format_expr(e));
            out.push_str(";\n");
        }
    }
}

fn push_indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str(INDENT);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Ternary = 1,
    Or = 2,
    And = 3,
    Eq = 4,
    Rel = 5,
    Add = 6,
    Mul = 7,
    Unary = 8,
    Postfix = 9,
}

fn bin_prec(op: BinOp) -> Prec {
    match op {
        BinOp::Or => Prec::Or,
        BinOp::And => Prec::And,
        BinOp::Eq | BinOp::Ne => Prec::Eq,
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => Prec::Rel,
        BinOp::Add | BinOp::Sub => Prec::Add,
        BinOp::Mul | BinOp::Div | BinOp::Rem => Prec::Mul,
    }
}

fn expr_prec(e: &Expr) -> Prec {
    match &e.kind {
        ExprKind::Ternary { .. } => Prec::Ternary,
        ExprKind::Binary { op, .. } => bin_prec(*op),
        ExprKind::Unary { .. } => Prec::Unary,
        _ => Prec::Postfix,
    }
}

pub fn format_expr(e: &Expr) -> String {
    match &e.kind {
        ExprKind::Ident(id) => id.node.clone(),
        ExprKind::Number(text) => text.clone(),
        ExprKind::StringLit(s) => format!("\"{}\"", escape(s)),
        ExprKind::Index { base, index } => {
            format!("{}[{}]", wrap(base, Prec::Postfix), format_expr(index))
        }
        ExprKind::Unary { op, expr } => {
            let sym = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
            };
            // `- -x` would read back as a decrement.
            let inner = if matches!(expr.kind, ExprKind::Unary { .. }) {
                format!("({})", format_expr(expr))
            } else {
                wrap(expr, Prec::Unary)
            };
            format!("{sym}{inner}")
        }
        ExprKind::Binary { left, op, right } => {
            let prec = bin_prec(*op);
            let l = if is_nested_comparison(*op, left) {
                format!("({})", format_expr(left))
            } else {
                wrap(left, prec)
            };
            let r = if needs_parens_right(*op, right) || is_nested_comparison(*op, right) {
                format!("({})", format_expr(right))
            } else {
                wrap(right, prec)
            };
            format!("{l} {} {r}", op.as_str())
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => format!(
            "{} ? {} : {}",
            wrap(cond, Prec::Or),
            format_expr(then_expr),
            wrap(else_expr, Prec::Ternary)
        ),
        ExprKind::Call { callee, args } => {
            let args = args.iter().map(format_expr).collect::<Vec<_>>().join(", ");
            format!("{}({args})", callee.node)
        }
    }
}

fn wrap(e: &Expr, min: Prec) -> String {
    if expr_prec(e) < min {
        format!("({})", format_expr(e))
    } else {
        format_expr(e)
    }
}

/// Right operands of non-associative operators keep their parentheses at
/// equal precedence: `a - (b - c)`, `a / (b * c)`.
fn needs_parens_right(op: BinOp, right: &Expr) -> bool {
    let ExprKind::Binary { op: rop, .. } = &right.kind else {
        return false;
    };
    if bin_prec(*rop) != bin_prec(op) {
        return false;
    }
    !matches!(
        (op, rop),
        (BinOp::Add, BinOp::Add) | (BinOp::Mul, BinOp::Mul) | (BinOp::And, BinOp::And) | (BinOp::Or, BinOp::Or)
    )
}

/// The parser rejects `a < b == c`, so comparisons nested in comparisons
/// are always parenthesised.
fn is_nested_comparison(op: BinOp, child: &Expr) -> bool {
    op.is_comparison() && matches!(&child.kind, ExprKind::Binary { op: inner, .. } if inner.is_comparison())
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}
