#![forbid(unsafe_code)]

use std::fmt;

use shadow_ast::{BinOp, Expr, ExprKind, Span, UnaryOp};

use crate::error::TransformError;
use crate::ratio::Ratio;

/// Span-free program expression.
///
/// Conditions, selector predicates and scale factors are compared
/// structurally (a selector's `c ? a : b` is resolved against a branch with
/// the same `c`), which source `Expr`s cannot do because of their spans.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sym {
    Num(Ratio),
    /// A number C must treat as floating point even when it is integral,
    /// so that a following division does not truncate.
    Float(Ratio),
    Var(String),
    Index(String, Box<Sym>),
    Unary(UnaryOp, Box<Sym>),
    Binary(Box<Sym>, BinOp, Box<Sym>),
    Ternary(Box<Sym>, Box<Sym>, Box<Sym>),
    Call(String, Vec<Sym>),
}

impl Sym {
    pub fn var(name: impl Into<String>) -> Self {
        Sym::Var(name.into())
    }

    pub fn num(r: Ratio) -> Self {
        Sym::Num(r)
    }

    pub fn from_expr(e: &Expr) -> Result<Sym, TransformError> {
        Ok(match &e.kind {
            ExprKind::Ident(id) => Sym::Var(id.node.clone()),
            ExprKind::Number(text) => Sym::Num(Ratio::parse(text).ok_or_else(|| {
                TransformError::unsupported(
                    format!("numeric literal `{text}` has no exact 128-bit rational value"),
                    e.span,
                )
            })?),
            ExprKind::StringLit(_) => {
                return Err(TransformError::annotation(
                    "string literals are only allowed as annotations",
                    e.span,
                ));
            }
            ExprKind::Index { base, index } => {
                let Some(name) = base.as_ident() else {
                    return Err(TransformError::unsupported(
                        "only named arrays can be indexed",
                        base.span,
                    ));
                };
                Sym::Index(name.to_string(), Box::new(Sym::from_expr(index)?))
            }
            ExprKind::Unary { op, expr } => Sym::Unary(*op, Box::new(Sym::from_expr(expr)?)),
            ExprKind::Binary { left, op, right } => Sym::Binary(
                Box::new(Sym::from_expr(left)?),
                *op,
                Box::new(Sym::from_expr(right)?),
            ),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => Sym::Ternary(
                Box::new(Sym::from_expr(cond)?),
                Box::new(Sym::from_expr(then_expr)?),
                Box::new(Sym::from_expr(else_expr)?),
            ),
            ExprKind::Call { callee, args } => Sym::Call(
                callee.node.clone(),
                args.iter().map(Sym::from_expr).collect::<Result<_, _>>()?,
            ),
        })
    }

    pub fn to_expr(&self, span: Span) -> Expr {
        match self {
            Sym::Num(r) => number_expr(*r, span),
            Sym::Float(r) if r.is_integer() && !r.is_negative() => {
                Expr::number(format!("{}.0", r.numer()), span)
            }
            Sym::Float(r) => number_expr(*r, span),
            Sym::Var(name) => Expr::ident(name.clone(), span),
            Sym::Index(name, idx) => Expr::index(Expr::ident(name.clone(), span), idx.to_expr(span)),
            Sym::Unary(op, e) => Expr::unary(*op, e.to_expr(span)),
            Sym::Binary(l, op, r) => Expr::binary(l.to_expr(span), *op, r.to_expr(span)),
            Sym::Ternary(c, a, b) => Expr::ternary(c.to_expr(span), a.to_expr(span), b.to_expr(span)),
            Sym::Call(name, args) => {
                Expr::call(name, args.iter().map(|a| a.to_expr(span)).collect(), span)
            }
        }
    }

    /// True when the program variable `name` occurs anywhere, including as
    /// an array base or inside a subscript.
    pub fn mentions(&self, name: &str) -> bool {
        match self {
            Sym::Num(_) | Sym::Float(_) => false,
            Sym::Var(v) => v == name,
            Sym::Index(arr, idx) => arr == name || idx.mentions(name),
            Sym::Unary(_, e) => e.mentions(name),
            Sym::Binary(l, _, r) => l.mentions(name) || r.mentions(name),
            Sym::Ternary(c, a, b) => c.mentions(name) || a.mentions(name) || b.mentions(name),
            Sym::Call(_, args) => args.iter().any(|a| a.mentions(name)),
        }
    }

    pub fn as_num(&self) -> Option<Ratio> {
        match self {
            Sym::Num(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_num().is_some_and(Ratio::is_zero)
    }

    /// Value of a literal arithmetic expression such as `2`, `-1` or
    /// `1.0 / 3`.
    pub fn constant_value(&self) -> Option<Ratio> {
        match self {
            Sym::Num(r) | Sym::Float(r) => Some(*r),
            Sym::Unary(UnaryOp::Neg, e) => Some(-e.constant_value()?),
            Sym::Binary(l, op, r) => {
                let (l, r) = (l.constant_value()?, r.constant_value()?);
                match op {
                    BinOp::Add => l.checked_add(r),
                    BinOp::Sub => l.checked_sub(r),
                    BinOp::Mul => l.checked_mul(r),
                    BinOp::Div => l.checked_div(r),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// `a + b`, dropping a literal zero on either side. Literals are summed
    /// unless the sum overflows.
    pub fn plus(a: Sym, b: Sym) -> Sym {
        if let Some(sum) = a.as_num().zip(b.as_num()).and_then(|(x, y)| x.checked_add(y)) {
            return Sym::Num(sum);
        }
        match (a.as_num(), b.as_num()) {
            (Some(x), _) if x.is_zero() => b,
            (_, Some(y)) if y.is_zero() => a,
            _ => Sym::Binary(Box::new(a), BinOp::Add, Box::new(b)),
        }
    }

    /// `a * b`, folding literal ones and zeros, and literal products that
    /// stay in range.
    pub fn times(a: Sym, b: Sym) -> Sym {
        if let Some(product) = a.as_num().zip(b.as_num()).and_then(|(x, y)| x.checked_mul(y)) {
            return Sym::Num(product);
        }
        match (a.as_num(), b.as_num()) {
            (Some(x), _) if x.is_zero() => Sym::Num(Ratio::ZERO),
            (_, Some(y)) if y.is_zero() => Sym::Num(Ratio::ZERO),
            (Some(x), _) if x == Ratio::ONE => b,
            (_, Some(y)) if y == Ratio::ONE => a,
            _ => Sym::Binary(Box::new(a), BinOp::Mul, Box::new(b)),
        }
    }

    pub fn ternary(c: Sym, a: Sym, b: Sym) -> Sym {
        if a == b {
            return a;
        }
        Sym::Ternary(Box::new(c), Box::new(a), Box::new(b))
    }

    pub fn call(name: &str, args: Vec<Sym>) -> Sym {
        Sym::Call(name.to_string(), args)
    }

    pub fn binary(a: Sym, op: BinOp, b: Sym) -> Sym {
        Sym::Binary(Box::new(a), op, Box::new(b))
    }

    pub fn negate(a: Sym) -> Sym {
        match a {
            Sym::Num(r) => Sym::Num(-r),
            Sym::Unary(UnaryOp::Neg, inner) => *inner,
            other => Sym::Unary(UnaryOp::Neg, Box::new(other)),
        }
    }
}

/// Numbers print as C literals: integers as-is, finite fractions as
/// decimals, anything else as an explicit floating division.
fn number_expr(r: Ratio, span: Span) -> Expr {
    if r.is_negative() {
        return Expr::unary(UnaryOp::Neg, number_expr(r.abs(), span));
    }
    if let Some(text) = r.decimal() {
        return Expr::number(text, span);
    }
    Expr::binary(
        Expr::number(format!("{}.0", r.numer()), span),
        BinOp::Div,
        Expr::number(format!("{}.0", r.denom()), span),
    )
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expr = self.to_expr(shadow_ast::span(0, 0));
        f.write_str(&shadow_parse::format_expr(&expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(src: &str) -> Sym {
        Sym::from_expr(&shadow_parse::parse_expr(src).unwrap()).unwrap()
    }

    #[test]
    fn structural_equality_ignores_spans_and_parens() {
        assert_eq!(sym("q[i] + eta > bq || i == 0"), sym("((q[i] + eta) > bq) || (i == 0)"));
    }

    #[test]
    fn mentions_subscripts() {
        let s = sym("q[i] + eta");
        assert!(s.mentions("i"));
        assert!(s.mentions("q"));
        assert!(!s.mentions("bq"));
    }

    #[test]
    fn numbers_print_as_c_literals() {
        let third = Sym::Num(Ratio::new(1, 3).unwrap());
        assert_eq!(third.to_string(), "1.0 / 3.0");
        assert_eq!(Sym::Num(Ratio::new(-1, 2).unwrap()).to_string(), "-0.5");
        assert_eq!(Sym::Float(Ratio::integer(3)).to_string(), "3.0");
    }

    #[test]
    fn folds_literal_arithmetic() {
        assert_eq!(sym("-1").constant_value(), Some(Ratio::integer(-1)));
        assert_eq!(sym("1.0 / 4 + 1").constant_value(), Ratio::new(5, 4));
        assert_eq!(sym("n + 1").constant_value(), None);
    }

    #[test]
    fn overflowing_literals_stay_unfolded() {
        let big = "100000000000000000000";
        assert_eq!(sym(&format!("{big} * {big}")).constant_value(), None);
        let product = Sym::times(sym(big), sym(big));
        assert_eq!(product.to_string(), format!("{big} * {big}"));
        let huge = Sym::Num(Ratio::integer(i128::MAX));
        assert!(matches!(Sym::plus(huge.clone(), huge), Sym::Binary(..)));
    }

    #[test]
    fn unrepresentable_literal_is_unsupported() {
        let err = Sym::from_expr(&shadow_parse::parse_expr("1e-40").unwrap()).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedExpression { ref message, .. } if message.contains("1e-40")));
    }
}
