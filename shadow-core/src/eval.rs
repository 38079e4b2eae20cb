#![forbid(unsafe_code)]

use indexmap::IndexSet;
use shadow_ast::{BinOp, Expr, ExprKind, Span, UnaryOp};

use crate::distance::Distance;
use crate::env::TrackingEnv;
use crate::error::TransformError;
use crate::names::{self, Version};
use crate::ratio::Ratio;
use crate::sym::Sym;

/// Distance propagation over source expressions against one environment.
pub struct Evaluator<'a> {
    env: &'a TrackingEnv,
    arrays: &'a IndexSet<String>,
}

impl<'a> Evaluator<'a> {
    pub fn new(env: &'a TrackingEnv, arrays: &'a IndexSet<String>) -> Self {
        Self { env, arrays }
    }

    /// Distance of `e` in the given version.
    pub fn distance(&self, e: &Expr, version: Version) -> Result<Distance, TransformError> {
        match &e.kind {
            ExprKind::Number(_) => Ok(Distance::zero()),
            ExprKind::StringLit(_) => Err(TransformError::annotation(
                "string literals are only allowed as annotations",
                e.span,
            )),
            ExprKind::Ident(id) => self.scalar(&id.node, version, e.span),
            ExprKind::Index { base, index } => {
                let Some(array) = base.as_ident() else {
                    return Err(TransformError::unsupported("only named arrays can be indexed", base.span));
                };
                self.element(array, index, version, e.span)
            }
            ExprKind::Unary { op: UnaryOp::Neg, expr } => Ok(self.distance(expr, version)?.neg()),
            ExprKind::Unary { op: UnaryOp::Not, expr } => {
                self.untracked(expr, version, "logical negation")?;
                Ok(Distance::zero())
            }
            ExprKind::Binary { left, op, right } => self.binary(left, *op, right, version, e.span),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => Ok(Distance::select(
                Sym::from_expr(cond)?,
                self.distance(then_expr, version)?,
                self.distance(else_expr, version)?,
            )),
            ExprKind::Call { callee, args } => {
                if callee.node == crate::annotation::NOISE_FN {
                    return Err(TransformError::unsupported(
                        "noise must be drawn directly into a variable",
                        e.span,
                    ));
                }
                for arg in args {
                    self.untracked(arg, version, &format!("argument of `{}`", callee.node))?;
                }
                Ok(Distance::zero())
            }
        }
    }

    fn scalar(&self, name: &str, version: Version, span: Span) -> Result<Distance, TransformError> {
        if names::is_reserved(name) {
            return Ok(Distance::zero());
        }
        if self.arrays.contains(name) {
            return Err(TransformError::unsupported(
                format!("array `{name}` can only be read element-wise"),
                span,
            ));
        }
        self.env
            .distance(name, version)
            .ok_or_else(|| TransformError::UnboundVariable {
                name: name.to_string(),
                span,
            })
    }

    /// Distance of `array[index]`: the per-element runtime distance when the
    /// array is tracked dynamically, the declared constant otherwise.
    pub fn element(
        &self,
        array: &str,
        index: &Expr,
        version: Version,
        span: Span,
    ) -> Result<Distance, TransformError> {
        if !self.arrays.contains(array) {
            return Err(TransformError::policy(
                format!("`{array}` is not an array parameter, so the adjacency policy says nothing about its elements"),
                span,
            ));
        }
        for v in Version::BOTH {
            if !self.distance(index, v)?.is_zero() {
                return Err(TransformError::unsupported(
                    format!("subscript of `{array}` may differ between adjacent runs"),
                    index.span,
                ));
            }
        }
        let record = self.env.get(array).ok_or_else(|| TransformError::UnboundVariable {
            name: array.to_string(),
            span,
        })?;
        Ok(match record.get(version).as_static() {
            Some(d) => d.clone(),
            None => Distance::runtime(version, array, Some(Sym::from_expr(index)?)),
        })
    }

    fn binary(
        &self,
        left: &Expr,
        op: BinOp,
        right: &Expr,
        version: Version,
        span: Span,
    ) -> Result<Distance, TransformError> {
        let folded = |d: Option<Distance>| d.ok_or_else(|| TransformError::overflow(span));
        match op {
            BinOp::Add => folded(self.distance(left, version)?.add(&self.distance(right, version)?)),
            BinOp::Sub => folded(self.distance(left, version)?.sub(&self.distance(right, version)?)),
            BinOp::Mul => {
                let (dl, dr) = (self.distance(left, version)?, self.distance(right, version)?);
                match (dl.is_zero(), dr.is_zero()) {
                    (true, true) => Ok(Distance::zero()),
                    (true, false) => folded(Distance::scaled(&Sym::from_expr(left)?, &dr)),
                    (false, true) => folded(Distance::scaled(&Sym::from_expr(right)?, &dl)),
                    (false, false) => Err(TransformError::unsupported(
                        "product of two quantities that both may differ between adjacent runs",
                        span,
                    )),
                }
            }
            BinOp::Div => {
                self.untracked(right, version, "divisor")?;
                let dl = self.distance(left, version)?;
                if dl.is_zero() {
                    return Ok(dl);
                }
                let divisor = Sym::from_expr(right)?;
                match divisor.constant_value() {
                    Some(c) => match c.recip() {
                        Some(k) => folded(dl.scale(k)),
                        None => Err(TransformError::unsupported("division by zero", right.span)),
                    },
                    None => folded(Distance::scaled(
                        &Sym::binary(Sym::Float(Ratio::ONE), BinOp::Div, divisor),
                        &dl,
                    )),
                }
            }
            _ => {
                let what = format!("operand of `{}`", op.as_str());
                self.untracked(left, version, &what)?;
                self.untracked(right, version, &what)?;
                Ok(Distance::zero())
            }
        }
    }

    fn untracked(&self, e: &Expr, version: Version, what: &str) -> Result<(), TransformError> {
        if self.distance(e, version)?.is_zero() {
            Ok(())
        } else {
            Err(TransformError::unsupported(
                format!("{what} may differ between adjacent runs"),
                e.span,
            ))
        }
    }

    /// `e` as evaluated by the run on the adjacent input: every variable or
    /// array element whose distance is not zero becomes `(x + d)`.
    pub fn shift(&self, e: &Expr, version: Version) -> Result<Sym, TransformError> {
        Ok(match &e.kind {
            ExprKind::Ident(id) => {
                let leaf = Sym::var(id.node.clone());
                shifted(leaf, self.scalar(&id.node, version, e.span)?)
            }
            ExprKind::Index { base, index } => {
                let leaf = Sym::from_expr(e)?;
                let array = base.as_ident().unwrap_or_default();
                shifted(leaf, self.element(array, index, version, e.span)?)
            }
            ExprKind::Number(_) | ExprKind::StringLit(_) => Sym::from_expr(e)?,
            ExprKind::Unary { op, expr } => Sym::Unary(*op, Box::new(self.shift(expr, version)?)),
            ExprKind::Binary { left, op, right } => {
                Sym::binary(self.shift(left, version)?, *op, self.shift(right, version)?)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => Sym::Ternary(
                Box::new(self.shift(cond, version)?),
                Box::new(self.shift(then_expr, version)?),
                Box::new(self.shift(else_expr, version)?),
            ),
            ExprKind::Call { callee, args } => Sym::Call(
                callee.node.clone(),
                args.iter()
                    .map(|a| self.shift(a, version))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// True when some variable or element read by `cond` has a shadow
    /// distance that is not provably zero, so adjacent runs may disagree on
    /// the outcome.
    pub fn may_diverge(&self, cond: &Expr) -> Result<bool, TransformError> {
        Ok(match &cond.kind {
            ExprKind::Ident(id) => !self.scalar(&id.node, Version::Shadow, cond.span)?.is_zero(),
            ExprKind::Index { base, index } => {
                let array = base.as_ident().unwrap_or_default();
                !self.element(array, index, Version::Shadow, cond.span)?.is_zero()
            }
            ExprKind::Number(_) | ExprKind::StringLit(_) => false,
            ExprKind::Unary { expr, .. } => self.may_diverge(expr)?,
            ExprKind::Binary { left, right, .. } => self.may_diverge(left)? || self.may_diverge(right)?,
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => self.may_diverge(cond)? || self.may_diverge(then_expr)? || self.may_diverge(else_expr)?,
            ExprKind::Call { args, .. } => {
                let mut any = false;
                for arg in args {
                    any |= self.may_diverge(arg)?;
                }
                any
            }
        })
    }
}

pub(crate) fn shifted(leaf: Sym, d: Distance) -> Sym {
    if d.is_zero() {
        leaf
    } else {
        Sym::binary(leaf, BinOp::Add, d.to_sym())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DistanceRecord, Tracked};

    fn expr(src: &str) -> Expr {
        shadow_parse::parse_expr(src).unwrap()
    }

    fn setup() -> (TrackingEnv, IndexSet<String>) {
        let env = TrackingEnv::new()
            .with("q", DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic))
            .with("i", DistanceRecord::zero())
            .with("eta", DistanceRecord::new(Tracked::Static(Distance::constant(Ratio::integer(2))), Tracked::zero()))
            .with("bq", DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic));
        (env, IndexSet::from(["q".to_string()]))
    }

    #[test]
    fn element_reads_become_runtime_distances() {
        let (env, arrays) = setup();
        let ev = Evaluator::new(&env, &arrays);
        let d = ev.distance(&expr("q[i] + eta"), Version::Aligned).unwrap();
        assert_eq!(d.to_string(), "__SHADOWDP_ALIGNED_DISTANCE_q[i] + 2");
        let s = ev.distance(&expr("q[i] + eta"), Version::Shadow).unwrap();
        assert_eq!(s.to_string(), "__SHADOWDP_SHADOW_DISTANCE_q[i]");
    }

    #[test]
    fn shift_rewrites_only_differing_leaves() {
        let (env, arrays) = setup();
        let ev = Evaluator::new(&env, &arrays);
        let s = ev.shift(&expr("q[i] + eta > bq || i == 0"), Version::Aligned).unwrap();
        assert_eq!(
            s.to_string(),
            "q[i] + __SHADOWDP_ALIGNED_DISTANCE_q[i] + eta + 2 > bq + __SHADOWDP_ALIGNED_DISTANCE_bq || i == 0"
        );
    }

    #[test]
    fn rejects_products_of_tracked_values() {
        let (env, arrays) = setup();
        let ev = Evaluator::new(&env, &arrays);
        let err = ev.distance(&expr("eta * bq"), Version::Aligned).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedExpression { .. }));
        let scaled = ev.distance(&expr("3 * eta - i"), Version::Aligned).unwrap();
        assert_eq!(scaled.as_constant(), Some(Ratio::integer(6)));
    }

    #[test]
    fn overflowing_scale_is_unsupported() {
        let (env, arrays) = setup();
        let ev = Evaluator::new(&env, &arrays);
        let big = "100000000000000000000";
        let err = ev.distance(&expr(&format!("{big} * ({big} * q[i])")), Version::Aligned).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedExpression { ref message, .. } if message.contains("overflow")));
        let ok = ev.distance(&expr(&format!("{big} * eta")), Version::Aligned).unwrap();
        assert_eq!(ok.as_constant(), Some(Ratio::integer(2 * 10i128.pow(20))));
    }

    #[test]
    fn unknown_names_are_unbound() {
        let (env, arrays) = setup();
        let ev = Evaluator::new(&env, &arrays);
        let err = ev.distance(&expr("nope + 1"), Version::Aligned).unwrap_err();
        assert!(matches!(err, TransformError::UnboundVariable { ref name, .. } if name == "nope"));
        assert!(ev.distance(&expr("__SHADOWDP_index"), Version::Aligned).unwrap().is_zero());
    }

    #[test]
    fn divergence_follows_shadow_distances() {
        let (env, arrays) = setup();
        let ev = Evaluator::new(&env, &arrays);
        assert!(ev.may_diverge(&expr("q[i] > 0")).unwrap());
        assert!(!ev.may_diverge(&expr("eta > i")).unwrap());
    }
}
