#![forbid(unsafe_code)]

use std::fmt;

use shadow_ast::{BinOp, Block, IfStmt, Span, Stmt};

use crate::annotation::NoiseScale;
use crate::distance::Distance;
use crate::env::Selector;
use crate::names::V_EPSILON;
use crate::policy::assertion;
use crate::ratio::Ratio;
use crate::sym::Sym;
use crate::Primitives;

/// `coeff · ε / Π divisors`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CostExpr {
    pub coeff: Ratio,
    pub divisors: Vec<String>,
}

impl CostExpr {
    fn at_scale(amount: Ratio, scale: &NoiseScale) -> Option<Self> {
        Some(CostExpr {
            coeff: amount.abs().checked_div(scale.numerator)?,
            divisors: scale.factors.clone(),
        })
    }

    pub fn to_sym(&self, epsilon: &Sym) -> Sym {
        let mut acc = Sym::times(Sym::num(self.coeff), epsilon.clone());
        if self.divisors.is_empty() {
            return acc;
        }
        if let Some(r) = acc.as_num() {
            acc = Sym::Float(r);
        }
        for d in &self.divisors {
            acc = Sym::binary(acc, BinOp::Div, Sym::var(d.clone()));
        }
        acc
    }
}

/// Privacy spent by one draw, as a function of the path taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cost {
    Free,
    Fixed(CostExpr),
    /// Charged only where the distance is not zero; the distance must stay
    /// within `bound` there.
    Gated {
        distance: Distance,
        bound: Ratio,
        cost: CostExpr,
    },
    Branch {
        cond: Sym,
        then: Box<Cost>,
        otherwise: Box<Cost>,
    },
}

impl Cost {
    /// Cost of aligning a draw at `scale` by `distance`: `|d| / k · ε`.
    /// `None` if the coefficient overflows.
    pub fn of(distance: &Distance, scale: &NoiseScale, bound: Ratio) -> Option<Cost> {
        if distance.is_zero() {
            return Some(Cost::Free);
        }
        if let Some((cond, a, b)) = distance.split_select() {
            let (then, otherwise) = (Cost::of(&a, scale, bound)?, Cost::of(&b, scale, bound)?);
            if then == otherwise {
                return Some(then);
            }
            return Some(Cost::Branch {
                cond,
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Some(match distance.as_constant() {
            Some(c) => Cost::Fixed(CostExpr::at_scale(c, scale)?),
            None => Cost::Gated {
                distance: distance.clone(),
                bound,
                cost: CostExpr::at_scale(bound, scale)?,
            },
        })
    }

    /// The cost as one expression, unless some part of it is gated.
    fn inline(&self, epsilon: &Sym) -> Option<Sym> {
        match self {
            Cost::Free => Some(Sym::num(Ratio::ZERO)),
            Cost::Fixed(c) => Some(c.to_sym(epsilon)),
            Cost::Gated { .. } => None,
            Cost::Branch { cond, then, otherwise } => Some(Sym::ternary(
                cond.clone(),
                then.inline(epsilon)?,
                otherwise.inline(epsilon)?,
            )),
        }
    }

    /// Largest amount any path may charge, when the paths are comparable.
    pub fn worst_case(&self) -> Option<CostExpr> {
        match self {
            Cost::Free => Some(CostExpr {
                coeff: Ratio::ZERO,
                divisors: Vec::new(),
            }),
            Cost::Fixed(c) | Cost::Gated { cost: c, .. } => Some(c.clone()),
            Cost::Branch { then, otherwise, .. } => {
                let (a, b) = (then.worst_case()?, otherwise.worst_case()?);
                if a.coeff.is_zero() {
                    return Some(b);
                }
                if b.coeff.is_zero() || (a.divisors == b.divisors && a.coeff >= b.coeff) {
                    return Some(a);
                }
                (a.divisors == b.divisors).then_some(b)
            }
        }
    }
}

impl fmt::Display for CostExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_sym(&Sym::var("epsilon")), f)
    }
}

/// Emits the running privacy total `__SHADOWDP_v_epsilon`.
pub struct Accumulator<'a> {
    pub epsilon: Sym,
    pub goal: Option<Ratio>,
    pub primitives: &'a Primitives,
}

impl Accumulator<'_> {
    fn total() -> Sym {
        Sym::var(V_EPSILON)
    }

    /// `float __SHADOWDP_v_epsilon = 0;`
    pub fn declare(&self, span: Span) -> Stmt {
        Stmt::decl(
            shadow_ast::CType::Float,
            V_EPSILON,
            Some(Sym::num(Ratio::ZERO).to_expr(span)),
            span,
        )
    }

    /// Statements charging `cost` after a draw whose selector is `selector`.
    /// `SHADOW` restarts the total from zero, since the aligned run adopts
    /// the shadow run's history from that point.
    pub fn charge(&self, selector: &Selector, cost: &Cost, span: Span) -> Vec<Stmt> {
        let total = Self::total();
        let base = selector.choose_sym(&total, &Sym::num(Ratio::ZERO));
        if let Some(c) = cost.inline(&self.epsilon) {
            let next = fuse(base, c);
            if next == total {
                return Vec::new();
            }
            return vec![Stmt::assign(V_EPSILON, next.to_expr(span), span)];
        }
        let mut out = Vec::new();
        if base != total {
            out.push(Stmt::assign(V_EPSILON, base.to_expr(span), span));
        }
        out.extend(self.lower(cost, span));
        out
    }

    fn lower(&self, cost: &Cost, span: Span) -> Vec<Stmt> {
        let total = Self::total();
        match cost {
            Cost::Free => Vec::new(),
            Cost::Fixed(c) => vec![Stmt::assign(
                V_EPSILON,
                Sym::plus(total, c.to_sym(&self.epsilon)).to_expr(span),
                span,
            )],
            Cost::Gated { distance, bound, cost } => {
                let abs = Sym::call("Abs", vec![distance.to_sym()]);
                let body = vec![
                    assertion(
                        self.primitives,
                        Sym::binary(abs.clone(), BinOp::Le, Sym::num(*bound)).to_expr(span),
                        span,
                    ),
                    Stmt::assign(V_EPSILON, Sym::plus(total, cost.to_sym(&self.epsilon)).to_expr(span), span),
                ];
                vec![Stmt::If(IfStmt {
                    span,
                    cond: Sym::binary(abs, BinOp::Gt, Sym::num(Ratio::ZERO)).to_expr(span),
                    then_block: Block::new(span, body),
                    else_block: None,
                })]
            }
            Cost::Branch { cond, then, otherwise } => {
                let (a, b) = (self.lower(then, span), self.lower(otherwise, span));
                vec![Stmt::If(IfStmt {
                    span,
                    cond: cond.to_expr(span),
                    then_block: Block::new(span, a),
                    else_block: (!b.is_empty()).then(|| Block::new(span, b)),
                })]
            }
        }
    }

    /// `assert(__SHADOWDP_v_epsilon <= epsilon)`, scaled by the goal.
    pub fn final_check(&self, span: Span) -> Stmt {
        let limit = match self.goal {
            Some(g) => Sym::times(self.epsilon.clone(), Sym::num(g)),
            None => self.epsilon.clone(),
        };
        assertion(
            self.primitives,
            Sym::binary(Self::total(), BinOp::Le, limit).to_expr(span),
            span,
        )
    }
}

/// `a + b` pushed through ternaries, so that `c ? x : y` plus `c ? u : v`
/// becomes `c ? x + u : y + v`.
fn fuse(a: Sym, b: Sym) -> Sym {
    match (a, b) {
        (Sym::Ternary(c1, x, y), Sym::Ternary(c2, u, v)) if c1 == c2 => {
            Sym::ternary(*c1, fuse(*x, *u), fuse(*y, *v))
        }
        (Sym::Ternary(c, x, y), b) => Sym::ternary(*c, fuse(*x, b.clone()), fuse(*y, b)),
        (a, Sym::Ternary(c, u, v)) => Sym::ternary(*c, fuse(a.clone(), *u), fuse(a, *v)),
        (a, b) => Sym::plus(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::Version;

    fn scale(k: i128, factors: &[&str]) -> NoiseScale {
        NoiseScale {
            numerator: Ratio::integer(k),
            factors: factors.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn render(stmts: &[Stmt]) -> String {
        stmts.iter().map(shadow_parse::format_stmt).collect()
    }

    #[test]
    fn constant_distance_costs_fraction_of_epsilon() {
        let cost = Cost::of(&Distance::constant(Ratio::integer(1)), &scale(3, &["NN"]), Ratio::ONE).unwrap();
        let Cost::Fixed(c) = &cost else { panic!("expected fixed cost") };
        assert_eq!(c.coeff, Ratio::new(1, 3).unwrap());
        assert_eq!(c.to_string(), "1.0 / 3.0 * epsilon / NN");
    }

    #[test]
    fn overflowing_coefficient_has_no_cost() {
        let tiny = NoiseScale {
            numerator: Ratio::new(1, 10i128.pow(30)).unwrap(),
            factors: Vec::new(),
        };
        let d = Distance::constant(Ratio::integer(10i128.pow(20)));
        assert_eq!(Cost::of(&d, &tiny, Ratio::ONE), None);
    }

    #[test]
    fn shadow_selection_restarts_total() {
        let prims = Primitives::default();
        let acc = Accumulator {
            epsilon: Sym::var("epsilon"),
            goal: None,
            primitives: &prims,
        };
        let cond = Sym::binary(Sym::var("x"), BinOp::Gt, Sym::var("bq"));
        let d = Distance::select(cond.clone(), Distance::constant(Ratio::integer(2)), Distance::zero());
        let selector = Selector::Choose {
            cond,
            then: Box::new(Selector::Shadow),
            otherwise: Box::new(Selector::Aligned),
        };
        let stmts = acc.charge(&selector, &Cost::of(&d, &scale(2, &[]), Ratio::ONE).unwrap(), shadow_ast::span(0, 0));
        assert_eq!(render(&stmts), "__SHADOWDP_v_epsilon = x > bq ? epsilon : __SHADOWDP_v_epsilon;\n");
    }

    #[test]
    fn symbolic_distance_is_gated() {
        let prims = Primitives::default();
        let acc = Accumulator {
            epsilon: Sym::var("epsilon"),
            goal: None,
            primitives: &prims,
        };
        let d = Distance::runtime(Version::Aligned, "q", Some(Sym::var("i"))).neg();
        let stmts = acc.charge(&Selector::Aligned, &Cost::of(&d, &scale(1, &[]), Ratio::ONE).unwrap(), shadow_ast::span(0, 0));
        assert_eq!(
            render(&stmts),
            "if (Abs(-__SHADOWDP_ALIGNED_DISTANCE_q[i]) > 0) {\n    assert(Abs(-__SHADOWDP_ALIGNED_DISTANCE_q[i]) <= 1);\n    __SHADOWDP_v_epsilon = __SHADOWDP_v_epsilon + epsilon;\n}\n"
        );
    }

    #[test]
    fn free_draw_under_aligned_selection_emits_nothing() {
        let prims = Primitives::default();
        let acc = Accumulator {
            epsilon: Sym::var("epsilon"),
            goal: Some(Ratio::integer(2)),
            primitives: &prims,
        };
        assert!(acc.charge(&Selector::Aligned, &Cost::Free, shadow_ast::span(0, 0)).is_empty());
        assert_eq!(
            shadow_parse::format_stmt(&acc.final_check(shadow_ast::span(0, 0))),
            "assert(__SHADOWDP_v_epsilon <= epsilon * 2);\n"
        );
    }
}
