#![forbid(unsafe_code)]

use std::fmt;

use shadow_ast::{BinOp, Expr, IfStmt, Block, Span, Stmt};

use crate::names::{self, Version};
use crate::ratio::Ratio;
use crate::sym::Sym;
use crate::Primitives;

/// How two adjacent inputs may differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjacencyPolicy {
    /// Every array element may differ by at most the element bound.
    AllDiffer,
    /// One nondeterministically chosen element may differ; the rest are equal.
    OneDiffer,
}

impl AdjacencyPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ALL_DIFFER" => Some(AdjacencyPolicy::AllDiffer),
            "ONE_DIFFER" => Some(AdjacencyPolicy::OneDiffer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdjacencyPolicy::AllDiffer => "ALL_DIFFER",
            AdjacencyPolicy::OneDiffer => "ONE_DIFFER",
        }
    }
}

impl fmt::Display for AdjacencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the assumptions an adjacency policy places on the input.
pub struct Policy<'a> {
    pub adjacency: AdjacencyPolicy,
    pub element_bound: Ratio,
    pub primitives: &'a Primitives,
}

impl Policy<'_> {
    fn assume(&self, cond: Sym, span: Span) -> Stmt {
        Stmt::call(&self.primitives.assume, vec![cond.to_expr(span)], span)
    }

    /// `assume(epsilon > 0)` and, with a size parameter, `assume(size > 0)`.
    pub fn entry_assumes(&self, epsilon: &str, size: Option<&str>, span: Span) -> Vec<Stmt> {
        let positive = |name: &str| Sym::binary(Sym::var(name), BinOp::Gt, Sym::num(Ratio::ZERO));
        let mut out = vec![self.assume(positive(epsilon), span)];
        if let Some(size) = size {
            out.push(self.assume(positive(size), span));
        }
        out
    }

    /// Range of the differing index under ONE_DIFFER; nothing otherwise.
    pub fn differing_index_assumes(&self, size: &str, span: Span) -> Vec<Stmt> {
        if self.adjacency != AdjacencyPolicy::OneDiffer {
            return Vec::new();
        }
        let index = Sym::var(names::DIFFERING_INDEX);
        vec![
            self.assume(Sym::binary(index.clone(), BinOp::Ge, Sym::num(Ratio::ZERO)), span),
            self.assume(Sym::binary(index, BinOp::Lt, Sym::var(size)), span),
        ]
    }

    /// Constraints on the runtime distances of `array[subscript]`.
    pub fn query_assumes(&self, array: &str, subscript: &Sym, span: Span) -> Vec<Stmt> {
        let element = |version: Version| Sym::Index(version.distance_var(array), Box::new(subscript.clone()));
        let (aligned, shadow) = (element(Version::Aligned), element(Version::Shadow));
        let bound = Sym::num(self.element_bound);
        let bounded = vec![
            self.assume(Sym::binary(aligned.clone(), BinOp::Le, bound.clone()), span),
            self.assume(Sym::binary(aligned.clone(), BinOp::Ge, Sym::negate(bound)), span),
            self.assume(Sym::binary(shadow.clone(), BinOp::Eq, aligned.clone()), span),
        ];
        match self.adjacency {
            AdjacencyPolicy::AllDiffer => bounded,
            AdjacencyPolicy::OneDiffer => {
                let equal = vec![
                    self.assume(Sym::binary(shadow, BinOp::Eq, aligned.clone()), span),
                    self.assume(Sym::binary(aligned, BinOp::Eq, Sym::num(Ratio::ZERO)), span),
                ];
                let is_differing = Sym::binary(subscript.clone(), BinOp::Eq, Sym::var(names::DIFFERING_INDEX));
                vec![Stmt::If(IfStmt {
                    span,
                    cond: is_differing.to_expr(span),
                    then_block: Block::new(span, bounded),
                    else_block: Some(Block::new(span, equal)),
                })]
            }
        }
    }
}

/// `assert(cond)` with the configured primitive.
pub(crate) fn assertion(primitives: &Primitives, cond: Expr, span: Span) -> Stmt {
    Stmt::call(&primitives.assert, vec![cond], span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(stmts: &[Stmt]) -> Vec<String> {
        stmts.iter().map(shadow_parse::format_stmt).collect()
    }

    #[test]
    fn all_differ_bounds_every_element() {
        let prims = Primitives::default();
        let policy = Policy {
            adjacency: AdjacencyPolicy::AllDiffer,
            element_bound: Ratio::ONE,
            primitives: &prims,
        };
        let got = render(&policy.query_assumes("q", &Sym::var("i"), shadow_ast::span(0, 0)));
        assert_eq!(
            got,
            [
                "assume(__SHADOWDP_ALIGNED_DISTANCE_q[i] <= 1);\n",
                "assume(__SHADOWDP_ALIGNED_DISTANCE_q[i] >= -1);\n",
                "assume(__SHADOWDP_SHADOW_DISTANCE_q[i] == __SHADOWDP_ALIGNED_DISTANCE_q[i]);\n",
            ]
        );
    }

    #[test]
    fn one_differ_branches_on_the_differing_index() {
        let prims = Primitives::default();
        let policy = Policy {
            adjacency: AdjacencyPolicy::OneDiffer,
            element_bound: Ratio::ONE,
            primitives: &prims,
        };
        let got = policy.query_assumes("q", &Sym::var("i"), shadow_ast::span(0, 0));
        assert_eq!(got.len(), 1);
        let text = shadow_parse::format_stmt(&got[0]);
        assert!(text.starts_with("if (i == __SHADOWDP_index) {"));
        assert!(text.contains("assume(__SHADOWDP_ALIGNED_DISTANCE_q[i] == 0);"));
        assert_eq!(policy.differing_index_assumes("size", shadow_ast::span(0, 0)).len(), 2);
    }
}
