#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use shadow_ast::{BinOp, Expr, Span};

use crate::names::{self, Version};
use crate::ratio::Ratio;
use crate::sym::Sym;

/// A materialized distance: the runtime variable
/// `__SHADOWDP_<VERSION>_DISTANCE_<var>`, indexed for input arrays.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeRef {
    pub version: Version,
    pub var: String,
    pub index: Option<Sym>,
}

impl RuntimeRef {
    pub fn to_sym(&self) -> Sym {
        let name = self.version.distance_var(&self.var);
        match &self.index {
            Some(i) => Sym::Index(name, Box::new(i.clone())),
            None => Sym::Var(name),
        }
    }
}

/// Non-linear building blocks of a distance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Atom {
    Runtime(RuntimeRef),
    /// A program quantity used directly as a distance term.
    Value(Sym),
    /// `factor * d` where `factor` has no distance of its own.
    Scaled(Sym, Box<Distance>),
    /// `cond ? a : b`.
    Select(Sym, Box<Distance>, Box<Distance>),
}

/// Distance expression in linear normal form: `constant + Σ coeff·atom`.
///
/// Terms are kept sorted and merged, so structurally equal distances are
/// equal values and `x - x` folds to zero on construction. Operations that
/// fold coefficients return `None` when a coefficient overflows.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance {
    constant: Ratio,
    terms: Vec<(Atom, Ratio)>,
}

impl Distance {
    pub fn zero() -> Self {
        Distance::default()
    }

    pub fn constant(c: Ratio) -> Self {
        Distance {
            constant: c,
            terms: Vec::new(),
        }
    }

    pub fn runtime(version: Version, var: impl Into<String>, index: Option<Sym>) -> Self {
        Distance::atom(Atom::Runtime(RuntimeRef {
            version,
            var: var.into(),
            index,
        }))
    }

    pub fn value(s: Sym) -> Self {
        match s.as_num() {
            Some(c) => Distance::constant(c),
            None => Distance::atom(Atom::Value(s)),
        }
    }

    fn atom(atom: Atom) -> Self {
        Distance {
            constant: Ratio::ZERO,
            terms: vec![(atom, Ratio::ONE)],
        }
    }

    /// `cond ? a : b`, collapsing when both arms agree or `cond` is a literal.
    pub fn select(cond: Sym, a: Distance, b: Distance) -> Self {
        if a == b {
            return a;
        }
        if let Some(c) = cond.as_num() {
            return if c.is_zero() { b } else { a };
        }
        Distance::atom(Atom::Select(cond, Box::new(a), Box::new(b)))
    }

    /// `factor * d` for a factor without distance of its own.
    pub fn scaled(factor: &Sym, d: &Distance) -> Option<Self> {
        if let Some(c) = factor.as_num() {
            return d.scale(c);
        }
        if d.is_zero() {
            return Some(Distance::zero());
        }
        if let Some(c) = d.as_constant() {
            return Distance::value(factor.clone()).scale(c);
        }
        Some(Distance::atom(Atom::Scaled(factor.clone(), Box::new(d.clone()))))
    }

    fn from_terms(constant: Ratio, terms: BTreeMap<Atom, Ratio>) -> Self {
        Distance {
            constant,
            terms: terms.into_iter().filter(|(_, c)| !c.is_zero()).collect(),
        }
    }

    pub fn add(&self, other: &Distance) -> Option<Distance> {
        let mut terms: BTreeMap<Atom, Ratio> = BTreeMap::new();
        for (atom, c) in self.terms.iter().chain(other.terms.iter()) {
            let slot = terms.entry(atom.clone()).or_insert(Ratio::ZERO);
            *slot = slot.checked_add(*c)?;
        }
        Some(Distance::from_terms(self.constant.checked_add(other.constant)?, terms))
    }

    pub fn sub(&self, other: &Distance) -> Option<Distance> {
        self.add(&other.neg())
    }

    pub fn neg(&self) -> Distance {
        Distance {
            constant: -self.constant,
            terms: self.terms.iter().map(|(a, c)| (a.clone(), -*c)).collect(),
        }
    }

    pub fn scale(&self, k: Ratio) -> Option<Distance> {
        if k.is_zero() {
            return Some(Distance::zero());
        }
        Some(Distance {
            constant: self.constant.checked_mul(k)?,
            terms: self
                .terms
                .iter()
                .map(|(a, c)| Some((a.clone(), c.checked_mul(k)?)))
                .collect::<Option<_>>()?,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.constant.is_zero() && self.terms.is_empty()
    }

    pub fn as_constant(&self) -> Option<Ratio> {
        self.terms.is_empty().then_some(self.constant)
    }

    /// `Some(r)` if this distance is exactly the runtime variable `r`.
    pub fn as_runtime(&self) -> Option<&RuntimeRef> {
        match self.terms.as_slice() {
            [(Atom::Runtime(r), c)] if *c == Ratio::ONE && self.constant.is_zero() => Some(r),
            _ => None,
        }
    }

    /// Resolve every selection on `cond` to the arm taken when `cond` has
    /// the value `truth`.
    pub fn specialize(&self, cond: &Sym, truth: bool) -> Option<Distance> {
        self.rebuild(&mut |atom| match atom {
            Atom::Select(c, a, b) if c == cond => {
                Some(if truth { a.specialize(cond, truth) } else { b.specialize(cond, truth) })
            }
            _ => None,
        })
    }

    /// Replace runtime references for which `f` has a better answer.
    pub fn substitute(&self, f: &dyn Fn(&RuntimeRef) -> Option<Distance>) -> Option<Distance> {
        self.rebuild(&mut |atom| match atom {
            Atom::Runtime(r) => f(r).map(Some),
            _ => None,
        })
    }

    /// Rebuild bottom-up, letting `f` replace an atom before recursing into
    /// the atoms it did not claim. A claimed atom whose replacement
    /// overflowed comes back as `Some(None)`.
    fn rebuild(&self, f: &mut dyn FnMut(&Atom) -> Option<Option<Distance>>) -> Option<Distance> {
        let mut out = Distance::constant(self.constant);
        for (atom, c) in &self.terms {
            let replaced = match f(atom) {
                Some(d) => d?,
                None => match atom {
                    Atom::Runtime(_) | Atom::Value(_) => Distance::atom(atom.clone()),
                    Atom::Scaled(factor, d) => Distance::scaled(factor, &d.rebuild(f)?)?,
                    Atom::Select(cond, a, b) => {
                        Distance::select(cond.clone(), a.rebuild(f)?, b.rebuild(f)?)
                    }
                },
            };
            out = out.add(&replaced.scale(*c)?)?;
        }
        Some(out)
    }

    /// Split on the first selection: `(cond, self[then], self[else])`.
    pub fn split_select(&self) -> Option<(Sym, Distance, Distance)> {
        let idx = self
            .terms
            .iter()
            .position(|(atom, _)| matches!(atom, Atom::Select(..)))?;
        let (Atom::Select(cond, a, b), k) = &self.terms[idx] else {
            return None;
        };
        let mut rest = self.clone();
        rest.terms.remove(idx);
        Some((cond.clone(), rest.add(&a.scale(*k)?)?, rest.add(&b.scale(*k)?)?))
    }

    /// True when the program variable `name` occurs in this distance, in a
    /// subscript, a selector condition or a scale factor. Runtime distance
    /// variables are not program variables and do not count.
    pub fn mentions(&self, name: &str) -> bool {
        self.terms.iter().any(|(atom, _)| match atom {
            Atom::Runtime(r) => r.index.as_ref().is_some_and(|i| i.mentions(name)),
            Atom::Value(s) => s.mentions(name),
            Atom::Scaled(f, d) => f.mentions(name) || d.mentions(name),
            Atom::Select(c, a, b) => c.mentions(name) || a.mentions(name) || b.mentions(name),
        })
    }

    /// True when the scalar runtime variable of `var` in `version` is read.
    pub fn reads_runtime(&self, version: Version, var: &str) -> bool {
        self.terms.iter().any(|(atom, _)| match atom {
            Atom::Runtime(r) => r.version == version && r.var == var && r.index.is_none(),
            Atom::Value(_) => false,
            Atom::Scaled(_, d) => d.reads_runtime(version, var),
            Atom::Select(_, a, b) => a.reads_runtime(version, var) || b.reads_runtime(version, var),
        })
    }

    /// Read a distance written in source form, where distance variables
    /// appear by their reserved names (`-__SHADOWDP_ALIGNED_DISTANCE_q[i]`).
    /// `None` if the expression leaves the linear fragment or a coefficient
    /// overflows.
    pub fn from_sym(s: &Sym) -> Option<Distance> {
        match s {
            Sym::Num(r) | Sym::Float(r) => Some(Distance::constant(*r)),
            Sym::Var(name) => Some(match names::parse_distance_var(name) {
                Some((version, var)) => Distance::runtime(version, var, None),
                None => Distance::value(s.clone()),
            }),
            Sym::Index(name, idx) => Some(match names::parse_distance_var(name) {
                Some((version, var)) => Distance::runtime(version, var, Some((**idx).clone())),
                None => Distance::value(s.clone()),
            }),
            Sym::Unary(shadow_ast::UnaryOp::Neg, e) => Some(Distance::from_sym(e)?.neg()),
            Sym::Binary(l, BinOp::Add, r) => Distance::from_sym(l)?.add(&Distance::from_sym(r)?),
            Sym::Binary(l, BinOp::Sub, r) => Distance::from_sym(l)?.sub(&Distance::from_sym(r)?),
            Sym::Binary(l, BinOp::Mul, r) => {
                let (dl, dr) = (Distance::from_sym(l)?, Distance::from_sym(r)?);
                match (dl.has_runtime(), dr.has_runtime()) {
                    (false, false) => Some(Distance::value(s.clone())),
                    (true, false) => Distance::scaled(r, &dl),
                    (false, true) => Distance::scaled(l, &dr),
                    (true, true) => None,
                }
            }
            Sym::Ternary(c, a, b) => Some(Distance::select(
                (**c).clone(),
                Distance::from_sym(a)?,
                Distance::from_sym(b)?,
            )),
            other if !mentions_distance_var(other) => Some(Distance::value(other.clone())),
            _ => None,
        }
    }

    /// Every runtime variable read, in term order.
    pub fn runtime_refs(&self) -> Vec<&RuntimeRef> {
        let mut out = Vec::new();
        for (atom, _) in &self.terms {
            match atom {
                Atom::Runtime(r) => out.push(r),
                Atom::Value(_) => {}
                Atom::Scaled(_, d) => out.extend(d.runtime_refs()),
                Atom::Select(_, a, b) => {
                    out.extend(a.runtime_refs());
                    out.extend(b.runtime_refs());
                }
            }
        }
        out
    }

    fn has_runtime(&self) -> bool {
        self.terms.iter().any(|(atom, _)| match atom {
            Atom::Runtime(_) => true,
            Atom::Value(_) => false,
            Atom::Scaled(_, d) => d.has_runtime(),
            Atom::Select(_, a, b) => a.has_runtime() || b.has_runtime(),
        })
    }

    pub fn to_sym(&self) -> Sym {
        let mut acc: Option<Sym> = None;
        for (atom, c) in &self.terms {
            let body = atom_sym(atom);
            let magnitude = Sym::times(Sym::Num(c.abs()), body);
            acc = Some(match acc {
                None if c.is_negative() => Sym::negate(magnitude),
                None => magnitude,
                Some(prev) if c.is_negative() => Sym::binary(prev, BinOp::Sub, magnitude),
                Some(prev) => Sym::binary(prev, BinOp::Add, magnitude),
            });
        }
        match acc {
            None => Sym::Num(self.constant),
            Some(s) if self.constant.is_zero() => s,
            Some(s) if self.constant.is_negative() => {
                Sym::binary(s, BinOp::Sub, Sym::Num(self.constant.abs()))
            }
            Some(s) => Sym::binary(s, BinOp::Add, Sym::Num(self.constant)),
        }
    }

    pub fn to_expr(&self, span: Span) -> Expr {
        self.to_sym().to_expr(span)
    }
}

fn atom_sym(atom: &Atom) -> Sym {
    match atom {
        Atom::Runtime(r) => r.to_sym(),
        Atom::Value(s) => s.clone(),
        Atom::Scaled(f, d) => Sym::times(f.clone(), d.to_sym()),
        Atom::Select(c, a, b) => Sym::ternary(c.clone(), a.to_sym(), b.to_sym()),
    }
}

fn mentions_distance_var(s: &Sym) -> bool {
    match s {
        Sym::Num(_) | Sym::Float(_) => false,
        Sym::Var(v) => names::parse_distance_var(v).is_some(),
        Sym::Index(a, i) => names::parse_distance_var(a).is_some() || mentions_distance_var(i),
        Sym::Unary(_, e) => mentions_distance_var(e),
        Sym::Binary(l, _, r) => mentions_distance_var(l) || mentions_distance_var(r),
        Sym::Ternary(c, a, b) => {
            mentions_distance_var(c) || mentions_distance_var(a) || mentions_distance_var(b)
        }
        Sym::Call(_, args) => args.iter().any(mentions_distance_var),
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_sym(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(n: i128) -> Distance {
        Distance::constant(Ratio::integer(n))
    }

    fn q_at(i: &str) -> Distance {
        Distance::runtime(Version::Aligned, "q", Some(Sym::var(i)))
    }

    #[test]
    fn x_minus_x_is_zero() {
        let d = q_at("i").add(&c(2)).unwrap();
        assert!(d.sub(&d).unwrap().is_zero());
    }

    #[test]
    fn constants_fold() {
        assert_eq!(c(2).add(&c(3)).unwrap().as_constant(), Some(Ratio::integer(5)));
        assert_eq!(c(2).scale(Ratio::new(1, 2).unwrap()).unwrap().as_constant(), Some(Ratio::ONE));
    }

    #[test]
    fn coefficient_overflow_is_none() {
        let big = Ratio::integer(10i128.pow(20));
        let d = q_at("i").scale(big).unwrap();
        assert_eq!(d.scale(big), None);
        assert_eq!(c(i128::MAX).add(&c(1)), None);
        let huge = Distance::runtime(Version::Aligned, "x", None).scale(Ratio::integer(i128::MAX)).unwrap();
        assert_eq!(huge.add(&huge), None);
        assert_eq!(Distance::scaled(&Sym::num(big), &d), None);
    }

    #[test]
    fn renders_terms_before_constant() {
        let d = q_at("i").add(&c(2)).unwrap();
        assert_eq!(d.to_string(), "__SHADOWDP_ALIGNED_DISTANCE_q[i] + 2");
        let neg = q_at("i").neg();
        assert_eq!(neg.to_string(), "-__SHADOWDP_ALIGNED_DISTANCE_q[i]");
    }

    #[test]
    fn select_specializes_on_matching_condition() {
        let cond = Sym::var("b");
        let d = Distance::select(cond.clone(), c(2), Distance::zero());
        assert_eq!(d.specialize(&cond, true), Some(c(2)));
        assert!(d.specialize(&cond, false).unwrap().is_zero());
        assert_eq!(d.specialize(&Sym::var("other"), true), Some(d.clone()));
    }

    #[test]
    fn split_select_distributes_the_rest() {
        let cond = Sym::var("b");
        let d = Distance::select(cond.clone(), c(2), Distance::zero()).add(&c(1)).unwrap();
        let (got, a, b) = d.split_select().unwrap();
        assert_eq!(got, cond);
        assert_eq!(a, c(3));
        assert_eq!(b, c(1));
    }

    #[test]
    fn reads_source_form_distances() {
        let s = Sym::from_expr(
            &shadow_parse::parse_expr("-__SHADOWDP_ALIGNED_DISTANCE_sum - __SHADOWDP_ALIGNED_DISTANCE_q[i]")
                .unwrap(),
        )
        .unwrap();
        let d = Distance::from_sym(&s).unwrap();
        let expected = Distance::runtime(Version::Aligned, "sum", None).neg().sub(&q_at("i")).unwrap();
        assert_eq!(d, expected);
        assert!(d.reads_runtime(Version::Aligned, "sum"));
        assert!(!d.reads_runtime(Version::Shadow, "sum"));
    }

    #[test]
    fn mentions_subscripts_only() {
        assert!(q_at("i").mentions("i"));
        assert!(!q_at("i").mentions("q"));
        assert!(!q_at("i").mentions("j"));
    }
}
