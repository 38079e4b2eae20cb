#![forbid(unsafe_code)]

//! Annotation pre-pass: the header strings and every `Lap` annotation are
//! parsed once, before instrumentation walks the body.

use indexmap::IndexMap;
use shadow_ast::{BinOp, Expr, ExprKind, FunctionDef, Span, Stmt};
use shadow_parse::parse_expr_at;

use crate::env::Selector;
use crate::error::TransformError;
use crate::names;
use crate::policy::AdjacencyPolicy;
use crate::ratio::Ratio;
use crate::sym::Sym;

pub const NOISE_FN: &str = "Lap";
const ASSUME_FN: &str = "assume";

/// Declared distance of one parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sensitivity {
    Fixed(Ratio),
    /// `*`: determined per element by the adjacency policy.
    Dynamic,
}

impl Sensitivity {
    pub fn is_zero(&self) -> bool {
        matches!(self, Sensitivity::Fixed(r) if r.is_zero())
    }
}

#[derive(Clone, Debug)]
pub struct ParamInfo {
    pub name: String,
    pub is_array: bool,
    pub sensitivity: Sensitivity,
}

#[derive(Clone, Debug)]
pub struct FunctionHeader {
    pub policy: AdjacencyPolicy,
    pub assumptions: Vec<Expr>,
    pub params: Vec<ParamInfo>,
    pub epsilon: String,
    pub size: Option<String>,
}

impl FunctionHeader {
    pub fn param(&self, name: &str) -> Option<&ParamInfo> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Noise scale `numerator * Π factors / epsilon`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoiseScale {
    pub numerator: Ratio,
    pub factors: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct NoiseSite {
    pub span: Span,
    pub variable: String,
    pub scale: NoiseScale,
    pub selector: Selector,
    pub distance: Sym,
}

/// Everything the instrumenter needs from the annotations of one function.
#[derive(Clone, Debug)]
pub struct Annotations {
    pub header: FunctionHeader,
    /// Index of the first body statement after the two header strings.
    pub body_start: usize,
    /// Noise sites keyed by the source offset of their `Lap` call.
    pub sites: IndexMap<usize, NoiseSite>,
}

impl Annotations {
    pub fn site(&self, call: &Expr) -> Option<&NoiseSite> {
        self.sites.get(&call.span.offset())
    }

    /// Shadow tracking is needed only if some draw may select it.
    pub fn shadow_enabled(&self) -> bool {
        self.sites.values().any(|s| s.selector.mentions_shadow())
    }
}

pub fn parse_annotations(func: &FunctionDef) -> Result<Annotations, TransformError> {
    let header = parse_header(func)?;
    let mut sites = IndexMap::new();
    collect_sites(&func.body.stmts[2..], &header, &mut sites)?;
    Ok(Annotations {
        header,
        body_start: 2,
        sites,
    })
}

fn header_string(func: &FunctionDef, idx: usize, what: &str) -> Result<(String, Span), TransformError> {
    match func.body.stmts.get(idx) {
        Some(Stmt::ExprStmt(e)) => match e.as_string_lit() {
            Some(text) => Ok((text.to_string(), e.span)),
            None => Err(TransformError::annotation(format!("expected the {what} string here"), e.span)),
        },
        Some(other) => Err(TransformError::annotation(
            format!("expected the {what} string here"),
            other.span(),
        )),
        None => Err(TransformError::annotation(
            format!("function `{}` has no {what} string", func.name.node),
            func.name.span,
        )),
    }
}

fn parse_header(func: &FunctionDef) -> Result<FunctionHeader, TransformError> {
    for p in &func.params {
        let Some(name) = p.name() else { continue };
        if names::is_instrumentation_artifact(name) {
            return Err(TransformError::annotation(
                format!("parameter `{name}` is an instrumentation artifact; this function is already instrumented"),
                p.span,
            ));
        }
    }

    let (policy_text, policy_span) = header_string(func, 0, "adjacency policy")?;
    let mut clauses = split_clauses(&policy_text).into_iter();
    let Some((off, first)) = clauses.next() else {
        return Err(TransformError::annotation("the adjacency policy is empty", policy_span));
    };
    let policy = AdjacencyPolicy::parse(first).ok_or_else(|| {
        TransformError::annotation(
            format!("unknown adjacency policy `{first}`, expected ALL_DIFFER or ONE_DIFFER"),
            inner_span(policy_span, off, first.len()),
        )
    })?;
    let mut assumptions = Vec::new();
    for (off, clause) in clauses {
        let e = parse_clause(clause, policy_span, off)?;
        match &e.kind {
            ExprKind::Call { callee, args } if callee.node == ASSUME_FN && args.len() == 1 => {
                assumptions.push(args[0].clone());
            }
            _ => {
                return Err(TransformError::annotation(
                    "only `assume(<expr>)` may follow the adjacency policy",
                    e.span,
                ));
            }
        }
    }

    let (sens_text, sens_span) = header_string(func, 1, "sensitivity")?;
    let mut declared: IndexMap<String, Sensitivity> = IndexMap::new();
    for (off, clause) in split_clauses(&sens_text) {
        let (name, sensitivity) = parse_sensitivity(clause, sens_span, off)?;
        if declared.insert(name.clone(), sensitivity).is_some() {
            return Err(TransformError::annotation(
                format!("sensitivity of `{name}` is declared twice"),
                inner_span(sens_span, off, clause.len()),
            ));
        }
    }

    let mut params = Vec::new();
    for p in &func.params {
        let Some(name) = p.name() else {
            return Err(TransformError::annotation("parameters must be named", p.span));
        };
        let sensitivity = declared.shift_remove(name).ok_or_else(|| {
            TransformError::annotation(format!("no sensitivity declared for parameter `{name}`"), sens_span)
        })?;
        if sensitivity == Sensitivity::Dynamic && !p.is_array {
            return Err(TransformError::policy(
                format!("`*` sensitivity needs an array, but `{name}` is a scalar"),
                p.span,
            ));
        }
        params.push(ParamInfo {
            name: name.to_string(),
            is_array: p.is_array,
            sensitivity,
        });
    }
    if let Some(extra) = declared.keys().next() {
        return Err(TransformError::annotation(
            format!("sensitivity declared for `{extra}`, which is not a parameter"),
            sens_span,
        ));
    }

    let epsilon = match params.first() {
        Some(p) if !p.is_array => p.name.clone(),
        _ => {
            return Err(TransformError::annotation(
                "the first parameter must be the scalar privacy budget",
                func.name.span,
            ));
        }
    };
    let size = params.get(1).filter(|p| !p.is_array).map(|p| p.name.clone());
    for name in std::iter::once(&epsilon).chain(size.as_ref()) {
        if params.iter().any(|p| &p.name == name && !p.sensitivity.is_zero()) {
            return Err(TransformError::annotation(
                format!("`{name}` must have sensitivity <0, 0>"),
                sens_span,
            ));
        }
    }
    if policy == AdjacencyPolicy::OneDiffer && size.is_none() {
        return Err(TransformError::policy(
            "ONE_DIFFER needs a size parameter to range the differing index over",
            policy_span,
        ));
    }

    Ok(FunctionHeader {
        policy,
        assumptions,
        params,
        epsilon,
        size,
    })
}

/// `name: <aligned, shadow>`; both sides must agree.
fn parse_sensitivity(clause: &str, lit: Span, off: usize) -> Result<(String, Sensitivity), TransformError> {
    let here = inner_span(lit, off, clause.len());
    let bad = || TransformError::annotation(format!("expected `name: <a, s>`, found `{clause}`"), here);
    let (name, rest) = clause.split_once(':').ok_or_else(bad)?;
    let rest_off = off + name.len() + 1;
    let inner = rest
        .trim()
        .strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .ok_or_else(bad)?;
    let (a, s) = inner.split_once(',').ok_or_else(bad)?;
    let base = rest_off + rest.find('<').unwrap_or(0) + 1;
    let aligned = parse_bound(a, lit, base)?;
    let shadow = parse_bound(s, lit, base + a.len() + 1)?;
    if aligned != shadow {
        return Err(TransformError::annotation(
            format!("aligned and shadow sensitivity of `{}` must agree at entry", name.trim()),
            here,
        ));
    }
    Ok((name.trim().to_string(), aligned))
}

fn parse_bound(text: &str, lit: Span, off: usize) -> Result<Sensitivity, TransformError> {
    let lead = text.len() - text.trim_start().len();
    let text = text.trim();
    if text == "*" {
        return Ok(Sensitivity::Dynamic);
    }
    let e = parse_clause(text, lit, off + lead)?;
    Sym::from_expr(&e)?
        .constant_value()
        .map(Sensitivity::Fixed)
        .ok_or_else(|| TransformError::annotation("sensitivity must be a numeric literal or `*`", e.span))
}

fn collect_sites(
    stmts: &[Stmt],
    header: &FunctionHeader,
    sites: &mut IndexMap<usize, NoiseSite>,
) -> Result<(), TransformError> {
    for stmt in stmts {
        match stmt {
            Stmt::Decl(d) => {
                if let Some(init) = &d.init {
                    site_or_plain(init, &d.name.node, header, sites)?;
                }
            }
            Stmt::Assign(a) => site_or_plain(&a.expr, &a.target.node, header, sites)?,
            Stmt::If(s) => {
                reject_noise(&s.cond)?;
                collect_sites(&s.then_block.stmts, header, sites)?;
                if let Some(b) = &s.else_block {
                    collect_sites(&b.stmts, header, sites)?;
                }
            }
            Stmt::While(w) => {
                reject_noise(&w.cond)?;
                collect_sites(&w.body.stmts, header, sites)?;
            }
            Stmt::Block(b) => collect_sites(&b.stmts, header, sites)?,
            Stmt::Return(r) => {
                if let Some(e) = &r.expr {
                    reject_noise(e)?;
                }
            }
            Stmt::ExprStmt(e) => reject_noise(e)?,
        }
    }
    Ok(())
}

fn site_or_plain(
    e: &Expr,
    variable: &str,
    header: &FunctionHeader,
    sites: &mut IndexMap<usize, NoiseSite>,
) -> Result<(), TransformError> {
    match &e.kind {
        ExprKind::Call { callee, args } if callee.node == NOISE_FN => {
            let site = parse_site(e, args, variable, header)?;
            sites.insert(e.span.offset(), site);
            Ok(())
        }
        _ => reject_noise(e),
    }
}

fn reject_noise(e: &Expr) -> Result<(), TransformError> {
    let nested = |x: &Expr| reject_noise(x);
    match &e.kind {
        ExprKind::Call { callee, .. } if callee.node == NOISE_FN => Err(TransformError::unsupported(
            "noise must be drawn directly into a variable: `float eta = Lap(...);`",
            e.span,
        )),
        ExprKind::Call { args, .. } => args.iter().try_for_each(nested),
        ExprKind::Index { base, index } => nested(base).and_then(|_| nested(index)),
        ExprKind::Unary { expr, .. } => nested(expr),
        ExprKind::Binary { left, right, .. } => nested(left).and_then(|_| nested(right)),
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => nested(cond).and_then(|_| nested(then_expr)).and_then(|_| nested(else_expr)),
        ExprKind::Ident(_) | ExprKind::Number(_) | ExprKind::StringLit(_) => Ok(()),
    }
}

fn parse_site(call: &Expr, args: &[Expr], variable: &str, header: &FunctionHeader) -> Result<NoiseSite, TransformError> {
    let [scale, annotation] = args else {
        return Err(TransformError::annotation(
            "`Lap` takes a scale and an annotation string",
            call.span,
        ));
    };
    let Some(text) = annotation.as_string_lit() else {
        return Err(TransformError::annotation(
            "the second argument of `Lap` must be an annotation string",
            annotation.span,
        ));
    };
    let clauses = split_clauses(text);
    let [(sel_off, sel_text), (dist_off, dist_text)] = clauses.as_slice() else {
        return Err(TransformError::annotation(
            "a noise annotation needs exactly two clauses: `<selector>; <distance>`",
            annotation.span,
        ));
    };
    let selector = parse_selector(&parse_clause(sel_text, annotation.span, *sel_off)?)?;
    let distance = Sym::from_expr(&parse_clause(dist_text, annotation.span, *dist_off)?)?;
    Ok(NoiseSite {
        span: call.span,
        variable: variable.to_string(),
        scale: parse_scale(scale, header)?,
        selector,
        distance,
    })
}

fn parse_selector(e: &Expr) -> Result<Selector, TransformError> {
    match &e.kind {
        ExprKind::Ident(id) if id.node == "ALIGNED" => Ok(Selector::Aligned),
        ExprKind::Ident(id) if id.node == "SHADOW" => Ok(Selector::Shadow),
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => Ok(Selector::Choose {
            cond: Sym::from_expr(cond)?,
            then: Box::new(parse_selector(then_expr)?),
            otherwise: Box::new(parse_selector(else_expr)?),
        }),
        _ => Err(TransformError::annotation(
            "a selector is ALIGNED, SHADOW or `<cond> ? <selector> : <selector>`",
            e.span,
        )),
    }
}

fn parse_scale(e: &Expr, header: &FunctionHeader) -> Result<NoiseScale, TransformError> {
    let bad = |span| {
        TransformError::annotation(
            format!("noise scale must have the form `k / {}`", header.epsilon),
            span,
        )
    };
    let ExprKind::Binary {
        left,
        op: BinOp::Div,
        right,
    } = &e.kind
    else {
        return Err(bad(e.span));
    };
    if right.as_ident() != Some(header.epsilon.as_str()) {
        return Err(bad(right.span));
    }
    let mut scale = NoiseScale {
        numerator: Ratio::ONE,
        factors: Vec::new(),
    };
    scale_factors(left, header, &mut scale)?;
    if scale.numerator.is_zero() || scale.numerator.is_negative() {
        return Err(TransformError::annotation("noise scale must be positive", left.span));
    }
    Ok(scale)
}

fn scale_factors(e: &Expr, header: &FunctionHeader, scale: &mut NoiseScale) -> Result<(), TransformError> {
    match &e.kind {
        ExprKind::Number(text) => {
            let k = Ratio::parse(text).ok_or_else(|| {
                TransformError::annotation(format!("`{text}` has no exact 128-bit rational value"), e.span)
            })?;
            scale.numerator = scale
                .numerator
                .checked_mul(k)
                .ok_or_else(|| TransformError::annotation("noise scale overflows the exact 128-bit range", e.span))?;
            Ok(())
        }
        ExprKind::Ident(id) => match header.param(&id.node) {
            Some(p) if !p.is_array && p.sensitivity.is_zero() => {
                scale.factors.push(p.name.clone());
                Ok(())
            }
            _ => Err(TransformError::annotation(
                format!("`{}` in a noise scale must be a scalar parameter with sensitivity <0, 0>", id.node),
                e.span,
            )),
        },
        ExprKind::Binary {
            left,
            op: BinOp::Mul,
            right,
        } => {
            scale_factors(left, header, scale)?;
            scale_factors(right, header, scale)
        }
        _ => Err(TransformError::annotation(
            "the numerator of a noise scale is a product of numbers and parameters",
            e.span,
        )),
    }
}

/// Non-empty `;`-separated clauses with their byte offsets in `text`.
fn split_clauses(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    for part in text.split(';') {
        let lead = part.len() - part.trim_start().len();
        let trimmed = part.trim();
        if !trimmed.is_empty() {
            out.push((start + lead, trimmed));
        }
        start += part.len() + 1;
    }
    out
}

/// Span of `len` bytes at offset `off` inside the string literal `lit`.
fn inner_span(lit: Span, off: usize, len: usize) -> Span {
    shadow_ast::span(lit.offset() + 1 + off, len)
}

fn parse_clause(text: &str, lit: Span, off: usize) -> Result<Expr, TransformError> {
    parse_expr_at(text, lit.offset() + 1 + off).map_err(|e| TransformError::AnnotationParse {
        message: e.message,
        span: e.span,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(src: &str) -> FunctionDef {
        let program = shadow_parse::parse_source(src).unwrap();
        program.functions().next().unwrap().clone()
    }

    const NOISYMAX: &str = r#"
int noisymax(float epsilon, int size, float q[])
{
  "ALL_DIFFER;";
  "epsilon: <0, 0>; size: <0, 0>; q: <*, *>";
  int max = 0;
  float eta = Lap(2 / epsilon, "(q[0] + eta > 1) ? SHADOW : ALIGNED; 2");
  return max;
}
"#;

    #[test]
    fn reads_header_and_sites() {
        let ann = parse_annotations(&function(NOISYMAX)).unwrap();
        assert_eq!(ann.header.policy, AdjacencyPolicy::AllDiffer);
        assert_eq!(ann.header.epsilon, "epsilon");
        assert_eq!(ann.header.size.as_deref(), Some("size"));
        assert_eq!(ann.header.param("q").unwrap().sensitivity, Sensitivity::Dynamic);
        let site = ann.sites.values().next().unwrap();
        assert_eq!(site.variable, "eta");
        assert_eq!(site.scale.numerator, Ratio::integer(2));
        assert!(ann.shadow_enabled());
        assert_eq!(site.selector.to_string(), "(q[0] + eta > 1) ? SHADOW : ALIGNED");
    }

    #[test]
    fn scale_accepts_parameter_factors() {
        let src = r#"
int f(float epsilon, int size, int NN)
{
  "ALL_DIFFER; assume(NN > 0);";
  "epsilon: <0, 0>; size: <0, 0>; NN: <0, 0>";
  float eta = Lap((6.0 * NN) / epsilon, "ALIGNED; 1");
  return 0;
}
"#;
        let ann = parse_annotations(&function(src)).unwrap();
        assert_eq!(ann.header.assumptions.len(), 1);
        let site = ann.sites.values().next().unwrap();
        assert_eq!(site.scale.numerator, Ratio::integer(6));
        assert_eq!(site.scale.factors, ["NN"]);
        assert!(!ann.shadow_enabled());
    }

    #[test]
    fn rejects_missing_clause() {
        let src = NOISYMAX.replace("? SHADOW : ALIGNED; 2", "? SHADOW : ALIGNED");
        let err = parse_annotations(&function(&src)).unwrap_err();
        assert!(matches!(err, TransformError::AnnotationParse { .. }));
    }

    #[test]
    fn rejects_mismatched_entry_sensitivity() {
        let src = NOISYMAX.replace("size: <0, 0>", "size: <0, 1>");
        assert!(matches!(
            parse_annotations(&function(&src)),
            Err(TransformError::AnnotationParse { .. })
        ));
    }

    #[test]
    fn clause_offsets_point_into_the_literal() {
        assert_eq!(split_clauses(" ALL_DIFFER; assume(x) ;"), [(1, "ALL_DIFFER"), (13, "assume(x)")]);
    }
}
