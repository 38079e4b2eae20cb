#![forbid(unsafe_code)]

//! The instrumenting walk. Statements are visited in program order with the
//! tracking environment threaded by value; every original statement is
//! re-emitted together with the bookkeeping that keeps the runtime distance
//! variables in step with the environment.

use std::collections::HashSet;

use indexmap::IndexSet;
use shadow_ast::{
    AssignStmt, BinOp, Block, CType, DeclStmt, Expr, ExprKind, FunctionDef, IfStmt, Param, ReturnStmt, Span,
    Stmt, UnaryOp, WhileStmt,
};
use tracing::debug;

use crate::annotation::{Annotations, NOISE_FN, Sensitivity};
use crate::cost::{Accumulator, Cost};
use crate::distance::Distance;
use crate::env::{DistanceRecord, Tracked, TrackingEnv};
use crate::error::TransformError;
use crate::eval::{Evaluator, shifted};
use crate::names::{self, Version};
use crate::policy::{AdjacencyPolicy, Policy, assertion};
use crate::sym::Sym;
use crate::{FunctionReport, Instrumented, SiteReport, TransformOptions};

type Result<T> = std::result::Result<T, TransformError>;

#[derive(Clone, Copy, Debug)]
struct Flow {
    /// Adjacent runs may be on different paths here.
    diverged: bool,
    /// Cleared for the probe passes of the loop fixed-point check.
    emit: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Body,
    Tail,
}

/// Output of one original block. Query assumptions collect in `prelude` so
/// they land at the top of the block.
#[derive(Default)]
struct Layout {
    prelude: Vec<Stmt>,
    hoisted: HashSet<(String, Sym)>,
    body: Vec<Stmt>,
    tail: Vec<Stmt>,
    /// Program variables assigned so far in this block.
    written: HashSet<String>,
}

impl Layout {
    fn slot(&mut self, slot: Slot) -> &mut Vec<Stmt> {
        match slot {
            Slot::Body => &mut self.body,
            Slot::Tail => &mut self.tail,
        }
    }

    fn original(&mut self, stmt: Stmt) {
        let mut names = Vec::new();
        assigned_names(&stmt, &mut names);
        self.written.extend(names);
        self.body.push(stmt);
    }

    fn finish(self) -> Vec<Stmt> {
        let mut out = self.prelude;
        out.extend(self.body);
        out.extend(self.tail);
        out
    }
}

pub(crate) struct Instrumenter<'a> {
    ann: &'a Annotations,
    options: &'a TransformOptions,
    arrays: IndexSet<String>,
    params: HashSet<String>,
    noise_vars: HashSet<String>,
    shadow: bool,
    epsilon: Sym,
    sites: Vec<SiteReport>,
}

impl<'a> Instrumenter<'a> {
    pub(crate) fn new(ann: &'a Annotations, options: &'a TransformOptions) -> Self {
        let header = &ann.header;
        Self {
            ann,
            options,
            arrays: header.params.iter().filter(|p| p.is_array).map(|p| p.name.clone()).collect(),
            params: header.params.iter().map(|p| p.name.clone()).collect(),
            noise_vars: ann.sites.values().map(|s| s.variable.clone()).collect(),
            shadow: ann.shadow_enabled(),
            epsilon: match options.epsilon {
                Some(e) => Sym::num(e),
                None => Sym::var(header.epsilon.clone()),
            },
            sites: Vec::new(),
        }
    }

    pub(crate) fn run(mut self, func: &FunctionDef) -> Result<Instrumented> {
        let ann = self.ann;
        let header = &ann.header;
        let span = func.body.span;

        let mut env = TrackingEnv::new();
        for p in &header.params {
            let record = match &p.sensitivity {
                Sensitivity::Dynamic => DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic),
                Sensitivity::Fixed(r) => DistanceRecord::Aligned(Distance::constant(*r)),
            };
            env = env.with(p.name.clone(), record);
        }

        let body = &func.body.stmts[ann.body_start..];
        let flow = Flow {
            diverged: false,
            emit: true,
        };
        let (mut layout, _) = self.block(body, env, flow, Vec::new())?;
        if !matches!(body.last(), Some(Stmt::Return(_))) {
            self.synth(&mut layout, self.accumulator().final_check(span), Slot::Tail);
        }
        let instrumented = layout.finish();
        let distance_vars = self.runtime_vars(body, &instrumented);

        let policy = self.policy();
        let mut stmts = policy.entry_assumes(&header.epsilon, header.size.as_deref(), span);
        stmts.extend(
            header
                .assumptions
                .iter()
                .map(|a| Stmt::call(&self.options.primitives.assume, vec![a.clone()], a.span)),
        );
        stmts.push(self.accumulator().declare(span));
        if let Some(size) = &header.size {
            stmts.extend(policy.differing_index_assumes(size, span));
        }
        stmts.extend(
            distance_vars
                .iter()
                .map(|n| Stmt::decl(CType::Float, n.clone(), Some(Expr::number("0", span)), span)),
        );
        stmts.extend(instrumented);

        let function = FunctionDef {
            span: func.span,
            ret: func.ret,
            name: func.name.clone(),
            params: self.params_out(func),
            body: Block::new(func.body.span, stmts),
        };
        let report = FunctionReport {
            name: func.name.node.clone(),
            policy: header.policy.to_string(),
            shadow_enabled: self.shadow,
            sites: std::mem::take(&mut self.sites),
            distance_vars,
            span: (func.span.offset(), func.span.len()),
        };
        Ok(Instrumented { function, report })
    }

    fn policy(&self) -> Policy<'_> {
        Policy {
            adjacency: self.ann.header.policy,
            element_bound: self.options.element_bound,
            primitives: &self.options.primitives,
        }
    }

    fn accumulator(&self) -> Accumulator<'_> {
        Accumulator {
            epsilon: self.epsilon.clone(),
            goal: self.options.goal,
            primitives: &self.options.primitives,
        }
    }

    fn versions(&self) -> &'static [Version] {
        if self.shadow {
            &Version::BOTH
        } else {
            &[Version::Aligned]
        }
    }

    /// Push a synthesized statement. Reads of array distances get their
    /// query assumptions at the top of the block, or right here when the
    /// subscript was assigned earlier in the block.
    fn synth(&self, out: &mut Layout, stmt: Stmt, slot: Slot) {
        let span = stmt.span();
        let mut reads = Vec::new();
        distance_reads(&stmt, &self.arrays, &mut reads);
        for (array, subscript) in reads {
            let assumes = self.policy().query_assumes(&array, &subscript, span);
            if out.written.iter().any(|w| subscript.mentions(w)) {
                out.slot(slot).extend(assumes);
            } else if out.hoisted.insert((array, subscript)) {
                out.prelude.extend(assumes);
            }
        }
        out.slot(slot).push(stmt);
    }

    fn block(
        &mut self,
        stmts: &[Stmt],
        env: TrackingEnv,
        flow: Flow,
        head: Vec<Stmt>,
    ) -> Result<(Layout, TrackingEnv)> {
        let mut out = Layout::default();
        for stmt in head {
            self.synth(&mut out, stmt, Slot::Body);
        }
        let mut env = env;
        let mut locals = Vec::new();
        for stmt in stmts {
            env = self.stmt(stmt, env, flow, &mut out, &mut locals)?;
        }
        Ok((out, env.without(&locals)))
    }

    fn stmt(
        &mut self,
        stmt: &Stmt,
        env: TrackingEnv,
        flow: Flow,
        out: &mut Layout,
        locals: &mut Vec<String>,
    ) -> Result<TrackingEnv> {
        match stmt {
            Stmt::Decl(d) => {
                let env = self.decl(stmt, d, env, flow, out)?;
                locals.push(d.name.node.clone());
                Ok(env)
            }
            Stmt::Assign(a) => self.assign(stmt, a, env, flow, out),
            Stmt::If(s) => self.branch(s, env, flow, out),
            Stmt::While(w) => self.while_loop(w, env, flow, out),
            Stmt::Return(r) => self.ret(r, env, flow, out),
            Stmt::Block(b) => {
                if flow.diverged {
                    return Err(TransformError::unsupported(
                        "nested blocks inside a branch that may diverge",
                        b.span,
                    ));
                }
                let (inner, env) = self.block(&b.stmts, env, flow, Vec::new())?;
                out.original(Stmt::Block(Block::new(b.span, inner.finish())));
                Ok(env)
            }
            Stmt::ExprStmt(e) => {
                if e.as_string_lit().is_some() {
                    return Err(TransformError::annotation(
                        "annotation strings are only allowed as the first two statements",
                        e.span,
                    ));
                }
                out.original(stmt.clone());
                Ok(env)
            }
        }
    }

    fn decl(&mut self, stmt: &Stmt, d: &DeclStmt, env: TrackingEnv, flow: Flow, out: &mut Layout) -> Result<TrackingEnv> {
        let name = d.name.node.as_str();
        if names::is_reserved(name) {
            return Err(TransformError::unsupported(
                format!("`{name}` uses the reserved prefix {}", names::PREFIX),
                d.name.span,
            ));
        }
        if env.contains(name) {
            return Err(TransformError::unsupported(
                format!("`{name}` is already declared"),
                d.name.span,
            ));
        }
        let record = match &d.init {
            Some(init) if is_noise(init) => return self.draw(stmt, name, init, env, flow, out),
            Some(init) => self.record_for(name, &env, init, flow.diverged)?,
            None => DistanceRecord::zero(),
        };
        out.original(stmt.clone());
        Ok(env.with(name, record))
    }

    /// Record of `var` after it takes the value of `e`.
    fn record_for(&self, var: &str, env: &TrackingEnv, e: &Expr, diverged: bool) -> Result<DistanceRecord> {
        let ev = Evaluator::new(env, &self.arrays);
        let aligned = Tracked::normalized(Version::Aligned, var, ev.distance(e, Version::Aligned)?);
        let shadow = if diverged {
            Tracked::Dynamic
        } else if self.shadow {
            Tracked::normalized(Version::Shadow, var, ev.distance(e, Version::Shadow)?)
        } else {
            aligned.clone()
        };
        Ok(DistanceRecord::new(aligned, shadow))
    }

    fn assign(&mut self, stmt: &Stmt, a: &AssignStmt, env: TrackingEnv, flow: Flow, out: &mut Layout) -> Result<TrackingEnv> {
        let x = a.target.node.as_str();
        if names::is_reserved(x) || self.arrays.contains(x) {
            return Err(TransformError::unsupported(
                format!("`{x}` cannot be assigned"),
                a.target.span,
            ));
        }
        if !env.contains(x) {
            return Err(TransformError::UnboundVariable {
                name: x.to_string(),
                span: a.target.span,
            });
        }
        if is_noise(&a.expr) {
            return self.draw(stmt, x, &a.expr, env, flow, out);
        }

        let rhs = Sym::from_expr(&a.expr)?;
        let reads_self = rhs.mentions(x);
        let mut env = self.promote(env, x, reads_self, out, a.span)?;
        if flow.diverged {
            let mut exempt = vec![(Version::Shadow, x)];
            if !reads_self {
                exempt.push((Version::Aligned, x));
            }
            env = self.guard(env, Version::Shadow, x, &exempt, out, a.span, &mut Vec::new())?;
            let before = env.distance(x, Version::Shadow).unwrap_or_else(Distance::zero);
            let update = Sym::binary(shifted(Sym::var(x), before), BinOp::Sub, rhs);
            self.synth(
                out,
                Stmt::assign(Version::Shadow.distance_var(x), update.to_expr(a.span), a.span),
                Slot::Body,
            );
            env = env.set(x, Version::Shadow, Tracked::Dynamic);
        }
        let record = self.record_for(x, &env, &a.expr, flow.diverged)?;
        out.original(stmt.clone());
        Ok(env.with(x, record))
    }

    /// Materialize every static distance that mentions the program variable
    /// `x`, which is about to change. `x` itself is left alone unless its new
    /// value is computed from the old one.
    fn promote(&self, env: TrackingEnv, x: &str, reads_self: bool, out: &mut Layout, span: Span) -> Result<TrackingEnv> {
        let mut env = env;
        let names: Vec<String> = env.iter().map(|(n, _)| n.clone()).collect();
        for y in names {
            if y == x && !reads_self {
                continue;
            }
            for &v in self.versions() {
                let stale = matches!(
                    env.get(&y).map(|r| r.get(v)),
                    Some(Tracked::Static(d)) if d.mentions(x)
                );
                if stale {
                    env = self.materialize(env, &y, v, out, span, &mut Vec::new())?;
                }
            }
        }
        Ok(env)
    }

    /// Materialize every static version that reads the runtime variable of
    /// `(version, var)`, which is about to be written.
    #[allow(clippy::too_many_arguments)]
    fn guard(
        &self,
        env: TrackingEnv,
        version: Version,
        var: &str,
        exempt: &[(Version, &str)],
        out: &mut Layout,
        span: Span,
        stack: &mut Vec<(Version, String)>,
    ) -> Result<TrackingEnv> {
        let mut env = env;
        let names: Vec<String> = env.iter().map(|(n, _)| n.clone()).collect();
        for y in names {
            for &w in self.versions() {
                if exempt.iter().any(|(v, n)| *v == w && *n == y) {
                    continue;
                }
                let reads = matches!(
                    env.get(&y).map(|r| r.get(w)),
                    Some(Tracked::Static(d)) if d.reads_runtime(version, var)
                );
                if reads {
                    env = self.materialize(env, &y, w, out, span, stack)?;
                }
            }
        }
        Ok(env)
    }

    /// `DIST_var = <static distance>;`, after which the version is dynamic.
    fn materialize(
        &self,
        env: TrackingEnv,
        var: &str,
        version: Version,
        out: &mut Layout,
        span: Span,
        stack: &mut Vec<(Version, String)>,
    ) -> Result<TrackingEnv> {
        let Some(Tracked::Static(d)) = env.get(var).map(|r| r.get(version)) else {
            return Ok(env);
        };
        if stack.iter().any(|(v, n)| *v == version && n == var) {
            return Err(TransformError::unsupported(
                format!("runtime distance of `{var}` depends on itself through other distances"),
                span,
            ));
        }
        stack.push((version, var.to_string()));
        let env = self.guard(env, version, var, &[(version, var)], out, span, stack)?;
        stack.pop();
        debug!(variable = var, version = version.label(), distance = %d, "materialize");
        self.synth(
            out,
            Stmt::assign(version.distance_var(var), d.to_expr(span), span),
            Slot::Body,
        );
        if self.shadow {
            Ok(env.set(var, version, Tracked::Dynamic))
        } else {
            // Without shadow tracking the shadow column mirrors the aligned one.
            Ok(env
                .set(var, Version::Aligned, Tracked::Dynamic)
                .set(var, Version::Shadow, Tracked::Dynamic))
        }
    }

    fn draw(
        &mut self,
        stmt: &Stmt,
        var: &str,
        call: &Expr,
        env: TrackingEnv,
        flow: Flow,
        out: &mut Layout,
    ) -> Result<TrackingEnv> {
        if flow.diverged {
            return Err(TransformError::SamplingInDivergingBranch { span: call.span });
        }
        let ann = self.ann;
        let site = ann
            .site(call)
            .ok_or_else(|| TransformError::annotation("noise draw without a parsed annotation", call.span))?;
        let raw = Distance::from_sym(&site.distance).ok_or_else(|| {
            TransformError::unsupported(
                "the distance annotation is not a sum of scaled distances and selections",
                call.span,
            )
        })?;
        for r in raw.runtime_refs() {
            if !env.contains(&r.var) {
                return Err(TransformError::UnboundVariable {
                    name: r.var.clone(),
                    span: call.span,
                });
            }
        }
        let resolved = raw
            .substitute(&|r| {
                if r.index.is_some() {
                    return None;
                }
                env.get(&r.var).and_then(|rec| rec.get(r.version).as_static().cloned())
            })
            .ok_or_else(|| TransformError::overflow(call.span))?;

        let mut env = if env.contains(var) {
            self.promote(env, var, false, out, call.span)?
        } else {
            env
        };
        let aligned = Tracked::normalized(Version::Aligned, var, resolved.clone());
        let shadow = if self.shadow { Tracked::zero() } else { aligned.clone() };
        env = env.with(var, DistanceRecord::new(aligned, shadow));
        let (noise, params) = (&self.noise_vars, &self.params);
        env = env.select(&site.selector, |name| {
            name == var || noise.contains(name) || params.contains(name)
        });

        let cost = Cost::of(&resolved, &site.scale, self.options.element_bound)
            .ok_or_else(|| TransformError::overflow(call.span))?;
        debug!(variable = var, selector = %site.selector, distance = %resolved, ?cost, "noise draw");

        let havoc = Expr::call(&self.options.primitives.havoc, Vec::new(), call.span);
        let replaced = match stmt {
            Stmt::Decl(d) => Stmt::Decl(DeclStmt {
                init: Some(havoc),
                ..d.clone()
            }),
            _ => Stmt::assign(var, havoc, stmt.span()),
        };
        out.original(replaced);
        for charge in self.accumulator().charge(&site.selector, &cost, call.span) {
            self.synth(out, charge, Slot::Body);
        }
        if flow.emit {
            self.sites.push(SiteReport {
                variable: var.to_string(),
                selector: site.selector.to_string(),
                distance: resolved.to_string(),
                max_cost: cost.worst_case().map(|c| c.to_string()),
                span: (call.span.offset(), call.span.len()),
            });
        }
        Ok(env)
    }

    fn branch(&mut self, s: &IfStmt, env: TrackingEnv, flow: Flow, out: &mut Layout) -> Result<TrackingEnv> {
        if flow.diverged {
            return Err(TransformError::unsupported(
                "control flow nested inside a branch that may diverge",
                s.span,
            ));
        }
        let cond = Sym::from_expr(&s.cond)?;
        let diverges = self.shadow && Evaluator::new(&env, &self.arrays).may_diverge(&s.cond)?;
        debug!(%cond, diverges, "branch");
        let else_stmts: &[Stmt] = match &s.else_block {
            Some(b) => &b.stmts,
            None => &[],
        };

        let mut env = env;
        if diverges {
            let targets = top_level_targets(&s.then_block.stmts)
                .into_iter()
                .chain(top_level_targets(else_stmts));
            for x in targets {
                env = self.materialize(env, &x, Version::Shadow, out, s.span, &mut Vec::new())?;
            }
        }

        let arm = Flow {
            diverged: diverges,
            ..flow
        };
        let env_t = env
            .clone()
            .specialize(&cond, true)
            .ok_or_else(|| TransformError::overflow(s.cond.span))?;
        let env_f = env
            .specialize(&cond, false)
            .ok_or_else(|| TransformError::overflow(s.cond.span))?;
        let check_t = Evaluator::new(&env_t, &self.arrays).shift(&s.cond, Version::Aligned)?;
        let check_f = Evaluator::new(&env_f, &self.arrays).shift(&s.cond, Version::Aligned)?;
        let head_t = assertion(&self.options.primitives, check_t.to_expr(s.cond.span), s.cond.span);
        let head_f = assertion(
            &self.options.primitives,
            Sym::Unary(UnaryOp::Not, Box::new(check_f)).to_expr(s.cond.span),
            s.cond.span,
        );

        let (mut then_out, end_t) = self.block(&s.then_block.stmts, env_t, arm, vec![head_t])?;
        let (mut else_out, end_f) = self.block(else_stmts, env_f, arm, vec![head_f])?;
        let joined = end_t.join(&end_f);
        self.reconcile(&end_t, &joined, &mut then_out, Slot::Tail, s.span)?;
        self.reconcile(&end_f, &joined, &mut else_out, Slot::Tail, s.span)?;

        let else_span = s.else_block.as_ref().map_or(s.span, |b| b.span);
        out.original(Stmt::If(IfStmt {
            span: s.span,
            cond: s.cond.clone(),
            then_block: Block::new(s.then_block.span, then_out.finish()),
            else_block: Some(Block::new(else_span, else_out.finish())),
        }));
        if diverges {
            self.shadow_branch(s, else_stmts, &joined, out)?;
        }
        Ok(joined)
    }

    /// The branch as the shadow run takes it, replayed on the shadow
    /// distances after the aligned run has finished its own arm.
    ///
    /// Locals declared in an arm are replayed with the values the shadow run
    /// computes for them, so later updates in the arm can read them as plain
    /// variables.
    fn shadow_branch(&self, s: &IfStmt, else_stmts: &[Stmt], env: &TrackingEnv, out: &mut Layout) -> Result<()> {
        let updates = |stmts: &[Stmt]| -> Result<Vec<Stmt>> {
            let mut env = env.clone();
            let mut locals = Vec::new();
            let mut body = Vec::new();
            for stmt in stmts {
                let ev = Evaluator::new(&env, &self.arrays);
                match stmt {
                    Stmt::Decl(d) => {
                        let init = match &d.init {
                            Some(e) => Some(ev.shift(e, Version::Shadow)?.to_expr(e.span)),
                            None => None,
                        };
                        body.push(Stmt::decl(d.ty, d.name.node.clone(), init, d.span));
                        locals.push(d.name.node.clone());
                        env = env.with(d.name.node.clone(), DistanceRecord::zero());
                    }
                    Stmt::Assign(a) if locals.contains(&a.target.node) => {
                        let value = ev.shift(&a.expr, Version::Shadow)?;
                        body.push(Stmt::assign(a.target.node.clone(), value.to_expr(a.span), a.span));
                    }
                    Stmt::Assign(a) => {
                        let x = a.target.node.as_str();
                        let value = Sym::binary(ev.shift(&a.expr, Version::Shadow)?, BinOp::Sub, Sym::var(x));
                        body.push(Stmt::assign(
                            Version::Shadow.distance_var(x),
                            value.to_expr(a.span),
                            a.span,
                        ));
                    }
                    _ => {}
                }
            }
            // Only locals: the shadow run keeps nothing.
            if body.iter().all(|st| matches!(st, Stmt::Decl(_)) || is_local_assign(st, &locals)) {
                return Ok(Vec::new());
            }
            Ok(body)
        };
        let then_body = updates(&s.then_block.stmts)?;
        let else_body = updates(else_stmts)?;
        if then_body.is_empty() && else_body.is_empty() {
            return Ok(());
        }
        let cond = Evaluator::new(env, &self.arrays).shift(&s.cond, Version::Shadow)?;
        self.synth(
            out,
            Stmt::If(IfStmt {
                span: s.span,
                cond: cond.to_expr(s.cond.span),
                then_block: Block::new(s.span, then_body),
                else_block: (!else_body.is_empty()).then(|| Block::new(s.span, else_body)),
            }),
            Slot::Body,
        );
        Ok(())
    }

    fn while_loop(&mut self, w: &WhileStmt, env: TrackingEnv, flow: Flow, out: &mut Layout) -> Result<TrackingEnv> {
        if flow.diverged {
            return Err(TransformError::unsupported(
                "control flow nested inside a branch that may diverge",
                w.span,
            ));
        }
        let probe = Flow { emit: false, ..flow };
        let (_, after) = self.block(&w.body.stmts, env.clone(), probe, Vec::new())?;
        let inv = env.join(&after);
        debug!(pass = 1, widened = ?env.differences(&inv), "loop fixed point");
        let (_, again) = self.block(&w.body.stmts, inv.clone(), probe, Vec::new())?;
        let unstable = inv.differences(&inv.join(&again));
        debug!(pass = 2, ?unstable, "loop fixed point");
        if !unstable.is_empty() {
            return Err(TransformError::LoopInvariantInstability {
                variables: unstable.join(", "),
                span: w.span,
            });
        }
        if self.shadow && Evaluator::new(&inv, &self.arrays).may_diverge(&w.cond)? {
            return Err(TransformError::unsupported(
                "loop condition may differ between adjacent runs",
                w.cond.span,
            ));
        }

        self.reconcile(&env, &inv, out, Slot::Body, w.span)?;
        let check = Evaluator::new(&inv, &self.arrays).shift(&w.cond, Version::Aligned)?;
        let head = assertion(&self.options.primitives, check.to_expr(w.cond.span), w.cond.span);
        let (mut body, end) = self.block(&w.body.stmts, inv.clone(), flow, vec![head])?;
        self.reconcile(&end, &inv, &mut body, Slot::Tail, w.span)?;
        out.original(Stmt::While(WhileStmt {
            span: w.span,
            cond: w.cond.clone(),
            body: Block::new(w.body.span, body.finish()),
        }));
        Ok(inv)
    }

    fn reconcile(&self, from: &TrackingEnv, to: &TrackingEnv, out: &mut Layout, slot: Slot, span: Span) -> Result<()> {
        let steps = from.reconcile(to, self.versions()).map_err(|vars| {
            TransformError::unsupported(
                format!("distance updates of {} depend on each other cyclically", vars.join(", ")),
                span,
            )
        })?;
        for m in steps {
            self.synth(
                out,
                Stmt::assign(m.version.distance_var(&m.var), m.distance.to_expr(span), span),
                slot,
            );
        }
        Ok(())
    }

    fn ret(&mut self, r: &ReturnStmt, env: TrackingEnv, flow: Flow, out: &mut Layout) -> Result<TrackingEnv> {
        if flow.diverged {
            return Err(TransformError::unsupported(
                "return inside a branch that may diverge",
                r.span,
            ));
        }
        if let Some(e) = &r.expr {
            let d = Evaluator::new(&env, &self.arrays).distance(e, Version::Aligned)?;
            if !d.is_zero() {
                return Err(TransformError::ReturnDistanceNotZero {
                    distance: d.to_string(),
                    span: e.span,
                });
            }
        }
        self.synth(out, self.accumulator().final_check(r.span), Slot::Body);
        out.original(Stmt::Return(r.clone()));
        Ok(env)
    }

    /// Scalar distance variables the output touches: parameters first, then
    /// locals in declaration order, aligned before shadow.
    fn runtime_vars(&self, body: &[Stmt], out: &[Stmt]) -> Vec<String> {
        let mut used = HashSet::new();
        for stmt in out {
            let mut targets = Vec::new();
            assigned_names(stmt, &mut targets);
            used.extend(targets.into_iter().filter(|n| names::parse_distance_var(n).is_some()));
            each_expr(stmt, &mut |e| {
                if let Some(name) = e.as_ident() {
                    if names::parse_distance_var(name).is_some() {
                        used.insert(name.to_string());
                    }
                }
            });
        }
        let mut vars: IndexSet<String> = self
            .ann
            .header
            .params
            .iter()
            .filter(|p| !p.is_array)
            .map(|p| p.name.clone())
            .collect();
        for stmt in body {
            declared_names(stmt, &mut vars);
        }
        let mut declared = Vec::new();
        for var in &vars {
            for version in Version::BOTH {
                let name = version.distance_var(var);
                if used.contains(&name) {
                    declared.push(name);
                }
            }
        }
        declared
    }

    fn params_out(&self, func: &FunctionDef) -> Vec<Param> {
        let header = &self.ann.header;
        let mut params = func.params.clone();
        if header.policy == AdjacencyPolicy::OneDiffer {
            params.push(Param::named(CType::Int, names::DIFFERING_INDEX, false, func.span));
        }
        for p in header.params.iter().filter(|p| p.sensitivity == Sensitivity::Dynamic) {
            for version in Version::BOTH {
                params.push(Param::named(CType::Float, version.distance_var(&p.name), true, func.span));
            }
        }
        params
    }
}

fn is_noise(e: &Expr) -> bool {
    matches!(&e.kind, ExprKind::Call { callee, .. } if callee.node == NOISE_FN)
}

/// Variables assigned directly in `stmts` that outlive them.
fn top_level_targets(stmts: &[Stmt]) -> Vec<String> {
    let mut locals = Vec::new();
    let mut targets = Vec::new();
    for s in stmts {
        match s {
            Stmt::Decl(d) => locals.push(d.name.node.clone()),
            Stmt::Assign(a) if !locals.contains(&a.target.node) => targets.push(a.target.node.clone()),
            _ => {}
        }
    }
    targets
}

fn is_local_assign(stmt: &Stmt, locals: &[String]) -> bool {
    matches!(stmt, Stmt::Assign(a) if locals.contains(&a.target.node))
}

fn assigned_names(stmt: &Stmt, out: &mut Vec<String>) {
    match stmt {
        Stmt::Decl(d) => out.push(d.name.node.clone()),
        Stmt::Assign(a) => out.push(a.target.node.clone()),
        Stmt::If(s) => {
            for st in &s.then_block.stmts {
                assigned_names(st, out);
            }
            if let Some(b) = &s.else_block {
                for st in &b.stmts {
                    assigned_names(st, out);
                }
            }
        }
        Stmt::While(w) => {
            for st in &w.body.stmts {
                assigned_names(st, out);
            }
        }
        Stmt::Block(b) => {
            for st in &b.stmts {
                assigned_names(st, out);
            }
        }
        Stmt::Return(_) | Stmt::ExprStmt(_) => {}
    }
}

fn declared_names(stmt: &Stmt, out: &mut IndexSet<String>) {
    match stmt {
        Stmt::Decl(d) => {
            out.insert(d.name.node.clone());
        }
        Stmt::If(s) => {
            for st in &s.then_block.stmts {
                declared_names(st, out);
            }
            if let Some(b) = &s.else_block {
                for st in &b.stmts {
                    declared_names(st, out);
                }
            }
        }
        Stmt::While(w) => {
            for st in &w.body.stmts {
                declared_names(st, out);
            }
        }
        Stmt::Block(b) => {
            for st in &b.stmts {
                declared_names(st, out);
            }
        }
        Stmt::Assign(_) | Stmt::Return(_) | Stmt::ExprStmt(_) => {}
    }
}

/// `(array, subscript)` for every `__SHADOWDP_*_DISTANCE_q[i]` read of an
/// array parameter.
fn distance_reads(stmt: &Stmt, arrays: &IndexSet<String>, out: &mut Vec<(String, Sym)>) {
    each_expr(stmt, &mut |e| {
        let ExprKind::Index { base, index } = &e.kind else {
            return;
        };
        let Some((_, var)) = base.as_ident().and_then(names::parse_distance_var) else {
            return;
        };
        if !arrays.contains(var) {
            return;
        }
        if let Ok(subscript) = Sym::from_expr(index) {
            let key = (var.to_string(), subscript);
            if !out.contains(&key) {
                out.push(key);
            }
        }
    });
}

fn each_expr(stmt: &Stmt, f: &mut dyn FnMut(&Expr)) {
    match stmt {
        Stmt::Decl(d) => {
            if let Some(e) = &d.init {
                visit(e, f);
            }
        }
        Stmt::Assign(a) => visit(&a.expr, f),
        Stmt::If(s) => {
            visit(&s.cond, f);
            for st in &s.then_block.stmts {
                each_expr(st, f);
            }
            if let Some(b) = &s.else_block {
                for st in &b.stmts {
                    each_expr(st, f);
                }
            }
        }
        Stmt::While(w) => {
            visit(&w.cond, f);
            for st in &w.body.stmts {
                each_expr(st, f);
            }
        }
        Stmt::Return(r) => {
            if let Some(e) = &r.expr {
                visit(e, f);
            }
        }
        Stmt::Block(b) => {
            for st in &b.stmts {
                each_expr(st, f);
            }
        }
        Stmt::ExprStmt(e) => visit(e, f),
    }
}

fn visit(e: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(e);
    match &e.kind {
        ExprKind::Index { base, index } => {
            visit(base, f);
            visit(index, f);
        }
        ExprKind::Unary { expr, .. } => visit(expr, f),
        ExprKind::Binary { left, right, .. } => {
            visit(left, f);
            visit(right, f);
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            visit(cond, f);
            visit(then_expr, f);
            visit(else_expr, f);
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                visit(a, f);
            }
        }
        ExprKind::Ident(_) | ExprKind::Number(_) | ExprKind::StringLit(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform_function;

    fn function(src: &str) -> FunctionDef {
        let program = shadow_parse::parse_source(src).unwrap();
        program.functions().next().unwrap().clone()
    }

    fn transform(src: &str) -> std::result::Result<Instrumented, TransformError> {
        transform_function(&function(src), &TransformOptions::default())
    }

    #[test]
    fn redeclaration_is_rejected() {
        let err = transform(
            r#"int f(float epsilon, int size, float q[]) {
                "ALL_DIFFER";
                "epsilon: <0, 0>; size: <0, 0>; q: <*, *>";
                int i = 0;
                int i = 1;
                return 0;
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedExpression { .. }));
    }

    #[test]
    fn releasing_a_tracked_value_is_rejected() {
        let err = transform(
            r#"float f(float epsilon, int size, float q[]) {
                "ALL_DIFFER";
                "epsilon: <0, 0>; size: <0, 0>; q: <*, *>";
                float x = q[0];
                return x;
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::ReturnDistanceNotZero { .. }));
    }

    #[test]
    fn loop_with_drifting_distance_is_unstable() {
        let err = transform(
            r#"int f(float epsilon, int size, float q[]) {
                "ALL_DIFFER";
                "epsilon: <0, 0>; size: <0, 0>; q: <*, *>";
                float s = 0;
                float t = 0;
                int i = 0;
                while (i < size) {
                    t = s;
                    s = s + q[i];
                    i = i + 1;
                }
                return 0;
            }"#,
        )
        .unwrap_err();
        let TransformError::LoopInvariantInstability { variables, .. } = err else {
            panic!("expected loop instability, got {err:?}");
        };
        assert_eq!(variables, "t");
    }

    #[test]
    fn query_assumptions_open_the_loop_body() {
        let out = transform(
            r#"int f(float epsilon, int size, float q[]) {
                "ALL_DIFFER";
                "epsilon: <0, 0>; size: <0, 0>; q: <*, *>";
                int i = 0;
                while (i < size) {
                    float eta = Lap(1 / epsilon, "ALIGNED; -__SHADOWDP_ALIGNED_DISTANCE_q[i]");
                    i = i + 1;
                }
                return 0;
            }"#,
        )
        .unwrap();
        let text = shadow_parse::format_function(&out.function);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let head = lines.iter().position(|l| *l == "while (i < size) {").unwrap();
        assert_eq!(lines[head + 1], "assume(__SHADOWDP_ALIGNED_DISTANCE_q[i] <= 1);");
        assert_eq!(lines[head + 4], "assert(i < size);");
        let promoted = lines
            .iter()
            .position(|l| *l == "__SHADOWDP_ALIGNED_DISTANCE_eta = -__SHADOWDP_ALIGNED_DISTANCE_q[i];")
            .unwrap();
        assert_eq!(lines[promoted + 1], "i = i + 1;");
        assert_eq!(out.report.distance_vars, ["__SHADOWDP_ALIGNED_DISTANCE_eta"]);
        assert!(!out.report.shadow_enabled);
    }
}
