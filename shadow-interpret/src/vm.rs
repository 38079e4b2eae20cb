#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use shadow_ast::{BinOp, Block, CType, Expr, ExprKind, FunctionDef, Program, Span, Stmt, UnaryOp};
use shadow_core::{Primitives, Ratio};
use tracing::debug;

use crate::error::InterpretError;
use crate::value::Value;

type Result<T> = std::result::Result<T, InterpretError>;

const ABS_FN: &str = "Abs";

/// Source of the values `havoc()` returns.
pub trait Nondet {
    fn next(&mut self) -> Option<Ratio>;
}

/// Values handed out in order.
#[derive(Clone, Debug, Default)]
pub struct Queue(VecDeque<Ratio>);

impl Queue {
    pub fn new(values: impl IntoIterator<Item = i128>) -> Self {
        Queue(values.into_iter().map(Ratio::integer).collect())
    }

    pub fn from_ratios(values: impl IntoIterator<Item = Ratio>) -> Self {
        Queue(values.into_iter().collect())
    }

    pub fn remaining(&self) -> usize {
        self.0.len()
    }
}

impl Nondet for Queue {
    fn next(&mut self) -> Option<Ratio> {
        self.0.pop_front()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Returned(Option<Value>),
    /// An assumption did not hold, so the run is outside the modeled inputs.
    Pruned { span: Span },
    AssertionFailed { condition: String, span: Span },
}

#[derive(Clone, Debug)]
pub struct Run {
    pub outcome: Outcome,
    /// Variables in scope when the run stopped.
    pub vars: HashMap<String, Value>,
    pub steps: u64,
}

impl Run {
    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn returned(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Returned(v) => v.as_ref(),
            _ => None,
        }
    }

    /// No assertion failed. Pruned runs hold vacuously.
    pub fn holds(&self) -> bool {
        !matches!(self.outcome, Outcome::AssertionFailed { .. })
    }

    pub fn is_pruned(&self) -> bool {
        matches!(self.outcome, Outcome::Pruned { .. })
    }
}

pub struct Interpreter<'p> {
    functions: HashMap<&'p str, &'p FunctionDef>,
    primitives: Primitives,
    max_steps: u64,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            functions: program.functions().map(|f| (f.name.node.as_str(), f)).collect(),
            primitives: Primitives::default(),
            max_steps: 100_000,
        }
    }

    pub fn with_primitives(mut self, primitives: Primitives) -> Self {
        self.primitives = primitives;
        self
    }

    pub fn with_step_limit(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Run `name` on positional arguments.
    pub fn call(&self, name: &str, args: Vec<Value>, nondet: &mut dyn Nondet) -> Result<Run> {
        let func = self
            .functions
            .get(name)
            .ok_or_else(|| InterpretError::UnknownFunction { name: name.to_string() })?;
        if func.params.len() != args.len() {
            return Err(InterpretError::Arity {
                name: name.to_string(),
                expected: func.params.len(),
                got: args.len(),
            });
        }
        let mut params = HashMap::new();
        for (p, arg) in func.params.iter().zip(args) {
            let Some(pname) = p.name() else { continue };
            let value = if p.is_array { arg } else { arg.coerce(p.ty) };
            params.insert(pname.to_string(), (p.ty, value));
        }
        let mut frame = Frame {
            scopes: vec![params],
            nondet,
            primitives: &self.primitives,
            ret: func.ret,
            steps: 0,
            max_steps: self.max_steps,
        };
        let flow = frame.block(&func.body)?;
        let outcome = match flow {
            Flow::Next => Outcome::Returned(None),
            Flow::Return(v) => Outcome::Returned(v),
            Flow::Halt(o) => o,
        };
        debug!(function = name, steps = frame.steps, ?outcome, "run finished");
        Ok(Run {
            outcome,
            vars: frame.snapshot(),
            steps: frame.steps,
        })
    }
}

enum Flow {
    Next,
    Return(Option<Value>),
    Halt(Outcome),
}

struct Frame<'a> {
    scopes: Vec<HashMap<String, (CType, Value)>>,
    nondet: &'a mut dyn Nondet,
    primitives: &'a Primitives,
    ret: CType,
    steps: u64,
    max_steps: u64,
}

impl Frame<'_> {
    fn snapshot(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for scope in &self.scopes {
            for (name, (_, v)) in scope {
                out.insert(name.clone(), v.clone());
            }
        }
        out
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(InterpretError::StepLimit { limit: self.max_steps });
        }
        Ok(())
    }

    fn lookup(&self, name: &str, span: Span) -> Result<&Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name).map(|(_, v)| v))
            .ok_or_else(|| InterpretError::UnknownVariable {
                name: name.to_string(),
                span,
            })
    }

    fn block(&mut self, block: &Block) -> Result<Flow> {
        self.scopes.push(HashMap::new());
        let mut flow = Flow::Next;
        for stmt in &block.stmts {
            flow = self.stmt(stmt)?;
            if !matches!(flow, Flow::Next) {
                break;
            }
        }
        // Keep the scope of a halted run for the snapshot.
        if matches!(flow, Flow::Next) {
            self.scopes.pop();
        }
        Ok(flow)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Decl(d) => {
                let value = match &d.init {
                    Some(e) => self.eval(e)?,
                    None => Value::Int(0),
                };
                let scope = self.scopes.last_mut().ok_or_else(|| InterpretError::Type {
                    message: "declaration outside any scope".to_string(),
                    span: d.span,
                })?;
                scope.insert(d.name.node.clone(), (d.ty, value.coerce(d.ty)));
                Ok(Flow::Next)
            }
            Stmt::Assign(a) => {
                let value = self.eval(&a.expr)?;
                let slot = self
                    .scopes
                    .iter_mut()
                    .rev()
                    .find_map(|s| s.get_mut(&a.target.node))
                    .ok_or_else(|| InterpretError::UnknownVariable {
                        name: a.target.node.clone(),
                        span: a.target.span,
                    })?;
                slot.1 = value.coerce(slot.0);
                Ok(Flow::Next)
            }
            Stmt::If(s) => {
                if self.truth(&s.cond)? {
                    self.block(&s.then_block)
                } else if let Some(b) = &s.else_block {
                    self.block(b)
                } else {
                    Ok(Flow::Next)
                }
            }
            Stmt::While(w) => {
                while self.truth(&w.cond)? {
                    self.tick()?;
                    match self.block(&w.body)? {
                        Flow::Next => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Next)
            }
            Stmt::Return(r) => {
                let value = match &r.expr {
                    Some(e) => Some(self.eval(e)?.coerce(self.ret)),
                    None => None,
                };
                // `return e;` in a `void` function still evaluates `e`.
                Ok(Flow::Return(value.filter(|_| self.ret != CType::Void)))
            }
            Stmt::Block(b) => self.block(b),
            Stmt::ExprStmt(e) => self.effect(e),
        }
    }

    /// Expression statements: verifier primitives act on the run, anything
    /// else is evaluated for its value and dropped.
    fn effect(&mut self, e: &Expr) -> Result<Flow> {
        if let ExprKind::Call { callee, args } = &e.kind {
            let name = callee.node.as_str();
            let is_assume = name == self.primitives.assume;
            if is_assume || name == self.primitives.assert {
                let [cond] = args.as_slice() else {
                    return Err(InterpretError::Arity {
                        name: name.to_string(),
                        expected: 1,
                        got: args.len(),
                    });
                };
                if self.truth(cond)? {
                    return Ok(Flow::Next);
                }
                let condition = shadow_parse::format_expr(cond);
                if is_assume {
                    debug!(%condition, "assumption does not hold, pruning");
                    return Ok(Flow::Halt(Outcome::Pruned { span: e.span }));
                }
                debug!(%condition, "assertion failed");
                return Ok(Flow::Halt(Outcome::AssertionFailed {
                    condition,
                    span: e.span,
                }));
            }
        }
        self.eval(e)?;
        Ok(Flow::Next)
    }

    fn truth(&mut self, e: &Expr) -> Result<bool> {
        let v = self.eval(e)?;
        v.truthy().ok_or_else(|| InterpretError::Type {
            message: "an array is not a condition".to_string(),
            span: e.span,
        })
    }

    fn scalar(&mut self, e: &Expr) -> Result<Value> {
        match self.eval(e)? {
            Value::Array(_) => Err(not_scalar(e.span)),
            v => Ok(v),
        }
    }

    fn eval(&mut self, e: &Expr) -> Result<Value> {
        match &e.kind {
            ExprKind::Number(text) => number(text).ok_or_else(|| InterpretError::Type {
                message: format!("cannot read numeric literal `{text}`"),
                span: e.span,
            }),
            ExprKind::StringLit(_) => Err(InterpretError::Type {
                message: "string literals have no value here".to_string(),
                span: e.span,
            }),
            ExprKind::Ident(id) => self.lookup(&id.node, id.span).cloned(),
            ExprKind::Index { base, index } => {
                let Some(name) = base.as_ident() else {
                    return Err(InterpretError::Type {
                        message: "only named arrays can be indexed".to_string(),
                        span: base.span,
                    });
                };
                let Value::Int(i) = self.scalar(index)? else {
                    return Err(InterpretError::Type {
                        message: "array subscripts must be integers".to_string(),
                        span: index.span,
                    });
                };
                let Value::Array(items) = self.lookup(name, base.span)? else {
                    return Err(InterpretError::Type {
                        message: format!("`{name}` is not an array"),
                        span: base.span,
                    });
                };
                usize::try_from(i)
                    .ok()
                    .and_then(|at| items.get(at))
                    .map(|r| Value::Float(*r))
                    .ok_or_else(|| InterpretError::OutOfBounds {
                        array: name.to_string(),
                        index: i,
                        len: items.len(),
                        span: e.span,
                    })
            }
            ExprKind::Unary { op: UnaryOp::Neg, expr } => match self.eval(expr)? {
                Value::Int(i) => int_result(i.checked_neg(), e.span),
                Value::Float(r) => Ok(Value::Float(-r)),
                Value::Array(_) => Err(not_scalar(expr.span)),
            },
            ExprKind::Unary { op: UnaryOp::Not, expr } => Ok(Value::bool(!self.truth(expr)?)),
            ExprKind::Binary { left, op: BinOp::And, right } => {
                Ok(Value::bool(self.truth(left)? && self.truth(right)?))
            }
            ExprKind::Binary { left, op: BinOp::Or, right } => {
                Ok(Value::bool(self.truth(left)? || self.truth(right)?))
            }
            ExprKind::Binary { left, op, right } => {
                let (l, r) = (self.scalar(left)?, self.scalar(right)?);
                arith(*op, l, r, e.span)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                if self.truth(cond)? {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }
            ExprKind::Call { callee, args } => {
                let name = callee.node.as_str();
                if name == self.primitives.havoc {
                    let r = self.nondet.next().ok_or(InterpretError::NondetExhausted { span: e.span })?;
                    return Ok(Value::Float(r));
                }
                if name == ABS_FN {
                    let [arg] = args.as_slice() else {
                        return Err(InterpretError::Arity {
                            name: name.to_string(),
                            expected: 1,
                            got: args.len(),
                        });
                    };
                    return match self.eval(arg)? {
                        Value::Int(i) => int_result(i.checked_abs(), e.span),
                        Value::Float(r) => Ok(Value::Float(r.abs())),
                        Value::Array(_) => Err(not_scalar(arg.span)),
                    };
                }
                Err(InterpretError::UnknownFunction { name: name.to_string() })
            }
        }
    }
}

fn not_scalar(span: Span) -> InterpretError {
    InterpretError::Type {
        message: "expected a scalar, found an array".to_string(),
        span,
    }
}

/// C literal: integral spelling gives `int`, anything else a float.
fn number(text: &str) -> Option<Value> {
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok().map(Value::Int);
    }
    Ratio::parse(text).map(Value::Float)
}

/// Integers stay clear of `i128::MIN` so that every one converts to a
/// [`Ratio`].
fn int_result(v: Option<i128>, span: Span) -> Result<Value> {
    match v {
        Some(i) if i != i128::MIN => Ok(Value::Int(i)),
        _ => Err(InterpretError::Overflow { span }),
    }
}

fn float_result(v: Option<Ratio>, span: Span) -> Result<Value> {
    v.map(Value::Float).ok_or(InterpretError::Overflow { span })
}

fn arith(op: BinOp, l: Value, r: Value, span: Span) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        return match op {
            BinOp::Add => int_result(a.checked_add(b), span),
            BinOp::Sub => int_result(a.checked_sub(b), span),
            BinOp::Mul => int_result(a.checked_mul(b), span),
            BinOp::Div | BinOp::Rem if b == 0 => Err(InterpretError::DivisionByZero { span }),
            BinOp::Div => int_result(a.checked_div(b), span),
            BinOp::Rem => int_result(a.checked_rem(b), span),
            cmp => Ok(Value::bool(compare(cmp, a.cmp(&b)))),
        };
    }
    let (Some(a), Some(b)) = (l.as_ratio(), r.as_ratio()) else {
        return Err(InterpretError::Type {
            message: "arithmetic on an array".to_string(),
            span,
        });
    };
    if op == BinOp::Div && b.is_zero() {
        return Err(InterpretError::DivisionByZero { span });
    }
    Ok(match op {
        BinOp::Add => float_result(a.checked_add(b), span)?,
        BinOp::Sub => float_result(a.checked_sub(b), span)?,
        BinOp::Mul => float_result(a.checked_mul(b), span)?,
        BinOp::Div => float_result(a.checked_div(b), span)?,
        BinOp::Rem => {
            return Err(InterpretError::Type {
                message: "`%` needs integer operands".to_string(),
                span,
            });
        }
        cmp => Value::bool(compare(cmp, a.cmp(&b))),
    })
}

fn compare(op: BinOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinOp::Eq => ord == Equal,
        BinOp::Ne => ord != Equal,
        BinOp::Lt => ord == Less,
        BinOp::Gt => ord == Greater,
        BinOp::Le => ord != Greater,
        BinOp::Ge => ord != Less,
        _ => false,
    }
}
