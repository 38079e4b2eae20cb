#![forbid(unsafe_code)]

use miette::SourceSpan;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            Item::Prototype(_) => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Function(FunctionDef),
    Prototype(Prototype),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CType {
    Void,
    Int,
    Float,
    Double,
    Bool,
}

impl CType {
    pub fn as_str(self) -> &'static str {
        match self {
            CType::Void => "void",
            CType::Int => "int",
            CType::Float => "float",
            CType::Double => "double",
            CType::Bool => "bool",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub span: Span,
    pub ret: CType,
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Block,
}

/// `extern void f(int) __attribute__((...));`
#[derive(Clone, Debug, PartialEq)]
pub struct Prototype {
    pub span: Span,
    pub is_extern: bool,
    pub ret: CType,
    pub name: Ident,
    /// `None` for an empty `()` list, which C reads as "unspecified".
    pub params: Option<Vec<Param>>,
    /// Raw text of a trailing `__attribute__((...))`, without the keyword.
    pub attributes: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub span: Span,
    pub ty: CType,
    /// Prototypes may leave parameters unnamed.
    pub name: Option<Ident>,
    pub is_array: bool,
}

impl Param {
    pub fn named(ty: CType, name: impl Into<String>, is_array: bool, span: Span) -> Self {
        Self {
            span,
            ty,
            name: Some(Ident::new(span, name.into())),
            is_array,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|n| n.node.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(span: Span, stmts: Vec<Stmt>) -> Self {
        Self { span, stmts }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Decl(DeclStmt),
    Assign(AssignStmt),
    If(IfStmt),
    While(WhileStmt),
    Return(ReturnStmt),
    Block(Block),
    ExprStmt(Expr),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Decl(s) => s.span,
            Stmt::Assign(s) => s.span,
            Stmt::If(s) => s.span,
            Stmt::While(s) => s.span,
            Stmt::Return(s) => s.span,
            Stmt::Block(b) => b.span,
            Stmt::ExprStmt(e) => e.span,
        }
    }

    pub fn assign(name: impl Into<String>, expr: Expr, span: Span) -> Self {
        Stmt::Assign(AssignStmt {
            span,
            target: Ident::new(span, name.into()),
            expr,
        })
    }

    pub fn decl(ty: CType, name: impl Into<String>, init: Option<Expr>, span: Span) -> Self {
        Stmt::Decl(DeclStmt {
            span,
            ty,
            name: Ident::new(span, name.into()),
            init,
        })
    }

    /// `callee(args);`
    pub fn call(callee: &str, args: Vec<Expr>, span: Span) -> Self {
        Stmt::ExprStmt(Expr::call(callee, args, span))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeclStmt {
    pub span: Span,
    pub ty: CType,
    pub name: Ident,
    pub init: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub target: Ident,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub span: Span,
    pub cond: Expr,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub cond: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStmt {
    pub span: Span,
    pub expr: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Ident(Ident),
    /// Numeric literal, kept as written so printing is lossless.
    Number(String),
    StringLit(String),
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        callee: Ident,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Self { span, kind }
    }

    pub fn ident(name: impl Into<String>, span: Span) -> Self {
        Expr::new(span, ExprKind::Ident(Ident::new(span, name.into())))
    }

    pub fn number(text: impl Into<String>, span: Span) -> Self {
        Expr::new(span, ExprKind::Number(text.into()))
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        let span = base.span;
        Expr::new(
            span,
            ExprKind::Index {
                base: Box::new(base),
                index: Box::new(index),
            },
        )
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        let span = expr.span;
        Expr::new(
            span,
            ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
        )
    }

    pub fn binary(left: Expr, op: BinOp, right: Expr) -> Self {
        let span = left.span;
        Expr::new(
            span,
            ExprKind::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
        )
    }

    pub fn ternary(cond: Expr, then_expr: Expr, else_expr: Expr) -> Self {
        let span = cond.span;
        Expr::new(
            span,
            ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
        )
    }

    pub fn call(callee: &str, args: Vec<Expr>, span: Span) -> Self {
        Expr::new(
            span,
            ExprKind::Call {
                callee: Ident::new(span, callee.to_string()),
                args,
            },
        )
    }

    pub fn as_ident(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Ident(id) => Some(id.node.as_str()),
            _ => None,
        }
    }

    pub fn as_string_lit(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::StringLit(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,

    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    And,
    Or,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }
}
