use std::sync::Arc;

/// Source position of a node's opening delimiter or first token, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat, // ~
    And,
    Or,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Name(String),
    /// `base.name`
    Attr { base: Box<Expr>, name: String },
    /// `base[index]`
    Index { base: Box<Expr>, index: Box<Expr> },
    /// `callee(args, kwargs)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    /// `base | name(args, kwargs)`
    Filter {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    /// `base is [not] name(args)`
    Test {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Chained comparison, e.g. `a < b <= c`. Evaluated left-to-right,
    /// short-circuiting on the first false link.
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// `then if test else otherwise`; a missing else yields undefined.
    Cond {
        then: Box<Expr>,
        test: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
}

/// A named, overridable template region.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDecl {
    pub name: String,
    pub scoped: bool,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroParam {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDecl {
    pub name: String,
    pub params: Vec<MacroParam>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Verbatim template text.
    Text(String),
    /// `{{ expr }}`
    Output(Expr),
    If {
        /// `(condition, body)` pairs: the `if` arm followed by each `elif`.
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    For {
        targets: Vec<String>,
        iter: Expr,
        /// Inline `if` filter, applied before the loop context is built.
        filter: Option<Expr>,
        recursive: bool,
        body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    Block(Arc<BlockDecl>),
    Extends { name: String },
    Include {
        name: Expr,
        with_context: bool,
        ignore_missing: bool,
    },
    Set { targets: Vec<String>, value: Expr },
    SetBlock { name: String, body: Vec<Stmt> },
    Macro(Arc<MacroDecl>),
    /// `{% call macro(...) %}body{% endcall %}`
    CallBlock { call: Expr, body: Arc<Vec<Stmt>> },
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Stmt>,
    },
    Autoescape { enabled: bool, body: Vec<Stmt> },
    Break,
    Continue,
}
