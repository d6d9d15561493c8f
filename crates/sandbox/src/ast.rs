//! Closed syntax tree for the evaluator's expression language.
//!
//! The parser recognises more than the evaluator will run: definitions,
//! imports, exception handling and friends are parsed into their own node
//! kinds so the structural gate can reject them by name. [`NodeKind::policy`]
//! is the single allow/deny table.

use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    Break,
    Continue,
    Pass,
    FunctionDef,
    ClassDef,
    Import,
    ImportFrom,
    Try,
    With,
    Global,
    Nonlocal,
    Return(Option<Expr>),
    Raise(Option<Expr>),
    Delete(Vec<Target>),
    Assert(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Attribute { value: Box<Expr>, attr: String },
    Tuple(Vec<Target>),
    Starred(Box<Target>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FPart {
    Lit(String),
    Field {
        expr: Expr,
        conversion: Option<char>,
        spec: String,
    },
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
    MatMul,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::MatMul => "@",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: Target,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Const(Const),
    JoinedStr(Vec<FPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Set(Vec<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda(Rc<Lambda>),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    ListComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    SetComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    GeneratorExp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    Starred(Box<Expr>),
    DoubleStarred(Box<Expr>),
    NamedExpr {
        target: String,
        value: Box<Expr>,
    },
    Yield(Option<Box<Expr>>),
    Await(Box<Expr>),
    Ellipsis,
}

/// Every node kind the parser can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    // statements
    ExprStmt,
    Assign,
    AugAssign,
    If,
    For,
    While,
    Break,
    Continue,
    Pass,
    FunctionDef,
    ClassDef,
    Import,
    ImportFrom,
    Try,
    With,
    Global,
    Nonlocal,
    Return,
    Raise,
    Delete,
    Assert,
    // assignment targets
    NameTarget,
    SubscriptTarget,
    AttributeTarget,
    TupleTarget,
    StarredTarget,
    // expressions
    Constant,
    JoinedStr,
    Name,
    List,
    Tuple,
    Dict,
    Set,
    BinOp,
    MatMul,
    UnaryOp,
    BoolOp,
    Compare,
    IfExp,
    Lambda,
    Attribute,
    Subscript,
    Slice,
    Call,
    ListComp,
    SetComp,
    DictComp,
    GeneratorExp,
    Starred,
    DoubleStarred,
    NamedExpr,
    Yield,
    Await,
    Ellipsis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Allow,
    Deny,
}

impl NodeKind {
    pub const ALL: &'static [NodeKind] = &[
        Self::ExprStmt,
        Self::Assign,
        Self::AugAssign,
        Self::If,
        Self::For,
        Self::While,
        Self::Break,
        Self::Continue,
        Self::Pass,
        Self::FunctionDef,
        Self::ClassDef,
        Self::Import,
        Self::ImportFrom,
        Self::Try,
        Self::With,
        Self::Global,
        Self::Nonlocal,
        Self::Return,
        Self::Raise,
        Self::Delete,
        Self::Assert,
        Self::NameTarget,
        Self::SubscriptTarget,
        Self::AttributeTarget,
        Self::TupleTarget,
        Self::StarredTarget,
        Self::Constant,
        Self::JoinedStr,
        Self::Name,
        Self::List,
        Self::Tuple,
        Self::Dict,
        Self::Set,
        Self::BinOp,
        Self::MatMul,
        Self::UnaryOp,
        Self::BoolOp,
        Self::Compare,
        Self::IfExp,
        Self::Lambda,
        Self::Attribute,
        Self::Subscript,
        Self::Slice,
        Self::Call,
        Self::ListComp,
        Self::SetComp,
        Self::DictComp,
        Self::GeneratorExp,
        Self::Starred,
        Self::DoubleStarred,
        Self::NamedExpr,
        Self::Yield,
        Self::Await,
        Self::Ellipsis,
    ];

    /// The allow/deny table. Exhaustive on purpose: a new node kind does not
    /// compile until it is classified here.
    pub fn policy(self) -> Policy {
        use Policy::{Allow, Deny};
        match self {
            Self::ExprStmt => Allow,
            Self::Assign => Allow,
            Self::AugAssign => Allow,
            Self::If => Allow,
            Self::For => Allow,
            Self::While => Allow,
            Self::Break => Allow,
            Self::Continue => Allow,
            Self::Pass => Allow,
            Self::FunctionDef => Deny,
            Self::ClassDef => Deny,
            Self::Import => Deny,
            Self::ImportFrom => Deny,
            Self::Try => Deny,
            Self::With => Deny,
            Self::Global => Deny,
            Self::Nonlocal => Deny,
            Self::Return => Deny,
            Self::Raise => Deny,
            Self::Delete => Deny,
            Self::Assert => Deny,
            Self::NameTarget => Allow,
            Self::SubscriptTarget => Allow,
            Self::AttributeTarget => Deny,
            Self::TupleTarget => Allow,
            Self::StarredTarget => Deny,
            Self::Constant => Allow,
            Self::JoinedStr => Allow,
            Self::Name => Allow,
            Self::List => Allow,
            Self::Tuple => Allow,
            Self::Dict => Allow,
            Self::Set => Allow,
            Self::BinOp => Allow,
            Self::MatMul => Deny,
            Self::UnaryOp => Allow,
            Self::BoolOp => Allow,
            Self::Compare => Allow,
            Self::IfExp => Allow,
            Self::Lambda => Allow,
            Self::Attribute => Allow,
            Self::Subscript => Allow,
            Self::Slice => Allow,
            Self::Call => Allow,
            Self::ListComp => Allow,
            Self::SetComp => Allow,
            Self::DictComp => Allow,
            Self::GeneratorExp => Allow,
            Self::Starred => Deny,
            Self::DoubleStarred => Deny,
            Self::NamedExpr => Deny,
            Self::Yield => Deny,
            Self::Await => Deny,
            Self::Ellipsis => Deny,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ExprStmt => "expression statement",
            Self::Assign => "assignment",
            Self::AugAssign => "augmented assignment",
            Self::If => "if",
            Self::For => "for",
            Self::While => "while",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Pass => "pass",
            Self::FunctionDef => "def",
            Self::ClassDef => "class",
            Self::Import => "import",
            Self::ImportFrom => "from-import",
            Self::Try => "try",
            Self::With => "with",
            Self::Global => "global",
            Self::Nonlocal => "nonlocal",
            Self::Return => "return",
            Self::Raise => "raise",
            Self::Delete => "del",
            Self::Assert => "assert",
            Self::NameTarget => "name target",
            Self::SubscriptTarget => "subscript target",
            Self::AttributeTarget => "attribute assignment",
            Self::TupleTarget => "tuple target",
            Self::StarredTarget => "starred target",
            Self::Constant => "constant",
            Self::JoinedStr => "f-string",
            Self::Name => "name",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::BinOp => "binary operator",
            Self::MatMul => "@",
            Self::UnaryOp => "unary operator",
            Self::BoolOp => "boolean operator",
            Self::Compare => "comparison",
            Self::IfExp => "conditional expression",
            Self::Lambda => "lambda",
            Self::Attribute => "attribute",
            Self::Subscript => "subscript",
            Self::Slice => "slice",
            Self::Call => "call",
            Self::ListComp => "list comprehension",
            Self::SetComp => "set comprehension",
            Self::DictComp => "dict comprehension",
            Self::GeneratorExp => "generator expression",
            Self::Starred => "*unpacking",
            Self::DoubleStarred => "**unpacking",
            Self::NamedExpr => ":=",
            Self::Yield => "yield",
            Self::Await => "await",
            Self::Ellipsis => "...",
        }
    }
}

impl StmtKind {
    pub fn node_kind(&self) -> NodeKind {
        match self {
            Self::Expr(_) => NodeKind::ExprStmt,
            Self::Assign { .. } => NodeKind::Assign,
            Self::AugAssign { .. } => NodeKind::AugAssign,
            Self::If { .. } => NodeKind::If,
            Self::For { .. } => NodeKind::For,
            Self::While { .. } => NodeKind::While,
            Self::Break => NodeKind::Break,
            Self::Continue => NodeKind::Continue,
            Self::Pass => NodeKind::Pass,
            Self::FunctionDef => NodeKind::FunctionDef,
            Self::ClassDef => NodeKind::ClassDef,
            Self::Import => NodeKind::Import,
            Self::ImportFrom => NodeKind::ImportFrom,
            Self::Try => NodeKind::Try,
            Self::With => NodeKind::With,
            Self::Global => NodeKind::Global,
            Self::Nonlocal => NodeKind::Nonlocal,
            Self::Return(_) => NodeKind::Return,
            Self::Raise(_) => NodeKind::Raise,
            Self::Delete(_) => NodeKind::Delete,
            Self::Assert(_) => NodeKind::Assert,
        }
    }
}

impl Target {
    pub fn node_kind(&self) -> NodeKind {
        match self {
            Self::Name(_) => NodeKind::NameTarget,
            Self::Subscript { .. } => NodeKind::SubscriptTarget,
            Self::Attribute { .. } => NodeKind::AttributeTarget,
            Self::Tuple(_) => NodeKind::TupleTarget,
            Self::Starred(_) => NodeKind::StarredTarget,
        }
    }
}

impl ExprKind {
    pub fn node_kind(&self) -> NodeKind {
        match self {
            Self::Const(_) => NodeKind::Constant,
            Self::JoinedStr(_) => NodeKind::JoinedStr,
            Self::Name(_) => NodeKind::Name,
            Self::List(_) => NodeKind::List,
            Self::Tuple(_) => NodeKind::Tuple,
            Self::Dict(_) => NodeKind::Dict,
            Self::Set(_) => NodeKind::Set,
            Self::BinOp {
                op: BinOp::MatMul, ..
            } => NodeKind::MatMul,
            Self::BinOp { .. } => NodeKind::BinOp,
            Self::UnaryOp { .. } => NodeKind::UnaryOp,
            Self::BoolOp { .. } => NodeKind::BoolOp,
            Self::Compare { .. } => NodeKind::Compare,
            Self::IfExp { .. } => NodeKind::IfExp,
            Self::Lambda(_) => NodeKind::Lambda,
            Self::Attribute { .. } => NodeKind::Attribute,
            Self::Subscript { .. } => NodeKind::Subscript,
            Self::Slice { .. } => NodeKind::Slice,
            Self::Call { .. } => NodeKind::Call,
            Self::ListComp { .. } => NodeKind::ListComp,
            Self::SetComp { .. } => NodeKind::SetComp,
            Self::DictComp { .. } => NodeKind::DictComp,
            Self::GeneratorExp { .. } => NodeKind::GeneratorExp,
            Self::Starred(_) => NodeKind::Starred,
            Self::DoubleStarred(_) => NodeKind::DoubleStarred,
            Self::NamedExpr { .. } => NodeKind::NamedExpr,
            Self::Yield(_) => NodeKind::Yield,
            Self::Await(_) => NodeKind::Await,
            Self::Ellipsis => NodeKind::Ellipsis,
        }
    }
}

/// A borrowed view of any node, handed to [`Program::walk`] callbacks.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Stmt(&'a Stmt),
    Target(&'a Target, usize),
    Expr(&'a Expr),
}

impl Node<'_> {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Stmt(stmt) => stmt.kind.node_kind(),
            Node::Target(target, _) => target.node_kind(),
            Node::Expr(expr) => expr.kind.node_kind(),
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Node::Stmt(stmt) => stmt.line,
            Node::Target(_, line) => *line,
            Node::Expr(expr) => expr.line,
        }
    }
}

impl Program {
    /// Pre-order traversal of every node. The callback may stop the walk by
    /// returning an error.
    pub fn walk<E>(&self, visit: &mut impl FnMut(Node<'_>) -> Result<(), E>) -> Result<(), E> {
        walk_block(&self.body, visit)
    }
}

fn walk_block<E>(body: &[Stmt], visit: &mut impl FnMut(Node<'_>) -> Result<(), E>) -> Result<(), E> {
    for stmt in body {
        walk_stmt(stmt, visit)?;
    }
    Ok(())
}

fn walk_stmt<E>(stmt: &Stmt, visit: &mut impl FnMut(Node<'_>) -> Result<(), E>) -> Result<(), E> {
    visit(Node::Stmt(stmt))?;
    match &stmt.kind {
        StmtKind::Expr(expr) | StmtKind::Assert(expr) => walk_expr(expr, visit),
        StmtKind::Assign { targets, value } => {
            for target in targets {
                walk_target(target, stmt.line, visit)?;
            }
            walk_expr(value, visit)
        }
        StmtKind::AugAssign { target, value, .. } => {
            walk_target(target, stmt.line, visit)?;
            walk_expr(value, visit)
        }
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            walk_expr(test, visit)?;
            walk_block(body, visit)?;
            walk_block(orelse, visit)
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
        } => {
            walk_target(target, stmt.line, visit)?;
            walk_expr(iter, visit)?;
            walk_block(body, visit)?;
            walk_block(orelse, visit)
        }
        StmtKind::Return(value) | StmtKind::Raise(value) => match value {
            Some(expr) => walk_expr(expr, visit),
            None => Ok(()),
        },
        StmtKind::Delete(targets) => {
            for target in targets {
                walk_target(target, stmt.line, visit)?;
            }
            Ok(())
        }
        StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Pass
        | StmtKind::FunctionDef
        | StmtKind::ClassDef
        | StmtKind::Import
        | StmtKind::ImportFrom
        | StmtKind::Try
        | StmtKind::With
        | StmtKind::Global
        | StmtKind::Nonlocal => Ok(()),
    }
}

fn walk_target<E>(
    target: &Target,
    line: usize,
    visit: &mut impl FnMut(Node<'_>) -> Result<(), E>,
) -> Result<(), E> {
    visit(Node::Target(target, line))?;
    match target {
        Target::Name(_) => Ok(()),
        Target::Subscript { value, index } => {
            walk_expr(value, visit)?;
            walk_expr(index, visit)
        }
        Target::Attribute { value, .. } => walk_expr(value, visit),
        Target::Tuple(items) => {
            for item in items {
                walk_target(item, line, visit)?;
            }
            Ok(())
        }
        Target::Starred(inner) => walk_target(inner, line, visit),
    }
}

fn walk_generators<E>(
    generators: &[Comprehension],
    line: usize,
    visit: &mut impl FnMut(Node<'_>) -> Result<(), E>,
) -> Result<(), E> {
    for generator in generators {
        walk_target(&generator.target, line, visit)?;
        walk_expr(&generator.iter, visit)?;
        for cond in &generator.ifs {
            walk_expr(cond, visit)?;
        }
    }
    Ok(())
}

fn walk_expr<E>(expr: &Expr, visit: &mut impl FnMut(Node<'_>) -> Result<(), E>) -> Result<(), E> {
    visit(Node::Expr(expr))?;
    match &expr.kind {
        ExprKind::Const(_) | ExprKind::Name(_) | ExprKind::Ellipsis => Ok(()),
        ExprKind::JoinedStr(parts) => {
            for part in parts {
                if let FPart::Field { expr, .. } = part {
                    walk_expr(expr, visit)?;
                }
            }
            Ok(())
        }
        ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
            for item in items {
                walk_expr(item, visit)?;
            }
            Ok(())
        }
        ExprKind::Dict(pairs) => {
            for (key, value) in pairs {
                walk_expr(key, visit)?;
                walk_expr(value, visit)?;
            }
            Ok(())
        }
        ExprKind::BinOp { left, right, .. } => {
            walk_expr(left, visit)?;
            walk_expr(right, visit)
        }
        ExprKind::UnaryOp { operand, .. } => walk_expr(operand, visit),
        ExprKind::BoolOp { values, .. } => {
            for value in values {
                walk_expr(value, visit)?;
            }
            Ok(())
        }
        ExprKind::Compare { left, ops } => {
            walk_expr(left, visit)?;
            for (_, right) in ops {
                walk_expr(right, visit)?;
            }
            Ok(())
        }
        ExprKind::IfExp { test, body, orelse } => {
            walk_expr(test, visit)?;
            walk_expr(body, visit)?;
            walk_expr(orelse, visit)
        }
        ExprKind::Lambda(lambda) => walk_expr(&lambda.body, visit),
        ExprKind::Attribute { value, .. } => walk_expr(value, visit),
        ExprKind::Subscript { value, index } => {
            walk_expr(value, visit)?;
            walk_expr(index, visit)
        }
        ExprKind::Slice { lower, upper, step } => {
            for part in [lower, upper, step].into_iter().flatten() {
                walk_expr(part, visit)?;
            }
            Ok(())
        }
        ExprKind::Call { func, args, kwargs } => {
            walk_expr(func, visit)?;
            for arg in args {
                walk_expr(arg, visit)?;
            }
            for (_, value) in kwargs {
                walk_expr(value, visit)?;
            }
            Ok(())
        }
        ExprKind::ListComp { elt, generators }
        | ExprKind::SetComp { elt, generators }
        | ExprKind::GeneratorExp { elt, generators } => {
            walk_generators(generators, expr.line, visit)?;
            walk_expr(elt, visit)
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            walk_generators(generators, expr.line, visit)?;
            walk_expr(key, visit)?;
            walk_expr(value, visit)
        }
        ExprKind::Starred(inner) | ExprKind::DoubleStarred(inner) | ExprKind::Await(inner) => {
            walk_expr(inner, visit)
        }
        ExprKind::NamedExpr { value, .. } => walk_expr(value, visit),
        ExprKind::Yield(value) => match value {
            Some(inner) => walk_expr(inner, visit),
            None => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn policy_table_covers_every_kind_once() {
        let unique: HashSet<NodeKind> = NodeKind::ALL.iter().copied().collect();
        assert_eq!(unique.len(), NodeKind::ALL.len());
        let names: HashSet<&str> = NodeKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names.len(), NodeKind::ALL.len());
    }

    #[test]
    fn definitions_and_imports_are_denied() {
        for kind in [
            NodeKind::FunctionDef,
            NodeKind::ClassDef,
            NodeKind::Import,
            NodeKind::ImportFrom,
            NodeKind::Try,
            NodeKind::Global,
            NodeKind::Nonlocal,
            NodeKind::Yield,
            NodeKind::Await,
        ] {
            assert_eq!(kind.policy(), Policy::Deny, "{kind:?}");
        }
        for kind in [NodeKind::Lambda, NodeKind::ListComp, NodeKind::While, NodeKind::Call] {
            assert_eq!(kind.policy(), Policy::Allow, "{kind:?}");
        }
    }
}
