//! Abstract syntax tree
//!
//! Tagged statement and expression nodes, each carrying the source
//! position of its first token. Nodes own their children outright;
//! `Clone` is a deep copy (the parser clones the destination when
//! desugaring compound assignments).

use std::fmt;

use brio_core::Pos;

/// Binary and unary operators as they appear in the tree. `<`/`<=`
/// survive to the compiler, which encodes them by swapping operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Bang,
    Plus,
    Minus,
    Asterisk,
    Slash,
    Modulus,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    LogicalAnd,
    LogicalOr,
    BitAnd,
    BitOr,
    BitXor,
    Lshift,
    Rshift,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Bang => "!",
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Asterisk => "*",
            Operator::Slash => "/",
            Operator::Modulus => "%",
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::LogicalAnd => "&&",
            Operator::LogicalOr => "||",
            Operator::BitAnd => "&",
            Operator::BitOr => "|",
            Operator::BitXor => "^",
            Operator::Lshift => "<<",
            Operator::Rshift => ">>",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct FnLit {
    /// Filled in for `fn name() {}` declarations and `var f = fn...`
    /// definitions so the function can reference itself.
    pub name: Option<String>,
    pub params: Vec<Ident>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: Pos) -> Expr {
        Expr { kind, pos }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Ident(Ident),
    NumberLit(f64),
    BoolLit(bool),
    StringLit(String),
    NullLit,
    ArrayLit(Vec<Expr>),
    /// Parallel key/value sequences, literal order preserved.
    MapLit {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },
    Prefix {
        op: Operator,
        right: Box<Expr>,
    },
    Infix {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    FnLit(FnLit),
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Assign {
        dest: Box<Expr>,
        source: Box<Expr>,
        /// `true` leaves the destination's old value as the result
        /// (`x++`); `false` leaves the assigned value (`x = ...`,
        /// `++x`).
        is_postfix: bool,
    },
    Logical {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
}

/// One `if`/`else if` arm.
#[derive(Debug, Clone)]
pub struct IfCase {
    pub test: Expr,
    pub consequence: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

impl Stmt {
    pub fn new(kind: StmtKind, pos: Pos) -> Stmt {
        Stmt { kind, pos }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Define {
        name: Ident,
        value: Box<Expr>,
        assignable: bool,
    },
    If {
        cases: Vec<IfCase>,
        alternative: Option<Vec<Stmt>>,
    },
    Return(Option<Expr>),
    Expression(Expr),
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Foreach {
        iterator: Ident,
        source: Expr,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    Import {
        path: String,
    },
    Recover {
        error_ident: Ident,
        body: Vec<Stmt>,
    },
}
