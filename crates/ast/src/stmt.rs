//! Statement nodes.

use crate::{Expr, SourceLocation, VarId};

/// A statement together with the source range it was parsed from. The code
/// generator annotates every emitted assembly item with the location of the
/// statement being compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub loc: SourceLocation,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self { loc: SourceLocation::default(), kind }
    }

    pub fn with_loc(kind: StmtKind, loc: SourceLocation) -> Self {
        Self { loc, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Block(Vec<Stmt>),
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        /// Absent condition means the loop only exits through `break` or
        /// `return`.
        condition: Option<Expr>,
        /// The loop expression, run after the body on the fall-through path.
        step: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    Continue,
    Break,
    Return(Option<Expr>),
    /// Declaration of a function-local variable. The stack slot itself is
    /// reserved at function entry; this statement only runs the initializer.
    VariableDeclaration {
        var: VarId,
        value: Option<Expr>,
    },
    Expression(Expr),
    /// The `_` inside a modifier body where the wrapped function is inlined.
    Placeholder,
}
