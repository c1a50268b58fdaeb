//! Expression nodes.

use crate::{ContractId, FunctionId, SourceUnit, Type, VarId};
use alloy_primitives::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    Gt,
}

impl BinaryOp {
    /// True if swapping the operands changes the result.
    pub fn is_commutative(&self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul | BinaryOp::Eq | BinaryOp::NotEq)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::Gt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation of a boolean.
    Not,
}

/// A typed, name-resolved expression. Identifiers refer directly to their
/// declarations; overload and scope resolution happened upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(U256),
    Bool(bool),
    Identifier(VarId),
    /// Assignment is an expression; its value is the assigned value.
    Assignment { var: VarId, value: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// Internal call to another function of the contract or one of its bases.
    Call { function: FunctionId, args: Vec<Expr> },
    /// Deployment of an already-compiled dependency contract; evaluates to
    /// the address of the created instance.
    NewContract { contract: ContractId },
}

impl Expr {
    /// The type of the value this expression leaves on the stack, or `None`
    /// for calls to functions without return values.
    pub fn ty(&self, unit: &SourceUnit) -> Option<Type> {
        match self {
            Expr::Number(_) => Some(Type::UINT256),
            Expr::Bool(_) => Some(Type::Bool),
            Expr::Identifier(var) | Expr::Assignment { var, .. } => {
                Some(unit.variables[*var].ty)
            }
            Expr::Binary { op, lhs, .. } => {
                if op.is_comparison() {
                    Some(Type::Bool)
                } else {
                    lhs.ty(unit)
                }
            }
            Expr::Unary { op: UnaryOp::Not, .. } => Some(Type::Bool),
            Expr::Call { function, .. } => {
                let returns = &unit.functions[*function].returns;
                returns.first().map(|ret| unit.variables[*ret].ty)
            }
            Expr::NewContract { .. } => Some(Type::Address),
        }
    }
}
