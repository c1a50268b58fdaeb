//! Typed, name-resolved AST for the Covenant contract language.
//!
//! This crate is the input side of code generation: declarations live in
//! per-kind arenas on [`SourceUnit`] and reference each other through
//! [`index_vec`] newtype indices, so the code generator can key its tables by
//! plain ids instead of node pointers. Statements and expressions are owned
//! sum types inside their enclosing declaration.
//!
//! Parsing, scope resolution and type checking happen upstream; everything
//! here is assumed well-formed.

pub mod expr;
pub mod index;
pub mod stmt;
pub mod types;

pub use crate::{
    expr::{BinaryOp, Expr, UnaryOp},
    index::*,
    stmt::{Stmt, StmtKind},
    types::{padded_size, Type},
};
use alloy_primitives::keccak256;
use std::collections::BTreeMap;

/// A half-open byte range into the original source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub start: u32,
    pub end: u32,
}

impl SourceLocation {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Callable from the outside; part of the contract interface.
    Public,
    /// Only reachable through internal jumps.
    Internal,
}

/// A variable declaration: state variable, parameter, return parameter or
/// function local, depending on where it is referenced from.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
    pub visibility: Visibility,
    /// Initializer expression, if the declaration carries one.
    pub value: Option<Expr>,
    pub loc: SourceLocation,
}

/// An invocation of a modifier on a function definition, arguments resolved.
#[derive(Debug, Clone)]
pub struct ModifierInvocation {
    pub modifier: ModifierId,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub visibility: Visibility,
    pub params: Vec<VarId>,
    pub returns: Vec<VarId>,
    /// All locals declared anywhere in the body, collected by the resolver.
    /// Their stack slots are reserved at function entry.
    pub locals: Vec<VarId>,
    /// Modifiers in application order, outermost first.
    pub modifiers: Vec<ModifierInvocation>,
    pub body: Stmt,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct Modifier {
    pub name: String,
    pub params: Vec<VarId>,
    pub locals: Vec<VarId>,
    pub body: Stmt,
    pub loc: SourceLocation,
}

/// One `is Base(args...)` clause on a contract definition.
#[derive(Debug, Clone)]
pub struct InheritanceSpecifier {
    pub base: ContractId,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct Contract {
    pub name: String,
    /// C3-linearized ancestry, the contract itself first, then bases in
    /// most-derived-first order. Computed by the resolver.
    pub linearized_bases: Vec<ContractId>,
    pub base_specifiers: Vec<InheritanceSpecifier>,
    pub state_variables: Vec<VarId>,
    /// Regular named functions. The constructor and fallback function are
    /// referenced separately and are not part of this list.
    pub functions: Vec<FunctionId>,
    pub constructor: Option<FunctionId>,
    pub fallback: Option<FunctionId>,
    pub loc: SourceLocation,
}

/// An entry in a contract's external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceFunction {
    Function(FunctionId),
    /// The implicit getter of a public state variable.
    Accessor(VarId),
}

/// All declarations of one compilation, stored contiguously per kind, in the
/// same data-oriented fashion the rest of the pipeline uses.
#[derive(Debug, Clone, Default)]
pub struct SourceUnit {
    pub contracts: IndexVec<ContractId, Contract>,
    pub functions: IndexVec<FunctionId, Function>,
    pub modifiers: IndexVec<ModifierId, Modifier>,
    pub variables: IndexVec<VarId, Variable>,
}

impl SourceUnit {
    /// Canonical signature of a function: `name(type1,type2)`.
    pub fn function_signature(&self, function: FunctionId) -> String {
        let f = &self.functions[function];
        let params = f
            .params
            .iter()
            .map(|&p| self.variables[p].ty.canonical_name())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({params})", f.name)
    }

    /// Canonical signature of the implicit getter of a public state variable.
    pub fn accessor_signature(&self, var: VarId) -> String {
        format!("{}()", self.variables[var].name)
    }

    pub fn parameter_types(&self, function: FunctionId) -> Vec<Type> {
        self.functions[function].params.iter().map(|&p| self.variables[p].ty).collect()
    }

    pub fn return_types(&self, function: FunctionId) -> Vec<Type> {
        self.functions[function].returns.iter().map(|&r| self.variables[r].ty).collect()
    }

    /// The externally callable interface of a contract: every public function
    /// and public state-variable accessor of the contract and its bases,
    /// keyed by 4-byte selector. Walking the linearization most-derived first
    /// makes the most derived override win; the `BTreeMap` gives callers the
    /// deterministic selector order the emitted dispatch code relies on.
    pub fn interface_functions(
        &self,
        contract: ContractId,
    ) -> BTreeMap<[u8; 4], InterfaceFunction> {
        let mut interface = BTreeMap::new();
        let mut seen = std::collections::BTreeSet::new();
        for &base in &self.contracts[contract].linearized_bases {
            let base = &self.contracts[base];
            for &function in &base.functions {
                if self.functions[function].visibility != Visibility::Public {
                    continue;
                }
                let signature = self.function_signature(function);
                if seen.insert(signature.clone()) {
                    interface.insert(selector(&signature), InterfaceFunction::Function(function));
                }
            }
            for &var in &base.state_variables {
                if self.variables[var].visibility != Visibility::Public {
                    continue;
                }
                let signature = self.accessor_signature(var);
                if seen.insert(signature.clone()) {
                    interface.insert(selector(&signature), InterfaceFunction::Accessor(var));
                }
            }
        }
        interface
    }
}

/// First 4 bytes of the keccak-256 hash of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}
