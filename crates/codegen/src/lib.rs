//! Code generation core for the Covenant contract language
//!
//! Consumes a typed, name-resolved [`covenant_ast::SourceUnit`] plus the raw
//! bytecode of already-compiled dependency contracts and produces the two
//! linked programs of a contract: the CREATION program, which initializes
//! state, runs the constructor chain and returns the runtime program, and the
//! RUNTIME program, which dispatches external calls by 4-byte selector.
//!
//! Assembly goes through evm-glue: emission appends `Asm` items and mark
//! references to a [`CompilerContext`], and finalization resolves every mark
//! to its byte offset. The runtime program rides inside the creation program
//! as an embedded subroutine that the deployment code CODECOPYs to memory and
//! returns.

mod compiler;
mod context;
mod control_flow;
mod dispatch;
mod error;
mod expression;
mod function;
pub mod utils;

pub use crate::{
    compiler::ContractCompiler,
    context::{CompilerContext, Declaration, StackHeightChecker, Tag},
    error::{CodegenError, Result},
    expression::ExpressionCompiler,
};

use covenant_ast::{ContractId, SourceUnit};
use std::collections::BTreeMap;

/// The two linked programs produced by one contract compilation.
#[derive(Debug, Clone)]
pub struct CompiledContract {
    /// Executed once at deployment; its RETURN value is the runtime program.
    pub creation: Vec<u8>,
    /// Deployed code, executed on every call.
    pub runtime: Vec<u8>,
}

/// Compiles `contract` out of `unit` and returns its assembled programs.
pub fn compile_contract(
    unit: &SourceUnit,
    contract: ContractId,
    compiled_contracts: &BTreeMap<ContractId, Vec<u8>>,
) -> Result<CompiledContract> {
    let mut compiler = ContractCompiler::new(unit);
    compiler.compile_contract(contract, compiled_contracts)?;
    Ok(CompiledContract {
        creation: compiler.assembled_bytecode().to_vec(),
        runtime: compiler.runtime_bytecode().to_vec(),
    })
}

#[cfg(test)]
mod tests;
