//! Error types for code generation
//!
//! The core assumes type-correct, name-resolved input, so broken internal
//! invariants (stack-height imbalance, missing constructor arguments, a
//! non-state variable on the accessor path, a valueless return-parameter
//! list) are fatal assertions that panic at the point of violation. The
//! variants here cover the remaining conditions a caller can meaningfully
//! observe: inputs the machine cannot express and failures the assembler
//! reports at finalization. Compilation stops at the first failure; there is
//! no partial-progress recovery.

use covenant_ast::Type;
use std::fmt;

#[derive(Debug)]
pub enum CodegenError {
    /// A stack slot would have to be addressed deeper than the 16 slots the
    /// machine's DUP/SWAP instructions can reach.
    StackTooDeep { depth: u32 },

    /// A contract creation expression references a contract whose bytecode
    /// was not supplied to the compiler.
    MissingCompiledContract { name: String },

    /// The external return-value packer only handles statically sized types.
    UnsupportedReturnType { ty: Type },

    /// Raised by the assembler at finalization (unresolved marks and the
    /// like).
    Assembly { message: String },
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::StackTooDeep { depth } => {
                write!(f, "stack too deep: slot {depth} is unreachable")
            }
            CodegenError::MissingCompiledContract { name } => {
                write!(f, "no compiled bytecode available for contract {name}")
            }
            CodegenError::UnsupportedReturnType { ty } => {
                write!(f, "cannot pack a return value of type {ty}")
            }
            CodegenError::Assembly { message } => write!(f, "assembly failed: {message}"),
        }
    }
}

impl std::error::Error for CodegenError {}

/// Result type for code generation operations
pub type Result<T> = std::result::Result<T, CodegenError>;
