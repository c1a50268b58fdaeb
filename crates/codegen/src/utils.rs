//! Stack and memory plumbing shared by the visitors
//!
//! The conventions in here define the calling surface between the emitted
//! code and the outside world: ABI-encoded values live in 32-byte slots,
//! value types right-aligned in their slot, and stack variables are addressed
//! by DUP/SWAP distances derived from their registered base offsets.

use crate::{
    context::CompilerContext,
    error::{CodegenError, Result},
};
use alloy_primitives::U256;
use covenant_ast::{SourceUnit, Type, VarId};
use evm_glue::opcodes::Opcode;

/// Offset where ABI-encoded arguments start: right after the 4-byte selector.
pub const DATA_START_OFFSET: u32 = 4;

/// Loads a statically sized value from calldata or scratch memory at a
/// compile-time offset and returns the number of bytes consumed.
///
/// With `pad_to_words` the value sits right-aligned in a full 32-byte slot
/// and a single word load suffices. Without it the value occupies its
/// unpadded size at `offset`, big end first, and is right-aligned by dividing
/// the loaded word — this is how the 4-byte selector comes off the front of
/// calldata.
pub fn load_from_memory(
    context: &mut CompilerContext,
    offset: u32,
    ty: Type,
    from_calldata: bool,
    pad_to_words: bool,
) -> u32 {
    assert!(!ty.is_dynamically_sized(), "dynamic values have no static load");
    let load_op = if from_calldata { Opcode::CALLDATALOAD } else { Opcode::MLOAD };
    let size = ty.unpadded_byte_size();
    if pad_to_words || size == 32 {
        context.push_const(U256::from(offset));
        context.append_op(load_op);
        32
    } else {
        context.push_const(U256::from(1u8) << (8 * (32 - size) as usize));
        context.push_const(U256::from(offset));
        context.append_op(load_op);
        context.append_op(Opcode::DIV);
        size
    }
}

/// Loads a statically sized, word-padded value from the runtime cursor on the
/// stack and advances the cursor.
///
/// Stack before: `[cursor]`; after: `[value, cursor + 32]`.
pub fn load_from_memory_dynamic(
    context: &mut CompilerContext,
    ty: Type,
    from_calldata: bool,
) -> Result<()> {
    assert!(!ty.is_dynamically_sized(), "dynamic values have no single-word load");
    let load_op = if from_calldata { Opcode::CALLDATALOAD } else { Opcode::MLOAD };
    context.append_dup(1)?;
    context.append_op(load_op);
    context.append_swap(1)?;
    context.push_const(U256::from(32u8));
    context.append_op(Opcode::ADD);
    Ok(())
}

/// Stores the value on top of the stack into scratch memory at a compile-time
/// offset, consuming it, and returns the number of bytes written. Values
/// occupy a full word, right-aligned, matching the ABI slot encoding.
pub fn store_in_memory(context: &mut CompilerContext, offset: u32, ty: Type) -> Result<u32> {
    if ty.is_dynamically_sized() {
        return Err(CodegenError::UnsupportedReturnType { ty });
    }
    context.push_const(U256::from(offset));
    context.append_op(Opcode::MSTORE);
    Ok(32)
}

/// Duplicates a value whose deepest slot is `depth` positions from the top.
pub fn copy_to_stack_top(context: &mut CompilerContext, depth: u32, ty: Type) -> Result<()> {
    // Each DUP pushes one slot, so the distance to the next source slot stays
    // constant while the copy grows.
    for _ in 0..ty.size_on_stack() {
        context.append_dup(depth)?;
    }
    Ok(())
}

/// Moves the value on top of the stack into the slots of a registered stack
/// variable, consuming it.
pub fn move_to_stack_variable(
    context: &mut CompilerContext,
    unit: &SourceUnit,
    var: VarId,
) -> Result<()> {
    let size = unit.variables[var].ty.size_on_stack() as i32;
    let base = context.base_stack_offset_of(var);
    let distance = context.stack_height() - base - size;
    assert!(distance >= 1, "value to move must sit above the variable's slots");
    // Move the variable starting from its top end; the swap distance is the
    // same for every slot because each POP shrinks the stack by one.
    for _ in 0..size {
        context.append_swap(distance as u32)?;
        context.append_op(Opcode::POP);
    }
    Ok(())
}

/// Drops a value of the given type from the top of the stack.
pub fn pop_stack_element(context: &mut CompilerContext, ty: Type) {
    for _ in 0..ty.size_on_stack() {
        context.append_op(Opcode::POP);
    }
}

/// Combined stack footprint of a declaration list.
pub fn size_on_stack(unit: &SourceUnit, vars: &[VarId]) -> u32 {
    vars.iter().map(|&v| unit.variables[v].ty.size_on_stack()).sum()
}
