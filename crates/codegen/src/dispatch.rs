//! External ABI dispatch
//!
//! The entry block of the runtime program: load the 4-byte selector from the
//! head of calldata, compare it against every interface function in selector
//! order, decode the matched function's arguments, call it through the
//! internal convention and pack its return values for RETURN. Unknown
//! selectors fall through to the fallback function, or STOP if there is none.

use crate::{
    compiler::ContractCompiler,
    context::{Declaration, Tag},
    error::Result,
    expression::ExpressionCompiler,
    utils,
};
use alloy_primitives::U256;
use covenant_ast::{ContractId, InterfaceFunction, Type};
use evm_glue::opcodes::Opcode;
use std::collections::BTreeMap;

impl<'a> ContractCompiler<'a> {
    pub(crate) fn append_function_selector(&mut self, contract: ContractId) -> Result<()> {
        let unit = self.unit;
        let interface = unit.interface_functions(contract);
        let mut unpacker_entry_points: BTreeMap<[u8; 4], Tag> = BTreeMap::new();

        // Retrieve the function signature hash from the head of calldata.
        if !interface.is_empty() {
            utils::load_from_memory(
                &mut self.context,
                0,
                Type::Uint((utils::DATA_START_OFFSET * 8) as u16),
                true,
                false,
            );
        }

        // Stack: [selector]. One DUP/EQ/JUMPI triple per interface function;
        // BTreeMap order keeps the emitted comparisons deterministic.
        for &selector in interface.keys() {
            let tag = self.context.new_tag();
            unpacker_entry_points.insert(selector, tag);
            self.context.append_dup(1)?;
            self.context.push_const(U256::from_be_slice(&selector));
            self.context.append_op(Opcode::EQ);
            self.context.append_conditional_jump_to(tag);
        }

        if let Some(fallback) = unit.contracts[contract].fallback {
            let return_tag = self.context.push_new_tag();
            self.visit_function(fallback)?;
            self.context.append_tag(return_tag);
            self.append_return_value_packer(&unit.return_types(fallback))?;
        } else {
            self.context.append_op(Opcode::STOP); // function not found
        }

        for (selector, interface_function) in &interface {
            self.context.append_tag(unpacker_entry_points[selector]);
            let return_tag = self.context.push_new_tag();
            let (param_types, return_types, entry) = match *interface_function {
                InterfaceFunction::Function(function) => (
                    unit.parameter_types(function),
                    unit.return_types(function),
                    self.context.entry_label(Declaration::Function(function)),
                ),
                InterfaceFunction::Accessor(var) => (
                    Vec::new(),
                    vec![unit.variables[var].ty],
                    self.context.entry_label(Declaration::StateVariable(var)),
                ),
            };
            self.append_calldata_unpacker(&param_types, false)?;
            self.context.append_jump_to(entry);
            self.context.append_tag(return_tag);
            self.append_return_value_packer(&return_types)?;
        }
        Ok(())
    }

    /// Decodes ABI-encoded arguments onto the stack in left-to-right order.
    ///
    /// Statically sized parameters are walked with compile-time offsets until
    /// the first dynamically sized one; from there a runtime cursor lives on
    /// the stack and advances past each value. Dynamic values decode to a
    /// (data offset, length) pair; their lengths sit in the head area, one
    /// word per dynamic parameter, the data padded to word boundaries in the
    /// tail. `from_memory` selects memory loads, used for constructor
    /// arguments which are copied to scratch memory first.
    pub(crate) fn append_calldata_unpacker(
        &mut self,
        param_types: &[Type],
        from_memory: bool,
    ) -> Result<()> {
        // Calldata size is not checked; everything reads as zero-padded.
        let from_calldata = !from_memory;
        let mut offset = utils::DATA_START_OFFSET;

        let dynamic_parameter_count =
            param_types.iter().filter(|t| t.is_dynamically_sized()).count() as u32;
        offset += dynamic_parameter_count * 32;
        let mut current_dynamic_parameter = 0u32;

        for &ty in param_types {
            if ty.is_dynamically_sized() {
                if current_dynamic_parameter == 0 {
                    // Switch from compile-time offsets to the runtime cursor.
                    self.context.push_const(U256::from(offset));
                }
                // Retrieve the length from the head area.
                utils::load_from_memory(
                    &mut self.context,
                    utils::DATA_START_OFFSET + current_dynamic_parameter * 32,
                    Type::UINT256,
                    from_calldata,
                    true,
                );
                // Stack: [cursor, length]. Pad a copy of the length up to a
                // word boundary: (length + 31) / 32 * 32.
                self.context.push_const(U256::from(32u8));
                self.context.append_dup(1)?;
                self.context.push_const(U256::from(31u8));
                self.context.append_dup(4)?;
                self.context.append_op(Opcode::ADD);
                self.context.append_op(Opcode::DIV);
                self.context.append_op(Opcode::MUL);
                // Stack: [cursor, length, padded_length]. The old cursor
                // becomes the value's data offset; the new cursor goes past
                // the padded data.
                self.context.append_dup(3)?;
                self.context.append_op(Opcode::ADD);
                // Stack: [data_offset, length, new_cursor].
                current_dynamic_parameter += 1;
            } else if current_dynamic_parameter == 0 {
                // Still before the first dynamic parameter: static load.
                offset +=
                    utils::load_from_memory(&mut self.context, offset, ty, from_calldata, true);
            } else {
                utils::load_from_memory_dynamic(&mut self.context, ty, from_calldata)?;
            }
        }
        if dynamic_parameter_count > 0 {
            self.context.append_op(Opcode::POP);
        }
        Ok(())
    }

    /// Copies the return values from the stack into scratch memory starting
    /// at offset 0, one ABI word each, and returns that range. The values are
    /// deliberately copied word by word; the stack is not cleaned up because
    /// RETURN terminates the frame.
    pub(crate) fn append_return_value_packer(&mut self, return_types: &[Type]) -> Result<()> {
        let unit = self.unit;
        let mut data_offset = 0u32;
        let mut stack_depth: u32 = return_types.iter().map(|t| t.size_on_stack()).sum();
        for &ty in return_types {
            utils::copy_to_stack_top(&mut self.context, stack_depth, ty)?;
            ExpressionCompiler::new(unit, &mut self.context)
                .append_type_conversion(ty, ty, true)?;
            data_offset += utils::store_in_memory(&mut self.context, data_offset, ty)?;
            stack_depth -= ty.size_on_stack();
        }
        self.context.push_const(U256::from(data_offset));
        self.context.push_const(U256::ZERO);
        self.context.append_op(Opcode::RETURN);
        Ok(())
    }
}
