//! Function-level code generation
//!
//! A function's code consists of its entry tag, the reserved return-value and
//! local slots, the modifier-wrapped body and a single exit point: the return
//! tag followed by the epilogue shuffle that rearranges the frame into
//! `[return values] [return address]` before the final JUMP.

use crate::{
    compiler::ContractCompiler,
    context::Declaration,
    error::Result,
    expression::ExpressionCompiler,
    utils,
};
use covenant_ast::{FunctionId, VarId};
use evm_glue::opcodes::Opcode;
use smallvec::SmallVec;

impl<'a> ContractCompiler<'a> {
    pub(crate) fn visit_function(&mut self, function: FunctionId) -> Result<()> {
        let unit = self.unit;
        let loc = unit.functions[function].loc;
        self.with_location(loc, |this| {
            this.context.start_function(Declaration::Function(function));
            this.return_tag = this.context.new_tag();
            this.break_tags.clear();
            this.continue_tags.clear();
            this.stack_cleanup_for_return = 0;
            this.current_function = Some(function);
            this.modifier_depth = 0;

            // Stack upon entry: [return address] [arg0] [arg1] ... [argn].
            // The caller pushed the arguments, so the height is adjusted
            // rather than emitted. Return values and locals get zeroed slots:
            // [retarg0] ... [retargm] [localvar0] ... [localvarp].
            let f = &unit.functions[function];
            let mut parameters_size = utils::size_on_stack(unit, &f.params);
            this.context.adjust_stack_offset(parameters_size as i32);
            for &param in &f.params {
                this.context.add_variable(param, parameters_size);
                parameters_size -= unit.variables[param].ty.size_on_stack();
            }
            for &ret in &f.returns {
                this.context.add_and_initialize_variable(unit, ret);
            }
            for &local in &f.locals {
                this.context.add_and_initialize_variable(unit, local);
            }

            this.append_modifier_or_function_code()?;

            this.context.append_tag(this.return_tag);
            this.append_function_epilogue(function)
        })
    }

    /// Re-shuffles the stack from `[ret_addr] [args] [rets] [locals]` to
    /// `[rets] [ret_addr]` and jumps back to the caller.
    fn append_function_epilogue(&mut self, function: FunctionId) -> Result<()> {
        let unit = self.unit;
        let f = &unit.functions[function];
        let arguments_size = utils::size_on_stack(unit, &f.params) as usize;
        let return_values_size = utils::size_on_stack(unit, &f.returns) as usize;
        let local_variables_size = utils::size_on_stack(unit, &f.locals) as usize;

        // Target position of each slot, bottom first; -1 marks a slot to
        // discard. The return values having increasing target indices is what
        // keeps this loop linear.
        let mut layout: SmallVec<[i32; 16]> = SmallVec::new();
        layout.push(return_values_size as i32); // target of the return address
        for _ in 0..arguments_size {
            layout.push(-1);
        }
        for i in 0..return_values_size {
            layout.push(i as i32);
        }
        for _ in 0..local_variables_size {
            layout.push(-1);
        }

        loop {
            let last = *layout.last().expect("layout always holds the return address");
            if last == layout.len() as i32 - 1 {
                break;
            }
            if last < 0 {
                self.context.append_op(Opcode::POP);
                layout.pop();
            } else {
                let distance = layout.len() as u32 - 1 - last as u32;
                self.context.append_swap(distance)?;
                let top = layout.len() - 1;
                layout.swap(last as usize, top);
            }
        }

        self.context.append_op(Opcode::JUMP);
        Ok(())
    }

    /// Either the function's own body or the modifier at the current
    /// expansion depth. A placeholder inside a modifier body recurses here
    /// with the depth increased, inlining the next layer.
    pub(crate) fn append_modifier_or_function_code(&mut self) -> Result<()> {
        let unit = self.unit;
        let function = self.current_function.expect("modifier expansion outside a function");
        let f = &unit.functions[function];
        if self.modifier_depth >= f.modifiers.len() {
            return self.visit_statement(&f.body);
        }

        let invocation = &f.modifiers[self.modifier_depth];
        let modifier = &unit.modifiers[invocation.modifier];
        assert_eq!(
            modifier.params.len(),
            invocation.args.len(),
            "modifier arity was checked upstream"
        );
        self.with_location(modifier.loc, |this| {
            for (i, &param) in modifier.params.iter().enumerate() {
                this.context.add_variable(param, 0);
                this.compile_expression(&invocation.args[i], Some(unit.variables[param].ty))?;
            }
            for &local in &modifier.locals {
                this.context.add_and_initialize_variable(unit, local);
            }

            // A return from inside the wrapped body has to unwind this
            // modifier's frame as well.
            let stack_surplus = utils::size_on_stack(unit, &modifier.params)
                + utils::size_on_stack(unit, &modifier.locals);
            this.stack_cleanup_for_return += stack_surplus;

            this.visit_statement(&modifier.body)?;

            for _ in 0..stack_surplus {
                this.context.append_op(Opcode::POP);
            }
            this.stack_cleanup_for_return -= stack_surplus;
            Ok(())
        })
    }

    /// A public state variable's implicit getter is a function of its own:
    /// entry tag plus the accessor body emitted by the expression compiler.
    pub(crate) fn visit_state_variable(&mut self, var: VarId) -> Result<()> {
        let unit = self.unit;
        let loc = unit.variables[var].loc;
        self.with_location(loc, |this| {
            this.context.start_function(Declaration::StateVariable(var));
            this.break_tags.clear();
            this.continue_tags.clear();
            ExpressionCompiler::new(unit, &mut this.context).append_state_variable_accessor(var)
        })
    }
}
