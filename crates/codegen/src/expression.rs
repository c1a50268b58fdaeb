//! Expression-level code generation
//!
//! Lowers a single expression, leaving its value on the operand stack. The
//! statement visitors drive this through [`ExpressionCompiler::compile`] and
//! the conversion/accessor entry points; everything here works on the same
//! [`CompilerContext`] as the structured-statement emission.

use crate::{
    context::CompilerContext,
    error::{CodegenError, Result},
    utils,
};
use alloy_primitives::U256;
use covenant_ast::{BinaryOp, Expr, SourceUnit, Type, UnaryOp, VarId};
use evm_glue::opcodes::Opcode;

pub struct ExpressionCompiler<'a, 'ctx> {
    unit: &'a SourceUnit,
    context: &'ctx mut CompilerContext,
}

impl<'a, 'ctx> ExpressionCompiler<'a, 'ctx> {
    pub fn new(unit: &'a SourceUnit, context: &'ctx mut CompilerContext) -> Self {
        Self { unit, context }
    }

    /// Emits code leaving the expression's value on top of the stack.
    pub fn compile(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Number(value) => self.context.push_const(*value),
            Expr::Bool(value) => self.context.push_const(U256::from(*value as u8)),

            Expr::Identifier(var) => self.append_variable(*var)?,

            Expr::Assignment { var, value } => {
                self.compile(value)?;
                if let Some(from) = value.ty(self.unit) {
                    self.append_type_conversion(from, self.unit.variables[*var].ty, false)?;
                }
                // The assigned value is also the expression's value: keep a
                // copy on the stack and move the original into the variable.
                let ty = self.unit.variables[*var].ty;
                if let Some(slot) = self.context.storage_slot_of(*var) {
                    self.context.append_dup(1)?;
                    self.context.push_const(slot);
                    self.context.append_op(Opcode::SSTORE);
                } else {
                    utils::copy_to_stack_top(self.context, ty.size_on_stack(), ty)?;
                    utils::move_to_stack_variable(self.context, self.unit, *var)?;
                }
            }

            Expr::Binary { op, lhs, rhs } => {
                self.compile(lhs)?;
                self.compile(rhs)?;
                if !op.is_commutative() {
                    self.context.append_swap(1)?;
                }
                match op {
                    BinaryOp::Add => self.context.append_op(Opcode::ADD),
                    BinaryOp::Sub => self.context.append_op(Opcode::SUB),
                    BinaryOp::Mul => self.context.append_op(Opcode::MUL),
                    BinaryOp::Div => self.context.append_op(Opcode::DIV),
                    BinaryOp::Eq => self.context.append_op(Opcode::EQ),
                    BinaryOp::NotEq => {
                        self.context.append_op(Opcode::EQ);
                        self.context.append_op(Opcode::ISZERO);
                    }
                    BinaryOp::Lt => self.context.append_op(Opcode::LT),
                    BinaryOp::Gt => self.context.append_op(Opcode::GT),
                }
            }

            Expr::Unary { op: UnaryOp::Not, operand } => {
                self.compile(operand)?;
                self.context.append_op(Opcode::ISZERO);
            }

            Expr::Call { function, args } => self.append_internal_call(*function, args)?,

            Expr::NewContract { contract } => {
                let bytes = self
                    .context
                    .compiled_contract(*contract)
                    .ok_or_else(|| CodegenError::MissingCompiledContract {
                        name: self.unit.contracts[*contract].name.clone(),
                    })?
                    .to_vec();
                // Copy the creation code to scratch memory and CREATE it.
                let sub = self.context.append_subroutine(bytes); // [size]
                self.context.append_dup(1)?; // [size, size]
                self.context.push_subroutine_offset(sub); // [size, size, code_offset]
                self.context.push_const(U256::ZERO); // [size, size, code_offset, 0]
                self.context.append_op(Opcode::CODECOPY); // [size]
                self.context.push_const(U256::ZERO); // [size, mem_offset]
                self.context.push_const(U256::ZERO); // [size, mem_offset, value]
                self.context.append_op(Opcode::CREATE); // [address]
            }
        }
        Ok(())
    }

    /// Pushes the current value of a variable: SLOAD for state variables,
    /// DUPs of the registered stack slots for everything else.
    fn append_variable(&mut self, var: VarId) -> Result<()> {
        if let Some(slot) = self.context.storage_slot_of(var) {
            self.context.push_const(slot);
            self.context.append_op(Opcode::SLOAD);
            return Ok(());
        }
        let ty = self.unit.variables[var].ty;
        let base = self.context.base_stack_offset_of(var);
        let depth = self.context.stack_height() - base;
        assert!(depth >= 1, "variable slots must be below the current stack top");
        utils::copy_to_stack_top(self.context, depth as u32, ty)
    }

    /// The internal calling convention: push the return tag, push the
    /// converted arguments left to right, jump to the (most derived) entry.
    /// At the return tag the callee has replaced tag and arguments with its
    /// return values; the virtual height is corrected accordingly.
    fn append_internal_call(&mut self, function: covenant_ast::FunctionId, args: &[Expr]) -> Result<()> {
        let return_tag = self.context.push_new_tag();
        let parameters = self.unit.parameter_types(function);
        assert_eq!(parameters.len(), args.len(), "arity was checked upstream");
        for (arg, &param_ty) in args.iter().zip(&parameters) {
            self.compile(arg)?;
            if let Some(from) = arg.ty(self.unit) {
                self.append_type_conversion(from, param_ty, false)?;
            }
        }
        let entry = self.context.virtual_entry_label(self.unit, function);
        self.context.append_jump_to(entry);
        self.context.append_tag(return_tag);

        let args_size: i32 = parameters.iter().map(|t| t.size_on_stack() as i32).sum();
        let ret_size: i32 =
            self.unit.return_types(function).iter().map(|t| t.size_on_stack() as i32).sum();
        self.context.adjust_stack_offset(ret_size - args_size - 1);
        Ok(())
    }

    /// Converts the value on top of the stack from one type to another.
    /// `cleanup` forces re-canonicalization even for same-width conversions,
    /// used before values leave the contract.
    pub fn append_type_conversion(&mut self, from: Type, to: Type, cleanup: bool) -> Result<()> {
        match (from, to) {
            (Type::Bool, Type::Bool) => {
                if cleanup {
                    self.context.append_op(Opcode::ISZERO);
                    self.context.append_op(Opcode::ISZERO);
                }
            }
            (Type::Bytes, Type::Bytes) => {}
            (Type::Uint(_) | Type::Address, Type::Uint(_) | Type::Address) => {
                let from_bits = integer_width(from);
                let to_bits = integer_width(to);
                if to_bits < from_bits || (cleanup && to_bits < 256) {
                    let mask = (U256::from(1u8) << to_bits as usize) - U256::from(1u8);
                    self.context.push_const(mask);
                    self.context.append_op(Opcode::AND);
                }
            }
            _ => assert_eq!(from, to, "conversion between incompatible types"),
        }
        Ok(())
    }

    /// The body of a public state variable's implicit getter. Entry stack is
    /// `[return_address]`; the value is fetched and control returns to the
    /// dispatch code.
    pub fn append_state_variable_accessor(&mut self, var: VarId) -> Result<()> {
        let slot = self.state_variable_slot(var);
        self.context.push_const(slot);
        self.context.append_op(Opcode::SLOAD);
        self.context.append_swap(1)?;
        self.context.append_op(Opcode::JUMP);
        Ok(())
    }

    /// Emits the explicit initializer of a state variable into the creation
    /// code.
    pub fn append_state_variable_initialization(&mut self, var: VarId) -> Result<()> {
        let slot = self.state_variable_slot(var);
        let variable = &self.unit.variables[var];
        let value =
            variable.value.as_ref().expect("initialization requested without an initializer");
        self.compile(value)?;
        if let Some(from) = value.ty(self.unit) {
            self.append_type_conversion(from, variable.ty, true)?;
        }
        self.context.push_const(slot);
        self.context.append_op(Opcode::SSTORE);
        Ok(())
    }

    fn state_variable_slot(&self, var: VarId) -> U256 {
        self.context.storage_slot_of(var).unwrap_or_else(|| {
            panic!("{} is not a state variable", self.unit.variables[var].name)
        })
    }
}

/// Width in bits of an integer-like value type.
fn integer_width(ty: Type) -> u16 {
    match ty {
        Type::Uint(bits) => bits,
        Type::Address => 160,
        Type::Bool => 8,
        Type::Bytes => unreachable!("bytes values have no integer width"),
    }
}
