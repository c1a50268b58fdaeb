//! Compiler driver
//!
//! Orchestrates the two emission passes of a contract compilation. The
//! runtime program (dispatch plus every reachable function) is emitted first
//! and assembled; the creation program then initializes state, runs the
//! constructor chain and returns the runtime program, which it carries as an
//! embedded subroutine. Each pass drains the context's worklist to a fixed
//! point, because entry tags requested during emission enqueue the referenced
//! declarations.

use crate::{
    context::{CompilerContext, Declaration, Tag},
    error::Result,
    expression::ExpressionCompiler,
    utils,
};
use alloy_primitives::U256;
use covenant_ast::{padded_size, ContractId, Expr, FunctionId, SourceLocation, SourceUnit, Type};
use evm_glue::opcodes::Opcode;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

/// Compiles one contract into its creation and runtime programs.
pub struct ContractCompiler<'a> {
    pub(crate) unit: &'a SourceUnit,
    /// The context currently being emitted into. Holds the runtime program
    /// until the swap in [`compile_contract`](Self::compile_contract), the
    /// creation program afterwards.
    pub(crate) context: CompilerContext,
    pub(crate) runtime_context: CompilerContext,
    creation_bytecode: Vec<u8>,
    runtime_bytecode: Vec<u8>,

    // Per-function visitor state.
    pub(crate) return_tag: Tag,
    pub(crate) break_tags: SmallVec<[Tag; 4]>,
    pub(crate) continue_tags: SmallVec<[Tag; 4]>,
    /// Stack slots that a `return` has to unwind beyond the function frame:
    /// the parameters and locals of every enclosing modifier.
    pub(crate) stack_cleanup_for_return: u32,
    pub(crate) current_function: Option<FunctionId>,
    pub(crate) modifier_depth: usize,
}

impl<'a> ContractCompiler<'a> {
    pub fn new(unit: &'a SourceUnit) -> Self {
        Self {
            unit,
            context: CompilerContext::new(),
            runtime_context: CompilerContext::new(),
            creation_bytecode: Vec::new(),
            runtime_bytecode: Vec::new(),
            return_tag: 0,
            break_tags: SmallVec::new(),
            continue_tags: SmallVec::new(),
            stack_cleanup_for_return: 0,
            current_function: None,
            modifier_depth: 0,
        }
    }

    /// Sole entry point: emits both programs of `contract`.
    /// `compiled_contracts` supplies the raw creation bytecode of dependency
    /// contracts for embedded deployment.
    pub fn compile_contract(
        &mut self,
        contract: ContractId,
        compiled_contracts: &BTreeMap<ContractId, Vec<u8>>,
    ) -> Result<()> {
        self.context = CompilerContext::new();
        self.runtime_context = CompilerContext::new();

        self.initialize_context(contract, compiled_contracts);
        self.append_function_selector(contract)?;
        self.drain_worklist()?;
        self.runtime_bytecode = self.context.assemble()?;

        // Swap the runtime context out and build the creation program on a
        // fresh one.
        std::mem::swap(&mut self.context, &mut self.runtime_context);
        self.initialize_context(contract, compiled_contracts);
        self.pack_into_contract_creator(contract)?;
        self.creation_bytecode = self.context.assemble()?;
        Ok(())
    }

    /// The creation program: bytecode executed once at deployment. Its return
    /// value becomes the deployed contract's code.
    pub fn assembled_bytecode(&self) -> &[u8] {
        &self.creation_bytecode
    }

    /// The runtime program: bytecode executed on every subsequent call.
    pub fn runtime_bytecode(&self) -> &[u8] {
        &self.runtime_bytecode
    }

    /// The creation-pass context (valid after
    /// [`compile_contract`](Self::compile_contract)).
    pub fn creation_context(&self) -> &CompilerContext {
        &self.context
    }

    /// The runtime-pass context (valid after
    /// [`compile_contract`](Self::compile_contract)).
    pub fn runtime_context(&self) -> &CompilerContext {
        &self.runtime_context
    }

    fn initialize_context(
        &mut self,
        contract: ContractId,
        compiled_contracts: &BTreeMap<ContractId, Vec<u8>>,
    ) {
        let unit = self.unit;
        self.context.set_compiled_contracts(compiled_contracts.clone());
        self.context
            .set_inheritance_hierarchy(unit.contracts[contract].linearized_bases.clone());
        self.register_state_variables(contract);
        self.context.reset_location(unit.contracts[contract].loc);
    }

    /// Assigns storage slots in base-to-derived order, each contract's
    /// variables in declaration order.
    fn register_state_variables(&mut self, contract: ContractId) {
        let unit = self.unit;
        for &base in unit.contracts[contract].linearized_bases.iter().rev() {
            for &var in &unit.contracts[base].state_variables {
                self.context.add_state_variable(var);
            }
        }
    }

    /// Emits state initialization, the constructor chain and the code that
    /// deploys the runtime program.
    fn pack_into_contract_creator(&mut self, contract: ContractId) -> Result<()> {
        let unit = self.unit;
        let bases = unit.contracts[contract].linearized_bases.clone();

        // Arguments for base constructors: walking most-derived first and
        // keeping the first specifier seen gives the nearest derived binding.
        let mut base_arguments: HashMap<ContractId, &'a [Expr]> = HashMap::new();
        for &base in &bases {
            for specifier in &unit.contracts[base].base_specifiers {
                base_arguments.entry(specifier.base).or_insert(specifier.args.as_slice());
            }
        }

        // Call constructors in base-to-derived order; the most derived
        // contract is handled separately below.
        for i in 1..bases.len() {
            let base = bases[bases.len() - i];
            self.initialize_state_variables(base)?;
            let Some(constructor) = unit.contracts[base].constructor else { continue };
            let params = &unit.functions[constructor].params;
            let args = base_arguments.get(&base).copied().unwrap_or(&[]);
            assert!(
                params.is_empty() || args.len() == params.len(),
                "no arguments provided for the constructor of base contract {}",
                unit.contracts[base].name
            );
            self.append_base_constructor_call(constructor, args)?;
        }
        self.initialize_state_variables(contract)?;
        if let Some(constructor) = unit.contracts[contract].constructor {
            self.append_constructor_call(constructor)?;
        }

        // Embed the runtime program, copy it to memory offset 0 and return
        // that range.
        let runtime = self.runtime_bytecode.clone();
        let subroutine = self.context.append_subroutine(runtime); // [size]
        self.context.append_dup(1)?; // [size, size]
        self.context.push_subroutine_offset(subroutine); // [size, size, code_offset]
        self.context.push_const(U256::ZERO);
        self.context.append_op(Opcode::CODECOPY); // [size]
        self.context.push_const(U256::ZERO);
        self.context.append_op(Opcode::RETURN);

        // The constructor bodies may reference helpers that are not emitted
        // yet; absolute jump tags force this second drain.
        self.drain_worklist()
    }

    /// Calls a base constructor with the arguments recorded at its nearest
    /// derived inheritance specifier.
    fn append_base_constructor_call(
        &mut self,
        constructor: FunctionId,
        args: &[Expr],
    ) -> Result<()> {
        let unit = self.unit;
        let loc = unit.functions[constructor].loc;
        self.with_location(loc, |this| {
            let return_tag = this.context.push_new_tag();
            let params = unit.functions[constructor].params.clone();
            for (arg, &param) in args.iter().zip(&params) {
                this.compile_expression(arg, Some(unit.variables[param].ty))?;
            }
            let entry = this.context.entry_label(Declaration::Function(constructor));
            this.context.append_jump_to(entry);
            this.context.append_tag(return_tag);
            // The callee consumed the return address and the arguments.
            let args_size = utils::size_on_stack(unit, &params) as i32;
            this.context.adjust_stack_offset(-args_size - 1);
            Ok(())
        })
    }

    /// Calls the most derived contract's constructor. Its arguments arrive
    /// ABI-encoded behind the creation code; they are copied to memory at the
    /// data start offset and unpacked from there.
    fn append_constructor_call(&mut self, constructor: FunctionId) -> Result<()> {
        let unit = self.unit;
        let loc = unit.functions[constructor].loc;
        self.with_location(loc, |this| {
            let return_tag = this.context.push_new_tag();
            let params = unit.functions[constructor].params.clone();
            let argument_size: u32 = params
                .iter()
                .map(|&p| padded_size(unit.variables[p].ty.unpadded_byte_size()))
                .sum();
            if argument_size > 0 {
                this.context.push_const(U256::from(argument_size));
                this.context.append_program_size();
                this.context.push_const(U256::from(utils::DATA_START_OFFSET));
                this.context.append_op(Opcode::CODECOPY);
                let param_types = unit.parameter_types(constructor);
                this.append_calldata_unpacker(&param_types, true)?;
            }
            let entry = this.context.entry_label(Declaration::Function(constructor));
            this.context.append_jump_to(entry);
            this.context.append_tag(return_tag);
            let args_size = utils::size_on_stack(unit, &params) as i32;
            this.context.adjust_stack_offset(-args_size - 1);
            Ok(())
        })
    }

    /// Emits the explicit initializer expressions of a contract's state
    /// variables. Slots without initializers keep the store's default zero.
    fn initialize_state_variables(&mut self, contract: ContractId) -> Result<()> {
        let unit = self.unit;
        for &var in &unit.contracts[contract].state_variables {
            if unit.variables[var].value.is_none() {
                continue;
            }
            self.with_location(unit.variables[var].loc, |this| {
                ExpressionCompiler::new(unit, &mut this.context)
                    .append_state_variable_initialization(var)
            })?;
        }
        Ok(())
    }

    /// Visits every declaration whose entry tag was requested but whose code
    /// is missing, until no new requests appear.
    fn drain_worklist(&mut self) -> Result<()> {
        loop {
            let pending = self.context.functions_without_code();
            if pending.is_empty() {
                return Ok(());
            }
            for declaration in pending {
                match declaration {
                    Declaration::Function(function) => self.visit_function(function)?,
                    Declaration::StateVariable(var) => self.visit_state_variable(var)?,
                }
            }
        }
    }

    /// Runs `f` with `loc` as the current source annotation, restoring the
    /// previous annotation on every exit path.
    pub(crate) fn with_location<R>(
        &mut self,
        loc: SourceLocation,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.context.push_location(loc);
        let result = f(self);
        self.context.pop_location();
        result
    }

    /// Compiles an expression, optionally converting the result to a target
    /// type.
    pub(crate) fn compile_expression(
        &mut self,
        expr: &Expr,
        target: Option<Type>,
    ) -> Result<()> {
        let unit = self.unit;
        let mut compiler = ExpressionCompiler::new(unit, &mut self.context);
        compiler.compile(expr)?;
        if let Some(to) = target {
            if let Some(from) = expr.ty(unit) {
                compiler.append_type_conversion(from, to, false)?;
            }
        }
        Ok(())
    }
}
