//! Per-pass compilation state
//!
//! A [`CompilerContext`] is created once per emission pass: one for the
//! runtime program and one for the creation program. It owns the assembly
//! item stream being appended to, tracks the virtual stack height of the
//! emitted code, allocates jump tags, and keeps the entry-tag worklist that
//! drives the fixed-point function emission of the driver.
//!
//! Jump targets are evm-glue marks; a [`Tag`] here is the mark id. Final
//! bytes come out of [`assemble`](CompilerContext::assemble), which also
//! places deferred subroutine bodies (embedded bytecode such as the runtime
//! program) behind the emitted code.

use crate::error::{CodegenError, Result};
use alloy_primitives::U256;
use covenant_ast::{ContractId, FunctionId, SourceLocation, SourceUnit, VarId};
use evm_glue::{
    assembler::assemble_minimized,
    assembly::{Asm, MarkRef, RefType},
    opcodes::Opcode,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// An opaque jump-target identifier, resolved to a byte offset at
/// finalization.
pub type Tag = usize;

/// A declaration that owns an entry point in the generated code: a function
/// (including constructors and the fallback) or the implicit accessor of a
/// public state variable.
///
/// `Ord` matters: the worklist drains in declaration order so that repeated
/// compilations of the same contract produce byte-identical output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Declaration {
    Function(FunctionId),
    StateVariable(VarId),
}

/// A subroutine embedded into the program as raw bytes, bracketed by two
/// marks so emitted code can reference its offset and size.
struct Subroutine {
    start: Tag,
    end: Tag,
    bytes: Vec<u8>,
}

pub struct CompilerContext {
    /// Emitted assembly items, in emission order.
    items: Vec<Asm>,
    /// Source annotation of each item, parallel to `items`.
    locations: Vec<SourceLocation>,
    /// Scoped "current source node" stack; the top annotates emitted items.
    location_stack: Vec<SourceLocation>,

    /// Next unallocated mark id.
    next_tag: Tag,
    /// Net stack effect of everything emitted so far.
    stack_height: i32,

    /// Linearized base contracts of the contract being compiled, the contract
    /// itself first, then bases most-derived first.
    inheritance_hierarchy: Vec<ContractId>,

    /// Entry tags handed out so far. Requesting a tag implicitly enqueues the
    /// declaration for emission.
    entry_tags: BTreeMap<Declaration, Tag>,
    /// Declarations whose code has been emitted into this context.
    emitted: BTreeSet<Declaration>,

    /// Base stack offsets of the local variables of the function currently
    /// being emitted.
    local_variables: HashMap<VarId, i32>,
    /// Storage slots of registered state variables.
    state_variables: HashMap<VarId, U256>,
    next_storage_slot: u64,

    /// Already-compiled dependency contracts, for embedded deployment.
    compiled_contracts: BTreeMap<ContractId, Vec<u8>>,

    /// Deferred subroutine bodies, placed behind the code at finalization.
    subroutines: Vec<Subroutine>,
    /// Mark placed at the very end of the assembled program; references to it
    /// resolve to the total program size.
    program_end: Tag,
}

impl CompilerContext {
    pub fn new() -> Self {
        let mut context = Self {
            items: Vec::new(),
            locations: Vec::new(),
            location_stack: Vec::new(),
            next_tag: 0,
            stack_height: 0,
            inheritance_hierarchy: Vec::new(),
            entry_tags: BTreeMap::new(),
            emitted: BTreeSet::new(),
            local_variables: HashMap::new(),
            state_variables: HashMap::new(),
            next_storage_slot: 0,
            compiled_contracts: BTreeMap::new(),
            subroutines: Vec::new(),
            program_end: 0,
        };
        context.program_end = context.new_tag();
        context
    }

    // ---- tags and jumps ----

    pub fn new_tag(&mut self) -> Tag {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Defines `tag` at the current position. Jump targets need a JUMPDEST.
    pub fn append_tag(&mut self, tag: Tag) {
        self.append_item(Asm::Mark(tag), 0);
        self.append_item(Asm::Op(Opcode::JUMPDEST), 0);
    }

    /// Allocates a tag and pushes its (late-bound) byte offset.
    pub fn push_new_tag(&mut self) -> Tag {
        let tag = self.new_tag();
        self.push_tag(tag);
        tag
    }

    /// Pushes the byte offset of `tag`.
    pub fn push_tag(&mut self, tag: Tag) {
        self.append_item(
            Asm::Ref(MarkRef { ref_type: RefType::Direct(tag), is_pushed: true, set_size: None }),
            1,
        );
    }

    pub fn append_jump_to(&mut self, tag: Tag) {
        self.push_tag(tag);
        self.append_op(Opcode::JUMP);
    }

    /// Unconditional jump to a fresh tag; the caller defines it later.
    pub fn append_jump_to_new(&mut self) -> Tag {
        let tag = self.new_tag();
        self.append_jump_to(tag);
        tag
    }

    /// Conditional jump to a fresh tag; the caller defines it later.
    pub fn append_conditional_jump(&mut self) -> Tag {
        let tag = self.new_tag();
        self.append_conditional_jump_to(tag);
        tag
    }

    pub fn append_conditional_jump_to(&mut self, tag: Tag) {
        self.push_tag(tag);
        self.append_op(Opcode::JUMPI);
    }

    // ---- plain emission ----

    pub fn append_op(&mut self, op: Opcode) {
        let delta = stack_delta(&op);
        self.append_item(Asm::Op(op), delta);
    }

    /// Push a constant using the smallest PUSH opcode (PUSH0/PUSH1-PUSH32)
    pub fn push_const(&mut self, value: U256) {
        if value.is_zero() {
            self.append_item(Asm::Op(Opcode::PUSH0), 1);
            return;
        }

        let trimmed = value.to_be_bytes_trimmed_vec();

        macro_rules! push_n {
            ($n:expr, $opcode:ident) => {{
                let mut arr = [0u8; $n];
                arr.copy_from_slice(&trimmed[..]);
                self.append_item(Asm::Op(Opcode::$opcode(arr)), 1);
            }};
        }

        match trimmed.len() {
            1 => self.append_item(Asm::Op(Opcode::PUSH1([trimmed[0]])), 1),
            2 => push_n!(2, PUSH2),
            3 => push_n!(3, PUSH3),
            4 => push_n!(4, PUSH4),
            5 => push_n!(5, PUSH5),
            6 => push_n!(6, PUSH6),
            7 => push_n!(7, PUSH7),
            8 => push_n!(8, PUSH8),
            9..=32 => {
                self.append_item(Asm::Op(Opcode::PUSH32(value.to_be_bytes())), 1);
            }
            _ => unreachable!("U256 is max 32 bytes by definition"),
        }
    }

    /// DUP of the `depth`-th stack slot (1-based).
    pub fn append_dup(&mut self, depth: u32) -> Result<()> {
        self.append_item(Asm::Op(dup_opcode(depth)?), 1);
        Ok(())
    }

    /// SWAP of the top slot with the slot `depth` positions below it.
    pub fn append_swap(&mut self, depth: u32) -> Result<()> {
        self.append_item(Asm::Op(swap_opcode(depth)?), 0);
        Ok(())
    }

    fn append_item(&mut self, item: Asm, stack_delta: i32) {
        let loc = self.current_location();
        self.items.push(item);
        self.locations.push(loc);
        self.stack_height += stack_delta;
    }

    // ---- virtual stack height ----

    pub fn stack_height(&self) -> i32 {
        self.stack_height
    }

    /// Manual correction for stack effects that happen outside the emitted
    /// stream: caller-pushed arguments, frames unwound by a callee, or POPs
    /// that run at most once at runtime but must not disturb the height
    /// tracking of the surrounding code.
    pub fn adjust_stack_offset(&mut self, delta: i32) {
        self.stack_height += delta;
    }

    // ---- entry tags and the worklist ----

    /// Entry tag of a declaration, allocated on first request. Requesting a
    /// tag for a declaration without emitted code enqueues it for the
    /// driver's worklist drain.
    pub fn entry_label(&mut self, declaration: Declaration) -> Tag {
        if let Some(&tag) = self.entry_tags.get(&declaration) {
            return tag;
        }
        let tag = self.new_tag();
        self.entry_tags.insert(declaration, tag);
        tag
    }

    /// Entry tag of the most derived override of `function` in the current
    /// inheritance hierarchy.
    pub fn virtual_entry_label(&mut self, unit: &SourceUnit, function: FunctionId) -> Tag {
        let name = &unit.functions[function].name;
        let parameters = unit.parameter_types(function);
        let mut resolved = function;
        'search: for &contract in &self.inheritance_hierarchy {
            for &candidate in &unit.contracts[contract].functions {
                if unit.functions[candidate].name == *name
                    && unit.parameter_types(candidate) == parameters
                {
                    resolved = candidate;
                    break 'search;
                }
            }
        }
        self.entry_label(Declaration::Function(resolved))
    }

    /// Declarations whose entry tag was requested but whose code has not been
    /// emitted yet, in deterministic order.
    pub fn functions_without_code(&self) -> Vec<Declaration> {
        self.entry_tags.keys().filter(|d| !self.emitted.contains(d)).copied().collect()
    }

    /// Begins the code of `declaration`: marks it emitted and defines its
    /// entry tag at the current position.
    pub fn start_function(&mut self, declaration: Declaration) {
        self.emitted.insert(declaration);
        let tag = self.entry_label(declaration);
        self.append_tag(tag);
    }

    // ---- local variables ----

    /// Registers a variable whose stack slots end `offset_to_current` slots
    /// below the current virtual height.
    pub fn add_variable(&mut self, var: VarId, offset_to_current: u32) {
        self.local_variables.insert(var, self.stack_height - offset_to_current as i32);
    }

    /// Registers a variable at the current height and zero-fills its slots.
    pub fn add_and_initialize_variable(&mut self, unit: &SourceUnit, var: VarId) {
        self.add_variable(var, 0);
        for _ in 0..unit.variables[var].ty.size_on_stack() {
            self.push_const(U256::ZERO);
        }
    }

    /// Height of the stack just below the variable's slots.
    pub fn base_stack_offset_of(&self, var: VarId) -> i32 {
        *self
            .local_variables
            .get(&var)
            .expect("variable was not registered in the current function")
    }

    // ---- state variables ----

    pub fn add_state_variable(&mut self, var: VarId) {
        if self.state_variables.contains_key(&var) {
            return;
        }
        self.state_variables.insert(var, U256::from(self.next_storage_slot));
        self.next_storage_slot += 1;
    }

    pub fn storage_slot_of(&self, var: VarId) -> Option<U256> {
        self.state_variables.get(&var).copied()
    }

    // ---- contract-level setup ----

    pub fn set_inheritance_hierarchy(&mut self, hierarchy: Vec<ContractId>) {
        self.inheritance_hierarchy = hierarchy;
    }

    pub fn inheritance_hierarchy(&self) -> &[ContractId] {
        &self.inheritance_hierarchy
    }

    pub fn set_compiled_contracts(&mut self, contracts: BTreeMap<ContractId, Vec<u8>>) {
        self.compiled_contracts = contracts;
    }

    pub fn compiled_contract(&self, contract: ContractId) -> Option<&[u8]> {
        self.compiled_contracts.get(&contract).map(Vec::as_slice)
    }

    // ---- source locations ----

    pub fn push_location(&mut self, loc: SourceLocation) {
        self.location_stack.push(loc);
    }

    pub fn pop_location(&mut self) {
        self.location_stack.pop();
    }

    /// Clears the location scope down to a single base annotation (the
    /// contract definition being compiled).
    pub fn reset_location(&mut self, loc: SourceLocation) {
        self.location_stack.clear();
        self.location_stack.push(loc);
    }

    pub fn current_location(&self) -> SourceLocation {
        self.location_stack.last().copied().unwrap_or_default()
    }

    // ---- subroutines and finalization ----

    /// Registers `bytes` as a subroutine placed behind the code at
    /// finalization and pushes its size. The returned handle can be fed to
    /// [`push_subroutine_offset`](Self::push_subroutine_offset).
    pub fn append_subroutine(&mut self, bytes: Vec<u8>) -> Tag {
        let start = self.new_tag();
        let end = self.new_tag();
        self.subroutines.push(Subroutine { start, end, bytes });
        self.append_item(
            Asm::Ref(MarkRef {
                ref_type: RefType::Delta(end, start),
                is_pushed: true,
                set_size: None,
            }),
            1,
        );
        start
    }

    /// Pushes the byte offset of a subroutine registered earlier.
    pub fn push_subroutine_offset(&mut self, subroutine: Tag) {
        self.push_tag(subroutine);
    }

    /// Pushes the total size of the assembled program. Constructor arguments
    /// are appended to the creation code, so this is where they start.
    pub fn append_program_size(&mut self) {
        self.push_tag(self.program_end);
    }

    /// Resolves all marks and produces the final bytes. Subroutine bodies go
    /// behind the emitted code, then the program-end mark.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        let mut items = self.items.clone();
        for sub in &self.subroutines {
            items.push(Asm::Mark(sub.start));
            items.push(Asm::Data(sub.bytes.clone()));
            items.push(Asm::Mark(sub.end));
        }
        items.push(Asm::Mark(self.program_end));
        let (_, bytecode) = assemble_minimized(&items, true)
            .map_err(|e| CodegenError::Assembly { message: format!("{e:?}") })?;
        Ok(bytecode)
    }

    /// The emitted items, without the deferred finalization-only items.
    pub fn items(&self) -> &[Asm] {
        &self.items
    }

    /// Source annotation of each emitted item, parallel to
    /// [`items`](Self::items).
    pub fn item_locations(&self) -> &[SourceLocation] {
        &self.locations
    }
}

impl Default for CompilerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensures that the stack height is the same at certain places in the code.
/// A mismatch is a compiler bug, not an input error, and aborts immediately.
pub struct StackHeightChecker {
    expected: i32,
}

impl StackHeightChecker {
    pub fn new(context: &CompilerContext) -> Self {
        Self { expected: context.stack_height() }
    }

    pub fn check(&self, context: &CompilerContext) {
        assert_eq!(
            context.stack_height(),
            self.expected,
            "stack height mismatch at statement boundary"
        );
    }
}

fn dup_opcode(depth: u32) -> Result<Opcode> {
    use Opcode::*;
    Ok(match depth {
        1 => DUP1,
        2 => DUP2,
        3 => DUP3,
        4 => DUP4,
        5 => DUP5,
        6 => DUP6,
        7 => DUP7,
        8 => DUP8,
        9 => DUP9,
        10 => DUP10,
        11 => DUP11,
        12 => DUP12,
        13 => DUP13,
        14 => DUP14,
        15 => DUP15,
        16 => DUP16,
        _ => return Err(CodegenError::StackTooDeep { depth }),
    })
}

fn swap_opcode(depth: u32) -> Result<Opcode> {
    use Opcode::*;
    Ok(match depth {
        1 => SWAP1,
        2 => SWAP2,
        3 => SWAP3,
        4 => SWAP4,
        5 => SWAP5,
        6 => SWAP6,
        7 => SWAP7,
        8 => SWAP8,
        9 => SWAP9,
        10 => SWAP10,
        11 => SWAP11,
        12 => SWAP12,
        13 => SWAP13,
        14 => SWAP14,
        15 => SWAP15,
        16 => SWAP16,
        _ => return Err(CodegenError::StackTooDeep { depth }),
    })
}

/// Net stack effect of the opcodes this crate emits directly. PUSH, DUP and
/// SWAP go through their own emission helpers.
fn stack_delta(op: &Opcode) -> i32 {
    use Opcode::*;
    match op {
        STOP | JUMPDEST => 0,
        ISZERO | MLOAD | SLOAD | CALLDATALOAD => 0,
        POP | JUMP => -1,
        ADD | SUB | MUL | DIV | EQ | LT | GT | AND => -1,
        MSTORE | SSTORE | JUMPI | RETURN | CREATE => -2,
        CODECOPY => -3,
        _ => unreachable!("no stack delta recorded for {op:?}"),
    }
}
