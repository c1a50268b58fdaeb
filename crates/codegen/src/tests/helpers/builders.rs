//! Test scaffolding: AST construction shorthand, a reference ABI encoder and
//! the revm execution harness.
//!
//! Deployment is exercised the way the machine defines it: the creation
//! program (with any constructor arguments appended behind it) is installed
//! as code and called; its return data is the runtime program and its storage
//! writes are the constructor effects. Subsequent calls run the returned
//! runtime bytes against that storage.

use crate::{CompiledContract, ContractCompiler};
use alloy_primitives::U256;
use covenant_ast::{
    selector, BinaryOp, Contract, ContractId, Expr, Function, FunctionId, InheritanceSpecifier,
    Modifier, ModifierId, ModifierInvocation, SourceLocation, SourceUnit, Stmt, StmtKind, Type,
    VarId, Variable, Visibility,
};
use evm_glue::{assembly::Asm, opcodes::Opcode};
use revm::{
    primitives::{
        address, AccountInfo, Address, Bytecode, ExecutionResult, Output, TransactTo,
    },
    Evm, InMemoryDB,
};
use std::collections::BTreeMap;

// ---- expression and statement shorthand ----

pub fn num(value: u64) -> Expr {
    Expr::Number(U256::from(value))
}

pub fn ident(var: VarId) -> Expr {
    Expr::Identifier(var)
}

pub fn assign(var: VarId, value: Expr) -> Expr {
    Expr::Assignment { var, value: Box::new(value) }
}

pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinaryOp::Add, lhs, rhs)
}

pub fn lt(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinaryOp::Lt, lhs, rhs)
}

pub fn eq(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinaryOp::Eq, lhs, rhs)
}

pub fn call(function: FunctionId, args: Vec<Expr>) -> Expr {
    Expr::Call { function, args }
}

pub fn block(statements: Vec<Stmt>) -> Stmt {
    Stmt::new(StmtKind::Block(statements))
}

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::new(StmtKind::Expression(expr))
}

pub fn ret(value: Expr) -> Stmt {
    Stmt::new(StmtKind::Return(Some(value)))
}

pub fn ret_empty() -> Stmt {
    Stmt::new(StmtKind::Return(None))
}

pub fn declare(var: VarId, value: Option<Expr>) -> Stmt {
    Stmt::new(StmtKind::VariableDeclaration { var, value })
}

pub fn if_stmt(condition: Expr, then_branch: Stmt, else_branch: Option<Stmt>) -> Stmt {
    Stmt::new(StmtKind::If {
        condition,
        then_branch: Box::new(then_branch),
        else_branch: else_branch.map(Box::new),
    })
}

pub fn while_stmt(condition: Expr, body: Stmt) -> Stmt {
    Stmt::new(StmtKind::While { condition, body: Box::new(body) })
}

pub fn for_stmt(init: Option<Stmt>, condition: Option<Expr>, step: Option<Stmt>, body: Stmt) -> Stmt {
    Stmt::new(StmtKind::For {
        init: init.map(Box::new),
        condition,
        step: step.map(Box::new),
        body: Box::new(body),
    })
}

pub fn brk() -> Stmt {
    Stmt::new(StmtKind::Break)
}

pub fn cont() -> Stmt {
    Stmt::new(StmtKind::Continue)
}

pub fn placeholder() -> Stmt {
    Stmt::new(StmtKind::Placeholder)
}

// ---- AST construction ----

/// Accumulates declarations into a [`SourceUnit`].
#[derive(Default)]
pub struct UnitBuilder {
    pub unit: SourceUnit,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(&mut self, name: &str, ty: Type) -> VarId {
        self.declare_var(name, ty, Visibility::Internal, None)
    }

    pub fn var_with_value(&mut self, name: &str, ty: Type, value: Expr) -> VarId {
        self.declare_var(name, ty, Visibility::Internal, Some(value))
    }

    pub fn public_var(&mut self, name: &str, ty: Type, value: Option<Expr>) -> VarId {
        self.declare_var(name, ty, Visibility::Public, value)
    }

    fn declare_var(
        &mut self,
        name: &str,
        ty: Type,
        visibility: Visibility,
        value: Option<Expr>,
    ) -> VarId {
        self.unit.variables.push(Variable {
            name: name.into(),
            ty,
            visibility,
            value,
            loc: SourceLocation::default(),
        })
    }

    pub fn function(&mut self, spec: FunctionSpec) -> FunctionId {
        self.unit.functions.push(Function {
            name: spec.name,
            visibility: spec.visibility,
            params: spec.params,
            returns: spec.returns,
            locals: spec.locals,
            modifiers: spec.modifiers,
            body: block(spec.body),
            loc: spec.loc,
        })
    }

    pub fn modifier(
        &mut self,
        name: &str,
        params: Vec<VarId>,
        locals: Vec<VarId>,
        body: Vec<Stmt>,
    ) -> ModifierId {
        self.unit.modifiers.push(Modifier {
            name: name.into(),
            params,
            locals,
            body: block(body),
            loc: SourceLocation::default(),
        })
    }

    /// Adds a contract; `spec.bases` lists the ancestors most-derived first,
    /// excluding the contract itself.
    pub fn contract(&mut self, spec: ContractSpec) -> ContractId {
        let id = self.unit.contracts.push(Contract {
            name: spec.name,
            linearized_bases: Vec::new(),
            base_specifiers: spec.base_specifiers,
            state_variables: spec.state_variables,
            functions: spec.functions,
            constructor: spec.constructor,
            fallback: spec.fallback,
            loc: SourceLocation::default(),
        });
        let mut linearized = vec![id];
        linearized.extend(spec.bases);
        self.unit.contracts[id].linearized_bases = linearized;
        id
    }
}

pub struct FunctionSpec {
    name: String,
    visibility: Visibility,
    params: Vec<VarId>,
    returns: Vec<VarId>,
    locals: Vec<VarId>,
    modifiers: Vec<ModifierInvocation>,
    body: Vec<Stmt>,
    loc: SourceLocation,
}

impl FunctionSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            params: Vec::new(),
            returns: Vec::new(),
            locals: Vec::new(),
            modifiers: Vec::new(),
            body: Vec::new(),
            loc: SourceLocation::default(),
        }
    }

    pub fn internal(mut self) -> Self {
        self.visibility = Visibility::Internal;
        self
    }

    pub fn params(mut self, params: Vec<VarId>) -> Self {
        self.params = params;
        self
    }

    pub fn returns(mut self, returns: Vec<VarId>) -> Self {
        self.returns = returns;
        self
    }

    pub fn locals(mut self, locals: Vec<VarId>) -> Self {
        self.locals = locals;
        self
    }

    pub fn modifiers(mut self, modifiers: Vec<ModifierInvocation>) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn body(mut self, body: Vec<Stmt>) -> Self {
        self.body = body;
        self
    }
}

pub struct ContractSpec {
    name: String,
    bases: Vec<ContractId>,
    base_specifiers: Vec<InheritanceSpecifier>,
    state_variables: Vec<VarId>,
    functions: Vec<FunctionId>,
    constructor: Option<FunctionId>,
    fallback: Option<FunctionId>,
}

impl ContractSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
            base_specifiers: Vec::new(),
            state_variables: Vec::new(),
            functions: Vec::new(),
            constructor: None,
            fallback: None,
        }
    }

    pub fn bases(mut self, bases: Vec<ContractId>) -> Self {
        self.bases = bases;
        self
    }

    pub fn base_specifier(mut self, base: ContractId, args: Vec<Expr>) -> Self {
        self.base_specifiers.push(InheritanceSpecifier { base, args });
        self
    }

    pub fn state_variables(mut self, vars: Vec<VarId>) -> Self {
        self.state_variables = vars;
        self
    }

    pub fn functions(mut self, functions: Vec<FunctionId>) -> Self {
        self.functions = functions;
        self
    }

    pub fn constructor(mut self, constructor: FunctionId) -> Self {
        self.constructor = Some(constructor);
        self
    }

    pub fn fallback(mut self, fallback: FunctionId) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

// ---- compilation ----

pub fn compile(unit: &SourceUnit, contract: ContractId) -> CompiledContract {
    crate::compile_contract(unit, contract, &BTreeMap::new()).expect("compilation failed")
}

/// Compiles and hands back the whole compiler for context inspection.
pub fn compiled<'a>(unit: &'a SourceUnit, contract: ContractId) -> ContractCompiler<'a> {
    let mut compiler = ContractCompiler::new(unit);
    compiler.compile_contract(contract, &BTreeMap::new()).expect("compilation failed");
    compiler
}

// ---- reference ABI encoder ----

/// An argument for the reference encoder: statically sized values occupy one
/// right-aligned word; byte strings put their length into the head area and
/// their padded data into the tail.
#[derive(Debug, Clone)]
pub enum AbiValue {
    Word(U256),
    Bytes(Vec<u8>),
}

pub fn word(value: u64) -> AbiValue {
    AbiValue::Word(U256::from(value))
}

pub fn encode_arguments(args: &[AbiValue]) -> Vec<u8> {
    let mut out = Vec::new();
    // head: one length word per dynamic argument, in argument order
    for arg in args {
        if let AbiValue::Bytes(bytes) = arg {
            out.extend(U256::from(bytes.len()).to_be_bytes::<32>());
        }
    }
    // data area: all values in argument order, padded to word boundaries
    for arg in args {
        match arg {
            AbiValue::Word(value) => out.extend(value.to_be_bytes::<32>()),
            AbiValue::Bytes(bytes) => {
                out.extend(bytes);
                let padding = bytes.len().div_ceil(32) * 32 - bytes.len();
                out.extend(std::iter::repeat(0u8).take(padding));
            }
        }
    }
    out
}

pub fn encode_call(signature: &str, args: &[AbiValue]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode_arguments(args));
    data
}

// ---- revm harness ----

pub fn contract_address() -> Address {
    address!("1000000000000000000000000000000000000000")
}

pub struct EvmBuilder {
    db: InMemoryDB,
    contract_address: Address,
    caller_address: Address,
    bytecode: Vec<u8>,
    calldata: Vec<u8>,
    storage: Vec<(U256, U256)>,
    gas_limit: u64,
}

impl EvmBuilder {
    pub fn new() -> Self {
        Self {
            db: InMemoryDB::default(),
            contract_address: contract_address(),
            caller_address: address!("9000000000000000000000000000000000000000"),
            bytecode: Vec::new(),
            calldata: Vec::new(),
            storage: Vec::new(),
            gas_limit: 10_000_000,
        }
    }

    pub fn with_bytecode(mut self, bytecode: Vec<u8>) -> Self {
        self.bytecode = bytecode;
        self
    }

    pub fn with_calldata(mut self, calldata: Vec<u8>) -> Self {
        self.calldata = calldata;
        self
    }

    pub fn with_storage(mut self, storage: Vec<(U256, U256)>) -> Self {
        self.storage = storage;
        self
    }

    pub fn build(mut self) -> Evm<'static, (), InMemoryDB> {
        self.db.insert_account_info(
            self.contract_address,
            AccountInfo {
                balance: U256::ZERO,
                nonce: 0,
                code_hash: revm::primitives::keccak256(&self.bytecode),
                code: Some(Bytecode::new_raw(self.bytecode.clone().into())),
            },
        );
        for (slot, value) in &self.storage {
            self.db
                .insert_account_storage(self.contract_address, *slot, *value)
                .expect("storage seed failed");
        }

        self.db.insert_account_info(
            self.caller_address,
            AccountInfo {
                balance: U256::from(1_000_000_000_000_000_000u64),
                nonce: 0,
                code_hash: revm::primitives::KECCAK_EMPTY,
                code: None,
            },
        );

        Evm::builder()
            .with_db(self.db)
            .modify_tx_env(|tx| {
                tx.caller = self.caller_address;
                tx.transact_to = TransactTo::Call(self.contract_address);
                tx.data = self.calldata.into();
                tx.gas_limit = self.gas_limit;
                tx.gas_price = U256::from(1);
                tx.value = U256::ZERO;
            })
            .build()
    }
}

pub fn call_output(result: ExecutionResult) -> Vec<u8> {
    match result {
        ExecutionResult::Success { output: Output::Call(bytes), .. } => bytes.to_vec(),
        other => panic!("expected successful call, got: {other:?}"),
    }
}

pub fn word_output(result: ExecutionResult) -> U256 {
    let bytes = call_output(result);
    assert!(bytes.len() >= 32, "return data too small: {} bytes", bytes.len());
    U256::from_be_bytes::<32>(bytes[0..32].try_into().expect("slice is 32 bytes"))
}

/// Outcome of running a creation program: the returned runtime code and the
/// storage the constructor chain wrote.
pub struct Deployment {
    pub runtime: Vec<u8>,
    pub storage: Vec<(U256, U256)>,
}

pub fn deploy(creation: &[u8], constructor_args: &[u8]) -> Deployment {
    // Constructor arguments travel appended behind the creation code.
    let mut code = creation.to_vec();
    code.extend_from_slice(constructor_args);

    let mut evm = EvmBuilder::new().with_bytecode(code).build();
    let result = evm.transact_commit().expect("deployment failed to commit");
    let runtime = call_output(result);
    let storage = evm
        .db_mut()
        .accounts
        .get(&contract_address())
        .map(|account| {
            let mut slots: Vec<(U256, U256)> =
                account.storage.iter().map(|(slot, value)| (*slot, *value)).collect();
            slots.sort();
            slots
        })
        .unwrap_or_default();
    Deployment { runtime, storage }
}

pub fn storage_slot(deployment: &Deployment, slot: u64) -> U256 {
    deployment
        .storage
        .iter()
        .find(|(key, _)| *key == U256::from(slot))
        .map(|(_, value)| *value)
        .unwrap_or(U256::ZERO)
}

/// Deploys `compiled` and runs one call against the deployed code, asserting
/// on the way that the creation program returned exactly the runtime program.
pub fn deploy_and_call(
    compiled: &CompiledContract,
    constructor_args: &[AbiValue],
    calldata: Vec<u8>,
) -> ExecutionResult {
    let deployment = deploy(&compiled.creation, &encode_arguments(constructor_args));
    assert_eq!(
        deployment.runtime, compiled.runtime,
        "deployed code differs from the runtime program"
    );
    let mut evm = EvmBuilder::new()
        .with_bytecode(deployment.runtime)
        .with_storage(deployment.storage)
        .with_calldata(calldata)
        .build();
    evm.transact_commit().expect("call failed to commit")
}

pub fn call_function(
    compiled: &CompiledContract,
    constructor_args: &[AbiValue],
    signature: &str,
    args: &[AbiValue],
) -> ExecutionResult {
    deploy_and_call(compiled, constructor_args, encode_call(signature, args))
}

// ---- assembly inspection ----

/// Opcode mnemonics of an item stream, payloads stripped.
pub fn opcode_names(items: &[Asm]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Asm::Op(op) => {
                let name = format!("{op:?}");
                Some(name.split('(').next().expect("split yields at least one part").to_string())
            }
            _ => None,
        })
        .collect()
}

pub fn contains_sequence(haystack: &[String], needle: &[&str]) -> bool {
    haystack.windows(needle.len()).any(|window| window.iter().zip(needle).all(|(a, b)| a == b))
}

/// Net stack effect of an emitted item stream, independent of the compiler's
/// own height bookkeeping.
pub fn net_stack_effect(items: &[Asm]) -> i32 {
    items
        .iter()
        .map(|item| match item {
            Asm::Mark(_) | Asm::Data(_) => 0,
            Asm::Ref(mark_ref) => {
                if mark_ref.is_pushed {
                    1
                } else {
                    0
                }
            }
            Asm::Op(op) => opcode_stack_effect(op),
        })
        .sum()
}

fn opcode_stack_effect(op: &Opcode) -> i32 {
    use Opcode::*;
    let name = format!("{op:?}");
    if name.starts_with("PUSH") || name.starts_with("DUP") {
        return 1;
    }
    if name.starts_with("SWAP") {
        return 0;
    }
    match op {
        STOP | JUMPDEST | ISZERO | MLOAD | SLOAD | CALLDATALOAD => 0,
        POP | JUMP | ADD | SUB | MUL | DIV | EQ | LT | GT | AND => -1,
        MSTORE | SSTORE | JUMPI | RETURN | CREATE => -2,
        CODECOPY => -3,
        other => panic!("unexpected opcode in emitted stream: {other:?}"),
    }
}
