#![allow(dead_code)]

//! Shared test harness: a function builder that also derives consistent
//! interpreter facts by forward simulation.
//!
//! The simulation is deliberately small. It tracks stack depth exactly
//! (the analysis asserts on it), propagates literal values and array
//! shapes far enough to exercise the append-chain rewrites, and lets each
//! instruction override the derived raise flag, result type, and may-read
//! set where a test needs something specific.

use deadwood::bytecode::{
    ArrayKey, ArrayLit, Block, BlockId, Function, Instr, Local, LocalId, Opcode, Value, NO_LOCAL,
};
use deadwood::dce::LocalSet;
use deadwood::facts::{
    AbstractTy, ArrayKind, ArrayShape, BlockFacts, Caps, FunctionFacts, StepFacts,
};

/// One instruction plus per-test overrides.
pub struct InstrSpec {
    op: Opcode,
    pei: Option<bool>,
    result_ty: Option<AbstractTy>,
    reads: Vec<LocalId>,
}

/// A block under construction.
#[derive(Default)]
pub struct BlockSpec {
    instrs: Vec<InstrSpec>,
    succs: Vec<BlockId>,
    throw_succs: Vec<BlockId>,
    entry_stack: Vec<AbstractTy>,
    unreachable: bool,
}

impl BlockSpec {
    /// Appends an instruction with default facts.
    pub fn i(&mut self, op: Opcode) -> &mut Self {
        self.instrs.push(InstrSpec {
            op,
            pei: None,
            result_ty: None,
            reads: Vec::new(),
        });
        self
    }

    /// Overrides the raise flag of the last instruction.
    pub fn pei(&mut self, pei: bool) -> &mut Self {
        self.instrs.last_mut().expect("no instruction yet").pei = Some(pei);
        self
    }

    /// Overrides the result type of the last instruction.
    pub fn ty(&mut self, ty: AbstractTy) -> &mut Self {
        self.instrs.last_mut().expect("no instruction yet").result_ty = Some(ty);
        self
    }

    /// Adds to the may-read set of the last instruction.
    pub fn reads(&mut self, locals: &[LocalId]) -> &mut Self {
        self.instrs
            .last_mut()
            .expect("no instruction yet")
            .reads
            .extend_from_slice(locals);
        self
    }

    /// Sets the normal successors.
    pub fn succs(&mut self, succs: &[BlockId]) -> &mut Self {
        self.succs = succs.to_vec();
        self
    }

    /// Sets the throw successors.
    pub fn throws(&mut self, succs: &[BlockId]) -> &mut Self {
        self.throw_succs = succs.to_vec();
        self
    }

    /// Sets the types on the stack at block entry (bottom first).
    pub fn entry_stack(&mut self, tys: &[AbstractTy]) -> &mut Self {
        self.entry_stack = tys.to_vec();
        self
    }

    /// Marks the block as never reached by the interpreter.
    pub fn unreachable(&mut self) -> &mut Self {
        self.unreachable = true;
        self
    }
}

/// Builds a [`Function`] together with matching [`FunctionFacts`].
pub struct FnBuilder {
    blocks: Vec<BlockSpec>,
    local_tys: Vec<AbstractTy>,
    equiv_locals: Vec<LocalId>,
    this_local: Option<LocalId>,
    num_params: u32,
    is_closure_body: bool,
    is_reified: bool,
    volatile_locals: Vec<LocalId>,
}

impl FnBuilder {
    /// A builder for a function with `num_locals` plain-scalar locals.
    pub fn new(num_locals: usize) -> Self {
        Self {
            blocks: Vec::new(),
            local_tys: vec![AbstractTy::scalar(); num_locals],
            equiv_locals: Vec::new(),
            this_local: None,
            num_params: 0,
            is_closure_body: false,
            is_reified: false,
            volatile_locals: Vec::new(),
        }
    }

    /// Overrides one local's type (applies at every program point).
    pub fn local_ty(mut self, id: LocalId, ty: AbstractTy) -> Self {
        self.local_tys[id as usize] = ty;
        self
    }

    /// Installs a local-equivalence circular chain over the given locals.
    pub fn equiv(mut self, class: &[LocalId]) -> Self {
        if self.equiv_locals.is_empty() {
            self.equiv_locals = vec![NO_LOCAL; self.local_tys.len()];
        }
        for (i, &l) in class.iter().enumerate() {
            self.equiv_locals[l as usize] = class[(i + 1) % class.len()];
        }
        self
    }

    /// Sets the parameter count.
    pub fn params(mut self, n: u32) -> Self {
        self.num_params = n;
        self
    }

    /// Marks the function as a closure body.
    pub fn closure_body(mut self) -> Self {
        self.is_closure_body = true;
        self
    }

    /// Marks the function as reified-generic.
    pub fn reified(mut self) -> Self {
        self.is_reified = true;
        self
    }

    /// Marks a local as observable through dynamic access.
    pub fn volatile(mut self, id: LocalId) -> Self {
        self.volatile_locals.push(id);
        self
    }

    /// Adds a block.
    pub fn block(mut self, f: impl FnOnce(&mut BlockSpec)) -> Self {
        let mut spec = BlockSpec::default();
        f(&mut spec);
        self.blocks.push(spec);
        self
    }

    /// Builds the function and simulates its facts.
    pub fn build(self) -> (Function, FunctionFacts) {
        let mut locals: Vec<Local> = (0..self.local_tys.len())
            .map(|i| Local::named(&format!("l{i}")))
            .collect();
        for &v in &self.volatile_locals {
            locals[v as usize].volatile = true;
        }

        let mut func = Function {
            blocks: Vec::new(),
            locals,
            num_params: self.num_params,
            is_closure_body: self.is_closure_body,
            is_reified: self.is_reified,
        };
        let mut facts = FunctionFacts::default();

        for spec in &self.blocks {
            let block = Block {
                instrs: spec
                    .instrs
                    .iter()
                    .map(|s| Instr::new(s.op.clone()))
                    .collect(),
                succs: spec.succs.clone(),
                throw_succs: spec.throw_succs.clone(),
            };
            func.blocks.push(block);

            if spec.unreachable {
                facts.blocks.push(None);
                continue;
            }

            let mut stack = spec.entry_stack.clone();
            let mut steps = Vec::with_capacity(spec.instrs.len());
            for s in &spec.instrs {
                let step = self.simulate(s, &mut stack);
                steps.push(step);
            }
            facts.blocks.push(Some(BlockFacts {
                steps,
                exit_depth: stack.len() as u32,
            }));
        }

        (func, facts)
    }

    /// Simulates one instruction: records the before state, applies the
    /// stack effect, and fills in derived or overridden flags.
    fn simulate(&self, spec: &InstrSpec, stack: &mut Vec<AbstractTy>) -> StepFacts {
        let stack_before = stack.clone();
        let op = &spec.op;

        let was_pei = spec.pei.unwrap_or_else(|| self.default_pei(op));
        let mut may_read = LocalSet::new();
        for &l in &spec.reads {
            may_read.insert(l);
        }
        if let Opcode::PathBaseLocal(l) = op {
            may_read.insert(*l);
        }

        // Apply the stack effect.
        match op {
            Opcode::GetLocalUnder(l) => {
                // Inserts beneath the current top.
                let top = stack.pop().expect("simulated stack underflow");
                stack.push(self.local_ty_at(*l));
                stack.push(top);
            }
            Opcode::Dup => {
                let top = stack.last().expect("simulated stack underflow").clone();
                stack.push(top);
            }
            _ => {
                let popped: Vec<AbstractTy> = (0..op.pops())
                    .map(|_| stack.pop().expect("simulated stack underflow"))
                    .collect();
                for _ in 0..op.pushes() {
                    stack.push(
                        spec.result_ty
                            .clone()
                            .unwrap_or_else(|| self.result_ty(op, &popped)),
                    );
                }
            }
        }

        StepFacts {
            stack_before,
            locals_before: self.local_tys.clone(),
            after_top: stack.last().cloned(),
            was_pei,
            may_read_locals: may_read,
            equiv_locals: self.equiv_locals.clone(),
            this_local: self.this_local,
        }
    }

    fn local_ty_at(&self, l: LocalId) -> AbstractTy {
        self.local_tys
            .get(l as usize)
            .cloned()
            .unwrap_or_else(AbstractTy::unknown)
    }

    fn default_pei(&self, op: &Opcode) -> bool {
        match op {
            Opcode::Call(_)
            | Opcode::Print
            | Opcode::GetGlobal
            | Opcode::SetGlobal
            | Opcode::CheckThis
            | Opcode::Throw
            | Opcode::Fatal
            | Opcode::IterInit(_)
            | Opcode::IterNext(_)
            | Opcode::MemoSet
            | Opcode::PathQuery { .. }
            | Opcode::PathSet { .. }
            | Opcode::PathUnset { .. }
            | Opcode::PathDim(_)
            | Opcode::SetOpLocal(..) => true,
            Opcode::GetLocal(l) | Opcode::IncDecLocal(l, _) => {
                self.local_ty_at(*l).read_observable()
            }
            _ => false,
        }
    }

    /// Derived result type: literals carry their value, array appends
    /// track shape and (when possible) the whole literal, everything
    /// side-effectful is unknown.
    fn result_ty(&self, op: &Opcode, popped: &[AbstractTy]) -> AbstractTy {
        match op {
            Opcode::Int(i) => lit_ty(Value::Int(*i)),
            Opcode::Dbl(d) => lit_ty(Value::Dbl(*d)),
            Opcode::Str(s) => {
                let mut ty = lit_ty(Value::Str(s.clone()));
                ty.caps = Caps::STR;
                ty
            }
            Opcode::True => lit_ty(Value::Bool(true)),
            Opcode::False => lit_ty(Value::Bool(false)),
            Opcode::Null => lit_ty(Value::Null),
            Opcode::NewDict => array_ty(ArrayLit::default()),
            Opcode::LitArr(a) => array_ty(a.clone()),
            Opcode::AddElem => {
                // popped = [value, key, array].
                let key = match popped[1].literal.clone() {
                    Some(Value::Int(i)) => Some(ArrayKey::Int(i)),
                    Some(Value::Str(s)) => Some(ArrayKey::Str(s)),
                    _ => None,
                };
                let base_keys = match (&popped[2].literal, &popped[2].shape) {
                    (Some(Value::Arr(a)), _) => {
                        Some(a.entries().iter().map(|(k, _)| k.clone()).collect())
                    }
                    (_, Some(shape)) => keys_from_shape(shape),
                    _ => None,
                };
                match (key, base_keys) {
                    (Some(key), Some(mut keys)) => {
                        // A duplicate key replaces its element; the size
                        // stays, which is what aborts the chain rewrite.
                        if !keys.contains(&key) {
                            keys.push(key.clone());
                        }
                        let literal = match (&popped[2].literal, &popped[0].literal) {
                            (Some(Value::Arr(arr)), Some(v)) => {
                                let mut entries = arr.entries().to_vec();
                                if let Some(slot) =
                                    entries.iter_mut().find(|(k, _)| *k == key)
                                {
                                    slot.1 = v.clone();
                                } else {
                                    entries.push((key, v.clone()));
                                }
                                Some(Value::Arr(ArrayLit::new(entries)))
                            }
                            _ => None,
                        };
                        AbstractTy {
                            caps: Caps::NONSCALAR,
                            shape: Some(shape_from_keys(&keys)),
                            literal,
                        }
                    }
                    _ => AbstractTy::with_caps(Caps::NONSCALAR),
                }
            }
            Opcode::GetLocal(l) | Opcode::GetLocalQuiet(l) | Opcode::MoveLocal(l) => {
                self.local_ty_at(*l)
            }
            Opcode::SetLocal(_) | Opcode::MemoSet => popped
                .first()
                .cloned()
                .unwrap_or_else(AbstractTy::unknown),
            Opcode::Binary(_) | Opcode::Unary(_) | Opcode::Cast(_) | Opcode::ConcatN(_) => {
                AbstractTy::scalar()
            }
            Opcode::IsTypeC(_) | Opcode::IsTypeLocal(..) | Opcode::IncDecLocal(..) => {
                AbstractTy::scalar()
            }
            Opcode::NewStruct(_) | Opcode::NewVec(_) => AbstractTy::with_caps(Caps::NONSCALAR),
            _ => AbstractTy::unknown(),
        }
    }
}

fn lit_ty(v: Value) -> AbstractTy {
    AbstractTy {
        caps: Caps::empty(),
        literal: Some(v),
        shape: None,
    }
}

/// Shape (and kind) derived from a literal array's keys.
fn shape_of(lit: &ArrayLit) -> ArrayShape {
    let keys: Vec<ArrayKey> = lit.entries().iter().map(|(k, _)| k.clone()).collect();
    shape_from_keys(&keys)
}

fn shape_from_keys(keys: &[ArrayKey]) -> ArrayShape {
    let packed = keys
        .iter()
        .enumerate()
        .all(|(i, k)| matches!(k, ArrayKey::Int(n) if *n == i as i64));
    let kind = if packed {
        ArrayKind::Packed
    } else if keys.iter().all(|k| matches!(k, ArrayKey::Str(_))) {
        ArrayKind::Struct(
            keys.iter()
                .map(|k| match k {
                    ArrayKey::Str(s) => s.clone(),
                    ArrayKey::Int(_) => unreachable!("checked all-string"),
                })
                .collect(),
        )
    } else {
        ArrayKind::Mixed
    };
    ArrayShape {
        len: Some(keys.len() as u32),
        kind,
    }
}

fn keys_from_shape(shape: &ArrayShape) -> Option<Vec<ArrayKey>> {
    let len = shape.len?;
    match &shape.kind {
        ArrayKind::Packed => Some((0..i64::from(len)).map(ArrayKey::Int).collect()),
        ArrayKind::Struct(keys) => {
            Some(keys.iter().cloned().map(ArrayKey::Str).collect())
        }
        ArrayKind::Mixed => None,
    }
}

/// Fully known array: literal plus shape.
fn array_ty(lit: ArrayLit) -> AbstractTy {
    AbstractTy {
        caps: Caps::NONSCALAR,
        shape: Some(shape_of(&lit)),
        literal: Some(Value::Arr(lit)),
    }
}

/// Re-derives default facts for an already-built (possibly rewritten)
/// function, propagating entry stacks forward along normal edges.
///
/// Useful for idempotence checks, where the program under test no longer
/// matches any builder. Only the default per-opcode rules apply; functions
/// needing overridden flags can't round-trip through this.
pub fn derive_facts(func: &Function, local_tys: &[AbstractTy]) -> FunctionFacts {
    let sim = FnBuilder {
        blocks: Vec::new(),
        local_tys: local_tys.to_vec(),
        equiv_locals: Vec::new(),
        this_local: None,
        num_params: func.num_params,
        is_closure_body: func.is_closure_body,
        is_reified: func.is_reified,
        volatile_locals: Vec::new(),
    };

    let mut entry: Vec<Option<Vec<AbstractTy>>> = vec![None; func.blocks.len()];
    let mut facts = FunctionFacts {
        blocks: vec![None; func.blocks.len()],
    };

    for bid in deadwood::cfg::reverse_postorder(func) {
        let block = &func.blocks[bid as usize];
        let mut stack = entry[bid as usize].clone().unwrap_or_default();
        let mut steps = Vec::with_capacity(block.instrs.len());
        for instr in &block.instrs {
            let spec = InstrSpec {
                op: instr.op.clone(),
                pei: None,
                result_ty: None,
                reads: Vec::new(),
            };
            steps.push(sim.simulate(&spec, &mut stack));
        }
        for &succ in &block.succs {
            let skipped = matches!(
                block.terminal().map(|i| &i.op),
                Some(Opcode::MemoGet { miss }) if *miss == succ
            );
            let mut succ_stack = stack.clone();
            if skipped {
                let n = block.terminal().map_or(0, |i| i.op.pushes());
                succ_stack.truncate(succ_stack.len() - n as usize);
            }
            entry[succ as usize].get_or_insert(succ_stack);
        }
        for &succ in &block.throw_succs {
            entry[succ as usize].get_or_insert_with(Vec::new);
        }
        facts.blocks[bid as usize] = Some(BlockFacts {
            steps,
            exit_depth: stack.len() as u32,
        });
    }

    facts
}

/// The opcodes of one block, for assertions.
pub fn ops(func: &Function, block: BlockId) -> Vec<Opcode> {
    func.blocks[block as usize]
        .instrs
        .iter()
        .map(|i| i.op.clone())
        .collect()
}

/// Net stack depth change of one block, counting analysis arity.
pub fn net_stack_effect(func: &Function, block: BlockId) -> i64 {
    func.blocks[block as usize]
        .instrs
        .iter()
        .map(|i| i64::from(i.op.dce_pushes()) - i64::from(i.op.dce_pops()))
        .sum()
}
