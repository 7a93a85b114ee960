//! Function, block, and local storage.
//!
//! A [`Function`] owns the instruction sequence the eliminator rewrites: a
//! vector of [`Block`]s (each a straight-line instruction run plus its
//! normal and throw successor lists) and the local-variable declaration
//! table. Control-flow structure is part of the representation; the
//! analysis never re-derives edges from instruction operands.

use crate::bytecode::opcode::Opcode;

/// Identifies a basic block by index into [`Function::blocks`].
pub type BlockId = u32;

/// Identifies a local variable by index into [`Function::locals`].
pub type LocalId = u32;

/// Sentinel for "no block".
pub const NO_BLOCK: BlockId = BlockId::MAX;

/// Sentinel for "no local". Greater than every valid local id.
pub const NO_LOCAL: LocalId = LocalId::MAX;

/// One instruction plus its source-position metadata.
///
/// Rewrites preserve `src_loc` on whatever instruction(s) replace or
/// displace the original, so diagnostics keep pointing at user code.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// The operation.
    pub op: Opcode,
    /// Source position this instruction was compiled from, `-1` if unknown.
    pub src_loc: i32,
}

impl Instr {
    /// Creates an instruction with no source position.
    #[must_use]
    pub const fn new(op: Opcode) -> Self {
        Self { op, src_loc: -1 }
    }

    /// Creates an instruction with a source position.
    #[must_use]
    pub const fn with_loc(op: Opcode, src_loc: i32) -> Self {
        Self { op, src_loc }
    }
}

impl From<Opcode> for Instr {
    fn from(op: Opcode) -> Self {
        Instr::new(op)
    }
}

/// A basic block: instructions plus successor edges.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// The instruction run. Never empty after a rewrite pass.
    pub instrs: Vec<Instr>,
    /// Normal-flow successors (fallthrough, jump targets, branch arms).
    pub succs: Vec<BlockId>,
    /// Successors reachable only by raising out of this block.
    pub throw_succs: Vec<BlockId>,
}

impl Block {
    /// The terminal instruction, if the block is non-empty.
    #[must_use]
    pub fn terminal(&self) -> Option<&Instr> {
        self.instrs.last()
    }
}

/// One entry in the function's local-variable table.
#[derive(Debug, Clone, Default)]
pub struct Local {
    /// Declared name, if the local is named.
    pub name: Option<String>,
    /// Set by the local-removal pass once the local is proven unused.
    pub killed: bool,
    /// Locals observable through dynamic or debugger access; their reads
    /// must keep their original form.
    pub volatile: bool,
}

impl Local {
    /// Creates a named local.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// A function: the unit of analysis and rewriting.
#[derive(Debug, Clone, Default)]
pub struct Function {
    /// Basic blocks; block 0 is the entry.
    pub blocks: Vec<Block>,
    /// Local-variable table. The first [`Function::num_params`] entries are
    /// parameters.
    pub locals: Vec<Local>,
    /// Number of parameter locals at the front of the table.
    pub num_params: u32,
    /// Closure bodies keep captured-variable bookkeeping in their locals;
    /// the local-removal pass skips them.
    pub is_closure_body: bool,
    /// Reified-generic functions reserve one extra slot after the
    /// parameters that local removal must not touch.
    pub is_reified: bool,
}

impl Function {
    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Immutable block access.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id as usize)
    }

    /// Returns `true` if the local's reads must keep their original form.
    #[must_use]
    pub fn is_volatile_local(&self, id: LocalId) -> bool {
        self.locals
            .get(id as usize)
            .is_some_and(|l| l.volatile)
    }
}
