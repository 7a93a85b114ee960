//! Static facts consumed from the abstract interpreter.
//!
//! The eliminator is type-aware but does not interpret: it consumes the
//! interpreter's per-program-point results read-only. [`FunctionFacts`]
//! carries, for every reachable block, one [`StepFacts`] per instruction
//! with the stack and local types before the step, the type of the value
//! on top of the stack after it, whether the step could raise, and the
//! conservative may-read set used by the fallback transfer policy.
//!
//! Types are abstracted to the capability bits elimination decisions
//! actually depend on ([`AbstractTy`]): could the value be an aliasing
//! reference box, could it be uninitialized, could tearing it down be
//! observable, could it be a string or a non-scalar (which decides whether
//! compound assignment can raise). Known literal values and known array
//! shapes ride along for the rewrite side.

use bitflags::bitflags;

use crate::bytecode::{BinOp, LocalId, Value};
use crate::dce::{LocalSet, MAX_TRACKED_LOCALS};

bitflags! {
    /// Capability bits of an abstract value.
    ///
    /// A bit being set means the value *could* have the property; a clear
    /// bit is a proof that it cannot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u8 {
        /// Could be an aliasing reference box.
        const REF = 0b0000_0001;
        /// Could be uninitialized; reading it raises a warning.
        const UNINIT = 0b0000_0010;
        /// Could hold a value whose teardown is observable.
        const COUNTED = 0b0000_0100;
        /// Could be a string.
        const STR = 0b0000_1000;
        /// Could be something other than a plain scalar.
        const NONSCALAR = 0b0001_0000;
    }
}

/// How the keys of a partially known array are laid out.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayKind {
    /// Keys are exactly `0..len` in order.
    Packed,
    /// Keys are the given strings, in order.
    Struct(Vec<String>),
    /// Key layout unknown.
    Mixed,
}

/// What the interpreter knows about an array value's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayShape {
    /// Element count, when statically known.
    pub len: Option<u32>,
    /// Key layout.
    pub kind: ArrayKind,
}

/// The abstract type of one stack slot or local at one program point.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractTy {
    /// Capability bits.
    pub caps: Caps,
    /// The exact value, when the interpreter proved it constant.
    pub literal: Option<Value>,
    /// Shape information for array values.
    pub shape: Option<ArrayShape>,
}

impl AbstractTy {
    /// A value nothing is known about. Every capability bit is set.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            caps: Caps::all(),
            literal: None,
            shape: None,
        }
    }

    /// A plain initialized scalar with no observable lifetime.
    #[must_use]
    pub fn scalar() -> Self {
        Self {
            caps: Caps::empty(),
            literal: None,
            shape: None,
        }
    }

    /// An abstract type with exactly the given capabilities.
    #[must_use]
    pub fn with_caps(caps: Caps) -> Self {
        Self {
            caps,
            literal: None,
            shape: None,
        }
    }

    /// Returns `true` if the value could have any of the given capabilities.
    #[must_use]
    pub fn could_be(&self, caps: Caps) -> bool {
        self.caps.intersects(caps)
    }

    /// Could overwriting a location holding this value be observable?
    ///
    /// True when the old value could run observable teardown or could be an
    /// aliasing reference whose de-aliasing is visible elsewhere.
    #[must_use]
    pub fn overwrite_observable(&self) -> bool {
        self.could_be(Caps::REF | Caps::COUNTED)
    }

    /// Could reading this value be observable (uninitialized-read warning)?
    #[must_use]
    pub fn read_observable(&self) -> bool {
        self.could_be(Caps::UNINIT)
    }
}

impl Default for AbstractTy {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Could `local op= rhs` raise, given the operand types?
///
/// Compound assignment on plain scalars is silent except where string
/// operands force a coercion notice out of the arithmetic operators.
/// Concatenation never raises on scalars.
#[must_use]
pub fn set_op_could_raise(op: BinOp, lhs: &AbstractTy, rhs: &AbstractTy) -> bool {
    if lhs.could_be(Caps::NONSCALAR | Caps::REF) {
        return true;
    }
    if rhs.could_be(Caps::NONSCALAR | Caps::REF | Caps::UNINIT) {
        return true;
    }
    match op {
        BinOp::Concat => false,
        _ => lhs.could_be(Caps::STR) || rhs.could_be(Caps::STR),
    }
}

/// Interpreter facts for one instruction.
#[derive(Debug, Clone, Default)]
pub struct StepFacts {
    /// Types of the evaluation stack before this instruction, bottom first.
    pub stack_before: Vec<AbstractTy>,
    /// Types of the locals before this instruction, indexed by local id.
    pub locals_before: Vec<AbstractTy>,
    /// Type of the top of the stack after this instruction, when it pushes.
    pub after_top: Option<AbstractTy>,
    /// Whether this instruction could transfer control to a handler.
    pub was_pei: bool,
    /// Locals this instruction might read, for the conservative policy.
    pub may_read_locals: LocalSet,
    /// Local-equivalence chains: `equiv_locals[l]` is the next member of
    /// `l`'s class on a circular chain, or [`crate::bytecode::NO_LOCAL`].
    /// Empty means no equivalence information.
    pub equiv_locals: Vec<LocalId>,
    /// The local anchoring the bound receiver, if any.
    pub this_local: Option<LocalId>,
}

impl StepFacts {
    /// Type of the stack slot `depth` positions below the top, before the
    /// instruction executes.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is at least the stack depth; the interpreter and
    /// the instruction arity table must agree.
    #[must_use]
    pub fn top(&self, depth: u32) -> &AbstractTy {
        let len = self.stack_before.len();
        &self.stack_before[len - 1 - depth as usize]
    }

    /// Type of a local before the instruction, unknown if out of range.
    #[must_use]
    pub fn local(&self, id: LocalId) -> AbstractTy {
        self.locals_before
            .get(id as usize)
            .cloned()
            .unwrap_or_else(AbstractTy::unknown)
    }
}

/// Interpreter facts for one block.
#[derive(Debug, Clone, Default)]
pub struct BlockFacts {
    /// One entry per instruction, in program order.
    pub steps: Vec<StepFacts>,
    /// Stack depth at the end of the block.
    pub exit_depth: u32,
}

/// Interpreter facts for a whole function.
///
/// `blocks[b]` is `None` when the interpreter never reached block `b`; the
/// eliminator treats such blocks as identity (no actions, no liveness).
#[derive(Debug, Clone, Default)]
pub struct FunctionFacts {
    /// Per-block facts, indexed by block id.
    pub blocks: Vec<Option<BlockFacts>>,
}

impl FunctionFacts {
    /// Facts for one block, if it was reachable.
    #[must_use]
    pub fn block(&self, id: u32) -> Option<&BlockFacts> {
        self.blocks.get(id as usize).and_then(Option::as_ref)
    }
}

/// Asserts the interpreter's local table fits the tracking window used by
/// liveness. Locals past the window are handled conservatively, which is
/// sound, so this is advisory only.
#[must_use]
pub fn locals_fully_tracked(num_locals: usize) -> bool {
    num_locals <= MAX_TRACKED_LOCALS
}
