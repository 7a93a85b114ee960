use thiserror::Error;

use crate::bytecode::BlockId;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The analysis itself has no user-facing failure mode: internal contract
/// violations (stack-depth divergence, illegal action merges, a linked slot
/// classified used) are programming errors surfaced by assertions, and
/// unreachable blocks are silently skipped. What remains are input-shape
/// mismatches between a function and the interpreter facts handed in with
/// it, reported before any analysis runs so rewrites stay all-or-nothing.
///
/// # Examples
///
/// ```rust
/// use deadwood::{global_dce, Error};
/// use deadwood::bytecode::Function;
/// use deadwood::facts::FunctionFacts;
///
/// let mut func = Function::default();
/// func.blocks.push(Default::default());
///
/// // Facts for a different number of blocks are rejected up front.
/// match global_dce(&mut func, &FunctionFacts::default()) {
///     Err(Error::BlockCountMismatch { expected, found }) => {
///         eprintln!("facts cover {found} blocks, function has {expected}");
///     }
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The facts vector does not cover the function's blocks.
    ///
    /// The interpreter must supply one (possibly empty) entry per block of
    /// the function being optimized, in block-id order.
    #[error("facts cover {found} blocks, function has {expected}")]
    BlockCountMismatch {
        /// Number of blocks in the function.
        expected: usize,
        /// Number of block entries in the facts.
        found: usize,
    },

    /// A reachable block's facts do not have one step per instruction.
    ///
    /// Usually means the function was mutated after the facts were
    /// computed; interpreter facts are only valid for the exact
    /// instruction sequence they were derived from.
    #[error("block {block}: facts cover {found} instructions, block has {expected}")]
    StepCountMismatch {
        /// The block whose facts are stale.
        block: BlockId,
        /// Number of instructions in the block.
        expected: usize,
        /// Number of step entries in the facts.
        found: usize,
    },

    /// A block id passed to the single-block pass does not exist.
    #[error("block {block} out of range, function has {count} blocks")]
    BlockOutOfRange {
        /// The requested block.
        block: BlockId,
        /// Number of blocks in the function.
        count: usize,
    },
}
