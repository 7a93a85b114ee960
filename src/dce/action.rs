//! Committed rewrite actions, keyed by instruction.
//!
//! Analysis never edits bytecode directly; it accumulates one [`Action`]
//! per instruction to be rewritten, and the applicator replays the final
//! map in one deterministic pass. Two actions can land on the same
//! instruction from different slots or paths; [`combine_actions`] merges
//! them under a fixed precedence table, and any combination outside that
//! table is a contract violation.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::bytecode::Instr;
use crate::dce::use_info::InstrId;

/// What to do to one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumCount)]
pub enum ActionKind {
    /// Remove the instruction entirely.
    Kill,
    /// Replace the instruction with one discard per value it would pop.
    PopInputs,
    /// Keep the instruction, append one discard per value it pushes.
    PopOutputs,
    /// Replace the instruction with an explicit sequence.
    Replace,
    /// Discard the instruction's inputs, then splice in a sequence.
    PopAndReplace,
    /// Re-index the trailing-discard operands of a path-final instruction;
    /// the mask records which consumed depths were eliminated.
    PathStackFinal,
    /// Re-index the stack-addressed key of a path instruction; the mask
    /// records which peeked-over depths were eliminated.
    PathStackFixup,
}

/// An action plus the depth bit-mask used by the path-adjustment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    /// The rewrite to perform.
    pub kind: ActionKind,
    /// Depth bits for [`ActionKind::PathStackFinal`] /
    /// [`ActionKind::PathStackFixup`]; zero for every other kind.
    pub mask: u32,
}

impl Action {
    /// Width of the depth mask: adjustments track the 32 slots nearest the
    /// top of the stack.
    pub const MASK_BITS: u32 = 32;

    /// An action with the given kind and an empty mask.
    #[must_use]
    pub const fn new(kind: ActionKind) -> Self {
        Self { kind, mask: 0 }
    }

    /// An action with a depth mask.
    #[must_use]
    pub const fn with_mask(kind: ActionKind, mask: u32) -> Self {
        Self { kind, mask }
    }
}

impl From<ActionKind> for Action {
    fn from(kind: ActionKind) -> Self {
        Action::new(kind)
    }
}

/// Accumulated actions. The key order (block ascending, index descending)
/// is exactly safe application order.
pub type ActionMap = BTreeMap<InstrId, Action>;

/// Replacement sequences for `Replace` / `PopAndReplace` entries.
pub type ReplaceMap = BTreeMap<InstrId, SmallVec<[Instr; 2]>>;

/// Merges `src` into `dst` under the action precedence table.
///
/// Same-kind entries are idempotent, except the two path-adjustment kinds,
/// whose masks OR together. Across kinds: `Replace` dominates
/// `PopAndReplace`, which dominates plain kills; `PopInputs` meeting `Kill`
/// collapses to `Kill`.
///
/// # Panics
///
/// Panics on a combination outside the table; that indicates two handlers
/// made contradictory decisions about one instruction.
pub fn combine_actions(dst: &mut ActionMap, src: &ActionMap) {
    for (&id, &action) in src {
        match dst.entry(id) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(action);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                let existing = e.get_mut();

                if matches!(
                    action.kind,
                    ActionKind::PathStackFixup | ActionKind::PathStackFinal
                ) {
                    assert_eq!(
                        existing.kind, action.kind,
                        "path adjustment merged with a different action at {id:?}"
                    );
                    existing.mask |= action.mask;
                    continue;
                }

                if existing.kind == action.kind {
                    continue;
                }

                assert!(
                    existing.kind == ActionKind::Kill || action.kind == ActionKind::Kill,
                    "cannot merge {existing:?} with {action:?} at {id:?}"
                );

                if existing.kind == ActionKind::PopAndReplace
                    || action.kind == ActionKind::PopAndReplace
                    || existing.kind == ActionKind::Replace
                    || action.kind == ActionKind::Replace
                {
                    // A kill of the surrounding chain means the replacement
                    // no longer needs to preserve the inputs.
                    existing.kind = ActionKind::Replace;
                } else if existing.kind == ActionKind::PopInputs
                    || action.kind == ActionKind::PopInputs
                {
                    existing.kind = ActionKind::Kill;
                } else {
                    panic!("cannot merge {existing:?} with {action:?} at {id:?}");
                }
            }
        }
    }
}
