//! The per-slot use lattice and the coordinates the analysis keys on.
//!
//! During the backward walk every live evaluation-stack slot carries a
//! [`UseInfo`]: its [`Use`] classification, the set of actions that must all
//! be applied together if the slot is eliminated, and (for slots that cross
//! block boundaries) the [`LocationId`] of the slot's origin so divergent
//! paths can be forced into agreement.

use bitflags::bitflags;

use crate::bytecode::{BlockId, NO_BLOCK};
use crate::dce::action::ActionMap;

bitflags! {
    /// Use classification of one stack slot, as seen walking backward.
    ///
    /// The empty set means the slot is (possibly) used. Two independent bit
    /// groups: the base classification (`NOT`, `ELEM_CHAIN`) and the
    /// `LINKED` modifier. `LINKED` may only accompany an unused
    /// classification; a used slot is never linked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Use: u8 {
        /// The slot is unconditionally not used.
        const NOT = 0b001;
        /// The slot holds an array being built by an append chain and is a
        /// candidate for collapsing into a single construction. Subsumes
        /// `NOT`: the array value itself is not otherwise observed.
        const ELEM_CHAIN = 0b011;
        /// The slot's fate is tied to the slot directly beneath it; both
        /// are eliminated together or neither is.
        const LINKED = 0b100;
    }
}

impl Use {
    /// The "possibly used" classification.
    pub const USED: Use = Use::empty();

    /// Strips the `LINKED` modifier, leaving the base classification.
    #[must_use]
    pub fn mask_use(self) -> Use {
        self & Use::ELEM_CHAIN
    }

    /// Checks the lattice invariant: `LINKED` only rides on `NOT`.
    pub fn validate(self) {
        debug_assert!(
            !self.contains(Use::LINKED) || self.mask_use() == Use::NOT,
            "linked slot must be classified NOT, got {self:?}"
        );
    }
}

/// Identifies one instruction: block id plus index within the block.
///
/// Ordered by block ascending and **index descending**, so that iterating
/// an ordered action map visits each block's instructions back to front and
/// deletions never invalidate indices still to be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrId {
    /// The block.
    pub block: BlockId,
    /// The instruction index within the block.
    pub idx: u32,
}

impl Ord for InstrId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.block
            .cmp(&other.block)
            .then(other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for InstrId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Identifies the origin of a value that crosses a block boundary: the
/// block, a slot or local index, and which of the two it is.
///
/// The derived order (block, then id, then locals before slots) is the
/// canonical tie-break used when merging origins across paths. Any total
/// order works; it must simply not depend on visitation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationId {
    /// The block the value originates from.
    pub block: BlockId,
    /// Slot or local index.
    pub id: u32,
    /// `true` for stack slots, `false` for locals.
    pub is_slot: bool,
}

impl LocationId {
    /// The "not tracked across blocks" sentinel.
    pub const NONE: LocationId = LocationId {
        block: NO_BLOCK,
        id: 0,
        is_slot: false,
    };

    /// Returns `true` if this is a real cross-block location.
    #[must_use]
    pub fn is_some(self) -> bool {
        self.block != NO_BLOCK
    }
}

/// Use information for one evaluation-stack slot.
#[derive(Debug, Clone, PartialEq)]
pub struct UseInfo {
    /// The classification.
    pub usage: Use,
    /// Actions to perform, atomically, if this slot is eliminated.
    pub actions: ActionMap,
    /// Origin of the value when it is live across blocks; [`LocationId::NONE`]
    /// for values produced and consumed within one block.
    pub location: LocationId,
}

impl UseInfo {
    /// A slot with the given classification and no pending actions.
    #[must_use]
    pub fn new(usage: Use) -> Self {
        Self {
            usage,
            actions: ActionMap::new(),
            location: LocationId::NONE,
        }
    }

    /// A slot with the given classification and pending actions.
    #[must_use]
    pub fn with_actions(usage: Use, actions: ActionMap) -> Self {
        Self {
            usage,
            actions,
            location: LocationId::NONE,
        }
    }

    /// Returns `true` if this slot is tied to the slot beneath it.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.usage.contains(Use::LINKED)
    }
}

/// Returns `true` if every slot's base classification is exactly `NOT`.
///
/// An `ELEM_CHAIN` slot is *not* unused in this sense; the chain marker
/// means the value is consumed by the chain rewrite.
#[must_use]
pub fn all_unused(uis: &[UseInfo]) -> bool {
    uis.iter().all(|ui| ui.usage.mask_use() == Use::NOT)
}
