//! Per-block analysis state and the backward stack protocol.
//!
//! The walker visits a block's instructions last to first. An instruction
//! that *pops* when running forward instead pushes a [`UseInfo`] describing
//! whether that operand is required; an instruction that *pushes* forward
//! instead pops the [`UseInfo`] for each value it produced and decides its
//! own fate from them. [`handle_push`] is the single funnel through which
//! every handler reports that decision.

use std::collections::BTreeSet;

use smallvec::{smallvec, SmallVec};

use crate::bytecode::{Function, LocalId, Opcode};
use crate::dce::action::{
    combine_actions, Action, ActionKind, ActionMap, ReplaceMap,
};
use crate::dce::local_set::LocalSet;
use crate::dce::use_info::{InstrId, LocationId, Use, UseInfo};
use crate::facts::StepFacts;

/// Deterministically ordered set of cross-block locations.
pub(crate) type LocationSet = BTreeSet<LocationId>;

/// Transient analysis state for one walk over one block.
#[derive(Debug)]
pub(crate) struct DceState {
    /// Locations discovered unusable as dead; producers must re-analyze.
    pub forced_live: LocationSet,
    /// The backward stack, parallel to the evaluation stack.
    pub stack: Vec<UseInfo>,
    /// Locals live at the current point of the walk.
    pub live_locals: LocalSet,
    /// Locals live at any point of this block, for local removal.
    pub used_locals: LocalSet,
    /// Actions committed so far.
    pub action_map: ActionMap,
    /// Replacement sequences for committed `Replace` actions.
    pub replace_map: ReplaceMap,
    /// In-flight speculative access-chain elimination, set by a path-final
    /// instruction and resolved at the chain's base (or abandoned at a PEI).
    pub chain_ui: Option<UseInfo>,
    /// Single-block analysis; cross-block and shape-changing rewrites are
    /// disabled.
    pub is_local: bool,
    /// Whether any array-builder chain was collapsed.
    pub did_elem_opts: bool,
}

impl DceState {
    pub(crate) fn new(is_local: bool) -> Self {
        Self {
            forced_live: LocationSet::new(),
            stack: Vec::new(),
            live_locals: LocalSet::new(),
            used_locals: LocalSet::new(),
            action_map: ActionMap::new(),
            replace_map: ReplaceMap::new(),
            chain_ui: None,
            is_local,
            did_elem_opts: false,
        }
    }

    /// Marks the slot at `i` used: clears its pending actions, records its
    /// cross-block origin as forced live, and walks down through linked
    /// slots doing the same.
    pub(crate) fn use_slot(&mut self, i: usize) {
        force_used(&mut self.forced_live, &mut self.stack, i);
    }
}

/// Marks `uis[i]` used, records its cross-block origin as forced live, and
/// walks down through linked slots doing the same.
pub(crate) fn force_used(forced: &mut LocationSet, uis: &mut [UseInfo], mut i: usize) {
    loop {
        let ui = &mut uis[i];
        let linked = ui.is_linked();
        if ui.usage != Use::USED && ui.location.is_some() {
            forced.insert(ui.location);
        }
        ui.usage = Use::USED;
        ui.actions.clear();
        if !linked {
            break;
        }
        debug_assert!(i > 0, "linked slot at the bottom of the stack");
        i -= 1;
    }
}

/// Everything a handler sees about the instruction under analysis.
pub(crate) struct Env<'a> {
    pub state: &'a mut DceState,
    pub func: &'a Function,
    pub op: &'a Opcode,
    pub id: InstrId,
    /// A local whose read is contingent on this instruction surviving;
    /// [`handle_push`] turns it into a gen when the instruction stays.
    pub loc: Option<LocalId>,
    pub step: &'a StepFacts,
}

/// How a handler disposes of the instruction it analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushFlags {
    /// The output is (possibly) used; the instruction stays.
    MarkLive,
    /// The instruction dies, but its inputs keep their current uses.
    MarkDead,
    /// Output unused and inputs uninteresting; the instruction becomes
    /// discards of its inputs (or vanishes with its whole chain).
    MarkUnused,
    /// The instruction must stay, but its outputs are discarded after it.
    PopOutputs,
    /// The output joins an array-builder chain.
    AddElem,
}

/// Number of pops as seen by the analysis.
pub(crate) fn num_pop(env: &Env) -> u32 {
    env.op.dce_pops()
}

/// Number of pushes as seen by the analysis.
pub(crate) fn num_push(env: &Env) -> u32 {
    env.op.dce_pushes()
}

// Backward stack manipulation. A forward pop becomes a push of use
// information for the operand.

pub(crate) fn pop(env: &mut Env, ui: UseInfo) {
    ui.usage.validate();
    log::trace!("      pop({:?})", ui.usage);
    env.state.stack.push(ui);
}

pub(crate) fn pop_use(env: &mut Env, usage: Use, actions: ActionMap) {
    pop(env, UseInfo::with_actions(usage, actions));
}

pub(crate) fn pop_used(env: &mut Env) {
    pop(env, UseInfo::new(Use::USED));
}

/// The operand is unused and its producer may be killed along with this
/// instruction.
pub(crate) fn discard(env: &mut Env) {
    let id = env.id;
    let mut actions = ActionMap::new();
    actions.insert(id, Action::new(ActionKind::Kill));
    pop_use(env, Use::NOT, actions);
}

pub(crate) fn pop_inputs(env: &mut Env, n: u32) {
    for _ in 0..n {
        pop_used(env);
    }
}

// Commit plumbing.

/// Returns `true` if the slot must be discarded via inserted pops rather
/// than eliminated transitively: its origin crosses a block boundary, or
/// several instructions already depend on it.
fn always_pop(ui: &UseInfo) -> bool {
    ui.location.is_some() || ui.actions.len() > 1
}

/// Heuristic: popping the output is worthwhile when the single dependent
/// action lies further up than the instruction right after this one.
fn maybe_pop(env: &Env, ui: &UseInfo) -> bool {
    ui.actions.len() == 1
        && ui
            .actions
            .keys()
            .next()
            .is_some_and(|k| k.idx > env.id.idx + 1)
}

fn should_pop_outputs(env: &Env, uis: &[UseInfo]) -> bool {
    uis.iter().any(always_pop) || uis.iter().any(|ui| maybe_pop(env, ui))
}

/// Commits an action set: into the global map, or onto the slot below when
/// the popped slot was linked to it. Ensures this instruction itself is
/// killed unless the set already prescribes something else for it.
pub(crate) fn commit_actions<'e>(
    env: &'e mut Env<'_>,
    linked: bool,
    am: &ActionMap,
) -> &'e mut ActionMap {
    if !linked {
        log::trace!("     committing {:?}: {} actions", env.id, am.len());
    }
    debug_assert!(
        !linked || env.state.stack.last().is_some_and(|ui| ui.usage != Use::USED),
        "linked commit onto a used slot"
    );

    let id = env.id;
    let dst = if linked {
        &mut env
            .state
            .stack
            .last_mut()
            .expect("linked commit with empty stack")
            .actions
    } else {
        &mut env.state.action_map
    };

    combine_actions(dst, am);
    if !am.contains_key(&id) {
        dst.insert(id, Action::new(ActionKind::Kill));
    }
    dst
}

pub(crate) fn commit_uis(env: &mut Env, linked: bool, uis: &[UseInfo]) {
    for ui in uis {
        commit_actions(env, linked, &ui.actions);
    }
}

/// Merges trailing use infos into the first.
///
/// Pending actions union (first writer wins per instruction); the origin
/// location is replaced whenever a later one orders higher, keeping the
/// canonical origin independent of argument order.
pub(crate) fn combine_uis(uis: &mut [UseInfo]) {
    let (first, rest) = uis.split_at_mut(1);
    let accum = &mut first[0];
    for ui in rest.iter() {
        for (&k, &v) in &ui.actions {
            accum.actions.entry(k).or_insert(v);
        }
        if !accum.location.is_some() || accum.location < ui.location {
            accum.location = ui.location;
        }
    }
}

/// Marks slots live. A slot that some other path still considered dead gets
/// its origin recorded in the forced-live set; a linked final slot also
/// forces the slot below it on the stack.
pub(crate) fn mark_uis_live(env: &mut Env, linked: bool, uis: &[UseInfo]) {
    let last = uis.len().saturating_sub(1);
    for (i, ui) in uis.iter().enumerate() {
        ui.usage.validate();
        if ui.usage != Use::USED && ui.location.is_some() {
            env.state.forced_live.insert(ui.location);
        }
        if i == last && linked {
            let top = env.state.stack.len() - 1;
            env.state.use_slot(top);
        }
    }
}

/// Keeps the instruction but discards its outputs, when doing so unlocks
/// enough downstream elimination; otherwise just marks everything live.
fn pop_outputs(env: &mut Env, linked: bool, uis: &[UseInfo]) {
    if should_pop_outputs(env, uis) {
        let id = env.id;
        commit_uis(env, linked, uis);
        // Re-resolve the destination map: the instruction stays, so its own
        // entry becomes an output pop instead of a kill.
        let dst = if linked {
            &mut env
                .state
                .stack
                .last_mut()
                .expect("linked commit with empty stack")
                .actions
        } else {
            &mut env.state.action_map
        };
        dst.insert(id, Action::new(ActionKind::PopOutputs));
        return;
    }
    mark_uis_live(env, linked, uis);
}

/// Replaces the instruction's forward pops with unused backward pushes,
/// linked together so the whole input group lives or dies as one.
pub(crate) fn ignore_inputs(env: &mut Env, mut linked: bool, actions: ActionMap) {
    let np = num_pop(env);
    if np == 0 {
        return;
    }
    for _ in 1..np {
        let usage = if linked { Use::NOT | Use::LINKED } else { Use::NOT };
        pop_use(env, usage, ActionMap::new());
        linked = true;
    }
    let usage = if linked { Use::NOT | Use::LINKED } else { Use::NOT };
    pop_use(env, usage, actions);
}

/// The funnel every handler reports through: applies the disposition to the
/// consumed use infos and pushes use information for the forward pops.
pub(crate) fn handle_push(env: &mut Env, pf: PushFlags, mut uis: SmallVec<[UseInfo; 2]>) {
    let linked = uis.last().is_some_and(UseInfo::is_linked);

    if let Some(loc) = env.loc {
        if linked || pf == PushFlags::MarkLive || pf == PushFlags::PopOutputs {
            crate::dce::locals::add_loc_gen(env, loc);
        }
    }

    match pf {
        PushFlags::MarkLive => mark_uis_live(env, linked, &uis),
        PushFlags::MarkDead => commit_uis(env, linked, &uis),
        PushFlags::MarkUnused => {
            // Outputs unused, consumers being removed, inputs uninteresting:
            // this instruction becomes discards of its inputs. A handler may
            // have pre-set its own action (e.g. a replacement), so only fill
            // in the default.
            combine_uis(&mut uis);
            let id = env.id;
            let ui = &mut uis[0];
            ui.actions
                .entry(id)
                .or_insert(Action::new(ActionKind::PopInputs));
            let actions = ui.actions.clone();
            commit_actions(env, linked, &actions);
            if num_pop(env) > 0 {
                let mut kill = ActionMap::new();
                kill.insert(id, Action::new(ActionKind::Kill));
                ignore_inputs(env, linked, kill);
            }
            return;
        }
        PushFlags::PopOutputs => pop_outputs(env, linked, &uis),
        PushFlags::AddElem => {
            debug_assert!(!linked, "array-builder chains never start linked");
            combine_uis(&mut uis);
            let id = env.id;
            let mut ui = uis.swap_remove(0);
            ui.usage = Use::ELEM_CHAIN;
            // The last chain link already recorded a replacement for this
            // instruction; the interior links simply die with the chain.
            ui.actions.entry(id).or_insert(Action::new(ActionKind::Kill));
            pop(env, ui);

            // The key is statically known; it is dropped with the chain.
            pop_use(env, Use::NOT | Use::LINKED, ActionMap::new());

            // The appended value is a normal use.
            pop_used(env);
            return;
        }
    }
    pop_inputs(env, num_pop(env));
}

/// Pops one use info, lets `f` classify the instruction, and funnels the
/// result through [`handle_push`].
pub(crate) fn stack_ops1(
    env: &mut Env,
    f: impl FnOnce(&mut Env, &mut UseInfo) -> PushFlags,
) {
    assert!(!env.state.stack.is_empty(), "stack underflow in backward walk");
    let mut ui = env.state.stack.pop().expect("checked non-empty");
    log::trace!("      stack_ops({:?})", ui.usage);
    env.loc = None;
    let pf = f(env, &mut ui);
    handle_push(env, pf, smallvec![ui]);
}

/// Two-output variant of [`stack_ops1`]; `u1` is the top slot.
pub(crate) fn stack_ops2(
    env: &mut Env,
    f: impl FnOnce(&mut Env, &mut UseInfo, &mut UseInfo) -> PushFlags,
) {
    assert!(env.state.stack.len() >= 2, "stack underflow in backward walk");
    let mut u1 = env.state.stack.pop().expect("checked non-empty");
    let mut u2 = env.state.stack.pop().expect("checked non-empty");
    log::trace!("      stack_ops({:?}, {:?})", u1.usage, u2.usage);
    env.loc = None;
    let pf = f(env, &mut u1, &mut u2);
    handle_push(env, pf, smallvec![u1, u2]);
}

/// Pops and marks live every value this instruction pushes forward.
pub(crate) fn push_outputs(env: &mut Env, n: u32) {
    for _ in 0..n {
        let ui = env.state.stack.pop().expect("stack underflow in backward walk");
        let linked = ui.is_linked();
        mark_uis_live(env, linked, &[ui]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::NO_BLOCK;
    use crate::dce::use_info::LocationId;

    fn ui_at(usage: Use, block: u32, id: u32) -> UseInfo {
        UseInfo {
            usage,
            actions: ActionMap::new(),
            location: LocationId {
                block,
                id,
                is_slot: true,
            },
        }
    }

    #[test]
    fn use_slot_follows_linked_chain() {
        let mut state = DceState::new(false);
        state.stack = vec![
            ui_at(Use::NOT, 2, 0),
            ui_at(Use::NOT | Use::LINKED, 2, 1),
            ui_at(Use::NOT | Use::LINKED, 2, 2),
        ];
        state.use_slot(2);
        assert!(state.stack.iter().all(|ui| ui.usage == Use::USED));
        assert_eq!(state.forced_live.len(), 3);
    }

    #[test]
    fn use_slot_stops_at_unlinked() {
        let mut state = DceState::new(false);
        state.stack = vec![ui_at(Use::NOT, 2, 0), ui_at(Use::NOT, 2, 1)];
        state.use_slot(1);
        assert_eq!(state.stack[1].usage, Use::USED);
        assert_eq!(state.stack[0].usage, Use::NOT);
        assert_eq!(state.forced_live.len(), 1);
    }

    #[test]
    fn used_slot_without_location_is_not_forced() {
        let mut state = DceState::new(false);
        state.stack = vec![UseInfo::new(Use::NOT)];
        state.use_slot(0);
        assert!(state.forced_live.is_empty());
        assert_eq!(state.stack[0].location.block, NO_BLOCK);
    }

    #[test]
    fn combine_uis_prefers_higher_location() {
        let mut uis = [ui_at(Use::NOT, 1, 0), ui_at(Use::NOT, 3, 7)];
        combine_uis(&mut uis);
        assert_eq!(uis[0].location.block, 3);
        assert_eq!(uis[0].location.id, 7);
    }
}
