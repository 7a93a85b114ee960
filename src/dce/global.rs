//! The whole-function fixed point and the local-removal pass.
//!
//! Classic backward dataflow over the CFG: per-block live-out states are
//! refined until nothing changes, with the worklist ordered by reverse
//! postorder so blocks nearer the exit are processed first (fewer
//! re-visits; correctness does not depend on it).
//!
//! Stack liveness is merged structurally, slot by slot. Used-ness
//! dominates: if any successor path needs a slot, every path must keep
//! producing it. When paths disagree in any other way the slot is forced
//! to used, and the forcing is recorded against the slot's canonical
//! origin so every block that produced it gets re-analyzed and the
//! decision is applied uniformly. That safety net is what prevents one
//! branch from deleting a push whose paired pop on another branch still
//! expects it.

use std::collections::BinaryHeap;

use crate::bytecode::{BlockId, Function, Opcode};
use crate::cfg::{predecessors, reverse_postorder, rpo_ids, NO_RPO};
use crate::dce::action::{combine_actions, ActionMap, ReplaceMap};
use crate::dce::local_set::{LocalSet, MAX_TRACKED_LOCALS};
use crate::dce::state::{force_used, LocationSet};
use crate::dce::use_info::{LocationId, Use, UseInfo};
use crate::dce::walker::{analyze_block, rewrite_block, BlockOutState};
use crate::dce::apply::apply_actions;
use crate::facts::FunctionFacts;
use crate::{Error, Result};

/// Worklist keyed by reverse-postorder position, popping the deepest block
/// first, with membership dedup.
struct Worklist {
    heap: BinaryHeap<u32>,
    queued: Vec<bool>,
}

impl Worklist {
    fn new(len: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(len),
            queued: vec![false; len],
        }
    }

    fn push(&mut self, rpo_idx: u32) {
        if rpo_idx != NO_RPO && !self.queued[rpo_idx as usize] {
            self.queued[rpo_idx as usize] = true;
            self.heap.push(rpo_idx);
        }
    }

    fn pop(&mut self) -> Option<u32> {
        let idx = self.heap.pop()?;
        self.queued[idx as usize] = false;
        Some(idx)
    }
}

/// Is `location` already decided live, directly or through linkage?
fn check_live(uis: &[UseInfo], i: usize, location: LocationId, forced: &LocationSet) -> bool {
    if forced.contains(&location) {
        return true;
    }
    if !uis[i].is_linked() {
        return false;
    }
    debug_assert!(i > 0, "linked slot at the bottom of the stack");
    uis[i - 1].usage == Use::USED
}

/// First merge into an empty out-stack: adopt the incoming vector, stamp
/// canonical origins on slots that lack one, and immediately force live
/// anything already known unusable.
fn fixup_use_info(
    uis: &mut [UseInfo],
    blk: BlockId,
    is_slot: bool,
    temp: &mut LocationSet,
    forced: &LocationSet,
) {
    for i in 0..uis.len() {
        if !uis[i].location.is_some() {
            uis[i].location = LocationId {
                block: blk,
                id: i as u32,
                is_slot,
            };
        }
        let location = uis[i].location;
        if check_live(uis, i, location, forced) {
            force_used(temp, uis, i);
        }
    }
}

/// Merges one incoming slot into the accumulated out-state slot. Returns
/// `true` if the out-state changed.
#[allow(clippy::too_many_arguments)]
fn merge_uis(
    out: &mut [UseInfo],
    input: &[UseInfo],
    i: usize,
    blk: BlockId,
    is_slot: bool,
    multi_preds: bool,
    temp: &mut LocationSet,
    forced: &LocationSet,
) -> bool {
    if out[i].usage == Use::USED {
        if input[i].usage != Use::USED && multi_preds {
            // The successor has several predecessors and one of them (via
            // some other successor of its own) does use this value; the
            // incoming not-used decision must be revoked everywhere.
            let mut j = i;
            loop {
                let ui = &input[j];
                let linked = ui.is_linked();
                if ui.usage != Use::USED {
                    temp.insert(LocationId {
                        block: blk,
                        id: j as u32,
                        is_slot,
                    });
                }
                if !linked {
                    break;
                }
                debug_assert!(j > 0, "linked slot at the bottom of the stack");
                j -= 1;
            }
        }
        return false;
    }

    if input[i].usage == Use::USED || out[i].usage != input[i].usage {
        // Used-ness dominates, and any other disagreement collapses to
        // used as well.
        force_used(temp, out, i);
        return true;
    }

    let mut location = input[i].location;
    if !location.is_some() {
        location = LocationId {
            block: blk,
            id: i as u32,
            is_slot,
        };
    }
    if check_live(out, i, location, forced) {
        force_used(temp, out, i);
        return true;
    }

    let mut changed = false;
    for (&k, &v) in &input[i].actions {
        if let std::collections::btree_map::Entry::Vacant(e) = out[i].actions.entry(k) {
            e.insert(v);
            changed = true;
        }
    }
    debug_assert!(out[i].location.is_some());
    if out[i].location < location {
        // Either origin would do, but the choice must not depend on the
        // order blocks were visited in, so take the greater under the
        // canonical total order.
        out[i].location = location;
        changed = true;
    }
    changed
}

/// Merges a successor's entry-stack use vector into a predecessor's
/// out-state. Returns `true` if the out-state changed.
fn merge_ui_vecs(
    out: &mut Option<Vec<UseInfo>>,
    input: &[UseInfo],
    blk: BlockId,
    is_slot: bool,
    multi_preds: bool,
    temp: &mut LocationSet,
    forced: &LocationSet,
) -> bool {
    let Some(out_vec) = out.as_mut() else {
        let mut adopted = input.to_vec();
        fixup_use_info(&mut adopted, blk, is_slot, temp, forced);
        *out = Some(adopted);
        return true;
    };

    debug_assert_eq!(out_vec.len(), input.len(), "merging mismatched stacks");
    let mut changed = false;
    for i in 0..input.len() {
        if merge_uis(out_vec, input, i, blk, is_slot, multi_preds, temp, forced) {
            changed = true;
        }
    }
    changed
}

/// Does the edge `pred -> succ` skip the pushes of `pred`'s terminal?
///
/// The memoized-call protocol's miss edge transfers control without the
/// value push the fallthrough edge performs.
fn is_push_skipping_edge(func: &Function, pred: BlockId, succ: BlockId) -> bool {
    match func.blocks[pred as usize].terminal().map(|i| &i.op) {
        Some(Opcode::MemoGet { miss }) => *miss == succ,
        _ => false,
    }
}

/// Rejects facts that do not line up with the function's shape before any
/// analysis state is built.
pub(crate) fn validate_facts(func: &Function, facts: &FunctionFacts) -> Result<()> {
    if facts.blocks.len() != func.blocks.len() {
        return Err(Error::BlockCountMismatch {
            expected: func.blocks.len(),
            found: facts.blocks.len(),
        });
    }
    for (bid, bf) in facts.blocks.iter().enumerate() {
        if let Some(bf) = bf {
            let instrs = func.blocks[bid].instrs.len();
            if bf.steps.len() != instrs {
                return Err(Error::StepCountMismatch {
                    block: bid as BlockId,
                    expected: instrs,
                    found: bf.steps.len(),
                });
            }
        }
    }
    Ok(())
}

/// Runs the whole-function analysis to its fixed point, applies every
/// committed rewrite, and removes locals never found live. Returns whether
/// any array-builder chain was collapsed, in which case the caller must
/// recompute its interpreter facts before further optimization.
pub fn global_dce(func: &mut Function, facts: &FunctionFacts) -> Result<bool> {
    validate_facts(func, facts)?;
    log::debug!(
        "global DCE: {} blocks, {} locals",
        func.blocks.len(),
        func.locals.len()
    );

    let rpo = reverse_postorder(func);
    let rpo_of = rpo_ids(&rpo, func.blocks.len());
    let preds = predecessors(func);

    let mut states: Vec<BlockOutState> = vec![BlockOutState::global(); func.blocks.len()];

    // Every block is visited at least once.
    let mut worklist = Worklist::new(rpo.len());
    for idx in 0..rpo.len() as u32 {
        worklist.push(idx);
    }

    // Locations proven unusable as dead anywhere; producers of these must
    // treat them as used.
    let mut forced_live = LocationSet::new();
    // Locations forced during the current merge round.
    let mut forced_temp = LocationSet::new();

    let mut iterations = 0usize;
    while let Some(rpo_idx) = worklist.pop() {
        let bid = rpo[rpo_idx as usize];
        if facts.block(bid).is_none() {
            continue;
        }
        iterations += 1;
        log::trace!("block #{bid}");

        let result = analyze_block(func, facts, bid, &states[bid as usize]);

        // Newly discovered forced-live locations reschedule their
        // producing blocks unconditionally.
        for &loc in &result.forced_live {
            if forced_live.insert(loc) {
                log::trace!("forcing {loc:?} live");
                worklist.push(rpo_of[loc.block as usize]);
            }
        }

        let multi_preds = preds.normal[bid as usize].len() > 1;

        // Merge live-in into each normal predecessor's live-out.
        for &pid in &preds.normal[bid as usize] {
            let pbs = &mut states[pid as usize];
            let mut changed = pbs.loc_live.union_with(&result.loc_live_in);

            changed |= if is_push_skipping_edge(func, pid, bid) {
                let terminal_pushes = func.blocks[pid as usize]
                    .terminal()
                    .map_or(0, |i| i.op.pushes());
                let mut stack = result.stack.clone();
                stack.extend(
                    std::iter::repeat_with(|| UseInfo::new(Use::NOT))
                        .take(terminal_pushes as usize),
                );
                merge_ui_vecs(
                    &mut pbs.stack,
                    &stack,
                    bid,
                    false,
                    multi_preds,
                    &mut forced_temp,
                    &forced_live,
                )
            } else {
                merge_ui_vecs(
                    &mut pbs.stack,
                    &result.stack,
                    bid,
                    false,
                    multi_preds,
                    &mut forced_temp,
                    &forced_live,
                )
            };

            if changed {
                worklist.push(rpo_of[pid as usize]);
            }
        }

        // Merge live-in into each throw predecessor's exceptional
        // live-out; the walker folds those in at raising instructions.
        for &pid in &preds.throws[bid as usize] {
            let pbs = &mut states[pid as usize];
            if pbs.loc_live_exn.union_with(&result.loc_live_in) {
                worklist.push(rpo_of[pid as usize]);
            }
        }

        // Locations forced by this round of merging also reschedule their
        // producers.
        while !forced_temp.is_empty() {
            let batch = std::mem::take(&mut forced_temp);
            for loc in batch {
                if forced_live.insert(loc) {
                    log::trace!("forcing {loc:?} live");
                    worklist.push(rpo_of[loc.block as usize]);
                }
            }
        }
    }

    // Fixed point reached: collect the rewrites under the final states.
    log::debug!("fixed point after {iterations} block visits");
    let mut used_locals = LocalSet::new();
    let mut action_map = ActionMap::new();
    let mut replace_map = ReplaceMap::new();
    let mut did_elem_opts = false;
    for &bid in &rpo {
        let ret = rewrite_block(func, facts, bid, &states[bid as usize]);
        did_elem_opts |= ret.did_elem_opts;
        used_locals.union_with(&ret.used_locals);
        if action_map.is_empty() {
            action_map = ret.action_map;
        } else {
            combine_actions(&mut action_map, &ret.action_map);
        }
        for (id, seq) in ret.replace_map {
            replace_map.entry(id).or_insert(seq);
        }
    }

    log::debug!(
        "applying {} actions, {} locals ever live",
        action_map.len(),
        used_locals.count()
    );
    apply_actions(func, &action_map, &replace_map);
    remove_unused_locals(func, &used_locals);

    Ok(did_elem_opts)
}

/// Marks locals never observed live anywhere as removed.
///
/// Closure bodies are skipped: their locals double as captured-variable
/// storage whose removal would need call-site updates. The parameter
/// prefix (plus the reserved generics slot of reified functions) is never
/// touched.
pub(crate) fn remove_unused_locals(func: &mut Function, used: &LocalSet) {
    if func.is_closure_body {
        return;
    }
    let first = func.num_params as usize + usize::from(func.is_reified);
    for (id, local) in func.locals.iter_mut().enumerate().skip(first) {
        if local.killed {
            debug_assert!(id < MAX_TRACKED_LOCALS && !used.contains(id as u32));
            continue;
        }
        if id < MAX_TRACKED_LOCALS && !used.contains(id as u32) {
            log::trace!("  killing local {id}");
            local.killed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worklist_pops_deepest_first_and_dedups() {
        let mut wl = Worklist::new(4);
        wl.push(1);
        wl.push(3);
        wl.push(1);
        wl.push(0);
        assert_eq!(wl.pop(), Some(3));
        assert_eq!(wl.pop(), Some(1));
        assert_eq!(wl.pop(), Some(0));
        assert_eq!(wl.pop(), None);
    }

    #[test]
    fn merge_used_dominates() {
        let forced = LocationSet::new();
        let mut temp = LocationSet::new();
        let mut out = vec![UseInfo::new(Use::NOT)];
        out[0].location = LocationId {
            block: 0,
            id: 0,
            is_slot: true,
        };
        let input = vec![UseInfo::new(Use::USED)];
        let changed = merge_uis(&mut out, &input, 0, 1, true, false, &mut temp, &forced);
        assert!(changed);
        assert_eq!(out[0].usage, Use::USED);
        assert!(temp.contains(&LocationId {
            block: 0,
            id: 0,
            is_slot: true
        }));
    }

    #[test]
    fn merge_agreeing_not_unions_actions() {
        use crate::dce::action::{Action, ActionKind};
        use crate::dce::use_info::InstrId;

        let forced = LocationSet::new();
        let mut temp = LocationSet::new();

        let mut out = vec![UseInfo::new(Use::NOT)];
        out[0].location = LocationId {
            block: 0,
            id: 0,
            is_slot: true,
        };
        out[0]
            .actions
            .insert(InstrId { block: 2, idx: 1 }, Action::new(ActionKind::Kill));

        let mut input = vec![UseInfo::new(Use::NOT)];
        input[0]
            .actions
            .insert(InstrId { block: 3, idx: 0 }, Action::new(ActionKind::Kill));

        let changed = merge_uis(&mut out, &input, 0, 4, true, false, &mut temp, &forced);
        assert!(changed);
        assert_eq!(out[0].usage, Use::NOT);
        assert_eq!(out[0].actions.len(), 2);
        assert!(temp.is_empty());
    }

    #[test]
    fn merge_origin_tie_break_is_order_independent() {
        let forced = LocationSet::new();
        let mut temp = LocationSet::new();

        let lo = LocationId {
            block: 1,
            id: 0,
            is_slot: true,
        };
        let hi = LocationId {
            block: 2,
            id: 0,
            is_slot: true,
        };

        // lo out-state, hi incoming.
        let mut out = vec![UseInfo::new(Use::NOT)];
        out[0].location = lo;
        let mut input = vec![UseInfo::new(Use::NOT)];
        input[0].location = hi;
        merge_uis(&mut out, &input, 0, 9, true, false, &mut temp, &forced);
        assert_eq!(out[0].location, hi);

        // hi out-state, lo incoming: same winner.
        let mut out2 = vec![UseInfo::new(Use::NOT)];
        out2[0].location = hi;
        let mut input2 = vec![UseInfo::new(Use::NOT)];
        input2[0].location = lo;
        merge_uis(&mut out2, &input2, 0, 9, true, false, &mut temp, &forced);
        assert_eq!(out2[0].location, hi);
    }

    #[test]
    fn remove_unused_skips_params_and_closures() {
        use crate::bytecode::Local;

        let mut func = Function {
            locals: vec![
                Local::named("p0"),
                Local::named("a"),
                Local::named("b"),
            ],
            num_params: 1,
            ..Function::default()
        };
        let mut used = LocalSet::new();
        used.insert(1);
        remove_unused_locals(&mut func, &used);
        assert!(!func.locals[0].killed, "parameters are never removed");
        assert!(!func.locals[1].killed);
        assert!(func.locals[2].killed);

        let mut closure = Function {
            locals: vec![Local::named("c")],
            is_closure_body: true,
            ..Function::default()
        };
        remove_unused_locals(&mut closure, &LocalSet::new());
        assert!(!closure.locals[0].killed);
    }
}
