//! The intra-block backward walker.
//!
//! One call analyzes one block: the state is seeded from the block's
//! live-out information, the instructions are visited last to first, and
//! the result is the block's live-in information plus the actions its
//! elimination decisions require.
//!
//! The walker also runs the speculative access-chain state machine. A
//! path-final instruction that proved its result removable parks a pending
//! chain elimination; intermediate path steps join it tentatively; the
//! base step commits it; and any potentially-raising instruction in
//! between abandons it, because a partially executed chain has already had
//! the observable effect of raising.

use smallvec::SmallVec;

use crate::bytecode::{BlockId, Function, Instr, Opcode};
use crate::dce::action::{Action, ActionKind, ActionMap, ReplaceMap};
use crate::dce::local_set::LocalSet;
use crate::dce::state::{commit_actions, DceState, Env, LocationSet};
use crate::dce::transfer::dispatch;
use crate::dce::use_info::{InstrId, Use, UseInfo};
use crate::facts::FunctionFacts;

/// Live-out information a block is analyzed against.
#[derive(Debug, Clone)]
pub(crate) struct BlockOutState {
    /// Locals live into some normal successor.
    pub loc_live: LocalSet,
    /// Locals live into some throw successor.
    pub loc_live_exn: LocalSet,
    /// Merged successor use information for the exit stack; `None` until a
    /// successor has been analyzed (every exit slot is then assumed used).
    pub stack: Option<Vec<UseInfo>>,
    /// Single-block analysis.
    pub is_local: bool,
}

impl BlockOutState {
    /// Out-state for the whole-function analysis: nothing known yet.
    pub(crate) fn global() -> Self {
        Self {
            loc_live: LocalSet::new(),
            loc_live_exn: LocalSet::new(),
            stack: None,
            is_local: false,
        }
    }

    /// Out-state for single-block analysis: every local conservatively
    /// live at exit, every stack slot used.
    pub(crate) fn local() -> Self {
        Self {
            loc_live: LocalSet::all(),
            loc_live_exn: LocalSet::all(),
            stack: None,
            is_local: true,
        }
    }
}

/// Walks one block backward. Returns `None` for blocks the abstract
/// interpreter never reached; they contribute nothing and change nothing.
pub(crate) fn visit_block(
    func: &Function,
    facts: &FunctionFacts,
    bid: BlockId,
    out: &BlockOutState,
) -> Option<DceState> {
    let bf = facts.block(bid)?;
    let block = &func.blocks[bid as usize];
    assert_eq!(
        bf.steps.len(),
        block.instrs.len(),
        "interpreter facts out of step with block {bid}"
    );

    let mut state = DceState::new(out.is_local);
    state.live_locals = out.loc_live;
    state.used_locals = out.loc_live;
    if let Some(stack) = &out.stack {
        assert_eq!(
            stack.len(),
            bf.exit_depth as usize,
            "merged exit stack depth mismatch in block {bid}"
        );
        state.stack = stack.clone();
    } else {
        state.stack = vec![UseInfo::new(Use::USED); bf.exit_depth as usize];
    }

    for idx in (0..block.instrs.len()).rev() {
        let instr = &block.instrs[idx];
        let step = &bf.steps[idx];
        log::trace!("  == #{idx} {}", instr.op.mnemonic());

        let mut env = Env {
            state: &mut state,
            func,
            op: &instr.op,
            id: InstrId {
                block: bid,
                idx: idx as u32,
            },
            loc: None,
            step,
        };

        let handled = chain_step(&mut env, block);
        if !handled {
            dispatch(&mut env);

            // A raising instruction can leave through the throw edges, so
            // their live-ins join here.
            if step.was_pei {
                log::trace!("    <-- exceptions");
                env.state.live_locals.union_with(&out.loc_live_exn);
            }

            let live = env.state.live_locals;
            env.state.used_locals.union_with(&live);
        }

        // The walk is now at the state before this instruction; the
        // backward stack must line up with the interpreter's.
        assert_eq!(
            state.stack.len(),
            step.stack_before.len(),
            "stack depth diverged at {bid}:{idx}"
        );
    }

    state.chain_ui = None;
    Some(state)
}

/// Advances the speculative chain-elimination state machine for one
/// instruction. Returns `true` if the instruction was fully handled (the
/// chain base committed) and dispatch must be skipped.
fn chain_step(env: &mut Env, block: &crate::bytecode::Block) -> bool {
    if env.state.chain_ui.is_none() {
        return false;
    }
    if env.step.was_pei {
        // The chain could have raised mid-way; nothing upstream of that
        // point may be deleted retroactively.
        env.state.chain_ui = None;
        return false;
    }
    if env.op.is_path_dim() {
        // Almost certainly deleted with the chain, but its local and stack
        // effects are still recorded below in case the chain is abandoned.
        let id = env.id;
        if let Some(chain) = env.state.chain_ui.as_mut() {
            chain.actions.insert(id, Action::new(ActionKind::Kill));
        }
        return false;
    }
    if env.op.is_path_base() {
        let chain = env.state.chain_ui.take().expect("checked above");
        let final_idx = chain.location.id as usize;
        let final_pops = block.instrs[final_idx].op.pops();
        let mut actions = chain.actions;
        let id = env.id;
        if final_pops > 0 {
            // The operands the deleted final would have consumed are now
            // discarded at the base instead.
            let mut pops: SmallVec<[Instr; 2]> = SmallVec::new();
            for i in 0..final_pops as usize {
                let top = env.state.stack.len() - 1 - i;
                env.state.use_slot(top);
                pops.push(Instr::new(Opcode::Pop));
            }
            env.state.replace_map.insert(id, pops);
            actions.insert(id, Action::new(ActionKind::Replace));
        } else {
            actions.insert(id, Action::new(ActionKind::Kill));
        }
        commit_actions(env, false, &actions);
        return true;
    }
    false
}

/// Live-in results of analyzing one block.
#[derive(Debug, Default)]
pub(crate) struct BlockAnalysis {
    /// Locals live at block entry.
    pub loc_live_in: LocalSet,
    /// Use information of the entry stack.
    pub stack: Vec<UseInfo>,
    /// Locations this walk discovered it cannot eliminate.
    pub forced_live: LocationSet,
}

/// Analysis-only walk: produces live-in information and discards actions.
pub(crate) fn analyze_block(
    func: &Function,
    facts: &FunctionFacts,
    bid: BlockId,
    out: &BlockOutState,
) -> BlockAnalysis {
    match visit_block(func, facts, bid, out) {
        Some(state) => BlockAnalysis {
            loc_live_in: state.live_locals,
            stack: state.stack,
            forced_live: state.forced_live,
        },
        None => BlockAnalysis::default(),
    }
}

/// Rewrite products of one block's walk.
#[derive(Debug, Default)]
pub(crate) struct BlockRewrite {
    /// Locals live at any point in the block.
    pub used_locals: LocalSet,
    /// Actions to apply.
    pub action_map: ActionMap,
    /// Replacement sequences for the actions.
    pub replace_map: ReplaceMap,
    /// Whether an array-builder chain was collapsed.
    pub did_elem_opts: bool,
}

/// Full walk keeping the rewrite products.
pub(crate) fn rewrite_block(
    func: &Function,
    facts: &FunctionFacts,
    bid: BlockId,
    out: &BlockOutState,
) -> BlockRewrite {
    match visit_block(func, facts, bid, out) {
        Some(state) => BlockRewrite {
            used_locals: state.used_locals,
            action_map: state.action_map,
            replace_map: state.replace_map,
            did_elem_opts: state.did_elem_opts,
        },
        None => BlockRewrite::default(),
    }
}
