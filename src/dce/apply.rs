//! The action applicator: replays the committed action map onto the
//! instruction sequence.
//!
//! The map's key order (block ascending, index descending) guarantees that
//! every deletion or insertion happens above any index still to be
//! processed, so positions never need re-computation. Source positions are
//! preserved on whatever replaces a rewritten instruction, and a block is
//! never left empty: the last instruction decays to a no-op instead.

use crate::bytecode::{Function, Instr, Opcode};
use crate::dce::action::{ActionKind, ActionMap, ReplaceMap};
use crate::dce::path::adjust_path_instr;

/// Applies every action to the function's instruction storage.
///
/// # Panics
///
/// Panics when a `Replace`/`PopAndReplace` action has no replacement
/// sequence; the analysis always records both sides together.
pub(crate) fn apply_actions(func: &mut Function, actions: &ActionMap, replaces: &ReplaceMap) {
    for (&id, &action) in actions {
        let block = &mut func.blocks[id.block as usize];
        let idx = id.idx as usize;
        log::trace!(
            "{:?} {:?} on {}",
            id,
            action.kind,
            block.instrs[idx].op.mnemonic()
        );

        match action.kind {
            ActionKind::PopInputs => {
                // The instruction decays to discards of its inputs; with
                // no inputs that is just a kill.
                let n = block.instrs[idx].op.dce_pops() as usize;
                if n > 0 {
                    let src_loc = block.instrs[idx].src_loc;
                    block.instrs.splice(
                        idx..=idx,
                        std::iter::repeat_with(|| Instr::with_loc(Opcode::Pop, src_loc)).take(n),
                    );
                } else {
                    kill_at(block, idx);
                }
            }
            ActionKind::Kill => kill_at(block, idx),
            ActionKind::PopOutputs => {
                let n = block.instrs[idx].op.dce_pushes() as usize;
                let src_loc = block.instrs[idx].src_loc;
                block.instrs.splice(
                    idx + 1..idx + 1,
                    std::iter::repeat_with(|| Instr::with_loc(Opcode::Pop, src_loc)).take(n),
                );
            }
            ActionKind::Replace => {
                let seq = replaces.get(&id).expect("replacement sequence missing");
                assert!(!seq.is_empty(), "empty replacement sequence");
                let src_loc = block.instrs[idx].src_loc;
                block.instrs.splice(
                    idx..=idx,
                    seq.iter()
                        .map(|i| Instr::with_loc(i.op.clone(), src_loc)),
                );
            }
            ActionKind::PopAndReplace => {
                let seq = replaces.get(&id).expect("replacement sequence missing");
                assert!(!seq.is_empty(), "empty replacement sequence");
                let n = block.instrs[idx].op.dce_pops() as usize;
                let src_loc = block.instrs[idx].src_loc;
                block.instrs.splice(
                    idx..=idx,
                    std::iter::repeat_with(|| Instr::with_loc(Opcode::Pop, src_loc))
                        .take(n)
                        .chain(
                            seq.iter()
                                .map(|i| Instr::with_loc(i.op.clone(), src_loc)),
                        ),
                );
            }
            ActionKind::PathStackFinal | ActionKind::PathStackFixup => {
                adjust_path_instr(&mut block.instrs[idx].op, action.mask);
            }
        }
    }
}

/// Removes the instruction at `idx`, or decays it to a no-op when it is
/// the block's only instruction.
fn kill_at(block: &mut crate::bytecode::Block, idx: usize) {
    if block.instrs.len() == 1 {
        let src_loc = block.instrs[0].src_loc;
        block.instrs[0] = Instr::with_loc(Opcode::Nop, src_loc);
    } else {
        block.instrs.remove(idx);
    }
}
