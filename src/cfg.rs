//! Control-flow-graph queries derived from block successor lists.
//!
//! Blocks carry their own successor edges; this module derives the two
//! views the fixed-point driver needs: a reverse-postorder numbering (used
//! to order the worklist) and per-block predecessor lists split into
//! normal-flow and throw-edge predecessors (merged differently during
//! liveness propagation).

use crate::bytecode::{BlockId, Function};

/// Sentinel reverse-postorder id for blocks unreachable from the entry.
pub const NO_RPO: u32 = u32::MAX;

/// Predecessor lists, split by edge kind.
#[derive(Debug, Clone, Default)]
pub struct Predecessors {
    /// Normal-flow predecessors per block.
    pub normal: Vec<Vec<BlockId>>,
    /// Throw-edge predecessors per block.
    pub throws: Vec<Vec<BlockId>>,
}

/// Computes normal and throw predecessor lists for every block.
#[must_use]
pub fn predecessors(func: &Function) -> Predecessors {
    let n = func.block_count();
    let mut preds = Predecessors {
        normal: vec![Vec::new(); n],
        throws: vec![Vec::new(); n],
    };
    for (bid, block) in func.blocks.iter().enumerate() {
        for &succ in &block.succs {
            preds.normal[succ as usize].push(bid as BlockId);
        }
        for &succ in &block.throw_succs {
            preds.throws[succ as usize].push(bid as BlockId);
        }
    }
    preds
}

/// Blocks reachable from the entry, in reverse postorder.
///
/// Both normal and throw edges are followed; blocks not reachable by either
/// do not appear.
#[must_use]
pub fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let n = func.block_count();
    if n == 0 {
        return Vec::new();
    }

    let mut postorder = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    // Iterative DFS; each stack frame is (block, next successor index).
    let mut stack: Vec<(BlockId, usize)> = vec![(0, 0)];
    visited[0] = true;

    while let Some(top) = stack.last_mut() {
        let bid = top.0;
        let block = &func.blocks[bid as usize];
        let total = block.succs.len() + block.throw_succs.len();
        if top.1 < total {
            let i = top.1;
            top.1 += 1;
            let succ = if i < block.succs.len() {
                block.succs[i]
            } else {
                block.throw_succs[i - block.succs.len()]
            };
            if !visited[succ as usize] {
                visited[succ as usize] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(bid);
            stack.pop();
        }
    }

    postorder.reverse();
    postorder
}

/// Maps block id to its index in `rpo`, [`NO_RPO`] for unreachable blocks.
#[must_use]
pub fn rpo_ids(rpo: &[BlockId], block_count: usize) -> Vec<u32> {
    let mut ids = vec![NO_RPO; block_count];
    for (i, &bid) in rpo.iter().enumerate() {
        ids[bid as usize] = i as u32;
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Block, Instr, Opcode};

    fn block(succs: Vec<BlockId>, throw_succs: Vec<BlockId>) -> Block {
        Block {
            instrs: vec![Instr::new(Opcode::Nop)],
            succs,
            throw_succs,
        }
    }

    #[test]
    fn diamond_rpo() {
        // 0 -> {1, 2}, 1 -> 3, 2 -> 3
        let func = Function {
            blocks: vec![
                block(vec![1, 2], vec![]),
                block(vec![3], vec![]),
                block(vec![3], vec![]),
                block(vec![], vec![]),
            ],
            ..Function::default()
        };
        let rpo = reverse_postorder(&func);
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], 0);
        assert_eq!(*rpo.last().unwrap(), 3);

        let ids = rpo_ids(&rpo, 4);
        assert_eq!(ids[0], 0);
        assert!(ids[1] < ids[3] && ids[2] < ids[3]);
    }

    #[test]
    fn unreachable_blocks_are_skipped() {
        let func = Function {
            blocks: vec![block(vec![], vec![]), block(vec![], vec![])],
            ..Function::default()
        };
        let rpo = reverse_postorder(&func);
        assert_eq!(rpo, vec![0]);
        let ids = rpo_ids(&rpo, 2);
        assert_eq!(ids[1], NO_RPO);
    }

    #[test]
    fn predecessor_split() {
        // 0 -> 1 normally, 0 -> 2 on throw.
        let func = Function {
            blocks: vec![
                block(vec![1], vec![2]),
                block(vec![], vec![]),
                block(vec![], vec![]),
            ],
            ..Function::default()
        };
        let preds = predecessors(&func);
        assert_eq!(preds.normal[1], vec![0]);
        assert!(preds.normal[2].is_empty());
        assert_eq!(preds.throws[2], vec![0]);
    }
}
