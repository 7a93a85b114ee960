//! Dead-code elimination over the stack bytecode.
//!
//! Two entry points share the same backward walk:
//!
//! - [`local_dce`] analyzes a single block against fully conservative
//!   exit assumptions (every local live, every stack slot used). It can
//!   delete dead computation that is visible within the block, and never
//!   changes anything another block could observe.
//! - [`global_dce`] runs the whole-function liveness fixed point first,
//!   so stores and pushes that die across block boundaries fall too, then
//!   applies every rewrite and removes locals never found live. It is the
//!   only pass allowed to collapse array-builder chains, because those
//!   rewrites change stack shapes and require the caller to recompute its
//!   interpreter facts afterwards (signalled by the `true` return).
//!
//! [`global_dce_all`] fans the global pass out over independent functions.
//!
//! # Analysis shape
//!
//! Both passes are type-aware and visit blocks backward. While walking, an
//! instruction that pops when running forward *pushes* information about
//! whether that input is required; an instruction that pushes forward
//! *pops* the use information of its outputs and decides its own fate. Use
//! information that crosses block boundaries carries the canonical origin
//! of its value, and a global forced-live set keeps divergent paths from
//! disagreeing about whether a producer may die.

pub mod action;
pub mod local_set;
pub mod use_info;

mod apply;
mod global;
mod locals;
mod path;
mod state;
mod transfer;
mod walker;

use rayon::prelude::*;

use crate::bytecode::{BlockId, Function};
use crate::facts::FunctionFacts;
use crate::{Error, Result};

pub use global::global_dce;
pub use local_set::{LocalSet, MAX_TRACKED_LOCALS};

use self::apply::apply_actions;
use self::global::validate_facts;
use self::walker::{rewrite_block, BlockOutState};

/// Eliminates dead computation visible within one block.
///
/// Every local is assumed live at the block's exit and every exit stack
/// slot used, so the rewrites are valid regardless of what the rest of the
/// function does.
///
/// # Errors
///
/// Returns an error when `block` is out of range or `facts` does not line
/// up with the function's shape.
pub fn local_dce(func: &mut Function, facts: &FunctionFacts, block: BlockId) -> Result<()> {
    if block as usize >= func.blocks.len() {
        return Err(Error::BlockOutOfRange {
            block,
            count: func.blocks.len(),
        });
    }
    validate_facts(func, facts)?;
    log::debug!("local DCE on block {block}");

    let out = BlockOutState::local();
    let rewrite = rewrite_block(func, facts, block, &out);
    apply_actions(func, &rewrite.action_map, &rewrite.replace_map);
    Ok(())
}

/// Runs [`global_dce`] over many functions in parallel.
///
/// Each job owns its function and facts exclusively, so the functions are
/// processed on independent worker threads with no shared mutable state.
/// Returns how many functions had array-builder rewrites applied (each of
/// those needs its facts recomputed).
///
/// # Errors
///
/// Returns the first validation error encountered; functions that already
/// completed keep their rewrites (each function is all-or-nothing, the
/// batch is not).
pub fn global_dce_all(jobs: &mut [(Function, FunctionFacts)]) -> Result<usize> {
    let flags: Result<Vec<bool>> = jobs
        .par_iter_mut()
        .map(|(func, facts)| global_dce(func, facts))
        .collect();
    Ok(flags?.into_iter().filter(|&b| b).count())
}
