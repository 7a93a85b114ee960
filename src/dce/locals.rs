//! Local-variable liveness during the backward walk.
//!
//! A local is live when some later instruction may read its current value
//! before the next definite write. Reads gen, definite writes kill, and
//! anything beyond the fixed tracking window is conservatively live.
//!
//! Overwriting a local is more than a liveness question: if the old value
//! could run observable teardown, or could be an aliasing reference whose
//! unbinding is visible elsewhere, the write must stay. Locals proven to
//! hold the same value protect each other from the teardown concern, with
//! one exception at unconditional exits where every local dies at once.

use crate::bytecode::{LocalId, NO_LOCAL};
use crate::dce::local_set::{LocalSet, MAX_TRACKED_LOCALS};
use crate::dce::state::Env;
use crate::facts::AbstractTy;

/// Adds a whole set of locals to the live set (the conservative policy's
/// may-read fallback).
pub(crate) fn add_loc_gen_set(env: &mut Env, locs: &LocalSet) {
    log::trace!("      loc-conservative: {locs:?}");
    env.state.live_locals.union_with(locs);
}

/// Marks one local live.
pub(crate) fn add_loc_gen(env: &mut Env, id: LocalId) {
    log::trace!("      loc-gen: {id}");
    env.state.live_locals.insert(id);
}

/// Records that this instruction reads `loc` *if it survives*; the push
/// handler converts it to a gen unless the instruction is eliminated.
pub(crate) fn schedule_gen_loc(env: &mut Env, loc: LocalId) {
    env.loc = Some(loc);
}

/// Marks one local dead (definitely written here).
pub(crate) fn add_loc_kill(env: &mut Env, id: LocalId) {
    log::trace!("     loc-kill: {id}");
    env.state.live_locals.remove(id);
}

/// Is the local live after the current instruction? Ids outside the
/// tracking window are always live.
pub(crate) fn is_loc_live(env: &Env, id: LocalId) -> bool {
    if id as usize >= MAX_TRACKED_LOCALS {
        return true;
    }
    env.state.live_locals.contains(id)
}

/// The local's type before the current instruction.
pub(crate) fn loc_ty(env: &Env, loc: LocalId) -> AbstractTy {
    env.step.local(loc)
}

/// Could overwriting `loc` here be observable?
///
/// The receiver-anchored local is exempt: its lifetime is held elsewhere.
/// A local with a known equivalent holds a value that is not the last
/// reference, so overwriting it cannot tear anything down; at an
/// unconditional exit (`for_exit`) the whole class dies together, so only
/// members with a lower-numbered equivalent keep the exemption. Choosing
/// the low member also keeps parameters live, which they must be anyway.
pub(crate) fn set_loc_could_have_side_effects(env: &Env, loc: LocalId, for_exit: bool) -> bool {
    if env.step.this_local == Some(loc) {
        return false;
    }

    if let Some(&first) = env.step.equiv_locals.get(loc as usize) {
        if first != NO_LOCAL {
            if !for_exit {
                return false;
            }
            let mut l = first;
            loop {
                if l < loc {
                    return false;
                }
                l = env.step.equiv_locals[l as usize];
                if l == loc {
                    break;
                }
            }
        }
    }

    loc_ty(env, loc).overwrite_observable()
}

/// At a function exit every local is torn down; any whose teardown could be
/// observed must be treated as read here.
pub(crate) fn read_teardown_locals(env: &mut Env) {
    for i in 0..env.step.locals_before.len() as LocalId {
        if set_loc_could_have_side_effects(env, i, true) {
            add_loc_gen(env, i);
        }
    }
}
