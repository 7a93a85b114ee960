//! Access-path instructions: peeks, trailing discards, and the speculative
//! whole-chain elimination.
//!
//! Path steps can read a stack slot *below* the top without popping it
//! (stack-addressed member keys, base-by-depth). A peeked slot is marked
//! used immediately; and because the peek addresses the slot by depth, any
//! shallower slot that is later eliminated shifts that depth, so every
//! shallower candidate slot gets a [`ActionKind::PathStackFixup`] entry
//! recording which depth bit to re-index.
//!
//! The final step of a chain may also discard a run of consumed slots; the
//! ones not aliased with the read target are eliminable one by one via
//! [`ActionKind::PathStackFinal`], with the same re-indexing bookkeeping.
//!
//! A final step whose result is unused (or statically known) can go
//! further and speculatively delete the *whole* chain; that decision is
//! parked on [`crate::dce::state::DceState::chain_ui`] and resolved when
//! the walk reaches the chain's base, or abandoned at the first
//! potentially-raising step in between.

use crate::bytecode::{MemberKey, Opcode};
use crate::dce::action::{Action, ActionKind, ActionMap};
use crate::dce::locals::add_loc_gen_set;
use crate::dce::state::{num_push, pop_use, pop_used, push_outputs, Env};
use crate::dce::transfer::no_dce;
use crate::dce::use_info::Use;
use crate::facts::Caps;

/// Marks the peeked slot (and anything linked beneath it) used, then
/// records a depth-fixup entry on every shallower slot that is still an
/// elimination candidate.
pub(crate) fn path_touch(env: &mut Env, depth: u32) {
    let len = env.state.stack.len();
    assert!(
        (depth as usize) < len,
        "path peek below the tracked stack ({depth} >= {len})"
    );
    env.state.use_slot(len - 1 - depth as usize);

    // Only the slots nearest the top fit in the fixup mask; anything
    // deeper is never killed beneath a peek.
    let mut d = depth.min(Action::MASK_BITS);
    let id = env.id;
    while d > 0 {
        d -= 1;
        let ui = &mut env.state.stack[len - 1 - d as usize];
        if ui.usage != Use::USED {
            let inserted = ui
                .actions
                .insert(id, Action::with_mask(ActionKind::PathStackFixup, 1 << d));
            debug_assert!(inserted.is_none(), "duplicate fixup entry at {id:?}");
        }
    }
}

/// A base step that addresses a stack slot by depth.
pub(crate) fn path_base(env: &mut Env, depth: u32) {
    no_dce(env);
    path_touch(env, depth);
}

/// An intermediate step; only stack-addressed keys peek.
pub(crate) fn path_dim(env: &mut Env, key: &MemberKey) {
    no_dce(env);
    if let Some(depth) = key.stack_slot() {
        path_touch(env, depth);
    }
}

/// A final step: outputs are live, the key slot and the slots outside the
/// discard range are normal uses, and each discardable slot within the
/// mask window becomes individually eliminable.
pub(crate) fn path_final(env: &mut Env, discard: u32, key: &MemberKey) {
    let may_read = env.step.may_read_locals;
    add_loc_gen_set(env, &may_read);
    push_outputs(env, num_push(env));

    let n_pop = env.op.pops();
    let stack_read = key.stack_slot().unwrap_or(n_pop);
    let id = env.id;

    for i in (0..n_pop).rev() {
        if i == stack_read || i >= Action::MASK_BITS || i < n_pop - discard {
            pop_used(env);
        } else {
            let mut actions = ActionMap::new();
            actions.insert(id, Action::with_mask(ActionKind::PathStackFinal, 1 << i));
            pop_use(env, Use::NOT, actions);
        }
    }
}

/// The read-final step: besides the normal final handling, park a
/// speculative whole-chain elimination when the result is unused, or a
/// literal replacement when the result is statically known. Either decision
/// only stands if every step back to the base turns out non-raising.
pub(crate) fn path_query(env: &mut Env, discard: u32, key: &MemberKey) {
    if !env.step.was_pei {
        debug_assert!(
            env.state.chain_ui.is_none(),
            "overlapping access chains at {:?}",
            env.id
        );
        let mut ui = env
            .state
            .stack
            .last()
            .expect("path query with empty stack")
            .clone();
        if !ui.is_linked() {
            if ui.usage.mask_use() == Use::NOT {
                let may_read = env.step.may_read_locals;
                add_loc_gen_set(env, &may_read);
                ui.actions.insert(env.id, Action::new(ActionKind::Kill));
                // The location field doubles as scratch here: remember the
                // final's index so the base step can look its arity up.
                ui.location.id = env.id.idx;
                env.state.chain_ui = Some(ui);
            } else if let Some(value) = env
                .step
                .after_top
                .as_ref()
                .filter(|ty| !ty.could_be(Caps::REF | Caps::UNINIT))
                .and_then(|ty| ty.literal.clone())
            {
                let may_read = env.step.may_read_locals;
                add_loc_gen_set(env, &may_read);
                env.state
                    .replace_map
                    .insert(env.id, smallvec::smallvec![crate::dce::transfer::constant_instr(value)]);
                ui.actions.insert(env.id, Action::new(ActionKind::Replace));
                ui.location.id = env.id.idx;
                env.state.chain_ui = Some(ui);
            }
        }
    }
    path_final(env, discard, key);
}

/// Applies an adjustment mask to a depth operand: each set bit below the
/// depth is one eliminated slot the depth must skip over.
pub(crate) fn adjust_depth(depth: &mut u32, mask: u32) {
    let mut i = (*depth).min(Action::MASK_BITS);
    while i > 0 {
        i -= 1;
        if (mask >> i) & 1 != 0 {
            *depth -= 1;
        }
    }
}

fn adjust_key(key: &mut MemberKey, mask: u32) {
    if let Some(depth) = key.stack_slot() {
        let mut d = depth;
        adjust_depth(&mut d, mask);
        key.set_stack_slot(d);
    }
}

fn adjust_discard(discard: &mut u32, n_pop: u32, mask: u32) {
    // Widen the counting window past the non-discard operands above the
    // range, apply the mask, then narrow back.
    let widen = n_pop - *discard + 1;
    let mut d = *discard + widen;
    adjust_depth(&mut d, mask);
    *discard = d - widen;
}

/// Rewrites a path instruction's depth operands after slots recorded in
/// `mask` were eliminated.
///
/// # Panics
///
/// Panics when the instruction is not a path operation; adjustment actions
/// are only ever recorded against path steps.
pub(crate) fn adjust_path_instr(op: &mut Opcode, mask: u32) {
    let n_pop = op.pops();
    match op {
        Opcode::PathBaseStack(depth) => adjust_depth(depth, mask),
        Opcode::PathDim(key) => adjust_key(key, mask),
        Opcode::PathQuery { discard, key } | Opcode::PathUnset { discard, key } => {
            adjust_discard(discard, n_pop, mask);
            adjust_key(key, mask);
        }
        Opcode::PathSet { discard, key } => {
            adjust_discard(discard, n_pop, mask);
            adjust_key(key, mask);
        }
        _ => panic!("stack adjustment on non-path instruction {op:?}"),
    }
}
