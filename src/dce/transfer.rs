//! The per-opcode transfer function of the backward walk.
//!
//! [`dispatch`] maps every opcode to exactly one handler. The default
//! policy, [`no_dce`], is fully conservative: all popped values are used,
//! every local the instruction might read becomes live, and the
//! instruction itself is never eliminated. Anything with unknown or
//! complex side effects (calls, globals, iterators, memoization, output,
//! control flow) takes that arm.
//!
//! The specialized handlers implement the per-category policies: literal
//! pushes die freely when unused, pure computations additionally need a
//! no-raise proof, duplication folds by case analysis, local accesses
//! weigh warning-on-read and teardown-on-write observability, and the
//! array-append chain collapses into a single construction when its final
//! shape is statically known.
//!
//! Note on the `popConds` idiom: instructions that push a value whose
//! lifetime matters rely on the *consumer* of that value to refuse
//! elimination. A discard that would drop the last reference to a
//! teardown-observable value marks itself unremovable, which in turn keeps
//! the producer alive.

use smallvec::smallvec;

use crate::bytecode::{BinOp, Instr, LocalId, Opcode, Value};
use crate::dce::action::{Action, ActionKind};
use crate::dce::locals::{
    add_loc_gen, add_loc_gen_set, add_loc_kill, is_loc_live, loc_ty, read_teardown_locals,
    schedule_gen_loc, set_loc_could_have_side_effects,
};
use crate::dce::path::{path_base, path_dim, path_final, path_query};
use crate::dce::state::{
    discard, num_pop, num_push, pop_inputs, pop_used, push_outputs, stack_ops1, stack_ops2, Env,
    PushFlags,
};
use crate::dce::use_info::{Use, UseInfo};
use crate::facts::{set_op_could_raise, ArrayKind, Caps};

/// Largest element count an array-builder chain is collapsed to; beyond
/// this the single-construction form would not fit its operands on the
/// stack comfortably.
const MAX_CHAIN_ELEMS: u32 = 64;

/// Base classification says the slot is unconditionally unused.
fn unused(ui: &UseInfo) -> bool {
    ui.usage.mask_use() == Use::NOT
}

/// The instruction push for a known constant.
pub(crate) fn constant_instr(value: Value) -> Instr {
    let op = match value {
        Value::Int(i) => Opcode::Int(i),
        Value::Dbl(d) => Opcode::Dbl(d),
        Value::Str(s) => Opcode::Str(s),
        Value::Bool(true) => Opcode::True,
        Value::Bool(false) => Opcode::False,
        Value::Null => Opcode::Null,
        Value::Arr(a) => Opcode::LitArr(a),
    };
    Instr::new(op)
}

/// Removes the instruction outright, leaving the stack untouched. Only
/// legal for pop-n/push-n instructions whose deletion makes the values
/// flow through unchanged.
fn mark_dead(env: &mut Env) {
    log::trace!("     killing {:?}", env.id);
    env.state
        .action_map
        .insert(env.id, Action::new(ActionKind::Kill));
}

/// The conservative fallback policy.
pub(crate) fn no_dce(env: &mut Env) {
    let may_read = env.step.may_read_locals;
    add_loc_gen_set(env, &may_read);
    push_outputs(env, num_push(env));
    pop_inputs(env, num_pop(env));
}

/// A pure push with no failure mode: dies whenever its value is unused.
fn push_removable(env: &mut Env) {
    stack_ops1(env, |_env, ui| {
        if unused(ui) {
            PushFlags::MarkUnused
        } else {
            PushFlags::MarkLive
        }
    });
}

/// A pure push that can raise: dies only with a no-raise proof.
fn push_removable_if_no_throw(env: &mut Env) {
    stack_ops1(env, |env, ui| {
        if !env.step.was_pei && unused(ui) {
            PushFlags::MarkUnused
        } else {
            PushFlags::MarkLive
        }
    });
}

/// Duplication: four-way case analysis over (duplicate used?, original
/// used?). The duplicate is never the last reference to its value, so
/// dropping it when unused is always lifetime-neutral.
fn dup(env: &mut Env) {
    stack_ops2(env, |env, dup_ui, orig| {
        let dup_unused = unused(dup_ui);
        let orig_unused = unused(orig) && (!dup_ui.is_linked() || dup_unused);

        if dup_unused && orig_unused {
            // Both chains fold away; the producer decides its own fate.
            return PushFlags::MarkUnused;
        }
        if dup_unused {
            // Fold only the duplicate; the original's need stands.
            crate::dce::state::mark_uis_live(env, orig.is_linked(), std::slice::from_ref(orig));
            orig.actions.clear();
            return PushFlags::MarkDead;
        }
        if orig_unused {
            // Symmetric: the copy survives as the single value.
            crate::dce::state::mark_uis_live(env, false, std::slice::from_ref(dup_ui));
            dup_ui.actions.clear();
            return PushFlags::MarkDead;
        }
        PushFlags::MarkLive
    });
}

/// Copy-read of a local. Unused reads die unless reading itself warns;
/// live reads of a dying, hazard-free local downgrade to the move form,
/// which skips the copy.
fn get_local(env: &mut Env, loc: LocalId, quiet: bool) {
    let ty = loc_ty(env, loc);
    stack_ops1(env, move |env, ui| {
        schedule_gen_loc(env, loc);
        if unused(ui) && (quiet || !ty.read_observable()) {
            return PushFlags::MarkUnused;
        }
        if !is_loc_live(env, loc)
            && !set_loc_could_have_side_effects(env, loc, false)
            && !ty.read_observable()
            && !env.func.is_volatile_local(loc)
        {
            // The move form leaves the local unset, so it must not be one
            // whose read could warn, regardless of `quiet`.
            let id = env.id;
            env.state
                .replace_map
                .insert(id, smallvec![Instr::new(Opcode::MoveLocal(loc))]);
            env.state
                .action_map
                .entry(id)
                .or_insert(Action::new(ActionKind::Replace));
        }
        PushFlags::MarkLive
    });
}

/// Move-read of a local. An unused move still unsets its source, so when
/// the local stays live the move degrades to an explicit unset.
fn move_local(env: &mut Env, loc: LocalId) {
    stack_ops1(env, move |env, ui| {
        schedule_gen_loc(env, loc);
        if unused(ui) {
            if is_loc_live(env, loc) {
                let id = env.id;
                env.state
                    .replace_map
                    .insert(id, smallvec![Instr::new(Opcode::UnsetLocal(loc))]);
                ui.actions
                    .entry(id)
                    .or_insert(Action::new(ActionKind::Replace));
            }
            return PushFlags::MarkUnused;
        }
        PushFlags::MarkLive
    });
}

/// Copy-read inserted beneath the current top: the analysis-arity view
/// consumes the displaced top and produces both slots.
fn get_local_under(env: &mut Env, loc: LocalId) {
    let ty = loc_ty(env, loc);
    stack_ops2(env, move |env, u1, u2| {
        schedule_gen_loc(env, loc);
        if ty.read_observable() || !(unused(u1) && unused(u2)) {
            return PushFlags::MarkLive;
        }
        PushFlags::MarkUnused
    });
}

/// Store that pushes its value back. Deleting it entirely is a stack
/// pass-through; degrading it keeps the store but drops the push.
fn set_local(env: &mut Env, loc: LocalId) {
    let effects = set_loc_could_have_side_effects(env, loc, false);
    if !is_loc_live(env, loc) && !effects {
        debug_assert!(!loc_ty(env, loc).could_be(Caps::REF));
        return mark_dead(env);
    }
    stack_ops1(env, move |env, ui| {
        if !unused(ui) {
            return PushFlags::MarkLive;
        }
        // The pushed copy is unused: degrade to the assign-only form.
        let id = env.id;
        env.state
            .replace_map
            .insert(id, smallvec![Instr::new(Opcode::AssignLocal(loc))]);
        ui.actions.insert(id, Action::new(ActionKind::Replace));
        PushFlags::MarkDead
    });
    if effects || loc_ty(env, loc).could_be(Caps::REF) {
        add_loc_gen(env, loc);
    } else {
        add_loc_kill(env, loc);
    }
}

/// Pop-store with no push.
fn assign_local(env: &mut Env, loc: LocalId) {
    let effects = set_loc_could_have_side_effects(env, loc, false);
    if !is_loc_live(env, loc) && !effects {
        debug_assert!(!loc_ty(env, loc).could_be(Caps::REF));
        discard(env);
        env.state
            .action_map
            .insert(env.id, Action::new(ActionKind::PopInputs));
        return;
    }
    pop_used(env);
    if effects || loc_ty(env, loc).could_be(Caps::REF) {
        add_loc_gen(env, loc);
    } else {
        add_loc_kill(env, loc);
    }
}

fn unset_local(env: &mut Env, loc: LocalId) {
    let old = loc_ty(env, loc);
    if old.caps == Caps::UNINIT {
        // Already definitely unset.
        return mark_dead(env);
    }
    let effects = set_loc_could_have_side_effects(env, loc, false);
    if !is_loc_live(env, loc) && !effects {
        return mark_dead(env);
    }
    if effects {
        add_loc_gen(env, loc);
    } else {
        add_loc_kill(env, loc);
    }
}

/// Read-modify-write: dead only when the local dies here, nothing about
/// the read, write, or modify step is observable, and the pushed value is
/// unused.
fn inc_dec_local(env: &mut Env, loc: LocalId) {
    let old = loc_ty(env, loc);
    let effects = set_loc_could_have_side_effects(env, loc, false)
        || old.read_observable()
        || env.step.was_pei;
    stack_ops1(env, move |env, ui| {
        schedule_gen_loc(env, loc);
        if !is_loc_live(env, loc) && !effects && unused(ui) {
            PushFlags::MarkUnused
        } else {
            PushFlags::MarkLive
        }
    });
}

/// Compound assignment into a local. Unlike the plain store it consumes an
/// operand it does not re-push, but once the operand types pass the raise
/// analysis it is safe to kill outright.
fn set_op_local(env: &mut Env, loc: LocalId, op: BinOp) {
    let old = loc_ty(env, loc);
    let rhs = env.step.top(0).clone();
    stack_ops1(env, move |env, ui| {
        schedule_gen_loc(env, loc);
        if !is_loc_live(env, loc)
            && unused(ui)
            && !set_loc_could_have_side_effects(env, loc, false)
            && !old.read_observable()
            && !set_op_could_raise(op, &old, &rhs)
        {
            return PushFlags::MarkUnused;
        }
        PushFlags::MarkLive
    });
}

fn is_type_local(env: &mut Env, loc: LocalId) {
    let ty = loc_ty(env, loc);
    stack_ops1(env, move |env, ui| {
        schedule_gen_loc(env, loc);
        if unused(ui) && !ty.read_observable() && !env.step.was_pei {
            PushFlags::MarkUnused
        } else {
            PushFlags::MarkLive
        }
    });
}

/// Fresh empty array: a plain removable push, and a valid terminus for an
/// append chain (the chain's construction replaces it wholesale).
fn new_dict(env: &mut Env) {
    stack_ops1(env, |env, ui| {
        if ui.usage == Use::ELEM_CHAIN || unused(ui) {
            env.state.did_elem_opts = true;
            PushFlags::MarkUnused
        } else {
            PushFlags::MarkLive
        }
    });
}

/// Literal array push. As an append-chain base its elements are exploded
/// into individual constant pushes feeding the collapsed construction.
fn lit_arr(env: &mut Env, arr: &crate::bytecode::ArrayLit) {
    let values: Vec<Value> = arr.values().cloned().collect();
    stack_ops1(env, move |env, ui| {
        if unused(ui) {
            return PushFlags::MarkUnused;
        }
        if ui.usage != Use::ELEM_CHAIN {
            return PushFlags::MarkLive;
        }
        debug_assert!(!env.state.is_local);
        if values.is_empty() {
            env.state.did_elem_opts = true;
            return PushFlags::MarkUnused;
        }
        let id = env.id;
        let replacement = values.iter().cloned().map(constant_instr).collect();
        env.state.replace_map.insert(id, replacement);
        ui.actions.insert(id, Action::new(ActionKind::Replace));
        env.state.did_elem_opts = true;
        PushFlags::MarkUnused
    });
}

/// Append one element. The workhorse of chain recognition: decides whether
/// the chain keeps growing, collapses to a single construction here, or
/// aborts to the conservative policy.
fn add_elem(env: &mut Env) {
    stack_ops1(env, |env, ui| {
        // A raising append must stay.
        if env.step.was_pei {
            return PushFlags::MarkLive;
        }
        if unused(ui) {
            return PushFlags::MarkUnused;
        }
        if env.state.is_local {
            // Collapsing changes stack shapes mid-function, which
            // invalidates the interpreter facts; only the whole-function
            // pass, which triggers a re-derivation, may do it.
            return PushFlags::MarkLive;
        }

        let Some(arr_post) = env.step.after_top.clone() else {
            return PushFlags::MarkLive;
        };
        let post_size = arr_post.shape.as_ref().and_then(|s| s.len);
        let pre_size = env
            .step
            .top(2)
            .shape
            .as_ref()
            .and_then(|s| s.len);
        if post_size.is_none() || post_size == pre_size {
            // Unknown count, or a duplicate key silently replaced an
            // element; the runtime check must stay.
            return PushFlags::MarkLive;
        }
        let post_size = post_size.expect("checked above");

        if ui.usage == Use::ELEM_CHAIN {
            return PushFlags::AddElem;
        }

        if let Some(Value::Arr(lit)) = arr_post.literal {
            // The whole result is a known constant.
            let id = env.id;
            env.state
                .replace_map
                .insert(id, smallvec![constant_instr(Value::Arr(lit))]);
            ui.actions.insert(id, Action::new(ActionKind::PopAndReplace));
            return PushFlags::MarkUnused;
        }

        if ui.is_linked() {
            return PushFlags::MarkLive;
        }

        let Some(shape) = arr_post.shape else {
            return PushFlags::MarkLive;
        };
        match shape.kind {
            ArrayKind::Struct(keys) if post_size <= MAX_CHAIN_ELEMS => {
                let id = env.id;
                env.state
                    .replace_map
                    .insert(id, smallvec![Instr::new(Opcode::NewStruct(keys))]);
                ui.actions.insert(id, Action::new(ActionKind::Replace));
                PushFlags::AddElem
            }
            ArrayKind::Packed if post_size <= MAX_CHAIN_ELEMS => {
                let id = env.id;
                env.state
                    .replace_map
                    .insert(id, smallvec![Instr::new(Opcode::NewVec(post_size))]);
                ui.actions.insert(id, Action::new(ActionKind::Replace));
                PushFlags::AddElem
            }
            _ => PushFlags::MarkLive,
        }
    });
}

/// Direct construction from stacked elements. The single-element case is
/// special: killing the constructor and leaving its element on the stack
/// never changes the element's lifetime.
fn new_array_like(env: &mut Env) {
    if env.op.pops() == 1
        && !env.step.was_pei
        && env.state.stack.last().is_some_and(unused)
    {
        return mark_dead(env);
    }
    push_removable_if_no_throw(env);
}

/// Function exits tear down every local; the teardown of anything
/// observable is an effect the exit makes live.
fn exit_like(env: &mut Env) {
    pop_used(env);
    read_teardown_locals(env);
}

/// Runs the transfer function for one instruction.
pub(crate) fn dispatch(env: &mut Env) {
    let op = env.op;
    match op {
        // Discards.
        Opcode::Pop => discard(env),

        // Literal pushes.
        Opcode::Int(_)
        | Opcode::Dbl(_)
        | Opcode::Str(_)
        | Opcode::True
        | Opcode::False
        | Opcode::Null => push_removable(env),
        Opcode::NewDict => new_dict(env),
        Opcode::LitArr(arr) => lit_arr(env, arr),

        Opcode::Dup => dup(env),

        // Locals.
        Opcode::GetLocal(l) => get_local(env, *l, false),
        Opcode::GetLocalQuiet(l) => get_local(env, *l, true),
        Opcode::GetLocalUnder(l) => get_local_under(env, *l),
        Opcode::MoveLocal(l) => move_local(env, *l),
        Opcode::SetLocal(l) => set_local(env, *l),
        Opcode::AssignLocal(l) => assign_local(env, *l),
        Opcode::UnsetLocal(l) => unset_local(env, *l),
        Opcode::IncDecLocal(l, _) => inc_dec_local(env, *l),
        Opcode::SetOpLocal(l, bin) => set_op_local(env, *l, *bin),
        Opcode::IsTypeLocal(l, _) => is_type_local(env, *l),

        // Pure computations: removable with a no-raise proof.
        Opcode::Binary(_)
        | Opcode::Unary(_)
        | Opcode::Cast(_)
        | Opcode::ConcatN(_)
        | Opcode::IsTypeC(_) => push_removable_if_no_throw(env),

        // Array building.
        Opcode::AddElem => add_elem(env),
        Opcode::NewStruct(_) | Opcode::NewVec(_) => new_array_like(env),

        // Access paths.
        Opcode::PathBaseStack(depth) => path_base(env, *depth),
        Opcode::PathBaseLocal(_) => no_dce(env),
        Opcode::PathDim(key) => path_dim(env, key),
        Opcode::PathQuery { discard, key } => path_query(env, *discard, key),
        Opcode::PathSet { discard, key } | Opcode::PathUnset { discard, key } => {
            path_final(env, *discard, key);
        }

        // Exits that tear down the frame.
        Opcode::Ret | Opcode::Throw | Opcode::Fatal => exit_like(env),
        Opcode::Exit => {
            stack_ops1(env, |_env, _ui| PushFlags::MarkLive);
            read_teardown_locals(env);
        }

        // Everything with unknown or complex side effects: the
        // conservative policy.
        Opcode::Call(_)
        | Opcode::Print
        | Opcode::GetGlobal
        | Opcode::SetGlobal
        | Opcode::This
        | Opcode::CheckThis
        | Opcode::IterInit(_)
        | Opcode::IterNext(_)
        | Opcode::IterFree(_)
        | Opcode::MemoGet { .. }
        | Opcode::MemoSet
        | Opcode::Silence
        | Opcode::Nop
        | Opcode::Jmp
        | Opcode::JmpZ
        | Opcode::JmpNZ => no_dce(env),
    }
}
