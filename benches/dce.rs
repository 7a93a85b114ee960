//! Benchmarks for the whole-function elimination pass.

use criterion::{criterion_group, criterion_main, Criterion};

use std::hint::black_box;

use deadwood::bytecode::{Block, Function, Instr, Opcode};
use deadwood::facts::{AbstractTy, BlockFacts, FunctionFacts, StepFacts};
use deadwood::global_dce;

/// A straight-line block of `n` dead store pairs followed by a return:
/// every other store is overwritten before being read.
fn dead_store_chain(n: usize) -> (Function, FunctionFacts) {
    let mut instrs = Vec::with_capacity(n * 2 + 2);
    for i in 0..n {
        instrs.push(Instr::new(Opcode::Int(i as i64)));
        instrs.push(Instr::new(Opcode::AssignLocal(0)));
    }
    instrs.push(Instr::new(Opcode::Null));
    instrs.push(Instr::new(Opcode::Ret));

    let mut steps = Vec::with_capacity(instrs.len());
    let mut depth = 0usize;
    for instr in &instrs {
        steps.push(StepFacts {
            stack_before: vec![AbstractTy::scalar(); depth],
            locals_before: vec![AbstractTy::scalar()],
            after_top: Some(AbstractTy::scalar()),
            ..StepFacts::default()
        });
        depth = depth + instr.op.pushes() as usize - instr.op.pops() as usize;
    }

    let func = Function {
        blocks: vec![Block {
            instrs,
            ..Block::default()
        }],
        locals: vec![deadwood::bytecode::Local::named("x")],
        ..Function::default()
    };
    let facts = FunctionFacts {
        blocks: vec![Some(BlockFacts {
            steps,
            exit_depth: 0,
        })],
    };
    (func, facts)
}

fn bench_global_dce(c: &mut Criterion) {
    let (func, facts) = dead_store_chain(200);
    c.bench_function("global_dce/dead_store_chain_200", |b| {
        b.iter(|| {
            let mut f = func.clone();
            global_dce(black_box(&mut f), black_box(&facts)).unwrap();
            f
        });
    });
}

criterion_group!(benches, bench_global_dce);
criterion_main!(benches);
