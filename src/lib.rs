// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # deadwood
//!
//! A type-aware, whole-program dead-code elimination engine for stack-based
//! bytecode. `deadwood` removes instructions whose results are provably
//! never observed (dead stack pushes, dead stores to locals) while
//! preserving exactly the program's externally observable behavior:
//! teardown side effects, warnings on uninitialized reads, and exceptional
//! control flow.
//!
//! ## Features
//!
//! - **Backward, type-aware analysis** - per-slot use tracking over the
//!   evaluation stack, driven by abstract-interpreter facts
//! - **Whole-function fixed point** - dead stores fall across block
//!   boundaries, with a forced-live safety net for divergent paths
//! - **Peephole rewrites unlocked by DCE** - array-builder chains collapse
//!   into single constructions, local reads downgrade to moves, known path
//!   queries become literals
//! - **Deterministic rewriting** - an ordered action map replayed in one
//!   pass, preserving source positions and never leaving a block empty
//! - **Parallel batch driver** - independent functions optimized
//!   concurrently with no shared mutable state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deadwood::{global_dce, bytecode::Function, facts::FunctionFacts};
//!
//! # fn load() -> (Function, FunctionFacts) { unimplemented!() }
//! let (mut func, facts) = load();
//!
//! // Analyze, rewrite in place, and drop locals never found live.
//! let reshaped = global_dce(&mut func, &facts)?;
//! if reshaped {
//!     // Array-builder rewrites changed stack shapes; recompute the facts
//!     // before running further fact-dependent passes.
//! }
//! # Ok::<(), deadwood::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`bytecode`] - the instruction catalog, literal values, and the
//!   function/block/local storage the rewrites mutate
//! - [`facts`] - the abstract-interpreter results consumed read-only:
//!   per-point types, raise flags, may-read sets, local equivalences
//! - [`cfg`] - reverse postorder and predecessor views over block edges
//! - [`dce`] - the analysis itself: use lattice, per-opcode transfer
//!   function, block walker, fixed-point driver, action applicator
//!
//! The two passes are re-exported at the crate root: [`local_dce`] for a
//! single block under conservative exit assumptions, [`global_dce`] for
//! the whole function (plus [`global_dce_all`] to fan out over many).
//!
//! ## Soundness model
//!
//! Elimination decisions never rely on information the facts cannot
//! prove. A store stays when overwriting the old value could be observed
//! (teardown, reference aliasing); a read stays when it could warn; a pure
//! computation dies only with a no-raise proof; and everything with
//! unknown side effects falls into a conservative default that keeps it
//! and everything it might read alive. Runs of either pass are idempotent:
//! a second pass over the same function finds nothing left to remove.

pub mod bytecode;
pub mod cfg;
pub mod dce;
pub mod facts;

mod error;

pub use dce::{global_dce, global_dce_all, local_dce};
pub use error::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
