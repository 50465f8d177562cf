//! weft — the core of a dynamic-language execution runtime.
//!
//! Symmetric-coroutine tasks with dedicated or copied stacks, per-task
//! exception stacks layered over non-local jumps, task-local xoshiro256++
//! streams with collision-resistant forking, and the top-level evaluator
//! and module resolver that run on the task machinery. The garbage
//! collector, code generator, parser and scheduler policy are external
//! collaborators behind registered hooks.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod context;
pub mod dump;
pub mod eval;
pub mod exceptions;
pub mod flags;
pub mod gc;
pub mod module;
pub mod rng;
pub mod stacks;
pub mod sym;
pub mod task;
pub mod value;
pub mod world;

pub use eval::{
    eval_flex, load_file, parse_eval_all, register_compiler, register_parser, toplevel_eval,
    toplevel_eval_in,
};
pub use exceptions::{rethrow, rethrow_other, sig_throw, throw, try_catch};
pub use module::{init_main_module, Module};
pub use task::{
    current_task, init_runtime_thread, new_task, register_task_done_hook, set_next_task, switch,
    switchto, Task, TaskRef, TaskState,
};
pub use value::{Expr, Value};
