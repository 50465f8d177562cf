//! Copy-stack mode: tasks sharing the per-thread base fiber stack, with
//! their used slice saved to a heap buffer at each suspension.
//!
//! This binary opts into copy-stack mode through the environment before
//! the runtime reads its flags.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use weft::task::{self, active_task_stack};
use weft::{
    init_runtime_thread, new_task, register_task_done_hook, switchto, TaskRef, TaskState, Value,
};

lazy_static! {
    static ref TASKS: Mutex<HashMap<&'static str, TaskRef>> = Mutex::new(HashMap::new());
}

fn reg(key: &'static str, t: &TaskRef) {
    TASKS.lock().unwrap().insert(key, t.clone());
}

fn get(key: &str) -> TaskRef {
    TASKS.lock().unwrap().get(key).unwrap().clone()
}

fn done_hook(_args: &[Value]) -> Value {
    let root = task::root_task().unwrap();
    switchto(&root);
    unreachable!("resumed a finished task");
}

fn setup() {
    std::env::set_var("WEFT_COPY_STACKS", "1");
    init_runtime_thread();
    register_task_done_hook(Value::Func(done_hook));
}

/// Recurse `frames` page-sized frames deep, yield once at the bottom, and
/// unwind. The volatile accesses keep every pad frame live across the
/// yield so the saved slice really spans the recursion.
fn deep_yield(frames: usize) {
    if frames == 0 {
        let root = task::root_task().unwrap();
        switchto(&root);
        return;
    }
    let mut pad = [0u8; 4096];
    unsafe { std::ptr::write_volatile(pad.as_mut_ptr(), frames as u8) };
    deep_yield(frames - 1);
    unsafe { std::ptr::read_volatile(pad.as_ptr()) };
}

fn grow_body(_args: &[Value]) -> Value {
    deep_yield(2);
    deep_yield(6);
    deep_yield(16);
    Value::Int(1)
}

#[test]
fn saved_slice_grows_with_the_live_stack() {
    setup();
    let t = new_task(Value::Func(grow_body), Value::Nothing, 0);
    // Copy-stack tasks are pinned from birth.
    assert!(t.sticky());
    assert_eq!(t.tid(), task::current_tid());

    let mut saved_sizes = Vec::new();
    for _ in 0..3 {
        switchto(&t);
        let ((active_lo, active_hi), (total_lo, total_hi)) = active_task_stack(&t);
        let saved = active_hi - active_lo;
        let capacity = total_hi - total_lo;
        assert!(
            capacity >= saved,
            "buffer capacity {} below saved slice {}",
            capacity,
            saved
        );
        saved_sizes.push(saved);
    }
    // Each yield happened deeper than the last.
    assert!(saved_sizes[0] >= 2 * 4096);
    assert!(saved_sizes[1] > saved_sizes[0]);
    assert!(saved_sizes[2] > saved_sizes[1]);
    assert!(saved_sizes[2] >= 16 * 4096);

    switchto(&t);
    assert_eq!(t.state(), TaskState::Done);
    assert_eq!(t.result(), Value::Int(1));
}

static COPY_VISITS: AtomicUsize = AtomicUsize::new(0);

fn copy_ping(_args: &[Value]) -> Value {
    for _ in 0..2 {
        COPY_VISITS.fetch_add(1, Ordering::SeqCst);
        switchto(&get("cp_b"));
    }
    Value::Int(10)
}

fn copy_pong(_args: &[Value]) -> Value {
    for _ in 0..2 {
        COPY_VISITS.fetch_add(1, Ordering::SeqCst);
        switchto(&get("cp_a"));
    }
    Value::Int(20)
}

#[test]
fn copy_tasks_switch_between_each_other() {
    setup();
    let a = new_task(Value::Func(copy_ping), Value::Nothing, 0);
    let b = new_task(Value::Func(copy_pong), Value::Nothing, 0);
    reg("cp_a", &a);
    reg("cp_b", &b);

    switchto(&a);
    // a finished; drive b to completion.
    assert_eq!(a.state(), TaskState::Done);
    switchto(&b);
    assert_eq!(b.state(), TaskState::Done);
    assert_eq!(a.result(), Value::Int(10));
    assert_eq!(b.result(), Value::Int(20));
    assert_eq!(COPY_VISITS.load(Ordering::SeqCst), 4);
}

#[test]
fn explicit_size_still_gets_a_dedicated_stack() {
    setup();
    // A requested size opts out of copy mode even when it is the default.
    let t = new_task(Value::Func(grow_body), Value::Nothing, 1 << 20);
    let (_, size, _) = weft::task::task_stack_buffer(&t);
    assert!(size >= 1 << 20);
    assert!(!t.sticky());
}
