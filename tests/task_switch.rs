//! Switching scenarios on dedicated stacks: ping-pong, stack sizing,
//! pre-start failure, cross-thread pinning.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use weft::task::{self, active_task_stack, fail_task_before_start, task_stack_buffer};
use weft::{
    init_runtime_thread, new_task, register_task_done_hook, switchto, try_catch, TaskRef,
    TaskState, Value,
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

/// Finished tasks hand control back to the driving (root) task.
fn done_hook(_args: &[Value]) -> Value {
    let root = task::root_task().unwrap();
    switchto(&root);
    unreachable!("resumed a finished task");
}

fn setup() {
    init_runtime_thread();
    register_task_done_hook(Value::Func(done_hook));
}

static VISITS_A: AtomicUsize = AtomicUsize::new(0);
static VISITS_B: AtomicUsize = AtomicUsize::new(0);

fn ping_body(_args: &[Value]) -> Value {
    for _ in 0..4 {
        VISITS_A.fetch_add(1, Ordering::SeqCst);
        switchto(&get("pp_b"));
    }
    VISITS_A.fetch_add(1, Ordering::SeqCst);
    Value::Nothing
}

fn pong_body(_args: &[Value]) -> Value {
    for _ in 0..4 {
        VISITS_B.fetch_add(1, Ordering::SeqCst);
        switchto(&get("pp_a"));
    }
    VISITS_B.fetch_add(1, Ordering::SeqCst);
    Value::Nothing
}

#[test]
fn ping_pong_runs_five_visits_each() {
    setup();
    let a = new_task(Value::Func(ping_body), Value::Nothing, 0);
    let b = new_task(Value::Func(pong_body), Value::Nothing, 0);
    reg("pp_a", &a);
    reg("pp_b", &b);

    switchto(&a);
    // A ran to completion; B is still suspended in its final yield.
    assert_eq!(a.state(), TaskState::Done);
    assert_eq!(b.state(), TaskState::Runnable);
    switchto(&b);

    assert_eq!(a.state(), TaskState::Done);
    assert_eq!(b.state(), TaskState::Done);
    assert_eq!(a.result(), Value::Nothing);
    assert_eq!(b.result(), Value::Nothing);
    assert_eq!(VISITS_A.load(Ordering::SeqCst), 5);
    assert_eq!(VISITS_B.load(Ordering::SeqCst), 5);
}

fn yield_once_body(_args: &[Value]) -> Value {
    let root = task::root_task().unwrap();
    switchto(&root);
    Value::Int(11)
}

#[test]
fn default_stack_is_the_dedicated_default_size() {
    setup();
    let t = new_task(Value::Func(yield_once_body), Value::Nothing, 0);
    switchto(&t);
    // Started and suspended: the lazily reserved stack has the default size.
    let (_, size, _) = task_stack_buffer(&t);
    assert_eq!(size, weft::stacks::DEFAULT_STACK_SIZE);
    let ((active_lo, active_hi), (total_lo, total_hi)) = active_task_stack(&t);
    assert!(total_lo < total_hi);
    assert!(active_lo >= total_lo && active_hi <= total_hi);
    switchto(&t);
    assert_eq!(t.state(), TaskState::Done);
    assert_eq!(t.result(), Value::Int(11));
}

#[test]
fn undersized_stack_request_rounds_up() {
    setup();
    let t = new_task(Value::Func(yield_once_body), Value::Nothing, 4096);
    let (_, size, _) = task_stack_buffer(&t);
    assert!(size >= weft::stacks::MIN_STACK_SIZE);
}

fn never_runs(_args: &[Value]) -> Value {
    panic!("start function of a pre-failed task was called");
}

#[test]
fn task_killed_before_start_synthesizes_its_failure() {
    setup();
    let t = new_task(Value::Func(never_runs), Value::Nothing, 0);
    fail_task_before_start(&t, Value::str("cancelled"));
    switchto(&t);
    assert_eq!(t.state(), TaskState::Failed);
    assert!(t.is_exception());
    assert_eq!(t.result(), Value::str("cancelled"));
}

fn throwing_body(_args: &[Value]) -> Value {
    weft::throw(Value::str("task boom"));
}

#[test]
fn uncaught_throw_fails_the_task() {
    setup();
    let t = new_task(Value::Func(throwing_body), Value::Nothing, 0);
    switchto(&t);
    assert_eq!(t.state(), TaskState::Failed);
    assert!(t.is_exception());
    assert_eq!(t.result(), Value::str("task boom"));
}

#[test]
fn cannot_switch_to_a_task_pinned_to_another_thread() {
    setup();
    let (task_tx, task_rx) = mpsc::channel::<TaskRef>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let owner = std::thread::spawn(move || {
        setup();
        let t = new_task(Value::Func(yield_once_body), Value::Nothing, 0);
        t.set_sticky(true);
        switchto(&t);
        // t is suspended, sticky, and pinned to this thread.
        task_tx.send(t).unwrap();
        release_rx.recv().unwrap();
    });

    let t = task_rx.recv().unwrap();
    assert!(t.tid() >= 0);
    assert_ne!(t.tid(), task::current_tid());
    let msg = try_catch(
        || {
            switchto(&t);
            String::new()
        },
        |e| format!("{}", e),
    );
    assert!(
        msg.contains("another thread"),
        "unexpected error message: {}",
        msg
    );
    release_tx.send(()).unwrap();
    owner.join().unwrap();
}

#[test]
fn runtime_dump_reports_this_thread() {
    setup();
    let json = weft::dump::dump_runtime();
    assert!(json.contains("\"tid\""));
    assert!(json.contains("\"currentTask\""));
    assert!(json.contains("runnable"));
}
