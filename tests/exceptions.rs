//! Exception-stack behavior: handler entry, rethrow identity, the
//! asynchronous (signal) path, and the safe-restore slot.

use weft::exceptions::{
    current_exception, deliver_sig_exception, exception_stack_depth, set_safe_restore, sig_throw,
};
use weft::{init_runtime_thread, rethrow, rethrow_other, throw, try_catch, Value};

fn setup() {
    init_runtime_thread();
}

#[test]
fn throw_enters_the_nearest_handler_once() {
    setup();
    let depth_before = exception_stack_depth();
    let (observed_depth, caught) = try_catch(
        || throw(Value::str("boom")),
        |e| (exception_stack_depth(), e.clone()),
    );
    assert_eq!(caught, Value::str("boom"));
    // One frame taller inside the handler, restored on exit.
    assert_eq!(observed_depth, depth_before + 1);
    assert_eq!(exception_stack_depth(), depth_before);
}

#[test]
fn rethrow_reaches_the_outer_handler_with_the_same_value() {
    setup();
    let observed = try_catch(
        || {
            try_catch(
                || -> (usize, Value) { throw(Value::str("x")) },
                |_inner| rethrow(),
            )
        },
        |e| (exception_stack_depth(), e.clone()),
    );
    assert_eq!(observed, (1, Value::str("x")));
}

#[test]
fn rethrow_is_idempotent_within_a_catch() {
    setup();
    try_catch(
        || throw(Value::str("e")),
        |first| {
            for _ in 0..3 {
                let again = try_catch(|| rethrow(), |e| e.clone());
                assert_eq!(again, *first);
                assert_eq!(current_exception(), *first);
            }
            Value::Nothing
        },
    );
}

#[test]
fn rethrow_other_replaces_the_top_value() {
    setup();
    let caught = try_catch(
        || throw(Value::str("original")),
        |_| try_catch(|| rethrow_other(Value::str("replacement")), |e| e.clone()),
    );
    assert_eq!(caught, Value::str("replacement"));
}

#[test]
fn nested_throws_stack_and_unwind_in_order() {
    setup();
    let result = try_catch(
        || {
            try_catch(
                || throw(Value::Int(1)),
                |inner| {
                    // A fresh throw from inside the catch stacks on top.
                    assert_eq!(*inner, Value::Int(1));
                    throw(Value::Int(2))
                },
            )
        },
        |outer| outer.clone(),
    );
    assert_eq!(result, Value::Int(2));
    assert_eq!(exception_stack_depth(), 0);
}

#[test]
fn sig_throw_raises_the_pending_signal_exception() {
    setup();
    let caught = try_catch(
        || {
            deliver_sig_exception(Value::str("interrupt"));
            sig_throw()
        },
        |e| e.clone(),
    );
    assert_eq!(caught, Value::str("interrupt"));
}

#[test]
fn safe_restore_bypasses_the_exception_stack() {
    setup();
    let depth_before = exception_stack_depth();
    let mut ctx = weft::context::Context::new();
    if !weft::context::capture(&mut ctx) {
        unsafe { set_safe_restore(Some(&mut ctx as *mut _)) };
        throw(Value::str("never recorded"));
    }
    // Jumped straight back here: no handler ran, nothing was pushed.
    unsafe { set_safe_restore(None) };
    assert_eq!(exception_stack_depth(), depth_before);
}

#[test]
fn foreign_panics_pass_through_untouched() {
    setup();
    let result = std::panic::catch_unwind(|| {
        try_catch(|| -> i32 { panic!("not an exception") }, |_| 0)
    });
    assert!(result.is_err());
}
