//! Per-task exception stacks layered over non-local jumps.
//!
//! Each task owns an ordered stack of in-flight exceptions, each frame
//! bundling the thrown value with the backtrace captured at the throw
//! site, plus a stack of active handler frames. The low-level jump that
//! carries control to the nearest handler is the unwind (a private panic
//! payload caught at the handler frame), so destructors on the skipped
//! frames still run. The two places that must not unwind — the
//! safe-restore slot installed by signal-level callers, and copy-stack
//! resumption — use a raw context jump instead.

use crate::context;
use crate::task::{current_task, ptls, with_current_inner, Task};
use crate::value::Value;
use backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// One in-flight exception: the thrown value and where it was thrown.
pub struct ExcFrame {
    pub value: Value,
    pub backtrace: Arc<Backtrace>,
}

/// An open catch region. The jump target is the enclosing handler's
/// catch-unwind scope; the frame records the state the unwind must restore.
pub struct HandlerFrame {
    /// Timing-stack depth at handler entry; every block opened after this
    /// is closed before the handler runs.
    pub timing_depth: usize,
}

/// Panic payload marking an unwind owned by the exception machinery.
struct ThrowToken;

/// Keep the default panic reporter quiet about exception unwinds; every
/// other panic still reports as usual. Installed once at runtime init.
pub(crate) fn install_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if info.payload().downcast_ref::<ThrowToken>().is_none() {
            default_hook(info);
        }
    }));
}

/// Capture a backtrace into the per-thread scratch slot. The scratch keeps
/// the capture alive until an exception frame takes ownership of it.
fn record_backtrace() {
    let p = unsafe { &mut *ptls() };
    p.bt_scratch = Some(Backtrace::new_unresolved());
}

fn take_backtrace() -> Arc<Backtrace> {
    let p = unsafe { &mut *ptls() };
    match p.bt_scratch.take() {
        Some(bt) => Arc::new(bt),
        None => Arc::new(Backtrace::new_unresolved()),
    }
}

/// Record a failure on the current task's exception stack without
/// unwinding: the trampoline uses this to synthesize the exception of a
/// task killed before it started.
pub(crate) fn push_synthetic_exception(value: Value) {
    record_backtrace();
    let backtrace = take_backtrace();
    with_current_inner(|inner| inner.excstack.push(ExcFrame { value, backtrace }));
}

/// Uncaught-exception reporter: print the value and its backtrace, then
/// abort. `None` reports the exception at the top of the current task's
/// stack (the rethrow case).
pub fn no_exc_handler(e: Option<&Value>) -> ! {
    eprintln!("fatal: error thrown and no exception handler available.");
    let top;
    let e = match e {
        Some(e) => e,
        None => {
            top = current_exception();
            &top
        }
    };
    eprintln!("{}", e);
    let bt = match current_task() {
        Some(_) => with_current_inner(|inner| inner.excstack.last().map(|f| f.backtrace.clone())),
        None => None,
    };
    if let Some(bt) = bt {
        let mut resolved = (*bt).clone();
        resolved.resolve();
        eprintln!("{:?}", resolved);
    }
    std::process::abort();
}

fn throw_internal(ct: &Arc<Task>, exception: Option<Value>) -> ! {
    debug_assert!(unsafe { (*ptls()).safe_restore.is_none() });
    debug_assert!(current_task()
        .map(|c| Arc::ptr_eq(&c, ct))
        .unwrap_or(false));
    {
        let p = unsafe { &mut *ptls() };
        p.io_wait = false;
    }
    if let Some(exception) = exception {
        let backtrace = take_backtrace();
        with_current_inner(|inner| {
            inner.excstack.push(ExcFrame {
                value: exception,
                backtrace,
            });
        });
    }
    let has_handler = with_current_inner(|inner| {
        assert!(
            !inner.excstack.is_empty(),
            "unwinding with an empty exception stack"
        );
        !inner.handlers.is_empty()
    });
    if has_handler {
        // Timing blocks and other scoped state opened since the handler
        // frame unwind through their drop guards.
        panic::panic_any(ThrowToken);
    }
    no_exc_handler(None)
}

/// Throw `e` on the active task: capture a backtrace, push an exception
/// frame, and unwind to the nearest handler. Aborts via the uncaught
/// reporter when no handler is installed.
pub fn throw(e: Value) -> ! {
    if let Some(restore) = unsafe { (*ptls()).safe_restore } {
        unsafe { context::set_fiber(&*restore) };
    }
    let ct = match current_task() {
        Some(ct) => ct,
        // During startup, or on an unmanaged thread.
        None => no_exc_handler_unmanaged(&e),
    };
    record_backtrace();
    throw_internal(&ct, Some(e))
}

fn no_exc_handler_unmanaged(e: &Value) -> ! {
    eprintln!("fatal: error thrown and no exception handler available.");
    eprintln!("{}", e);
    std::process::abort();
}

/// Re-enter the unwind with the current top-of-stack exception. Only legal
/// inside a catch.
pub fn rethrow() -> ! {
    let ct = current_task().expect("rethrow outside the runtime");
    let in_catch = with_current_inner(|inner| !inner.excstack.is_empty());
    if !in_catch {
        throw(Value::error("rethrow() not allowed outside a catch block"));
    }
    throw_internal(&ct, None)
}

/// Replace the top exception value, keeping its backtrace, and re-enter the
/// unwind. Only legal inside a catch.
pub fn rethrow_other(e: Value) -> ! {
    let ct = current_task().expect("rethrow outside the runtime");
    let replaced = with_current_inner(|inner| match inner.excstack.last_mut() {
        Some(frame) => {
            frame.value = e.clone();
            true
        }
        None => false,
    });
    if !replaced {
        throw(Value::error("rethrow(exc) not allowed outside a catch block"));
    }
    throw_internal(&ct, None)
}

/// The path taken after returning from a signal handler: the exception
/// value was left in `ptls.sig_exception` by the handler, and this runs on
/// the normal stack so the throw may allocate its frames safely.
pub fn sig_throw() -> ! {
    if let Some(restore) = unsafe { (*ptls()).safe_restore } {
        unsafe { context::set_fiber(&*restore) };
    }
    let ct = current_task().expect("signal delivered to an unmanaged thread");
    let e = {
        let p = unsafe { &mut *ptls() };
        p.sig_exception
            .take()
            .expect("sig_throw with no pending signal exception")
    };
    throw_internal(&ct, Some(e))
}

/// Deliver an asynchronous exception the way the signal handler does:
/// stash the value, to be raised by `sig_throw` once control is back on
/// the normal stack.
pub fn deliver_sig_exception(e: Value) {
    record_backtrace();
    let p = unsafe { &mut *ptls() };
    p.sig_exception = Some(e);
}

/// Install a safe-restore jump target for low-level callers probing
/// whether a jump is safe; `throw` and `sig_throw` jump straight into it,
/// bypassing the exception stack. Returns the previous slot.
pub unsafe fn set_safe_restore(ctx: Option<*mut context::Context>) -> Option<*mut context::Context> {
    let p = &mut *ptls();
    std::mem::replace(&mut p.safe_restore, ctx)
}

/// The value at the top of the current task's exception stack, or
/// `Nothing` outside any catch.
pub fn current_exception() -> Value {
    with_current_inner(|inner| {
        inner
            .excstack
            .last()
            .map(|f| f.value.clone())
            .unwrap_or(Value::Nothing)
    })
}

pub fn exception_stack_depth() -> usize {
    with_current_inner(|inner| inner.excstack.len())
}

/// Open a catch region around `body`. On a throw from the body's dynamic
/// extent, the handler runs with the exception stack one frame taller than
/// at entry; the extra frames are popped when the handler returns
/// normally. Non-exception panics pass through untouched.
pub fn try_catch<R>(body: impl FnOnce() -> R, handler: impl FnOnce(&Value) -> R) -> R {
    let timing_depth = unsafe { (*ptls()).timing_depth };
    let entry_depth = with_current_inner(|inner| {
        inner.handlers.push(HandlerFrame { timing_depth });
        inner.excstack.len()
    });
    let result = panic::catch_unwind(AssertUnwindSafe(body));
    with_current_inner(|inner| {
        let frame = inner.handlers.pop();
        debug_assert!(frame.is_some(), "handler frame stack underflow");
    });
    match result {
        Ok(v) => v,
        Err(payload) => {
            if payload.is::<ThrowToken>() {
                debug_assert_eq!(unsafe { (*ptls()).timing_depth }, timing_depth);
                let exc = current_exception();
                let r = handler(&exc);
                // Leaving the catch: the handled frames are dead.
                with_current_inner(|inner| inner.excstack.truncate(entry_depth));
                r
            } else {
                panic::resume_unwind(payload)
            }
        }
    }
}
