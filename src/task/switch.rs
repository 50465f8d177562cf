//! The task hand-off.
//!
//! `switch` moves control from the current task to the one the scheduler
//! stored in `ptls.next_task`, covering the four stack-mode combinations
//! plus the first-entry and killed cases. The killed path clears the dead
//! task's roots and exception state before touching any target state and
//! performs no allocation afterwards; its dedicated stack goes back to the
//! pool (never unmapped here, since the switch still executes on it).

use super::{
    current_task, finish_task, ptls, Ptls, StackMode, Task, TaskInner, TaskRef, TaskState,
};
use crate::context::{self, Context};
use crate::exceptions;
use crate::stacks;
use crate::value::Value;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Instrumentation hook points (memory-safety shadow stacks, race-detector
// fibers). The call order is part of the switch contract; instrumented
// builds fill these in.
#[inline(always)]
fn sanitizer_start_switch_fiber(_from: *const Task, _to: *const Task) {}
#[inline(always)]
fn sanitizer_start_switch_fiber_killed(_to: *const Task) {}
#[inline(always)]
fn sanitizer_finish_switch_fiber() {}

/// Stage `t` as the target of the next `switch` on this thread.
pub fn set_next_task(t: &TaskRef) {
    unsafe { (*ptls()).next_task = Some(t.clone()) };
}

/// The staged target, or the current task when nothing is staged.
pub fn get_next_task() -> Option<TaskRef> {
    unsafe { (*ptls()).next_task.clone() }.or_else(current_task)
}

/// Yield to `t`.
pub fn switchto(t: &TaskRef) {
    set_next_task(t);
    switch();
}

/// Hand control to `ptls.next_task`. No-op when the target is the caller.
///
/// Raises on the illegal states of the switch contract: a target whose
/// stack is gone, a caller inside a finalizer or pure callback, or a
/// target pinned to another thread. On return, the caller is current
/// again, the previous task has been unpinned if eligible, and signals
/// deferred across the switch have been checked once.
pub fn switch() {
    unsafe {
        let p = ptls();
        let ct = (*p)
            .current_task
            .clone()
            .expect("switch on a thread with no runtime");
        let t = match (*p).next_task.clone() {
            Some(t) => t,
            None => return,
        };
        if Arc::ptr_eq(&t, &ct) {
            (*p).next_task = None;
            return;
        }
        if t.is_started() && (*t.inner.get()).stack_released {
            (*p).next_task = None;
            exceptions::throw(Value::error("attempt to switch to exited task"));
        }
        if (*p).in_finalizer {
            (*p).next_task = None;
            exceptions::throw(Value::error(
                "task switch not allowed from inside gc finalizer",
            ));
        }
        if (*p).in_pure_callback {
            (*p).next_task = None;
            exceptions::throw(Value::error(
                "task switch not allowed from inside staged nor pure functions",
            ));
        }
        if !t.try_set_tid((*p).tid) {
            (*p).next_task = None;
            exceptions::throw(Value::error(
                "cannot switch to task running on another thread",
            ));
        }
        drop(t);

        // Stash scoped thread state across the switch.
        let defer_signal = (*p).defer_signal;
        let finalizers_inhibited = (*p).finalizers_inhibited;
        (*p).finalizers_inhibited = 0;

        ctx_switch(&ct);

        // Resumed. Only thread-local and heap state is trustworthy here;
        // re-fetch the pointer rather than reusing pre-switch derivations.
        let p = ptls();
        if let Some(prev) = (*p).previous_task.take() {
            if !prev.sticky() && !prev.is_copy_stack() {
                // Publish the yielded task for pickup by its pool.
                prev.unpin();
            }
        }
        debug_assert!((*p)
            .current_task
            .as_ref()
            .map(|c| Arc::ptr_eq(c, &ct))
            .unwrap_or(false));
        (*p).finalizers_inhibited = finalizers_inhibited;
        let other_defer = (*p).defer_signal;
        (*p).defer_signal = defer_signal;
        if other_defer != 0 && defer_signal == 0 {
            // A signal arrived while deferred; take the safepoint now.
            crate::gc::safepoint();
        }
    }
}

unsafe fn ctx_switch(lastt: &TaskRef) {
    let p = &mut *ptls();
    let t = p.next_task.clone().expect("ctx_switch with no next task");
    assert!(!Arc::ptr_eq(&t, lastt));
    assert!(
        p.locks.is_empty(),
        "task switch with runtime locks held: {:?}",
        p.locks
    );

    let killed = lastt.state() != TaskState::Runnable;
    let t_ptr: *const Task = Arc::as_ptr(&t);
    let t_inner = &mut *(*t_ptr).inner.get();
    let last_ptr: *const Task = Arc::as_ptr(lastt);
    let last_inner = &mut *(*last_ptr).inner.get();

    if !t.is_started() {
        // May need to allocate the target's stack.
        let mut fallback_to_copy = false;
        if let StackMode::Dedicated {
            stkbuf,
            bufsz,
            owned,
        } = &mut t_inner.stack
        {
            if stkbuf.is_null() {
                debug_assert!(*owned);
                let mut size = *bufsz;
                match context::alloc_fiber(&mut t_inner.ctx, &mut size, task_start_trampoline) {
                    Some(buf) => {
                        *stkbuf = buf;
                        *bufsz = size;
                    }
                    None => fallback_to_copy = true,
                }
            }
        }
        if fallback_to_copy {
            if p.base_stack_lo.is_null() {
                p.next_task = None;
                exceptions::throw(Value::Err(Arc::new(crate::value::RtError::Memory)));
            }
            // One-shot fallback to stack copying when the mapping fails.
            t_inner.stack = StackMode::Copy {
                buf: Vec::new(),
                saved_len: 0,
            };
            t.set_sticky(true);
        }
        if t_inner.stack.is_copy() && p.base_stack_lo.is_null() {
            p.next_task = None;
            exceptions::throw(Value::Err(Arc::new(crate::value::RtError::Memory)));
        }
    }

    if killed {
        // Can't fail after here: the dead task surrenders its roots and
        // exception state, then its stack.
        p.next_task = None;
        last_inner.gcstack.clear();
        last_inner.handlers.clear();
        last_inner.excstack.clear();
        match &mut last_inner.stack {
            StackMode::Dedicated {
                stkbuf,
                bufsz,
                owned: true,
            } if !stkbuf.is_null() && !last_inner.stack_released => {
                // Early release back to the pool; this switch still runs
                // on that stack, so it must stay mapped.
                stacks::release_stack_to_pool(*stkbuf, *bufsz);
                last_inner.stack_released = true;
            }
            _ => {
                last_inner.stack_released = true;
            }
        }
    } else if last_inner.stack.is_copy() {
        if save_stack_and_capture(p, lastt, last_inner) {
            // Resumed: our slice is back on the base fiber stack.
            sanitizer_finish_switch_fiber();
            return;
        }
    } else {
        p.next_task = None;
    }

    // Set up global state for the new task, clear it for the old one.
    (*t_ptr).set_host_ptls(Some(p as *mut Ptls));
    let started = t.is_started();
    let last_arc = p.current_task.replace(t);
    p.previous_task = last_arc;
    (*last_ptr).set_host_ptls(None);

    let last_is_copy = last_inner.stack.is_copy();
    if started {
        if t_inner.stack.is_copy() {
            if !killed && !last_is_copy {
                sanitizer_start_switch_fiber(last_ptr, t_ptr);
                restore_stack_from_dedicated(p, t_inner, last_inner);
            } else {
                if killed {
                    sanitizer_start_switch_fiber_killed(t_ptr);
                } else {
                    sanitizer_start_switch_fiber(last_ptr, t_ptr);
                }
                let (src, nb) = copy_stack_slice(t_inner);
                let dst_lo = p.stackbase - nb;
                let ctx = &t_inner.ctx as *const Context;
                if last_is_copy {
                    // Same native stack underneath both tasks; walk our
                    // frame below the region before overwriting it.
                    restore_stack_recurse(src, nb, dst_lo, ctx)
                } else {
                    // The dead task's dedicated stack cannot overlap the
                    // base fiber region.
                    ptr::copy_nonoverlapping(src, dst_lo as *mut u8, nb);
                    context::set_fiber(&*ctx)
                }
            }
        } else {
            if killed {
                sanitizer_start_switch_fiber_killed(t_ptr);
                context::set_fiber(&t_inner.ctx)
            } else {
                sanitizer_start_switch_fiber(last_ptr, t_ptr);
                if last_is_copy {
                    // The resume point was captured during the save above.
                    context::set_fiber(&t_inner.ctx)
                } else {
                    context::swap_fiber(&mut last_inner.ctx, &t_inner.ctx);
                }
            }
        }
    } else {
        // First entry into the target.
        if t_inner.stack.is_copy() {
            if killed {
                sanitizer_start_switch_fiber_killed(t_ptr);
                start_base_fiber(p)
            } else {
                sanitizer_start_switch_fiber(last_ptr, t_ptr);
                if last_is_copy {
                    // Our resume point was captured during the save above.
                    start_base_fiber(p)
                } else if !context::capture(&mut last_inner.ctx) {
                    start_base_fiber(p)
                }
                // Resumed.
            }
        } else {
            if killed {
                sanitizer_start_switch_fiber_killed(t_ptr);
                context::start_fiber_set(&t_inner.ctx)
            } else {
                sanitizer_start_switch_fiber(last_ptr, t_ptr);
                if last_is_copy {
                    context::start_fiber_set(&t_inner.ctx)
                } else {
                    context::start_fiber_swap(&mut last_inner.ctx, &t_inner.ctx);
                }
            }
        }
    }
    sanitizer_finish_switch_fiber();
}

fn copy_stack_slice(t_inner: &TaskInner) -> (*const u8, usize) {
    match &t_inner.stack {
        StackMode::Copy { buf, saved_len } => {
            assert!(*saved_len > 0 && *saved_len <= buf.len());
            (buf.as_ptr(), *saved_len)
        }
        StackMode::Dedicated { .. } => unreachable!("restore of a dedicated-stack task"),
    }
}

/// Save the used slice of the base fiber stack into the suspending task's
/// buffer (growing it on demand), then capture the resume point. Returns
/// `false` on the direct path and `true` when the task is later resumed.
#[inline(never)]
unsafe fn save_stack_and_capture(p: &mut Ptls, lastt: &Task, last_inner: &mut TaskInner) -> bool {
    let frame = context::frame_addr() & !15;
    let stackbase = p.stackbase;
    assert!(
        stackbase > frame && frame > stackbase - p.stacksize,
        "copy-stack task is not running on this thread's base fiber"
    );
    let nb = stackbase - frame;
    {
        let (buf, saved_len) = match &mut last_inner.stack {
            StackMode::Copy { buf, saved_len } => (buf, saved_len),
            StackMode::Dedicated { .. } => unreachable!("saving a dedicated-stack task"),
        };
        if buf.len() < nb {
            buf.resize(nb, 0);
        }
        *saved_len = nb;
    }
    lastt.sticky.store(true, Ordering::Release);
    // Clear the gc root for the target before the copy; nothing below may
    // fail.
    p.next_task = None;
    let buf_ptr = match &mut last_inner.stack {
        StackMode::Copy { buf, .. } => buf.as_mut_ptr(),
        StackMode::Dedicated { .. } => unreachable!(),
    };
    ptr::copy_nonoverlapping(frame as *const u8, buf_ptr, nb);
    context::capture(&mut last_inner.ctx)
}

/// Dedicated-stack task hands off to a suspended copy-stack task: restore
/// the slice (no overlap with this frame), capture the resume point, jump.
unsafe fn restore_stack_from_dedicated(p: &mut Ptls, t_inner: &TaskInner, last_inner: &mut TaskInner) {
    debug_assert!(t_inner.stack.is_copy() && !last_inner.stack.is_copy());
    let (src, nb) = copy_stack_slice(t_inner);
    let dst_lo = p.stackbase - nb;
    ptr::copy_nonoverlapping(src, dst_lo as *mut u8, nb);
    if !context::capture(&mut last_inner.ctx) {
        context::set_fiber(&t_inner.ctx);
    }
    // Resumed.
}

/// Restore a saved slice onto the stack this function is itself running
/// on. Descend by recursion until this frame sits strictly below the
/// destination region, so the copy cannot clobber a live frame; only then
/// overwrite and jump. The descent is required for correctness, not an
/// optimization.
#[inline(never)]
unsafe fn restore_stack_recurse(src: *const u8, nb: usize, dst_lo: usize, ctx: *const Context) -> ! {
    if context::frame_addr() + 512 >= dst_lo {
        let mut pad = [0u8; 4096];
        // Volatile so the pad (and with it, this frame's extent) survives
        // optimization.
        ptr::write_volatile(pad.as_mut_ptr(), 0);
        ptr::write_volatile(pad.as_mut_ptr().add(4095), 0);
        restore_stack_recurse(src, nb, dst_lo, ctx)
    } else {
        ptr::copy_nonoverlapping(src, dst_lo as *mut u8, nb);
        context::set_fiber(&*ctx)
    }
}

unsafe fn start_base_fiber(p: &Ptls) -> ! {
    debug_assert!(!p.base_stack_lo.is_null());
    let top = (p.stackbase & !(context::STACK_ALIGNMENT - 1)) as *mut u8;
    context::start_raw(top, task_start_trampoline)
}

/// The function a fresh fiber enters. Runs the task body under a catch,
/// records the result or the escaping exception, and seals the task.
pub(crate) extern "C" fn task_start_trampoline() -> ! {
    sanitizer_finish_switch_fiber();
    unsafe {
        let p = &mut *ptls();
        if let Some(prev) = p.previous_task.take() {
            if !prev.sticky() && !prev.is_copy_stack() {
                prev.unpin();
            }
        }
    }
    let ct = current_task().expect("task trampoline on a thread with no runtime");
    ct.started.store(true, Ordering::Release);

    if ct.is_exception() {
        // Killed before it started; synthesize the failure.
        exceptions::push_synthetic_exception(ct.result());
    } else {
        unsafe {
            let p = &mut *ptls();
            if p.defer_signal != 0 {
                p.defer_signal = 0;
                crate::gc::safepoint();
            }
        }
        let start = ct.start.clone();
        let arg = Value::Task(ct.clone());
        let outcome = exceptions::try_catch(
            move || Ok(crate::eval::apply(&start, &[arg])),
            |e| Err(e.clone()),
        );
        match outcome {
            Ok(v) => ct.set_result(v),
            Err(e) => {
                ct.set_result(e);
                ct.set_is_exception(true);
            }
        }
    }
    finish_task(&ct)
}
