//! Machine context capture/restore and fresh-stack entry.
//!
//! One context flavor is built per platform: a setjmp-style register file
//! saved/restored by a small assembly stub per CPU. Three primitives:
//!
//! - `capture`: record the caller's resumption point; reports whether it
//!   returned directly (false) or via a later `jump` (true).
//! - `jump`: resume a captured context. Never returns.
//! - `start`: abandon the current machine state and enter a prepared,
//!   never-started context at its trampoline. Never returns.
//!
//! The new stack is entered with a 16-byte-aligned stack pointer and a
//! terminated frame (null return address, cleared frame pointer) so
//! unwinders stop at the fiber boundary. If the entry function returns the
//! stub traps.

use crate::stacks;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

/// Register slots owned by the assembly stubs. Large enough for the widest
/// supported register file (aarch64: x19-x28, fp, lr, sp, d8-d15).
const CTX_NREGS: usize = 24;

pub const STACK_ALIGNMENT: usize = 16;

/// A machine context. `regs` must stay at offset 0; the stubs address it
/// directly. The remaining fields describe a prepared-but-unstarted fiber:
/// where its stack lives and which trampoline `start` enters.
#[repr(C)]
pub struct Context {
    regs: [u64; CTX_NREGS],
    stack_lo: *mut u8,
    stack_size: usize,
    entry: usize,
}

// aarch64 needs 21 slots; x86_64 needs 8.
const_assert!(CTX_NREGS * 8 >= 168);

extern "C" {
    fn weft_capture_context(ctx: *mut Context) -> usize;
    fn weft_jump_context(ctx: *const Context) -> !;
    fn weft_start_context(stack_top: *mut u8, entry: usize) -> !;
}

impl Context {
    pub fn new() -> Context {
        Context {
            regs: [0; CTX_NREGS],
            stack_lo: std::ptr::null_mut(),
            stack_size: 0,
            entry: 0,
        }
    }

    pub fn stack_top(&self) -> *mut u8 {
        let top = self.stack_lo as usize + self.stack_size;
        (top & !(STACK_ALIGNMENT - 1)) as *mut u8
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

/// Reserve a stack of at least `*ssize` bytes (rounded up to the platform
/// minimum) and prepare `ctx` to begin execution at `entry` on it. Returns
/// the low address of the usable region, or `None` on exhaustion.
pub fn alloc_fiber(
    ctx: &mut Context,
    ssize: &mut usize,
    entry: extern "C" fn() -> !,
) -> Option<*mut u8> {
    let stk = stacks::alloc_stack(ssize)?;
    ctx.stack_lo = stk;
    ctx.stack_size = *ssize;
    ctx.entry = entry as usize;
    Some(stk)
}

/// Record the current resumption point into `ctx`.
///
/// Returns `false` on the direct return and `true` when some later
/// `jump`/`set_fiber` resumes the context. As with `setjmp`, locals
/// modified between the capture and the jump must not be consulted on the
/// resumed return; re-read state from thread-local or heap storage instead.
#[inline]
pub fn capture(ctx: &mut Context) -> bool {
    unsafe { weft_capture_context(ctx as *mut Context) != 0 }
}

/// Resume an already-captured context. The captured frame, and every frame
/// below it, must still be intact on its stack.
pub unsafe fn set_fiber(ctx: &Context) -> ! {
    weft_jump_context(ctx as *const Context)
}

/// Suspend the caller into `save` and resume `resume`. Returns when another
/// actor later resumes `save`.
pub unsafe fn swap_fiber(save: &mut Context, resume: &Context) {
    if !capture(save) {
        weft_jump_context(resume as *const Context);
    }
}

/// Abandon the current machine state and enter the prepared context at its
/// trampoline. The context must have been set up by `alloc_fiber` and never
/// started.
pub unsafe fn start_fiber_set(ctx: &Context) -> ! {
    debug_assert!(ctx.entry != 0 && !ctx.stack_lo.is_null());
    weft_start_context(ctx.stack_top(), ctx.entry)
}

/// Suspend the caller into `save` and enter the prepared context `new` at
/// its trampoline.
pub unsafe fn start_fiber_swap(save: &mut Context, new: &Context) {
    if !capture(save) {
        start_fiber_set(new);
    }
}

/// Enter `entry` on an explicit stack top, without a prepared context.
/// Used to (re)start the per-thread base fiber that copy-stack tasks share.
pub unsafe fn start_raw(stack_top: *mut u8, entry: extern "C" fn() -> !) -> ! {
    debug_assert_eq!(stack_top as usize % STACK_ALIGNMENT, 0);
    weft_start_context(stack_top, entry as usize)
}

/// Address of the current stack frame, used for stack-extent bookkeeping
/// and the copy-stack save/restore routines.
#[inline(never)]
pub fn frame_addr() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ENTERED: AtomicUsize = AtomicUsize::new(0);
    static mut RETURN_CTX: Option<Context> = None;

    extern "C" fn entry_once() -> ! {
        ENTERED.fetch_add(1, Ordering::SeqCst);
        unsafe {
            match RETURN_CTX.as_ref() {
                Some(ctx) => set_fiber(ctx),
                None => std::process::abort(),
            }
        }
    }

    #[test]
    fn regs_sit_at_offset_zero() {
        // The stubs address the register file through the struct base.
        assert_eq!(memoffset::offset_of!(Context, regs), 0);
    }

    #[test]
    fn start_and_return_via_captured_context() {
        let mut ssize = 0;
        let mut fiber = Context::new();
        alloc_fiber(&mut fiber, &mut ssize, entry_once).expect("stack allocation failed");
        assert!(ssize >= stacks::MIN_STACK_SIZE);

        unsafe {
            RETURN_CTX = Some(Context::new());
            let save: *mut Context = match RETURN_CTX.as_mut() {
                Some(ctx) => ctx,
                None => unreachable!(),
            };
            start_fiber_swap(&mut *save, &fiber);
            RETURN_CTX = None;
        }
        assert_eq!(ENTERED.load(Ordering::SeqCst), 1);
        unsafe {
            stacks::free_stack(fiber.stack_lo, fiber.stack_size);
        }
    }
}
