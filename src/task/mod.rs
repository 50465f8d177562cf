//! Task objects, per-thread runtime state, and the task lifecycle.
//!
//! A task is the unit of cooperative execution: its own stack (dedicated
//! or copied), exception state, gc root frames, and random stream. At any
//! instant a task runs on at most one OS thread; fields only ever touched
//! by that thread live behind an `UnsafeCell`, the cross-thread-visible
//! ones are atomics.

mod switch;

pub use switch::{get_next_task, set_next_task, switch, switchto};

use crate::context::{self, Context};
use crate::exceptions::{self, ExcFrame, HandlerFrame};
use crate::flags::Flags;
use crate::gc::GcFrame;
use crate::log::LogLevel::LogWarn;
use crate::rng::{self, RNG_SIZE};
use crate::stacks;
use crate::value::Value;
use crate::world;
use backtrace::Backtrace;
use rand::RngCore;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

pub type TaskRef = Arc<Task>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum TaskState {
    Runnable = 0,
    Done = 1,
    Failed = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Runnable,
            1 => TaskState::Done,
            _ => TaskState::Failed,
        }
    }
}

/// Which stack a task executes on.
///
/// Exactly one of the two holds for every live task: a dedicated mapping
/// the task owns, or copy mode, where the task borrows the thread's base
/// fiber stack and its used slice is saved into `buf` while suspended.
pub(crate) enum StackMode {
    Dedicated {
        /// Low usable address, null while not yet allocated (the default
        /// size is reserved lazily at the first switch).
        stkbuf: *mut u8,
        bufsz: usize,
        /// The root task views the OS thread stack; it does not own it.
        owned: bool,
    },
    Copy {
        buf: Vec<u8>,
        /// Bytes of `buf` holding the saved slice; 0 when the task has
        /// never been saved.
        saved_len: usize,
    },
}

impl StackMode {
    pub(crate) fn is_copy(&self) -> bool {
        matches!(self, StackMode::Copy { .. })
    }
}

/// Single-owner task state: only the thread currently running (or
/// switching) the task may touch this.
pub(crate) struct TaskInner {
    pub ctx: Context,
    pub stack: StackMode,
    /// The stack has been surrendered; the task can never resume.
    pub stack_released: bool,
    pub excstack: Vec<ExcFrame>,
    pub handlers: Vec<HandlerFrame>,
    pub gcstack: Vec<GcFrame>,
    pub rng_state: [u64; RNG_SIZE],
}

pub struct Task {
    state: AtomicU8,
    is_exception: AtomicBool,
    started: AtomicBool,
    sticky: AtomicBool,
    /// Thread id this task is pinned to, -1 while unpinned.
    tid: AtomicI32,
    threadpoolid: i8,
    world_age: AtomicU64,
    /// Address of the `Ptls` of the thread currently hosting the task, 0
    /// while unscheduled. Per-thread storage is stable for the thread's
    /// lifetime.
    ptls: AtomicUsize,
    /// Inherited dynamic scope.
    pub scope: Value,
    /// Entry function; called with the task itself as its one argument.
    pub start: Value,
    result: Mutex<Value>,
    /// Completion future (or any opaque value) fulfilled by the done hook.
    pub done_notify: Value,
    pub(crate) inner: UnsafeCell<TaskInner>,
}

// Single-owner discipline: `inner` is only accessed by the thread that is
// currently running or switching the task, which the switch protocol
// guarantees; everything else is atomic or immutable.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_exception(&self) -> bool {
        self.is_exception.load(Ordering::Acquire)
    }

    pub(crate) fn set_is_exception(&self, v: bool) {
        self.is_exception.store(v, Ordering::Release);
    }

    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    pub fn threadpool(&self) -> i8 {
        self.threadpoolid
    }

    pub fn sticky(&self) -> bool {
        self.sticky.load(Ordering::Acquire)
    }

    pub fn set_sticky(&self, v: bool) {
        self.sticky.store(v, Ordering::Release);
    }

    pub fn world_age(&self) -> u64 {
        self.world_age.load(Ordering::Acquire)
    }

    pub fn set_world_age(&self, age: u64) {
        debug_assert!(age <= world::world_counter());
        self.world_age.store(age, Ordering::Release);
    }

    pub fn result(&self) -> Value {
        self.result.lock().unwrap().clone()
    }

    pub(crate) fn set_result(&self, v: Value) {
        *self.result.lock().unwrap() = v;
    }

    pub(crate) fn is_copy_stack(&self) -> bool {
        unsafe { (*self.inner.get()).stack.is_copy() }
    }

    /// Pin the task to `tid`. Succeeds if unpinned or already pinned
    /// there; fails (without racing) if pinned elsewhere.
    pub(crate) fn try_set_tid(&self, tid: i32) -> bool {
        match self
            .tid
            .compare_exchange(-1, tid, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == tid,
        }
    }

    pub(crate) fn unpin(&self) {
        self.tid.store(-1, Ordering::Release);
    }

    fn host_ptls(&self) -> Option<*mut Ptls> {
        let p = self.ptls.load(Ordering::Acquire);
        if p == 0 {
            None
        } else {
            Some(p as *mut Ptls)
        }
    }

    pub(crate) fn set_host_ptls(&self, p: Option<*mut Ptls>) {
        self.ptls
            .store(p.map(|p| p as usize).unwrap_or(0), Ordering::Release);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let StackMode::Dedicated {
            stkbuf,
            bufsz,
            owned: true,
        } = inner.stack
        {
            if !stkbuf.is_null() && !inner.stack_released {
                unsafe { stacks::free_stack(stkbuf, bufsz) };
            }
        }
    }
}

/// Per-thread runtime state.
pub(crate) struct Ptls {
    pub tid: i32,
    pub current_task: Option<TaskRef>,
    pub next_task: Option<TaskRef>,
    pub previous_task: Option<TaskRef>,
    pub root_task: Option<TaskRef>,
    /// Top of the thread's base fiber stack, shared by every copy-stack
    /// task on this thread.
    pub stackbase: usize,
    pub stacksize: usize,
    pub base_stack_lo: *mut u8,
    /// Backtrace scratch; owned here until an exception frame takes it.
    pub bt_scratch: Option<Backtrace>,
    pub in_finalizer: bool,
    pub in_pure_callback: bool,
    pub finalizers_inhibited: i32,
    pub defer_signal: u32,
    pub io_wait: bool,
    pub sig_exception: Option<Value>,
    pub safe_restore: Option<*mut Context>,
    /// Names of runtime locks held; must be empty at every switch.
    pub locks: Vec<&'static str>,
    pub timing_depth: usize,
    /// Current source position, updated by line nodes during evaluation.
    pub lineno: u32,
    pub filename: String,
}

impl Ptls {
    fn new() -> Ptls {
        Ptls {
            tid: -1,
            current_task: None,
            next_task: None,
            previous_task: None,
            root_task: None,
            stackbase: 0,
            stacksize: 0,
            base_stack_lo: ptr::null_mut(),
            bt_scratch: None,
            in_finalizer: false,
            in_pure_callback: false,
            finalizers_inhibited: 0,
            defer_signal: 0,
            io_wait: false,
            sig_exception: None,
            safe_restore: None,
            locks: Vec::new(),
            timing_depth: 0,
            lineno: 0,
            filename: String::from("none"),
        }
    }
}

thread_local! {
    static PTLS: UnsafeCell<Ptls> = UnsafeCell::new(Ptls::new());
}

/// Raw pointer to this thread's runtime state. Callers keep borrows short
/// and never hold one across a fiber switch.
pub(crate) fn ptls() -> *mut Ptls {
    PTLS.with(|p| p.get())
}

static NEXT_TID: AtomicI32 = AtomicI32::new(0);
static RUNTIME_INIT: Once = Once::new();

pub fn current_task() -> Option<TaskRef> {
    unsafe { (*ptls()).current_task.clone() }
}

pub fn current_tid() -> i32 {
    unsafe { (*ptls()).tid }
}

pub fn root_task() -> Option<TaskRef> {
    unsafe { (*ptls()).root_task.clone() }
}

pub(crate) fn with_current_inner<R>(f: impl FnOnce(&mut TaskInner) -> R) -> R {
    let ct = current_task().expect("no current task on this thread");
    unsafe { f(&mut *ct.inner.get()) }
}

pub(crate) fn with_current_gcstack<R>(f: impl FnOnce(&mut Vec<GcFrame>) -> R) -> R {
    with_current_inner(|inner| f(&mut inner.gcstack))
}

pub fn with_current_rng<R>(f: impl FnOnce(&mut [u64; RNG_SIZE]) -> R) -> R {
    with_current_inner(|inner| f(&mut inner.rng_state))
}

/// Scoped timing block; the per-task timing state unwinds through this on
/// an exception.
pub struct TimingGuard(());

impl TimingGuard {
    pub fn enter() -> TimingGuard {
        unsafe { (*ptls()).timing_depth += 1 };
        TimingGuard(())
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        unsafe { (*ptls()).timing_depth -= 1 };
    }
}

fn fresh_inner(rng_state: [u64; RNG_SIZE], stack: StackMode, ctx: Context) -> TaskInner {
    TaskInner {
        ctx,
        stack,
        stack_released: false,
        excstack: Vec::new(),
        handlers: Vec::new(),
        gcstack: Vec::new(),
        rng_state,
    }
}

/// Initialize this thread's runtime: assign a thread id, adopt the OS
/// stack as the root task's stack, and reserve the base fiber every
/// copy-stack task on this thread will share. Idempotent per thread.
pub fn init_runtime_thread() -> TaskRef {
    RUNTIME_INIT.call_once(exceptions::install_panic_hook);
    if let Some(root) = unsafe { (*ptls()).root_task.clone() } {
        return root;
    }
    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let (mut stack_lo, mut stack_size) = os_thread_stack();
    if tid == 0 {
        // The main thread's reported bounds exclude its guard region;
        // extend our guess downward to cover it.
        stack_lo = stack_lo.saturating_sub(stacks::ROOT_TASK_STACK_ADJUSTMENT);
        stack_size += stacks::ROOT_TASK_STACK_ADJUSTMENT;
    }

    let mut seed = [0u64; RNG_SIZE];
    let mut trng = rand::thread_rng();
    for word in seed.iter_mut() {
        *word = trng.next_u64();
    }

    let root = Arc::new(Task {
        state: AtomicU8::new(TaskState::Runnable as u8),
        is_exception: AtomicBool::new(false),
        started: AtomicBool::new(true),
        sticky: AtomicBool::new(true),
        tid: AtomicI32::new(tid),
        threadpoolid: 0,
        world_age: AtomicU64::new(1),
        ptls: AtomicUsize::new(0),
        scope: Value::Nothing,
        start: Value::Nothing,
        result: Mutex::new(Value::Nothing),
        done_notify: Value::Nothing,
        inner: UnsafeCell::new(fresh_inner(
            seed,
            StackMode::Dedicated {
                stkbuf: stack_lo as *mut u8,
                bufsz: stack_size,
                owned: false,
            },
            Context::new(),
        )),
    });

    let p = unsafe { &mut *ptls() };
    p.tid = tid;
    root.set_host_ptls(Some(p as *mut Ptls));
    p.current_task = Some(root.clone());
    p.root_task = Some(root.clone());

    // Base fiber from which all copy-stack tasks on this thread run.
    let mut base_size = stacks::DEFAULT_STACK_SIZE;
    match stacks::alloc_stack(&mut base_size) {
        Some(lo) => {
            p.base_stack_lo = lo;
            p.stackbase = lo as usize + base_size;
            p.stacksize = base_size;
        }
        None => {
            log!(LogWarn, "could not reserve a base fiber stack; copy-stack tasks unavailable on this thread");
        }
    }
    root
}

#[cfg(target_os = "linux")]
fn os_thread_stack() -> (usize, usize) {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
            let mut lo: *mut libc::c_void = ptr::null_mut();
            let mut size: libc::size_t = 0;
            let ok = libc::pthread_attr_getstack(&attr, &mut lo, &mut size) == 0;
            libc::pthread_attr_destroy(&mut attr);
            if ok {
                return (lo as usize, size);
            }
        }
    }
    os_thread_stack_fallback()
}

#[cfg(not(target_os = "linux"))]
fn os_thread_stack() -> (usize, usize) {
    os_thread_stack_fallback()
}

fn os_thread_stack_fallback() -> (usize, usize) {
    let fa = context::frame_addr();
    (
        fa.saturating_sub(stacks::DEFAULT_STACK_SIZE),
        stacks::DEFAULT_STACK_SIZE * 2,
    )
}

/// Create a task, RUNNABLE and not yet started.
///
/// `ssize == 0` selects the default: copy-stack mode when enabled
/// process-wide, otherwise a default-sized dedicated stack reserved lazily
/// at the first switch. A nonzero `ssize` requests an eager dedicated
/// stack of at least that size (rounded up to the platform minimum);
/// exhaustion raises the memory error. The child inherits the parent's
/// scope, threadpool and world age, and forks the parent's random stream.
pub fn new_task(start: Value, done_notify: Value, ssize: usize) -> TaskRef {
    let ct = current_task().expect("new_task requires an initialized runtime thread");
    let always_copy = Flags::get().always_copy_stacks;

    let mut ctx = Context::new();
    let (stack, tid, sticky) = if ssize == 0 {
        if always_copy {
            (
                StackMode::Copy {
                    buf: Vec::new(),
                    saved_len: 0,
                },
                current_tid(),
                true,
            )
        } else {
            (
                StackMode::Dedicated {
                    stkbuf: ptr::null_mut(),
                    bufsz: stacks::DEFAULT_STACK_SIZE,
                    owned: true,
                },
                -1,
                false,
            )
        }
    } else {
        let mut bufsz = ssize;
        match context::alloc_fiber(&mut ctx, &mut bufsz, switch::task_start_trampoline) {
            Some(stkbuf) => (
                StackMode::Dedicated {
                    stkbuf,
                    bufsz,
                    owned: true,
                },
                -1,
                false,
            ),
            None => exceptions::throw(Value::Err(Arc::new(crate::value::RtError::Memory))),
        }
    };

    let child_rng = with_current_inner(|inner| {
        let mut child = [0u64; RNG_SIZE];
        rng::split(&mut child, &mut inner.rng_state);
        child
    });

    Arc::new(Task {
        state: AtomicU8::new(TaskState::Runnable as u8),
        is_exception: AtomicBool::new(false),
        started: AtomicBool::new(false),
        sticky: AtomicBool::new(sticky),
        tid: AtomicI32::new(tid),
        threadpoolid: ct.threadpoolid,
        world_age: AtomicU64::new(ct.world_age()),
        ptls: AtomicUsize::new(0),
        scope: ct.scope.clone(),
        start,
        result: Mutex::new(Value::Nothing),
        done_notify,
        inner: UnsafeCell::new(fresh_inner(child_rng, stack, ctx)),
    })
}

/// Pre-mark a never-started task as failed with `exc`; its first entry
/// will synthesize the failure instead of calling the start function.
pub fn fail_task_before_start(t: &TaskRef, exc: Value) {
    assert!(!t.is_started());
    t.set_is_exception(true);
    t.set_result(exc);
}

lazy_static! {
    static ref TASK_DONE_HOOK: Mutex<Option<Value>> = Mutex::new(None);
}

/// Install the hook `finish_task` calls when a task leaves RUNNABLE. The
/// hook receives the finished task and is expected to hand control to the
/// scheduler; it must not return to the finished task.
pub fn register_task_done_hook(hook: Value) {
    *TASK_DONE_HOOK.lock().unwrap() = Some(hook);
}

fn task_done_hook() -> Option<Value> {
    if let Some(hook) = TASK_DONE_HOOK.lock().unwrap().clone() {
        return Some(hook);
    }
    // Fall back to a `task_done_hook` binding in the base module, cached
    // on first resolution.
    let base = crate::module::base_module()?;
    let hook = base.get_global(crate::sym::syms().task_done_hook)?;
    *TASK_DONE_HOOK.lock().unwrap() = Some(hook.clone());
    Some(hook)
}

/// Invoked by the trampoline exactly once per task on natural exit. Seals
/// the task's state, releases a copy-stack buffer early, refreshes the
/// world age, runs the done hook, and never returns.
pub(crate) fn finish_task(ct: &TaskRef) -> ! {
    if ct.is_exception() {
        ct.set_state(TaskState::Failed);
    } else {
        ct.set_state(TaskState::Done);
    }
    unsafe {
        let inner = &mut *ct.inner.get();
        if let StackMode::Copy { buf, saved_len } = &mut inner.stack {
            buf.clear();
            buf.shrink_to_fit();
            *saved_len = 0;
            inner.stack_released = true;
        }
        let p = &mut *ptls();
        p.in_finalizer = false;
        p.in_pure_callback = false;
    }
    ct.set_world_age(world::world_counter());

    if let Some(hook) = task_done_hook() {
        exceptions::try_catch(
            || {
                crate::eval::apply(&hook, &[Value::Task(ct.clone())]);
            },
            |e| exceptions::no_exc_handler(Some(e)),
        );
        // The hook is expected to switch away for good.
        fatal!("task done hook returned to a finished task");
    }
    fatal!("task finished with no done hook installed");
}

/// Inspectable view of a task's stack for profilers: (low address, size,
/// tid). The root task's reported buffer is narrowed by the guard
/// adjustment so the start points at accessible memory.
pub fn task_stack_buffer(t: &TaskRef) -> (usize, usize, i32) {
    let mut off = 0;
    if cfg!(not(target_os = "windows")) {
        let is_root = unsafe {
            (*ptls())
                .root_task
                .as_ref()
                .map(|r| Arc::ptr_eq(r, t))
                .unwrap_or(false)
        };
        if is_root {
            off = stacks::ROOT_TASK_STACK_ADJUSTMENT;
        }
    }
    let mut tid = -1;
    if let Some(host) = t.host_ptls() {
        tid = t.tid();
        let host = unsafe { &*host };
        if t.is_copy_stack() {
            return (host.stackbase - host.stacksize, host.stacksize, tid);
        }
    }
    unsafe {
        let inner = &*t.inner.get();
        match &inner.stack {
            StackMode::Dedicated { stkbuf, bufsz, .. } => {
                (*stkbuf as usize + off, bufsz - off, tid)
            }
            StackMode::Copy { buf, .. } => (buf.as_ptr() as usize, buf.len(), tid),
        }
    }
}

/// The two stack ranges of a started task: the active slice and the total
/// allocation, each as (start, end). Returns zeros for a task with no
/// stack yet.
pub fn active_task_stack(t: &TaskRef) -> ((usize, usize), (usize, usize)) {
    if !t.is_started() {
        return ((0, 0), (0, 0));
    }
    let host = t.host_ptls();
    unsafe {
        let inner = &*t.inner.get();
        let (mut active, total) = match (&inner.stack, host) {
            (StackMode::Copy { .. }, Some(host)) => {
                let host = &*host;
                let range = (host.stackbase - host.stacksize, host.stackbase);
                (range, range)
            }
            (StackMode::Copy { buf, saved_len }, None) => {
                let lo = buf.as_ptr() as usize;
                ((lo, lo + *saved_len), (lo, lo + buf.len()))
            }
            (StackMode::Dedicated { stkbuf, bufsz, .. }, _) if !stkbuf.is_null() => {
                let mut lo = *stkbuf as usize;
                let hi = lo + bufsz;
                let is_root = (*ptls())
                    .root_task
                    .as_ref()
                    .map(|r| Arc::ptr_eq(r, t))
                    .unwrap_or(false);
                if cfg!(not(target_os = "windows")) && is_root {
                    lo += stacks::ROOT_TASK_STACK_ADJUSTMENT;
                }
                ((lo, hi), (lo, hi))
            }
            _ => return ((0, 0), (0, 0)),
        };
        if let Some(ct) = current_task() {
            if Arc::ptr_eq(&ct, t) {
                // Scan only up to the live frame for the running task.
                active.0 = context::frame_addr();
            }
        }
        (active, total)
    }
}
