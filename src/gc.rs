//! The collector contract.
//!
//! The garbage collector is an external collaborator; the task core only
//! maintains per-task root frames (so a paused task's live set stays
//! reachable from its saved stack state) and forwards the three hook
//! points a precise collector needs.

use crate::value::Value;
use std::sync::Mutex;

/// External collector hooks. All defaults are no-ops.
pub trait Collector: Send + Sync {
    /// A value was stored into a heap object; old-generation bookkeeping.
    fn write_barrier(&self, _parent: &Value, _child: &Value) {}
    /// A point where the mutator may be paused for a collection.
    fn safepoint(&self) {}
}

struct NopCollector;
impl Collector for NopCollector {}

lazy_static! {
    static ref COLLECTOR: Mutex<&'static dyn Collector> = Mutex::new(&NopCollector);
}

pub fn register_collector(c: &'static dyn Collector) {
    *COLLECTOR.lock().unwrap() = c;
}

pub fn write_barrier(parent: &Value, child: &Value) {
    COLLECTOR.lock().unwrap().write_barrier(parent, child);
}

pub fn safepoint() {
    COLLECTOR.lock().unwrap().safepoint();
}

/// A frame of named roots on the current task's shadow stack. Pushed when
/// native code holds values the collector could not otherwise see; popped
/// on drop, including on unwind.
pub struct GcFrame {
    pub roots: Vec<Value>,
}

pub struct RootGuard {
    depth: usize,
}

pub fn push_roots(roots: Vec<Value>) -> RootGuard {
    let depth = crate::task::with_current_gcstack(|stack| {
        stack.push(GcFrame { roots });
        stack.len()
    });
    RootGuard { depth }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        crate::task::with_current_gcstack(|stack| {
            debug_assert_eq!(stack.len(), self.depth);
            stack.pop();
        });
    }
}
