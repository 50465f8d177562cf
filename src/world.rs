//! The global world counter and per-task age snapshots.
//!
//! The counter advances (release) whenever the set of globally visible
//! definitions grows; a task samples it (acquire) into its own `world_age`
//! before re-entering user code and restores the previous snapshot on the
//! way out, so nested evaluations observe a monotonic view.

use crate::task::{current_task, Task};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static WORLD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// World age frozen for `require` during incremental output generation.
/// `u64::MAX` means "not frozen".
pub static REQUIRE_WORLD: AtomicU64 = AtomicU64::new(u64::MAX);

pub fn world_counter() -> u64 {
    WORLD_COUNTER.load(Ordering::Acquire)
}

/// Advance the counter after a new definition becomes visible; returns the
/// new value.
pub fn bump_world_counter() -> u64 {
    WORLD_COUNTER.fetch_add(1, Ordering::Release) + 1
}

/// Scoped world-age raise: sets the task's age to the current counter (or
/// an explicit age) and restores the previous snapshot on drop, including
/// on unwind.
pub struct WorldAgeGuard {
    task: Arc<Task>,
    prev: u64,
}

impl WorldAgeGuard {
    pub fn enter_latest(task: &Arc<Task>) -> WorldAgeGuard {
        WorldAgeGuard::enter_at(task, world_counter())
    }

    pub fn enter_at(task: &Arc<Task>, age: u64) -> WorldAgeGuard {
        let prev = task.world_age();
        task.set_world_age(age);
        WorldAgeGuard {
            task: task.clone(),
            prev,
        }
    }
}

impl Drop for WorldAgeGuard {
    fn drop(&mut self) {
        self.task.set_world_age(self.prev);
    }
}

/// Run `f` with the current task's age raised to the latest world.
pub fn with_latest_world<R>(f: impl FnOnce() -> R) -> R {
    match current_task() {
        Some(ct) => {
            let _age = WorldAgeGuard::enter_latest(&ct);
            f()
        }
        None => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic() {
        let a = world_counter();
        let b = bump_world_counter();
        assert!(b > a);
        assert!(world_counter() >= b);
    }
}
