//! Fiber stack allocation.
//!
//! Stacks are anonymous private mappings with a PROT_NONE guard page at the
//! low end (stacks grow down into the guard). Requests below the platform
//! minimum are rounded up; all sizes are rounded to page granularity.

use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use std::ptr;
use std::sync::Mutex;

/// Finishing a task and the guard reserve both need headroom; nothing
/// smaller than this is ever handed out.
pub const MIN_STACK_SIZE: usize = 131072;

/// Default dedicated-stack size when the creator does not ask for one.
pub const DEFAULT_STACK_SIZE: usize = 4 << 20;

/// Reported stack bounds of the main thread are extended downward by this
/// much to cover the guard pages below the OS-reported base. Sanitizer
/// builds must override this to 0; the shadow mapping makes the guess wrong.
#[cfg(not(target_os = "windows"))]
pub const ROOT_TASK_STACK_ADJUSTMENT: usize = 3_000_000;
#[cfg(target_os = "windows")]
pub const ROOT_TASK_STACK_ADJUSTMENT: usize = 0;

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

lazy_static! {
    // Stacks surrendered by terminated tasks. A terminal switch still
    // executes on the stack it is releasing, so released stacks must stay
    // mapped; they are recycled instead of unmapped.
    static ref STACK_POOL: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());
}

/// Return a stack to the recycle pool without unmapping it.
pub fn release_stack_to_pool(lo: *mut u8, size: usize) {
    STACK_POOL.lock().unwrap().push((lo as usize, size));
}

fn take_from_pool(want: usize) -> Option<(usize, usize)> {
    let mut pool = STACK_POOL.lock().unwrap();
    let idx = pool.iter().position(|&(_, size)| size >= want)?;
    Some(pool.swap_remove(idx))
}

fn round_up(v: usize, to: usize) -> usize {
    (v + to - 1) & !(to - 1)
}

/// Map a stack of at least `*ssize` bytes. On success `*ssize` holds the
/// usable size and the returned pointer is the low usable address (the
/// guard page sits just below it). `None` on address-space exhaustion.
pub fn alloc_stack(ssize: &mut usize) -> Option<*mut u8> {
    let page = page_size();
    let usable = round_up((*ssize).max(MIN_STACK_SIZE), page);
    if let Some((lo, size)) = take_from_pool(usable) {
        *ssize = size;
        return Some(lo as *mut u8);
    }
    let total = usable + page;
    let base = unsafe {
        mmap(
            ptr::null_mut(),
            total,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_STACK,
            -1,
            0,
        )
    };
    let base = match base {
        Ok(p) => p as *mut u8,
        Err(err) => {
            log!(crate::log::LogLevel::LogDebug, "stack mmap failed: {}", err);
            return None;
        }
    };
    if let Err(err) = unsafe { mprotect(base as *mut _, page, ProtFlags::PROT_NONE) } {
        log!(
            crate::log::LogLevel::LogWarn,
            "stack guard mprotect failed: {}",
            err
        );
        let _ = unsafe { munmap(base as *mut _, total) };
        return None;
    }
    *ssize = usable;
    Some(unsafe { base.add(page) })
}

/// Unmap a stack returned by `alloc_stack`. Failure leaks the mapping and
/// is logged rather than promoted to fatal.
pub unsafe fn free_stack(lo: *mut u8, size: usize) {
    let page = page_size();
    let base = lo.sub(page);
    if let Err(err) = munmap(base as *mut _, size + page) {
        log!(
            crate::log::LogLevel::LogWarn,
            "munmap of fiber stack failed: {}",
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undersized_requests_round_up() {
        let mut ssize = 8192;
        let stk = alloc_stack(&mut ssize).expect("mmap failed");
        assert!(ssize >= MIN_STACK_SIZE);
        assert_eq!(ssize % page_size(), 0);
        // The whole usable region is writable.
        unsafe {
            stk.write(0xa5);
            stk.add(ssize - 1).write(0x5a);
            free_stack(stk, ssize);
        }
    }
}
