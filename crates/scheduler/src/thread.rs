//! Per-thread environment for scan workers: priority, name, CPU clock
//! and the query a thread is currently working for.

use std::cell::Cell;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

thread_local! {
    static ATTACHED_QUERY: Cell<Option<Uuid>> = const { Cell::new(None) };
    static NICE_APPLIED: Cell<bool> = const { Cell::new(false) };
}

/// Restores the previously attached query when dropped.
#[must_use = "the attachment ends when the guard is dropped"]
pub struct QueryAttachGuard {
    previous: Option<Uuid>,
}

impl Drop for QueryAttachGuard {
    fn drop(&mut self) {
        ATTACHED_QUERY.with(|q| q.set(self.previous));
    }
}

/// Account work on this thread to `query_id` until the guard drops.
pub fn attach_query(query_id: Uuid) -> QueryAttachGuard {
    let previous = ATTACHED_QUERY.with(|q| q.replace(Some(query_id)));
    QueryAttachGuard { previous }
}

/// Query the current thread is attached to, if any.
pub fn current_query() -> Option<Uuid> {
    ATTACHED_QUERY.with(Cell::get)
}

/// Lower this thread's scheduling priority. Applied at most once per thread.
///
/// Returns whether the priority is now set.
pub fn set_thread_nice_value(nice: i32) -> bool {
    if NICE_APPLIED.with(Cell::get) {
        return true;
    }
    let applied = apply_nice(nice);
    if applied {
        NICE_APPLIED.with(|n| n.set(true));
    }
    applied
}

#[cfg(target_os = "linux")]
fn apply_nice(nice: i32) -> bool {
    // SAFETY: gettid has no preconditions; setpriority only reads its arguments.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };
    if rc != 0 {
        warn!(nice, error = %std::io::Error::last_os_error(), "failed to set scan thread nice value");
        return false;
    }
    debug!(nice, "lowered scan thread priority");
    true
}

#[cfg(not(target_os = "linux"))]
fn apply_nice(_nice: i32) -> bool {
    false
}

/// Rename the calling OS thread. Linux truncates names to 15 bytes.
#[cfg(target_os = "linux")]
pub fn set_self_name(name: &str) {
    let truncated: String = name.chars().take(15).collect();
    let Ok(cname) = std::ffi::CString::new(truncated) else {
        return;
    };
    // SAFETY: PR_SET_NAME reads a NUL-terminated string that outlives the call.
    unsafe {
        libc::prctl(libc::PR_SET_NAME, cname.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_self_name(_name: &str) {}

/// Measures CPU time consumed by the current thread.
///
/// Falls back to wall time where a per-thread clock is unavailable.
pub struct CpuTimer {
    start_cpu: Option<Duration>,
    start_wall: Instant,
}

impl CpuTimer {
    pub fn start() -> Self {
        Self {
            start_cpu: thread_cpu_time(),
            start_wall: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match (self.start_cpu, thread_cpu_time()) {
            (Some(start), Some(now)) => now.saturating_sub(start),
            _ => self.start_wall.elapsed(),
        }
    }
}

#[cfg(target_os = "linux")]
fn thread_cpu_time() -> Option<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

#[cfg(not(target_os = "linux"))]
fn thread_cpu_time() -> Option<Duration> {
    None
}
