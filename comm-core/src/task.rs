//! The tasking/scheduler collaborator. `spec.md` §1 places this out of
//! scope, consuming only `task_yield`, `task_is_fixed_thread`,
//! `task_private_slot`, `task_start_moved` (plus, per §6,
//! `task_get_fixed_num_threads`/`task_get_max_par`). `SPEC_FULL.md` §1
//! adds the minimal trait capturing exactly that surface, plus a
//! `std::thread`-backed implementation so the engine runs end-to-end
//! without an external scheduler crate.

use std::cell::RefCell;

use crate::bitmap::Bitmap;
use crate::rdma::{BufferedGet, BufferedPut};

/// Per-task private scratch the engine reads/writes between `task_yield`
/// points. `spec.md` §3.
pub struct TaskPrivate {
    pub put_bitmap: Option<Bitmap>,
    /// Set by a non-fetching blocking `executeOn` that deferred spinning on
    /// its done-flag (`spec.md` §4.6's "Delayed blocking AM"). The value is
    /// the bounce-pool offset holding the flag; `am::request::retire_delayed_done`
    /// is the only code that ever reads or clears this.
    pub am_done_offset: Option<u64>,
    pub task_is_ending: bool,
    /// `spec.md` §3's `batch_slots`: buffers for buffered PUT/GET
    /// (`rdma.rs`'s `put_unordered`/`get_unordered`).
    pub put_buf: Vec<BufferedPut>,
    pub get_buf: Vec<BufferedGet>,
}

impl TaskPrivate {
    pub fn new() -> TaskPrivate {
        TaskPrivate {
            put_bitmap: None,
            am_done_offset: None,
            task_is_ending: false,
            put_buf: Vec::new(),
            get_buf: Vec::new(),
        }
    }
}

impl Default for TaskPrivate {
    fn default() -> TaskPrivate {
        TaskPrivate::new()
    }
}

/// The four operations `spec.md` §1 lists as consumed, plus the two
/// counting queries §4.9/§6 need. A "task" in `ThreadTasking` is just the
/// calling OS thread — no migration between threads happens, so
/// `task_is_fixed_thread` is always true and `task_yield` is a plain
/// `std::thread::yield_now`.
pub trait Tasking: Send + Sync {
    /// Cooperative yield point. `spec.md` §5: "any `task_yield()` call" is
    /// a suspension point.
    fn task_yield(&self);

    /// True if the calling task is pinned to its current OS thread for
    /// its whole lifetime (as opposed to being free to migrate between
    /// worker threads at yield points).
    fn task_is_fixed_thread(&self) -> bool;

    /// Runs `f` with mutable access to the calling task's private scratch.
    fn task_private_slot<R>(&self, f: &mut dyn FnMut(&mut TaskPrivate) -> R) -> R;

    /// Starts `body` as a new task, not necessarily on this thread.
    /// `spec.md` §4.7 uses this for the AM handler's "moved task" path.
    fn task_start_moved(&self, body: Box<dyn FnOnce() + Send>);

    fn fixed_thread_count(&self) -> usize;
    fn max_parallelism(&self) -> usize;
}

thread_local! {
    static PRIVATE: RefCell<TaskPrivate> = RefCell::new(TaskPrivate::new());
}

/// `std::thread`-backed `Tasking`: every OS thread is its own fixed task,
/// private scratch lives in a `thread_local!`, and a "moved task" is
/// spawned as a short-lived detached thread — moved tasks never share the
/// originating thread's private scratch, matching the semantics of a real
/// scheduler handing work to an arbitrary worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadTasking {
    fixed_threads: usize,
    max_par: usize,
}

impl ThreadTasking {
    pub fn new(fixed_threads: usize, max_par: usize) -> ThreadTasking {
        ThreadTasking { fixed_threads, max_par }
    }
}

impl Tasking for ThreadTasking {
    fn task_yield(&self) {
        std::thread::yield_now();
    }

    fn task_is_fixed_thread(&self) -> bool {
        true
    }

    fn task_private_slot<R>(&self, f: &mut dyn FnMut(&mut TaskPrivate) -> R) -> R {
        PRIVATE.with(|cell| f(&mut cell.borrow_mut()))
    }

    fn task_start_moved(&self, body: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(body);
    }

    fn fixed_thread_count(&self) -> usize {
        self.fixed_threads
    }

    fn max_parallelism(&self) -> usize {
        self.max_par
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_slot_is_per_thread() {
        let tasking = ThreadTasking::new(1, 1);
        tasking.task_private_slot(&mut |p| p.am_done_offset = Some(7));
        let got = tasking.task_private_slot(&mut |p| p.am_done_offset);
        assert_eq!(got, Some(7));

        let other = std::thread::spawn(|| {
            let tasking = ThreadTasking::new(1, 1);
            tasking.task_private_slot(&mut |p| p.am_done_offset)
        })
        .join()
        .unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn moved_task_runs_to_completion() {
        let tasking = ThreadTasking::new(1, 1);
        let (tx, rx) = std::sync::mpsc::channel();
        tasking.task_start_moved(Box::new(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), 42);
    }
}
