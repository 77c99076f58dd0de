//! Graceful shutdown. `spec.md` §4.10/§8.6: node 0 fans a `Shutdown` AM out
//! to every other node; every node (0 included) then waits for its own
//! shutdown-requested signal and calls the shutdown barrier; only once
//! every node's barrier call has returned does any node flip its exit flag
//! and join its background threads — "no node exits before the barrier."
//! A provider destructor known to hang gets the unilateral `_exit` path
//! instead, bypassing `Drop` entirely.

use std::sync::atomic::Ordering;

use anyhow::Result;

use crate::am::protocol::{encode, Request, RequestKind};
use crate::barrier;
use crate::init::Job;

/// Reserved tag for the shutdown barrier, distinct from any tag a caller
/// would pick for its own `barrier()` calls.
const SHUTDOWN_BARRIER_TAG: u64 = u64::MAX;

/// Node 0 signals every peer, every node barriers once signaled, then
/// every handler and liveness thread the job spawned is joined.
pub fn shutdown(job: Job) -> Result<()> {
    let Job { ctxs, handler_threads, liveness_thread } = job;

    if let Some(root) = ctxs.first() {
        let self_rank = root.self_rank();
        debug_assert_eq!(self_rank, 0, "shutdown is always initiated by node 0");
        for peer in 0..root.node_count() {
            if peer == self_rank {
                continue;
            }
            let req = Request { initiator: self_rank, done: None, kind: RequestKind::Shutdown };
            let bytes = encode(&req);
            if bytes.len() <= root.fabric.inject_size() {
                root.fabric.inject_send(peer, &bytes)?;
            } else {
                root.fabric.send(peer, &bytes)?;
            }
        }
        // Node 0 already knows shutdown has started; it doesn't wait for
        // its own AM to round-trip back to itself.
        root.shutdown_requested.store(true, Ordering::Release);
    }

    // Each simulated node waits for its shutdown signal, then barriers —
    // concurrently, since a collective call needs every node in it at once.
    let barriers: Vec<_> = ctxs
        .iter()
        .cloned()
        .map(|ctx| {
            std::thread::spawn(move || -> Result<()> {
                while !ctx.shutdown_requested.load(Ordering::Acquire) {
                    ctx.tasking.task_yield();
                }
                barrier::barrier(&ctx, SHUTDOWN_BARRIER_TAG)
            })
        })
        .collect();
    for b in barriers {
        b.join().expect("shutdown barrier thread panicked")?;
    }

    // Every node's barrier call has now returned: safe to let the handler
    // loops stop servicing AM traffic.
    for ctx in &ctxs {
        ctx.am_handlers_exit.store(true, Ordering::Release);
    }

    for threads in handler_threads {
        for t in threads {
            t.join().expect("AM handler thread panicked");
        }
    }
    if let Some(t) = liveness_thread {
        t.join().expect("liveness thread panicked");
    }
    Ok(())
}

/// `spec.md` §7's unilateral exit path: a provider destructor known to
/// hang is bypassed entirely by terminating the process before `Drop`
/// ever runs, rather than racing a timeout against it.
pub fn exit_unilateral(code: i32) -> ! {
    std::process::exit(code)
}

/// Runs [`shutdown`] on a background thread and gives it `timeout` to
/// finish; if it doesn't — the symptom §7 attributes to a provider
/// destructor hanging inside one of the joins — calls [`exit_unilateral`]
/// instead of waiting on it forever. Embedders that can't tolerate an
/// indefinite hang at teardown (`bin/commtest.rs`) call this instead of
/// [`shutdown`] directly.
pub fn shutdown_or_force(job: Job, timeout: std::time::Duration) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(shutdown(job));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            log::error!("shutdown: graceful teardown exceeded {timeout:?}, forcing exit");
            exit_unilateral(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::init_job;

    #[test]
    fn shutdown_joins_every_background_thread() {
        let job = init_job(3, Vec::new()).unwrap();
        shutdown(job).unwrap();
    }

    #[test]
    fn shutdown_of_a_solo_job_sends_no_fabric_traffic() {
        let job = init_job(1, Vec::new()).unwrap();
        shutdown(job).unwrap();
    }

    #[test]
    fn shutdown_or_force_completes_within_timeout_on_the_happy_path() {
        let job = init_job(3, Vec::new()).unwrap();
        shutdown_or_force(job, std::time::Duration::from_secs(5)).unwrap();
    }
}
