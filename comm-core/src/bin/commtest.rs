//! End-to-end exercise of the communication substrate: brings up a
//! simulated job of N nodes in this one process, drives PUT/GET, AMOs,
//! `executeOn`, and a barrier across them, then prints a metrics summary.
//! `spec.md` §8's scenario list, run as a single harness rather than a
//! suite of `#[test]`s so it can be pointed at a larger node count from
//! the command line.

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use comm_core::api;
use comm_core::context::CommSubstrate;

#[derive(Parser, Debug)]
#[command(name = "commtest", about = "Exercise the PGAS communication substrate end to end")]
struct Args {
    /// Number of simulated nodes in the job.
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Number of times to run the put/get/amo/executeOn/barrier round.
    #[arg(short, long, default_value = "3")]
    rounds: usize,
}

/// 8-byte aligned scratch word for the demo `executeOn` handler below.
/// Must sit past `mcm::ORDER_DUMMY_SIZE` (the first 4 bytes of every
/// node's heap are reserved for order-dummy GETs) and be 8-byte aligned,
/// which offset 4 itself isn't.
const COUNTER_OFFSET: u64 = 8;

fn bump_counter(ctx: &CommSubstrate, arg: &[u8]) {
    let delta = i64::from_le_bytes(arg.try_into().unwrap_or([0; 8]));
    let ptr = ctx.fabric.local_heap().word_ptr(COUNTER_OFFSET, 8);
    // SAFETY: word_ptr validated bounds/alignment against our own heap.
    unsafe {
        comm_core::cpu_amo::apply(
            ptr,
            comm_core::types::AtomicType::I64,
            comm_core::types::AtomicOp::Sum,
            comm_core::types::AtomicValue::I64(delta),
            comm_core::types::AtomicValue::I64(0),
        );
    }
}

fn run_round(ctxs: &[std::sync::Arc<CommSubstrate>], round: usize) -> Result<()> {
    let n = ctxs.len();
    let payload = vec![round as u8; 32];

    for peer in 0..n {
        api::put(&ctxs[0], &payload, peer, 4096)?;
    }
    for peer in 0..n {
        let mut got = vec![0u8; 32];
        api::get(&ctxs[0], &mut got, peer, 4096)?;
        if got != payload {
            warn!("round {round}: peer {peer} read back a mismatched PUT");
        }
    }

    for peer in 1..n {
        api::execute_on(&ctxs[0], peer, 0, &1i64.to_le_bytes())?;
    }

    api::barrier(&ctxs[0], round as u64)?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("commtest: bringing up a {}-node simulated job", args.nodes);
    let job = api::init_job(args.nodes, vec![bump_counter])?;
    let ctxs = job.ctxs.clone();

    let barrier_threads: Vec<_> = ctxs[1..]
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, ctx)| {
            std::thread::spawn(move || {
                for round in 0..args.rounds {
                    if let Err(err) = api::barrier(&ctx, round as u64) {
                        warn!("node {}: barrier failed: {err:#}", i + 1);
                    }
                }
            })
        })
        .collect();

    for round in 0..args.rounds {
        run_round(&ctxs, round)?;
        info!("round {round} complete");
    }
    for t in barrier_threads {
        t.join().expect("barrier thread panicked");
    }

    println!();
    println!("+--------------------------------------------------+");
    println!("|            COMMTEST RUN SUMMARY                  |");
    println!("+--------------------------------------------------+");
    for (rank, ctx) in ctxs.iter().enumerate() {
        let m = &ctx.metrics;
        println!(
            "| node {rank:>2}: puts={:<6} gets={:<6} amos={:<6} exec={:<6} barriers={:<6} |",
            m.puts_total.load(std::sync::atomic::Ordering::Relaxed),
            m.gets_total.load(std::sync::atomic::Ordering::Relaxed),
            m.amos_total.load(std::sync::atomic::Ordering::Relaxed),
            m.execute_on_total.load(std::sync::atomic::Ordering::Relaxed),
            m.barriers_total.load(std::sync::atomic::Ordering::Relaxed),
        );
    }
    println!("+--------------------------------------------------+");

    info!("commtest: shutting down");
    api::shutdown_or_force(job, std::time::Duration::from_secs(10))?;
    Ok(())
}
