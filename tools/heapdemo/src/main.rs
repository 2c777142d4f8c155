//! Demonstrates the debug heap's bug detection on purpose-built scenarios.
//!
//! Most cases are expected to kill the process -- that is the feature. Run
//! `heapdemo cycle` for the one that is supposed to survive.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use guardheap::{GuardHeap, PAGE_SIZE};

#[derive(Parser)]
#[command(about = "Exercise the guard-page debug heap")]
struct Args {
    /// Scenario to run.
    #[arg(value_enum)]
    case: Case,
}

#[derive(Clone, Copy, ValueEnum)]
enum Case {
    /// Allocate, write in bounds, free. Exits cleanly.
    Cycle,
    /// Write one byte past the end. Crashes on the guard page.
    Overrun,
    /// Free the same pointer twice. Panics with a diagnostic.
    DoubleFree,
    /// Read through a freed pointer. Crashes on the decommitted page.
    UseAfterFree,
    /// Show deferred reuse: freed regions stay parked until pressure.
    Churn,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let args = Args::parse();
    let heap = GuardHeap::new(2 * 1024 * 1024).context("heap construction")?;

    match args.case {
        Case::Cycle => {
            let p = heap.allocate(128, 4).context("allocation")?;
            // SAFETY: 128 in-bounds bytes.
            unsafe {
                *p.as_ptr() = b'a';
                *p.as_ptr().add(127) = b'a';
            }
            heap.free(p);
            println!("clean cycle: no fault, no diagnostic");
        }
        Case::Overrun => {
            let p = heap.allocate(128, 4).context("allocation")?;
            println!("writing byte 128 of a 128-byte allocation; expect a fault");
            // SAFETY: deliberately not safe -- this write lands on the
            // guard page.
            unsafe { *p.as_ptr().add(128) = b'a' };
            println!("unreachable: the guard page did not fault");
        }
        Case::DoubleFree => {
            let p = heap.allocate(128, 4).context("allocation")?;
            heap.free(p);
            println!("freeing the same pointer again; expect a panic");
            heap.free(p);
        }
        Case::UseAfterFree => {
            let p = heap.allocate(128, 4).context("allocation")?;
            heap.free(p);
            println!("reading through the freed pointer; expect a fault");
            // SAFETY: deliberately not safe -- the page is decommitted.
            let stale = unsafe { std::ptr::read_volatile(p.as_ptr()) };
            println!("unreachable: read {stale} from freed memory");
        }
        Case::Churn => {
            let held: Vec<_> = (0..64)
                .map(|_| heap.allocate(128, 4).expect("allocation"))
                .collect();
            for p in held {
                heap.free(p);
            }
            println!(
                "after 64 frees: {} regions parked, {} free",
                heap.pending_regions(),
                heap.free_regions()
            );
            let pages = heap.page_count();
            let big = heap
                .allocate((pages - 1) * PAGE_SIZE, 1)
                .expect("flush must reclaim the area");
            println!(
                "after a full-area request: {} parked, {} free",
                heap.pending_regions(),
                heap.free_regions()
            );
            heap.free(big);
        }
    }

    Ok(())
}
