//! Worker pool distributing inputs to measurement tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_atomic::{AtomicU8, Ordering};
use tokio::time::sleep;

use super::{measurement, RunState};

/// Share of `max_runtime` after which no further input is dispatched,
/// leaving headroom to close the report.
const RUNTIME_BUDGET_SHARE: f64 = 0.9;

const DEFAULT_PARALLELISM: u8 = 3;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Number of workers for a run: one when the nettest takes no input,
/// otherwise the configured degree with a default of three.
pub(crate) fn effective_parallelism(needs_input: bool, configured: u8) -> u8 {
    if !needs_input {
        1
    } else if configured > 0 {
        configured
    } else {
        DEFAULT_PARALLELISM
    }
}

/// Fan inputs out to `parallelism` workers and wait for all of them.
///
/// Workers claim indexes from a shared counter, so every input is measured
/// exactly once unless an interrupt or the runtime budget stops the run.
pub(crate) async fn dispatch(state: Arc<RunState>, inputs: Arc<Vec<String>>, parallelism: u8) {
    let next_index = Arc::new(Mutex::new(0u64));
    let active = Arc::new(AtomicU8::new(0));
    for _ in 0..parallelism {
        // Counted before spawning so the wait loop cannot observe a
        // transient zero while workers are still starting.
        active.fetch_add(1, Ordering::SeqCst);
        let state = state.clone();
        let inputs = inputs.clone();
        let next_index = next_index.clone();
        let active = active.clone();
        tokio::spawn(async move {
            worker(state, inputs, next_index).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
    while active.load(Ordering::SeqCst) > 0 {
        sleep(WAIT_POLL_INTERVAL).await;
    }
}

async fn worker(state: Arc<RunState>, inputs: Arc<Vec<String>>, next_index: Arc<Mutex<u64>>) {
    while !state.interrupted() {
        let idx = {
            let mut next = next_index.lock().expect("poisoned");
            // Indexes past u32::MAX are not representable for embedders.
            if *next > u64::from(u32::MAX) || *next >= inputs.len() as u64 {
                break;
            }
            let idx = *next as u32;
            *next += 1;
            idx
        };
        if budget_exhausted(&state) {
            break;
        }
        measurement::measure_one(&state, idx, &inputs[idx as usize]).await;
    }
}

fn budget_exhausted(state: &RunState) -> bool {
    let elapsed = state.begin.elapsed().as_secs_f64();
    if elapsed >= f64::from(state.settings.max_runtime) * RUNTIME_BUDGET_SHARE {
        state.emitter.info("run: exceeded max runtime");
        return true;
    }
    false
}
