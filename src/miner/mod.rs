//! The mining driver: turns pool jobs into solved shares.
//!
//! One session = one pool connection. Per job the driver builds the
//! Equihash base state from the 108-byte header prefix, picks a starting
//! nonce, and then loops: absorb the nonce, solve, verify and filter the
//! solutions, submit what passes the share target, and advance the nonce.
//! Server updates are drained between solves; a new job breaks back to the
//! outer loop. In-flight solves always run to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::block;
use crate::equihash::{self, Solver};
use crate::stratum::{StratumClient, StratumError};

/// Bound on solutions kept per nonce attempt; a 144,5 solve averages about
/// two, so eight leaves comfortable headroom.
pub const MAX_SOLS_PER_NONCE: usize = 8;

/// Drive one pool session until the connection fails or `stop` is raised.
/// `Ok(())` means a requested stop; transport and protocol failures bubble
/// up so the caller can decide whether to reconnect.
pub async fn run_session(
    client: &mut StratumClient,
    solver: &Arc<Mutex<Solver>>,
    stop: &Arc<AtomicBool>,
) -> Result<(), StratumError> {
    'job: loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut params = client.params().clone();
        tracing::info!(
            job_id = %params.job_id,
            time = params.time,
            bits = %format!("{:08x}", params.bits),
            "starting job"
        );
        let base = block::base_state(&params);
        let mut nonce = block::nonce_init(&params);
        let job_start = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            let state = block::state_with_nonce(&base, &nonce);
            let solver = Arc::clone(solver);
            let solve_state = state.clone();
            let output = tokio::task::spawn_blocking(move || {
                solver
                    .lock()
                    .unwrap()
                    .solve(&solve_state, MAX_SOLS_PER_NONCE)
            })
            .await
            .expect("equihash solver panicked");
            attempts += 1;

            // set_target may have moved the goalposts mid-job
            params.target = client.target();

            for solution in &output.solutions {
                // never submit a share we cannot verify ourselves
                if let Err(e) = equihash::check_solution(&state, solution) {
                    tracing::error!(error = %e, "solver emitted an invalid solution, skipping");
                    continue;
                }
                if !block::check_pow_target(&params, &nonce, solution) {
                    continue;
                }
                tracing::info!(nonce = %nonce, "share meets target");
                client.submit(&nonce, solution).await?;
            }

            if attempts % 32 == 0 {
                let elapsed = job_start.elapsed().as_secs_f64();
                tracing::info!(
                    attempts,
                    "job running at {:.2} solves/s",
                    attempts as f64 / elapsed,
                );
            }

            if client.poll_updates()? {
                continue 'job;
            }
            block::nonce_increase(&params, &mut nonce);
        }
    }
}
