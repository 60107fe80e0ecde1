use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use clap::{Parser, Subcommand};

use zforge::block::{self, MiningParams};
use zforge::codec::{compact_to_u256, U256};
use zforge::equihash::{self, Solver};
use zforge::miner;
use zforge::stratum::{self, StratumClient};

const DEFAULT_POOL_PORT: u16 = 4000;

#[derive(Parser)]
#[command(name = "zforge", version)]
#[command(about = "ZForge - reference BitcoinZ CPU pool miner (Equihash 144,5)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mine against a STRATUM pool
    Mine {
        /// Pool host name or address
        #[arg(long)]
        pool: String,
        /// Pool STRATUM port
        #[arg(long, default_value_t = DEFAULT_POOL_PORT)]
        port: u16,
        /// Worker username (usually a transparent BTCZ address)
        #[arg(long)]
        user: String,
        /// Worker password
        #[arg(long, default_value = "x")]
        password: String,
        /// Solver threads (0 = logical CPUs minus one)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },
    /// Solve the reference block once and verify the results (self-test)
    Bench {
        /// Solver threads (0 = logical CPUs minus one)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },
    /// Relay a miner to a pool, logging the STRATUM traffic
    Proxy {
        /// Local port to listen on
        #[arg(long, default_value_t = DEFAULT_POOL_PORT)]
        listen_port: u16,
        /// Upstream pool host
        #[arg(long)]
        pool: String,
        /// Upstream pool port
        #[arg(long, default_value_t = DEFAULT_POOL_PORT)]
        port: u16,
    },
}

fn resolve_threads(threads: usize) -> usize {
    if threads == 0 {
        // leave one core for the system
        num_cpus::get().saturating_sub(1).max(1)
    } else {
        threads
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("zforge=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to start runtime");

    let code = match cli.command {
        Commands::Mine {
            pool,
            port,
            user,
            password,
            threads,
        } => {
            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = stop.clone();
                ctrlc::set_handler(move || {
                    tracing::info!("stop requested, finishing the current solve");
                    stop.store(true, Ordering::Relaxed);
                })
                .expect("failed to install signal handler");
            }
            rt.block_on(run_miner(
                pool,
                port,
                user,
                password,
                resolve_threads(threads),
                stop,
            ))
        }
        Commands::Bench { threads } => run_bench(resolve_threads(threads)),
        Commands::Proxy {
            listen_port,
            pool,
            port,
        } => rt.block_on(async {
            match stratum::proxy::run(listen_port, &pool, port).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "proxy failed");
                    1
                }
            }
        }),
    };
    std::process::exit(code);
}

async fn run_miner(
    pool: String,
    port: u16,
    user: String,
    password: String,
    threads: usize,
    stop: Arc<AtomicBool>,
) -> i32 {
    tracing::info!(pool = %pool, port, user = %user, threads, "starting zforge");

    // arenas and worker pool are allocated once and reused across jobs
    let solver = Arc::new(Mutex::new(Solver::new(threads)));

    let mut first_attempt = true;
    let mut consecutive_failures: u32 = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            return 0;
        }

        match StratumClient::connect(&pool, port, &user, &password).await {
            Ok(mut client) => {
                first_attempt = false;
                consecutive_failures = 0;
                match miner::run_session(&mut client, &solver, &stop).await {
                    Ok(()) => {
                        tracing::info!("mining stopped");
                        return 0;
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "pool refused this worker");
                        return 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "pool session ended");
                        consecutive_failures += 1;
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "pool refused this worker");
                return 1;
            }
            Err(e) => {
                if first_attempt {
                    // a pool that cannot be reached even once is operator
                    // error; bail instead of retrying forever
                    tracing::error!(error = %e, "failed to reach pool");
                    return 1;
                }
                tracing::warn!(error = %e, "reconnect failed");
                consecutive_failures += 1;
            }
        }

        let delay = 2u64.pow(consecutive_failures.min(6)).min(60);
        tracing::info!(delay_s = delay, "reconnecting");
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
    }
}

/// Solve BTCZ mainnet block 818128 with its historical nonce. The block has
/// a known solution, so a healthy build finds at least one solution, all of
/// them verify, and one matches the chain.
fn run_bench(threads: usize) -> i32 {
    let params = MiningParams {
        job_id: "bench".into(),
        version: 4,
        prev_hash: U256::from_hex_be(
            "0000007b753e415f80614ba8130aa4668ca4731b0539d9919c2074b43a46b9e8",
        )
        .unwrap(),
        merkle_root: U256::from_hex_be(
            "6b2198b49e2055535c403830a3c124a8c235004b4662901010bc0927c43979ec",
        )
        .unwrap(),
        final_sapling_root: U256::from_hex_be(
            "189df3ceb26643f3b90ec7059316c7ccb26aeaf1e96559c63b8c6d52f04e79b5",
        )
        .unwrap(),
        time: 1632007626,
        bits: 0x1E009CB8,
        nonce1: U256::ZERO,
        nonce1_bytes: 0,
        target: compact_to_u256(0x1E009CB8),
    };
    let nonce = U256::from_hex_be(
        "81b601c200000000000000006dcdf558dd65a0dd9e68012952b8df1003cefade",
    )
    .unwrap();

    tracing::info!(threads, "allocating solver");
    let mut solver = Solver::new(threads);
    let state = block::state_with_nonce(&block::base_state(&params), &nonce);

    let start = Instant::now();
    let output = solver.solve(&state, miner::MAX_SOLS_PER_NONCE);
    let elapsed = start.elapsed();

    tracing::info!(
        solutions = output.solutions.len(),
        discarded_hashes = output.discarded_hashes,
        discarded_collisions = output.discarded_collisions,
        "solved in {:.2?}",
        elapsed
    );

    let mut healthy = !output.solutions.is_empty();
    let mut block_found = false;
    for (i, solution) in output.solutions.iter().enumerate() {
        let verified = equihash::check_solution(&state, solution).is_ok();
        let meets_target = block::check_pow_target(&params, &nonce, solution);
        tracing::info!(i, verified, meets_target, solution = %solution.to_hex());
        healthy &= verified;
        block_found |= meets_target;
    }

    if healthy && block_found {
        tracing::info!("bench OK: reference solution reproduced");
        0
    } else {
        tracing::error!("bench FAILED");
        1
    }
}
