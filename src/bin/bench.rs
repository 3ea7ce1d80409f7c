//! Committed-transaction throughput across all concurrency-control modes,
//! over the low/high-contention and transaction-duration grid.

use std::time::{Duration, Instant};

use clap::Parser;
use itertools::Itertools;

use piggytxn::errors::Result;
use piggytxn::pool::pin_to_cores;
use piggytxn::processor::{Mode, ProcessorConfig, TxnProcessor};
use piggytxn::workload::{LoadGen, RmwLoadGen, RmwMixLoadGen};

#[derive(Parser)]
#[command(about = "Transaction throughput benchmark")]
struct Args {
    /// Seconds to keep the submission window open per round.
    #[arg(long, default_value_t = 1.0)]
    seconds: f64,

    /// Rounds averaged per cell.
    #[arg(long, default_value_t = 3)]
    rounds: u32,

    /// Transactions kept in flight during the submission window.
    #[arg(long, default_value_t = 100)]
    active: usize,

    /// Worker threads per processor.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Run a single mode (serial, 2pl-x, 2pl-sx, occ, p-occ, mvcc).
    #[arg(long)]
    mode: Option<String>,
}

/// One section of the report: a workload shape at each body duration.
struct Experiment {
    title: &'static str,
    db_size: u64,
    read_keys: usize,
    write_keys: usize,
    mixed: bool,
}

const DURATIONS_US: [u64; 3] = [100, 1_000, 10_000];

const EXPERIMENTS: [Experiment; 10] = [
    Experiment { title: "Low contention read only (5 records)", db_size: 1_000_000, read_keys: 5, write_keys: 0, mixed: false },
    Experiment { title: "Low contention read only (20 records)", db_size: 1_000_000, read_keys: 20, write_keys: 0, mixed: false },
    Experiment { title: "High contention read only (5 records)", db_size: 100, read_keys: 5, write_keys: 0, mixed: false },
    Experiment { title: "High contention read only (20 records)", db_size: 100, read_keys: 20, write_keys: 0, mixed: false },
    Experiment { title: "Low contention read-write (5 records)", db_size: 1_000_000, read_keys: 0, write_keys: 5, mixed: false },
    Experiment { title: "Low contention read-write (10 records)", db_size: 1_000_000, read_keys: 0, write_keys: 10, mixed: false },
    Experiment { title: "High contention read-write (1 record)", db_size: 5, read_keys: 0, write_keys: 1, mixed: false },
    Experiment { title: "High contention read-write (5 records)", db_size: 100, read_keys: 0, write_keys: 5, mixed: false },
    Experiment { title: "High contention read-write (10 records)", db_size: 100, read_keys: 0, write_keys: 10, mixed: false },
    Experiment { title: "High contention mixed read only/read-write", db_size: 50, read_keys: 30, write_keys: 10, mixed: true },
];

impl Experiment {
    fn load_gen(&self, duration: Duration) -> Box<dyn LoadGen> {
        if self.mixed {
            Box::new(RmwMixLoadGen::new(
                self.db_size,
                self.read_keys,
                self.write_keys,
                duration,
            ))
        } else {
            Box::new(RmwLoadGen::new(
                self.db_size,
                self.read_keys,
                self.write_keys,
                duration,
            ))
        }
    }
}

/// Runs one round and returns committed transactions per second.
fn run_round(
    mode: Mode,
    experiment: &Experiment,
    duration: Duration,
    args: &Args,
) -> Result<f64> {
    let processor = TxnProcessor::with_config(
        mode,
        ProcessorConfig {
            threads: args.threads,
            db_size: experiment.db_size,
        },
    )?;
    let mut gen = experiment.load_gen(duration);

    let start = Instant::now();
    for _ in 0..args.active {
        processor.submit(gen.next_txn())?;
    }

    let window = Duration::from_secs_f64(args.seconds);
    let mut finished = 0u64;
    while start.elapsed() < window {
        processor.next_result()?;
        finished += 1;
        processor.submit(gen.next_txn())?;
    }
    for _ in 0..args.active {
        processor.next_result()?;
        finished += 1;
    }

    Ok(finished as f64 / start.elapsed().as_secs_f64())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // The processor's threads keep to cores 0-6; the harness takes core 7.
    pin_to_cores(&[7]);

    let modes: Vec<Mode> = match &args.mode {
        Some(name) => vec![name.parse()?],
        None => Mode::ALL.to_vec(),
    };

    println!(
        "\t\taverage transaction duration: {}",
        DURATIONS_US.iter().map(|us| format!("{us}us")).join("\t")
    );

    for experiment in &EXPERIMENTS {
        println!("{}", experiment.title);
        for &mode in &modes {
            let mut cells = Vec::with_capacity(DURATIONS_US.len());
            for us in DURATIONS_US {
                let duration = Duration::from_micros(us);
                let mut total = 0.0;
                for _ in 0..args.rounds {
                    total += run_round(mode, experiment, duration, &args)?;
                }
                cells.push(total / f64::from(args.rounds));
            }
            println!(
                "  {:8}\t{}",
                mode.to_string(),
                cells.iter().map(|tps| format!("{tps:.0}")).join("\t")
            );
        }
    }
    Ok(())
}
