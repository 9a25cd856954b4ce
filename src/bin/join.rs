//! devstream-join: run the three-phase nested-loop join and check it on the host.

use std::process;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use devstream::cache::CacheStats;
use devstream::cli;
use devstream::measurement::Measurement;
use devstream::pipeline::{brute_force_join, JoinConfig, NestedLoopJoin};

#[derive(Parser)]
#[command(name = "devstream-join", about = "Stream a nested-loop join through a device")]
struct Args {
    /// Rows of the streamed table A
    #[arg(short = 'a', long, default_value = "16384")]
    rows_a: usize,

    /// Rows of the resident table B (must fit one slot)
    #[arg(short = 'b', long, default_value = "256")]
    rows_b: usize,

    /// Values are drawn from 0..distinct
    #[arg(long, default_value = "64", value_parser = validate_distinct)]
    distinct: u32,

    /// Rows of A per output group
    #[arg(short = 'g', long, default_value = "256")]
    group_len: usize,

    /// Slot size (e.g. 64K); a multiple of the group size in bytes
    #[arg(long, default_value = "64K", value_parser = cli::parse_size)]
    buffer_size: usize,

    /// Slots in the device pool
    #[arg(long, default_value = "8")]
    slots: usize,

    /// Seed of the table generator
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Include every recorded data point in the output
    #[arg(long)]
    measurements: bool,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_distinct(s: &str) -> Result<u32, String> {
    let n: u32 = s.parse().map_err(|_| format!("'{}' is not a valid integer", s))?;
    match n {
        0 => Err("distinct must be at least 1".to_string()),
        _ => Ok(n),
    }
}

#[derive(Serialize)]
struct Timings {
    join_ms: f64,
    reference_ms: f64,
}

#[derive(Serialize)]
struct JsonOutput {
    config: JoinConfig,
    rows_a: usize,
    rows_b: usize,
    pairs: usize,
    groups: usize,
    verified: bool,
    stats: CacheStats,
    timings: Timings,
    #[serde(skip_serializing_if = "Option::is_none")]
    measurements: Option<Vec<Measurement>>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    match run(args) {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// xorshift64* stream of values in `0..distinct`.
fn table(rows: usize, distinct: u32, seed: &mut u64) -> Vec<u32> {
    (0..rows)
        .map(|_| {
            *seed ^= *seed >> 12;
            *seed ^= *seed << 25;
            *seed ^= *seed >> 27;
            (seed.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32 % distinct
        })
        .collect()
}

fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let config = JoinConfig {
        buffer_size: args.buffer_size,
        group_len: args.group_len,
        slots: args.slots,
    };
    let mut seed = args.seed.max(1);
    let a = table(args.rows_a, args.distinct, &mut seed);
    let b = table(args.rows_b, args.distinct, &mut seed);

    let join_start = Instant::now();
    let output = NestedLoopJoin::new(config)?.run(&a, &b)?;
    let join_ms = join_start.elapsed().as_secs_f64() * 1000.0;

    let reference_start = Instant::now();
    let expected = brute_force_join(&a, &b);
    let reference_ms = reference_start.elapsed().as_secs_f64() * 1000.0;

    let verified = output.pairs == expected;
    if !verified {
        eprintln!(
            "Join mismatch: {} pairs, expected {}",
            output.pairs.len(),
            expected.len()
        );
    }

    let summary = JsonOutput {
        config,
        rows_a: a.len(),
        rows_b: b.len(),
        pairs: output.pairs.len(),
        groups: output.offsets.len().saturating_sub(1),
        verified,
        stats: output.stats,
        timings: Timings {
            join_ms,
            reference_ms,
        },
        measurements: args.measurements.then_some(output.measurements),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(verified)
}
