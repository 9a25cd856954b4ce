//! devstream-bench: stream a buffer through a device for a sweep of slot sizes.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use devstream::backend::host::{host_devices, HostBackend, HostContext, HostKernel};
use devstream::backend::Backend;
use devstream::cache::{AccessMode, BufferCache, CacheStats};
use devstream::cli;
use devstream::cli::backend::BackendKind;
use devstream::config::{CacheConfig, DistributionPolicy, StreamConfig};
use devstream::kernel::UnaryKernel;
use devstream::measurement::{DataPointKind, Measurement, Recorder};
use devstream::scheduler::{DeviceScheduler, MultiDeviceScheduler, SingleDeviceScheduler};

#[derive(Parser)]
#[command(
    name = "devstream-bench",
    about = "Stream a buffer through a device in slot-sized chunks"
)]
struct Args {
    /// Memory-map this file as input instead of a synthetic buffer
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Synthetic input size (e.g. 64M)
    #[arg(short = 's', long, default_value = "64M", value_parser = cli::parse_size)]
    size: usize,

    /// Slot sizes to sweep, comma separated (defaults to the config's buffer_size)
    #[arg(short = 'b', long, value_delimiter = ',', value_parser = validate_slot_size)]
    slot_sizes: Vec<usize>,

    /// Slots per device pool
    #[arg(long, default_value = "4", value_parser = validate_slots)]
    slots: usize,

    /// Simulated devices (host backend only)
    #[arg(long, default_value = "1")]
    devices: usize,

    /// Chunk distribution with several devices: round-robin, capacity, pinned:N
    #[arg(long, value_parser = cli::parse_distribution)]
    distribution: Option<DistributionPolicy>,

    /// JSON file with cache and scheduler settings
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Compute backend: host, opencl[:platform:device]
    #[arg(long, default_value = "host")]
    backend: String,

    /// Include every recorded data point in the output
    #[arg(long)]
    measurements: bool,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_slot_size(s: &str) -> Result<usize, String> {
    match cli::parse_size(s)? {
        0 => Err("slot size must be nonzero".to_string()),
        n => Ok(n),
    }
}

fn validate_slots(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|_| format!("'{}' is not a valid count", s))?;
    match n {
        0 => Err("a pool needs at least one slot".to_string()),
        _ => Ok(n),
    }
}

#[derive(Serialize)]
struct SweepRun {
    buffer_size: usize,
    chunks: usize,
    submit_ms: f64,
    wall_ms: f64,
    throughput_mb_s: f64,
    kernel_us: f64,
    transfer_us: f64,
    verified: bool,
    stats: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    measurements: Option<Vec<Measurement>>,
}

#[derive(Serialize)]
struct JsonOutput {
    backend: String,
    devices: usize,
    input_bytes: usize,
    slots: usize,
    runs: Vec<SweepRun>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn invert(_offset: usize, bytes: &mut [u8]) -> devstream::Result<()> {
    for b in bytes {
        *b = !*b;
    }
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => StreamConfig::from_file(path)?,
        None => StreamConfig::default(),
    };
    let sizes = if args.slot_sizes.is_empty() {
        vec![config.cache.buffer_size]
    } else {
        args.slot_sizes.clone()
    };
    let input = cli::load_input(args.file.as_deref(), args.size)?;
    let distribution = args.distribution.or(config.distribution);

    let runs = match cli::backend::resolve_backend(Some(&args.backend))? {
        BackendKind::Host => {
            if args.devices == 0 {
                return Err("--devices must be at least 1".into());
            }
            let backend = Arc::new(HostBackend::new());
            let pool = sizes.iter().max().copied().unwrap_or(0) * args.slots;
            let devices = host_devices(args.devices, pool.max(1));
            let kernel: Arc<dyn UnaryKernel<HostBackend>> =
                Arc::new(HostKernel::new("invert", invert));
            let runner = Sweep {
                args: &args,
                config: &config,
                distribution,
                sizes: &sizes,
            };
            runner.run(backend, HostContext, &devices, kernel, &input)?
        }
        #[cfg(feature = "opencl")]
        BackendKind::OpenCl { platform, device } => {
            let runner = Sweep {
                args: &args,
                config: &config,
                distribution,
                sizes: &sizes,
            };
            opencl::sweep_opencl(&runner, platform, device, &input)?
        }
        #[cfg(not(feature = "opencl"))]
        BackendKind::OpenCl { .. } => unreachable!(), // rejected by resolve_backend
    };

    let output = JsonOutput {
        backend: args.backend.clone(),
        devices: args.devices,
        input_bytes: input.len(),
        slots: args.slots,
        runs,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Settings shared by every slot size of a sweep.
struct Sweep<'a> {
    args: &'a Args,
    config: &'a StreamConfig,
    distribution: Option<DistributionPolicy>,
    sizes: &'a [usize],
}

impl Sweep<'_> {
    fn scheduler<B: Backend>(
        &self,
        backend: &Arc<B>,
        devices: usize,
    ) -> Result<Box<dyn DeviceScheduler<B>>, Box<dyn std::error::Error>> {
        let config = self.config.scheduler.clone();
        if devices == 1 {
            return Ok(Box::new(SingleDeviceScheduler::new(Arc::clone(backend), config)?));
        }
        let distribution = self.distribution.ok_or(
            "several devices need --distribution or a \"distribution\" entry in the config",
        )?;
        Ok(Box::new(MultiDeviceScheduler::new(
            Arc::clone(backend),
            config,
            distribution,
        )?))
    }

    fn run<B: Backend>(
        &self,
        backend: Arc<B>,
        context: B::Context,
        devices: &[B::Device],
        kernel: Arc<dyn UnaryKernel<B>>,
        input: &[u8],
    ) -> Result<Vec<SweepRun>, Box<dyn std::error::Error>> {
        let args = self.args;
        let mut runs = Vec::with_capacity(self.sizes.len());
        for &buffer_size in self.sizes {
            let cache_config = CacheConfig::with_buffer_size(buffer_size);
            let mut cache = BufferCache::new(Arc::clone(&backend), cache_config)?;
            let mut scheduler = self.scheduler(&backend, devices.len())?;
            for device in devices {
                cache.add_device(context.clone(), device.clone(), buffer_size * args.slots)?;
                scheduler.add_device(context.clone(), device.clone())?;
            }
            let id = cache.add_object(input.to_vec(), AccessMode::ReadWrite)?;
            let chunks = cache.object_info(id)?.chunk_count;
            scheduler.add_buffer_cache(cache)?;

            let recorder = Recorder::new();
            let start = Instant::now();
            let future =
                scheduler.enqueue_unary_dyn(Arc::clone(&kernel), id, Some(recorder.clone()))?;
            scheduler.run()?;
            let submit_ms = start.elapsed().as_secs_f64() * 1000.0;
            future.wait()?;
            scheduler.finish()?;
            let wall_ms = start.elapsed().as_secs_f64() * 1000.0;

            let cache = scheduler.cache_mut().ok_or("scheduler lost its cache")?;
            let output = cache.read_object(id)?;
            let verified = output.len() == input.len()
                && output.iter().zip(input).all(|(out, inp)| *out == !*inp);
            let stats = cache.stats();

            let measurements = recorder.report()?;
            let total_us = |kinds: &[DataPointKind]| -> f64 {
                measurements
                    .iter()
                    .filter(|m| kinds.iter().any(|k| k.name() == m.kind))
                    .filter_map(|m| m.duration_us)
                    .sum()
            };
            let kernel_us = total_us(&[DataPointKind::Kernel]);
            let transfer_us =
                total_us(&[DataPointKind::HostToDevice, DataPointKind::DeviceToHost]);
            let throughput_mb_s = if wall_ms > 0.0 {
                input.len() as f64 / (1 << 20) as f64 / (wall_ms / 1000.0)
            } else {
                0.0
            };

            runs.push(SweepRun {
                buffer_size,
                chunks,
                submit_ms,
                wall_ms,
                throughput_mb_s,
                kernel_us,
                transfer_us,
                verified,
                stats,
                measurements: args.measurements.then_some(measurements),
            });
        }
        Ok(runs)
    }
}

#[cfg(feature = "opencl")]
mod opencl {
    use super::*;
    use devstream::backend::opencl::{OpenClBackend, OpenClKernel};
    use devstream::kernel::LaunchConfig;

    const INVERT: &str = r#"
        __kernel void invert(__global uchar* buf, uint offset, uint size) {
            uint i = get_global_id(0);
            if (i < size) buf[i] = ~buf[i];
        }
    "#;

    pub(super) fn sweep_opencl(
        runner: &Sweep<'_>,
        platform: usize,
        device: usize,
        input: &[u8],
    ) -> Result<Vec<SweepRun>, Box<dyn std::error::Error>> {
        let opened = OpenClBackend::acquire(platform, device)?;
        let program = OpenClBackend::build_program(&opened.context, INVERT, "")?;
        let launch = LaunchConfig {
            global: None,
            local: Some(256),
        };
        let kernel: Arc<dyn UnaryKernel<OpenClBackend>> =
            Arc::new(OpenClKernel::new(&program, "invert", launch)?);
        runner.run(
            Arc::new(OpenClBackend::new()),
            opened.context,
            &[opened.device],
            kernel,
            input,
        )
    }
}
