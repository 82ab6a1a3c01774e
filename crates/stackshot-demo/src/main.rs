use facet::Facet;
use figue as args;
use stackshot_threads::stackshot_capture::{Backtrace, PassSummary, SamplerConfig};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

mod workloads;

use workloads::StopFlag;

type AnyResult<T> = Result<T, String>;

const DEFAULT_PASSES: u32 = 10;
const DEFAULT_INTERVAL_MS: u64 = 50;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_RECURSION_DEPTH: usize = 16;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Number of sampling passes to run.
    #[facet(args::named, default)]
    passes: Option<u32>,
    /// Delay between passes, in milliseconds.
    #[facet(args::named, default)]
    interval_ms: Option<u64>,
    #[facet(args::named, default)]
    workers: Option<usize>,
    /// Print one JSON document per pass instead of log lines.
    #[facet(args::named, default)]
    json: bool,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    Spin,
    Recursion {
        #[facet(args::named, default)]
        depth: Option<usize>,
    },
    Contention,
}

#[derive(Facet, Debug)]
struct PassReport {
    pass: u32,
    threads: usize,
    idle: usize,
    unresolved: usize,
    suspend_failed: usize,
    context_failed: usize,
    dropped: usize,
    delivered: usize,
    backtraces: Vec<Backtrace>,
}

impl PassReport {
    fn new(pass: u32, summary: PassSummary, backtraces: Vec<Backtrace>) -> Self {
        Self {
            pass,
            threads: summary.threads,
            idle: summary.idle,
            unresolved: summary.unresolved,
            suspend_failed: summary.suspend_failed,
            context_failed: summary.context_failed,
            dropped: summary.dropped,
            delivered: summary.delivered,
            backtraces,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SamplerConfig::from_env().map_err(|e| format!("invalid sampler config: {e}"))?;

    match stackshot_threads::validate_frame_pointers(3) {
        Ok(depth) => info!(depth, "frame pointer chain intact"),
        Err(err) => warn!(%err, "frame pointers look broken; samples may be truncated"),
    }
    stackshot_threads::install_sampler().map_err(|e| e.to_string())?;

    let stop = StopFlag::default();
    let workers = cli.workers.unwrap_or(DEFAULT_WORKERS);
    let handles = spawn_workload(&cli.command, workers, &stop)?;

    let passes = cli.passes.unwrap_or(DEFAULT_PASSES);
    let interval = Duration::from_millis(cli.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS));
    let json = cli.json;
    let sampler = std::thread::Builder::new()
        .name(format!("{}sampler", stackshot_threads::stackshot_capture::SAMPLER_THREAD_PREFIX))
        .spawn(move || sample(&config, passes, interval, json))
        .map_err(|e| format!("failed to spawn sampler thread: {e}"))?;

    let result = sampler
        .join()
        .map_err(|_| "sampler thread panicked".to_string())
        .and_then(|r| r);

    stop.stop();
    for handle in handles {
        let _ = handle.join();
    }
    result
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("stackshot-demo")
                .description("Sample the stacks of a synthetic workload")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn spawn_workload(
    command: &CommandKind,
    workers: usize,
    stop: &StopFlag,
) -> AnyResult<Vec<JoinHandle<()>>> {
    match command {
        CommandKind::Spin => workloads::spin::run(workers, stop),
        CommandKind::Recursion { depth } => {
            workloads::recursion::run(workers, depth.unwrap_or(DEFAULT_RECURSION_DEPTH), stop)
        }
        CommandKind::Contention => workloads::contention::run(workers, stop),
    }
}

fn sample(config: &SamplerConfig, passes: u32, interval: Duration, json: bool) -> AnyResult<()> {
    let mut cache = stackshot_threads::metadata_cache(config);

    for pass in 0..passes {
        let mut backtraces = Vec::new();
        let summary = stackshot_threads::sample_all_threads(config, &mut cache, |bt| {
            backtraces.push(bt);
        });

        if json {
            let report = PassReport::new(pass, summary, backtraces);
            let line = facet_json::to_string(&report)
                .map_err(|e| format!("failed to serialize pass {pass}: {e}"))?;
            println!("{line}");
        } else {
            info!(
                pass,
                threads = summary.threads,
                delivered = summary.delivered,
                dropped = summary.dropped,
                idle = summary.idle,
                "sampling pass finished"
            );
            for bt in &backtraces {
                let top = bt.addresses.first().copied().unwrap_or_default();
                info!(
                    thread = %bt.thread_metadata.name,
                    tid = bt.thread_metadata.thread_id,
                    depth = bt.depth(),
                    top = %format!("{top:#x}"),
                    "captured"
                );
            }
        }

        std::thread::sleep(interval);
    }
    Ok(())
}
