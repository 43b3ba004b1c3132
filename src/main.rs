use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use leakdetect::{
  DetectorConfig, JsonLinesWriter, ReportStreamWriter, replay,
};

/// Replays a binary allocation trace through the statistical leak detector.
#[derive(Parser)]
#[command(name = "leakdetect")]
#[command(version)]
#[command(about = "Statistical memory leak detection over recorded traces")]
struct Cli {
  /// Trace file to replay.
  trace: PathBuf,

  /// Keep an event iff its pointer hash is below this value, in 0..=256.
  #[arg(long, default_value_t = 256)]
  sampling_factor: u64,

  /// Maximum frames kept per sampled allocation.
  #[arg(long, default_value_t = 4)]
  stack_depth: usize,

  /// Bytes of cumulative allocation between leak analyses.
  #[arg(long, default_value_t = 32 * 1024 * 1024)]
  dump_interval_bytes: u64,

  /// Consecutive suspicions before an allocation size is reported.
  #[arg(long, default_value_t = 4)]
  size_suspicion_threshold: u32,

  /// Consecutive suspicions before a call stack is reported.
  #[arg(long, default_value_t = 4)]
  call_stack_suspicion_threshold: u32,

  /// Dump intermediate ranked lists during each analysis.
  #[arg(short, long)]
  verbose: bool,

  /// Append the final reports as a JSON line to this file.
  #[arg(long)]
  json: Option<PathBuf>,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level)),
    )
    .init();

  let config = DetectorConfig::default()
    .with_sampling_factor(cli.sampling_factor)
    .with_stack_depth(cli.stack_depth)
    .with_dump_interval_bytes(cli.dump_interval_bytes)
    .with_suspicion_thresholds(
      cli.size_suspicion_threshold,
      cli.call_stack_suspicion_threshold,
    )
    .with_verbose(cli.verbose);

  let file = match File::open(&cli.trace) {
    Ok(file) => file,
    Err(err) => {
      eprintln!("failed to open {}: {err}", cli.trace.display());
      return ExitCode::FAILURE;
    }
  };

  let summary = match replay(BufReader::new(file), &config) {
    Ok(summary) => summary,
    Err(err) => {
      eprintln!("replay failed: {err}");
      return ExitCode::FAILURE;
    }
  };

  println!(
    "replayed {} bytes: {} allocs, {} frees",
    summary.bytes_read, summary.num_alloc_records, summary.num_free_records
  );

  if summary.reports.is_empty() {
    println!("no suspected leaks");
  }
  for report in &summary.reports {
    println!("suspected leak of size {}:", report.alloc_size_bytes);
    for offset in &report.call_stack_offsets {
      println!("\t{offset:#x}");
    }
  }

  if let Some(path) = &cli.json {
    let result = File::options()
      .create(true)
      .append(true)
      .open(path)
      .map_err(Into::into)
      .and_then(|file| {
        JsonLinesWriter::new(file)
          .write_reports(&summary.reports, Some(SystemTime::now()))
      });

    if let Err(err) = result {
      eprintln!("failed to write {}: {err}", path.display());
      return ExitCode::FAILURE;
    }
  }

  ExitCode::SUCCESS
}
