use crate::commands::load_options;
use crate::output;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Args;
use color_eyre::Result;

use taprun_core::{ExecutionContext, JobState, MetricsSnapshot, SourceDescriptor};

/// Copy newline-delimited JSON records from one file to another as a job
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Input file (one JSON value per line)
    pub input: PathBuf,

    /// Output file
    pub output: PathBuf,

    /// Options file (YAML)
    #[arg(long, short = 'o', value_name = "FILE")]
    pub options: Option<PathBuf>,

    /// Set an option (can be repeated, format: key=value)
    #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Keep only object records that have this field
    #[arg(long, value_name = "FIELD")]
    pub require_field: Option<String>,

    /// Write the metrics snapshot to this file
    #[arg(long, value_name = "FILE")]
    pub metrics: Option<PathBuf>,

    /// Stop waiting after this many seconds (the job keeps running)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    if !args.input.exists() {
        color_eyre::eyre::bail!("Input file not found: {}", args.input.display());
    }

    let mut options = load_options(args.options.as_ref(), &args.overrides)?;
    if let Some(metrics) = &args.metrics {
        options = options.with_metrics_location(metrics);
    }
    let metrics_location = options.metrics_location.clone();

    output::header(&format!("Job '{}'", options.job_name));
    output::status("Runner", &options.runner.to_string());

    let mut ctx = ExecutionContext::new(options);
    let read = ctx.init_counter("records_read")?;
    let written = ctx.init_counter("records_written")?;

    let records = ctx.read(SourceDescriptor::local_file(args.input.to_string_lossy()))?;
    let counted = ctx.map("count_read", records, move |record| {
        read.inc();
        Ok(record)
    })?;
    let kept = match args.require_field.clone() {
        Some(field) => ctx.filter("require_field", counted, move |record| {
            record.get(&field).map(|v| !v.is_null()).unwrap_or(false)
        })?,
        None => counted,
    };
    let finished = ctx.map("count_written", kept, move |record| {
        written.inc();
        Ok(record)
    })?;
    let tap = ctx.save(finished, SourceDescriptor::local_file(args.output.to_string_lossy()))?;

    let start = Instant::now();
    let result = ctx.close()?;
    output::status("Submitted", result.job_id());

    let state = result
        .await_completion(args.timeout.map(Duration::from_secs))
        .await;
    let elapsed = start.elapsed();

    match state {
        JobState::Running => {
            output::warning(&format!(
                "job still running after {}s; not waiting any longer",
                elapsed.as_secs()
            ));
            return Ok(());
        }
        state if state.is_success() => {
            let rows = tap.await?.read()?.len();
            output::success(&format!(
                "{} ({} records written to {}, {}ms)",
                state,
                rows,
                args.output.display(),
                elapsed.as_millis()
            ));
        }
        state => {
            output::failure(&format!("job finished in state {}", state));
        }
    }

    if let Some(path) = metrics_location {
        let snapshot = MetricsSnapshot::read_from(&path)?;
        for (name, value) in &snapshot.counters {
            output::info(&format!("{} = {}", name, value));
        }
        output::dim(&format!("metrics written to {}", path.display()));
    }

    if !state.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
