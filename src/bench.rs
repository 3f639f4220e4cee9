use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::controller::round_secs;
use crate::pipeline::BackendSession;

#[derive(Debug, clap::Args)]
pub struct BenchArgs {
    /// The image the face is taken from.
    #[clap(short, long)]
    pub source: PathBuf,

    /// The image the face is placed onto.
    #[clap(short, long)]
    pub target: PathBuf,

    /// How many times to run the full swap sequence.
    #[clap(short = 'n', long, default_value_t = 1)]
    pub iterations: usize,

    /// Where the result of the last iteration is written.
    #[clap(short, long, default_value = "result.png")]
    pub output: PathBuf,

    /// Reset the remote session before every iteration.
    #[clap(long)]
    pub clear: bool,

    /// The path to a YAML or JSON config file.
    #[clap(short, long, env)]
    pub config_file: Option<PathBuf>,

    /// The base URL of the FaceFusion web UI, overriding the config file.
    #[clap(long, env)]
    pub facefusion_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct BenchReport {
    pub timings: Vec<Duration>,
}

impl BenchReport {
    pub fn min(&self) -> Option<Duration> {
        self.timings.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.timings.iter().max().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.timings.is_empty() {
            return None;
        }

        let total: Duration = self.timings.iter().sum();
        Some(total / self.timings.len() as u32)
    }
}

/// Runs the swap sequence `iterations` times against one session, failing
/// on the first unsuccessful run.
pub async fn run(session: &BackendSession, args: &BenchArgs) -> anyhow::Result<BenchReport> {
    let mut report = BenchReport::default();
    let mut last = None;

    for i in 1..=args.iterations {
        let result = session
            .execute(&args.source, &args.target)
            .await
            .with_context(|| format!("iteration {} of {} failed", i, args.iterations))?;

        info!(
            "Iteration {}/{} took {:.2}s, result @ {:?}",
            i,
            args.iterations,
            round_secs(result.execution_time),
            &result.output,
        );

        report.timings.push(result.execution_time);
        last = Some(result.data);
    }

    if let Some(data) = last {
        tokio::fs::write(&args.output, data)
            .await
            .with_context(|| format!("failed to write result to {:?}", &args.output))?;
        info!("Saved final image to {:?}", &args.output);
    }

    if let (Some(min), Some(mean), Some(max)) = (report.min(), report.mean(), report.max()) {
        info!(
            "{} iterations: min {:.2}s, mean {:.2}s, max {:.2}s",
            report.timings.len(),
            round_secs(min),
            round_secs(mean),
            round_secs(max),
        );
    }

    Ok(report)
}
