mod backend;
mod bench;
mod config;
mod controller;
mod payload;
mod pipeline;
mod routes;


#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::{EndpointExt, Server};
use tracing::level_filters::LevelFilter;

use crate::bench::BenchArgs;
use crate::config::RuntimeConfig;
use crate::controller::SwapController;
use crate::pipeline::BackendSession;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,

    /// The log level filter.
    #[clap(long, default_value = "info", env, global = true)]
    log_level: LevelFilter,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Writes a template config file.
    Init {
        /// Where to write the template.
        #[clap(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Runs the HTTP gateway.
    Run(ServerArgs),

    /// Runs the swap sequence directly against the backend and reports timings.
    Bench(BenchArgs),
}

#[derive(Debug, clap::Args)]
struct ServerArgs {
    /// The binding host address of the server.
    #[clap(long, default_value = "127.0.0.1", env)]
    host: String,

    /// The binding port of the server.
    #[clap(long, default_value_t = 8000, env)]
    port: u16,

    /// The external URL the server is reachable at, used in the API docs.
    #[clap(long, env)]
    external_host: Option<String>,

    /// The path the API docs UI is served at.
    #[clap(long, default_value = "/ui", env)]
    docs_url: String,

    /// The path to a YAML or JSON config file.
    #[clap(short, long, env)]
    config_file: Option<PathBuf>,

    /// The base URL of the FaceFusion web UI, overriding the config file.
    #[clap(long, env)]
    facefusion_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    match args.command {
        Command::Init { output } => run_init(&output).await,
        Command::Run(server_args) => run_server(server_args).await,
        Command::Bench(bench_args) => run_bench(bench_args).await,
    }
}

async fn load_config(
    config_file: Option<&Path>,
    facefusion_url: Option<String>,
) -> anyhow::Result<RuntimeConfig> {
    let mut cfg = match config_file {
        Some(path) => RuntimeConfig::from_file(path).await?,
        None => RuntimeConfig::default(),
    };

    if let Some(url) = facefusion_url {
        cfg.backend.url = url;
    }

    Ok(cfg)
}

async fn run_init(output: &Path) -> anyhow::Result<()> {
    let template = RuntimeConfig::template()?;
    tokio::fs::write(output, template)
        .await
        .with_context(|| format!("failed to write template config to {:?}", output))?;

    info!("Wrote template config to {:?}", output);
    Ok(())
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let cfg = load_config(args.config_file.as_deref(), args.facefusion_url).await?;

    info!("Connecting to FaceFusion server @ {}", &cfg.backend.url);
    let session = match cfg.backend.connect().await {
        Ok(backend) => Some(BackendSession::new(backend, cfg.backend.clear_before_run)),
        Err(e) if cfg.backend.require_on_startup => {
            return Err(e.context("failed to connect to the FaceFusion server"));
        },
        Err(e) => {
            error!(
                "Error connecting to FaceFusion server @ {}: {:#}. Serving in degraded mode.",
                &cfg.backend.url, e,
            );
            None
        },
    };

    let addr: SocketAddr = format!("{}:{}", &args.host, args.port).parse()?;
    let server_url = args
        .external_host
        .unwrap_or_else(|| format!("http://{}", addr));

    let controller = Arc::new(SwapController::from_config(&cfg, session));
    let app = routes::build_app(controller, &server_url, &args.docs_url).with(Tracing);

    info!("Serving on {} with docs @ {}{}", addr, &server_url, &args.docs_url);
    Server::new(TcpListener::bind(addr))
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down...");
            },
            Some(Duration::from_secs(10)),
        )
        .await?;

    Ok(())
}

async fn run_bench(args: BenchArgs) -> anyhow::Result<()> {
    let mut cfg = load_config(args.config_file.as_deref(), args.facefusion_url.clone()).await?;
    cfg.backend.clear_before_run |= args.clear;

    info!("Connecting to FaceFusion server @ {}", &cfg.backend.url);
    let backend = cfg
        .backend
        .connect()
        .await
        .context("failed to connect to the FaceFusion server")?;
    let session = BackendSession::new(backend, cfg.backend.clear_before_run);

    bench::run(&session, &args).await?;
    Ok(())
}
