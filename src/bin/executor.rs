//! Executor service binary: runs the adapter worker pool against the
//! execution queue.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use conflux::broker::RedisBroker;
use conflux::config::{EnvSettings, SiteConfig};
use conflux::executor::Executor;
use conflux::provider::AdapterRegistry;

#[derive(Debug, Parser)]
#[command(name = "conflux-executor", about = "Pipeline execution service")]
struct Args {
    /// Path to the site configuration YAML.
    #[arg(long, env = "SITE_CONFIG")]
    config: PathBuf,

    /// Size of the worker pool.
    #[arg(long, env = "WORKERS", default_value_t = 8)]
    workers: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let env = match EnvSettings::from_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("bad environment: {e}");
            return ExitCode::from(2);
        }
    };
    conflux::logging::init(env.log_format);

    let site = match SiteConfig::from_path(&args.config) {
        Ok(site) => site,
        Err(e) => {
            error!("cannot load site config: {e}");
            return ExitCode::from(2);
        }
    };
    let broker = match RedisBroker::connect(&env.broker_url).await {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!("cannot reach broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    let executor = match Executor::new(broker, site, AdapterRegistry::builtin()) {
        Ok(executor) => Arc::new(executor),
        Err(e) => {
            error!("bad executor configuration: {e}");
            return ExitCode::from(2);
        }
    };
    let handle = executor.start(args.workers);
    if tokio::signal::ctrl_c().await.is_err() {
        error!("cannot listen for shutdown signal");
        return ExitCode::FAILURE;
    }
    info!("shutting down");
    handle.shutdown().await;
    ExitCode::SUCCESS
}
