//! Scheduler service binary: promotes delayed nodes onto the execution
//! queue when their time arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use conflux::broker::RedisBroker;
use conflux::config::{EnvSettings, SiteConfig};
use conflux::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "conflux-scheduler", about = "Delayed-node scheduling service")]
struct Args {
    /// Path to the site configuration YAML.
    #[arg(long, env = "SITE_CONFIG")]
    config: PathBuf,
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

    let handle = Scheduler::new(broker, site).start();
    if tokio::signal::ctrl_c().await.is_err() {
        error!("cannot listen for shutdown signal");
        return ExitCode::FAILURE;
    }
    info!("shutting down");
    handle.shutdown().await;
    ExitCode::SUCCESS
}
