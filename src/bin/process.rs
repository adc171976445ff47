//! Ingress service binary: serves the pipeline submission and response
//! polling API over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use conflux::broker::RedisBroker;
use conflux::config::{EnvSettings, SiteConfig};
use conflux::process::{serve, ProcessState};
use conflux::provider::{AdapterRegistry, Dispatch};

#[derive(Debug, Parser)]
#[command(name = "conflux-process", about = "Pipeline ingress service")]
struct Args {
    /// Path to the site configuration YAML.
    #[arg(long, env = "SITE_CONFIG")]
    config: PathBuf,

    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
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
    let dispatch = match Dispatch::new(&site, AdapterRegistry::builtin()) {
        Ok(dispatch) => dispatch,
        Err(e) => {
            error!("bad provider table: {e}");
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

    let state = ProcessState::new(broker, Arc::new(site), Arc::new(dispatch), env.auth_api_key);
    if let Err(e) = serve(state, args.bind).await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
