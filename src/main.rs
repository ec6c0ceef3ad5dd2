use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, error};

use gdns::config::Config;
use gdns::server;
use gdns::subnet::SubnetTable;

#[derive(Parser)]
#[command(name = "gdns", version)]
#[command(about = "DNS forwarder that races upstreams to defeat poisoning", long_about = None)]
struct Args {
    /// Bind address, overrides server.ip
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Local port to listen on, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file
    #[arg(short, long, default_value = "gdns.yaml")]
    config: PathBuf,

    /// Log every forwarding decision
    #[arg(short, long)]
    verbose: bool,
}

async fn run(args: Args) -> gdns::Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(ip) = args.bind {
        config.server.ip = ip;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let subnets = SubnetTable::load(&config.server.subnets_path)?;

    server::run(config, subnets).await
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let local = tokio::task::LocalSet::new();
    match local.block_on(&rt, run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
