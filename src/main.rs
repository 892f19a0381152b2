use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtsp_vod::catalog::MediaCatalog;
use rtsp_vod::fs::FileCache;
use rtsp_vod::rtsp::StreamTable;
use rtsp_vod::VodEngine;

/// Interval of the supervisor tick that reaps finished workers.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// rtsp-vod command line arguments
///
/// The accepted option spellings are the single-dash `-ip` and `-port` of
/// the serving convention; [`parse_cli`] rewrites them to clap's long form
/// before parsing.
#[derive(Parser, Debug)]
#[command(name = "rtsp-vod")]
#[command(version, about = "RTSP video-on-demand server", long_about = None)]
#[command(override_usage = "rtsp-vod [-ip <ADDRESS>] [-port <PORT>] <MEDIA_DIRECTORY>")]
struct CliArgs {
    /// Listen address advertised in stream URLs
    #[arg(long = "ip", value_name = "ADDRESS", default_value = "0.0.0.0")]
    ip: String,

    /// RTSP port advertised in stream URLs
    #[arg(long = "port", value_name = "PORT", default_value_t = 8554)]
    port: u16,

    /// Directory containing media files (.h264, .264, .aac, .ts, .m2ts, .mkv)
    #[arg(value_name = "MEDIA_DIRECTORY")]
    media_directory: PathBuf,

    /// Log filter, e.g. "info" or "rtsp_vod=debug"
    #[arg(short = 'l', long, value_name = "FILTER", default_value = "info")]
    log_level: String,
}

/// Parse the command line, accepting the `-ip`/`-port` option spellings.
///
/// Exits 1 on an argument error and 0 when help or version was requested.
fn parse_cli() -> CliArgs {
    let mut passthrough = false;
    let args = std::env::args().map(|arg| {
        if passthrough {
            return arg;
        }
        match arg.as_str() {
            "--" => {
                passthrough = true;
                arg
            }
            "-ip" => "--ip".to_string(),
            "-port" => "--port".to_string(),
            _ => arg,
        }
    });

    match CliArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

fn init_logging(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Local IPv4 addresses, loopback included, for the startup URL banner.
fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let Ok(interfaces) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };

    let mut addresses = Vec::new();
    for interface in interfaces {
        let Some(address) = interface.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            let ip = sin.ip();
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
    }
    addresses
}

fn print_stream_urls(table: &StreamTable, port: u16) {
    let paths = table.paths();
    if paths.is_empty() {
        warn!("no media files found to serve");
        return;
    }

    let addresses = local_ipv4_addresses();
    for path in &paths {
        if addresses.is_empty() {
            info!("stream: rtsp://localhost:{port}{path}");
            continue;
        }
        for address in &addresses {
            info!("stream: rtsp://{address}:{port}{path}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_cli();
    init_logging(&args.log_level);

    info!(
        directory = %args.media_directory.display(),
        ip = %args.ip,
        port = args.port,
        "starting rtsp-vod server"
    );

    let cache = Arc::new(FileCache::new());
    let table = Arc::new(StreamTable::new());

    let catalog = MediaCatalog::scan(&args.media_directory, &cache, table.as_ref())?;
    if catalog.is_empty() {
        anyhow::bail!(
            "no media files found in {}",
            args.media_directory.display()
        );
    }

    let engine = Arc::new(VodEngine::new(cache, Arc::new(catalog)));
    print_stream_urls(&table, args.port);
    info!(
        streams = table.len(),
        "engine ready; RTSP frontend drives sessions through the event handler"
    );

    // Supervisor: reap finished workers and log liveness until SIGINT.
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cleaned = engine.registry().cleanup_finished();
                if cleaned > 0 {
                    info!(cleaned, "reaped finished sessions");
                }
                info!(
                    active_sessions = engine.registry().active_count(),
                    mapped_files = engine.cache().active_count(),
                    "server stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, stopping server");
                break;
            }
        }
    }

    engine.shutdown();
    info!("server stopped");

    // Exit status carries the signal value after a SIGINT shutdown.
    std::process::exit(2);
}
