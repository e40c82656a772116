//! emberkv server binary
//!
//! Resolves configuration (defaults, then environment, then flags),
//! sets up logging, starts the server, and waits for Ctrl+C.

use emberkv::{Config, Server};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Applies command-line flags on top of an existing configuration.
fn apply_args(mut config: Config) -> Config {
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                config.listen_addr = take_value(&args, i, "--listen");
                i += 2;
            }
            "--data-root" | "-d" => {
                config.data_root = PathBuf::from(take_value(&args, i, "--data-root"));
                i += 2;
            }
            "--snapshot-interval" => {
                config.snapshot_interval = take_seconds(&args, i, "--snapshot-interval");
                i += 2;
            }
            "--flush-interval" => {
                config.flush_interval = take_seconds(&args, i, "--flush-interval");
                i += 2;
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("emberkv version {}", emberkv::VERSION);
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    config
}

fn take_value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn take_seconds(args: &[String], i: usize, flag: &str) -> Duration {
    let raw = take_value(args, i, flag);
    match raw.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            eprintln!("Error: {flag} expects a number of seconds");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
emberkv - In-Memory Key-Value Server with Snapshot + AOF Durability

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -l, --listen <ADDR>            Listen address (default: 0.0.0.0:6379)
    -d, --data-root <DIR>          Durable state directory (default: _data)
        --snapshot-interval <SEC>  Seconds between snapshots (default: 60)
        --flush-interval <SEC>     Seconds between log flushes (default: 5)
    -v, --version                  Print version information
        --help                     Print this help message

ENVIRONMENT:
    LISTEN_ADDR, DATA_ROOT, SNAPSHOT_INTERVAL, FLUSH_INTERVAL
    (flags take precedence)

CONNECTING:
    Use redis-cli or any RESP client:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET greeting hello
    OK
    127.0.0.1:6379> GET greeting
    "hello"
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
                 _               _
  ___ _ __ ___  | |__   ___ _ __| | ____   __
 / _ \ '_ ` _ \ | '_ \ / _ \ '__| |/ /\ \ / /
|  __/ | | | | || |_) |  __/ |  |   <  \ V /
 \___|_| |_| |_||_.__/ \___|_|  |_|\_\  \_/

emberkv v{} - durable in-memory key-value server
────────────────────────────────────────────────
Listening on {}
Data root: {}

Use Ctrl+C to shutdown gracefully.
"#,
        emberkv::VERSION,
        config.listen_addr,
        config.data_root.display()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = apply_args(Config::from_env());

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    print_banner(&config);

    let server = match Server::start(config).await {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Failed to start: {err}");
            std::process::exit(1);
        }
    };

    server
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to install Ctrl+C handler");
            }
            info!("shutdown signal received, stopping server...");
        })
        .await?;

    info!("server shutdown complete");
    Ok(())
}
